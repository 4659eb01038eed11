//! The toolkit commands.
//!
//! Each command is a short sequence of checks and external calls. Verdicts are printed on the
//! console as they happen; failures are returned as [`anyhow::Error`]s carrying a
//! [`ToolkitError`] when they map to a specific exit code.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use tracing::{info, instrument, warn};

use crate::aicrowd;
use crate::competition::{CompetitionConfig, StartBy, TeamSource};
use crate::configuration::Configuration;
use crate::console;
use crate::docker::{container_path, ContainerServer, DockerCli, Registry};
use crate::error::ToolkitError;
use crate::framework::Framework;
use crate::metadata::{self, AicrowdJson};
use crate::process::LocalServer;
use crate::requirements::{self, RequirementsReport};
use crate::rollout::{self, ServerHandle};
use crate::submission::Submission;
use crate::supervisor::Cancellation;

/// Submission directory used when none is given.
pub const DEFAULT_SUBMISSION: &str = "my-submission";

/// Options of [`Toolkit::test`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOptions {
    /// Submission directory.
    pub submission: PathBuf,
    /// `docker` or `process` to test through a team server; in process when unset.
    pub startby: Option<String>,
    /// `dockerhub` or `tencentcloud`. Only used with `startby = docker`.
    pub registry: String,
    /// Episodes to roll out.
    pub episodes: u32,
    /// Render the episodes.
    pub render: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            submission: PathBuf::from(DEFAULT_SUBMISSION),
            startby: None,
            registry: Registry::default().to_string(),
            episodes: 1,
            render: false,
        }
    }
}

/// Options of [`Toolkit::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Tag of the submission on AIcrowd.
    pub submission_id: String,
    /// Submit without running the test first.
    pub skip_test: bool,
    /// The test to run before submitting.
    pub test: TestOptions,
}

/// Dispatches the toolkit commands.
pub struct Toolkit<F: Framework> {
    framework: F,
    config: Configuration,
    console: Mutex<Box<dyn Write + Send>>,
}

impl<F: Framework + fmt::Debug> fmt::Debug for Toolkit<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolkit")
            .field("framework", &self.framework)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<F: Framework> Toolkit<F> {
    /// A toolkit driving `framework` with `config`, reporting test verdicts on stdout.
    pub fn new(framework: F, config: Configuration) -> Self {
        Self {
            framework,
            config,
            console: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    /// Report test verdicts to `out` instead of stdout.
    pub fn with_console(mut self, out: impl Write + Send + 'static) -> Self {
        self.console = Mutex::new(Box::new(out));
        self
    }

    fn say(&self, line: &str) {
        let mut out = self.console.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            warn!("could not write to the console: {e}");
        }
    }

    /// Toolkit settings.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// The framework the toolkit drives.
    pub fn framework(&self) -> &F {
        &self.framework
    }

    /// Static entry point check followed by the framework check.
    ///
    /// # Errors
    /// [`ToolkitError::InvalidSubmission`] when either check fails.
    pub fn check_submission(&self, path: &Path) -> anyhow::Result<Submission> {
        let submission = Submission::open(path)?;
        self.framework.check_submission(&submission)?;
        Ok(submission)
    }

    /// Check the submission, then roll it out against scripted opponents.
    ///
    /// Writes the pass banner to the console on success and the fail banner on any failure
    /// after the submission check.
    #[instrument(skip(self))]
    pub fn test(&self, options: &TestOptions) -> anyhow::Result<()> {
        let submission = self.check_submission(&options.submission)?;
        self.say(&console::green(&format!(
            "Testing {} ...",
            submission.path().display()
        )));

        match self.rollout(&submission, options) {
            Ok(()) => {
                self.say(&console::pass_banner());
                info!("test passed");
                Ok(())
            }
            Err(e) => {
                self.say(&console::fail_banner());
                info!("test failed: {e:#}");
                if e.downcast_ref::<ToolkitError>().is_some() {
                    Err(e)
                } else {
                    Err(e.context(ToolkitError::TestFailed))
                }
            }
        }
    }

    fn rollout(&self, submission: &Submission, options: &TestOptions) -> anyhow::Result<()> {
        let config = CompetitionConfig::new()
            .with_episodes(options.episodes)
            .with_render(options.render);
        let cancel = Cancellation::new();
        let timeout = self.config.server_ready_timeout;

        let startby = options
            .startby
            .as_deref()
            .map(str::parse::<StartBy>)
            .transpose()?;

        let mut server: Box<dyn ServerHandle> = match startby {
            None => {
                let source = TeamSource::submission(submission.path());
                return rollout::run(&self.framework, &config, &source, None, timeout, &cancel);
            }
            Some(StartBy::Docker) => {
                let registry: Registry = options.registry.parse()?;
                console::ok("Try run submission in docker container ...");
                let cwd = std::env::current_dir().context("could not read the working directory")?;
                let command = self
                    .framework
                    .team_server_command(&container_path(&cwd, submission.path()));
                let server = ContainerServer::launch(
                    DockerCli::detect(),
                    registry,
                    &command,
                    &self.config,
                    &cancel,
                )?;
                Box::new(server)
            }
            Some(StartBy::Process) => {
                console::ok("Try run submission in subprocess ...");
                Box::new(LocalServer::launch(submission.path(), &self.config)?)
            }
        };
        console::ok(&format!("Submission is running in {}", server.describe()));

        rollout::run(
            &self.framework,
            &config,
            &TeamSource::local_server(),
            Some(server.as_mut()),
            timeout,
            &cancel,
        )
    }

    /// Serve the submission team on the competition port until killed.
    #[instrument(skip(self))]
    pub fn run_team_server(&self, submission: &Path) -> anyhow::Result<()> {
        let submission = self.check_submission(submission)?;
        console::ok(&format!(
            "Start TeamServer for {}",
            submission.team_class()
        ));
        self.framework.serve(&submission)
    }

    /// Compare the packages the submission imports with the competition allow-list.
    ///
    /// Findings are printed; they never change the outcome.
    ///
    /// # Errors
    /// [`ToolkitError::MissingDefaultPackages`] when the allow-list does not exist,
    /// [`ToolkitError::InvalidSubmission`], or [`ToolkitError::RequirementsInference`].
    #[instrument(skip(self))]
    pub fn check_requirements(
        &self,
        submission: &Path,
        strict: bool,
        default_packages: Option<&Path>,
    ) -> anyhow::Result<RequirementsReport> {
        let allow_list = default_packages.unwrap_or(self.config.default_packages());
        if !allow_list.exists() {
            return Err(ToolkitError::MissingDefaultPackages(allow_list.display().to_string()).into());
        }

        let submission = self.check_submission(submission)?;
        let inferred = requirements::infer_requirements(submission.path(), &self.config.pipreqs)?;
        let competition = requirements::read_requirements(allow_list)?;

        let report = requirements::compare(&inferred, &competition, strict);
        print_report(&report);
        requirements::trace_report(&report);
        Ok(report)
    }

    /// Validate the `aicrowd.json` descriptor.
    pub fn check_aicrowd_json(&self) -> anyhow::Result<AicrowdJson> {
        metadata::check_aicrowd_json(&self.config.aicrowd_json)
    }

    /// Make sure the `aicrowd` CLI is logged in.
    pub fn aicrowd_setup(&self) -> anyhow::Result<()> {
        aicrowd::setup()
    }

    /// Log in, validate the descriptor, test unless skipped, then run the submit script.
    #[instrument(skip(self))]
    pub fn submit(&self, options: &SubmitOptions) -> anyhow::Result<()> {
        self.aicrowd_setup()?;
        self.check_aicrowd_json()?;
        if !options.skip_test {
            self.test(&options.test)?;
        }
        aicrowd::run_submit_script(&self.config.submit_script, &options.submission_id)
    }
}

fn print_report(report: &RequirementsReport) {
    for finding in &report.findings {
        if finding.is_error() {
            console::err(&finding.to_string());
        } else {
            console::warn(&finding.to_string());
        }
    }
    if !report.fault() {
        console::ok("Check requirements passed! Good luck!");
    }
}
