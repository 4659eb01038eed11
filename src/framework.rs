//! Bridge to the competition framework.
//!
//! The framework (`ijcai2022nmmo`) is a Python package. [`PythonFramework`] drives it through
//! short scripts run by the configured interpreter; the toolkit itself only sees the
//! [`Framework`] trait, so tests can substitute their own implementation.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::competition::{CompetitionConfig, TeamSource, PORT, TEAM_NAME};
use crate::error::ToolkitError;
use crate::shell::{self, CommandFailed, ExitPolicy};
use crate::submission::Submission;
use crate::supervisor::{supervise, Cancellation};

/// Entry points of the competition framework used by the toolkit.
pub trait Framework {
    /// The framework's own submission check, run after the static entry point check.
    ///
    /// # Errors
    /// [`ToolkitError::InvalidSubmission`] when the framework rejects the submission.
    fn check_submission(&self, submission: &Submission) -> anyhow::Result<()>;

    /// Command line starting the team server of `submission` inside the submission container.
    fn team_server_command(&self, submission: &Path) -> Vec<String>;

    /// Run the team server of `submission` on [`PORT`] until it is killed.
    fn serve(&self, submission: &Submission) -> anyhow::Result<()>;

    /// Play `config.episodes()` episodes of the submission team against scripted opponents.
    ///
    /// Returns early with the cancellation error once `cancel` trips.
    fn rollout(
        &self,
        config: &CompetitionConfig,
        source: &TeamSource,
        cancel: &Cancellation,
    ) -> anyhow::Result<()>;
}

const CHECK_SCRIPT: &str = r#"
import sys
from ijcai2022nmmo import submission as subm
subm.check(sys.argv[1])
"#;

/// Line the team server prints on stdout once it is set up on its port.
pub const SERVER_READY_MARKER: &str = "Start TeamServer for";

const SERVE_SCRIPT: &str = r#"
import sys
from ijcai2022nmmo import TeamServer
from ijcai2022nmmo import submission as subm
path, port = sys.argv[1], int(sys.argv[2])
subm.check(path)
team_klass, init_params = subm.parse_submission(path)
server = TeamServer("0.0.0.0", port, team_klass, init_params)
print(f"Start TeamServer for {team_klass.__name__}", flush=True)
server.run()
"#;

const ROLLOUT_SCRIPT: &str = r#"
import json, sys
from ijcai2022nmmo import CompetitionConfig, ProxyTeam, RollOut, scripted
from ijcai2022nmmo import submission as subm
request = json.loads(sys.argv[1])

class Config(CompetitionConfig):
    PATH_MAPS = request["map_path"]

source = request["team"]
if source["kind"] == "remote":
    team = ProxyTeam(request["team_name"], Config(), source["host"], source["port"])
else:
    team = subm.get_team_from_submission(source["path"], request["team_name"], Config())
try:
    opponents = [scripted.RandomTeam(f"random-{i}", Config()) for i in range(request["opponents"])]
    ro = RollOut(Config(), opponents + [team], True)
    ro.run(n_episode=request["episodes"], render=request["render"])
finally:
    if source["kind"] == "remote":
        team.stop()
"#;

/// Interpreter used inside the submission image.
const CONTAINER_PYTHON: &str = "python";

const ROLLOUT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum TeamSpec<'a> {
    Submission { path: &'a str },
    Remote { host: &'a str, port: u16 },
}

/// Arguments of the rollout script, passed as one JSON document.
#[derive(Debug, Serialize)]
struct RolloutRequest<'a> {
    map_path: &'a str,
    opponents: usize,
    episodes: u32,
    render: bool,
    team_name: &'a str,
    team: TeamSpec<'a>,
}

impl<'a> RolloutRequest<'a> {
    fn new(config: &'a CompetitionConfig, source: &'a TeamSource) -> anyhow::Result<Self> {
        let team = match source {
            TeamSource::Submission(path) => TeamSpec::Submission {
                path: path.to_str().context("submission path is not a valid string")?,
            },
            TeamSource::Remote { host, port } => TeamSpec::Remote { host, port: *port },
        };
        Ok(RolloutRequest {
            map_path: config.map_path(),
            opponents: config.opponents(),
            episodes: config.episodes(),
            render: config.render(),
            team_name: TEAM_NAME,
            team,
        })
    }
}

/// The `ijcai2022nmmo` package, driven through a Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonFramework {
    python: String,
}

impl PythonFramework {
    /// Drive the framework with the `python` interpreter.
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    fn script(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.args(["-u", "-c", script]);
        cmd
    }
}

impl Framework for PythonFramework {
    #[instrument(skip(self))]
    fn check_submission(&self, submission: &Submission) -> anyhow::Result<()> {
        let mut cmd = self.script(CHECK_SCRIPT);
        cmd.arg(submission.path());
        match shell::capture_quiet(&mut cmd, ExitPolicy::Strict) {
            Ok(_) => Ok(()),
            Err(e) => match e.downcast::<CommandFailed>() {
                Ok(failed) => {
                    // the last line of a python traceback is the exception itself
                    let reason = failed
                        .stderr
                        .lines()
                        .last()
                        .unwrap_or("rejected by the framework check")
                        .to_string();
                    Err(ToolkitError::InvalidSubmission(reason).into())
                }
                Err(e) => Err(e),
            },
        }
    }

    fn team_server_command(&self, submission: &Path) -> Vec<String> {
        vec![
            CONTAINER_PYTHON.to_string(),
            "-u".to_string(),
            "-c".to_string(),
            SERVE_SCRIPT.to_string(),
            submission.display().to_string(),
            PORT.to_string(),
        ]
    }

    /// On unix the interpreter replaces the toolkit process, so whoever stops the toolkit
    /// stops the server itself. Only returns if the interpreter cannot be started.
    #[cfg(unix)]
    #[instrument(skip(self))]
    fn serve(&self, submission: &Submission) -> anyhow::Result<()> {
        use std::os::unix::process::CommandExt;

        let mut cmd = self.script(SERVE_SCRIPT);
        cmd.arg(submission.path()).arg(PORT.to_string());
        let err = cmd.exec();
        Err(err).with_context(|| format!("could not launch '{}'", self.python))
    }

    #[cfg(not(unix))]
    #[instrument(skip(self))]
    fn serve(&self, submission: &Submission) -> anyhow::Result<()> {
        let mut cmd = self.script(SERVE_SCRIPT);
        cmd.arg(submission.path()).arg(PORT.to_string());
        let status = cmd
            .status()
            .with_context(|| format!("could not launch '{}'", self.python))?;
        if !status.success() {
            bail!("team server exited with {status}");
        }
        Ok(())
    }

    #[instrument(skip(self, cancel))]
    fn rollout(
        &self,
        config: &CompetitionConfig,
        source: &TeamSource,
        cancel: &Cancellation,
    ) -> anyhow::Result<()> {
        let request = serde_json::to_string(&RolloutRequest::new(config, source)?)
            .context("could not encode rollout request")?;
        debug!(%request);

        let mut child = self
            .script(ROLLOUT_SCRIPT)
            .arg(&request)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("could not launch '{}'", self.python))?;
        info!(pid = child.id(), "rollout started");

        let status = supervise(&mut child, cancel, ROLLOUT_POLL)?;
        if !status.success() {
            bail!("rollout exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn rollout_request_for_remote_team() {
        let config = CompetitionConfig::new().with_episodes(3);
        let source = TeamSource::local_server();
        let request = serde_json::to_value(RolloutRequest::new(&config, &source).unwrap()).unwrap();
        assert_eq!(
            request,
            json!({
                "map_path": "maps/medium/evaluation",
                "opponents": 15,
                "episodes": 3,
                "render": false,
                "team_name": "my-submission",
                "team": { "kind": "remote", "host": "127.0.0.1", "port": 12343 },
            })
        );
    }

    #[test]
    fn rollout_request_for_in_process_team() {
        let config = CompetitionConfig::new().with_render(true);
        let source = TeamSource::Submission(PathBuf::from("my-submission"));
        let request = serde_json::to_value(RolloutRequest::new(&config, &source).unwrap()).unwrap();
        assert_eq!(request["team"], json!({ "kind": "submission", "path": "my-submission" }));
        assert_eq!(request["render"], Value::Bool(true));
    }

    #[test]
    fn container_command_serves_on_the_competition_port() {
        let command = PythonFramework::new("/opt/venv/bin/python")
            .team_server_command(Path::new("/home/aicrowd/my-submission"));
        assert_eq!(command[0], "python");
        assert_eq!(&command[1..3], ["-u", "-c"]);
        assert!(command[3].contains("TeamServer"));
        assert!(command[3].contains(SERVER_READY_MARKER));
        assert_eq!(command[4], "/home/aicrowd/my-submission");
        assert_eq!(command[5], "12343");
    }

    #[cfg(unix)]
    mod with_stub_interpreter {
        use super::*;
        use crate::error::exit_code_of;
        use crate::submission::ENTRY_POINT;

        fn submission(dir: &Path) -> Submission {
            std::fs::write(
                dir.join(ENTRY_POINT),
                "class Team:\n    pass\n\nclass Submission:\n    team_klass = Team\n    init_params = {}\n",
            )
            .unwrap();
            Submission::open(dir).unwrap()
        }

        #[test]
        fn framework_rejection_is_a_submission_error() {
            let dir = tempfile::tempdir().unwrap();
            let err = PythonFramework::new("false")
                .check_submission(&submission(dir.path()))
                .unwrap_err();
            assert_eq!(exit_code_of(&err), 5);
        }

        #[test]
        fn framework_acceptance() {
            let dir = tempfile::tempdir().unwrap();
            PythonFramework::new("true")
                .check_submission(&submission(dir.path()))
                .unwrap();
        }

        #[test]
        fn failing_rollout_is_an_error() {
            let err = PythonFramework::new("false")
                .rollout(
                    &CompetitionConfig::new(),
                    &TeamSource::local_server(),
                    &Cancellation::new(),
                )
                .unwrap_err();
            assert!(err.to_string().contains("rollout exited"));
        }

        #[test]
        fn serving_with_a_missing_interpreter_returns() {
            let dir = tempfile::tempdir().unwrap();
            let err = PythonFramework::new("definitely-not-a-python")
                .serve(&submission(dir.path()))
                .unwrap_err();
            assert!(format!("{err:#}").contains("could not launch 'definitely-not-a-python'"));
        }

        #[test]
        fn missing_interpreter_is_not_a_submission_error() {
            let dir = tempfile::tempdir().unwrap();
            let err = PythonFramework::new("definitely-not-a-python")
                .check_submission(&submission(dir.path()))
                .unwrap_err();
            assert_eq!(exit_code_of(&err), 1);
        }
    }
}
