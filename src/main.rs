use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::error;

use nmmo_toolkit::console;
use nmmo_toolkit::error::exit_code_of;
use nmmo_toolkit::logger::init_logger;
use nmmo_toolkit::prelude::*;
use nmmo_toolkit::toolkit::DEFAULT_SUBMISSION;

#[derive(Parser)]
#[command(name = "nmmo-toolkit")]
#[command(author, version, about = "Test and submit IJCAI 2022 Neural MMO challenge entries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Write a trace of the run to a timestamped log file
    #[arg(long, global = true)]
    log: bool,

    /// Python interpreter with the ijcai2022nmmo package installed
    #[arg(long, global = true, env = "NMMO_PYTHON")]
    python: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct TestArgs {
    /// Submission directory
    #[arg(long, default_value = DEFAULT_SUBMISSION)]
    submission: PathBuf,

    /// Run the team server in a `docker` container or a local `process`; in process when unset
    #[arg(long)]
    startby: Option<String>,

    /// Registry of the runtime image: `dockerhub` or `tencentcloud`
    #[arg(long, default_value = "dockerhub")]
    registry: String,

    /// Number of episodes to roll out
    #[arg(long, default_value_t = 1)]
    episodes: u32,

    /// Render the episodes
    #[arg(long)]
    render: bool,
}

impl From<TestArgs> for TestOptions {
    fn from(args: TestArgs) -> Self {
        TestOptions {
            submission: args.submission,
            startby: args.startby,
            registry: args.registry,
            episodes: args.episodes,
            render: args.render,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Roll out the submission against scripted opponents
    Test(TestArgs),

    /// Serve the submission team on the competition port
    #[command(alias = "run_team_server")]
    RunTeamServer {
        /// Submission directory
        #[arg(long, default_value = DEFAULT_SUBMISSION)]
        submission: PathBuf,
    },

    /// Compare the packages the submission imports with the competition environment
    #[command(alias = "check_requirements")]
    CheckRequirements {
        /// Submission directory
        #[arg(long, default_value = DEFAULT_SUBMISSION)]
        submission: PathBuf,

        /// Compare versions too
        #[arg(long)]
        strict: bool,

        /// Package list of the competition environment
        #[arg(long)]
        default_packages_path: Option<PathBuf>,
    },

    /// Validate aicrowd.json
    #[command(alias = "check_aicrowd_json")]
    CheckAicrowdJson,

    /// Log in to AIcrowd if needed
    #[command(alias = "aicrowd_setup")]
    AicrowdSetup,

    /// Check, test and submit to AIcrowd
    Submit {
        /// Tag of the submission
        submission_id: String,

        /// Submit without testing first
        #[arg(long)]
        skip_test: bool,

        #[command(flatten)]
        test: TestArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = Configuration::from_env();
    if cli.log {
        config = config.with_log(true);
    }
    if let Some(python) = cli.python {
        config = config.with_python(python);
    }
    if config.is_logging() {
        if let Err(e) = init_logger() {
            console::warn(&format!("Could not set up the log file: {e:#}"));
        }
    }

    let toolkit = Toolkit::new(PythonFramework::new(config.python()), config);
    match run(&toolkit, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            console::print_error_chain(&e);
            ExitCode::from(exit_code_of(&e))
        }
    }
}

fn run(toolkit: &Toolkit<PythonFramework>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Test(args) => toolkit.test(&args.into()),
        Commands::RunTeamServer { submission } => toolkit.run_team_server(&submission),
        Commands::CheckRequirements {
            submission,
            strict,
            default_packages_path,
        } => toolkit
            .check_requirements(&submission, strict, default_packages_path.as_deref())
            .map(|_| ()),
        Commands::CheckAicrowdJson => toolkit.check_aicrowd_json().map(|_| ()),
        Commands::AicrowdSetup => toolkit.aicrowd_setup(),
        Commands::Submit {
            submission_id,
            skip_test,
            test,
        } => toolkit.submit(&SubmitOptions {
            submission_id,
            skip_test,
            test: test.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn snake_case_aliases() {
        let cli = Cli::try_parse_from(["nmmo-toolkit", "check_requirements", "--strict"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::CheckRequirements { strict: true, .. }
        ));
    }

    #[test]
    fn submit_takes_test_options() {
        let cli = Cli::try_parse_from([
            "nmmo-toolkit",
            "submit",
            "v1",
            "--startby",
            "docker",
            "--registry",
            "tencentcloud",
        ])
        .unwrap();
        let Commands::Submit {
            submission_id,
            skip_test,
            test,
        } = cli.command
        else {
            panic!("not a submit command");
        };
        assert_eq!(submission_id, "v1");
        assert!(!skip_test);
        let options = TestOptions::from(test);
        assert_eq!(options.startby.as_deref(), Some("docker"));
        assert_eq!(options.registry, "tencentcloud");
        assert_eq!(options.submission, PathBuf::from("my-submission"));
    }

    #[test]
    fn unknown_startby_is_left_to_the_toolkit() {
        // rejected with exit code 1 by the test command, not by the parser
        let cli = Cli::try_parse_from(["nmmo-toolkit", "test", "--startby", "thread"]).unwrap();
        let Commands::Test(args) = cli.command else {
            panic!("not a test command");
        };
        assert_eq!(args.startby.as_deref(), Some("thread"));
    }

    #[test]
    fn team_server_child_sees_the_parent_settings() {
        let config = Configuration::new().with_log(true).with_python("python3.9");
        let args = nmmo_toolkit::process::team_server_args("subs/v2", &config);
        let cli =
            Cli::try_parse_from(std::iter::once("nmmo-toolkit".to_string()).chain(args)).unwrap();
        assert!(cli.log);
        assert_eq!(cli.python.as_deref(), Some("python3.9"));
        let Commands::RunTeamServer { submission } = cli.command else {
            panic!("not a run-team-server command");
        };
        assert_eq!(submission, PathBuf::from("subs/v2"));
    }
}
