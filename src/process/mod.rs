//! Local team server process.
//!
//! The team server runs as a child of the toolkit: the toolkit re-invokes its own executable
//! with `run-team-server --submission <path>`, forwarding `--log` and `--python`. The child leads
//! its own process group so stopping it also takes down whatever it started, and on Linux it is
//! killed when the toolkit dies. When [`ServerLimits`](crate::configuration::ServerLimits) are set, the child is placed in a dedicated
//! cgroup (Linux only) that is killed and removed when the server stops.

#[cfg(target_os = "linux")]
mod cgroup_linux;

#[cfg(target_os = "linux")]
pub use cgroup_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_stub;

#[cfg(not(target_os = "linux"))]
pub use cgroup_stub::*;

use std::path::Path;
use std::process::{Child, Stdio};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, instrument, warn};

use crate::configuration::Configuration;

fn create_process(command: &str, args: &[String]) -> anyhow::Result<Child> {
    let mut cmd = std::process::Command::new(command);
    // the server shares the console with the toolkit
    cmd.args(args).stdin(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // the server and everything it starts share one group, killed as a whole
        cmd.process_group(0);
        #[cfg(target_os = "linux")]
        // SAFETY: prctl is async-signal-safe and touches no memory of the parent
        unsafe {
            cmd.pre_exec(|| {
                use nix::sys::{prctl, signal::Signal};
                prctl::set_pdeathsig(Signal::SIGKILL).map_err(std::io::Error::from)
            });
        }
    }
    cmd.spawn()
        .with_context(|| format!("command '{command}' not found"))
}

/// Kill every process of the group led by `child`.
///
/// Must run before `child` is reaped, while its pid still names the group.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    match killpg(group, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => debug!(%group, "process group already gone"),
        Err(e) => warn!(%group, "could not kill process group: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Arguments re-invoking the toolkit as the team server of `submission`.
///
/// Settings given on the command line are forwarded; environment settings are inherited.
pub fn team_server_args(submission: &str, config: &Configuration) -> Vec<String> {
    let mut args = Vec::with_capacity(6);
    if config.is_logging() {
        args.push("--log".to_string());
    }
    args.extend([
        "--python".to_string(),
        config.python().to_string(),
        "run-team-server".to_string(),
        "--submission".to_string(),
        submission.to_string(),
    ]);
    args
}

/// A team server running as a child process.
#[derive(Debug)]
pub struct LocalServer {
    process: LimitedProcess,
}

impl LocalServer {
    const STOP_TIMEOUT: Duration = Duration::from_secs(1);

    /// Start the team server of `submission` in a child process.
    ///
    /// # Errors
    /// If the process cannot be created, or cannot be contained while limits are set and
    /// uncontained fallback is not allowed.
    #[instrument(skip(config))]
    pub fn launch(submission: &Path, config: &Configuration) -> anyhow::Result<LocalServer> {
        let exe = std::env::current_exe().context("could not locate the toolkit executable")?;
        let command = exe
            .to_str()
            .context("toolkit executable path is not a valid string")?;
        let submission = submission
            .to_str()
            .context("submission path is not a valid string")?;
        Self::spawn(command, &team_server_args(submission, config), config)
    }

    fn spawn(command: &str, args: &[String], config: &Configuration) -> anyhow::Result<LocalServer> {
        let limits = &config.server_limits;
        let process = if limits.is_unlimited() {
            LimitedProcess::launch_without_container(command, args)?
        } else {
            match LimitedProcess::launch(command, args, limits) {
                Ok(process) => process,
                Err(e) if config.allow_uncontained => {
                    warn!("could not contain team server, running it uncontained: {e:#}");
                    crate::console::warn(&format!(
                        "Could not apply resource limits ({e}), running team server uncontained"
                    ));
                    LimitedProcess::launch_without_container(command, args)?
                }
                Err(e) => {
                    return Err(e.context(
                        "could not contain team server (set NMMO_ALLOW_UNCONTAINED=true to run it anyway)",
                    ))
                }
            }
        };
        info!(
            pid = process.child.id(),
            contained = process.is_contained(),
            "team server launched"
        );
        Ok(LocalServer { process })
    }

    /// OS process id of the server.
    pub fn pid(&self) -> u32 {
        self.process.child.id()
    }

    /// True while the server process has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.process.child.try_wait(), Ok(None))
    }

    /// Kill the server with everything it started.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.process.try_kill(Self::STOP_TIMEOUT)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::configuration::ServerLimits;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    fn limited() -> ServerLimits {
        ServerLimits {
            memory_mb: Some(512),
            cpus: None,
        }
    }

    #[test]
    fn uncontained_process_can_be_stopped() {
        let mut process =
            LimitedProcess::launch_without_container("sleep", &args(&["30"])).unwrap();
        assert!(!process.is_contained());
        assert!(matches!(process.child.try_wait(), Ok(None)));
        process.try_kill(Duration::from_secs(1)).unwrap();
        assert!(process.child.try_wait().unwrap().is_some());
    }

    #[test]
    fn dropping_kills_the_process() {
        let process = LimitedProcess::launch_without_container("sleep", &args(&["30"])).unwrap();
        let pid = process.child.id();
        drop(process);
        // `kill -0` fails once the process is gone
        let status = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn unknown_command_is_reported() {
        let err = LimitedProcess::launch_without_container("definitely-not-a-command", &[])
            .unwrap_err();
        assert!(format!("{err:#}").contains("definitely-not-a-command"));
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: u32) -> bool {
        // an orphan that nobody reaps stays a zombie, which is dead enough
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map_or(true, |state| state == "Z" || state == "X"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stopping_kills_processes_started_by_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 317 & echo $! > {}; wait", pid_file.display());
        let mut process =
            LimitedProcess::launch_without_container("sh", &args(&["-c", &script])).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let grandchild: u32 = loop {
            let written = std::fs::read_to_string(&pid_file).unwrap_or_default();
            if let Ok(pid) = written.trim().parse() {
                break pid;
            }
            assert!(Instant::now() < deadline, "shell never started its child");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert!(!is_gone(grandchild));

        process.try_kill(Duration::from_secs(1)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !is_gone(grandchild) {
            assert!(
                Instant::now() < deadline,
                "process {grandchild} survived the server"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn forwards_command_line_settings_to_the_server() {
        let config = Configuration::new().with_python("/opt/venv/bin/python");
        assert_eq!(
            team_server_args("my-submission", &config),
            args(&[
                "--python",
                "/opt/venv/bin/python",
                "run-team-server",
                "--submission",
                "my-submission"
            ])
        );

        let logged = team_server_args("my-submission", &config.with_log(true));
        assert_eq!(logged[0], "--log");
        assert_eq!(&logged[1..3], ["--python", "/opt/venv/bin/python"]);
    }

    #[test]
    fn local_server_lifecycle() {
        let mut server =
            LocalServer::spawn("sleep", &args(&["30"]), &Configuration::new()).unwrap();
        assert!(server.pid() > 0);
        assert!(server.is_alive());
        server.stop().unwrap();
        assert!(!server.is_alive());
        // stopping twice is a no-op
        server.stop().unwrap();
    }

    #[test]
    fn limits_fall_back_to_uncontained_when_allowed() {
        let config = Configuration::new()
            .with_server_limits(limited())
            .with_allow_uncontained(true);
        // contained when the user owns a delegated cgroup, uncontained otherwise
        let mut server = LocalServer::spawn("sleep", &args(&["30"]), &config).unwrap();
        assert!(server.is_alive());
        server.stop().unwrap();
        assert!(!server.is_alive());
    }

    #[test]
    fn limits_without_fallback_either_contain_or_fail() {
        let config = Configuration::new().with_server_limits(limited());
        match LocalServer::spawn("sleep", &args(&["30"]), &config) {
            Ok(mut server) => {
                assert!(server.process.is_contained());
                server.stop().unwrap();
            }
            Err(e) => assert!(format!("{e:#}").contains("NMMO_ALLOW_UNCONTAINED")),
        }
    }
}
