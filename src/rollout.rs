//! Test rollout of a submission.
//!
//! The submission team plays [`CompetitionConfig::episodes`] episodes against scripted random
//! opponents. The team either lives in the rollout process or behind a team server started
//! beforehand; in the latter case the rollout owns the server handle and stops it whatever the
//! outcome.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info, instrument, warn};

use crate::competition::{CompetitionConfig, TeamSource};
use crate::docker::ContainerServer;
use crate::framework::Framework;
use crate::process::LocalServer;
use crate::supervisor::{wait_for_port, Cancellation};

/// A launched team server.
pub trait ServerHandle {
    /// Short description for the console, e.g. `process 4242`.
    fn describe(&self) -> String;
    /// True while the server is running.
    fn is_alive(&mut self) -> bool;
    /// True once the server itself reports it serves, beyond its port accepting connections.
    fn is_ready(&mut self) -> bool {
        true
    }
    /// Stop the server. Stopping twice is a no-op.
    fn stop(&mut self) -> anyhow::Result<()>;
}

impl ServerHandle for LocalServer {
    fn describe(&self) -> String {
        format!("process {}", self.pid())
    }

    fn is_alive(&mut self) -> bool {
        LocalServer::is_alive(self)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        LocalServer::stop(self)
    }
}

impl ServerHandle for ContainerServer {
    fn describe(&self) -> String {
        format!("container {}", self.id())
    }

    fn is_alive(&mut self) -> bool {
        ContainerServer::is_alive(self)
    }

    fn is_ready(&mut self) -> bool {
        ContainerServer::is_ready(self)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        ContainerServer::stop(self)
    }
}

const READY_SLICE: Duration = Duration::from_secs(1);
const READY_POLL: Duration = Duration::from_millis(200);

/// Play the rollout, then stop `server` if there is one.
///
/// With a [`TeamSource::Remote`] source and a server, the rollout only starts once the server
/// accepts connections, within `ready_timeout`.
///
/// # Errors
/// If the server never becomes ready, the rollout fails, or `cancel` trips.
#[instrument(skip(framework, server, cancel))]
pub fn run<F: Framework + ?Sized>(
    framework: &F,
    config: &CompetitionConfig,
    source: &TeamSource,
    mut server: Option<&mut dyn ServerHandle>,
    ready_timeout: Duration,
    cancel: &Cancellation,
) -> anyhow::Result<()> {
    let result = play(framework, config, source, server.as_deref_mut(), ready_timeout, cancel);

    if let Some(server) = server {
        if let Err(e) = server.stop() {
            warn!("could not stop {}: {e:#}", server.describe());
            crate::console::warn(&format!("Could not stop {}: {e}", server.describe()));
        }
    }
    result
}

fn play<F: Framework + ?Sized>(
    framework: &F,
    config: &CompetitionConfig,
    source: &TeamSource,
    server: Option<&mut (dyn ServerHandle + '_)>,
    ready_timeout: Duration,
    cancel: &Cancellation,
) -> anyhow::Result<()> {
    if let (TeamSource::Remote { host, port }, Some(server)) = (source, server) {
        let addr = (host.as_str(), *port)
            .to_socket_addrs()
            .with_context(|| format!("could not resolve {host}:{port}"))?
            .next()
            .ok_or_else(|| anyhow!("{host}:{port} resolves to no address"))?;
        wait_until_ready(addr, server, ready_timeout, cancel)?;
    }

    info!(episodes = config.episodes(), "rollout");
    framework.rollout(config, source, cancel)
}

fn wait_until_ready(
    addr: SocketAddr,
    server: &mut dyn ServerHandle,
    timeout: Duration,
    cancel: &Cancellation,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = wait_for_port(addr, remaining.min(READY_SLICE), cancel);
        match attempt {
            Ok(()) if server.is_ready() => return Ok(()),
            // a forwarded port accepts connections before the server behind it listens
            Ok(()) => {
                debug!("{} accepts connections but is not serving yet", server.describe());
                std::thread::sleep(remaining.min(READY_POLL));
                if cancel.is_cancelled() {
                    return Err(cancel.take_error());
                }
            }
            Err(e) if cancel.is_cancelled() => return Err(e),
            Err(_) if !server.is_alive() => {
                bail!("{} exited before accepting connections", server.describe())
            }
            Err(e) if Instant::now() >= deadline => {
                return Err(e.context(format!("{} is not ready", server.describe())))
            }
            Err(_) => continue,
        }
        if !server.is_alive() {
            bail!("{} exited before serving", server.describe())
        }
        if Instant::now() >= deadline {
            bail!("{} is not ready after {timeout:?}", server.describe())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::net::TcpListener;
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::error::{exit_code_of, ToolkitError};
    use crate::submission::Submission;

    #[derive(Default)]
    struct ScriptedFramework {
        fail: bool,
        rollouts: Cell<u32>,
    }

    impl Framework for ScriptedFramework {
        fn check_submission(&self, _: &Submission) -> anyhow::Result<()> {
            Ok(())
        }

        fn team_server_command(&self, _: &Path) -> Vec<String> {
            Vec::new()
        }

        fn serve(&self, _: &Submission) -> anyhow::Result<()> {
            Ok(())
        }

        fn rollout(&self, _: &CompetitionConfig, _: &TeamSource, _: &Cancellation) -> anyhow::Result<()> {
            self.rollouts.set(self.rollouts.get() + 1);
            if self.fail {
                bail!("episode crashed");
            }
            Ok(())
        }
    }

    struct FakeServer {
        alive: bool,
        stops: u32,
        ready_after: u32,
        readiness_checks: u32,
    }

    impl FakeServer {
        fn new(alive: bool) -> Self {
            FakeServer {
                alive,
                stops: 0,
                ready_after: 0,
                readiness_checks: 0,
            }
        }

        fn serving_after(checks: u32) -> Self {
            FakeServer {
                ready_after: checks,
                ..FakeServer::new(true)
            }
        }
    }

    impl ServerHandle for FakeServer {
        fn describe(&self) -> String {
            "fake server".to_string()
        }

        fn is_alive(&mut self) -> bool {
            self.alive
        }

        fn is_ready(&mut self) -> bool {
            self.readiness_checks += 1;
            self.readiness_checks > self.ready_after
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.stops += 1;
            self.alive = false;
            Ok(())
        }
    }

    fn remote(listener: &TcpListener) -> TeamSource {
        TeamSource::Remote {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
        }
    }

    #[test]
    fn in_process_rollout_needs_no_server() {
        let framework = ScriptedFramework::default();
        run(
            &framework,
            &CompetitionConfig::new(),
            &TeamSource::Submission(PathBuf::from("my-submission")),
            None,
            Duration::from_secs(1),
            &Cancellation::new(),
        )
        .unwrap();
        assert_eq!(framework.rollouts.get(), 1);
    }

    #[test]
    fn server_is_stopped_after_success() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut server = FakeServer::new(true);
        run(
            &ScriptedFramework::default(),
            &CompetitionConfig::new(),
            &remote(&listener),
            Some(&mut server),
            Duration::from_secs(2),
            &Cancellation::new(),
        )
        .unwrap();
        assert_eq!(server.stops, 1);
    }

    #[test]
    fn server_is_stopped_after_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut server = FakeServer::new(true);
        let framework = ScriptedFramework {
            fail: true,
            ..Default::default()
        };
        let err = run(
            &framework,
            &CompetitionConfig::new(),
            &remote(&listener),
            Some(&mut server),
            Duration::from_secs(2),
            &Cancellation::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("episode crashed"));
        assert_eq!(server.stops, 1);
    }

    #[test]
    fn dead_server_aborts_before_rollout() {
        // nothing listens on this port once the listener is dropped
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let source = TeamSource::Remote {
            host: "127.0.0.1".to_string(),
            port,
        };
        let framework = ScriptedFramework::default();
        let mut server = FakeServer::new(false);
        let err = run(
            &framework,
            &CompetitionConfig::new(),
            &source,
            Some(&mut server),
            Duration::from_secs(30),
            &Cancellation::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("exited before accepting connections"));
        assert_eq!(framework.rollouts.get(), 0);
        assert_eq!(server.stops, 1);
    }

    #[test]
    fn cancelled_run_reports_the_crash() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let source = TeamSource::Remote {
            host: "127.0.0.1".to_string(),
            port,
        };
        let cancel = Cancellation::new();
        cancel.cancel(ToolkitError::ContainerCrashed("c0ffee".into()));
        let mut server = FakeServer::new(true);
        let err = run(
            &ScriptedFramework::default(),
            &CompetitionConfig::new(),
            &source,
            Some(&mut server),
            Duration::from_secs(30),
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Container c0ffee exit unexpectedly");
        assert_eq!(exit_code_of(&err), 1);
        assert_eq!(server.stops, 1);
    }

    #[test]
    fn rollout_waits_for_the_server_behind_an_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let framework = ScriptedFramework::default();
        let mut server = FakeServer::serving_after(3);
        run(
            &framework,
            &CompetitionConfig::new(),
            &remote(&listener),
            Some(&mut server),
            Duration::from_secs(10),
            &Cancellation::new(),
        )
        .unwrap();
        assert_eq!(server.readiness_checks, 4);
        assert_eq!(framework.rollouts.get(), 1);
        assert_eq!(server.stops, 1);
    }

    #[test]
    fn server_that_never_serves_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let framework = ScriptedFramework::default();
        let mut server = FakeServer::serving_after(u32::MAX);
        let err = run(
            &framework,
            &CompetitionConfig::new(),
            &remote(&listener),
            Some(&mut server),
            Duration::from_millis(600),
            &Cancellation::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("fake server is not ready"));
        assert_eq!(framework.rollouts.get(), 0);
        assert_eq!(server.stops, 1);
    }
}
