//! Container-backed team server.
//!
//! The submission image is built from the local `Dockerfile` and started detached, with the
//! working directory mounted at `/home/aicrowd` and the team server port published. Two
//! monitors run alongside it: `docker logs -f` streams the container output to the console, and
//! a liveness thread polls the container exit code every second, tripping the run's
//! [`Cancellation`] as soon as it stops being `0`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, instrument, warn};

use crate::competition::PORT;
use crate::configuration::Configuration;
use crate::console;
use crate::error::ToolkitError;
use crate::framework::SERVER_READY_MARKER;
use crate::shell::{self, ExitPolicy};
use crate::supervisor::{watch_liveness, Cancellation, Liveness};

/// Runtime image the submission image is built from.
pub const IMAGE: &str = "ijcai2022nmmo/submission-runtime";
/// Name given to the team server container.
pub const CONTAINER: &str = "ijcai2022-nmmo-runner";
/// Mirror of the runtime image.
pub const TENCENTCLOUD_REGISTRY: &str = "ccr.ccs.tencentyun.com";
/// Where the working directory is mounted inside the container.
pub const MOUNT_POINT: &str = "/home/aicrowd";

const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Where the runtime image is pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Registry {
    /// Docker Hub, through `docker build --pull`.
    #[default]
    DockerHub,
    /// The Tencent Cloud mirror, pulled and tagged by hand.
    TencentCloud,
}

impl FromStr for Registry {
    type Err = ToolkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dockerhub" => Ok(Registry::DockerHub),
            "tencentcloud" => Ok(Registry::TencentCloud),
            other => Err(ToolkitError::InvalidRegistry(other.to_string())),
        }
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registry::DockerHub => write!(f, "dockerhub"),
            Registry::TencentCloud => write!(f, "tencentcloud"),
        }
    }
}

/// True when the runtime image must be pulled from the mirror before building: the registry is
/// not Docker Hub and a `FROM` line of `dockerfile` names `IMAGE:latest`.
pub fn needs_manual_pull(dockerfile: &str, registry: Registry) -> bool {
    if registry == Registry::DockerHub {
        return false;
    }
    let latest = format!("{IMAGE}:latest");
    dockerfile
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| line.starts_with("FROM"))
        .any(|line| line.split_whitespace().last() == Some(latest.as_str()))
}

/// Composes docker commands. Whether they need `sudo` is decided once, by [`DockerCli::detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DockerCli {
    need_root: bool,
}

impl DockerCli {
    /// Probe `docker ps`: if it fails for the current user, docker commands run through `sudo`.
    pub fn detect() -> Self {
        let accessible = Command::new("docker")
            .arg("ps")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success());
        debug!(need_root = !accessible, "probed docker access");
        DockerCli {
            need_root: !accessible,
        }
    }

    /// A client with a known root requirement.
    pub fn with_root(need_root: bool) -> Self {
        DockerCli { need_root }
    }

    /// True when docker commands are prefixed with `sudo`.
    pub fn need_root(&self) -> bool {
        self.need_root
    }

    /// `docker <args>`, prefixed with `sudo` when needed.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = if self.need_root {
            let mut sudo = Command::new("sudo");
            sudo.arg("docker");
            sudo
        } else {
            Command::new("docker")
        };
        cmd.args(args);
        cmd
    }
}

/// Path of `submission` as seen from inside the container, where `cwd` is mounted at
/// [`MOUNT_POINT`]. Relative paths are kept relative to the container working directory.
pub fn container_path(cwd: &Path, submission: &Path) -> PathBuf {
    match submission.strip_prefix(cwd) {
        Ok(relative) => Path::new(MOUNT_POINT).join(relative),
        Err(_) => submission.to_path_buf(),
    }
}

/// A running team server container. Stopped on drop.
#[derive(Debug)]
pub struct ContainerServer {
    id: String,
    docker: DockerCli,
    monitor_stop: Arc<AtomicBool>,
    logs: Option<Child>,
    stopped: bool,
}

impl ContainerServer {
    /// Build the submission image and start `server_command` in a fresh container.
    ///
    /// # Errors
    /// [`ToolkitError::PullFailed`] or [`ToolkitError::BuildFailed`] when the image cannot be
    /// prepared; any docker command failure otherwise.
    #[instrument(skip(docker, server_command, config, cancel))]
    pub fn launch(
        docker: DockerCli,
        registry: Registry,
        server_command: &[String],
        config: &Configuration,
        cancel: &Cancellation,
    ) -> anyhow::Result<ContainerServer> {
        console::ok(&format!("Use docker registry [{registry}]"));

        let manual_pull = match registry {
            Registry::DockerHub => false,
            Registry::TencentCloud => {
                let dockerfile = std::fs::read_to_string(&config.dockerfile).with_context(|| {
                    format!("could not read {}", config.dockerfile.display())
                })?;
                needs_manual_pull(&dockerfile, registry)
            }
        };

        if manual_pull {
            pull_from_mirror(docker)?;
        }
        build_image(docker, &config.dockerfile, !manual_pull)?;
        remove_existing_container(docker)?;

        let cwd = std::env::current_dir().context("could not read the working directory")?;
        let mount = format!("{}:{MOUNT_POINT}", cwd.display());
        let ports = format!("{PORT}:{PORT}");
        let image = format!("{IMAGE}:local");
        let mut run = docker.command([
            "run",
            "-d",
            "--name",
            CONTAINER,
            "-v",
            mount.as_str(),
            "-p",
            ports.as_str(),
            image.as_str(),
        ]);
        run.args(server_command);
        let id = shell::capture(&mut run, ExitPolicy::Strict).context("could not start container")?;
        info!(%id, "container started");

        let logs = match docker
            .command(["logs", "-f", id.as_str()])
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => Some(child),
            Err(e) => {
                warn!("could not stream container logs: {e}");
                None
            }
        };

        let monitor_stop = Arc::new(AtomicBool::new(false));
        let probe_id = id.clone();
        watch_liveness(
            move || probe_container(docker, &probe_id),
            LIVENESS_INTERVAL,
            cancel.clone(),
            monitor_stop.clone(),
        );

        Ok(ContainerServer {
            id,
            docker,
            monitor_stop,
            logs,
            stopped: false,
        })
    }

    /// Container id, as printed by `docker run`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True while the container reports exit code `0`.
    pub fn is_alive(&self) -> bool {
        !self.stopped && matches!(probe_container(self.docker, &self.id), Liveness::Alive)
    }

    /// True once the team server in the container printed [`SERVER_READY_MARKER`].
    ///
    /// The published port accepts connections as soon as the container starts, whatever
    /// listens inside.
    pub fn is_ready(&self) -> bool {
        if self.stopped {
            return false;
        }
        let mut logs = self.docker.command(["logs", self.id.as_str()]);
        match shell::capture_quiet(&mut logs, ExitPolicy::Strict) {
            Ok(output) => output.contains(SERVER_READY_MARKER),
            Err(e) => {
                debug!(id = %self.id, "could not read container logs: {e:#}");
                false
            }
        }
    }

    /// Stop the monitors and the container.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        if self.stopped {
            return Ok(());
        }
        // the container is about to exit on purpose
        self.monitor_stop.store(true, Ordering::SeqCst);
        self.stopped = true;

        if let Some(mut logs) = self.logs.take() {
            let _ = logs.kill();
            let _ = logs.wait();
        }
        shell::capture_quiet(
            &mut self.docker.command(["stop", self.id.as_str()]),
            ExitPolicy::Strict,
        )
        .with_context(|| format!("could not stop container {}", self.id))?;
        info!(id = %self.id, "container stopped");
        Ok(())
    }
}

impl Drop for ContainerServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{e:#}");
        }
    }
}

fn probe_container(docker: DockerCli, id: &str) -> Liveness {
    let mut inspect = docker.command(["inspect", id, "--format", "{{.State.ExitCode}}"]);
    match shell::capture_quiet(&mut inspect, ExitPolicy::Strict) {
        Ok(code) if code == "0" => Liveness::Alive,
        Ok(code) => {
            debug!(%id, %code, "container exited");
            Liveness::Dead(ToolkitError::ContainerCrashed(id.to_string()))
        }
        Err(e) => {
            debug!(%id, "could not inspect container: {e:#}");
            Liveness::Dead(ToolkitError::ContainerCrashed(id.to_string()))
        }
    }
}

fn pull_from_mirror(docker: DockerCli) -> anyhow::Result<()> {
    console::ok(&format!("Try pull image from {TENCENTCLOUD_REGISTRY}"));
    let mirrored = format!("{TENCENTCLOUD_REGISTRY}/{IMAGE}:latest");
    let pulled = shell::run_inherited(&mut docker.command(["pull", mirrored.as_str()]))?;
    if !pulled.success() {
        return Err(ToolkitError::PullFailed.into());
    }
    let latest = format!("{IMAGE}:latest");
    let tagged = shell::run_inherited(&mut docker.command(["tag", mirrored.as_str(), latest.as_str()]))?;
    if !tagged.success() {
        warn!("could not tag {mirrored} as {latest}");
    }
    Ok(())
}

fn build_image(docker: DockerCli, dockerfile: &Path, pull: bool) -> anyhow::Result<()> {
    let image = format!("{IMAGE}:local");
    console::ok(&format!("Try build image {image} ..."));
    let mut build = docker.command(["build"]);
    if pull {
        build.arg("--pull");
    }
    build.args(["-t", image.as_str(), "-f"]).arg(dockerfile).arg(".");
    if !shell::run_inherited(&mut build)?.success() {
        return Err(ToolkitError::BuildFailed.into());
    }
    Ok(())
}

fn remove_existing_container(docker: DockerCli) -> anyhow::Result<()> {
    let existing = shell::pipe(
        &mut docker.command(["ps", "-a"]),
        Command::new("grep").args(["-w", CONTAINER]),
    )?;
    if !existing.is_empty() {
        shell::capture(&mut docker.command(["stop", CONTAINER]), ExitPolicy::Strict)?;
        shell::capture(&mut docker.command(["rm", CONTAINER]), ExitPolicy::Strict)?;
    }
    Ok(())
}
