//! cgroup containment of the team server.
//!
//! Groups are created under the user's systemd service (`user@<uid>.service`), the part of the
//! hierarchy an unprivileged user is delegated on cgroup v2 systems.

use std::{
    process::Child,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use cgroups_rs::{cgroup_builder::CgroupBuilder, Cgroup, CgroupPid};
use tracing::{debug, warn};

use super::{create_process, kill_process_group};
use crate::configuration::ServerLimits;

const EMPTY_POLL: Duration = Duration::from_millis(10);

/// Real uid from the `Uid:` line of a `/proc/<pid>/status` file.
fn parse_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn current_uid() -> anyhow::Result<u32> {
    let status =
        std::fs::read_to_string("/proc/self/status").context("could not read /proc/self/status")?;
    parse_uid(&status).context("no Uid line in /proc/self/status")
}

/// Path, relative to the hierarchy root, of the next team server group of this toolkit run.
fn next_group_path(uid: u32) -> String {
    static SERVERS: AtomicU32 = AtomicU32::new(1);
    format!(
        "user.slice/user-{uid}.slice/user@{uid}.service/nmmo-team-server-{}-{}",
        std::process::id(),
        SERVERS.fetch_add(1, Ordering::Relaxed)
    )
}

/// Memory cap in bytes, as the memory controller takes it.
fn memory_bytes(limits: &ServerLimits) -> Option<i64> {
    limits
        .memory_mb
        .map(|mb| i64::try_from(mb).unwrap_or(i64::MAX).saturating_mul(1024 * 1024))
}

fn build_group(path: &str, limits: &ServerLimits) -> anyhow::Result<Cgroup> {
    let mut builder = CgroupBuilder::new(path);
    if let Some(bytes) = memory_bytes(limits) {
        builder = builder.memory().memory_hard_limit(bytes).done();
    }
    if let Some(cpus) = &limits.cpus {
        builder = builder.cpu().cpus(cpus.clone()).done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .with_context(|| format!("could not create cgroup {path}"))
}

fn wait_until_empty(group: &Cgroup, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = group.tasks().len();
        if left == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("{left} processes still in cgroup after {timeout:?}");
        }
        std::thread::sleep(EMPTY_POLL);
    }
}

/// A child process, optionally confined to its own cgroup. Killed on drop.
#[derive(Debug)]
pub struct LimitedProcess {
    /// The process itself.
    pub child: Child,
    cgroup: Option<Cgroup>,
    cleaned_up: bool,
}

impl LimitedProcess {
    /// Launch `command` inside a new cgroup capped by `limits`.
    ///
    /// # Errors
    /// If the cgroup cannot be created or the process cannot be moved into it. The process and
    /// the group are removed again in the latter case.
    pub fn launch(
        command: &str,
        args: &[String],
        limits: &ServerLimits,
    ) -> anyhow::Result<LimitedProcess> {
        let path = next_group_path(current_uid()?);
        let group = build_group(&path, limits)?;

        let mut child = match create_process(command, args) {
            Ok(child) => child,
            Err(e) => {
                let _ = group.delete();
                return Err(e);
            }
        };
        if let Err(e) = group.add_task_by_tgid(CgroupPid::from(child.id() as u64)) {
            kill_process_group(&child);
            let _ = child.kill();
            let _ = child.wait();
            let _ = group.delete();
            return Err(e).with_context(|| format!("could not move process into cgroup {path}"));
        }
        debug!(%path, "team server contained");

        Ok(LimitedProcess {
            child,
            cgroup: Some(group),
            cleaned_up: false,
        })
    }

    /// Launch `command` as a plain child process.
    pub fn launch_without_container(command: &str, args: &[String]) -> anyhow::Result<LimitedProcess> {
        let child = create_process(command, args).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cgroup: None,
            cleaned_up: false,
        })
    }

    /// True when the process runs in its own cgroup.
    pub fn is_contained(&self) -> bool {
        self.cgroup.is_some()
    }

    /// Kill the process with everything it started, then reap it.
    ///
    /// A contained process takes its whole cgroup down, which is then removed; an uncontained one
    /// takes its process group down.
    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        match &self.cgroup {
            Some(group) => {
                // catches anything forked before the move into the cgroup
                kill_process_group(&self.child);
                group.kill().context("could not kill cgroup")?;
                wait_until_empty(group, max_duration)?;
                let _ = self.child.wait();
                self.cleaned_up = true;
                if let Err(e) = group.delete() {
                    warn!("could not remove cgroup {}: {e}", group.path());
                }
            }
            None => {
                kill_process_group(&self.child);
                if self.child.try_wait().context("could not poll process")?.is_none() {
                    self.child.kill().context("could not kill process")?;
                }
                self.child.wait().context("could not reap process")?;
                self.cleaned_up = true;
            }
        }
        Ok(())
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        if let Err(e) = self.try_kill(Duration::from_secs(1)) {
            warn!("could not kill process {} on drop: {e:#}", self.child.id());
        }
    }
}
