//! Team server process without cgroups, for platforms other than Linux.

use std::{process::Child, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

use super::{create_process, kill_process_group};
use crate::configuration::ServerLimits;

/// A child process. Killed on drop.
#[derive(Debug)]
pub struct LimitedProcess {
    /// The process itself.
    pub child: Child,
    cleaned_up: bool,
}

impl LimitedProcess {
    /// Always fails: resource limits need cgroups.
    pub fn launch(
        _command: &str,
        _args: &[String],
        _limits: &ServerLimits,
    ) -> anyhow::Result<LimitedProcess> {
        bail!("resource limits need cgroups, only available on linux")
    }

    /// Launch `command` as a plain child process.
    pub fn launch_without_container(command: &str, args: &[String]) -> anyhow::Result<LimitedProcess> {
        let child = create_process(command, args).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cleaned_up: false,
        })
    }

    /// Never contained.
    pub fn is_contained(&self) -> bool {
        false
    }

    /// Kill the process group led by the process, then reap the process.
    pub fn try_kill(&mut self, _max_duration: Duration) -> anyhow::Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        kill_process_group(&self.child);
        if self.child.try_wait().context("could not poll process")?.is_none() {
            self.child.kill().context("could not kill process")?;
        }
        self.child.wait().context("could not reap process")?;
        self.cleaned_up = true;
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
