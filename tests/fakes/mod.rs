use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nmmo_toolkit::prelude::*;

/// Framework double: accepts every submission and plays rollouts instantly.
#[derive(Debug, Default)]
pub struct FakeFramework {
    pub reject_submissions: bool,
    pub failing_rollout: bool,
    pub checks: AtomicU32,
    pub rollouts: AtomicU32,
    pub last_episodes: AtomicU32,
}

impl FakeFramework {
    pub fn failing() -> Self {
        FakeFramework {
            failing_rollout: true,
            ..Default::default()
        }
    }

    pub fn rejecting() -> Self {
        FakeFramework {
            reject_submissions: true,
            ..Default::default()
        }
    }

    pub fn rollouts(&self) -> u32 {
        self.rollouts.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn last_episodes(&self) -> u32 {
        self.last_episodes.load(Ordering::SeqCst)
    }
}

/// Console capturing what the toolkit reports.
#[derive(Debug, Clone, Default)]
pub struct SharedConsole(Arc<Mutex<Vec<u8>>>);

impl SharedConsole {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedConsole {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Framework for FakeFramework {
    fn check_submission(&self, submission: &Submission) -> anyhow::Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.reject_submissions {
            return Err(ToolkitError::InvalidSubmission(format!(
                "{} rejected",
                submission.team_class()
            ))
            .into());
        }
        Ok(())
    }

    fn team_server_command(&self, submission: &Path) -> Vec<String> {
        vec!["serve".to_string(), submission.display().to_string()]
    }

    fn serve(&self, _submission: &Submission) -> anyhow::Result<()> {
        Ok(())
    }

    fn rollout(
        &self,
        config: &CompetitionConfig,
        _source: &TeamSource,
        cancel: &Cancellation,
    ) -> anyhow::Result<()> {
        self.rollouts.fetch_add(1, Ordering::SeqCst);
        self.last_episodes.store(config.episodes(), Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(cancel.take_error());
        }
        if self.failing_rollout {
            anyhow::bail!("episode {} crashed", config.episodes());
        }
        Ok(())
    }
}
