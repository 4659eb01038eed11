//! Cooperative cancellation of a test run.
//!
//! A launched team server is watched by a detached liveness thread. When the server dies, the
//! thread trips the run's [`Cancellation`]; the main thread notices it while waiting for the
//! server port ([`wait_for_port`]) or for the rollout process ([`supervise`]), kills what it
//! owns and returns the stored error. Nothing calls `process::exit` behind the caller's back.

use std::net::{SocketAddr, TcpStream};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tracing::{error, trace, warn};

use crate::error::ToolkitError;

#[derive(Debug, Default)]
struct Inner {
    tripped: AtomicBool,
    error: Mutex<Option<ToolkitError>>,
}

/// Shared "this run is over" signal. Cloning shares the signal.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    /// A signal that has not tripped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Only the first error is kept.
    pub fn cancel(&self, error: ToolkitError) {
        let mut guard = self.inner.error.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(error);
        }
        self.inner.tripped.store(true, Ordering::SeqCst);
    }

    /// True once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    /// The error that tripped the signal, taken out of it.
    pub fn take_error(&self) -> anyhow::Error {
        match self.inner.error.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(error) => error.into(),
            None => anyhow!("run cancelled"),
        }
    }
}

/// What a liveness probe reports.
#[derive(Debug)]
pub enum Liveness {
    /// Still running (or exited cleanly).
    Alive,
    /// Gone for good; the run is cancelled with this error.
    Dead(ToolkitError),
}

/// Poll `probe` every `interval` on a detached thread until it reports [`Liveness::Dead`],
/// which trips `cancel`, or until `stop` is set.
pub fn watch_liveness<P>(
    mut probe: P,
    interval: Duration,
    cancel: Cancellation,
    stop: Arc<AtomicBool>,
) where
    P: FnMut() -> Liveness + Send + 'static,
{
    thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            match probe() {
                Liveness::Alive => thread::sleep(interval),
                Liveness::Dead(error) => {
                    if stop.load(Ordering::SeqCst) {
                        // stopped on purpose while probing
                        return;
                    }
                    error!("{error}");
                    crate::console::err(&error.to_string());
                    cancel.cancel(error);
                    return;
                }
            }
        }
        trace!("liveness watch stopped");
    });
}

/// Wait for `child` to exit, killing it if `cancel` trips first.
///
/// # Errors
/// The cancellation error if `cancel` tripped, or an I/O error while waiting.
pub fn supervise(
    child: &mut Child,
    cancel: &Cancellation,
    poll: Duration,
) -> anyhow::Result<ExitStatus> {
    loop {
        if cancel.is_cancelled() {
            warn!("run cancelled, killing process {}", child.id());
            if let Err(e) = child.kill() {
                warn!("could not kill process {}: {e}", child.id());
            }
            let _ = child.wait();
            return Err(cancel.take_error());
        }
        if let Some(status) = child.try_wait().context("waiting for process")? {
            return Ok(status);
        }
        thread::sleep(poll);
    }
}

/// Wait until something accepts TCP connections on `addr`.
///
/// # Errors
/// When `timeout` elapses first, or the cancellation error if `cancel` trips.
pub fn wait_for_port(
    addr: SocketAddr,
    timeout: Duration,
    cancel: &Cancellation,
) -> anyhow::Result<()> {
    const ATTEMPT: Duration = Duration::from_millis(200);
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err(cancel.take_error());
        }
        if TcpStream::connect_timeout(&addr, ATTEMPT).is_ok() {
            trace!(%addr, "team server is accepting connections");
            return Ok(());
        }
        thread::sleep(ATTEMPT.min(timeout / 10));
    }
    Err(anyhow!(
        "no team server listening on {addr} after {timeout:?}"
    ))
}
