//! Running external commands.
//!
//! Commands are built as argument vectors, never through `sh -c`. Every command is echoed to
//! the console before it runs.
//!
//! A non-zero exit is a [`CommandFailed`] error, except for filtering commands run with
//! [`ExitPolicy::NoMatchIsEmpty`]: like `grep`, they exit with 1 when nothing matched, which
//! is read as an empty result.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// How a non-zero exit status is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Any non-zero exit is an error.
    Strict,
    /// Exit code 1 means "no match": success with empty output.
    NoMatchIsEmpty,
}

/// A command exited with a non-zero status.
#[derive(Debug, Error)]
#[error("command '{command}' failed with {status}: {stderr}")]
pub struct CommandFailed {
    /// The command line, as echoed.
    pub command: String,
    /// Its exit status.
    pub status: ExitStatus,
    /// What it wrote to stderr, trimmed.
    pub stderr: String,
}

/// The command line of `cmd`, for display.
pub fn display(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `cmd`, capturing its output. Returns stdout, trimmed.
#[instrument(skip_all, fields(command = %self::display(cmd)))]
pub fn capture(cmd: &mut Command, policy: ExitPolicy) -> anyhow::Result<String> {
    println!("{}", display(cmd));
    capture_quiet(cmd, policy)
}

/// Same as [`capture`], without echoing the command.
pub fn capture_quiet(cmd: &mut Command, policy: ExitPolicy) -> anyhow::Result<String> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("could not launch '{}'", display(cmd)))?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    trace!(status = %output.status, %stdout);
    check_status(cmd, output.status, &output.stderr, policy)?;
    Ok(stdout)
}

/// Run `cmd` with the console as its stdout/stderr. Returns its exit status, whatever it is.
#[instrument(skip_all, fields(command = %self::display(cmd)))]
pub fn run_inherited(cmd: &mut Command) -> anyhow::Result<ExitStatus> {
    println!("{}", display(cmd));
    let status = cmd
        .status()
        .with_context(|| format!("could not launch '{}'", display(cmd)))?;
    debug!(%status);
    Ok(status)
}

/// Feed the stdout of `source` into `filter` (`source | filter`) and capture the result.
///
/// `source` must succeed; `filter` is run with [`ExitPolicy::NoMatchIsEmpty`].
#[instrument(skip_all, fields(source = %self::display(source), filter = %self::display(filter)))]
pub fn pipe(source: &mut Command, filter: &mut Command) -> anyhow::Result<String> {
    println!("{} | {}", display(source), display(filter));
    let mut producer = source
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("could not launch '{}'", display(source)))?;
    let producer_stdout = producer
        .stdout
        .take()
        .context("source command has no stdout")?;

    // drained alongside the filter, or a chatty source blocks on a full stderr pipe
    let stderr_reader = producer.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        })
    });

    let output = filter
        .stdin(Stdio::from(producer_stdout))
        .output()
        .with_context(|| format!("could not launch '{}'", display(filter)))?;

    let producer_stderr = match stderr_reader {
        Some(reader) => reader.join().unwrap_or_default(),
        None => Vec::new(),
    };
    let producer_status = producer
        .wait()
        .with_context(|| format!("waiting for '{}'", display(source)))?;
    check_status(source, producer_status, &producer_stderr, ExitPolicy::Strict)?;
    check_status(filter, output.status, &output.stderr, ExitPolicy::NoMatchIsEmpty)?;

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn check_status(
    cmd: &Command,
    status: ExitStatus,
    stderr: &[u8],
    policy: ExitPolicy,
) -> Result<(), CommandFailed> {
    if status.success() || (policy == ExitPolicy::NoMatchIsEmpty && status.code() == Some(1)) {
        return Ok(());
    }
    Err(CommandFailed {
        command: display(cmd),
        status,
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    })
}
