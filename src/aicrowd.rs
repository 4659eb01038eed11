//! AIcrowd account setup and final submission.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::console;
use crate::error::ToolkitError;
use crate::shell;

/// Configuration file of the `aicrowd` CLI, relative to the user config directory.
pub const CLI_CONFIG: &str = "aicrowd-cli/config.toml";

#[derive(Debug, Default, Deserialize)]
struct CliConfig {
    #[serde(default)]
    aicrowd_api_key: Option<String>,
}

/// Where the `aicrowd` CLI keeps its configuration: under `$XDG_CONFIG_HOME`, or `~/.config`.
pub fn cli_config_path() -> Option<PathBuf> {
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(config_home.join(CLI_CONFIG))
}

/// True when the CLI configuration at `path` holds a non-empty API key.
///
/// A missing file means no credentials.
///
/// # Errors
/// If the file exists but cannot be read or is not valid TOML.
pub fn has_credentials(path: &Path) -> anyhow::Result<bool> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("could not read {}", path.display())),
    };
    let config: CliConfig =
        toml::from_str(&text).with_context(|| format!("could not parse {}", path.display()))?;
    Ok(config
        .aicrowd_api_key
        .is_some_and(|key| !key.trim().is_empty()))
}

/// Make sure the `aicrowd` CLI is logged in, running `aicrowd login` interactively if not.
///
/// # Errors
/// [`ToolkitError::LoginFailed`] when the login command fails.
#[instrument]
pub fn setup() -> anyhow::Result<()> {
    let logged_in = match cli_config_path() {
        Some(path) => match has_credentials(&path) {
            Ok(found) => found,
            Err(e) => {
                // an unreadable config is handled like a missing one: login rewrites it
                debug!("{e:#}");
                false
            }
        },
        None => false,
    };

    if !logged_in {
        console::warn("AICrowd config not found. Trying ``aicrowd login``.");
        let status = shell::run_inherited(Command::new("aicrowd").arg("login"))
            .context(ToolkitError::LoginFailed)?;
        if !status.success() {
            return Err(ToolkitError::LoginFailed.into());
        }
    }
    console::ok("aicrowd_setup done.");
    Ok(())
}

/// `bash <script> '<submission_id>'`.
///
/// # Errors
/// [`ToolkitError::SubmitScriptFailed`] when the script exits with a non-zero status.
#[instrument]
pub fn run_submit_script(script: &Path, submission_id: &str) -> anyhow::Result<()> {
    let status = shell::run_inherited(Command::new("bash").arg(script).arg(submission_id))?;
    if !status.success() {
        return Err(ToolkitError::SubmitScriptFailed(script.display().to_string()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code_of;

    #[test]
    fn missing_config_has_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_credentials(&dir.path().join("config.toml")).unwrap());
    }

    #[test]
    fn api_key_must_be_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "aicrowd_api_key = \"0123abcd\"\ngitlab = {}\n").unwrap();
        assert!(has_credentials(&path).unwrap());

        std::fs::write(&path, "aicrowd_api_key = \"\"\n").unwrap();
        assert!(!has_credentials(&path).unwrap());

        std::fs::write(&path, "[gitlab]\nusername = \"tomz\"\n").unwrap();
        assert!(!has_credentials(&path).unwrap());
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "aicrowd_api_key = ").unwrap();
        assert!(has_credentials(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn submit_script_receives_the_submission_id() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(".submit.sh");
        let marker = dir.path().join("submitted");
        std::fs::write(
            &script,
            format!("echo \"$1\" > '{}'\n", marker.display()),
        )
        .unwrap();

        run_submit_script(&script, "my first try").unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "my first try");
    }

    #[cfg(unix)]
    #[test]
    fn failing_submit_script_exits_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(".submit.sh");
        std::fs::write(&script, "exit 3\n").unwrap();

        let err = run_submit_script(&script, "id").unwrap_err();
        assert_eq!(exit_code_of(&err), 1);
        assert!(err.to_string().ends_with("failed."));
    }
}
