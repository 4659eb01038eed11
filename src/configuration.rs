//! Config for the toolkit behaviors
//!
//! This module provides the settings shared by every toolkit operation: where the build file,
//! metadata descriptor and package allow-list live, which interpreter drives the competition
//! framework, and how the local team server is contained.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`]. Command-line flags are applied on
//! top with the `with_*` builders.
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive; set them to `"true"` to enable.
//!
//! - `NMMO_LOG` — Enable logging to a file (default: `false`)
//! - `NMMO_PYTHON` — Interpreter used to drive the framework (default: `python`)
//! - `NMMO_DOCKERFILE` — Build file of the submission image (default: `Dockerfile`)
//! - `NMMO_AICROWD_JSON` — Metadata descriptor (default: `aicrowd.json`)
//! - `NMMO_DEFAULT_PACKAGES` — Competition package allow-list (default: `docker/requirements.txt`)
//! - `NMMO_PIPREQS` — Program inferring the submission requirements (default: `pipreqs`)
//! - `NMMO_SUBMIT_SCRIPT` — Script performing the final submission (default: `.submit.sh`)
//! - `NMMO_SERVER_MEMORY_MB` — Memory cap of the local team server, in MB (default: none)
//! - `NMMO_SERVER_CPUS` — CPU list of the local team server, e.g. `"0-3"` (default: none)
//! - `NMMO_ALLOW_UNCONTAINED` — Run the local team server without cgroup when unavailable (default: `false`)

use std::path::PathBuf;
use std::time::Duration;

/// Resource caps applied to a locally launched team server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerLimits {
    /// Memory cap in MB.
    pub memory_mb: Option<u64>,
    /// Comma separated cpu ranges ("1-5,7", "1,3,4", ...).
    pub cpus: Option<String>,
}

impl ServerLimits {
    /// No cap is set: the server runs as a plain child process.
    pub fn is_unlimited(&self) -> bool {
        self.memory_mb.is_none() && self.cpus.is_none()
    }
}

/// Configuration for toolkit behaviors.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) log: bool,
    pub(crate) python: String,
    pub(crate) dockerfile: PathBuf,
    pub(crate) aicrowd_json: PathBuf,
    pub(crate) default_packages: PathBuf,
    pub(crate) pipreqs: String,
    pub(crate) submit_script: PathBuf,
    pub(crate) server_limits: ServerLimits,
    pub(crate) allow_uncontained: bool,
    pub(crate) server_ready_timeout: Duration,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Logging to file is disabled.
    /// - The framework is driven through `python`.
    /// - Files are looked up relative to the current directory (`Dockerfile`, `aicrowd.json`,
    ///   `docker/requirements.txt`, `.submit.sh`).
    /// - The local team server is not contained.
    /// - The rollout waits up to 60s for the team server port.
    pub fn new() -> Self {
        Self {
            log: false,
            python: "python".to_string(),
            dockerfile: PathBuf::from("Dockerfile"),
            aicrowd_json: PathBuf::from("aicrowd.json"),
            default_packages: PathBuf::from("docker/requirements.txt"),
            pipreqs: "pipreqs".to_string(),
            submit_script: PathBuf::from(".submit.sh"),
            server_limits: ServerLimits::default(),
            allow_uncontained: false,
            server_ready_timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the recognized variables. Any unset or unparsable
    /// variable leaves the default value in place.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_path(var: &str, default: PathBuf) -> PathBuf {
            std::env::var_os(var).map(PathBuf::from).unwrap_or(default)
        }

        let defaults = Self::new();
        Self {
            log: get_env_flag("NMMO_LOG", defaults.log),
            python: std::env::var("NMMO_PYTHON").unwrap_or(defaults.python),
            dockerfile: get_env_path("NMMO_DOCKERFILE", defaults.dockerfile),
            aicrowd_json: get_env_path("NMMO_AICROWD_JSON", defaults.aicrowd_json),
            default_packages: get_env_path("NMMO_DEFAULT_PACKAGES", defaults.default_packages),
            pipreqs: std::env::var("NMMO_PIPREQS").unwrap_or(defaults.pipreqs),
            submit_script: get_env_path("NMMO_SUBMIT_SCRIPT", defaults.submit_script),
            server_limits: ServerLimits {
                memory_mb: std::env::var("NMMO_SERVER_MEMORY_MB")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                cpus: std::env::var("NMMO_SERVER_CPUS").ok(),
            },
            allow_uncontained: get_env_flag("NMMO_ALLOW_UNCONTAINED", defaults.allow_uncontained),
            server_ready_timeout: defaults.server_ready_timeout,
        }
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Interpreter used to drive the competition framework.
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Build file of the submission image.
    pub fn with_dockerfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.dockerfile = path.into();
        self
    }

    /// Metadata descriptor checked before submitting.
    pub fn with_aicrowd_json(mut self, path: impl Into<PathBuf>) -> Self {
        self.aicrowd_json = path.into();
        self
    }

    /// Competition package allow-list.
    pub fn with_default_packages(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_packages = path.into();
        self
    }

    /// Program inferring the requirements of a submission.
    pub fn with_pipreqs(mut self, program: impl Into<String>) -> Self {
        self.pipreqs = program.into();
        self
    }

    /// Script performing the final submission.
    pub fn with_submit_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.submit_script = path.into();
        self
    }

    /// Resource caps of the local team server.
    pub fn with_server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = limits;
        self
    }

    /// Enable or disable the uncontained fallback of the local team server.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// How long the rollout waits for the team server port to accept connections.
    pub fn with_server_ready_timeout(mut self, timeout: Duration) -> Self {
        self.server_ready_timeout = timeout;
        self
    }

    /// True when the invocation is traced to a log file.
    pub fn is_logging(&self) -> bool {
        self.log
    }

    /// Path of the competition package allow-list.
    pub fn default_packages(&self) -> &std::path::Path {
        &self.default_packages
    }

    /// Interpreter used to drive the competition framework.
    pub fn python(&self) -> &str {
        &self.python
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
