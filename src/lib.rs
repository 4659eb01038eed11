//! # NMMO Toolkit
//!
//! Package, locally test and submit entries of the IJCAI 2022 Neural MMO challenge.
//!
//! It provides:
//! - Submission validation against the `submission.py` entry point contract ([`submission`])
//! - Test rollouts against scripted opponents, with the submission loaded in process, served
//!   from a local child process, or served from the submission docker image ([`rollout`])
//! - A comparison of the packages a submission imports with the competition environment
//!   ([`requirements`])
//! - Checks of the `aicrowd.json` descriptor and the final submission to AIcrowd
//!
//! The competition framework itself (`ijcai2022nmmo`) is a Python package. The toolkit drives it
//! through the [`Framework`](crate::framework::Framework) trait; [`PythonFramework`](crate::framework::PythonFramework)
//! is the implementation used by the command line.
//!
//! # Documentation Overview
//!
//! - For the commands and their options, see [`Toolkit`](crate::toolkit::Toolkit).
//! - For paths, interpreter and resource limits of the local team server, see
//!   [`Configuration`](crate::configuration::Configuration).
//! - For exit codes, see [`error`].
//!
//! # Usage Example
//!
//! ```no_run
//! use nmmo_toolkit::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env().with_allow_uncontained(true);
//!     let toolkit = Toolkit::new(PythonFramework::new(config.python()), config);
//!
//!     toolkit.check_aicrowd_json()?;
//!     toolkit.test(&TestOptions {
//!         startby: Some("process".to_string()),
//!         episodes: 3,
//!         ..Default::default()
//!     })?;
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;
pub mod aicrowd;
pub mod competition;
pub mod configuration;
pub mod console;
pub mod docker;
pub mod error;
pub mod framework;
pub mod logger;
pub mod metadata;
pub mod process;
pub mod requirements;
pub mod rollout;
mod shell;
pub mod submission;
pub mod supervisor;
pub mod toolkit;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use nmmo_toolkit::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`Toolkit`](crate::toolkit::Toolkit) and its option structs
/// - the [`Framework`](crate::framework::Framework) trait and [`PythonFramework`](crate::framework::PythonFramework)
/// - [`CompetitionConfig`](crate::competition::CompetitionConfig)
pub mod prelude {
    pub use crate::competition::{CompetitionConfig, StartBy, TeamSource};
    pub use crate::configuration::{Configuration, ServerLimits};
    pub use crate::error::{exit_code_of, ToolkitError};
    pub use crate::framework::{Framework, PythonFramework};
    pub use crate::submission::Submission;
    pub use crate::supervisor::Cancellation;
    pub use crate::toolkit::{SubmitOptions, TestOptions, Toolkit};
}
