//! Terminal failures of the toolkit and the process exit codes they map to.
//!
//! Every operation returns [`anyhow::Result`]. When a failure must end the process with a
//! specific exit code, the error chain carries a [`ToolkitError`]; [`exit_code_of`] finds it.
//! Anything else exits with [`exit_code::FAILURE`].

use thiserror::Error;

/// Fixed process exit codes.
pub mod exit_code {
    /// Test failure, invalid `--startby`, missing allow-list, submit script failure.
    pub const FAILURE: u8 = 1;
    /// `pipreqs` could not infer the submission requirements.
    pub const REQUIREMENTS_INFERENCE: u8 = 2;
    /// `challenge_id` in `aicrowd.json` is wrong.
    pub const CHALLENGE_ID: u8 = 3;
    /// `authors` in `aicrowd.json` is empty or absent.
    pub const AUTHORS: u8 = 4;
    /// The submission does not satisfy the entry point contract.
    pub const SUBMISSION_CHECK: u8 = 5;
    /// Unknown docker registry.
    pub const INVALID_REGISTRY: u8 = 6;
    /// Image pull, image build or aicrowd login failed.
    pub const BUILD: u8 = 10;
}

/// A failure that ends the current invocation with a known exit code.
#[derive(Debug, Error)]
pub enum ToolkitError {
    /// The submission directory or its entry point is missing or malformed.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// The competition package list does not exist.
    #[error("the default package list {0} not exist")]
    MissingDefaultPackages(String),

    /// `pipreqs` could not infer the submission requirements.
    #[error("Check requirements failed!")]
    RequirementsInference,

    /// `challenge_id` in `aicrowd.json` is not the competition one.
    #[error("[challenge_id] in aicrowd.json should be {expected}")]
    WrongChallengeId {
        /// The competition identifier.
        expected: &'static str,
    },

    /// `authors` in `aicrowd.json` is absent or empty.
    #[error(r#"[authors] in aicrowd.json should be set as aicrowd username(s). Like ["tomz", "maryz"]"#)]
    MissingAuthors,

    /// Unknown docker registry name.
    #[error("Invalid registry {0}")]
    InvalidRegistry(String),

    /// `--startby` is neither `docker` nor `process`.
    #[error("startby should be either docker or process, got {0}")]
    InvalidStartBy(String),

    /// The runtime image could not be pulled from the mirror.
    #[error("Pull image failed.")]
    PullFailed,

    /// The submission image could not be built.
    #[error("Build failed.")]
    BuildFailed,

    /// `aicrowd login` failed.
    #[error("aicrowd_setup failed.")]
    LoginFailed,

    /// The team server container stopped during a test.
    #[error("Container {0} exit unexpectedly")]
    ContainerCrashed(String),

    /// The test rollout failed.
    #[error("test failed")]
    TestFailed,

    /// The submit script exited with a non-zero status.
    #[error("bash {0} failed.")]
    SubmitScriptFailed(String),
}

impl ToolkitError {
    /// The process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        use exit_code::*;
        match self {
            ToolkitError::InvalidSubmission(_) => SUBMISSION_CHECK,
            ToolkitError::RequirementsInference => REQUIREMENTS_INFERENCE,
            ToolkitError::WrongChallengeId { .. } => CHALLENGE_ID,
            ToolkitError::MissingAuthors => AUTHORS,
            ToolkitError::InvalidRegistry(_) => INVALID_REGISTRY,
            ToolkitError::PullFailed | ToolkitError::BuildFailed | ToolkitError::LoginFailed => {
                BUILD
            }
            ToolkitError::MissingDefaultPackages(_)
            | ToolkitError::InvalidStartBy(_)
            | ToolkitError::ContainerCrashed(_)
            | ToolkitError::TestFailed
            | ToolkitError::SubmitScriptFailed(_) => FAILURE,
        }
    }
}

/// Exit code for an error chain: the first [`ToolkitError`] found, else [`exit_code::FAILURE`].
pub fn exit_code_of(err: &anyhow::Error) -> u8 {
    // `anyhow::Error::downcast_ref` sees both context layers and the root cause
    err.downcast_ref::<ToolkitError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<ToolkitError>()))
        .map_or(exit_code::FAILURE, ToolkitError::exit_code)
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn exit_code_found_through_context() {
        let err = Err::<(), _>(ToolkitError::MissingAuthors)
            .context("checking aicrowd.json")
            .unwrap_err();
        assert_eq!(exit_code_of(&err), exit_code::AUTHORS);
    }

    #[test]
    fn exit_code_found_as_context() {
        let err = anyhow::anyhow!("pipreqs not found").context(ToolkitError::RequirementsInference);
        assert_eq!(exit_code_of(&err), exit_code::REQUIREMENTS_INFERENCE);
    }

    #[test]
    fn unknown_error_is_generic_failure() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code_of(&err), exit_code::FAILURE);
    }

    #[test]
    fn codes_are_distinct_per_category() {
        assert_eq!(ToolkitError::InvalidRegistry("x".into()).exit_code(), 6);
        assert_eq!(ToolkitError::BuildFailed.exit_code(), 10);
        assert_eq!(ToolkitError::InvalidSubmission("x".into()).exit_code(), 5);
        assert_eq!(ToolkitError::RequirementsInference.exit_code(), 2);
    }
}
