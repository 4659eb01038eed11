//! Validation of the `aicrowd.json` competition descriptor.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, instrument};

use crate::error::ToolkitError;

/// The only challenge this toolkit submits to.
pub const CHALLENGE_ID: &str = "ijcai-2022-the-neural-mmo-challenge";

/// The fields of `aicrowd.json` the toolkit looks at. Other fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AicrowdJson {
    /// Expected to be [`CHALLENGE_ID`].
    #[serde(default)]
    pub challenge_id: Value,
    /// aicrowd usernames of the team members.
    #[serde(default)]
    pub authors: Value,
    /// Free text shown on the submission page.
    #[serde(default)]
    pub description: Option<String>,
}

impl AicrowdJson {
    /// Parse a descriptor from its JSON text.
    pub fn parse(text: &str) -> anyhow::Result<AicrowdJson> {
        serde_json::from_str(text).context("aicrowd.json is not a valid JSON object")
    }

    /// Check the challenge identifier, then the authors.
    ///
    /// # Errors
    /// - [`ToolkitError::WrongChallengeId`] if `challenge_id` is not [`CHALLENGE_ID`]
    /// - [`ToolkitError::MissingAuthors`] if `authors` is absent or empty
    pub fn validate(&self) -> Result<(), ToolkitError> {
        if self.challenge_id.as_str() != Some(CHALLENGE_ID) {
            error!(challenge_id = %self.challenge_id, "wrong challenge id");
            return Err(ToolkitError::WrongChallengeId {
                expected: CHALLENGE_ID,
            });
        }
        if !is_truthy(&self.authors) {
            error!(authors = %self.authors, "no authors");
            return Err(ToolkitError::MissingAuthors);
        }
        Ok(())
    }
}

/// Read and validate the descriptor at `path`.
#[instrument]
pub fn check_aicrowd_json(path: &Path) -> anyhow::Result<AicrowdJson> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let descriptor =
        AicrowdJson::parse(&text).with_context(|| format!("parsing {}", path.display()))?;
    descriptor.validate()?;
    Ok(descriptor)
}

/// Emptiness as the descriptor authors understand it: `null`, `false`, `0`, `""`, `[]`, `{}`.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
