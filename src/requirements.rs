//! Comparison of the submission's inferred requirements against the competition allow-list.
//!
//! Requirements files are read line by line; blank lines and `#` comments are skipped. Each
//! line is `package`, or `package<op>version` where `<op>` is a pip comparison operator
//! (`==`, `>=`, `~=`, ...).
//!
//! - Non-strict mode compares package names only.
//! - Strict mode compares whole lines. A package present in the allow-list under another
//!   version is a version conflict (warning); an absent package is an error.

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::Context;
use tracing::{error, info, instrument, warn};

use crate::error::ToolkitError;

/// One line of a requirements file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// The line as written, trimmed.
    pub line: String,
    /// Package name.
    pub package: String,
    /// Version, if the line pins one.
    pub version: Option<String>,
}

impl Requirement {
    /// Parse a single requirements line.
    pub fn parse(line: &str) -> Requirement {
        let line = line.trim();
        let split = line
            .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~'))
            .unwrap_or(line.len());
        let package = line[..split].trim().to_string();
        let version = line[split..]
            .trim_start_matches(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~'))
            .trim();
        Requirement {
            line: line.to_string(),
            package,
            version: (!version.is_empty()).then(|| version.to_string()),
        }
    }
}

/// Parse a requirements file content, skipping blank lines and comments.
pub fn parse_requirements(text: &str) -> Vec<Requirement> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Requirement::parse)
        .collect()
}

/// Read and parse a requirements file.
pub fn read_requirements(path: &Path) -> anyhow::Result<Vec<Requirement>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading requirements {}", path.display()))?;
    Ok(parse_requirements(&text))
}

/// A single mismatch between the submission and the competition environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// The package is not installed in the competition environment.
    Missing {
        /// The requirement as inferred from the submission.
        requirement: String,
    },
    /// The package is installed in the competition environment under another version.
    VersionConflict {
        /// Package name.
        package: String,
        /// Version inferred from the submission.
        local: String,
        /// Version of the competition environment.
        competition: String,
    },
}

impl Finding {
    /// Errors make the submission unusable; version conflicts only warn.
    pub fn is_error(&self) -> bool {
        matches!(self, Finding::Missing { .. })
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Finding::Missing { requirement } => {
                write!(f, "Package[{requirement}] is not in competition env")
            }
            Finding::VersionConflict {
                package,
                local,
                competition,
            } => write!(
                f,
                "Package[{package}] version conflicts, local[{local}] vs competiton[{competition}]"
            ),
        }
    }
}

/// Outcome of a requirements comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementsReport {
    /// Mismatches, in the order of the submission requirements.
    pub findings: Vec<Finding>,
}

impl RequirementsReport {
    /// At least one requirement is not satisfied exactly (errors or conflicts).
    pub fn fault(&self) -> bool {
        !self.findings.is_empty()
    }

    /// At least one requirement is missing from the competition environment.
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(Finding::is_error)
    }
}

/// Compare `submission` requirements against the `competition` allow-list.
pub fn compare(
    submission: &[Requirement],
    competition: &[Requirement],
    strict: bool,
) -> RequirementsReport {
    let mut findings = vec![];
    for reqm in submission {
        if strict {
            if competition.iter().any(|c| c.line == reqm.line) {
                continue;
            }
            match competition.iter().find(|c| c.package == reqm.package) {
                Some(pinned) => findings.push(Finding::VersionConflict {
                    package: reqm.package.clone(),
                    local: version_or_line(reqm),
                    competition: version_or_line(pinned),
                }),
                None => findings.push(Finding::Missing {
                    requirement: reqm.line.clone(),
                }),
            }
        } else if !competition.iter().any(|c| c.package == reqm.package) {
            findings.push(Finding::Missing {
                requirement: reqm.package.clone(),
            });
        }
    }
    RequirementsReport { findings }
}

fn version_or_line(reqm: &Requirement) -> String {
    reqm.version.clone().unwrap_or_else(|| reqm.line.clone())
}

/// Infer the third-party requirements of `submission` with the `pipreqs` program.
///
/// The inferred list is written to a temporary directory removed before returning.
///
/// # Errors
/// [`ToolkitError::RequirementsInference`] when `pipreqs` cannot be run or fails.
#[instrument]
pub fn infer_requirements(submission: &Path, pipreqs: &str) -> anyhow::Result<Vec<Requirement>> {
    let tmpdir = tempfile::tempdir().context("creating temporary directory")?;
    let savepath = tmpdir.path().join("requirements.txt");

    let status = Command::new(pipreqs)
        .arg("--savepath")
        .arg(&savepath)
        .arg(submission)
        .stdin(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => {
            error!("{pipreqs} exited with {status}");
            return Err(ToolkitError::RequirementsInference.into());
        }
        Err(e) => {
            error!("could not launch {pipreqs}: {e}");
            return Err(anyhow::Error::new(e)
                .context(format!("could not launch '{pipreqs}'"))
                .context(ToolkitError::RequirementsInference));
        }
    }

    let requirements = read_requirements(&savepath)?;
    info!(inferred = requirements.len());
    Ok(requirements)
}

/// Log the findings of `report`.
pub(crate) fn trace_report(report: &RequirementsReport) {
    for finding in &report.findings {
        if finding.is_error() {
            error!("{finding}");
        } else {
            warn!("{finding}");
        }
    }
}
