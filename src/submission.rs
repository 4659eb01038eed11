//! Submission directory validation.
//!
//! A submission is a directory with an entry point, `submission.py`, declaring which team class
//! the competition framework must instantiate and with which constructor parameters:
//!
//! ```python
//! from ijcai2022nmmo import Team
//!
//! class MyTeam(Team):
//!     ...
//!
//! class Submission:
//!     team_klass = MyTeam
//!     init_params = {"checkpoint": "model.pt"}
//! ```
//!
//! [`Submission::open`] checks this contract statically, before anything is executed:
//! - `class Submission` exists at top level
//! - its body assigns `team_klass` to a class defined or imported in the file
//! - its body assigns `init_params` to a dict literal (`{...}` or `dict(...)`)
//!
//! > ⚠️ The entry point is scanned line by line, not parsed as Python. Assignments must sit on
//! > their own lines inside the class body; `init_params` may span several lines.

use std::path::{Path, PathBuf};

use tracing::{error, instrument, trace};

use crate::error::ToolkitError;

/// File name of the entry point inside a submission directory.
pub const ENTRY_POINT: &str = "submission.py";

const ENTRY_CLASS: &str = "Submission";

/// A submission directory that satisfies the entry point contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    root: PathBuf,
    team_class: String,
    init_params: Vec<String>,
}

impl Submission {
    /// Validate the submission at `path`.
    ///
    /// # Errors
    /// [`ToolkitError::InvalidSubmission`] when the directory or its entry point is missing or
    /// does not follow the contract.
    #[instrument]
    pub fn open(path: impl AsRef<Path> + std::fmt::Debug) -> anyhow::Result<Submission> {
        let root = path.as_ref();
        check_dir_integrity(root)?;

        let entry_point = root.join(ENTRY_POINT);
        if !entry_point.is_file() {
            error!("entry point not found: {}", entry_point.display());
            return Err(invalid(format!(
                "{} not found in {}",
                ENTRY_POINT,
                root.display()
            )));
        }
        let source = std::fs::read_to_string(&entry_point).map_err(|e| {
            error!("could not read entry point: {e}");
            invalid(format!("could not read {}: {e}", entry_point.display()))
        })?;

        let (team_class, init_params) = parse_entry_point(&source).map_err(invalid)?;
        trace!(%team_class, ?init_params);

        Ok(Submission {
            root: root.to_path_buf(),
            team_class,
            init_params,
        })
    }

    /// The submission directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Name of the team class referenced by `Submission.team_klass`.
    pub fn team_class(&self) -> &str {
        &self.team_class
    }

    /// Top-level keys of `Submission.init_params`, in declaration order.
    pub fn init_params(&self) -> &[String] {
        &self.init_params
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    ToolkitError::InvalidSubmission(msg.into()).into()
}

fn check_dir_integrity(dir: &Path) -> anyhow::Result<()> {
    let metadata = match dir.metadata() {
        Ok(metadata) => metadata,
        Err(e) => {
            error!("Error reading submission directory: {}", e);
            return Err(invalid(format!("{}: {e}", dir.display())));
        }
    };
    if !metadata.is_dir() {
        error!("Not a directory");
        return Err(invalid(format!("{} is not a directory", dir.display())));
    }
    Ok(())
}

/// Returns `(team_class, init_param_keys)`.
fn parse_entry_point(source: &str) -> Result<(String, Vec<String>), String> {
    let lines: Vec<&str> = source.lines().collect();

    let class_line = lines
        .iter()
        .position(|line| class_name(line) == Some(ENTRY_CLASS))
        .ok_or_else(|| format!("class {ENTRY_CLASS} not found in {ENTRY_POINT}"))?;

    // the body ends at the next non-indented, non-empty line
    let body_len = lines[class_line + 1..]
        .iter()
        .position(|line| {
            !line.trim().is_empty() && !line.starts_with(char::is_whitespace)
        })
        .unwrap_or(lines.len() - class_line - 1);
    let body = &lines[class_line + 1..class_line + 1 + body_len];

    let mut team_class = None;
    let mut init_params = None;
    for (i, line) in body.iter().enumerate() {
        let line_number = class_line + i + 2;
        let Some((name, value)) = assignment(line) else {
            continue;
        };
        match name {
            "team_klass" => {
                if value.is_empty() || !value.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                    return Err(format!(
                        "Line {line_number}: team_klass should name a class, got '{value}'"
                    ));
                }
                team_class = Some(value.rsplit('.').next().unwrap_or(value).to_string());
            }
            "init_params" => {
                let literal = collect_literal(value, &body[i + 1..]).ok_or_else(|| {
                    format!("Line {line_number}: unbalanced brackets in init_params")
                })?;
                init_params = Some(dict_keys(&literal).ok_or_else(|| {
                    format!("Line {line_number}: init_params should be a dict literal")
                })?);
            }
            _ => {}
        }
    }

    let team_class =
        team_class.ok_or_else(|| format!("{ENTRY_CLASS}.team_klass is not set"))?;
    let init_params =
        init_params.ok_or_else(|| format!("{ENTRY_CLASS}.init_params is not set"))?;

    if !is_declared(source, &team_class) {
        return Err(format!(
            "team class {team_class} is neither defined nor imported in {ENTRY_POINT}"
        ));
    }

    Ok((team_class, init_params))
}

/// `class Name(...)` or `class Name:` at top level.
fn class_name(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("class ")?;
    let end = rest.find(|c: char| c == '(' || c == ':')?;
    Some(rest[..end].trim())
}

/// `name = value` inside a class body.
fn assignment(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let (name, value) = line.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    // `==` is a comparison, not an assignment
    if value.starts_with('=') {
        return None;
    }
    Some((name, strip_comment(value).trim()))
}

fn strip_comment(text: &str) -> &str {
    let mut quote = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '#') => return &text[..i],
            _ => {}
        }
    }
    text
}

/// Join `first` with the following lines until every bracket opened in it is closed.
fn collect_literal(first: &str, following: &[&str]) -> Option<String> {
    let mut literal = first.to_string();
    let mut rest = following.iter();
    while bracket_depth(&literal)? > 0 {
        let next = rest.next()?;
        literal.push('\n');
        literal.push_str(strip_comment(next));
    }
    Some(literal)
}

fn bracket_depth(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = None;
    for c in text.chars() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '{' | '(' | '[') => depth += 1,
            (None, '}' | ')' | ']') => depth = depth.checked_sub(1)?,
            _ => {}
        }
    }
    Some(depth)
}

/// Top-level keys of `{...}` or `dict(...)`. `None` if `literal` is neither.
fn dict_keys(literal: &str) -> Option<Vec<String>> {
    let literal = literal.trim();
    let (inner, keyword_style) = if let Some(inner) = literal.strip_prefix('{') {
        (inner.strip_suffix('}')?, false)
    } else if let Some(inner) = literal.strip_prefix("dict(") {
        (inner.strip_suffix(')')?, true)
    } else {
        return None;
    };

    let mut keys = vec![];
    for entry in split_top_level(inner) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let separator = if keyword_style { '=' } else { ':' };
        let (key, _) = entry.split_once(separator)?;
        let key = key.trim().trim_matches(|c| c == '"' || c == '\'');
        keys.push(key.to_string());
    }
    Some(keys)
}

fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = vec![];
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '{' | '(' | '[') => depth += 1,
            (None, '}' | ')' | ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn is_declared(source: &str, name: &str) -> bool {
    source.lines().any(|line| {
        if class_name(line) == Some(name) {
            return true;
        }
        let line = strip_comment(line).trim();
        let imported = if let Some((_, names)) = line
            .strip_prefix("from ")
            .and_then(|rest| rest.split_once(" import "))
        {
            names
        } else if let Some(names) = line.strip_prefix("import ") {
            names
        } else {
            return false;
        };
        imported
            .trim_matches(|c| c == '(' || c == ')')
            .split(',')
            .map(|item| item.split(" as ").last().unwrap_or(item).trim())
            .any(|item| item == name || item.rsplit('.').next() == Some(name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = r#"
from ijcai2022nmmo import Team
import numpy as np


class MyTeam(Team):
    def act(self, observations):
        return {}


class Submission:
    team_klass = MyTeam
    init_params = {
        "checkpoint": "model.pt",  # relative to the submission
        'seed': 42,
    }
"#;

    #[test]
    fn parse_well_formed_entry_point() {
        let (team, params) = parse_entry_point(WELL_FORMED).unwrap();
        assert_eq!(team, "MyTeam");
        assert_eq!(params, vec!["checkpoint", "seed"]);
    }

    #[test]
    fn imported_team_class_is_accepted() {
        let source = "from agents.scripted import (Combat as MyTeam, Other)\n\nclass Submission:\n    team_klass = MyTeam\n    init_params = dict(layers=3)\n";
        let (team, params) = parse_entry_point(source).unwrap();
        assert_eq!(team, "MyTeam");
        assert_eq!(params, vec!["layers"]);
    }

    #[test]
    fn empty_init_params() {
        let source = "class T:\n    pass\n\nclass Submission:\n    team_klass = T\n    init_params = {}\n";
        let (_, params) = parse_entry_point(source).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn missing_submission_class() {
        let err = parse_entry_point("class MyTeam:\n    pass\n").unwrap_err();
        assert!(err.contains("class Submission not found"));
    }

    #[test]
    fn undeclared_team_class() {
        let source = "class Submission:\n    team_klass = Ghost\n    init_params = {}\n";
        let err = parse_entry_point(source).unwrap_err();
        assert!(err.contains("Ghost"));
    }

    #[test]
    fn init_params_must_be_a_dict() {
        let source = "class T:\n    pass\nclass Submission:\n    team_klass = T\n    init_params = [1, 2]\n";
        let err = parse_entry_point(source).unwrap_err();
        assert!(err.contains("dict literal"));
    }

    #[test]
    fn assignments_outside_the_class_body_are_ignored() {
        let source = "class T:\n    pass\nclass Submission:\n    team_klass = T\ninit_params = {}\n";
        let err = parse_entry_point(source).unwrap_err();
        assert!(err.contains("init_params is not set"));
    }

    #[test]
    fn open_reports_missing_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let err = Submission::open(dir.path()).unwrap_err();
        let err = err.downcast::<ToolkitError>().unwrap();
        assert!(matches!(err, ToolkitError::InvalidSubmission(_)));
    }

    #[test]
    fn open_accepts_well_formed_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ENTRY_POINT), WELL_FORMED).unwrap();
        let submission = Submission::open(dir.path()).unwrap();
        assert_eq!(submission.team_class(), "MyTeam");
        assert_eq!(submission.path(), dir.path());
    }

    #[test]
    fn open_rejects_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, "").unwrap();
        assert!(Submission::open(&file).is_err());
    }
}
