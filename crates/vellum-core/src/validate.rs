//! Issue-based schema validation.
//!
//! LLM outputs and persisted manifests are validated field-by-field into a
//! list of [`Issue`]s with dotted paths. The first issue becomes the
//! [`crate::error::Error::Validation`] carried across component boundaries,
//! which in turn drives the degrade-vs-retry decision.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Stable issue codes reported by validators.
///
/// The degradable subset (`invalid_enum_value`, `too_big`, `invalid_type`,
/// `unrecognized_keys`, `invalid_string`, `invalid_literal`) marks failures
/// a stricter prompt on the next model can plausibly fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    /// Value had the wrong JSON type.
    InvalidType,
    /// Value was not a member of a closed enum set.
    InvalidEnumValue,
    /// String value violated a format rule.
    InvalidString,
    /// Value did not match a required literal.
    InvalidLiteral,
    /// Numeric or length constraint exceeded.
    TooBig,
    /// Numeric or length constraint undershot.
    TooSmall,
    /// Object carried keys outside the schema.
    UnrecognizedKeys,
    /// A required field was absent.
    MissingField,
}

impl IssueCode {
    /// Returns the snake_case wire form of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidType => "invalid_type",
            Self::InvalidEnumValue => "invalid_enum_value",
            Self::InvalidString => "invalid_string",
            Self::InvalidLiteral => "invalid_literal",
            Self::TooBig => "too_big",
            Self::TooSmall => "too_small",
            Self::UnrecognizedKeys => "unrecognized_keys",
            Self::MissingField => "missing_field",
        }
    }

    /// Returns true when a stricter prompt on the next model can plausibly
    /// fix this class of issue.
    #[must_use]
    pub const fn is_degradable(self) -> bool {
        matches!(
            self,
            Self::InvalidEnumValue
                | Self::TooBig
                | Self::InvalidType
                | Self::UnrecognizedKeys
                | Self::InvalidString
                | Self::InvalidLiteral
        )
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// What went wrong.
    pub code: IssueCode,
    /// Dotted path of the failing field (`script.segments[2].visual_hint`).
    pub path: String,
    /// Human-readable description.
    pub message: String,
}

impl Issue {
    /// Creates a new issue.
    #[must_use]
    pub fn new(code: IssueCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Accumulates issues during a validation pass.
#[derive(Debug, Default)]
pub struct IssueList {
    issues: Vec<Issue>,
}

impl IssueList {
    /// Creates an empty issue list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an issue.
    pub fn push(&mut self, code: IssueCode, path: impl Into<String>, message: impl Into<String>) {
        self.issues.push(Issue::new(code, path, message));
    }

    /// Returns the collected issues.
    #[must_use]
    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    /// Returns true when no issue was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Finishes the pass: `Ok(())` when clean, otherwise the first issue as
    /// a validation error. Remaining issues are the caller's to log.
    pub fn finish(self) -> crate::error::Result<()> {
        match self.issues.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(Error::Validation {
                code: first.code,
                path: first.path,
                message: first.message,
            }),
        }
    }
}

/// Checks that a JSON value is an object and reports unknown keys.
///
/// `allowed` must be sorted or not; membership is a linear scan (schemas
/// here are small).
pub fn check_unknown_keys(
    list: &mut IssueList,
    path: &str,
    value: &serde_json::Value,
    allowed: &[&str],
) {
    let Some(map) = value.as_object() else {
        list.push(IssueCode::InvalidType, path, "expected an object");
        return;
    };
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            list.push(
                IssueCode::UnrecognizedKeys,
                format!("{path}.{key}"),
                format!("unrecognized key '{key}'"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_codes_serialize_snake_case() {
        let json = serde_json::to_string(&IssueCode::InvalidEnumValue).unwrap();
        assert_eq!(json, "\"invalid_enum_value\"");
    }

    #[test]
    fn degradable_codes_match_policy() {
        assert!(IssueCode::InvalidEnumValue.is_degradable());
        assert!(IssueCode::TooBig.is_degradable());
        assert!(!IssueCode::TooSmall.is_degradable());
        assert!(!IssueCode::MissingField.is_degradable());
    }

    #[test]
    fn finish_surfaces_first_issue() {
        let mut list = IssueList::new();
        list.push(IssueCode::InvalidType, "script", "expected object");
        list.push(IssueCode::TooBig, "script.title", "too long");
        let err = list.finish().unwrap_err();
        match err {
            Error::Validation { code, path, .. } => {
                assert_eq!(code, IssueCode::InvalidType);
                assert_eq!(path, "script");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_reported_with_path() {
        let mut list = IssueList::new();
        let value = serde_json::json!({"known": 1, "mystery": 2});
        check_unknown_keys(&mut list, "seo", &value, &["known"]);
        assert_eq!(list.issues().len(), 1);
        assert_eq!(list.issues()[0].path, "seo.mystery");
    }
}
