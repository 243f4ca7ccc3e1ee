//! Error fingerprinting and the degrade decision.
//!
//! The classifier is the single authority that maps failures onto the
//! serialisable fingerprint taxonomy. Components never inspect raw errors to
//! decide policy; they hand them here and act on the fingerprint.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Substrings that identify provider-originated failures when only a
/// message is available (wrapped or foreign errors).
const PROVIDER_MARKERS: &[&str] = &["gemini", "generativelanguage", "googleapis"];

/// Codes that must never trigger model degradation: moving to a cheaper
/// model would mask rate-limit or auth misconfiguration.
const NON_DEGRADABLE_MARKERS: &[&str] = &["429", "401", "403", "quota", "unauthorized"];

/// The category of a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintKind {
    /// A schema validation rejected produced content.
    Validation,
    /// The LLM provider failed or rejected a request.
    ProviderApi,
    /// A network-level failure.
    Network,
    /// A filesystem failure.
    Filesystem,
    /// Anything the classifier could not attribute.
    Unknown,
}

/// A stable, serialisable classification of a failure.
///
/// Fingerprints are persisted into the manifest and must survive restarts,
/// so they carry only owned strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFingerprint {
    /// The failure category.
    pub kind: FingerprintKind,
    /// Category-specific code (`invalid_enum_value`, `429_resource_exhausted`,
    /// `network_error`, `enoent`, `unknown`).
    pub code: String,
    /// Dotted path of the first failing field, for validation failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl ErrorFingerprint {
    fn new(kind: FingerprintKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            path: None,
            message: message.into(),
        }
    }
}

/// Classifies an error into its fingerprint.
///
/// Typed variants map directly; message sniffing is the fallback for
/// failures that arrive as opaque storage or unknown errors.
#[must_use]
pub fn classify(err: &Error) -> ErrorFingerprint {
    match err {
        Error::Validation {
            code,
            path,
            message,
        } => ErrorFingerprint {
            kind: FingerprintKind::Validation,
            code: code.as_str().to_string(),
            path: Some(path.clone()),
            message: message.clone(),
        },

        Error::Provider { status, reason } => {
            let code = match status {
                Some(s) => format!("{s}_{}", slugify(reason)),
                None => slugify(reason),
            };
            ErrorFingerprint::new(FingerprintKind::ProviderApi, code, err.to_string())
        }

        Error::Network { message } => {
            ErrorFingerprint::new(FingerprintKind::Network, "network_error", message.clone())
        }

        Error::Filesystem { code, message, .. } => {
            ErrorFingerprint::new(FingerprintKind::Filesystem, code.clone(), message.clone())
        }

        // Transient fabric conditions surface as provider_api so the retry
        // policy treats them like any other provider hiccup.
        Error::PoolTimeout { .. } => {
            ErrorFingerprint::new(FingerprintKind::ProviderApi, "pool_timeout", err.to_string())
        }
        Error::PoolDraining => {
            ErrorFingerprint::new(FingerprintKind::ProviderApi, "pool_draining", err.to_string())
        }
        Error::Deadline { .. } => ErrorFingerprint::new(
            FingerprintKind::ProviderApi,
            "deadline_exceeded",
            err.to_string(),
        ),
        Error::CircuitOpen { .. } => {
            ErrorFingerprint::new(FingerprintKind::ProviderApi, "circuit_open", err.to_string())
        }
        Error::QueueFull { .. } => {
            ErrorFingerprint::new(FingerprintKind::ProviderApi, "queue_full", err.to_string())
        }
        // The code embeds the final failure so the degrade policy can see
        // rate-limit and auth markers through the wrapper.
        Error::AllModelsFailed { last_error, .. } => ErrorFingerprint::new(
            FingerprintKind::ProviderApi,
            format!("all_models_failed_{}", slugify(last_error)),
            last_error.clone(),
        ),

        other => classify_message(&other.to_string()),
    }
}

/// Message-sniffing fallback for foreign or wrapped errors.
fn classify_message(message: &str) -> ErrorFingerprint {
    let lower = message.to_lowercase();

    if lower.contains("econnrefused")
        || lower.contains("etimedout")
        || lower.contains("network")
        || lower.contains("fetch")
    {
        return ErrorFingerprint::new(FingerprintKind::Network, "network_error", message);
    }

    for code in ["enoent", "eacces", "eperm", "eexist", "enotdir"] {
        if lower.contains(code) {
            return ErrorFingerprint::new(FingerprintKind::Filesystem, code, message);
        }
    }

    if PROVIDER_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorFingerprint::new(FingerprintKind::ProviderApi, slugify(&lower), message);
    }

    ErrorFingerprint::new(FingerprintKind::Unknown, "unknown", message)
}

/// Lowercases a reason string into a stable code fragment.
fn slugify(reason: &str) -> String {
    let mut out = String::with_capacity(reason.len());
    for ch in reason.trim().chars().take(64) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

/// Decides whether a failure should advance the model fallback chain.
///
/// True iff unused models remain and either the validation issue is in the
/// degradable set, or the provider code carries none of the rate-limit /
/// auth markers.
#[must_use]
pub fn should_degrade(fp: &ErrorFingerprint, used_models: usize, chain_len: usize) -> bool {
    if used_models >= chain_len {
        return false;
    }
    match fp.kind {
        FingerprintKind::Validation => matches!(
            fp.code.as_str(),
            "invalid_enum_value"
                | "too_big"
                | "invalid_type"
                | "unrecognized_keys"
                | "invalid_string"
                | "invalid_literal"
        ),
        FingerprintKind::ProviderApi => !NON_DEGRADABLE_MARKERS
            .iter()
            .any(|marker| fp.code.contains(marker)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::IssueCode;

    #[test]
    fn validation_errors_carry_code_and_path() {
        let err = Error::Validation {
            code: IssueCode::InvalidEnumValue,
            path: "script.segments[0].visual_hint".into(),
            message: "'b_roll' is not a known visual hint".into(),
        };
        let fp = classify(&err);
        assert_eq!(fp.kind, FingerprintKind::Validation);
        assert_eq!(fp.code, "invalid_enum_value");
        assert_eq!(fp.path.as_deref(), Some("script.segments[0].visual_hint"));
    }

    #[test]
    fn provider_errors_encode_status_and_reason() {
        let err = Error::Provider {
            status: Some(429),
            reason: "Resource Exhausted".into(),
        };
        let fp = classify(&err);
        assert_eq!(fp.kind, FingerprintKind::ProviderApi);
        assert_eq!(fp.code, "429_resource_exhausted");
    }

    #[test]
    fn message_sniffing_finds_network_markers() {
        let err = Error::storage("connect ECONNREFUSED 127.0.0.1:443");
        let fp = classify(&err);
        assert_eq!(fp.kind, FingerprintKind::Network);
        assert_eq!(fp.code, "network_error");
    }

    #[test]
    fn message_sniffing_finds_filesystem_markers() {
        let err = Error::storage("ENOENT: no such file or directory");
        let fp = classify(&err);
        assert_eq!(fp.kind, FingerprintKind::Filesystem);
        assert_eq!(fp.code, "enoent");
    }

    #[test]
    fn unattributable_errors_are_unknown() {
        let err = Error::storage("something odd happened");
        let fp = classify(&err);
        assert_eq!(fp.kind, FingerprintKind::Unknown);
        assert_eq!(fp.code, "unknown");
    }

    #[test]
    fn degradable_validation_codes_degrade() {
        let fp = ErrorFingerprint {
            kind: FingerprintKind::Validation,
            code: "invalid_enum_value".into(),
            path: None,
            message: String::new(),
        };
        assert!(should_degrade(&fp, 0, 3));
        // Chain exhausted.
        assert!(!should_degrade(&fp, 3, 3));
    }

    #[test]
    fn rate_limit_and_auth_never_degrade() {
        for code in ["429_resource_exhausted", "401_unauthorized", "quota_exceeded"] {
            let fp = ErrorFingerprint {
                kind: FingerprintKind::ProviderApi,
                code: code.to_string(),
                path: None,
                message: String::new(),
            };
            assert!(!should_degrade(&fp, 0, 3), "{code} must not degrade");
        }
    }

    #[test]
    fn transient_provider_codes_may_degrade() {
        let fp = ErrorFingerprint {
            kind: FingerprintKind::ProviderApi,
            code: "500_internal".into(),
            path: None,
            message: String::new(),
        };
        assert!(should_degrade(&fp, 1, 3));
    }
}
