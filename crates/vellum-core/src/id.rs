//! Strongly-typed identifiers for vellum entities.
//!
//! All identifiers are:
//! - **Strongly typed**: prevents mixing up different id types at compile time
//! - **Globally unique**: no coordination required for generation
//!
//! Project ids are opaque UUIDs and double as the on-disk directory name for
//! the project's manifest. Trace ids are ULIDs so log lines sort naturally by
//! creation time.
//!
//! # Example
//!
//! ```rust
//! use vellum_core::id::{ProjectId, TraceId};
//!
//! let project = ProjectId::generate();
//! let trace = TraceId::generate();
//!
//! // Ids are different types - this won't compile:
//! // let wrong: ProjectId = trace;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for a content project.
///
/// Generated when an ingested document is accepted; names the project's
/// manifest directory under the projects root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(Uuid);

impl ProjectId {
    /// Generates a new unique project id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a project id from a raw UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid project id '{s}': {e}"),
        })
    }
}

/// A correlation identifier threaded through logs and downstream calls.
///
/// Distinct from the project id. ULID-based so traces sort by creation time
/// without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Ulid);

impl TraceId {
    /// Generates a new unique trace id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a trace id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(i64::try_from(ms).unwrap_or_default())
            .unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TraceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid trace id '{s}': {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids_are_unique() {
        let a = ProjectId::generate();
        let b = ProjectId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn project_id_round_trips_via_display() {
        let id = ProjectId::generate();
        let parsed: ProjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn trace_id_round_trips_via_display() {
        let id = TraceId::generate();
        let parsed: TraceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_project_id_is_rejected() {
        let result: Result<ProjectId> = "not-a-uuid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ProjectId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
