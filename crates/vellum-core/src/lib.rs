//! # vellum-core
//!
//! Core domain types for the vellum content orchestrator.
//!
//! This crate defines the vocabulary shared by every other vellum crate:
//!
//! - **Typed identifiers**: compile-time-distinct project and trace ids
//! - **Error taxonomy**: a closed error enum plus the [`fingerprint`]
//!   classifier that decides degrade / retry / dead-letter
//! - **Manifest model**: the durable, schema-validated per-project record
//! - **Configuration**: environment-driven engine settings
//! - **Observability**: logging bootstrap and span constructors
//!
//! ## Guarantees
//!
//! - **Typed**: a `TraceId` can never be passed where a `ProjectId` is
//!   expected
//! - **Closed**: component boundaries return `Result` variants from this
//!   crate; the fingerprint classifier is the only translator into the
//!   serialisable [`fingerprint::ErrorFingerprint`] form
//! - **Durable-friendly**: every persisted type round-trips through serde
//!   with `snake_case` wire names

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod content;
pub mod cost;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod jsonio;
pub mod manifest;
pub mod observability;
pub mod validate;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use fingerprint::{ErrorFingerprint, FingerprintKind};
pub use id::{ProjectId, TraceId};
pub use manifest::{Manifest, ProjectStatus};
