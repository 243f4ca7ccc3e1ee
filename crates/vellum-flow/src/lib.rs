//! # vellum-flow
//!
//! The orchestration domain for vellum, composing the call fabric into a
//! document-to-manifest pipeline:
//!
//! - **Ingress**: stable-write file watching with language pre-analysis
//! - **Dedup**: content-hash index with size-first negative lookups
//! - **State machine**: durable manifests, heartbeat-driven stale recovery,
//!   degraded retry and a terminal dead-letter state
//! - **Trend authority**: consecutive-window promotion with time decay
//! - **Pipeline driver**: nine ordered stages threaded by a trace id
//!
//! Data flow: watcher → hash index → state machine `create` → driver.
//! Every stage calls the fabric; failures funnel through the state
//! machine's error handler, which degrades, retries or dead-letters.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod content;
pub mod hash_index;
pub mod ingress;
pub mod manifest_store;
pub mod metrics;
pub mod pipeline;
pub mod progress;
pub mod state;
pub mod trend;

pub use hash_index::{HashIndex, ProcessedCheck};
pub use ingress::{IngressWatcher, ReadyDocument};
pub use manifest_store::ManifestStore;
pub use pipeline::PipelineDriver;
pub use progress::{ProgressTracker, Stage};
pub use state::StateMachine;
pub use trend::{TrendSource, TrendStore};
