//! shadertriage - Artifact store and fuzz/reduce orchestration for shader
//! compiler testing
//!
//! Generates shader test cases, runs them through compiler backends,
//! deduplicates the failures by signature and reduces them to minimal
//! reproducers.
//!
//! # Architecture
//!
//! The system is built around an append-only artifact store:
//! - Every test case, result, reduction step and bucket is an artifact
//! - Artifacts are published atomically and never edited in place; only
//!   their metadata gains new revisions
//! - Result names are derived from their inputs, so re-running a session
//!   skips work that is already recorded
//! - Reduction chains persist every step and resume after a crash
//!
//! # Modules
//!
//! - `store`: Filesystem artifact store
//! - `domain`: Names, metadata records, run results, signatures
//! - `core`: Orchestrator, dedup engine, reducer, fuzz session, journal
//! - `adapters`: Generator, simplifier, backend and comparator interfaces
//! - `config`: `.shadertriage/config.yaml` and environment
//! - `telemetry`: Tracing setup
//!
//! # Usage
//!
//! ```rust,ignore
//! shadertriage::telemetry::init();
//!
//! let config = shadertriage::config::config()?;
//! let session = FuzzSession::from_config("nightly", config).await?;
//! let summary = session.run(0..1000).await;
//! ```

pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod store;
pub mod telemetry;

// Re-export main types at crate root for convenience
pub use crate::core::{FuzzSession, Orchestrator, ReductionDriver, SignatureEngine};
pub use domain::{ArtifactName, Metadata, RunResult, Signature};
pub use error::{Error, Result};
pub use store::{Artifact, ArtifactStore, CreateMode, PayloadFile};
