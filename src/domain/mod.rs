//! Domain types for the shadertriage engine.
//!
//! This module contains the core data structures:
//! - ArtifactName: Hierarchical artifact addresses
//! - Metadata: Versioned artifact records and their payloads
//! - Signature: Failure fingerprints used for deduplication
//! - Run: Job states and run results

pub mod metadata;
pub mod name;
pub mod run;
pub mod signature;

// Re-export commonly used types
pub use metadata::{
    BucketRecord, Complexity, Metadata, Payload, Provenance, ReductionRecord, ReductionState,
    ReductionStep, RejectReason, SchemaVersion, ShaderJob, Status, TestResult, Verdict,
};
pub use name::ArtifactName;
pub use run::{Comparison, JobState, Outcome, RunResult};
pub use signature::{signature_from_log, FailureClass, Signature};
