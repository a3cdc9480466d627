//! Core orchestration logic.
//!
//! This module contains:
//! - Journal: Append-only job event log
//! - Limits: Retry and reduction budgets
//! - Dedup: Failure signatures and buckets
//! - Orchestrator: Worker pool running jobs against backends
//! - Reducer: Resumable reduction chains
//! - Fuzz: The generate/run/triage/reduce loop

pub mod dedup;
pub mod fuzz;
pub mod journal;
pub mod limits;
pub mod orchestrator;
pub mod reducer;

// Re-export commonly used types
pub use dedup::{is_improvement, signature_of, BucketDecision, Contender, SignatureEngine};
pub use fuzz::{FindingReport, FuzzSession, IterationReport, SessionSummary};
pub use journal::{JobEvent, JobEventType, JobRecord, Journal};
pub use limits::{ReductionLimits, RetryPolicy};
pub use orchestrator::{Job, JobReport, Orchestrator};
pub use reducer::{ReductionDriver, ReductionOutcome, ReductionRequest};
