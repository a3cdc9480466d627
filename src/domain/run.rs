//! Job state machine and run results.
//!
//! A job is one execution of a test case against one backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::name::ArtifactName;
use super::signature::Signature;
use crate::error::Error;

/// State of a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    TimedOut,
    Crashed,
    Errored,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::Crashed | Self::Errored
        )
    }

    /// Validate and perform a transition.
    ///
    /// `Running → Running` is allowed so that an infra retry can be recorded
    /// without leaving the running state.
    pub fn transition(self, next: JobState) -> Result<JobState, Error> {
        let allowed = match (self, next) {
            (Self::Queued, Self::Running) => true,
            (Self::Running, Self::Running) => true,
            (Self::Running, n) if n.is_terminal() => true,
            // Launch failures can be recorded before the job ever ran
            (Self::Queued, Self::Errored) => true,
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Queued
    }
}

/// Classified outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Ran to completion and matched expectations
    Pass,

    /// Backend exited non-zero
    Crash,

    /// A preprocess-only backend failed to prepare the case
    HostCrash,

    /// Exceeded the wall-clock limit
    Timeout,

    /// Output differed from the expected output
    WrongImage,

    /// The backend could not be launched
    InfraError,
}

impl Outcome {
    /// Whether this outcome is a potential bug worth triaging
    pub fn is_finding(&self) -> bool {
        matches!(
            self,
            Self::Crash | Self::HostCrash | Self::Timeout | Self::WrongImage
        )
    }
}

/// Result of comparing an output against its expectation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Match,
    Mismatch,
    Error,
}

/// Everything observed about one job
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Name of the stored result artifact
    pub artifact: ArtifactName,

    /// The test case that was run
    pub test_case: ArtifactName,

    pub backend: String,
    pub state: JobState,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub comparison: Option<Comparison>,
    pub signature: Option<Signature>,
    pub duration: Duration,
    pub attempts: u32,

    /// Infra failure cause, if any
    pub cause: Option<String>,

    /// True when the result was already in the store
    pub reused: bool,
}

impl RunResult {
    pub fn is_finding(&self) -> bool {
        self.outcome.is_finding()
    }

    /// Combined log used for signature extraction
    pub fn log(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}
