//! Versioned artifact metadata.
//!
//! Every artifact directory holds one `metadata.json` record: a common
//! envelope (schema version, kind, status, provenance, timestamps, revision)
//! around a kind-specific payload.
//!
//! Decoding is forward-compatible. Unknown fields are ignored, unknown kinds
//! are kept as [`Payload::Unrecognized`], and only a different major version
//! or a structurally broken record is rejected.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::name::ArtifactName;
use super::run::{Comparison, JobState, Outcome};
use super::signature::Signature;
use crate::error::Error;

/// Major version understood by this crate
pub const SCHEMA_MAJOR: u32 = 1;

/// Minor version written by this crate
pub const SCHEMA_MINOR: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub fn current() -> Self {
        Self {
            major: SCHEMA_MAJOR,
            minor: SCHEMA_MINOR,
        }
    }
}

/// Lifecycle status of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    Interesting,
}

impl Default for Status {
    fn default() -> Self {
        Self::Pending
    }
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interesting)
    }
}

/// Where an artifact came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Parent artifact; `None` for roots
    pub parent: Option<ArtifactName>,

    /// Tool that produced the artifact
    pub tool: String,

    /// Tool parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Provenance {
    pub fn root(tool: impl Into<String>) -> Self {
        Self {
            parent: None,
            tool: tool.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn derived(parent: ArtifactName, tool: impl Into<String>) -> Self {
        Self {
            parent: Some(parent),
            tool: tool.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(key.into(), value.to_string());
        self
    }
}

/// Size metric used to rank reproducers: fewer lines first, then fewer bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Complexity {
    pub lines: u64,
    pub bytes: u64,
}

impl Complexity {
    pub fn of_files<'a>(files: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut complexity = Self::default();
        for content in files {
            complexity.bytes += content.len() as u64;
            complexity.lines += content
                .split(|b| *b == b'\n')
                .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
                .count() as u64;
        }
        complexity
    }
}

/// A shader test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderJob {
    /// Payload files making up the test case
    pub files: Vec<String>,

    #[serde(default)]
    pub seed: Option<u64>,

    pub generator: String,

    pub complexity: Complexity,

    /// Payload file holding the expected backend output, if known
    #[serde(default)]
    pub expected_output: Option<String>,
}

/// Outcome of running a test case on one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub backend: String,
    pub state: JobState,
    pub outcome: Outcome,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub attempts: u32,

    /// Log payload files (stdout, stderr, combined)
    #[serde(default)]
    pub logs: Vec<String>,

    /// Output payload files captured from the backend
    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(default)]
    pub comparison: Option<Comparison>,

    #[serde(default)]
    pub signature: Option<Signature>,

    /// Infra failure cause
    #[serde(default)]
    pub cause: Option<String>,
}

/// Progress of a reduction chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionState {
    Proposing,
    Converged,
    ExhaustedBudget,
}

impl ReductionState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Proposing)
    }
}

/// Chain record of one reduction phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionRecord {
    /// Test case being reduced
    pub target: ArtifactName,
    pub backend: String,
    pub phase: String,

    /// Signature every accepted candidate must reproduce
    pub signature: Signature,

    pub state: ReductionState,

    /// Best reproducer so far (the target until a step is accepted)
    pub best: ArtifactName,
    pub best_complexity: Complexity,

    /// Set when `best` was superseded and garbage-collected
    #[serde(default)]
    pub best_collected: bool,

    pub steps_taken: u32,
    pub consecutive_rejects: u32,
    pub max_steps: u32,
    pub max_consecutive_rejects: u32,
}

/// Why a candidate was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Passed,
    DifferentSignature,
    NotSmaller,
    InfraError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum Verdict {
    Pending,
    Accepted,
    Rejected { reason: RejectReason },
}

/// One candidate in a reduction chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionStep {
    /// 1-based position in the chain
    pub index: u32,

    /// Consecutive-reject count when this candidate was proposed
    pub attempt: u32,

    pub files: Vec<String>,

    /// Expected output carried over from the target
    #[serde(default)]
    pub expected_output: Option<String>,

    pub complexity: Complexity,
    pub verdict: Verdict,

    #[serde(default)]
    pub observed: Option<Signature>,

    #[serde(default)]
    pub result: Option<ArtifactName>,
}

/// Dedup bucket for one signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub signature: Signature,
    pub representative: ArtifactName,
    pub representative_complexity: Complexity,
    pub representative_discovered_at: DateTime<Utc>,

    /// Result artifacts filed under this signature, in arrival order
    #[serde(default)]
    pub members: Vec<ArtifactName>,

    /// Former representatives awaiting garbage collection
    #[serde(default)]
    pub superseded: Vec<ArtifactName>,
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ShaderJob(ShaderJob),
    TestResult(TestResult),
    Reduction(ReductionRecord),
    ReductionStep(ReductionStep),
    Bucket(BucketRecord),

    /// A kind written by a newer version; preserved verbatim
    Unrecognized { kind: String, payload: Value },
}

impl Payload {
    pub fn kind(&self) -> &str {
        match self {
            Self::ShaderJob(_) => "shader_job",
            Self::TestResult(_) => "test_result",
            Self::Reduction(_) => "reduction",
            Self::ReductionStep(_) => "reduction_step",
            Self::Bucket(_) => "bucket",
            Self::Unrecognized { kind, .. } => kind,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::ShaderJob(p) => serde_json::to_value(p),
            Self::TestResult(p) => serde_json::to_value(p),
            Self::Reduction(p) => serde_json::to_value(p),
            Self::ReductionStep(p) => serde_json::to_value(p),
            Self::Bucket(p) => serde_json::to_value(p),
            Self::Unrecognized { payload, .. } => Ok(payload.clone()),
        }
    }

    fn from_parts(kind: &str, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            "shader_job" => Self::ShaderJob(serde_json::from_value(value)?),
            "test_result" => Self::TestResult(serde_json::from_value(value)?),
            "reduction" => Self::Reduction(serde_json::from_value(value)?),
            "reduction_step" => Self::ReductionStep(serde_json::from_value(value)?),
            "bucket" => Self::Bucket(serde_json::from_value(value)?),
            other => Self::Unrecognized {
                kind: other.to_string(),
                payload: value,
            },
        })
    }
}

/// On-disk shape of a metadata record
#[derive(Serialize, Deserialize)]
struct Envelope {
    schema: SchemaVersion,
    kind: String,
    status: Status,
    provenance: Provenance,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    revision: u32,
    #[serde(default)]
    payload: Value,
}

/// A full metadata record
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub schema: SchemaVersion,
    pub status: Status,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Incremented by every metadata update
    pub revision: u32,

    pub payload: Payload,
}

impl Metadata {
    pub fn new(payload: Payload, provenance: Provenance) -> Self {
        let now = Utc::now();
        Self {
            schema: SchemaVersion::current(),
            status: Status::Pending,
            provenance,
            created_at: now,
            updated_at: now,
            revision: 0,
            payload,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    /// Encode as pretty JSON; deterministic for a given record
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let envelope = Envelope {
            schema: self.schema,
            kind: self.payload.kind().to_string(),
            status: self.status,
            provenance: self.provenance.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            revision: self.revision,
            payload: self.payload.to_value()?,
        };
        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    /// Decode a record; `artifact` only labels errors
    pub fn decode(bytes: &[u8], artifact: &str) -> Result<Self, Error> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| Error::schema(artifact, e))?;

        if envelope.schema.major != SCHEMA_MAJOR {
            return Err(Error::schema(
                artifact,
                format!(
                    "unsupported schema version {}.{} (supported major: {})",
                    envelope.schema.major, envelope.schema.minor, SCHEMA_MAJOR
                ),
            ));
        }

        let payload = Payload::from_parts(&envelope.kind, envelope.payload).map_err(|e| {
            Error::schema(artifact, format!("invalid {} payload: {}", envelope.kind, e))
        })?;

        Ok(Self {
            schema: envelope.schema,
            status: envelope.status,
            provenance: envelope.provenance,
            created_at: envelope.created_at,
            updated_at: envelope.updated_at,
            revision: envelope.revision,
            payload,
        })
    }

    pub fn as_shader_job(&self) -> Option<&ShaderJob> {
        match &self.payload {
            Payload::ShaderJob(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_test_result(&self) -> Option<&TestResult> {
        match &self.payload {
            Payload::TestResult(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_reduction(&self) -> Option<&ReductionRecord> {
        match &self.payload {
            Payload::Reduction(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_reduction_step(&self) -> Option<&ReductionStep> {
        match &self.payload {
            Payload::ReductionStep(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_bucket(&self) -> Option<&BucketRecord> {
        match &self.payload {
            Payload::Bucket(p) => Some(p),
            _ => None,
        }
    }
}
