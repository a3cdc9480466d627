//! Interfaces to external collaborators.
//!
//! Shader generators, compiler backends, reducers and image comparators live
//! outside this crate. They are reached through the narrow traits below and
//! exchange files and streams only.

pub mod compare;
pub mod generate;
pub mod process;
pub mod simplify;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{ArtifactName, Comparison, Complexity, Payload, ShaderJob};
use crate::error::Error;
use crate::store::{Artifact, ArtifactStore, PayloadFile};

pub use compare::ExactComparator;
pub use generate::{GeneratorConfig, ProcessGenerator};
pub use process::{BackendConfig, ProcessBackend};
pub use simplify::LineSimplifier;

/// Shader files plus what is known about their expected behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub files: Vec<PayloadFile>,

    /// Reference output a correct backend must produce
    pub expected_output: Option<PayloadFile>,

    pub seed: Option<u64>,
    pub generator: String,
}

impl TestCase {
    pub fn new(generator: impl Into<String>, files: Vec<PayloadFile>) -> Self {
        Self {
            files,
            expected_output: None,
            seed: None,
            generator: generator.into(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_expected_output(mut self, expected: PayloadFile) -> Self {
        self.expected_output = Some(expected);
        self
    }

    /// Size of the shader files; the expected output does not count
    pub fn complexity(&self) -> Complexity {
        Complexity::of_files(self.files.iter().map(|f| f.contents.as_slice()))
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    /// `shader_job` payload describing this case
    pub fn to_shader_job(&self) -> ShaderJob {
        ShaderJob {
            files: self.file_names(),
            seed: self.seed,
            generator: self.generator.clone(),
            complexity: self.complexity(),
            expected_output: self.expected_output.as_ref().map(|f| f.name.clone()),
        }
    }

    /// Every file to store with the case
    pub fn payload_files(&self) -> Vec<PayloadFile> {
        let mut files = self.files.clone();
        files.extend(self.expected_output.clone());
        files
    }

    /// Load a stored test case or reduction step
    pub async fn load(store: &ArtifactStore, artifact: &Artifact) -> crate::error::Result<Self> {
        let (names, expected, seed) = match &artifact.metadata.payload {
            Payload::ShaderJob(job) => (&job.files, &job.expected_output, job.seed),
            Payload::ReductionStep(step) => (&step.files, &step.expected_output, None),
            _ => {
                return Err(Error::schema(
                    &artifact.name,
                    format!("a {} artifact is not a test case", artifact.metadata.kind()),
                ))
            }
        };

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            files.push(PayloadFile::new(
                name.clone(),
                store.read_payload(&artifact.name, name).await?,
            ));
        }
        let expected_output = match expected {
            Some(name) => Some(PayloadFile::new(
                name.clone(),
                store.read_payload(&artifact.name, name).await?,
            )),
            None => None,
        };

        Ok(Self {
            files,
            expected_output,
            seed,
            generator: artifact.metadata.provenance.tool.clone(),
        })
    }
}

/// One backend invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub test_case: ArtifactName,

    /// Directory holding the test case files
    pub test_dir: PathBuf,
    pub files: Vec<String>,

    /// Scratch directory the backend runs in
    pub work_dir: PathBuf,
}

/// What a backend produced
#[derive(Debug, Clone, Default)]
pub struct BackendOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,

    /// Output files collected from the work directory
    pub outputs: Vec<PayloadFile>,
}

impl BackendOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Produces new test cases
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, seed: u64) -> Result<TestCase>;
}

/// Proposes smaller variants of a failing test case
#[async_trait]
pub trait Simplifier: Send + Sync {
    fn name(&self) -> &str;

    /// Candidate number `attempt` (0-based, counted since the last accept);
    /// `None` once there is nothing left to try
    async fn simplify(&self, candidate: &TestCase, attempt: u32) -> Result<Option<TestCase>>;
}

/// A compiler, driver or tool that runs test cases.
///
/// An `Err` means the backend could not be run at all. Crashes are an
/// `Ok` output with a non-zero exit code.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Backends that only prepare the case (e.g. a front-end compile)
    fn is_preprocess(&self) -> bool {
        false
    }

    /// Per-backend wall-clock limit
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Output file compared with the test case's expected output
    fn output_file(&self) -> Option<&str> {
        None
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<BackendOutput>;
}

/// Decides whether an output matches its expectation
pub trait Comparator: Send + Sync {
    fn compare(&self, expected: &[u8], actual: &[u8]) -> Comparison;
}
