//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use shadertriage::adapters::{Backend, BackendOutput, Generator, Invocation, TestCase};
use shadertriage::domain::{Metadata, Payload, Provenance};
use shadertriage::{ArtifactName, ArtifactStore, CreateMode, PayloadFile};

pub const SHADER: &str = "shader.frag";

/// Lines a case must keep to reproduce the compile error
pub const MARKERS: [&str; 3] = ["MARKER_A();", "MARKER_B();", "MARKER_C();"];

/// Twelve lines, three of them essential
pub fn seed_shader() -> String {
    [
        "#version 310 es",
        "precision highp float;",
        "MARKER_A();",
        "float a = 1.0;",
        "float b = 2.0;",
        "MARKER_B();",
        "vec4 c = vec4(a);",
        "",
        "void main() {",
        "  c = c * b;",
        "MARKER_C();",
        "}",
        "// trailing comment",
    ]
    .join("\n")
        + "\n"
}

pub async fn create_test_store() -> (ArtifactStore, TempDir) {
    let temp = TempDir::new().unwrap();
    let store = ArtifactStore::open(temp.path().join("store")).await.unwrap();
    (store, temp)
}

pub fn name(raw: &str) -> ArtifactName {
    ArtifactName::parse(raw).unwrap()
}

/// Store `text` as a test case at exactly `at`
pub async fn create_case(store: &ArtifactStore, at: &str, text: &str) -> ArtifactName {
    let case = TestCase::new("fixture", vec![PayloadFile::new(SHADER, text)]);
    let metadata = Metadata::new(
        Payload::ShaderJob(case.to_shader_job()),
        Provenance::root("fixture"),
    );
    store
        .create(&name(at), metadata, case.payload_files(), CreateMode::Exact)
        .await
        .unwrap()
        .name
}

/// In-process compiler model.
///
/// All three markers: compile error. Markers A and B only: link error.
/// Anything else compiles.
pub struct MarkerBackend {
    name: String,
    pub calls: AtomicU32,

    /// Panic on this call (1-based), simulating a crashed driver process
    panic_on_call: Option<u32>,
}

impl MarkerBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            panic_on_call: None,
        }
    }

    pub fn panicking_on_call(name: &str, call: u32) -> Self {
        Self {
            panic_on_call: Some(call),
            ..Self::new(name)
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MarkerBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<BackendOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on_call == Some(call) {
            panic!("driver crashed on call {}", call);
        }

        let mut text = String::new();
        for file in &invocation.files {
            text.push_str(&tokio::fs::read_to_string(invocation.test_dir.join(file)).await?);
        }
        let has = |marker: &str| text.contains(marker);

        let (exit_code, stderr) = if MARKERS.iter().all(|m| has(m)) {
            (1, "ERROR: 0:3: Shader compilation failed\n")
        } else if has(MARKERS[0]) && has(MARKERS[1]) {
            (1, "Failed to link shaders\n")
        } else {
            (0, "")
        };

        Ok(BackendOutput {
            exit_code: Some(exit_code),
            stdout: format!("compiled {} files\n", invocation.files.len()),
            stderr: stderr.to_string(),
            outputs: Vec::new(),
        })
    }
}

/// Generator handing out fixed shaders by seed
pub struct FixedGenerator {
    pub shaders: Vec<String>,
}

#[async_trait]
impl Generator for FixedGenerator {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn generate(&self, seed: u64) -> Result<TestCase> {
        let text = self
            .shaders
            .get(seed as usize)
            .ok_or_else(|| anyhow::anyhow!("no shader for seed {}", seed))?;
        Ok(TestCase::new("fixed", vec![PayloadFile::new(SHADER, text.clone())]).with_seed(seed))
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}

/// Compiler model that fails with `stderr` whenever `marker` is present
pub struct SingleMarkerBackend {
    name: String,
    marker: &'static str,
    stderr: &'static str,
    pub calls: AtomicU32,
}

impl SingleMarkerBackend {
    pub fn new(name: &str, marker: &'static str, stderr: &'static str) -> Self {
        Self {
            name: name.to_string(),
            marker,
            stderr,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for SingleMarkerBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<BackendOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut text = String::new();
        for file in &invocation.files {
            text.push_str(&tokio::fs::read_to_string(invocation.test_dir.join(file)).await?);
        }
        let (exit_code, stderr) = if text.contains(self.marker) {
            (1, self.stderr)
        } else {
            (0, "")
        };

        Ok(BackendOutput {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            outputs: Vec::new(),
        })
    }
}

/// Backend "compile" fails on `MARKER_A`, backend "link" on `MARKER_B`
pub fn split_backends() -> (Arc<SingleMarkerBackend>, Arc<SingleMarkerBackend>) {
    (
        Arc::new(SingleMarkerBackend::new(
            "compile",
            MARKERS[0],
            "ERROR: 0:3: Shader compilation failed\n",
        )),
        Arc::new(SingleMarkerBackend::new("link", MARKERS[1], "Failed to link shaders\n")),
    )
}
