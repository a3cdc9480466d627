//! Backends run as isolated subprocesses.
//!
//! The configured command line is run in the job's scratch directory with
//! piped output. The child is killed when the invocation future is dropped,
//! which is how the orchestrator's timeout terminates it.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{Backend, BackendOutput, Invocation};
use crate::store::PayloadFile;

/// Command line of one backend, as read from `config.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend name; also the leaf of result artifact names
    pub name: String,

    /// Program to run
    pub program: String,

    /// Arguments; `{test_dir}`, `{work_dir}` and `{file}` are substituted and
    /// an argument of exactly `{files}` expands to every test file
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Overrides the default job timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Only prepares the case; a crash here is a host crash
    #[serde(default)]
    pub preprocess: bool,

    /// File the backend writes to its work directory, compared with the
    /// expected output
    #[serde(default)]
    pub output_file: Option<String>,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_seconds: None,
            preprocess: false,
            output_file: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Backend running a configured command line
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    config: BackendConfig,
}

impl ProcessBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn expand_args(&self, invocation: &Invocation) -> Vec<String> {
        let test_dir = invocation.test_dir.display().to_string();
        let work_dir = invocation.work_dir.display().to_string();
        let first_file = invocation
            .files
            .first()
            .map(|f| invocation.test_dir.join(f).display().to_string())
            .unwrap_or_default();

        let mut expanded = Vec::with_capacity(self.config.args.len());
        for arg in &self.config.args {
            if arg == "{files}" {
                expanded.extend(
                    invocation
                        .files
                        .iter()
                        .map(|f| invocation.test_dir.join(f).display().to_string()),
                );
                continue;
            }
            expanded.push(
                arg.replace("{test_dir}", &test_dir)
                    .replace("{work_dir}", &work_dir)
                    .replace("{file}", &first_file),
            );
        }
        expanded
    }

    async fn collect_output(&self, work_dir: &Path) -> Result<Vec<PayloadFile>> {
        let Some(file) = &self.config.output_file else {
            return Ok(Vec::new());
        };

        let path = work_dir.join(file);
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(vec![PayloadFile::new(file.clone(), contents)]),
            // A crashed backend often writes nothing
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read backend output: {}", path.display()))
            }
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_preprocess(&self) -> bool {
        self.config.preprocess
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout_seconds.map(Duration::from_secs)
    }

    fn output_file(&self) -> Option<&str> {
        self.config.output_file.as_deref()
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<BackendOutput> {
        let args = self.expand_args(invocation);

        let child = Command::new(&self.config.program)
            .args(&args)
            .envs(&self.config.env)
            .current_dir(&invocation.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn backend '{}' ({})",
                    self.config.name, self.config.program
                )
            })?;

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for backend '{}'", self.config.name))?;

        let outputs = self.collect_output(&invocation.work_dir).await?;

        Ok(BackendOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ArtifactName;
    use tempfile::TempDir;

    fn invocation(temp: &TempDir) -> Invocation {
        let test_dir = temp.path().join("case");
        let work_dir = temp.path().join("work");
        std::fs::create_dir_all(&test_dir).unwrap();
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::write(test_dir.join("a.frag"), "a").unwrap();
        std::fs::write(test_dir.join("b.frag"), "b").unwrap();

        Invocation {
            test_case: ArtifactName::parse("case").unwrap(),
            test_dir,
            files: vec!["a.frag".to_string(), "b.frag".to_string()],
            work_dir,
        }
    }

    #[test]
    fn test_placeholder_expansion() {
        let temp = TempDir::new().unwrap();
        let inv = invocation(&temp);
        let backend = ProcessBackend::new(
            BackendConfig::new("glslang", "glslangValidator")
                .with_args(["-o", "{work_dir}/out.spv", "{file}", "{files}"]),
        );

        let args = backend.expand_args(&inv);
        let a = inv.test_dir.join("a.frag").display().to_string();
        let b = inv.test_dir.join("b.frag").display().to_string();
        assert_eq!(
            args,
            vec![
                "-o".to_string(),
                format!("{}/out.spv", inv.work_dir.display()),
                a.clone(),
                a,
                b,
            ]
        );
    }

    #[tokio::test]
    async fn test_captures_exit_code_and_streams() {
        let temp = TempDir::new().unwrap();
        let backend = ProcessBackend::new(
            BackendConfig::new("sh", "sh").with_args(["-c", "echo out; echo err >&2; exit 3"]),
        );

        let output = backend.invoke(&invocation(&temp)).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.succeeded());
    }

    #[tokio::test]
    async fn test_collects_declared_output() {
        let temp = TempDir::new().unwrap();
        let mut config = BackendConfig::new("render", "sh").with_args(["-c", "printf img > out.png"]);
        config.output_file = Some("out.png".to_string());
        let backend = ProcessBackend::new(config);

        let output = backend.invoke(&invocation(&temp)).await.unwrap();
        assert!(output.succeeded());
        assert_eq!(output.outputs, vec![PayloadFile::new("out.png", "img")]);
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let temp = TempDir::new().unwrap();
        let backend = ProcessBackend::new(BackendConfig::new("ghost", "/nonexistent/backend"));

        assert!(backend.invoke(&invocation(&temp)).await.is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
name: spirv-opt
program: spirv-opt
args: ["{file}", "-O"]
timeout_seconds: 30
preprocess: true
"#;
        let config: BackendConfig = serde_yaml::from_str(yaml).unwrap();
        let backend = ProcessBackend::new(config);
        assert_eq!(backend.name(), "spirv-opt");
        assert!(backend.is_preprocess());
        assert_eq!(backend.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(backend.output_file(), None);
    }
}
