//! Test case generation through an external generator command.

use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{Generator, TestCase};
use crate::domain::name::validate_segment;
use crate::store::PayloadFile;

/// Generator command line, as read from `config.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub name: String,
    pub program: String,

    /// Arguments; `{seed}` and `{out_dir}` are substituted
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// File in the output directory holding the reference output, if any
    #[serde(default)]
    pub expected_output: Option<String>,
}

/// Runs a generator that writes shader files into a fresh directory
#[derive(Debug, Clone)]
pub struct ProcessGenerator {
    config: GeneratorConfig,
}

impl ProcessGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Generator for ProcessGenerator {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn generate(&self, seed: u64) -> Result<TestCase> {
        let out_dir = tempfile::Builder::new()
            .prefix("generate-")
            .tempdir()
            .context("Failed to create generator output directory")?;
        let out = out_dir.path().display().to_string();
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| a.replace("{seed}", &seed.to_string()).replace("{out_dir}", &out))
            .collect();

        let output = Command::new(&self.config.program)
            .args(&args)
            .envs(&self.config.env)
            .current_dir(out_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn generator '{}'", self.config.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Generator '{}' failed for seed {} with exit code {}: {}",
                self.config.name,
                seed,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let mut files = Vec::new();
        let mut expected = None;
        let mut entries = tokio::fs::read_dir(out_dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_segment(&name).is_err() {
                continue;
            }
            let file = PayloadFile::new(name.clone(), tokio::fs::read(entry.path()).await?);
            if self.config.expected_output.as_deref() == Some(name.as_str()) {
                expected = Some(file);
            } else {
                files.push(file);
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        if files.is_empty() {
            anyhow::bail!(
                "Generator '{}' produced no files for seed {}",
                self.config.name,
                seed
            );
        }

        let mut case = TestCase::new(self.config.name.clone(), files).with_seed(seed);
        case.expected_output = expected;
        Ok(case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(script: &str) -> GeneratorConfig {
        GeneratorConfig {
            name: "gen".to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            expected_output: Some("expected.png".to_string()),
        }
    }

    #[tokio::test]
    async fn test_collects_generated_files() {
        let generator = ProcessGenerator::new(config(
            "echo 'seed {seed}' > {out_dir}/b.frag; echo x > a.vert; printf png > expected.png",
        ));

        let case = generator.generate(42).await.unwrap();
        assert_eq!(case.seed, Some(42));
        assert_eq!(case.file_names(), vec!["a.vert", "b.frag"]);
        assert_eq!(case.files[1].contents, b"seed 42\n");
        assert_eq!(case.expected_output, Some(PayloadFile::new("expected.png", "png")));
    }

    #[tokio::test]
    async fn test_failing_generator_is_an_error() {
        let generator = ProcessGenerator::new(config("exit 1"));
        assert!(generator.generate(1).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_output_is_an_error() {
        let generator = ProcessGenerator::new(config("true"));
        assert!(generator.generate(1).await.is_err());
    }
}
