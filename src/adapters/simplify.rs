//! Generic line-deletion simplifier.

use anyhow::Result;
use async_trait::async_trait;

use super::{Simplifier, TestCase};
use crate::store::PayloadFile;

/// Delta-debugging over non-blank lines of every shader file.
///
/// Candidates remove a contiguous chunk of lines, halving the chunk size
/// from half the case down to single lines. Blank lines are dropped from
/// every candidate. Deterministic for a given case and attempt.
#[derive(Debug, Clone, Default)]
pub struct LineSimplifier {
    name: Option<String>,
}

impl LineSimplifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same algorithm under a phase-specific name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// (chunk size, chunk index) of the `attempt`-th candidate over `units` lines
fn chunk_for_attempt(units: usize, attempt: u32) -> Option<(usize, usize)> {
    if units == 0 {
        return None;
    }

    let mut remaining = attempt as usize;
    let mut size = (units / 2).max(1);
    loop {
        let chunks = units.div_ceil(size);
        if remaining < chunks {
            return Some((size, remaining));
        }
        remaining -= chunks;
        if size == 1 {
            return None;
        }
        size = (size / 2).max(1);
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

#[async_trait]
impl Simplifier for LineSimplifier {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("line-simplifier")
    }

    async fn simplify(&self, candidate: &TestCase, attempt: u32) -> Result<Option<TestCase>> {
        let units = candidate
            .files
            .iter()
            .flat_map(|f| f.contents.split(|b| *b == b'\n'))
            .filter(|line| !is_blank(line))
            .count();

        let Some((size, index)) = chunk_for_attempt(units, attempt) else {
            return Ok(None);
        };
        let removed = (index * size)..((index + 1) * size).min(units);

        let mut unit = 0;
        let mut files = Vec::with_capacity(candidate.files.len());
        for file in &candidate.files {
            let mut contents = Vec::with_capacity(file.contents.len());
            for line in file.contents.split(|b| *b == b'\n') {
                if is_blank(line) {
                    continue;
                }
                if !removed.contains(&unit) {
                    contents.extend_from_slice(line);
                    contents.push(b'\n');
                }
                unit += 1;
            }
            files.push(PayloadFile::new(file.name.clone(), contents));
        }

        Ok(Some(TestCase {
            files,
            expected_output: candidate.expected_output.clone(),
            seed: candidate.seed,
            generator: candidate.generator.clone(),
        }))
    }
}
