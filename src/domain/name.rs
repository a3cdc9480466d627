//! Hierarchical artifact names.
//!
//! A name is the address of an artifact: `runs/7f3a/tests/shader-0c1d`.
//! Mapping a name to its directory is a pure function of the store root.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A validated, slash-delimited artifact name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactName {
    segments: Vec<String>,
}

impl ArtifactName {
    /// Parse a name, accepting an optional leading `//`
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.strip_prefix("//").unwrap_or(raw);
        let trimmed = trimmed.trim_end_matches('/');

        if trimmed.is_empty() {
            return Err(invalid(raw, "name is empty"));
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            validate_segment(segment).map_err(|reason| invalid(raw, reason))?;
            segments.push(segment.to_string());
        }

        Ok(Self { segments })
    }

    /// Append one segment
    pub fn child(&self, segment: &str) -> Result<Self, Error> {
        validate_segment(segment).map_err(|reason| invalid(segment, reason))?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// Append a relative, possibly multi-segment path
    pub fn join(&self, relative: &str) -> Result<Self, Error> {
        let tail = Self::parse(relative)?;
        let mut segments = self.segments.clone();
        segments.extend(tail.segments);
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Last segment
    pub fn leaf(&self) -> &str {
        // Never empty: parse rejects empty names
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Copy with the last segment replaced
    pub fn with_leaf(&self, leaf: &str) -> Result<Self, Error> {
        validate_segment(leaf).map_err(|reason| invalid(leaf, reason))?;
        let mut segments = self.segments.clone();
        if let Some(last) = segments.last_mut() {
            *last = leaf.to_string();
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Segment-wise prefix test (`a/b` is a prefix of `a/b/c`, not of `a/bc`)
    pub fn starts_with(&self, prefix: &ArtifactName) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Directory holding this artifact under `root`
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in &self.segments {
            path.push(segment);
        }
        path
    }

    pub fn as_string(&self) -> String {
        self.segments.join("/")
    }
}

/// Check one segment; returns the reason on failure
pub fn validate_segment(segment: &str) -> Result<(), &'static str> {
    if segment.is_empty() {
        return Err("empty segment");
    }
    if segment.starts_with('.') {
        return Err("segments may not start with '.'");
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err("segments may only contain [A-Za-z0-9_.-]");
    }
    Ok(())
}

/// Turn arbitrary text into a valid segment
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

fn invalid(name: &str, reason: &str) -> Error {
    Error::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

impl Ord for ArtifactName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.cmp(&other.segments)
    }
}

impl PartialOrd for ArtifactName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl FromStr for ArtifactName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ArtifactName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArtifactName> for String {
    fn from(name: ArtifactName) -> Self {
        name.as_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_double_slash() {
        let name = ArtifactName::parse("//my_glsl_shader_job").unwrap();
        assert_eq!(name.to_string(), "my_glsl_shader_job");
        assert_eq!(name.depth(), 1);
    }

    #[test]
    fn test_rejects_reserved_and_traversal_segments() {
        assert!(ArtifactName::parse("runs/../etc").is_err());
        assert!(ArtifactName::parse("runs/.staging/x").is_err());
        assert!(ArtifactName::parse("runs//x").is_err());
        assert!(ArtifactName::parse("runs/a b").is_err());
        assert!(ArtifactName::parse("").is_err());
    }

    #[test]
    fn test_segment_prefix() {
        let parent = ArtifactName::parse("a/b").unwrap();
        assert!(ArtifactName::parse("a/b/c").unwrap().starts_with(&parent));
        assert!(!ArtifactName::parse("a/bc").unwrap().starts_with(&parent));
    }

    #[test]
    fn test_ordering_is_segment_wise() {
        let mut names: Vec<ArtifactName> = ["a-c", "a/b", "a"]
            .iter()
            .map(|n| ArtifactName::parse(n).unwrap())
            .collect();
        names.sort();
        let rendered: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        assert_eq!(rendered, vec!["a", "a/b", "a-c"]);
    }

    #[test]
    fn test_to_path_is_pure() {
        let name = ArtifactName::parse("runs/x/results/glslang").unwrap();
        assert_eq!(
            name.to_path(Path::new("/store")),
            PathBuf::from("/store/runs/x/results/glslang")
        );
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("crash/foo bar"), "crash_foo_bar");
        assert_eq!(sanitize_segment(".hidden"), "hidden");
        assert_eq!(sanitize_segment(""), "_");
    }

    #[test]
    fn test_serde_as_string() {
        let name = ArtifactName::parse("buckets/timeout.none").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"buckets/timeout.none\"");
        let parsed: ArtifactName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, name);
    }
}
