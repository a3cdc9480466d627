//! Failure signatures.
//!
//! A signature is `<class>.<detail>`, e.g. `crash.SwitchMergeBlock` or
//! `timeout.none`. It doubles as the bucket directory name, so the detail is
//! restricted to `[A-Za-z0-9_-]`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::run::Outcome;
use crate::error::Error;

/// Broad class of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Crash,
    HostCrash,
    Timeout,
    WrongImage,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::HostCrash => "host_crash",
            Self::Timeout => "timeout",
            Self::WrongImage => "wrong_image",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "crash" => Some(Self::Crash),
            "host_crash" => Some(Self::HostCrash),
            "timeout" => Some(Self::Timeout),
            "wrong_image" => Some(Self::WrongImage),
            _ => None,
        }
    }

    /// Class for a finding outcome; `None` for passes and infra errors
    pub fn for_outcome(outcome: Outcome) -> Option<Self> {
        match outcome {
            Outcome::Crash => Some(Self::Crash),
            Outcome::HostCrash => Some(Self::HostCrash),
            Outcome::Timeout => Some(Self::Timeout),
            Outcome::WrongImage => Some(Self::WrongImage),
            Outcome::Pass | Outcome::InfraError => None,
        }
    }
}

/// Normalized, comparable fingerprint of a failure
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature {
    class: FailureClass,
    detail: String,
}

impl Signature {
    pub fn new(class: FailureClass, detail: &str) -> Self {
        let detail: String = detail
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let detail = if detail.is_empty() {
            "none".to_string()
        } else {
            detail
        };
        Self { class, detail }
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        let (class, detail) = raw
            .split_once('.')
            .ok_or_else(|| Error::schema(raw, "signature must be '<class>.<detail>'"))?;
        let class = FailureClass::parse(class)
            .ok_or_else(|| Error::schema(raw, format!("unknown failure class '{}'", class)))?;
        Ok(Self::new(class, detail))
    }

    pub fn class(&self) -> FailureClass {
        self.class
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class.as_str(), self.detail)
    }
}

impl TryFrom<String> for Signature {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(signature: Signature) -> Self {
        signature.to_string()
    }
}

pub const NO_SIGNATURE: &str = "no_signature";

/// Extract a crash detail from compiler/driver log output.
///
/// Checks known fatal messages first, then tool-specific error lines, then
/// the top stack frame of a native crash. Returns [`NO_SIGNATURE`] when
/// nothing recognizable is found.
pub fn signature_from_log(log: &str) -> String {
    if log.contains("Shader compilation failed") {
        return "compile_error".to_string();
    }
    if log.contains("Failed to link shaders") {
        return "link_error".to_string();
    }
    if log.contains("Calling vkCreateGraphicsPipelines Fail") {
        return "pipeline_failure".to_string();
    }
    if log.contains("Resource deadlock would occur") {
        return "Resource_deadlock_would_occur".to_string();
    }

    if log.contains("error: line ") {
        if let Some(found) = log.lines().find_map(spirv_opt_error) {
            return truncate(&underscore_non_word(&remove_digits(found)), 20);
        }
    }

    if log.contains("0 pass, 1 fail") {
        if let Some(found) = log.lines().find_map(amber_error) {
            return underscore_non_word(&remove_digits(found));
        }
    }

    if log.contains("SPIR-V is not generated for failed compile or link") {
        if let Some(found) = log.lines().find_map(glslang_error) {
            return underscore_non_word(&remove_digits(found));
        }
    }

    if log.contains("#00 pc") {
        if let Some(line) = log.lines().find(|l| l.contains("#00 pc")) {
            let frame = &line[line.find("#00 pc").unwrap_or(0)..];
            if frame.contains("/amber_ndk") {
                return "amber_ndk".to_string();
            }
            if let Some(function) = cpp_function(frame).or_else(|| c_function(frame)) {
                return function.to_string();
            }
        }
    }

    if log.contains("Backtrace:") {
        if let Some(frame) = catchsegv_frame(log) {
            return truncate(&underscore_non_word(frame), 50);
        }
    }

    NO_SIGNATURE.to_string()
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn remove_digits(s: &str) -> String {
    s.chars().filter(|c| !c.is_ascii_digit()).collect()
}

fn underscore_non_word(s: &str) -> String {
    s.chars().map(|c| if is_word(c) { c } else { '_' }).collect()
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Length in bytes of the longest prefix whose chars satisfy `pred`
fn span(s: &str, pred: impl Fn(char) -> bool) -> usize {
    s.char_indices()
        .find(|(_, c)| !pred(*c))
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// `error: line 12: Module contains unreachable blocks` at line start
fn spirv_opt_error(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("error: line ")?;
    let digits = span(rest, |c| c.is_ascii_digit());
    if digits == 0 {
        return None;
    }
    let rest = rest[digits..].strip_prefix(": ")?;
    let len = span(rest, |c| is_word(c) || matches!(c, ' ' | '.' | '\'' | '-' | '"'));
    (len > 0).then(|| &rest[..len])
}

/// `test.amber: 256: probe ssbo format does not match` running to line end
fn amber_error(line: &str) -> Option<&str> {
    for (i, _) in line.match_indices(": ") {
        let preceded_by_word = line[..i].chars().next_back().map(is_word).unwrap_or(false);
        if !preceded_by_word {
            continue;
        }
        let rest = &line[i + 2..];
        let digits = span(rest, |c| c.is_ascii_digit());
        if digits == 0 {
            continue;
        }
        let Some(message) = rest[digits..].strip_prefix(": ") else {
            continue;
        };
        if !message.is_empty() && message.chars().all(|c| is_word(c) || c == ' ') {
            return Some(message);
        }
    }
    None
}

/// `shader.frag:549: 'variable indexing' : not supported`
fn glslang_error(line: &str) -> Option<&str> {
    for (i, _) in line.match_indices(": '") {
        let before = &line[..i];
        let digits = before.len() - before.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            continue;
        }
        let Some(before) = before[..before.len() - digits].strip_suffix(':') else {
            continue;
        };
        if !before.chars().next_back().map(is_word).unwrap_or(false) {
            continue;
        }
        let rest = &line[i + 3..];
        let len = span(rest, |c| is_word(c) || c == ' ');
        if len > 0 && rest[len..].starts_with('\'') {
            return Some(&rest[..len]);
        }
    }
    None
}

/// `(anonymous namespace)::Bar::Baz(aaa*)` → `Baz`
fn cpp_function(frame: &str) -> Option<&str> {
    for (i, _) in frame.match_indices("::") {
        let rest = &frame[i + 2..];
        let len = span(rest, is_word);
        if len > 0 && rest[len..].starts_with('(') {
            return Some(&rest[..len]);
        }
    }
    None
}

/// `(myFunction+372)` or `(myFunction(...)+372)` → `myFunction`
fn c_function(frame: &str) -> Option<&str> {
    for (i, _) in frame.match_indices('(') {
        let rest = &frame[i + 1..];
        let len = span(rest, is_word);
        if len == 0 {
            continue;
        }
        let tail = &rest[len..];
        if tail.starts_with('(') {
            return Some(&rest[..len]);
        }
        if let Some(after_plus) = tail.strip_prefix('+') {
            let digits = span(after_plus, |c| c.is_ascii_digit());
            if digits > 0 && after_plus[digits..].starts_with(')') {
                return Some(&rest[..len]);
            }
        }
    }
    None
}

/// First frame after `Backtrace:`, e.g.
/// `/bin/spirv-opt(_ZN8spvtools3opt5Block+0x369)[0x5bd6d9]` → `spirv-opt(_ZN8spvtools3opt5Block`
fn catchsegv_frame(log: &str) -> Option<&str> {
    let start = log.find("Backtrace:\n")? + "Backtrace:\n".len();
    let line = log[start..].lines().next()?;

    // Greedy `.*/`: try the rightmost slash first
    for (slash, _) in line.rmatch_indices('/') {
        let rest = &line[slash + 1..];
        let name = span(rest, |c| c != '/' && c != '(');
        let Some(args) = rest[name..].strip_prefix('(') else {
            continue;
        };
        let symbol = span(args, |c| c != ')' && c != '+');
        if symbol > 0 && args[symbol..].starts_with('+') {
            return Some(&rest[..name + 1 + symbol]);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_messages() {
        assert_eq!(signature_from_log("...Shader compilation failed..."), "compile_error");
        assert_eq!(signature_from_log("Failed to link shaders"), "link_error");
        assert_eq!(
            signature_from_log("Calling vkCreateGraphicsPipelines Fail"),
            "pipeline_failure"
        );
    }

    #[test]
    fn test_spirv_opt_error() {
        let log = "error: line 0: Module contains unreachable blocks during merge return.";
        assert_eq!(signature_from_log(log), "Module_contains_unre");
    }

    #[test]
    fn test_amber_error() {
        let log = "summary: 0 pass, 1 fail\n/data/local/tmp/test.amber: 256: probe ssbo format does not match buffer format";
        assert_eq!(
            signature_from_log(log),
            "probe_ssbo_format_does_not_match_buffer_format"
        );
    }

    #[test]
    fn test_glslang_error() {
        let log = "ERROR: temp/variant/shader.frag:549: 'variable indexing fragment shader output array' : not supported with this profile: es\nSPIR-V is not generated for failed compile or link";
        assert_eq!(
            signature_from_log(log),
            "variable_indexing_fragment_shader_output_array"
        );
    }

    #[test]
    fn test_android_frames() {
        let cpp = "#00 pc 0001 /vendor/lib/libllvm.so ((anonymous namespace)::Bar::Baz(aaa::MyInstr*)+456)";
        assert_eq!(signature_from_log(cpp), "Baz");

        let c = "#00 pc 0001 /vendor/lib/libvulkan.so (myFunction+372)";
        assert_eq!(signature_from_log(c), "myFunction");

        let ndk = "#00 pc 0001 /data/local/tmp/amber_ndk (main+1)";
        assert_eq!(signature_from_log(ndk), "amber_ndk");
    }

    #[test]
    fn test_catchsegv_backtrace() {
        let log = "Backtrace:\n/data/bin/Linux/spirv-opt(_ZN8spvtools3opt21StructuredCFGAnalysis16SwitchMergeBlockEj+0x369)[0x5bd6d9]\n";
        assert_eq!(
            signature_from_log(log),
            "spirv_opt__ZN8spvtools3opt21StructuredCFGAnalysis1"
        );
    }

    #[test]
    fn test_no_signature() {
        assert_eq!(signature_from_log("all good"), NO_SIGNATURE);
    }

    #[test]
    fn test_signature_display_round_trip() {
        let signature = Signature::new(FailureClass::Crash, "compile error");
        assert_eq!(signature.to_string(), "crash.compile_error");
        assert_eq!(Signature::parse("crash.compile_error").unwrap(), signature);
        assert!(Signature::parse("bogus.x").is_err());
    }
}
