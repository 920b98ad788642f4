//! Render process stderr classification.

use serde::Serialize;

/// Transient failures; the process may recover on its own.
const RECOVERABLE_PATTERNS: &[&str] = &[
    "out of memory",
    "cuda error: out of memory",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "timed out",
];

/// Crash or corruption; the process must be killed.
const FATAL_PATTERNS: &[&str] = &[
    "segmentation fault",
    "core dumped",
    "illegal memory access",
    "corrupted",
];

/// How a stderr line affects the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrClass {
    Recoverable,
    Fatal,
}

/// Classify one stderr line. Fatal patterns win over recoverable ones.
pub fn classify_stderr(line: &str) -> Option<StderrClass> {
    let lower = line.to_lowercase();

    if FATAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        Some(StderrClass::Fatal)
    } else if RECOVERABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        Some(StderrClass::Recoverable)
    } else {
        None
    }
}
