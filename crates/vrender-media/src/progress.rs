//! Render process stdout parsing.
//!
//! The generator reports progress on stdout, one message per line:
//!
//! ```text
//! Step: loading model
//! Progress: 40%
//! Frames generated: 48
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Progress:\s*(\d+(?:\.\d+)?)\s*%").expect("valid regex"));
static FRAMES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Frames generated:\s*(\d+)").expect("valid regex"));
static STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Step:\s*(.*\S)").expect("valid regex"));

/// A recognised stdout message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// Percent complete, clamped to 100
    Progress { percent: u8 },
    /// Total frames generated so far
    Frames { count: u64 },
    /// Name of the pipeline stage now running
    Step { name: String },
}

/// Parse one stdout line. Unrecognised lines yield `None`.
pub fn parse_output_line(line: &str) -> Option<OutputEvent> {
    let line = line.trim();

    if let Some(caps) = PROGRESS_RE.captures(line) {
        let value: f64 = caps[1].parse().ok()?;
        return Some(OutputEvent::Progress {
            percent: value.clamp(0.0, 100.0) as u8,
        });
    }

    if let Some(caps) = FRAMES_RE.captures(line) {
        return Some(OutputEvent::Frames {
            count: caps[1].parse().ok()?,
        });
    }

    STEP_RE.captures(line).map(|caps| OutputEvent::Step {
        name: caps[1].to_string(),
    })
}
