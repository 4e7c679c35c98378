//! Line-oriented parser for the fetch agent's textual output.
//!
//! Everything that depends on the agent's log format lives here, so a change
//! in that format only touches this module.

use once_cell::sync::Lazy;
use regex::Regex;

/// Anomaly lines tolerated per item before the parser recommends aborting.
pub const ANOMALY_THRESHOLD: u32 = 5;

const PROGRESS_TAG: &str = "[download]";
const ANOMALY_MARKERS: &[&str] = &["http error 403", "forbidden"];
const FAILURE_MARKERS: &[&str] = &["error", "failed"];

static SIZE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"%\s+of\s+~?\s*(?P<size>[\d\.]+\s*[KMGT]?i?B)").unwrap()
});

/// What a single output line told us.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LineReport {
    pub percent: Option<f64>,
    pub size: Option<String>,
    pub anomaly: bool,
    pub abort_recommended: bool,
    pub failure_marker: bool,
}

/// Per-item parser state: only the anomaly counter survives between lines.
#[derive(Debug, Default)]
pub struct ProgressParser {
    anomalies: u32,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anomalies(&self) -> u32 {
        self.anomalies
    }

    /// Resets the anomaly counter. Called at the start of every item.
    pub fn reset(&mut self) {
        self.anomalies = 0;
    }

    pub fn feed(&mut self, line: &str) -> LineReport {
        let mut report = LineReport::default();

        if line.contains(PROGRESS_TAG) && line.contains('%') {
            report.percent = parse_percent(line);
            report.size = SIZE_REGEX
                .captures(line)
                .and_then(|caps| caps.name("size"))
                .map(|m| m.as_str().replace(' ', ""));
        }

        let lowered = line.to_lowercase();
        if ANOMALY_MARKERS.iter().any(|m| lowered.contains(m)) {
            self.anomalies += 1;
            report.anomaly = true;
            report.abort_recommended = self.anomalies >= ANOMALY_THRESHOLD;
        }
        report.failure_marker = FAILURE_MARKERS.iter().any(|m| lowered.contains(m));

        report
    }
}

/// Takes the last whitespace-delimited token before the first `%`.
fn parse_percent(line: &str) -> Option<f64> {
    let head = line.split('%').next()?;
    let token = head.split_whitespace().last()?;
    let value: f64 = token.parse().ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}
