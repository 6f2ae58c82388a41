//! Build progress reporting.
//!
//! Reports observable progress during `tcorp build` so users see records
//! being loaded, grouped and scored. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a corpus build.
#[derive(Clone, Debug)]
pub enum BuildProgressEvent {
    /// Records loaded so far; total unknown until the last page.
    Loading { loaded: u64 },
    /// Grouping finished.
    Grouped { records: u64, groups: u64 },
    /// Batch `batch` done; `n` of `total` records processed in this run.
    Processing { batch: u64, n: u64, total: u64 },
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait BuildProgressReporter: Send + Sync {
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress on stderr: "build  processing  batch 12  1,200 / 5,000 records".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Loading { loaded } => {
                format!("build  loading  {} records\n", format_number(*loaded))
            }
            BuildProgressEvent::Grouped { records, groups } => format!(
                "build  grouped  {} records into {} groups\n",
                format_number(*records),
                format_number(*groups)
            ),
            BuildProgressEvent::Processing { batch, n, total } => format!(
                "build  processing  batch {}  {} / {} records\n",
                batch,
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, event: BuildProgressEvent) {
        let obj = match &event {
            BuildProgressEvent::Loading { loaded } => serde_json::json!({
                "event": "progress",
                "phase": "loading",
                "loaded": loaded
            }),
            BuildProgressEvent::Grouped { records, groups } => serde_json::json!({
                "event": "progress",
                "phase": "grouped",
                "records": records,
                "groups": groups
            }),
            BuildProgressEvent::Processing { batch, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "batch": batch,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BuildProgressReporter for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BuildProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
