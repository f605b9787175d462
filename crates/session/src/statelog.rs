//! The state log: every state-machine transition and protocol milestone as
//! one JSON object per line, append-only, greppable by `kind` or by the
//! embedded `UPLOAD_RESULT:` text.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Local;
use serde::Serialize;

pub const STATE_LOG_NAME: &str = "base_states.log";

#[derive(Serialize)]
struct StateLogEntry<'a> {
    ts: String,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<&'a str>,
    detail: &'a str,
}

/// File sink for structured state entries. A missing or unwritable log
/// directory downgrades to dropping entries with one warning; the state
/// log is diagnostics, not a dependency.
pub struct StateLog {
    file: Option<File>,
}

impl StateLog {
    pub fn open(log_dir: &Path) -> Self {
        let path = log_dir.join(STATE_LOG_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path);
        match file {
            Ok(file) => {
                let mut log = Self { file: Some(file) };
                log.event("startup", "state logger started");
                log
            }
            Err(e) => {
                log::warn!(
                    target: "state_log",
                    "Failed to open state log {}: {} - entries will be dropped",
                    path.display(),
                    e
                );
                Self { file: None }
            }
        }
    }

    /// A sink that discards everything; used by monitor-only runs and
    /// tests that do not care about the file.
    pub fn disabled() -> Self {
        Self { file: None }
    }

    fn write(&mut self, entry: &StateLogEntry<'_>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        match serde_json::to_string(entry) {
            Ok(json) => {
                let _ = writeln!(file, "{}", json);
            }
            Err(e) => log::warn!(target: "state_log", "Failed to serialize entry: {}", e),
        }
    }

    fn now() -> String {
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    pub fn transition(&mut self, scope: &str, from: &str, to: &str, reason: &str) {
        self.write(&StateLogEntry {
            ts: Self::now(),
            kind: scope,
            from: Some(from),
            to: Some(to),
            detail: reason,
        });
    }

    pub fn event(&mut self, kind: &str, detail: &str) {
        self.write(&StateLogEntry {
            ts: Self::now(),
            kind,
            from: None,
            to: None,
            detail,
        });
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = StateLog::open(dir.path());
        log.transition("session", "IDLE", "COMMAND_SEQUENCE", "start");
        log.event("upload_result", "UPLOAD_RESULT: SUCCESS | Node: 0xbc001234");
        drop(log);

        let text = std::fs::read_to_string(dir.path().join(STATE_LOG_NAME)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3); // startup + two entries

        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("ts").is_some());
            assert!(value.get("kind").is_some());
        }

        let transition: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(transition["from"], "IDLE");
        assert_eq!(transition["to"], "COMMAND_SEQUENCE");

        // The result line stays greppable
        assert!(text.contains("UPLOAD_RESULT: SUCCESS"));
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let mut log = StateLog::disabled();
        log.event("anything", "goes nowhere");
        log.transition("session", "A", "B", "reason");
    }

    #[test]
    fn test_unwritable_directory_degrades() {
        let mut log = StateLog::open(Path::new("/nonexistent/dir"));
        log.event("still", "no panic");
    }
}
