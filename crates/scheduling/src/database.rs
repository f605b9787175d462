use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::sampleset::Sampleset;
use crate::ScheduleError;

/// Persistent map of sampleset key -> last-sampled Unix timestamp.
/// Survives restarts so intervals keep their phase; writes go through a
/// temp file plus rename.
#[derive(Debug)]
pub struct SamplesetDb {
    path: PathBuf,
    times: BTreeMap<String, i64>,
    dirty: bool,
}

impl SamplesetDb {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            times: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load the file. Absence is fine (first run); malformed lines are
    /// skipped with a warning.
    pub fn initialize(&mut self) -> Result<(), ScheduleError> {
        self.times.clear();
        self.dirty = false;

        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => {
                log::info!(
                    target: "sampleset_db",
                    "Database file does not exist yet (first run?)"
                );
                return Ok(());
            }
        };

        let mut skipped = 0usize;
        for (idx, line) in text.lines().enumerate() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next().and_then(|t| t.parse::<i64>().ok())) {
                (Some(key), Some(timestamp)) => {
                    self.times.insert(key.to_string(), timestamp);
                }
                _ => {
                    log::warn!(
                        target: "sampleset_db",
                        "Failed to parse line {}: {}",
                        idx + 1,
                        line
                    );
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            log::warn!(
                target: "sampleset_db",
                "Loaded {} entries, skipped {} invalid lines",
                self.times.len(),
                skipped
            );
        } else {
            log::info!(
                target: "sampleset_db",
                "Loaded {} sampleset entries from database",
                self.times.len()
            );
        }
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.times.len()
    }

    /// Record a sample at `timestamp` (now when None). Re-recording the
    /// same timestamp leaves observable state unchanged.
    pub fn record_sample(&mut self, sampleset: &Sampleset, timestamp: Option<i64>) {
        let timestamp = timestamp.unwrap_or_else(now_unix);
        let key = sampleset.key();
        let previous = self.times.insert(key.clone(), timestamp);
        self.dirty = true;
        if previous.is_none() {
            log::debug!(
                target: "sampleset_db",
                "Recorded NEW sample: {} at {}",
                key,
                timestamp
            );
        }
    }

    pub fn last_sample_time(&self, sampleset: &Sampleset) -> Option<i64> {
        self.times.get(&sampleset.key()).copied()
    }

    pub fn has_been_sampled(&self, sampleset: &Sampleset) -> bool {
        self.times.contains_key(&sampleset.key())
    }

    /// Drop entries whose sampleset no longer exists; flushes when
    /// anything was removed. Returns the number removed.
    pub fn refresh(&mut self, current: &[Sampleset]) -> Result<usize, ScheduleError> {
        let valid: BTreeSet<String> = current.iter().map(Sampleset::key).collect();
        let stale: Vec<String> = self
            .times
            .keys()
            .filter(|k| !valid.contains(*k))
            .cloned()
            .collect();

        for key in &stale {
            self.times.remove(key);
            log::debug!(target: "sampleset_db", "Removed stale entry: {}", key);
        }

        if !stale.is_empty() {
            self.dirty = true;
            log::info!(
                target: "sampleset_db",
                "Removed {} stale entries from database",
                stale.len()
            );
            self.flush()?;
        }
        Ok(stale.len())
    }

    /// Write the file if anything changed since the last flush. Temp file
    /// then rename, so readers never see a half-written database.
    pub fn flush(&mut self) -> Result<(), ScheduleError> {
        if !self.dirty {
            return Ok(());
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&temp_path)?;
            writeln!(file, "# Sampleset sampling times database")?;
            writeln!(file, "# Format: <key> <timestamp>")?;
            writeln!(file, "# Key format: nodeid_mask_acdc_maxfreq_resolution_interval")?;
            writeln!(file, "# Timestamp: Unix epoch time")?;
            writeln!(file, "#")?;
            for (key, timestamp) in &self.times {
                writeln!(file, "{} {}", key, timestamp)?;
            }
        }
        std::fs::rename(&temp_path, &self.path)?;

        self.dirty = false;
        log::debug!(
            target: "sampleset_db",
            "Saved {} entries to database",
            self.times.len()
        );
        Ok(())
    }
}

pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn sampleset(nodeid: u32, mask: u8) -> Sampleset {
        Sampleset {
            nodeid,
            sampling_mask: mask,
            max_freq_hz: 0.0,
            resolution: 0,
            interval_s: 10.0,
            priority: 0,
            ac: false,
        }
    }

    #[test]
    fn test_record_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = SamplesetDb::new(dir.path().join("db.txt"));
        db.initialize().unwrap();

        let set = sampleset(0x00111578, 0x03);
        assert!(!db.has_been_sampled(&set));
        db.record_sample(&set, Some(1_700_000_000));
        assert_eq!(db.last_sample_time(&set), Some(1_700_000_000));
    }

    #[test]
    fn test_record_sample_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = SamplesetDb::new(dir.path().join("db.txt"));
        db.initialize().unwrap();

        let set = sampleset(0x00111578, 0x03);
        db.record_sample(&set, Some(1_700_000_000));
        db.record_sample(&set, Some(1_700_000_000));
        assert_eq!(db.entry_count(), 1);
        assert_eq!(db.last_sample_time(&set), Some(1_700_000_000));
    }

    #[test]
    fn test_flush_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.txt");

        let set = sampleset(0x00111578, 0x03);
        {
            let mut db = SamplesetDb::new(&path);
            db.initialize().unwrap();
            db.record_sample(&set, Some(1_700_000_123));
            db.flush().unwrap();
        }

        let mut db = SamplesetDb::new(&path);
        db.initialize().unwrap();
        assert_eq!(db.last_sample_time(&set), Some(1_700_000_123));
    }

    #[test]
    fn test_refresh_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = SamplesetDb::new(dir.path().join("db.txt"));
        db.initialize().unwrap();

        let keep = sampleset(0x00111578, 0x03);
        let stale = sampleset(0x00111579, 0x01);
        db.record_sample(&keep, Some(1));
        db.record_sample(&stale, Some(2));

        let removed = db.refresh(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(removed, 1);
        assert!(db.has_been_sampled(&keep));
        assert!(!db.has_been_sampled(&stale));
    }

    #[test]
    fn test_initialize_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.txt");
        std::fs::write(&path, "# header\ngoodkey 123\nbadline\nother nope\n").unwrap();

        let mut db = SamplesetDb::new(&path);
        db.initialize().unwrap();
        assert_eq!(db.entry_count(), 1);
    }

    #[test]
    fn test_missing_file_ok() {
        let mut db = SamplesetDb::new("/nonexistent/dir/db.txt");
        assert!(db.initialize().is_ok());
        assert_eq!(db.entry_count(), 0);
    }
}
