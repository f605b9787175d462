use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDateTime;

use crate::channels::{read_channels, Ts1xChannel};
use crate::database::{now_unix, SamplesetDb};
use crate::sampleset::{merge_channels, Sampleset};
use crate::ScheduleError;

/// Owns the channel list, the merged samplesets, and the last-sampled
/// database; answers "what should I sample next?" round-robin and hot
/// reloads when the sampling file changes on disk.
pub struct SamplesetSupervisor {
    config_path: PathBuf,
    db: SamplesetDb,
    channels: Vec<Ts1xChannel>,
    samplesets: Vec<Sampleset>,
    last_config_mtime: Option<SystemTime>,
    reload_count: u32,
    initialized: bool,
    cursor: usize,
}

impl SamplesetSupervisor {
    pub fn new(config_path: impl AsRef<Path>, database_path: impl AsRef<Path>) -> Self {
        log::info!(
            target: "sampleset_super",
            "Creating supervisor (config: {}, database: {})",
            config_path.as_ref().display(),
            database_path.as_ref().display()
        );
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            db: SamplesetDb::new(database_path),
            channels: Vec::new(),
            samplesets: Vec::new(),
            last_config_mtime: None,
            reload_count: 0,
            initialized: false,
            cursor: 0,
        }
    }

    pub fn sampleset_count(&self) -> usize {
        self.samplesets.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn database_entry_count(&self) -> usize {
        self.db.entry_count()
    }

    pub fn reload_count(&self) -> u32 {
        self.reload_count
    }

    fn config_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.config_path)
            .and_then(|m| m.modified())
            .ok()
    }

    /// Load database and channels, merge samplesets, seed the database
    /// from the channel file's timestamps, and drop stale entries.
    /// Returns false when no samplesets could be produced.
    pub fn initialize(&mut self) -> Result<bool, ScheduleError> {
        self.db.initialize()?;
        log::info!(
            target: "sampleset_super",
            "Database initialized with {} existing entries",
            self.db.entry_count()
        );

        let loaded = self.load_and_merge();
        if loaded {
            self.populate_database_from_channels()?;
            let removed = self.db.refresh(&self.samplesets)?;
            if removed > 0 {
                log::info!(
                    target: "sampleset_super",
                    "Removed {} stale entries from database",
                    removed
                );
            }
        }

        self.last_config_mtime = self.config_mtime();
        self.reload_count = 0;
        self.cursor = 0;
        self.initialized = true;

        log::info!(
            target: "sampleset_super",
            "Initialization complete: {} channels, {} samplesets, {} database entries",
            self.channels.len(),
            self.samplesets.len(),
            self.db.entry_count()
        );
        Ok(loaded)
    }

    fn load_and_merge(&mut self) -> bool {
        let channels = read_channels(&self.config_path);
        if channels.is_empty() {
            log::warn!(
                target: "sampleset_super",
                "No channels loaded from configuration file"
            );
            return false;
        }

        let samplesets = merge_channels(&channels);
        if samplesets.is_empty() {
            return false;
        }

        if channels.len() > samplesets.len() {
            log::info!(
                target: "sampleset_super",
                "Compression: {} channels -> {} samplesets",
                channels.len(),
                samplesets.len()
            );
        }
        self.channels = channels;
        self.samplesets = samplesets;
        true
    }

    /// Reload when the sampling file's mtime moved forward. Returns true
    /// when a reload happened.
    pub fn check_and_reload_if_changed(&mut self) -> Result<bool, ScheduleError> {
        if !self.initialized {
            log::warn!(
                target: "sampleset_super",
                "check_and_reload_if_changed called before initialize()"
            );
            return Ok(false);
        }

        let Some(current) = self.config_mtime() else {
            return Ok(false);
        };
        if let Some(last) = self.last_config_mtime {
            if current <= last {
                return Ok(false);
            }
        }

        log::info!(
            target: "sampleset_super",
            "Configuration file has changed - reloading"
        );
        if !self.load_and_merge() {
            log::error!(target: "sampleset_super", "Failed to reload configuration");
            return Ok(false);
        }

        self.populate_database_from_channels()?;
        let removed = self.db.refresh(&self.samplesets)?;
        self.last_config_mtime = Some(current);
        self.reload_count += 1;
        self.db.flush()?;

        log::info!(
            target: "sampleset_super",
            "Configuration reloaded: {} samplesets, {} stale entries removed, reload #{}",
            self.samplesets.len(),
            removed,
            self.reload_count
        );
        Ok(true)
    }

    pub fn flush_database(&mut self) -> Result<(), ScheduleError> {
        self.db.flush()
    }

    pub fn record_sample(&mut self, sampleset: &Sampleset) {
        self.db.record_sample(sampleset, None);
    }

    fn is_due(&self, sampleset: &Sampleset) -> bool {
        match self.db.last_sample_time(sampleset) {
            None => true,
            Some(last) => (now_unix() - last) as f64 >= sampleset.interval_s,
        }
    }

    /// Round-robin scan from the cursor; returns the next due sampleset
    /// and advances past it, or None when everything is up to date.
    pub fn next_due(&mut self) -> Option<Sampleset> {
        if !self.initialized || self.samplesets.is_empty() {
            return None;
        }

        let count = self.samplesets.len();
        let mut index = self.cursor % count;
        for _ in 0..count {
            if self.is_due(&self.samplesets[index]) {
                self.cursor = (index + 1) % count;
                let found = self.samplesets[index].clone();
                log::debug!(
                    target: "sampleset_super",
                    "Due sampleset at index {} (0x{:08x} mask=0x{:02x})",
                    index,
                    found.nodeid,
                    found.sampling_mask
                );
                return Some(found);
            }
            index = (index + 1) % count;
        }
        None
    }

    /// Seed the database from the channel file's own last-sampled column.
    /// For each sampleset the OLDEST contributing-channel timestamp wins,
    /// and an existing database entry is only overwritten by an older one
    /// (the conservative direction: sampling too soon beats skipping).
    fn populate_database_from_channels(&mut self) -> Result<(), ScheduleError> {
        let mut populated = 0usize;
        let mut updated = 0usize;

        for sampleset in &self.samplesets {
            let mut oldest: Option<i64> = None;
            for channel in &self.channels {
                if !channel_contributes(channel, sampleset) {
                    continue;
                }
                let Some(stamp) = parse_api_timestamp(&channel.last_sampled) else {
                    continue;
                };
                oldest = Some(match oldest {
                    Some(existing) => existing.min(stamp),
                    None => stamp,
                });
            }

            let Some(oldest) = oldest else { continue };

            match self.db.last_sample_time(sampleset) {
                Some(existing) => {
                    if oldest < existing {
                        self.db.record_sample(sampleset, Some(oldest));
                        updated += 1;
                    }
                }
                None => {
                    self.db.record_sample(sampleset, Some(oldest));
                    populated += 1;
                }
            }
        }

        log::info!(
            target: "sampleset_super",
            "Database population complete: {} new, {} updated",
            populated,
            updated
        );
        if populated > 0 || updated > 0 {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Table dump of the current samplesets for the startup log.
    pub fn log_samplesets(&self) {
        if self.samplesets.is_empty() {
            return;
        }
        log::info!(
            target: "sampleset_super",
            "=== SAMPLESETS ({} total) ===",
            self.samplesets.len()
        );
        for set in &self.samplesets {
            let channels: Vec<String> = (0..8)
                .filter(|ch| set.sampling_mask & (1 << ch) != 0)
                .map(|ch| ch.to_string())
                .collect();
            log::info!(
                target: "sampleset_super",
                "0x{:08x} | 0x{:02x} | {} | {:>9} | {:>10} | {:8.1} | {} | ch {}",
                set.nodeid,
                set.sampling_mask,
                if set.ac { "AC" } else { "DC" },
                if set.max_freq_hz > 0.0 {
                    format!("{:.1}", set.max_freq_hz)
                } else {
                    "-".to_string()
                },
                if set.resolution > 0 {
                    set.resolution.to_string()
                } else {
                    "-".to_string()
                },
                set.interval_s,
                set.priority,
                channels.join(",")
            );
        }
    }
}

fn channel_contributes(channel: &Ts1xChannel, sampleset: &Sampleset) -> bool {
    let nodeid = match channel.serial.trim().strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).unwrap_or(0),
        None => u32::from_str_radix(channel.serial.trim(), 16).unwrap_or(0),
    };
    if nodeid != sampleset.nodeid {
        return false;
    }
    if (channel.channel_type == "AC") != sampleset.ac {
        return false;
    }
    if !(0..=7).contains(&channel.channel_num) {
        return false;
    }
    sampleset.sampling_mask & (1u8 << channel.channel_num) != 0
}

/// API-file timestamp like "2025-10-25 22:10:11.000". Fractional seconds
/// are accepted and discarded; "-" and empty mean never sampled.
fn parse_api_timestamp(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}
