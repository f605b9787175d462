//! Periodic broadcast of per-node configuration blobs, preceded by an
//! erase-old-config sweep.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use framing::frame::{encode_erase, encode_push_config, RssiParams};
use wire_types::timing::BROADCAST_PACING_MS;
use wire_types::{LinkError, Mac, SerialLink};

use crate::statelog::StateLog;

/// Size of a node configuration blob on disk and on the wire.
pub const CONFIG_BLOB_LEN: usize = 38;

pub struct ConfigBroadcaster {
    config_dir: PathBuf,
    rssi: RssiParams,
    interval: Duration,
    last_broadcast: Instant,
}

impl ConfigBroadcaster {
    /// Set up against `config_dir`, creating it when absent. Returns None
    /// (broadcasting disabled) when the path exists but is not a directory
    /// or cannot be created.
    pub fn new(
        config_dir: impl AsRef<Path>,
        rssi: RssiParams,
        interval_hours: u64,
    ) -> Option<Self> {
        let dir = config_dir.as_ref();
        if dir.exists() {
            if !dir.is_dir() {
                log::error!(
                    target: "broadcast_config",
                    "Path exists but is not a directory: {}",
                    dir.display()
                );
                return None;
            }
        } else if let Err(e) = std::fs::create_dir_all(dir) {
            log::error!(
                target: "broadcast_config",
                "Failed to create config directory {}: {}",
                dir.display(),
                e
            );
            return None;
        }

        Some(Self {
            config_dir: dir.to_path_buf(),
            rssi,
            interval: Duration::from_secs(interval_hours * 3600),
            last_broadcast: Instant::now(),
        })
    }

    /// The `*.config` files in lexicographic order. The hex filename
    /// prefix is the target MAC.
    pub fn config_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.config_dir) else {
            log::error!(
                target: "broadcast_config",
                "Cannot open config directory: {}",
                self.config_dir.display()
            );
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "config").unwrap_or(false))
            .collect();
        files.sort();
        files
    }

    pub fn is_time_for_periodic(&self) -> bool {
        self.last_broadcast.elapsed() >= self.interval
    }

    fn mac_from_filename(path: &Path) -> Option<u32> {
        let stem = path.file_stem()?.to_str()?;
        stem.parse::<Mac>().ok().map(|m| m.0)
    }

    /// Read a blob, padding short files with zeros (with a warning) and
    /// ignoring trailing bytes.
    fn read_blob(path: &Path) -> Option<[u8; CONFIG_BLOB_LEN]> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!(
                    target: "broadcast_config",
                    "Cannot open config file {}: {}",
                    path.display(),
                    e
                );
                return None;
            }
        };
        if bytes.len() != CONFIG_BLOB_LEN {
            log::warn!(
                target: "broadcast_config",
                "Config file size mismatch: expected {} bytes, got {}: {}",
                CONFIG_BLOB_LEN,
                bytes.len(),
                path.display()
            );
        }
        let mut blob = [0u8; CONFIG_BLOB_LEN];
        let n = bytes.len().min(CONFIG_BLOB_LEN);
        blob[..n].copy_from_slice(&bytes[..n]);
        Some(blob)
    }

    /// Erase sweep: four erase frames, transmit index 1..=4, paced 100 ms.
    fn send_erase_sweep(
        &self,
        link: &mut dyn SerialLink,
        erase_age: u8,
        statelog: &mut StateLog,
    ) -> Result<(), LinkError> {
        log::info!(
            target: "broadcast_config",
            "=== Erasing Old Config Files (age={}) ===",
            erase_age
        );
        for i in 0..4u8 {
            let frame = encode_erase(erase_age, i + 1);
            link.send_frame(&frame)?;
            link.flush()?;
            log::info!(target: "broadcast_config", "Erase command sent ({})", i + 1);
            std::thread::sleep(Duration::from_millis(BROADCAST_PACING_MS));
        }
        statelog.event("broadcast", &format!("erase sweep sent (age={})", erase_age));
        Ok(())
    }

    /// Broadcast every config file: erase sweep first (skipped when there
    /// are no files), then each blob six times at 100 ms spacing.
    pub fn broadcast_all(
        &mut self,
        link: &mut dyn SerialLink,
        erase_age: u8,
        statelog: &mut StateLog,
    ) -> Result<(), LinkError> {
        self.last_broadcast = Instant::now();

        let files = self.config_files();
        if files.is_empty() {
            log::info!(
                target: "broadcast_config",
                "No config files found in: {}",
                self.config_dir.display()
            );
            return Ok(());
        }

        self.send_erase_sweep(link, erase_age, statelog)?;
        log::info!(target: "broadcast_config", "Found {} config files", files.len());

        for path in files {
            let Some(mac) = Self::mac_from_filename(&path) else {
                log::warn!(
                    target: "broadcast_config",
                    "Skipping config file with non-hex name: {}",
                    path.display()
                );
                continue;
            };
            let Some(blob) = Self::read_blob(&path) else {
                continue;
            };

            let frame = encode_push_config(mac, 0, &blob, &self.rssi);
            for i in 0..6 {
                log::info!(
                    target: "broadcast_config",
                    "Broadcasting config: {} (unit 0x{:08x}), {}",
                    path.file_name().and_then(|n| n.to_str()).unwrap_or("?"),
                    mac,
                    i + 1
                );
                link.send_frame(&frame)?;
                link.flush()?;
                std::thread::sleep(Duration::from_millis(BROADCAST_PACING_MS));
            }
            statelog.event("broadcast", &format!("config pushed to 0x{:08x}", mac));
        }
        Ok(())
    }
}
