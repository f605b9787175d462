//! Key=value configuration file: `#` comments, blank lines ignored,
//! last assignment wins. Typed getters fall back to defaults on missing
//! keys or parse failures; `validate()` enforces sane ranges at startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---- Validation ranges ----

const RADIO_CHECK_MIN_SEC: i64 = 10;
const RADIO_CHECK_MAX_SEC: i64 = 604_800;
const RING_MIN_SIZE: i64 = 1024;
const RING_MAX_SIZE: i64 = 8 * 1024 * 1024;
const CMD_QUEUE_MIN: i64 = 1;
const CMD_QUEUE_MAX: i64 = 4096;
const TIMER_INTERVAL_MIN_US: i64 = 100;
const TIMER_INTERVAL_MAX_US: i64 = 1_000_000;
const LOOP_DELAY_MIN_US: i64 = 0;
const LOOP_DELAY_MAX_US: i64 = 1_000_000;
const BROADCAST_INTERVAL_MIN_HOURS: i64 = 1;
const BROADCAST_INTERVAL_MAX_HOURS: i64 = 168;

#[derive(Debug, Default)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut values = BTreeMap::new();

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r').trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            values.insert(key.to_string(), value.trim().to_string());
        }

        Ok(Self { values })
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.get_str(key, default))
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            },
            None => default,
        }
    }

    // ---- Resolved settings ----

    pub fn ping_file(&self) -> PathBuf {
        self.get_path("system.ping_file", "/tmp/ping.txt")
    }

    pub fn radio_check_period_seconds(&self) -> i64 {
        self.get_i64("system.radio_check_period_seconds", 28_800)
    }

    pub fn ring_size(&self) -> i64 {
        self.get_i64("session.pi_buffer_size", 1_048_576)
    }

    pub fn command_queue_size(&self) -> i64 {
        self.get_i64("session.command_buffer_size", 16)
    }

    pub fn rf_channel_file(&self) -> PathBuf {
        self.get_path("system.rf_channel_file", "/home/pi/channel.txt")
    }

    pub fn serial_device(&self) -> String {
        self.get_str("uart.device", "/dev/serial0")
    }

    pub fn timer_interval_us(&self) -> i64 {
        self.get_i64("session.timer_interval_us", 5000)
    }

    pub fn main_loop_delay_us(&self) -> i64 {
        self.get_i64("session.main_loop_delay_us", 20_000)
    }

    pub fn dwell_count(&self) -> i64 {
        self.get_i64("session.dwell_count", 25)
    }

    pub fn response_timeout_ms(&self) -> i64 {
        self.get_i64("session.response_timeout_ms", 3000)
    }

    pub fn nodelist_directory(&self) -> PathBuf {
        self.get_path("session.nodelist_directory", "/srv/UPTIMEDRIVE/nodelist")
    }

    pub fn node_list_file(&self) -> PathBuf {
        self.nodelist_directory().join("nodelist_force.txt")
    }

    pub fn config_files_directory(&self) -> PathBuf {
        self.get_path("config.files_directory", "/srv/UPTIMEDRIVE/commands")
    }

    pub fn broadcast_interval_hours(&self) -> i64 {
        self.get_i64("config_broadcast_interval_hours", 8)
    }

    pub fn rssi_threshold(&self) -> i64 {
        self.get_i64("global_mistlx_rssi_threshold", -90)
    }

    pub fn rssi_delay(&self) -> i64 {
        self.get_i64("global_mistlx_rssi_delay", 0)
    }

    pub fn rssi_increment(&self) -> i64 {
        self.get_i64("global_mistlx_rssi_increment", 0)
    }

    pub fn power_adjust(&self) -> i64 {
        self.get_i64("poweradjust", 0)
    }

    pub fn data_files_directory(&self) -> PathBuf {
        self.get_path("ts1_data_files", "/srv/UPTIMEDRIVE/data")
    }

    pub fn sampling_file(&self) -> PathBuf {
        self.get_path("ts1x_sampling_file", "/srv/UPTIMEDRIVE/sampling.txt")
    }

    pub fn sampleset_database_file(&self) -> PathBuf {
        self.get_path("sampleset_database_file", "/srv/UPTIMEDRIVE/sampleset_db.txt")
    }

    pub fn log_directory(&self) -> PathBuf {
        self.get_path("system.log_directory", "/srv/UPTIMEDRIVE/logs")
    }

    pub fn root_filehandler(&self) -> PathBuf {
        self.get_path("output.root_filehandler", "/srv/UPTIMEDRIVE")
    }

    pub fn clip_negative_temperatures(&self) -> bool {
        self.get_bool("sensor.clip_negative_temperatures", false)
    }

    pub fn force_partial_upload(&self) -> bool {
        self.get_bool("upload.force_partial", true)
    }

    /// Range-check everything we depend on. Violations are errors (refuse
    /// to run); suspicious-but-workable values only warn.
    pub fn validate(&self) -> bool {
        let mut ok = true;

        let radio_sec = self.radio_check_period_seconds();
        if !(RADIO_CHECK_MIN_SEC..=RADIO_CHECK_MAX_SEC).contains(&radio_sec) {
            log::error!(
                "system.radio_check_period_seconds={} out of range [{}..{}]",
                radio_sec, RADIO_CHECK_MIN_SEC, RADIO_CHECK_MAX_SEC
            );
            ok = false;
        }

        let ring = self.ring_size();
        if !(RING_MIN_SIZE..=RING_MAX_SIZE).contains(&ring) {
            log::error!(
                "session.pi_buffer_size={} out of range [{}..{}]",
                ring, RING_MIN_SIZE, RING_MAX_SIZE
            );
            ok = false;
        } else if ring & (ring - 1) != 0 {
            log::warn!(
                "session.pi_buffer_size={} not a power of two (ring rounds up)",
                ring
            );
        }

        let queue = self.command_queue_size();
        if !(CMD_QUEUE_MIN..=CMD_QUEUE_MAX).contains(&queue) {
            log::error!(
                "session.command_buffer_size={} out of range [{}..{}]",
                queue, CMD_QUEUE_MIN, CMD_QUEUE_MAX
            );
            ok = false;
        }

        let timer = self.timer_interval_us();
        if !(TIMER_INTERVAL_MIN_US..=TIMER_INTERVAL_MAX_US).contains(&timer) {
            log::error!(
                "session.timer_interval_us={} out of range [{}..{}]",
                timer, TIMER_INTERVAL_MIN_US, TIMER_INTERVAL_MAX_US
            );
            ok = false;
        }

        let loop_us = self.main_loop_delay_us();
        if !(LOOP_DELAY_MIN_US..=LOOP_DELAY_MAX_US).contains(&loop_us) {
            log::error!(
                "session.main_loop_delay_us={} out of range [{}..{}]",
                loop_us, LOOP_DELAY_MIN_US, LOOP_DELAY_MAX_US
            );
            ok = false;
        }

        let threshold = self.rssi_threshold();
        if !(-128..=127).contains(&threshold) {
            log::error!(
                "global_mistlx_rssi_threshold={} out of range [-128..127]",
                threshold
            );
            ok = false;
        }
        for (key, value) in [
            ("global_mistlx_rssi_delay", self.rssi_delay()),
            ("global_mistlx_rssi_increment", self.rssi_increment()),
            ("poweradjust", self.power_adjust()),
        ] {
            if !(0..=255).contains(&value) {
                log::error!("{}={} out of range [0..255]", key, value);
                ok = false;
            }
        }

        let hours = self.broadcast_interval_hours();
        if !(BROADCAST_INTERVAL_MIN_HOURS..=BROADCAST_INTERVAL_MAX_HOURS).contains(&hours) {
            log::error!(
                "config_broadcast_interval_hours={} out of range [{}..{}]",
                hours, BROADCAST_INTERVAL_MIN_HOURS, BROADCAST_INTERVAL_MAX_HOURS
            );
            ok = false;
        }

        // Missing non-critical files and directories only warn
        if !self.rf_channel_file().exists() {
            log::warn!(
                "system.rf_channel_file not readable: {}",
                self.rf_channel_file().display()
            );
        }
        if !self.config_files_directory().is_dir() {
            log::warn!(
                "config.files_directory not found: {} - config broadcasting will be disabled",
                self.config_files_directory().display()
            );
        }

        if ok {
            log::info!("Configuration validated.");
        } else {
            log::error!("Configuration invalid.");
        }
        ok
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_from(content: &str) -> Config {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        Config::load(file.path()).unwrap()
    }

    #[test]
    fn test_parse_basics() {
        let cfg = config_from(
            "# comment\n\nsession.dwell_count = 10\nsystem.log_directory=/var/log/base\nbadline\n",
        );
        assert_eq!(cfg.dwell_count(), 10);
        assert_eq!(cfg.log_directory(), PathBuf::from("/var/log/base"));
    }

    #[test]
    fn test_last_assignment_wins() {
        let cfg = config_from("session.dwell_count=5\nsession.dwell_count=7\n");
        assert_eq!(cfg.dwell_count(), 7);
    }

    #[test]
    fn test_defaults_when_missing() {
        let cfg = config_from("");
        assert_eq!(cfg.dwell_count(), 25);
        assert_eq!(cfg.serial_device(), "/dev/serial0");
        assert!(cfg.force_partial_upload());
        assert!(!cfg.clip_negative_temperatures());
    }

    #[test]
    fn test_bool_spellings() {
        let cfg = config_from(
            "a=true\nb=YES\nc=1\nd=off\ne=FALSE\nf=banana\n",
        );
        assert!(cfg.get_bool("a", false));
        assert!(cfg.get_bool("b", false));
        assert!(cfg.get_bool("c", false));
        assert!(!cfg.get_bool("d", true));
        assert!(!cfg.get_bool("e", true));
        assert!(cfg.get_bool("f", true)); // unrecognized keeps the default
    }

    #[test]
    fn test_parse_failure_keeps_default() {
        let cfg = config_from("session.dwell_count=lots\n");
        assert_eq!(cfg.dwell_count(), 25);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let cfg = config_from("");
        assert!(cfg.validate());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cfg = config_from("session.pi_buffer_size=64\n");
        assert!(!cfg.validate());

        let cfg = config_from("session.timer_interval_us=5\n");
        assert!(!cfg.validate());

        let cfg = config_from("config_broadcast_interval_hours=0\n");
        assert!(!cfg.validate());
    }

    #[test]
    fn test_node_list_file_under_directory() {
        let cfg = config_from("session.nodelist_directory=/srv/nodes\n");
        assert_eq!(cfg.node_list_file(), PathBuf::from("/srv/nodes/nodelist_force.txt"));
    }
}
