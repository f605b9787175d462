use crate::descriptor::Descriptor;

/// Dataset collection time as reported by the node (bytes 26..33 of the
/// header-info block).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
}

impl DatasetTime {
    /// "YYYY_MM_DD__HH_MM_SS" as used in output filenames.
    pub fn file_stamp(&self) -> String {
        format!(
            "{:04}_{:02}_{:02}__{:02}_{:02}_{:02}",
            self.year, self.month, self.day, self.hour, self.min, self.sec
        )
    }
}

/// The 32-byte header-info block carried by unit→base sensor frames
/// (frame bytes 13..45).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderInfo {
    pub reserved: [u8; 2],
    pub marker: u8,
    /// 24-bit delta field.
    pub delta: u32,
    /// Nonzero means the node has a dataset ready for upload.
    pub data_control_bits: u8,
    pub unit_mac: u32,
    pub descriptor: Descriptor,
    pub dataset_time: DatasetTime,
    pub node_time: u32,
    pub collection_time: u32,
    pub battery_raw: u8,
    pub temperature_raw: u16,
    pub rssi: u8,
}

impl HeaderInfo {
    pub fn data_ready(&self) -> bool {
        self.data_control_bits != 0
    }
}

/// System-status fields carried in the tail of unit→base responses
/// (version string, diagnostics, counters). Only meaningful on frames
/// whose source MAC is a real unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitStatus {
    pub version: String,
    pub unit_type: String,
    pub firmware_version: String,
    pub rssi_value: u8,
    pub ambient_rssi: u8,
    pub ram_corruption_reset_count: u8,
    pub firmware: u8,
    pub on_deck_crc: u32,
    pub datasets_processed: u16,
    pub packet_correction: u16,
    pub on_deck_dataset_count: u16,
    pub node_clock_year: u16,
    pub node_clock_month: u8,
    pub node_clock_day: u8,
    pub node_clock_hour: u8,
    pub node_clock_min: u8,
    pub spi_restart_count: u8,
    pub global_power_control: u8,
    pub reboot_count: u8,
    pub undervoltage_count: u8,
    pub debug_flags: u16,
    pub ble_on: u16,
    pub fpga_on: u16,
    pub min_count: u32,
    pub fail_count: u32,
    pub session_id: u16,
    pub fips_status: u8,
}

impl UnitStatus {
    /// Split "TSX_7CHv85" into unit type ("TSX_7CH") and firmware ("v85").
    pub fn split_version(version: &str) -> (String, String) {
        match version.find('v') {
            Some(pos) => (version[..pos].to_string(), version[pos..].to_string()),
            None => (version.to_string(), String::new()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_data_ready() {
        let mut info = HeaderInfo::default();
        assert!(!info.data_ready());
        info.data_control_bits = 0x01;
        assert!(info.data_ready());
    }

    #[test]
    fn test_dataset_time_file_stamp() {
        let t = DatasetTime {
            year: 2025,
            month: 10,
            day: 3,
            hour: 7,
            min: 41,
            sec: 9,
        };
        assert_eq!(t.file_stamp(), "2025_10_03__07_41_09");
    }

    #[test]
    fn test_split_version() {
        let (ty, fw) = UnitStatus::split_version("TSX_7CHv85");
        assert_eq!(ty, "TSX_7CH");
        assert_eq!(fw, "v85");

        let (ty, fw) = UnitStatus::split_version("NOVERSION");
        assert_eq!(ty, "NOVERSION");
        assert_eq!(fw, "");
    }
}
