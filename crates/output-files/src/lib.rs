//! Persist a completed dataset: one appended header log line, a DC
//! metadata file, and a per-channel waveform text file. Pure functions of
//! the upload result and the configured directories.

mod header_line;
mod waveform;

pub use header_line::{append_header_log, build_header_line};
pub use waveform::{write_data_file, write_dc_file, DATA_SCALE};

use std::path::{Path, PathBuf};

use thiserror::Error;
use wire_types::{HeaderInfo, UnitStatus};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataset has no samples")]
    NoData,
    #[error("unsupported channel mask 0x{0:02x} (single channel expected)")]
    UnsupportedChannelMask(u8),
}

/// Everything the writers need about one finished upload.
#[derive(Debug, Clone)]
pub struct DatasetRecord<'a> {
    pub samples: &'a [i16],
    pub source_mac: u32,
    pub header: &'a HeaderInfo,
    pub status: &'a UnitStatus,
    /// From `sensor.clip_negative_temperatures`.
    pub clip_negative_temperatures: bool,
}

/// Where the three artifacts go.
#[derive(Debug, Clone)]
pub struct OutputDirs {
    /// Root for waveform and DC files (`ts1_data_files`).
    pub data_root: PathBuf,
    /// Directory holding the appended header log.
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct WrittenFiles {
    pub dc_file: Option<PathBuf>,
    pub data_file: Option<PathBuf>,
}

/// Write everything for one dataset. The header log line always goes out;
/// DC and waveform failures are logged and surfaced through the result.
pub fn write_output_files(
    dirs: &OutputDirs,
    record: &DatasetRecord<'_>,
) -> Result<WrittenFiles, OutputError> {
    if record.samples.is_empty() {
        return Err(OutputError::NoData);
    }

    let descriptor = record.header.descriptor;
    log::info!(
        target: "file_writer",
        "Writing output files: node 0x{:08x}, descriptor {}, {} samples ({} expected), channels {}",
        record.source_mac,
        descriptor,
        record.samples.len(),
        descriptor.sample_count(),
        descriptor.channel_names()
    );

    append_header_log(&dirs.log_dir, record)?;

    let written = WrittenFiles {
        dc_file: Some(write_dc_file(&dirs.data_root, record)?),
        data_file: Some(write_data_file(&dirs.data_root, record)?),
    };

    log::info!(target: "file_writer", "File writing complete");
    Ok(written)
}

pub(crate) fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use wire_types::{DatasetTime, Descriptor};

    fn sample_header(descriptor: u16) -> HeaderInfo {
        HeaderInfo {
            marker: 0x5A,
            data_control_bits: 0x01,
            unit_mac: 0xbbe01aae,
            descriptor: Descriptor(descriptor),
            dataset_time: DatasetTime {
                year: 2025,
                month: 10,
                day: 3,
                hour: 7,
                min: 41,
                sec: 9,
            },
            battery_raw: 192,
            temperature_raw: 100,
            rssi: 0xB8,
            ..HeaderInfo::default()
        }
    }

    #[test]
    fn test_write_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = OutputDirs {
            data_root: dir.path().join("data"),
            log_dir: dir.path().join("logs"),
        };
        std::fs::create_dir_all(&dirs.log_dir).unwrap();

        let header = sample_header(0x0103); // channel 1 (ultrasonic), 1024 samples
        let status = UnitStatus::default();
        let samples = vec![100i16; 1024];
        let record = DatasetRecord {
            samples: &samples,
            source_mac: 0xbc001234,
            header: &header,
            status: &status,
            clip_negative_temperatures: false,
        };

        let written = write_output_files(&dirs, &record).unwrap();
        assert!(written.dc_file.unwrap().exists());
        assert!(written.data_file.unwrap().exists());
        assert!(dirs.log_dir.join("headers.log").exists());
    }

    #[test]
    fn test_empty_dataset_refused() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = OutputDirs {
            data_root: dir.path().join("data"),
            log_dir: dir.path().join("logs"),
        };
        let header = sample_header(0x0103);
        let status = UnitStatus::default();
        let record = DatasetRecord {
            samples: &[],
            source_mac: 0xbc001234,
            header: &header,
            status: &status,
            clip_negative_temperatures: false,
        };
        assert!(matches!(
            write_output_files(&dirs, &record),
            Err(OutputError::NoData)
        ));
    }
}
