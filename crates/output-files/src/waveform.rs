//! DC metadata and waveform file writers.

use std::io::Write;
use std::path::{Path, PathBuf};

use wire_types::convert;

use crate::{ensure_dir, DatasetRecord, OutputError};

/// Counts to engineering units.
pub const DATA_SCALE: f64 = 1.0 / 20971.52;

fn unit_hex(mac: u32) -> String {
    format!("{:08x}", mac)
}

/// DC metadata file: `dcvals/DC_<unit>_<stamp>.txt`, one semicolon-
/// terminated line of temperature, battery, and placeholder slots.
pub fn write_dc_file(data_root: &Path, record: &DatasetRecord<'_>) -> Result<PathBuf, OutputError> {
    let header = record.header;
    let dc_dir = data_root.join("dcvals");
    ensure_dir(&dc_dir)?;

    let unit = unit_hex(header.unit_mac);
    let stamp = header.dataset_time.file_stamp();
    let path = dc_dir.join(format!("DC_{}_{}.txt", unit, stamp));

    let temperature = convert::temperature_to_fahrenheit(
        header.temperature_raw,
        record.clip_negative_temperatures,
    );
    let battery = convert::battery_to_volts(header.battery_raw);

    let mut line = format!("{} {} 0003 {:.5} {:.5}", stamp, unit, temperature, battery);
    for _ in 0..16 {
        line.push_str(" -1.00000");
    }
    line.push_str(" -2 -2");
    for _ in 0..14 {
        line.push_str(" -1");
    }
    line.push_str(" 0 ;");

    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "{}", line)?;

    log::info!(target: "file_writer", "Wrote DC file: {}", path.display());
    Ok(path)
}

fn mean(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&s| f64::from(s)).sum::<f64>() / samples.len() as f64
}

/// RMS of the scaled, mean-removed signal. The mean is truncated to an
/// integer count before removal, matching the files the analysis backend
/// already ingests.
fn rms(samples: &[i16], mean_counts: i64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let scaled = (i64::from(s) - mean_counts) as f64 * DATA_SCALE;
            scaled * scaled
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt()
}

/// Scientific notation with a three-digit exponent ("1.234560e-004"), the
/// format the downstream tooling expects.
fn format_sci3(value: f64) -> String {
    let text = format!("{:.6e}", value);
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(rest) => ('-', rest),
                None => ('+', exp.strip_prefix('+').unwrap_or(exp)),
            };
            let exp_val: u32 = digits.parse().unwrap_or(0);
            format!("{}e{}{:03}", mantissa, sign, exp_val)
        }
        None => text,
    }
}

/// Waveform file under `<data_root>/<unit>_ch{1|2}/<stamp>.txt`: comment
/// header then one scaled sample per line. Only single-channel datasets
/// (ultrasonic or X) produce waveform files.
pub fn write_data_file(
    data_root: &Path,
    record: &DatasetRecord<'_>,
) -> Result<PathBuf, OutputError> {
    if record.samples.is_empty() {
        return Err(OutputError::NoData);
    }

    let header = record.header;
    let descriptor = header.descriptor;
    let channel_mask = descriptor.channel_mask();
    let (channel_str, start_channel) = match channel_mask {
        0x01 => ("ch1", 1),
        0x02 => ("ch2", 2),
        other => return Err(OutputError::UnsupportedChannelMask(other)),
    };

    let unit = unit_hex(header.unit_mac);
    let dir = data_root.join(format!("{}_{}", unit, channel_str));
    ensure_dir(&dir)?;

    let dt = header.dataset_time;
    let path = dir.join(format!("{}.txt", dt.file_stamp()));

    let mean_counts = mean(record.samples) as i64;
    let rms_value = rms(record.samples, mean_counts);

    let mut out = String::with_capacity(record.samples.len() * 16 + 512);
    out.push_str(&format!(";PodID {}\n", unit));
    out.push_str(&format!(
        ";Date Year({}) Month({}) Day({:02}) Hour({:02}) Minutes({:02}) Seconds({:02})\n",
        dt.year, dt.month, dt.day, dt.hour, dt.min, dt.sec
    ));
    out.push_str(&format!(";FSampleRate {:.6}\n", descriptor.rate_hz()));
    out.push_str(";Channels 1\n");
    out.push_str(&format!(";nStart_channel {}\n", start_channel));
    out.push_str(";Units 0\n");
    out.push_str(&format!(";echobase {}\n", unit_hex(record.source_mac)));
    out.push_str(";Agc 1\n");
    out.push_str(&format!(";Samples {}\n", record.samples.len()));
    out.push_str(&format!(";RMS {:.6}\n", rms_value));
    out.push_str(";channelIds -2 -1\n");

    for &sample in record.samples {
        let scaled = (i64::from(sample) - mean_counts) as f64 * DATA_SCALE;
        out.push_str(&format_sci3(scaled));
        out.push('\n');
    }

    std::fs::write(&path, out)?;
    log::info!(
        target: "file_writer",
        "Wrote data file: {} ({} samples, RMS={:.6})",
        path.display(),
        record.samples.len(),
        rms_value
    );
    Ok(path)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use wire_types::{DatasetTime, Descriptor, HeaderInfo, UnitStatus};

    fn header(descriptor: u16) -> HeaderInfo {
        HeaderInfo {
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
            ..HeaderInfo::default()
        }
    }

    fn record<'a>(
        samples: &'a [i16],
        header: &'a HeaderInfo,
        status: &'a UnitStatus,
    ) -> DatasetRecord<'a> {
        DatasetRecord {
            samples,
            source_mac: 0xbc001234,
            header,
            status,
            clip_negative_temperatures: false,
        }
    }

    #[test]
    fn test_dc_file_name_and_shape() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(0x0103);
        let status = UnitStatus::default();
        let samples = [0i16; 16];
        let path = write_dc_file(dir.path(), &record(&samples, &h, &status)).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "DC_bbe01aae_2025_10_03__07_41_09.txt"
        );
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("2025_10_03__07_41_09 bbe01aae 0003 "));
        assert!(content.trim_end().ends_with(" 0 ;"));
        // 16 float placeholders and 16 int placeholders
        assert_eq!(content.matches("-1.00000").count(), 16);
        assert_eq!(content.matches(" -2").count(), 2);
    }

    #[test]
    fn test_data_file_header_and_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(0x0203); // channel X -> ch2
        let status = UnitStatus::default();
        // Mean 0: symmetric signal
        let samples: Vec<i16> = (0..1024).map(|i| if i % 2 == 0 { 100 } else { -100 }).collect();
        let path = write_data_file(dir.path(), &record(&samples, &h, &status)).unwrap();

        assert!(path.to_str().unwrap().contains("bbe01aae_ch2"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(";PodID bbe01aae\n"));
        assert!(content.contains(";FSampleRate 20000.000000\n"));
        assert!(content.contains(";nStart_channel 2\n"));
        assert!(content.contains(";echobase bc001234\n"));
        assert!(content.contains(";Samples 1024\n"));

        // RMS of constant-magnitude 100-count signal
        let expect = 100.0 * DATA_SCALE;
        let rms_line = content
            .lines()
            .find(|l| l.starts_with(";RMS"))
            .unwrap()
            .to_string();
        let rms_val: f64 = rms_line.split_whitespace().nth(1).unwrap().parse().unwrap();
        assert!((rms_val - expect).abs() < 1e-6);

        // First sample line: +100 counts scaled
        let first = content.lines().find(|l| !l.starts_with(';')).unwrap();
        assert_eq!(first, format_sci3(100.0 * DATA_SCALE));
    }

    #[test]
    fn test_mean_removed_before_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(0x0103);
        let status = UnitStatus::default();
        let samples = vec![500i16; 64];
        let path = write_data_file(dir.path(), &record(&samples, &h, &status)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        // Constant signal: mean removal zeroes every sample and the RMS
        assert!(content.contains(";RMS 0.000000\n"));
        let first = content.lines().find(|l| !l.starts_with(';')).unwrap();
        assert_eq!(first, "0.000000e+000");
    }

    #[test]
    fn test_multi_channel_mask_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(0x0303);
        let status = UnitStatus::default();
        let samples = [0i16; 16];
        assert!(matches!(
            write_data_file(dir.path(), &record(&samples, &h, &status)),
            Err(OutputError::UnsupportedChannelMask(0x03))
        ));
    }

    #[test]
    fn test_format_sci3() {
        assert_eq!(format_sci3(0.0), "0.000000e+000");
        assert_eq!(format_sci3(0.000123456), "1.234560e-004");
        assert_eq!(format_sci3(-1.5), "-1.500000e+000");
        assert_eq!(format_sci3(2.5e12), "2.500000e+012");
    }
}
