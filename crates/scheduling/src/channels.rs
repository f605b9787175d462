use std::path::Path;
use std::time::{Duration, SystemTime};

/// One row of the pipe-delimited sampling configuration file the upstream
/// API exports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ts1xChannel {
    pub hw_type: String,
    pub serial: String,
    pub port: i32,
    pub channel_num: i32,
    /// "AC" or "DC".
    pub channel_type: String,
    pub channel_id: String,
    pub interval: f64,
    pub adj_interval: f64,
    /// 0.0 for DC channels ("-" in the file).
    pub max_freq: f64,
    /// 0 for DC channels ("-" in the file).
    pub resolution: u32,
    pub last_sampled: String,
    pub priority: i32,
    pub is_demod: i32,
    pub external_input: String,
    pub external_name: String,
}

fn parse_line(line: &str, line_num: usize) -> Option<Ts1xChannel> {
    let tokens: Vec<&str> = line.split('|').map(str::trim).collect();
    if tokens.len() != 15 {
        log::error!(
            target: "channel_reader",
            "Line {} has {} fields, expected 15",
            line_num,
            tokens.len()
        );
        return None;
    }

    let parsed = (|| -> Result<Ts1xChannel, std::num::ParseIntError> {
        Ok(Ts1xChannel {
            hw_type: tokens[0].to_string(),
            serial: tokens[1].to_string(),
            port: tokens[2].parse()?,
            channel_num: tokens[3].parse()?,
            channel_type: tokens[4].to_string(),
            channel_id: tokens[5].to_string(),
            interval: tokens[6].parse().unwrap_or(0.0),
            adj_interval: tokens[7].parse().unwrap_or(0.0),
            max_freq: if tokens[8] == "-" {
                0.0
            } else {
                tokens[8].parse().unwrap_or(0.0)
            },
            resolution: if tokens[9] == "-" {
                0
            } else {
                tokens[9].parse().unwrap_or(0)
            },
            last_sampled: tokens[10].to_string(),
            priority: tokens[11].parse()?,
            is_demod: tokens[12].parse()?,
            external_input: tokens[13].to_string(),
            external_name: tokens[14].to_string(),
        })
    })();

    match parsed {
        Ok(channel) => Some(channel),
        Err(e) => {
            log::error!(target: "channel_reader", "Error parsing line {}: {}", line_num, e);
            None
        }
    }
}

/// Read the sampling file. The producer replaces it by atomic rename; if
/// the file was modified within the last two seconds we sleep them off
/// before opening, to avoid racing a writer that is not rename-based.
///
/// The first two lines (header and separator) are skipped. Parse failures
/// drop the row, never the file.
pub fn read_channels(path: impl AsRef<Path>) -> Vec<Ts1xChannel> {
    let path = path.as_ref();
    let mut channels = Vec::with_capacity(32);

    let Ok(meta) = std::fs::metadata(path) else {
        log::warn!(
            target: "channel_reader",
            "File does not exist or is not readable: {}",
            path.display()
        );
        return channels;
    };

    if let Ok(modified) = meta.modified() {
        if let Ok(age) = SystemTime::now().duration_since(modified) {
            if age < Duration::from_secs(2) {
                log::info!(target: "channel_reader", "File recently modified, waiting 2 seconds...");
                std::thread::sleep(Duration::from_secs(2));
            }
        }
    }

    let Ok(text) = std::fs::read_to_string(path) else {
        log::error!(target: "channel_reader", "Failed to open file: {}", path.display());
        return channels;
    };

    let mut failures = 0usize;
    for (idx, raw_line) in text.lines().enumerate() {
        let line_num = idx + 1;
        if line_num <= 2 {
            continue; // header and separator
        }
        let line = raw_line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line, line_num) {
            Some(channel) => channels.push(channel),
            None => failures += 1,
        }
    }

    if failures > 0 {
        log::warn!(
            target: "channel_reader",
            "Parsed {} channels with {} failures from {}",
            channels.len(),
            failures,
            path.display()
        );
    } else {
        log::info!(
            target: "channel_reader",
            "Read {} channels from {}",
            channels.len(),
            path.display()
        );
    }

    channels
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str =
        "hw_type | serial | port | channel | acdc | id | interval | adj | freq | res | last | pri | demod | ext_in | ext_name\n";
    const SEP: &str = "--------+--------+------+---------+------+----+----------+-----+------+-----+------+-----+-------+--------+---------\n";

    fn write_file(rows: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(SEP.as_bytes()).unwrap();
        for row in rows {
            file.write_all(row.as_bytes()).unwrap();
            file.write_all(b"\n").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_ac_row() {
        let file = write_file(&[
            "TS1X | 0x00111578 | 1 | 2 | AC | ch-x | 3600.0 | 3600.0 | 5000.0 | 1600 | 2025-10-25 22:10:11.000 | 0 | 0 | - | -",
        ]);
        // File was just written; the reader waits out the 2s age guard
        let channels = read_channels(file.path());
        assert_eq!(channels.len(), 1);
        let ch = &channels[0];
        assert_eq!(ch.serial, "0x00111578");
        assert_eq!(ch.channel_num, 2);
        assert_eq!(ch.channel_type, "AC");
        assert_eq!(ch.max_freq, 5000.0);
        assert_eq!(ch.resolution, 1600);
    }

    #[test]
    fn test_dc_row_dashes() {
        let file = write_file(&[
            "TS1X | 0x00111578 | 1 | 0 | DC | ch-dc | 600.0 | 600.0 | - | - | - | 0 | 0 | - | -",
        ]);
        let channels = read_channels(file.path());
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].max_freq, 0.0);
        assert_eq!(channels[0].resolution, 0);
    }

    #[test]
    fn test_bad_rows_dropped_good_rows_kept() {
        let file = write_file(&[
            "TS1X | 0x00111578 | 1 | 0 | DC | a | 600.0 | 600.0 | - | - | - | 0 | 0 | - | -",
            "only | four | fields | here",
            "TS1X | 0x00111579 | 1 | 1 | DC | b | 600.0 | 600.0 | - | - | - | 0 | 0 | - | -",
        ]);
        let channels = read_channels(file.path());
        assert_eq!(channels.len(), 2);
    }

    #[test]
    fn test_missing_file_returns_empty() {
        assert!(read_channels("/nonexistent/sampling.txt").is_empty());
    }
}
