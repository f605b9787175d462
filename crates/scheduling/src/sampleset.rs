use std::collections::BTreeMap;

use wire_types::is_echobox;

use crate::channels::Ts1xChannel;

/// A merged acquisition unit: every channel of one node that shares the
/// same interval, AC/DC mode, max frequency, and resolution, OR-ed into a
/// single sampling mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Sampleset {
    pub nodeid: u32,
    pub sampling_mask: u8,
    pub max_freq_hz: f64,
    pub resolution: u32,
    pub interval_s: f64,
    pub priority: u8,
    /// true = AC, false = DC.
    pub ac: bool,
}

impl Sampleset {
    /// Canonical database key. Priority is excluded: it is a scheduling
    /// hint, not a sampling characteristic.
    pub fn key(&self) -> String {
        format!(
            "0x{:08x}_0x{:02x}_{}_{:.1}_{}_{:.1}",
            self.nodeid,
            self.sampling_mask,
            if self.ac { "AC" } else { "DC" },
            self.max_freq_hz,
            self.resolution,
            self.interval_s
        )
    }
}

fn parse_serial(serial: &str) -> u32 {
    let hex = serial
        .trim()
        .strip_prefix("0x")
        .or_else(|| serial.trim().strip_prefix("0X"))
        .unwrap_or_else(|| serial.trim());
    u32::from_str_radix(hex, 16).unwrap_or_else(|_| {
        log::error!(target: "sampleset", "Failed to parse serial: {}", serial);
        0
    })
}

/// Merge channels into samplesets. EchoBox nodes are excluded here (they
/// belong in the node list, not the sampleset file), as are rows with an
/// unparseable serial or a channel number outside the 8-bit mask.
pub fn merge_channels(channels: &[Ts1xChannel]) -> Vec<Sampleset> {
    if channels.is_empty() {
        log::warn!(target: "sampleset", "No channels to process");
        return Vec::new();
    }

    // Group key carries every attribute channels must share to merge; the
    // float fields participate through their canonical text form.
    let mut groups: BTreeMap<String, Sampleset> = BTreeMap::new();
    let mut skipped_serial = 0usize;
    let mut skipped_channel = 0usize;
    let mut skipped_echobox = 0usize;

    for channel in channels {
        let nodeid = parse_serial(&channel.serial);
        if nodeid == 0 {
            skipped_serial += 1;
            continue;
        }
        if is_echobox(nodeid) {
            skipped_echobox += 1;
            log::warn!(
                target: "sampleset",
                "Skipping EchoBox node 0x{:08x} - EchoBox nodes belong in the node list, not samplesets",
                nodeid
            );
            continue;
        }
        if !(0..=7).contains(&channel.channel_num) {
            skipped_channel += 1;
            log::warn!(
                target: "sampleset",
                "Skipping channel with invalid channel number: {}",
                channel.channel_num
            );
            continue;
        }

        let ac = channel.channel_type == "AC";
        let group_key = format!(
            "0x{:08x}_{}_{:.3}_{:.3}_{}",
            nodeid,
            if ac { "AC" } else { "DC" },
            channel.interval,
            channel.max_freq,
            channel.resolution
        );

        let entry = groups.entry(group_key).or_insert_with(|| Sampleset {
            nodeid,
            sampling_mask: 0,
            max_freq_hz: channel.max_freq,
            resolution: channel.resolution,
            interval_s: channel.interval,
            priority: 0,
            ac,
        });
        entry.sampling_mask |= 1 << channel.channel_num;
        if channel.priority != 0 {
            entry.priority = 1;
        }
    }

    let mut samplesets: Vec<Sampleset> = groups.into_values().collect();
    // DC before AC within a node
    samplesets.sort_by(|a, b| a.nodeid.cmp(&b.nodeid).then(a.ac.cmp(&b.ac)));

    log::info!(
        target: "sampleset",
        "Created {} samplesets from {} channels",
        samplesets.len(),
        channels.len()
    );
    let skipped = skipped_serial + skipped_channel + skipped_echobox;
    if skipped > 0 {
        log::warn!(
            target: "sampleset",
            "Skipped {} channels (invalid serial: {}, invalid channel#: {}, EchoBox: {})",
            skipped, skipped_serial, skipped_channel, skipped_echobox
        );
    }

    samplesets
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn channel(serial: &str, num: i32, ty: &str, interval: f64, freq: f64, res: u32) -> Ts1xChannel {
        Ts1xChannel {
            serial: serial.to_string(),
            channel_num: num,
            channel_type: ty.to_string(),
            interval,
            max_freq: freq,
            resolution: res,
            ..Ts1xChannel::default()
        }
    }

    #[test]
    fn test_matching_channels_merge_masks() {
        let channels = vec![
            channel("0x00111578", 1, "AC", 3600.0, 5000.0, 1600),
            channel("0x00111578", 2, "AC", 3600.0, 5000.0, 1600),
            channel("0x00111578", 3, "AC", 3600.0, 5000.0, 1600),
        ];
        let sets = merge_channels(&channels);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].sampling_mask, 0b0000_1110);
    }

    #[test]
    fn test_different_intervals_do_not_merge() {
        let channels = vec![
            channel("0x00111578", 1, "AC", 3600.0, 5000.0, 1600),
            channel("0x00111578", 2, "AC", 7200.0, 5000.0, 1600),
        ];
        assert_eq!(merge_channels(&channels).len(), 2);
    }

    #[test]
    fn test_dc_sorts_before_ac() {
        let channels = vec![
            channel("0x00111578", 1, "AC", 3600.0, 5000.0, 1600),
            channel("0x00111578", 0, "DC", 600.0, 0.0, 0),
        ];
        let sets = merge_channels(&channels);
        assert_eq!(sets.len(), 2);
        assert!(!sets[0].ac);
        assert!(sets[1].ac);
    }

    #[test]
    fn test_echobox_excluded() {
        let channels = vec![
            channel("0xbc001234", 0, "DC", 600.0, 0.0, 0),
            channel("0x00111578", 0, "DC", 600.0, 0.0, 0),
        ];
        let sets = merge_channels(&channels);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].nodeid, 0x00111578);
    }

    #[test]
    fn test_invalid_channel_number_skipped() {
        let channels = vec![channel("0x00111578", 8, "DC", 600.0, 0.0, 0)];
        assert!(merge_channels(&channels).is_empty());
    }

    #[test]
    fn test_priority_propagates_to_group() {
        let mut low = channel("0x00111578", 1, "AC", 3600.0, 5000.0, 1600);
        low.priority = 0;
        let mut high = channel("0x00111578", 2, "AC", 3600.0, 5000.0, 1600);
        high.priority = 3;
        let sets = merge_channels(&[low, high]);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].priority, 1);
    }

    #[test]
    fn test_key_format() {
        let set = Sampleset {
            nodeid: 0x00111578,
            sampling_mask: 0x03,
            max_freq_hz: 0.0,
            resolution: 0,
            interval_s: 10.0,
            priority: 0,
            ac: false,
        };
        assert_eq!(set.key(), "0x00111578_0x03_DC_0.0_0_10.0");
    }
}
