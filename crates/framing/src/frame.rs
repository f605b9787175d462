//! Base→unit frame encoders. Pure functions over byte arrays; callers own
//! all I/O and clock access.

use crate::checksum::config_crc32;
use crate::{BODY_POS, COMMAND_POS, CONTROL_NORMAL, FRAME_LEN, HEADER, PAD, TAIL, TAIL_POS};
use wire_types::timing::SAMPLES_PER_SEGMENT;

/// Command bytes sent by the base. See the opcode table in `decode`.
pub mod opcode {
    pub const WAKE: u8 = b'A';
    pub const WAKE_LC: u8 = b'a';
    pub const SAMPLE_DATA: u8 = b'R';
    pub const SLEEP: u8 = b'S';
    pub const RESET: u8 = b'X';
    pub const ERASE_CFG: u8 = b'E';
    pub const INIT: u8 = b'I';
    pub const PUSH_CONFIG: u8 = b'D';
    pub const UPLOAD_INIT: u8 = 0x51; // 'Q'
    pub const UPLOAD_PARTIAL: u8 = 0x55; // 'U'
}

/// Wall-clock stamp embedded into the plain interrogation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
}

/// RSSI tuning bytes appended to every config push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RssiParams {
    pub threshold: i8,
    pub delay: u8,
    pub increment: u8,
    pub power_adjust: u8,
}

/// Decoded acquisition parameters for the parameterized sample command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleParams {
    pub capture_segments: u32,
    pub channel_mask: u8,
    pub decimation: u8,
    pub advanced_checksum: bool,
    pub tach_delay: u16,
    pub dc_control: u32,
    pub wakeup_delay: u16,
    pub bluewave_interval: u32,
}

impl SampleParams {
    /// DC acquisition: one 16-sample capture with the DC control word set.
    pub fn dc(channel_mask: u8) -> Self {
        Self {
            capture_segments: 1,
            channel_mask,
            decimation: 1,
            advanced_checksum: true,
            tach_delay: 0,
            dc_control: 0x0000_0001,
            wakeup_delay: 0,
            bluewave_interval: 0,
        }
    }

    /// AC acquisition. The decimation code follows
    /// `sample_rate = 20000 / 2^(code-1)` with the sample rate at twice the
    /// requested max frequency (Nyquist); `resolution` is the total sample
    /// count, captured 16 samples per segment.
    pub fn ac(channel_mask: u8, max_freq_hz: f64, resolution: u32) -> Self {
        let sample_rate = 2.0 * max_freq_hz;
        let code = if sample_rate > 0.0 {
            ((20000.0 / sample_rate).log2() + 1.0 + 0.5).floor() as i64
        } else {
            15
        };
        let decimation = code.clamp(1, 15) as u8;
        let capture_segments = if resolution > 0 {
            resolution.div_ceil(16)
        } else {
            100
        };
        Self {
            capture_segments,
            channel_mask,
            decimation,
            advanced_checksum: true,
            tach_delay: 0,
            dc_control: 0,
            wakeup_delay: 0,
            bluewave_interval: 0,
        }
    }

    /// The packed second parameter word.
    pub fn combined_word(&self) -> u32 {
        u32::from(self.channel_mask)
            | (u32::from(self.decimation & 0x0F) << 8)
            | (u32::from(self.advanced_checksum) << 12)
            | (u32::from(self.tach_delay) << 16)
    }
}

/// ASCII-hex field writer: `value` as `width` lowercase hex characters.
pub fn write_hex_ascii(buf: &mut [u8; FRAME_LEN], offset: usize, value: u32, width: usize) {
    let text = format!("{:0width$x}", value, width = width);
    buf[offset..offset + width].copy_from_slice(text.as_bytes());
}

/// Shared skeleton for base→unit frames: markers, broadcast source MAC,
/// target MAC written twice, ASCII-zero padding everywhere else.
fn base_frame(target_mac: u32) -> [u8; FRAME_LEN] {
    let mut f = [PAD; FRAME_LEN];
    f[0] = HEADER[0];
    f[1] = HEADER[1];
    f[2] = CONTROL_NORMAL;
    f[3..7].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    f[7] = 0x01;
    f[13..17].copy_from_slice(&target_mac.to_be_bytes());
    f[17..21].copy_from_slice(&target_mac.to_be_bytes());
    f[TAIL_POS] = TAIL[0];
    f[TAIL_POS + 1] = TAIL[1];
    f
}

/// Plain single-opcode poll (wake, sleep, reset, init...). Body is all
/// ASCII-zero padding.
pub fn encode_poll(op: u8, target_mac: u32) -> [u8; FRAME_LEN] {
    let mut f = base_frame(target_mac);
    f[COMMAND_POS] = op;
    f
}

/// The stock interrogation frame: a sample-data command whose body carries
/// fixed marker bytes plus the current local time in ASCII hex.
pub fn encode_interrogate(target_mac: u32, now: &LocalTimestamp) -> [u8; FRAME_LEN] {
    let mut f = base_frame(target_mac);
    f[COMMAND_POS] = opcode::SAMPLE_DATA;
    f[52] = b'4';
    f[58] = b'1';
    f[59] = b'1';
    f[61] = b'1';
    f[84] = b'1';
    f[85] = b'e';
    write_hex_ascii(&mut f, 86, u32::from(now.month), 2);
    write_hex_ascii(&mut f, 88, u32::from(now.day), 2);
    write_hex_ascii(&mut f, 90, u32::from(now.year), 4);
    write_hex_ascii(&mut f, 94, u32::from(now.hour), 2);
    write_hex_ascii(&mut f, 96, u32::from(now.min), 2);
    write_hex_ascii(&mut f, 98, u32::from(now.sec), 2);
    f
}

/// Parameterized sample-data command: ten 8-character ASCII-hex fields.
pub fn encode_sample_request(target_mac: u32, params: &SampleParams) -> [u8; FRAME_LEN] {
    let mut f = base_frame(target_mac);
    f[COMMAND_POS] = opcode::SAMPLE_DATA;
    write_hex_ascii(&mut f, BODY_POS, params.capture_segments, 8);
    write_hex_ascii(&mut f, BODY_POS + 8, params.combined_word(), 8);
    write_hex_ascii(&mut f, BODY_POS + 16, params.dc_control, 8);
    write_hex_ascii(&mut f, BODY_POS + 24, u32::from(params.wakeup_delay) << 16, 8);
    write_hex_ascii(&mut f, BODY_POS + 32, params.bluewave_interval, 8);
    // fields 5..9 stay zero padding
    f
}

/// Erase-old-config broadcast. Unlike the other commands the body is binary
/// zero, with the encoded age at [46] and a transmit index at [125].
pub fn encode_erase(age: u8, tx_index: u8) -> [u8; FRAME_LEN] {
    let mut f = [0u8; FRAME_LEN];
    f[0] = HEADER[0];
    f[1] = HEADER[1];
    f[2] = CONTROL_NORMAL;
    f[3..7].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    f[7] = 0x01;
    for b in &mut f[8..45] {
        *b = PAD;
    }
    f[COMMAND_POS] = opcode::ERASE_CFG;
    f[BODY_POS] = (age & 0x3f) | 0xc0;
    f[125] = tx_index;
    f[TAIL_POS] = TAIL[0];
    f[TAIL_POS + 1] = TAIL[1];
    f
}

/// Full-upload init (0x51). `start_addr` and `length` are in samples and
/// travel on the wire divided down to segment units.
pub fn encode_upload_init(target_mac: u32, start_addr: u32, length: u32) -> [u8; FRAME_LEN] {
    let mut f = base_frame(target_mac);
    f[COMMAND_POS] = opcode::UPLOAD_INIT;
    write_hex_ascii(&mut f, BODY_POS, start_addr / SAMPLES_PER_SEGMENT, 4);
    write_hex_ascii(&mut f, BODY_POS + 4, length / SAMPLES_PER_SEGMENT, 4);
    f
}

/// Selective-retransmission request (0x55): start segment in ASCII hex,
/// then the 76-byte bitmap.
pub fn encode_partial_upload(
    target_mac: u32,
    start_segment: u16,
    bitmap: &[u8; 76],
) -> [u8; FRAME_LEN] {
    let mut f = base_frame(target_mac);
    f[COMMAND_POS] = opcode::UPLOAD_PARTIAL;
    write_hex_ascii(&mut f, BODY_POS, u32::from(start_segment), 4);
    f[50..126].copy_from_slice(bitmap);
    f
}

/// Config push broadcast: the 38-byte blob, target MAC, shifted time block,
/// CRC32 over the first 44 body bytes, the 0xFA 0xDE marker, and the four
/// RSSI tuning bytes.
pub fn encode_push_config(
    target_mac: u32,
    time_block: u16,
    blob: &[u8; 38],
    rssi: &RssiParams,
) -> [u8; FRAME_LEN] {
    let mut packet = [0u8; 80];
    packet[..38].copy_from_slice(blob);
    packet[38..42].copy_from_slice(&target_mac.to_be_bytes());
    packet[42] = (time_block >> 7) as u8;
    packet[43] = (time_block >> 7) as u8;
    let crc = config_crc32(&packet[..44]);
    packet[44..48].copy_from_slice(&crc.to_be_bytes());
    packet[48] = 0xfa;
    packet[49] = 0xde;
    packet[50] = rssi.threshold as u8;
    packet[51] = rssi.delay;
    packet[52] = rssi.increment;
    packet[53] = rssi.power_adjust;

    let mut f = [PAD; FRAME_LEN];
    f[0] = HEADER[0];
    f[1] = HEADER[1];
    f[2] = CONTROL_NORMAL;
    f[3..7].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    f[COMMAND_POS] = opcode::PUSH_CONFIG;
    f[BODY_POS..BODY_POS + 80].copy_from_slice(&packet);
    f[TAIL_POS] = TAIL[0];
    f[TAIL_POS + 1] = TAIL[1];
    f
}
