//! Unit→base and loopback frame decoding.
//!
//! Decoding never fails outright: validity is reported through
//! `markers_valid` / `checksum_valid` on the result and callers decide what
//! to drop.

use crate::bitmap;
use crate::checksum::{config_crc32, is_fast_frame, verify_upload_checksum};
use crate::frame::{RssiParams, SampleParams};
use crate::{markers_valid, BODY_POS, COMMAND_POS, FRAME_LEN, PAD};
use wire_types::{DatasetTime, Descriptor, HeaderInfo, UnitStatus, BROADCAST_MAC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    BaseToUnit,
    UnitToBase,
}

/// Command byte registry. Letter opcodes accept both cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Wake,
    SampleData,
    Sleep,
    Reset,
    EraseConfig,
    Init,
    /// 'D': push-config when base→unit, sensor data response otherwise.
    DataExchange,
    UploadInit,
    UploadPartial,
    AckInit,
    DataUpload,
    Ack,
    Unknown(u8),
}

impl Opcode {
    pub fn from_byte(b: u8) -> Self {
        match b.to_ascii_lowercase() {
            b'a' => Opcode::Wake,
            b'r' => Opcode::SampleData,
            b's' => Opcode::Sleep,
            b'x' => Opcode::Reset,
            b'e' => Opcode::EraseConfig,
            b'i' => Opcode::Init,
            b'd' => Opcode::DataExchange,
            b'q' => Opcode::UploadInit,
            b'u' => Opcode::UploadPartial,
            b'1' => Opcode::AckInit,
            b'3' => Opcode::DataUpload,
            b'k' => Opcode::Ack,
            other => Opcode::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Wake => "WAKE",
            Opcode::SampleData => "SAMPLE_DATA",
            Opcode::Sleep => "SLEEP",
            Opcode::Reset => "RESET",
            Opcode::EraseConfig => "ERASE_CFG",
            Opcode::Init => "INIT",
            Opcode::DataExchange => "DATA_RSP",
            Opcode::UploadInit => "UPLOAD_INIT",
            Opcode::UploadPartial => "UPLOAD_PARTIAL",
            Opcode::AckInit => "ACK_INIT",
            Opcode::DataUpload => "DATA_UPLOAD",
            Opcode::Ack => "ACK",
            Opcode::Unknown(_) => "UNKNOWN",
        }
    }
}

/// One decoded segment of upload data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadData {
    pub segment: u16,
    pub samples: [i16; 32],
    pub fast: bool,
}

/// Variant-specific command payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    SampleRequest(SampleParams),
    Erase {
        age: u8,
    },
    UploadInit {
        start_segment: u16,
        segment_count: u16,
    },
    PartialRequest {
        start_segment: u16,
        segments: Vec<u16>,
    },
    PushConfig {
        blob: [u8; 38],
        target_mac: u32,
        time_block: u8,
        crc: u32,
        crc_valid: bool,
        rssi: Option<RssiParams>,
    },
    UploadData(UploadData),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub markers_valid: bool,
    pub checksum_valid: bool,
    pub control: u8,
    pub source_mac: u32,
    pub direction: Direction,
    pub opcode: Opcode,
    pub raw_opcode: u8,
    /// Sensor header block, unit→base frames only.
    pub header_info: Option<HeaderInfo>,
    /// Trailing status fields, unit→base frames only.
    pub status: Option<UnitStatus>,
    /// MAC echoed in the command field area.
    pub command_mac: u32,
    pub body: FrameBody,
}

impl DecodedFrame {
    pub fn data_ready(&self) -> bool {
        self.header_info
            .as_ref()
            .map(|h| h.data_ready())
            .unwrap_or(false)
    }
}

fn be16(frame: &[u8; FRAME_LEN], pos: usize) -> u16 {
    u16::from(frame[pos]) << 8 | u16::from(frame[pos + 1])
}

fn be32(frame: &[u8; FRAME_LEN], pos: usize) -> u32 {
    u32::from_be_bytes([frame[pos], frame[pos + 1], frame[pos + 2], frame[pos + 3]])
}

fn ascii_hex(frame: &[u8; FRAME_LEN], pos: usize, width: usize) -> u32 {
    let slice = &frame[pos..pos + width];
    std::str::from_utf8(slice)
        .ok()
        .and_then(|s| u32::from_str_radix(s.trim(), 16).ok())
        .unwrap_or(0)
}

/// Header info occupies [13..45] of unit→base frames. It is absent when the
/// slot carries the explicit 0xFF marker, when it is all ASCII-zero
/// padding, or when the marker byte is implausible.
fn header_info_present(frame: &[u8; FRAME_LEN]) -> bool {
    if frame[13] == 0xFF && frame[14] == 0xFF && frame[15] == 0xFF && frame[16] == 0xFF {
        return false;
    }
    if frame[13..45].iter().all(|&b| b == PAD) {
        return false;
    }
    let marker = frame[15];
    marker != PAD && marker != 0xFF
}

fn parse_header_info(frame: &[u8; FRAME_LEN]) -> HeaderInfo {
    HeaderInfo {
        reserved: [frame[13], frame[14]],
        marker: frame[15],
        delta: u32::from(frame[16]) << 16 | u32::from(frame[17]) << 8 | u32::from(frame[18]),
        data_control_bits: frame[19],
        unit_mac: be32(frame, 20),
        descriptor: Descriptor(be16(frame, 24)),
        dataset_time: DatasetTime {
            year: be16(frame, 26),
            month: frame[28],
            day: frame[29],
            hour: frame[30],
            min: frame[31],
            sec: frame[32],
        },
        node_time: be32(frame, 33),
        collection_time: be32(frame, 37),
        battery_raw: frame[41],
        temperature_raw: be16(frame, 42),
        rssi: frame[44],
    }
}

fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

fn parse_status(frame: &[u8; FRAME_LEN]) -> UnitStatus {
    let version = printable(&frame[56..66]);
    let (unit_type, firmware_version) = UnitStatus::split_version(&version);

    let mut buf_data = [0u16; 8];
    for (i, slot) in buf_data.iter_mut().enumerate() {
        *slot = be16(frame, 74 + i * 2);
    }
    let mut buf_spread = [0u16; 8];
    for (i, slot) in buf_spread.iter_mut().enumerate() {
        *slot = be16(frame, 90 + i * 2);
    }

    UnitStatus {
        version,
        unit_type,
        firmware_version,
        rssi_value: frame[66],
        ambient_rssi: frame[67],
        ram_corruption_reset_count: frame[68],
        firmware: frame[69],
        on_deck_crc: be32(frame, 70),
        datasets_processed: buf_data[0],
        packet_correction: buf_data[1],
        on_deck_dataset_count: buf_data[2],
        node_clock_year: buf_data[3],
        node_clock_month: (buf_data[4] >> 8) as u8,
        node_clock_day: (buf_data[4] & 0xFF) as u8,
        node_clock_hour: (buf_data[5] >> 8) as u8,
        node_clock_min: (buf_data[5] & 0xFF) as u8,
        spi_restart_count: (buf_data[6] >> 8) as u8,
        global_power_control: (buf_data[6] & 0xFF) as u8,
        reboot_count: (buf_data[7] >> 8) as u8,
        undervoltage_count: (buf_data[7] & 0xFF) as u8,
        debug_flags: buf_spread[0],
        ble_on: buf_spread[1],
        fpga_on: buf_spread[2],
        min_count: u32::from(buf_spread[3]) << 16 | u32::from(buf_spread[4]),
        fail_count: u32::from(buf_spread[5]) << 16 | u32::from(buf_spread[6]),
        session_id: be16(frame, 123),
        fips_status: frame[125],
    }
}

/// Unpack the fast-mode payload: 120 bytes carrying 64 logical samples.
///
/// Each 16-bit word holds a 15-bit sample; the LSB belongs to the first
/// sample of the current group of 16, which is skipped on the wire and
/// reassembled from those bits. The `ret & 2` adjustment is the firmware's
/// dither-recovery rule and is ported verbatim.
fn decode_fast_samples(frame: &[u8; FRAME_LEN]) -> [i16; 64] {
    let mut samples = [0i16; 64];
    let mut sample_idx = 0usize;
    let mut save_first: i32 = 0;
    let mut lcnt = 0usize;

    for i in 0..64usize {
        if i & 0xf == 0 {
            save_first = 0;
            sample_idx += 1;
        } else {
            let hi = i32::from(frame[5 + lcnt * 2]);
            let lo = i32::from(frame[5 + lcnt * 2 + 1]);
            let mut ret = ((hi << 8) & 0xff00) | (lo & 0xff);

            if ret & 1 != 0 {
                save_first += 0x8000;
            }
            ret &= 0xfffe;
            if ret & 2 != 0 {
                ret += 1;
            }

            samples[sample_idx] = (ret - 32768) as i16;

            if i & 0xf == 0xf {
                samples[sample_idx - 15] = (save_first - 32768) as i16;
            }

            save_first >>= 1;
            lcnt += 1;
            sample_idx += 1;
        }
    }

    samples
}

fn parse_upload_data(frame: &[u8; FRAME_LEN], fast: bool) -> UploadData {
    if fast {
        let full = decode_fast_samples(frame);
        let mut samples = [0i16; 32];
        samples.copy_from_slice(&full[..32]);
        UploadData {
            segment: be16(frame, 3),
            samples,
            fast: true,
        }
    } else {
        let mut samples = [0i16; 32];
        for (i, slot) in samples.iter_mut().enumerate() {
            *slot = be16(frame, 51 + i * 2) as i16;
        }
        UploadData {
            segment: be16(frame, 47),
            samples,
            fast: false,
        }
    }
}

fn parse_sample_params(frame: &[u8; FRAME_LEN]) -> SampleParams {
    let mut params = [0u32; 10];
    for (i, slot) in params.iter_mut().enumerate() {
        *slot = ascii_hex(frame, BODY_POS + i * 8, 8);
    }
    let combined = params[1];
    SampleParams {
        capture_segments: params[0],
        channel_mask: (combined & 0xFF) as u8,
        decimation: ((combined >> 8) & 0x0F) as u8,
        advanced_checksum: (combined >> 12) & 1 != 0,
        tach_delay: ((combined >> 16) & 0xFFFF) as u16,
        dc_control: params[2],
        wakeup_delay: ((params[3] >> 16) & 0xFFFF) as u16,
        bluewave_interval: params[4],
    }
}

fn parse_push_config(frame: &[u8; FRAME_LEN]) -> FrameBody {
    let mut blob = [0u8; 38];
    blob.copy_from_slice(&frame[46..84]);
    let target_mac = be32(frame, 84);
    let time_block = frame[88];
    let crc = be32(frame, 90);
    let crc_valid = config_crc32(&frame[46..90]) == crc;

    let rssi = if frame[94] == 0xfa && frame[95] == 0xde {
        Some(RssiParams {
            threshold: frame[96] as i8,
            delay: frame[97],
            increment: frame[98],
            power_adjust: frame[99],
        })
    } else {
        log::warn!(target: "framing", "push-config missing RSSI marker at [94..96]");
        None
    };

    FrameBody::PushConfig {
        blob,
        target_mac,
        time_block,
        crc,
        crc_valid,
        rssi,
    }
}

/// Decode one 128-byte frame.
pub fn decode(frame: &[u8; FRAME_LEN]) -> DecodedFrame {
    let markers = markers_valid(frame);
    let control = frame[2];
    let source_mac = be32(frame, 3);
    let raw_opcode = frame[COMMAND_POS];
    let opcode = Opcode::from_byte(raw_opcode);

    let direction = if source_mac == BROADCAST_MAC {
        Direction::BaseToUnit
    } else {
        Direction::UnitToBase
    };

    let fast = is_fast_frame(frame);
    let mut checksum_valid = true;
    if opcode == Opcode::DataUpload {
        checksum_valid = verify_upload_checksum(frame, fast);
        if !checksum_valid {
            log::warn!(target: "framing", "upload segment checksum mismatch");
        }
    }

    let header_info = if direction == Direction::UnitToBase && header_info_present(frame) {
        Some(parse_header_info(frame))
    } else {
        None
    };

    let status = if direction == Direction::UnitToBase {
        Some(parse_status(frame))
    } else {
        None
    };

    let body = match (opcode, direction) {
        (Opcode::SampleData, Direction::BaseToUnit) => {
            FrameBody::SampleRequest(parse_sample_params(frame))
        }
        (Opcode::EraseConfig, Direction::BaseToUnit) => FrameBody::Erase {
            age: frame[BODY_POS] & 0x3f,
        },
        (Opcode::UploadInit, Direction::BaseToUnit) => FrameBody::UploadInit {
            start_segment: ascii_hex(frame, BODY_POS, 4) as u16,
            segment_count: ascii_hex(frame, BODY_POS + 4, 4) as u16,
        },
        (Opcode::UploadPartial, Direction::BaseToUnit) => {
            let start_segment = ascii_hex(frame, BODY_POS, 4) as u16;
            let mut map = [0u8; bitmap::BITMAP_LEN];
            map.copy_from_slice(&frame[50..126]);
            FrameBody::PartialRequest {
                start_segment,
                segments: bitmap::parse(&map, start_segment),
            }
        }
        (Opcode::DataExchange, Direction::BaseToUnit) => parse_push_config(frame),
        (Opcode::DataUpload, Direction::UnitToBase) if checksum_valid => {
            FrameBody::UploadData(parse_upload_data(frame, fast))
        }
        _ => FrameBody::None,
    };

    DecodedFrame {
        markers_valid: markers,
        checksum_valid,
        control,
        source_mac,
        direction,
        opcode,
        raw_opcode,
        header_info,
        status,
        command_mac: be32(frame, 47),
        body,
    }
}

/// Hex+ASCII rendering of a buffer for the RX/TX trace logs.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 3);
    let mut ascii = String::with_capacity(bytes.len());
    for &b in bytes {
        if !hex.is_empty() {
            hex.push(' ');
        }
        hex.push_str(&format!("{:02X}", b));
        ascii.push(if b.is_ascii_graphic() || b == b' ' {
            b as char
        } else {
            '.'
        });
    }
    format!("{}  |{}|", hex, ascii)
}
