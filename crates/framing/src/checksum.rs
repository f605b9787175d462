//! Upload-data checksum and config-push CRC32.

use crate::{CONTROL_FAST, FRAME_LEN};
use crc::{Crc, CRC_32_ISO_HDLC};

/// Reflected CRC-32, poly 0xEDB88320, init/xorout 0xFFFFFFFF - the checksum
/// the node firmware runs over config pushes.
const CONFIG_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn config_crc32(data: &[u8]) -> u32 {
    CONFIG_CRC.checksum(data)
}

/// Marker at [49] that enables the slow-mode checksum. Frames without it
/// are accepted unconditionally (old firmware compatibility; do not
/// tighten).
pub const SLOW_CHECKSUM_MARKER: u8 = 0xBB;

/// Verify the checksum of a data-upload frame.
///
/// Sum the payload bytes ([5..125] fast, [51..115] slow) into a u16; the
/// advanced variant adds the four MAC bytes. Stored byte at [125] is
/// `(sum ^ 0xAA) & 0xFF`; either variant matching accepts the frame.
pub fn verify_upload_checksum(frame: &[u8; FRAME_LEN], fast: bool) -> bool {
    let mut basic: u16 = 0;

    if fast {
        for &b in &frame[5..125] {
            basic = basic.wrapping_add(u16::from(b));
        }
    } else {
        if frame[49] != SLOW_CHECKSUM_MARKER {
            return true;
        }
        for &b in &frame[51..115] {
            basic = basic.wrapping_add(u16::from(b));
        }
    }

    let mut advanced = basic;
    for &b in &frame[3..7] {
        advanced = advanced.wrapping_add(u16::from(b));
    }

    let stored = frame[125];
    let basic_check = ((basic ^ 0xAA) & 0xFF) as u8;
    let advanced_check = ((advanced ^ 0xAA) & 0xFF) as u8;

    basic_check == stored || advanced_check == stored
}

/// Stamp a valid basic checksum onto an upload frame. Test fixtures and the
/// loopback tools use this; the base never originates upload data.
pub fn stamp_upload_checksum(frame: &mut [u8; FRAME_LEN], fast: bool) {
    let mut sum: u16 = 0;
    let range = if fast { 5..125 } else { 51..115 };
    for &b in &frame[range] {
        sum = sum.wrapping_add(u16::from(b));
    }
    frame[125] = ((sum ^ 0xAA) & 0xFF) as u8;
}

pub fn is_fast_frame(frame: &[u8; FRAME_LEN]) -> bool {
    frame[2] == CONTROL_FAST
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_config_crc32_reference_vector() {
        // Standard check value for CRC-32/ISO-HDLC
        assert_eq!(config_crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_slow_checksum_only_enforced_with_marker() {
        let mut frame = [0u8; FRAME_LEN];
        frame[51] = 0x12;
        frame[125] = 0x00; // wrong checksum on purpose

        // No marker: accepted unconditionally
        assert!(verify_upload_checksum(&frame, false));

        // Marker present: now it must match
        frame[49] = SLOW_CHECKSUM_MARKER;
        assert!(!verify_upload_checksum(&frame, false));
        stamp_upload_checksum(&mut frame, false);
        assert!(verify_upload_checksum(&frame, false));
    }

    #[test]
    fn test_fast_checksum_basic() {
        let mut frame = [0u8; FRAME_LEN];
        for (i, b) in frame[5..125].iter_mut().enumerate() {
            *b = (i & 0xff) as u8;
        }
        stamp_upload_checksum(&mut frame, true);
        assert!(verify_upload_checksum(&frame, true));
        frame[60] ^= 0x01;
        assert!(!verify_upload_checksum(&frame, true));
    }

    #[test]
    fn test_advanced_checksum_accepted() {
        let mut frame = [0u8; FRAME_LEN];
        frame[3..7].copy_from_slice(&[0xbc, 0x00, 0x12, 0x34]);
        for (i, b) in frame[5..125].iter_mut().enumerate() {
            *b = (i * 7 & 0xff) as u8;
        }
        // Recompute what the node would store in advanced mode: payload sum
        // plus the MAC bytes.
        let mut sum: u16 = 0;
        for &b in &frame[5..125] {
            sum = sum.wrapping_add(u16::from(b));
        }
        for &b in &frame[3..7] {
            sum = sum.wrapping_add(u16::from(b));
        }
        frame[125] = ((sum ^ 0xAA) & 0xFF) as u8;
        assert!(verify_upload_checksum(&frame, true));
    }
}
