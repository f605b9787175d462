//! Link and protocol timing constants. Single source of truth; do not
//! duplicate these values elsewhere.

// ---- Upload protocol timeouts ----

/// Wait for the first packet after the upload init command.
pub const UPLOAD_INITIAL_TIMEOUT_MS: u64 = 250;
/// Floor for every adaptive packet timeout.
pub const UPLOAD_MIN_PACKET_TIMEOUT_MS: u64 = 250;
/// Packet timeout in normal conditions (completion 50-90% or above 90%).
pub const UPLOAD_PACKET_TIMEOUT_NORMAL_MS: u64 = 250;
/// Packet timeout under heavy loss (completion below 50%).
pub const UPLOAD_PACKET_TIMEOUT_HIGH_LOSS_MS: u64 = 500;

pub const UPLOAD_HIGH_COMPLETION_THRESHOLD: f64 = 0.90;
pub const UPLOAD_LOW_COMPLETION_THRESHOLD: f64 = 0.50;

/// Nominal interval between consecutive upload packets.
pub const UPLOAD_PACKET_INTERVAL_MS: u64 = 25;
/// Expected attempts per segment on the assumed 5%-success link.
pub const UPLOAD_EXPECTED_RETRIES_PER_SEGMENT: u64 = 100;
pub const UPLOAD_GLOBAL_TIMEOUT_MULTIPLIER: u64 = 15;
/// Absolute ceiling on one upload session (8 minutes).
pub const UPLOAD_GLOBAL_TIMEOUT_MAX_MS: u64 = 480_000;

/// Settling after entering the upload-init state before the init command.
pub const UPLOAD_INIT_STATE_TIMEOUT_MS: u64 = 120;
/// Settling after the init command before the first partial request.
pub const UPLOAD_ACTIVE_STATE_TIMEOUT_MS: u64 = 150;
/// Settling after TX inside the full-retry path.
pub const UPLOAD_TX_SETTLING_MS: u64 = 30;
/// Wait for a response after a partial-upload request before re-sending.
pub const UPLOAD_RETRY_TIMEOUT_MS: u64 = 1000;
/// Effectively unlimited; the global timeout is the real bound.
pub const UPLOAD_MAX_RETRY_COUNT: u32 = 10_000;

// ---- Upload data format ----

pub const SAMPLES_PER_SEGMENT: u32 = 32;
pub const BYTES_PER_SAMPLE: u32 = 2;
pub const BYTES_PER_SEGMENT: u32 = 64;

// ---- Bitmap request ----

/// 76 bytes x 7 usable bits.
pub const MAX_SEGMENTS_PER_REQUEST: u16 = 532;
/// Window scan step; a divisor of 532 so windows line up with natural
/// bitmap boundaries.
pub const BITMAP_SCAN_STRIDE: u16 = 28;
/// Below this many missing segments the window starts at the first one.
pub const BITMAP_OPTIMIZATION_THRESHOLD: usize = 10;

// ---- Command transmission ----

/// Delay between interrogation attempts.
pub const CMD_RETRY_DELAY_MS: u64 = 1800;
pub const CMD_MAX_ATTEMPTS: u32 = 8;
/// TS1X units get extra attempts with a wake command interleaved.
pub const CMD_MAX_ATTEMPTS_TS1X: u32 = 15;
/// Attempt mask for the TS1X pattern r, r, a, r, a, r, a, ...
pub const CMD_TS1X_ALTERNATING_MASK: u32 = 0x0000_5554;
/// Pause after an interrogation sequence completes, so trailing acks clear.
pub const CMD_SETTLING_DELAY_MS: u64 = 500;

// ---- Session ----

pub const SESSION_RESPONSE_TIMEOUT_MS: u64 = 3000;
pub const SESSION_DEFAULT_DWELL_COUNT: u32 = 25;
/// Inter-transmit spacing inside the config broadcaster.
pub const BROADCAST_PACING_MS: u64 = 100;

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_constants_consistent() {
        assert_eq!(MAX_SEGMENTS_PER_REQUEST, 76 * 7);
        assert_eq!(MAX_SEGMENTS_PER_REQUEST % BITMAP_SCAN_STRIDE, 0);
    }

    #[test]
    fn test_segment_geometry() {
        assert_eq!(SAMPLES_PER_SEGMENT * BYTES_PER_SAMPLE, BYTES_PER_SEGMENT);
    }
}
