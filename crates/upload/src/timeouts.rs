use std::time::Instant;

use wire_types::timing::{
    UPLOAD_EXPECTED_RETRIES_PER_SEGMENT, UPLOAD_GLOBAL_TIMEOUT_MAX_MS,
    UPLOAD_GLOBAL_TIMEOUT_MULTIPLIER, UPLOAD_HIGH_COMPLETION_THRESHOLD,
    UPLOAD_INITIAL_TIMEOUT_MS, UPLOAD_LOW_COMPLETION_THRESHOLD, UPLOAD_MIN_PACKET_TIMEOUT_MS,
    UPLOAD_PACKET_INTERVAL_MS, UPLOAD_PACKET_TIMEOUT_HIGH_LOSS_MS,
    UPLOAD_PACKET_TIMEOUT_NORMAL_MS,
};

use crate::UploadState;

/// Wall-clock bookkeeping for one upload session: time since session
/// start, time since the last accepted packet, and the timeout policy
/// derived from them.
#[derive(Debug, Default)]
pub struct UploadTimeouts {
    pub(crate) session_start: Option<Instant>,
    pub(crate) last_packet: Option<Instant>,
}

impl UploadTimeouts {
    pub fn start_session(&mut self) {
        let now = Instant::now();
        self.session_start = Some(now);
        self.last_packet = Some(now);
    }

    pub fn reset_packet_timer(&mut self) {
        self.last_packet = Some(Instant::now());
    }

    pub fn reset(&mut self) {
        self.session_start = None;
        self.last_packet = None;
    }

    pub fn ms_since_last_packet(&self) -> u64 {
        self.last_packet
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn ms_since_session_start(&self) -> u64 {
        self.session_start
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Packet timeout adapted to the completion ratio. Right after the init
    /// command a short initial-response timeout applies; below 50%
    /// completion arrivals are sparse and the timeout doubles. Every branch
    /// is floored at 250 ms because field captures show benign gaps past
    /// one second from busy remotes.
    pub fn adaptive_packet_timeout_ms(&self, state: UploadState, completion_ratio: f64) -> u64 {
        if state == UploadState::CommandSent {
            return UPLOAD_INITIAL_TIMEOUT_MS;
        }

        let timeout = if completion_ratio > UPLOAD_HIGH_COMPLETION_THRESHOLD {
            UPLOAD_PACKET_TIMEOUT_NORMAL_MS
        } else if completion_ratio < UPLOAD_LOW_COMPLETION_THRESHOLD {
            UPLOAD_PACKET_TIMEOUT_HIGH_LOSS_MS
        } else {
            UPLOAD_PACKET_TIMEOUT_NORMAL_MS
        };

        timeout.max(UPLOAD_MIN_PACKET_TIMEOUT_MS)
    }

    /// Nominal session length on the assumed 5%-success link: one packet
    /// interval per segment times the expected retries per segment.
    pub fn expected_upload_time_ms(total_segments: usize) -> u64 {
        total_segments as u64 * UPLOAD_PACKET_INTERVAL_MS * UPLOAD_EXPECTED_RETRIES_PER_SEGMENT
    }

    /// Hard session ceiling: 15x the expected time, capped at 8 minutes.
    pub fn global_timeout_ms(total_segments: usize) -> u64 {
        (Self::expected_upload_time_ms(total_segments) * UPLOAD_GLOBAL_TIMEOUT_MULTIPLIER)
            .min(UPLOAD_GLOBAL_TIMEOUT_MAX_MS)
    }

    pub fn global_timeout_exceeded(&self, total_segments: usize) -> bool {
        self.ms_since_session_start() > Self::global_timeout_ms(total_segments)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_adaptive_timeout_branches() {
        let t = UploadTimeouts::default();
        assert_eq!(t.adaptive_packet_timeout_ms(UploadState::CommandSent, 0.0), 250);
        assert_eq!(t.adaptive_packet_timeout_ms(UploadState::Receiving, 0.95), 250);
        assert_eq!(t.adaptive_packet_timeout_ms(UploadState::Receiving, 0.30), 500);
        assert_eq!(t.adaptive_packet_timeout_ms(UploadState::Receiving, 0.70), 250);
    }

    #[test]
    fn test_adaptive_timeout_floor() {
        let t = UploadTimeouts::default();
        for ratio in [0.0, 0.25, 0.5, 0.75, 0.9, 1.0] {
            for state in [
                UploadState::CommandSent,
                UploadState::Receiving,
                UploadState::RetryPartial,
            ] {
                assert!(t.adaptive_packet_timeout_ms(state, ratio) >= 250);
            }
        }
    }

    #[test]
    fn test_expected_and_global_timeout() {
        assert_eq!(UploadTimeouts::expected_upload_time_ms(4), 4 * 25 * 100);
        // Small upload: 15x expected under the cap
        assert_eq!(UploadTimeouts::global_timeout_ms(4), 150_000);
        // Large upload hits the 8-minute ceiling
        assert_eq!(UploadTimeouts::global_timeout_ms(1000), 480_000);
    }

    #[test]
    fn test_timers_zero_before_start() {
        let t = UploadTimeouts::default();
        assert_eq!(t.ms_since_last_packet(), 0);
        assert_eq!(t.ms_since_session_start(), 0);
        assert!(!t.global_timeout_exceeded(4));
    }

    #[test]
    fn test_global_timeout_trips_on_old_session() {
        let mut t = UploadTimeouts::default();
        t.start_session();
        // Rewind the session start well past the 4-segment budget
        t.session_start = Some(Instant::now() - Duration::from_millis(200_000));
        assert!(t.global_timeout_exceeded(4));
        assert!(!t.global_timeout_exceeded(1000));
    }

    #[test]
    fn test_packet_timer_resets() {
        let mut t = UploadTimeouts::default();
        t.start_session();
        t.last_packet = Some(Instant::now() - Duration::from_millis(400));
        assert!(t.ms_since_last_packet() >= 400);
        t.reset_packet_timer();
        assert!(t.ms_since_last_packet() < 100);
    }
}
