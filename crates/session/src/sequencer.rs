//! Retry-with-delay wrapper for single opcodes, with an optional
//! alternating-opcode mask (TS1X units stay awake better when the sample
//! command is interleaved with wake commands).

use std::time::{Duration, Instant};

/// Drives repeated transmission of one command until an ack arrives or the
/// attempt budget is spent. The caller polls `ready_to_send()` each tick
/// and reports outcomes back through `mark_sent()` / `record_ack()`.
#[derive(Debug, Default)]
pub struct CommandSequencer {
    primary_op: u8,
    secondary_op: u8,
    mask_bits: u32,
    delay: Duration,
    max_attempts: u32,
    attempts_done: u32,
    last_send: Option<Instant>,
    ack_received: bool,
    active: bool,
}

impl CommandSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a transmission sequence. The first send is due immediately.
    pub fn start(&mut self, op: u8, delay_ms: u64, max_attempts: u32) {
        self.start_with_secondary(op, delay_ms, max_attempts, 0, 0);
    }

    /// Begin a sequence where attempts whose bit is set in `mask_bits` use
    /// `secondary_op` instead (mask covers the first 32 attempts).
    pub fn start_with_secondary(
        &mut self,
        op: u8,
        delay_ms: u64,
        max_attempts: u32,
        secondary_op: u8,
        mask_bits: u32,
    ) {
        self.primary_op = op;
        self.secondary_op = secondary_op;
        self.mask_bits = mask_bits;
        self.delay = Duration::from_millis(delay_ms);
        self.max_attempts = max_attempts;
        self.attempts_done = 0;
        self.ack_received = false;
        self.active = true;
        self.last_send = Instant::now().checked_sub(self.delay);

        if secondary_op != 0 && mask_bits != 0 {
            log::info!(
                target: "cmd_seq",
                "Starting command '{}' with secondary '{}': delay={}ms, max_attempts={}, mask=0x{:08x}",
                op as char, secondary_op as char, delay_ms, max_attempts, mask_bits
            );
        } else {
            log::info!(
                target: "cmd_seq",
                "Starting command '{}': delay={}ms, max_attempts={}",
                op as char, delay_ms, max_attempts
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn ready_to_send(&self) -> bool {
        if !self.active || self.is_complete() {
            return false;
        }
        match self.last_send {
            Some(last) => last.elapsed() >= self.delay,
            None => true,
        }
    }

    /// Opcode for the current attempt, honoring the alternation mask.
    pub fn current_op(&self) -> u8 {
        if self.secondary_op != 0
            && self.mask_bits != 0
            && self.attempts_done < 32
            && self.mask_bits & (1 << self.attempts_done) != 0
        {
            self.secondary_op
        } else {
            self.primary_op
        }
    }

    pub fn mark_sent(&mut self) {
        if !self.active {
            log::error!(target: "cmd_seq", "mark_sent() with no transmission active");
            return;
        }
        self.attempts_done += 1;
        self.last_send = Some(Instant::now());
    }

    pub fn record_ack(&mut self) {
        if !self.active {
            log::warn!(target: "cmd_seq", "ACK received but no transmission active");
            return;
        }
        self.ack_received = true;
        log::info!(
            target: "cmd_seq",
            "ACK received for command '{}' after {} attempt(s)",
            self.primary_op as char,
            self.attempts_done
        );
    }

    pub fn has_ack(&self) -> bool {
        self.ack_received
    }

    pub fn attempts_done(&self) -> u32 {
        self.attempts_done
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Complete when an ack arrived or the attempts are exhausted. An
    /// inactive sequencer reports complete so idle ticks fall through.
    pub fn is_complete(&self) -> bool {
        !self.active || self.ack_received || self.attempts_done >= self.max_attempts
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_first_send_immediate() {
        let mut seq = CommandSequencer::new();
        seq.start(b'R', 1800, 8);
        assert!(seq.ready_to_send());
    }

    #[test]
    fn test_delay_gates_next_send() {
        let mut seq = CommandSequencer::new();
        seq.start(b'R', 1800, 8);
        seq.mark_sent();
        assert!(!seq.ready_to_send());
    }

    #[test]
    fn test_ack_completes() {
        let mut seq = CommandSequencer::new();
        seq.start(b'R', 0, 8);
        seq.mark_sent();
        assert!(!seq.is_complete());
        seq.record_ack();
        assert!(seq.is_complete());
        assert!(seq.has_ack());
        assert!(!seq.ready_to_send());
    }

    #[test]
    fn test_attempts_exhaust() {
        let mut seq = CommandSequencer::new();
        seq.start(b'R', 0, 3);
        for _ in 0..3 {
            assert!(seq.ready_to_send());
            seq.mark_sent();
        }
        assert!(seq.is_complete());
        assert!(!seq.has_ack());
    }

    #[test]
    fn test_alternating_mask_pattern() {
        let mut seq = CommandSequencer::new();
        // r, r, a, r, a, r, a, ... - bits 2,4,6,... select the secondary
        seq.start_with_secondary(b'R', 0, 15, b'a', 0x0000_5554);
        let mut ops = Vec::new();
        for _ in 0..8 {
            ops.push(seq.current_op());
            seq.mark_sent();
        }
        assert_eq!(ops, vec![b'R', b'R', b'a', b'R', b'a', b'R', b'a', b'R']);
    }

    #[test]
    fn test_mask_limited_to_32_attempts() {
        let mut seq = CommandSequencer::new();
        seq.start_with_secondary(b'R', 0, 40, b'a', 0xFFFF_FFFF);
        for _ in 0..32 {
            seq.mark_sent();
        }
        // Past attempt 32 the mask no longer applies
        assert_eq!(seq.current_op(), b'R');
    }

    #[test]
    fn test_inactive_is_complete() {
        let seq = CommandSequencer::new();
        assert!(seq.is_complete());
        assert!(!seq.ready_to_send());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut seq = CommandSequencer::new();
        seq.start(b'R', 100, 8);
        seq.mark_sent();
        seq.record_ack();
        seq.reset();
        assert!(!seq.is_active());
        assert!(!seq.has_ack());
        assert_eq!(seq.attempts_done(), 0);
    }
}
