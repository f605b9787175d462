use framing::{bitmap, frame, DecodedFrame, UploadData};
use thiserror::Error;
use wire_types::timing::{UPLOAD_MAX_RETRY_COUNT, UPLOAD_RETRY_TIMEOUT_MS};
use wire_types::{HeaderInfo, LinkError, SerialLink, UnitStatus};

use crate::segments::SegmentTracker;
use crate::stats::UploadStats;
use crate::strategy::{evaluate_retry, RetryDecision};
use crate::timeouts::UploadTimeouts;
use crate::UploadState;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload already in progress (state {0})")]
    NotIdle(&'static str),
    #[error("descriptor decodes to an empty dataset")]
    EmptyDataset,
    #[error("not in a state that can send (state {0})")]
    WrongState(&'static str),
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Copy of the ack-init frame that triggered the session. The output-file
/// writer needs it after the last segment lands.
#[derive(Debug, Clone)]
pub struct UploadTrigger {
    pub source_mac: u32,
    pub header: HeaderInfo,
    pub status: UnitStatus,
}

impl UploadTrigger {
    /// Capture the relevant pieces of a decoded ack-init frame. Returns
    /// None when the frame carries no header-info block.
    pub fn from_frame(frame: &DecodedFrame) -> Option<Self> {
        Some(Self {
            source_mac: frame.source_mac,
            header: frame.header_info.clone()?,
            status: frame.status.clone().unwrap_or_default(),
        })
    }
}

/// Coordinator for one upload session from a single node.
pub struct UploadManager {
    state: UploadState,
    target_mac: u32,
    start_addr: u32,
    length_samples: u32,
    tracker: SegmentTracker,
    timeouts: UploadTimeouts,
    stats: UploadStats,
    retry_count: u32,
    max_retries: u32,
    /// Init with an all-bits partial request instead of the plain full
    /// upload command; some node firmware revisions only accept the former.
    force_partial: bool,
    trigger: Option<UploadTrigger>,
}

impl UploadManager {
    pub fn new(force_partial: bool) -> Self {
        log::info!(
            target: "upload_mgr",
            "UploadManager initialized (max_retries={}, retry_timeout={} ms)",
            UPLOAD_MAX_RETRY_COUNT, UPLOAD_RETRY_TIMEOUT_MS
        );
        Self {
            state: UploadState::Idle,
            target_mac: 0,
            start_addr: 0,
            length_samples: 0,
            tracker: SegmentTracker::default(),
            timeouts: UploadTimeouts::default(),
            stats: UploadStats::default(),
            retry_count: 0,
            max_retries: UPLOAD_MAX_RETRY_COUNT,
            force_partial,
            trigger: None,
        }
    }

    fn transition(&mut self, new_state: UploadState, reason: &str) {
        if new_state != self.state {
            log::info!(
                target: "upload_mgr",
                "STATE TRANSITION: {} -> {} | {}",
                self.state.as_str(),
                new_state.as_str(),
                reason
            );
            self.state = new_state;
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn target_mac(&self) -> u32 {
        self.target_mac
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_timeout_ms(&self) -> u64 {
        UPLOAD_RETRY_TIMEOUT_MS
    }

    pub fn received_segments(&self) -> usize {
        self.tracker.received_count()
    }

    pub fn total_segments(&self) -> usize {
        self.tracker.total_count()
    }

    pub fn missing_segments(&self) -> usize {
        self.tracker.missing_count()
    }

    pub fn link_rate_percent(&self) -> f64 {
        self.stats.link_rate_percent()
    }

    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }

    pub fn ms_since_last_packet(&self) -> u64 {
        self.timeouts.ms_since_last_packet()
    }

    pub fn ms_since_session_start(&self) -> u64 {
        self.timeouts.ms_since_session_start()
    }

    pub fn adaptive_timeout_ms(&self) -> u64 {
        self.timeouts
            .adaptive_packet_timeout_ms(self.state, self.tracker.completion_ratio())
    }

    pub fn check_global_timeout(&self) -> bool {
        self.timeouts
            .global_timeout_exceeded(self.tracker.total_count())
    }

    pub fn evaluate_retry(&self) -> (RetryDecision, String) {
        evaluate_retry(
            self.state,
            self.tracker.received_count(),
            self.tracker.total_count(),
            self.retry_count,
            self.max_retries,
        )
    }

    /// Begin a session. Refuses a zero-length dataset and refuses to
    /// preempt a running session.
    pub fn start(
        &mut self,
        target_mac: u32,
        start_addr: u32,
        num_samples: u32,
        trigger: UploadTrigger,
    ) -> Result<(), UploadError> {
        if self.state != UploadState::Idle {
            return Err(UploadError::NotIdle(self.state.as_str()));
        }
        if num_samples == 0 {
            return Err(UploadError::EmptyDataset);
        }

        self.target_mac = target_mac;
        self.start_addr = start_addr;
        self.length_samples = num_samples;
        self.tracker = SegmentTracker::for_samples(num_samples);
        self.timeouts.start_session();
        self.stats.reset();
        self.retry_count = 0;
        self.trigger = Some(trigger);

        self.transition(UploadState::Init, "Upload session initialized");
        log::info!(
            target: "upload_mgr",
            "Initialized upload: mac=0x{:08x}, start={}, samples={}, segments={}",
            target_mac, start_addr, num_samples, self.tracker.total_count()
        );
        Ok(())
    }

    /// Send the init command: either the plain full-upload opcode or, in
    /// force-partial mode, a partial request with every segment marked.
    pub fn send_init(&mut self, link: &mut dyn SerialLink) -> Result<(), UploadError> {
        if self.state != UploadState::Init {
            return Err(UploadError::WrongState(self.state.as_str()));
        }

        let total = self.tracker.total_count();
        if self.force_partial {
            let missing = self.tracker.missing();
            let (map, _) = bitmap::build(&missing, total as u16, 0);
            let cmd = frame::encode_partial_upload(self.target_mac, 0, &map);
            link.send_frame(&cmd)?;
            self.transition(
                UploadState::CommandSent,
                "Sent partial-mode upload init command",
            );
            log::info!(
                target: "upload_mgr",
                "Sent 0x55 upload init: start_seg=0, requesting {} segments (force-partial mode)",
                total
            );
        } else {
            let cmd =
                frame::encode_upload_init(self.target_mac, self.start_addr, self.length_samples);
            link.send_frame(&cmd)?;
            self.transition(UploadState::CommandSent, "Sent full upload init command");
            log::info!(
                target: "upload_mgr",
                "Sent 0x51 upload command: start={}, length={} ({} segments)",
                self.start_addr / 32, self.length_samples / 32, total
            );
        }
        self.stats.on_segments_requested(total);
        Ok(())
    }

    /// Build and send a selective-retransmission request for the current
    /// missing set, window-optimized. Returns false with no TX when
    /// nothing is missing.
    pub fn send_partial(&mut self, link: &mut dyn SerialLink) -> Result<bool, UploadError> {
        if self.tracker.is_complete() {
            return Ok(false);
        }
        let missing = self.tracker.missing();
        let Some(first) = missing.first().copied() else {
            return Ok(false);
        };

        self.stats.on_segments_requested(missing.len());
        self.timeouts.reset_packet_timer();

        let total = self.tracker.total_count() as u16;
        let start = bitmap::find_optimal_start(&missing, total).unwrap_or(first);
        let (map, covered) = bitmap::build(&missing, total, start);
        let cmd = frame::encode_partial_upload(self.target_mac, start, &map);
        link.send_frame(&cmd)?;

        self.transition(UploadState::RetryPartial, "Sent partial upload request");
        self.retry_count += 1;
        log::info!(
            target: "upload_mgr",
            "Sent 0x55 partial upload (retry {}/{}): start_seg={}, covering {}/{} missing",
            self.retry_count, self.max_retries, start, covered, missing.len()
        );
        Ok(true)
    }

    /// Accept one upload-data segment. Out-of-range indices are ignored
    /// (remotes overshoot past the final segment); duplicates are benign.
    pub fn on_upload_data(&mut self, data: &UploadData) {
        self.stats.on_packet_received();

        let index = usize::from(data.segment);
        let total = self.tracker.total_count();
        if index >= total {
            log::info!(
                target: "upload_mgr",
                "Ignoring out-of-range segment {} (expected 0-{})",
                index,
                total.saturating_sub(1)
            );
            return;
        }

        if self.tracker.is_received(index) {
            log::warn!(target: "upload_mgr", "Duplicate segment {}", index);
            return;
        }

        if self.tracker.mark_received(index, &data.samples) {
            self.timeouts.reset_packet_timer();
            self.transition(UploadState::Receiving, "Received upload data segment");
            let received = self.tracker.received_count();
            log::info!(
                target: "upload_mgr",
                "Received {} segment {} ({}/{})",
                if data.fast { "fast" } else { "slow" },
                index, received, total
            );
            if received % 10 == 0 {
                log::info!(
                    target: "upload_mgr",
                    "Upload progress: {}/{} segments ({:.1}%)",
                    received, total,
                    100.0 * self.tracker.completion_ratio()
                );
            }
        }
    }

    pub fn record_checksum_error(&mut self) {
        self.stats.on_checksum_error();
    }

    /// Full-retry path: drop all progress, keep the target and trigger,
    /// bump the retry counter, return to the init state.
    pub fn reset_for_retry(&mut self) {
        self.tracker.clear();
        self.retry_count += 1;
        log::info!(
            target: "upload_mgr",
            "Retrying full upload (attempt {}/{}) - assuming init command was lost",
            self.retry_count, self.max_retries
        );
        self.transition(UploadState::Init, "Retrying upload after init timeout");
    }

    pub fn reset(&mut self) {
        self.tracker = SegmentTracker::default();
        self.timeouts.reset();
        self.stats.reset();
        self.transition(UploadState::Idle, "Reset upload manager");
        self.target_mac = 0;
        self.start_addr = 0;
        self.length_samples = 0;
        self.retry_count = 0;
        self.trigger = None;
    }

    pub fn is_complete(&self) -> bool {
        self.tracker.is_complete()
    }

    pub fn has_failed(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// The collected dataset, `total * 32` samples in segment order.
    pub fn data(&self) -> Vec<i16> {
        self.tracker.flat_samples()
    }

    pub fn trigger(&self) -> Option<&UploadTrigger> {
        self.trigger.as_ref()
    }
}
