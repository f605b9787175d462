use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, Timelike};
use framing::frame::{
    encode_interrogate, encode_poll, encode_sample_request, opcode, LocalTimestamp, SampleParams,
};
use framing::{DecodedFrame, FrameBody, Opcode};
use output_files::{write_output_files, DatasetRecord, OutputDirs};
use scheduling::{NodeList, Sampleset, SamplesetSupervisor};
use upload::{RetryDecision, UploadManager, UploadState, UploadTrigger};
use wire_types::timing::{
    CMD_MAX_ATTEMPTS, CMD_MAX_ATTEMPTS_TS1X, CMD_RETRY_DELAY_MS, CMD_SETTLING_DELAY_MS,
    CMD_TS1X_ALTERNATING_MASK, UPLOAD_ACTIVE_STATE_TIMEOUT_MS, UPLOAD_INIT_STATE_TIMEOUT_MS,
    UPLOAD_TX_SETTLING_MS,
};
use wire_types::{SerialLink, UnitKind};

use crate::sequencer::CommandSequencer;
use crate::statelog::StateLog;
use crate::states::SessionState;
use crate::ConfigBroadcaster;

/// Session-level knobs resolved from the config file.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub monitor_mode: bool,
    /// Consecutive uploads allowed from one node-list node before forcing
    /// advancement.
    pub max_dwell_count: u32,
    /// Sampleset acquisitions allowed at end-of-list before the node list
    /// reloads (starvation guard).
    pub max_sampleset_dwell_count: u32,
    pub config_erase_age: u8,
    pub force_partial_upload: bool,
    pub clip_negative_temperatures: bool,
    /// Where alive touch files go.
    pub nodelist_dir: PathBuf,
    pub log_dir: PathBuf,
    pub data_root: PathBuf,
}

/// Decoded ack-init details held between the ack and the upload start.
struct PendingUpload {
    sample_count: u32,
    trigger: UploadTrigger,
}

/// Top-level state machine: polls nodes, runs uploads, interleaves config
/// broadcasts, and owns every lower-level manager (tree-shaped ownership;
/// TX flows through the `SerialLink` handle passed into each tick).
pub struct SessionManager {
    cfg: SessionConfig,
    state: SessionState,
    statelog: StateLog,
    upload: UploadManager,
    sequencer: CommandSequencer,
    nodelist: NodeList,
    broadcaster: Option<ConfigBroadcaster>,
    startup_broadcast_done: bool,

    current_mac: u32,
    dwell_count: u32,
    sampleset_dwell_count: u32,
    awaiting_settling: bool,
    settling_start: Instant,
    /// Elapsed-time anchor for the upload init/active settling windows.
    phase_timer: Instant,
    pending_upload: Option<PendingUpload>,
    /// Set when the active interrogation came from a sampleset; carries
    /// the encoded acquisition parameters for the sample command body.
    pending_sample: Option<SampleParams>,
}

impl SessionManager {
    pub fn new(
        cfg: SessionConfig,
        nodelist: NodeList,
        broadcaster: Option<ConfigBroadcaster>,
    ) -> Self {
        let mut statelog = StateLog::open(&cfg.log_dir);
        statelog.event("startup", "session manager initialized");
        log::info!(
            target: "session_mgr",
            "SessionManager initialized (max dwell {}, retry config: delay={}ms attempts={})",
            cfg.max_dwell_count, CMD_RETRY_DELAY_MS, CMD_MAX_ATTEMPTS
        );
        if cfg.monitor_mode {
            log::info!(
                target: "session_mgr",
                "Monitor mode ENABLED - no TX, no config broadcasts"
            );
        }

        let upload = UploadManager::new(cfg.force_partial_upload);
        Self {
            cfg,
            state: SessionState::Idle,
            statelog,
            upload,
            sequencer: CommandSequencer::new(),
            nodelist,
            broadcaster,
            startup_broadcast_done: false,
            current_mac: 0,
            dwell_count: 0,
            sampleset_dwell_count: 0,
            awaiting_settling: false,
            settling_start: Instant::now(),
            phase_timer: Instant::now(),
            pending_upload: None,
            pending_sample: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_mac(&self) -> u32 {
        self.current_mac
    }

    fn transition(&mut self, new_state: SessionState, reason: &str) {
        if new_state != self.state {
            log::info!(
                target: "session_mgr",
                "STATE TRANSITION: {} -> {} | {}",
                self.state.as_str(),
                new_state.as_str(),
                reason
            );
            self.statelog
                .transition("session", self.state.as_str(), new_state.as_str(), reason);
            self.state = new_state;
        }
    }

    /// One loop iteration: dispatch a received frame (if any), then run
    /// the state machine. In monitor mode frames are only observed.
    pub fn tick(
        &mut self,
        frame: Option<&DecodedFrame>,
        link: &mut dyn SerialLink,
        supervisor: &mut SamplesetSupervisor,
    ) {
        if !self.cfg.monitor_mode {
            if let Some(frame) = frame {
                self.dispatch_frame(frame);
            }
        }
        self.run_state_machine(link, supervisor);
    }

    fn dispatch_frame(&mut self, frame: &DecodedFrame) {
        match frame.opcode {
            Opcode::AckInit => {
                // Stragglers from the pre-upload phase arrive well into the
                // upload; only the idle and interrogation states act on acks
                if self.state == SessionState::Idle
                    || self.state == SessionState::CommandSequence
                {
                    self.handle_ack_init(frame);
                } else {
                    log::info!(
                        target: "session_mgr",
                        "Ignoring stray ACK_INIT during {} state",
                        self.state.as_str()
                    );
                }
            }
            Opcode::DataUpload
                if self.state == SessionState::DataUploadActive
                    || self.state == SessionState::DataUploadRetry =>
            {
                if !frame.checksum_valid {
                    self.upload.record_checksum_error();
                    return;
                }
                if let FrameBody::UploadData(ref data) = frame.body {
                    self.upload.on_upload_data(data);
                    if self.upload.is_complete() {
                        self.transition(SessionState::DataUploadComplete, "All segments received");
                    }
                }
            }
            other => {
                log::info!(
                    target: "session_mgr",
                    "Received unexpected command '{}' (0x{:02x}) in state {}",
                    other.name(),
                    frame.raw_opcode,
                    self.state.as_str()
                );
            }
        }
    }

    fn handle_ack_init(&mut self, frame: &DecodedFrame) {
        let Some(header) = frame.header_info.as_ref() else {
            log::info!(
                target: "session_mgr",
                "Node 0x{:08x}: simple ack (no header info)",
                frame.source_mac
            );
            self.touch_alive_file(frame.source_mac);
            return;
        };

        log::info!(
            target: "session_mgr",
            "Node 0x{:08x}: interrogation response received",
            frame.source_mac
        );
        self.touch_alive_file(frame.source_mac);

        if self.state == SessionState::CommandSequence {
            self.sequencer.record_ack();
        }

        if !header.data_ready() {
            log::info!(
                target: "session_mgr",
                "Node 0x{:08x} alive, no data - next node after settling",
                frame.source_mac
            );
            return;
        }

        let sample_count = header.descriptor.sample_count();
        let Some(trigger) = UploadTrigger::from_frame(frame) else {
            return;
        };

        log::info!(
            target: "session_mgr",
            "Node 0x{:08x} HAS DATA (control_bits=0x{:02x}, descriptor={}, {} samples, {} segments)",
            frame.source_mac,
            header.data_control_bits,
            header.descriptor,
            sample_count,
            sample_count.div_ceil(32)
        );

        self.nodelist.mark_data_ready(frame.source_mac);
        self.current_mac = frame.source_mac;
        self.pending_upload = Some(PendingUpload {
            sample_count,
            trigger,
        });
        self.awaiting_settling = false;
        self.transition(SessionState::DataUploadInit, "Node has data ready for upload");
    }

    fn run_state_machine(&mut self, link: &mut dyn SerialLink, supervisor: &mut SamplesetSupervisor) {
        match self.state {
            SessionState::Idle => self.process_idle(link, supervisor),
            SessionState::CommandSequence => self.process_command_sequence(link),
            SessionState::DataUploadInit => self.process_upload_init(link),
            SessionState::DataUploadActive => self.process_upload_active(link),
            SessionState::DataUploadRetry => self.process_upload_retry(link),
            SessionState::DataUploadComplete => self.process_upload_complete(),
            SessionState::Error => self.process_error(),
        }
    }

    // ---- IDLE ----

    fn process_idle(&mut self, link: &mut dyn SerialLink, supervisor: &mut SamplesetSupervisor) {
        if self.cfg.monitor_mode {
            return;
        }

        self.run_broadcasts(link);

        if self.nodelist.is_empty() && self.nodelist.should_attempt_load() {
            match self.nodelist.load() {
                Ok(true) => log::info!(
                    target: "session_mgr",
                    "Node list loaded: {} EchoBox nodes",
                    self.nodelist.len()
                ),
                _ => log::debug!(
                    target: "session_mgr",
                    "No node list file or empty - will retry later"
                ),
            }
        }

        let has_nodelist = !self.nodelist.is_empty();
        let has_samplesets = supervisor.sampleset_count() > 0;

        if !has_nodelist && !has_samplesets {
            return;
        }

        if !has_nodelist {
            // Sampleset-only operation
            if let Some(set) = supervisor.next_due() {
                self.start_sampleset(&set, link, supervisor);
            }
            return;
        }

        if self.nodelist.is_at_end() {
            if has_samplesets {
                if self.sampleset_dwell_count >= self.cfg.max_sampleset_dwell_count {
                    log::info!(
                        target: "session_mgr",
                        "Sampleset dwell limit reached ({}), reloading node list to prevent starvation",
                        self.sampleset_dwell_count
                    );
                    self.sampleset_dwell_count = 0;
                } else if let Some(set) = supervisor.next_due() {
                    self.start_sampleset(&set, link, supervisor);
                    return;
                } else {
                    self.sampleset_dwell_count = 0;
                }
            }

            match self.nodelist.check_and_reload_if_at_end() {
                Ok(true) => log::info!(
                    target: "session_mgr",
                    "Node list reloaded: {} EchoBox nodes",
                    self.nodelist.len()
                ),
                _ => {
                    log::warn!(target: "session_mgr", "Node list reload failed or empty");
                    return;
                }
            }
            self.sampleset_dwell_count = 0;
        }

        let Some(mac) = self.nodelist.current_mac() else {
            return;
        };
        self.current_mac = mac;
        self.pending_sample = None;
        log::info!(
            target: "session_mgr",
            "Interrogating node {}/{}: 0x{:08x}",
            self.nodelist.current_index() + 1,
            self.nodelist.len(),
            mac
        );

        self.sequencer
            .start(opcode::SAMPLE_DATA, CMD_RETRY_DELAY_MS, CMD_MAX_ATTEMPTS);
        self.awaiting_settling = false;
        self.transition(
            SessionState::CommandSequence,
            "Starting interrogation sequence",
        );
        self.send_command(link);
    }

    fn run_broadcasts(&mut self, link: &mut dyn SerialLink) {
        let Some(broadcaster) = self.broadcaster.as_mut() else {
            return;
        };

        let due_startup = !self.startup_broadcast_done;
        let due_periodic = broadcaster.is_time_for_periodic();
        if !due_startup && !due_periodic {
            return;
        }

        if self.nodelist.is_empty() {
            log::info!(
                target: "session_mgr",
                "Skipping config broadcast - node list is empty"
            );
            // Startup broadcast stays pending until nodes exist
            return;
        }

        log::info!(
            target: "session_mgr",
            "=== {} Config Broadcast ===",
            if due_startup { "Startup" } else { "Periodic" }
        );
        if let Err(e) = broadcaster.broadcast_all(link, self.cfg.config_erase_age, &mut self.statelog)
        {
            log::error!(target: "session_mgr", "Config broadcast failed: {}", e);
        }
        self.startup_broadcast_done = true;
    }

    fn start_sampleset(
        &mut self,
        set: &Sampleset,
        link: &mut dyn SerialLink,
        supervisor: &mut SamplesetSupervisor,
    ) {
        log::info!(
            target: "session_mgr",
            "Sampling sampleset: node 0x{:08x}, mask=0x{:02x}, {} (dwell {}/{})",
            set.nodeid,
            set.sampling_mask,
            if set.ac { "AC" } else { "DC" },
            self.sampleset_dwell_count + 1,
            self.cfg.max_sampleset_dwell_count
        );

        self.current_mac = set.nodeid;
        self.pending_sample = Some(if set.ac {
            SampleParams::ac(set.sampling_mask, set.max_freq_hz, set.resolution)
        } else {
            SampleParams::dc(set.sampling_mask)
        });

        // TS1X-class units hold their wake state better when wake commands
        // are interleaved into the retry sequence
        match UnitKind::from_mac(set.nodeid) {
            UnitKind::Ts1x | UnitKind::Cronos => self.sequencer.start_with_secondary(
                opcode::SAMPLE_DATA,
                CMD_RETRY_DELAY_MS,
                CMD_MAX_ATTEMPTS_TS1X,
                opcode::WAKE_LC,
                CMD_TS1X_ALTERNATING_MASK,
            ),
            _ => self
                .sequencer
                .start(opcode::SAMPLE_DATA, CMD_RETRY_DELAY_MS, CMD_MAX_ATTEMPTS),
        }

        supervisor.record_sample(set);
        self.awaiting_settling = false;
        self.transition(
            SessionState::CommandSequence,
            "Starting sampleset acquisition",
        );
        self.send_command(link);
    }

    fn send_command(&mut self, link: &mut dyn SerialLink) {
        let op = self.sequencer.current_op();
        let frame = match (op, self.pending_sample.as_ref()) {
            (opcode::SAMPLE_DATA, Some(params)) => {
                encode_sample_request(self.current_mac, params)
            }
            (opcode::SAMPLE_DATA, None) => {
                encode_interrogate(self.current_mac, &local_timestamp())
            }
            _ => encode_poll(op, self.current_mac),
        };

        if let Err(e) = link.send_frame(&frame) {
            log::error!(target: "session_mgr", "TX failed: {}", e);
            return;
        }

        log::info!(
            target: "session_mgr",
            "TX: '{}' command to node 0x{:08x} (attempt {}/{})",
            op as char,
            self.current_mac,
            self.sequencer.attempts_done() + 1,
            self.sequencer.max_attempts()
        );
        self.statelog.event(
            "tx",
            &format!(
                "'{}' to 0x{:08x} (attempt {}/{})",
                op as char,
                self.current_mac,
                self.sequencer.attempts_done() + 1,
                self.sequencer.max_attempts()
            ),
        );
        self.sequencer.mark_sent();
    }

    // ---- COMMAND_SEQUENCE ----

    fn process_command_sequence(&mut self, link: &mut dyn SerialLink) {
        if self.sequencer.is_complete() {
            if !self.awaiting_settling {
                self.awaiting_settling = true;
                self.settling_start = Instant::now();
                if self.sequencer.has_ack() {
                    log::info!(
                        target: "session_mgr",
                        "Sequence complete for node 0x{:08x} (ACK received) - settling {}ms",
                        self.current_mac, CMD_SETTLING_DELAY_MS
                    );
                } else {
                    log::warn!(
                        target: "session_mgr",
                        "Sequence complete for node 0x{:08x} (NO ACK after {} attempts) - settling {}ms",
                        self.current_mac,
                        self.sequencer.max_attempts(),
                        CMD_SETTLING_DELAY_MS
                    );
                }
            }

            if self.settling_start.elapsed() >= Duration::from_millis(CMD_SETTLING_DELAY_MS) {
                self.awaiting_settling = false;
                let had_ack = self.sequencer.has_ack();
                let was_sampleset = self.pending_sample.take().is_some();
                self.sequencer.reset();
                self.upload.reset();
                self.dwell_count = 0;

                if !was_sampleset {
                    self.nodelist.advance();
                }

                let reason = if had_ack {
                    "Command sequence completed (no data), moving on"
                } else {
                    "No response from node, moving on"
                };
                self.transition(SessionState::Idle, reason);
            }
            return;
        }

        if self.sequencer.ready_to_send() {
            self.send_command(link);
        }
    }

    // ---- DATA_UPLOAD_INIT ----

    fn process_upload_init(&mut self, link: &mut dyn SerialLink) {
        if self.upload.state() == UploadState::Idle {
            let Some(pending) = self.pending_upload.take() else {
                log::error!(target: "session_mgr", "No pending upload response");
                self.transition(
                    SessionState::Error,
                    "Upload init without valid triggering response",
                );
                return;
            };

            match self.upload.start(
                self.current_mac,
                0,
                pending.sample_count,
                pending.trigger,
            ) {
                Ok(()) => {
                    log::info!(
                        target: "session_mgr",
                        "Upload initialized for node 0x{:08x}: {} samples, settling {}ms before init",
                        self.current_mac, pending.sample_count, UPLOAD_INIT_STATE_TIMEOUT_MS
                    );
                    self.statelog.event(
                        "upload",
                        &format!(
                            "UPLOAD START: node 0x{:08x} | samples {} | segments {}",
                            self.current_mac,
                            pending.sample_count,
                            pending.sample_count.div_ceil(32)
                        ),
                    );
                    self.phase_timer = Instant::now();
                }
                Err(e) => {
                    log::error!(target: "session_mgr", "Failed to initialize upload: {}", e);
                    self.log_upload_result(false, "Failed to initialize upload manager");
                    self.transition(SessionState::Error, "Upload manager failed to initialize");
                }
            }
            return;
        }

        // Let acks from the interrogation phase clear before the init TX
        if self.phase_timer.elapsed() >= Duration::from_millis(UPLOAD_INIT_STATE_TIMEOUT_MS) {
            match self.upload.send_init(link) {
                Ok(()) => {
                    self.statelog.event(
                        "tx",
                        &format!("upload init to 0x{:08x}", self.current_mac),
                    );
                    self.phase_timer = Instant::now();
                    self.transition(
                        SessionState::DataUploadActive,
                        "Init sent, settling before first data request",
                    );
                }
                Err(e) => {
                    log::error!(target: "session_mgr", "Failed to send upload init: {}", e);
                    self.log_upload_result(false, "Failed to send upload init command");
                    self.transition(SessionState::Error, "Failed to send upload init command");
                }
            }
        }
    }

    // ---- DATA_UPLOAD_ACTIVE ----

    fn process_upload_active(&mut self, link: &mut dyn SerialLink) {
        if self.upload.is_complete() {
            self.transition(SessionState::DataUploadComplete, "Upload completed");
            return;
        }
        if self.upload.has_failed() {
            self.log_upload_result(false, "Max retries exceeded");
            self.transition(SessionState::Error, "Upload exceeded maximum retry attempts");
            return;
        }
        if self.upload.check_global_timeout() {
            self.log_upload_result(false, "Global timeout exceeded");
            self.transition(SessionState::Error, "Upload abandoned - global timeout");
            return;
        }

        if self.upload.state() == UploadState::CommandSent {
            // After the init command, wait out the ack burst before the
            // first data request
            if self.phase_timer.elapsed() >= Duration::from_millis(UPLOAD_ACTIVE_STATE_TIMEOUT_MS)
            {
                match self.upload.send_partial(link) {
                    Ok(true) => {
                        self.statelog.event(
                            "tx",
                            &format!("initial data request to 0x{:08x}", self.current_mac),
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        log::error!(
                            target: "session_mgr",
                            "Failed to send initial data request: {}",
                            e
                        );
                        self.log_upload_result(false, "Failed to send initial data request");
                        self.transition(SessionState::Error, "Failed to send data request");
                    }
                }
            }
            return;
        }

        self.evaluate_packet_timeout(link);
    }

    fn evaluate_packet_timeout(&mut self, link: &mut dyn SerialLink) {
        let timeout = self.upload.adaptive_timeout_ms();
        let since_packet = self.upload.ms_since_last_packet();
        if since_packet <= timeout {
            return;
        }

        let (decision, reason) = self.upload.evaluate_retry();
        log::info!(
            target: "session_mgr",
            "Packet timeout: waited {} ms (threshold {} ms) -> {:?}",
            since_packet, timeout, decision
        );

        match decision {
            RetryDecision::RetryFull => {
                self.statelog.event(
                    "timeout",
                    &format!(
                        "full retry | {} | retry {}/{}",
                        reason,
                        self.upload.retry_count() + 1,
                        self.upload.max_retries()
                    ),
                );
                if self.upload.retry_count() >= self.upload.max_retries() {
                    self.log_upload_result(false, "Max retries exceeded on init timeout");
                    self.transition(SessionState::Error, "Upload abandoned - max retries");
                    return;
                }
                self.upload.reset_for_retry();
                // Brief settle so the retry TX does not collide with a
                // straggling segment
                std::thread::sleep(Duration::from_millis(UPLOAD_TX_SETTLING_MS));
                match self.upload.send_init(link) {
                    Ok(()) => {
                        self.statelog.event(
                            "tx",
                            &format!(
                                "retry upload init to 0x{:08x} | attempt {}/{}",
                                self.current_mac,
                                self.upload.retry_count(),
                                self.upload.max_retries()
                            ),
                        );
                    }
                    Err(e) => {
                        log::error!(target: "session_mgr", "Failed to retry init: {}", e);
                        self.log_upload_result(false, "Failed to send retry init command");
                        self.transition(SessionState::Error, "Failed to retry upload init");
                    }
                }
            }
            RetryDecision::RetryPartial => {
                self.statelog.event(
                    "timeout",
                    &format!(
                        "partial retry | {} | {}/{} received",
                        reason,
                        self.upload.received_segments(),
                        self.upload.total_segments()
                    ),
                );
                match self.upload.send_partial(link) {
                    Ok(true) => {
                        self.transition(
                            SessionState::DataUploadRetry,
                            "Partial request sent, waiting for response",
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        log::error!(target: "session_mgr", "Failed to send partial request: {}", e);
                        self.log_upload_result(false, "Failed to send retry command");
                        self.transition(SessionState::Error, "Failed to send partial request");
                    }
                }
            }
            RetryDecision::Wait => {
                log::debug!(target: "session_mgr", "Timeout evaluation: keep waiting");
            }
        }
    }

    // ---- DATA_UPLOAD_RETRY ----

    fn process_upload_retry(&mut self, link: &mut dyn SerialLink) {
        if self.upload.is_complete() {
            self.transition(
                SessionState::DataUploadComplete,
                "All segments received after retry",
            );
            return;
        }
        if self.upload.has_failed() {
            self.log_upload_result(false, "Max retries exceeded in retry state");
            self.transition(SessionState::Error, "Upload failed - returning to node list");
            return;
        }
        if self.upload.check_global_timeout() {
            self.log_upload_result(false, "Global timeout exceeded in retry state");
            self.transition(SessionState::Error, "Upload timeout in retry state");
            return;
        }

        // Data flowing again: hand back to the active-state machinery
        if self.upload.state() == UploadState::Receiving {
            self.transition(
                SessionState::DataUploadActive,
                "Receiving data after retry, resuming",
            );
            return;
        }

        if self.upload.ms_since_last_packet() > self.upload.retry_timeout_ms() {
            log::warn!(
                target: "session_mgr",
                "No response to partial request after {} ms, re-sending",
                self.upload.retry_timeout_ms()
            );
            match self.upload.send_partial(link) {
                Ok(true) => {
                    self.statelog.event(
                        "tx",
                        &format!(
                            "re-send partial request | retry {}/{} | missing {}",
                            self.upload.retry_count(),
                            self.upload.max_retries(),
                            self.upload.missing_segments()
                        ),
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!(target: "session_mgr", "Failed to re-send partial request: {}", e);
                    self.log_upload_result(false, "Failed to send retry command");
                    self.transition(SessionState::Error, "Upload failed - could not send retry");
                }
            }
        }
    }

    // ---- DATA_UPLOAD_COMPLETE ----

    fn process_upload_complete(&mut self) {
        self.log_upload_result(true, "COMPLETE");
        self.write_output_files();

        self.upload.reset();
        self.sequencer.reset();
        self.pending_sample = None;

        let is_node = self.nodelist.contains(self.current_mac);
        if is_node {
            self.dwell_count += 1;
            log::info!(
                target: "session_mgr",
                "Upload complete from node 0x{:08x} (dwell {}/{})",
                self.current_mac, self.dwell_count, self.cfg.max_dwell_count
            );
            if self.dwell_count >= self.cfg.max_dwell_count {
                log::info!(target: "session_mgr", "Max dwell count reached, advancing");
                self.dwell_count = 0;
                self.nodelist.advance();
            }
        } else if self.current_mac != 0 {
            self.sampleset_dwell_count += 1;
            log::info!(
                target: "session_mgr",
                "Upload complete from sampleset node 0x{:08x} (sampleset dwell {}/{})",
                self.current_mac,
                self.sampleset_dwell_count,
                self.cfg.max_sampleset_dwell_count
            );
        }

        self.transition(SessionState::Idle, "Upload completed, returning to polling");
    }

    fn write_output_files(&mut self) {
        let Some(trigger) = self.upload.trigger().cloned() else {
            log::error!(target: "session_mgr", "Completed upload has no triggering frame");
            self.statelog.event("files", "FILE WRITE ERROR: no triggering frame");
            return;
        };
        let samples = self.upload.data();
        let record = DatasetRecord {
            samples: &samples,
            source_mac: trigger.source_mac,
            header: &trigger.header,
            status: &trigger.status,
            clip_negative_temperatures: self.cfg.clip_negative_temperatures,
        };
        let dirs = OutputDirs {
            data_root: self.cfg.data_root.clone(),
            log_dir: self.cfg.log_dir.clone(),
        };
        match write_output_files(&dirs, &record) {
            Ok(written) => {
                self.statelog.event(
                    "files",
                    &format!(
                        "FILES WRITTEN: DC={} | DATA={}",
                        written
                            .dc_file
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                        written
                            .data_file
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default()
                    ),
                );
            }
            Err(e) => {
                log::error!(target: "session_mgr", "Output file write failed: {}", e);
                self.statelog.event(
                    "files",
                    &format!(
                        "FILE WRITE ERROR: node 0x{:08x}: {}",
                        self.current_mac, e
                    ),
                );
            }
        }
    }

    // ---- ERROR ----

    fn process_error(&mut self) {
        log::error!(
            target: "session_mgr",
            "Error state for node 0x{:08x}, moving to next node",
            self.current_mac
        );
        self.upload.reset();
        self.sequencer.reset();
        self.pending_sample = None;
        self.pending_upload = None;
        self.awaiting_settling = false;
        self.dwell_count = 0;
        self.nodelist.advance();
        self.transition(SessionState::Idle, "Error recovery - moving to next node");
    }

    // ---- helpers ----

    /// One greppable line per upload outcome, in the state log and the
    /// main log.
    fn log_upload_result(&mut self, success: bool, reason: &str) {
        let duration_ms = self.upload.ms_since_session_start();
        let received = self.upload.received_segments();
        let total = self.upload.total_segments();
        let completion = if total > 0 {
            100.0 * received as f64 / total as f64
        } else {
            0.0
        };
        let line = format!(
            "UPLOAD_RESULT: {} | Node: 0x{:08X} | Duration: {}.{:03} s | Segments: {}/{} ({:.1}%) | Retries: {} | Link: {:.1}% | Reason: {}",
            if success { "SUCCESS" } else { "FAILED" },
            self.current_mac,
            duration_ms / 1000,
            duration_ms % 1000,
            received,
            total,
            completion,
            self.upload.retry_count(),
            self.upload.link_rate_percent(),
            reason
        );
        log::info!(target: "session_mgr", "{}", line);
        self.statelog.event("upload_result", &line);
    }

    /// Every responsive node leaves a touch file behind for the fleet
    /// dashboards.
    fn touch_alive_file(&self, mac: u32) {
        let path = self
            .cfg
            .nodelist_dir
            .join(format!("echobase_alive_{:08x}.txt", mac));
        match std::fs::File::create(&path) {
            Ok(_) => log::info!(target: "session_mgr", "Touched alive file: {}", path.display()),
            Err(e) => log::warn!(
                target: "session_mgr",
                "Failed to touch alive file {}: {}",
                path.display(),
                e
            ),
        }
    }
}

fn local_timestamp() -> LocalTimestamp {
    let now = Local::now();
    LocalTimestamp {
        year: now.year() as u16,
        month: now.month() as u8,
        day: now.day() as u8,
        hour: now.hour() as u8,
        min: now.minute() as u8,
        sec: now.second() as u8,
    }
}
