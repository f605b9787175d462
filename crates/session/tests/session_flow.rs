//! End-to-end session flows against a scripted link: interrogation with
//! and without data, the selective-retransmission path, and monitor mode.

use std::path::Path;
use std::time::Duration;

use framing::checksum::stamp_upload_checksum;
use framing::decode::decode;
use framing::{DecodedFrame, Opcode};
use scheduling::{NodeList, SamplesetSupervisor};
use session::{SessionConfig, SessionManager, SessionState};
use wire_types::link::RecordingLink;

const NODE_MAC: u32 = 0xbc001234;
const UNIT_MAC: u32 = 0xbbe01aae;

struct Fixture {
    _dir: tempfile::TempDir,
    manager: SessionManager,
    supervisor: SamplesetSupervisor,
    link: RecordingLink,
}

fn fixture(node_macs: &[u32], monitor: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let nodelist_path = dir.path().join("nodelist_force.txt");
    let lines: Vec<String> = node_macs.iter().map(|m| format!("{:08x}", m)).collect();
    std::fs::write(&nodelist_path, lines.join("\n")).unwrap();

    let log_dir = dir.path().join("logs");
    let data_root = dir.path().join("data");
    std::fs::create_dir_all(&log_dir).unwrap();
    std::fs::create_dir_all(&data_root).unwrap();

    let cfg = SessionConfig {
        monitor_mode: monitor,
        max_dwell_count: 25,
        max_sampleset_dwell_count: 25,
        config_erase_age: 24,
        force_partial_upload: true,
        clip_negative_temperatures: false,
        nodelist_dir: dir.path().to_path_buf(),
        log_dir,
        data_root,
    };

    let mut nodelist = NodeList::new(&nodelist_path);
    let _ = nodelist.load();

    let mut supervisor = SamplesetSupervisor::new(
        dir.path().join("missing_sampling.txt"),
        dir.path().join("sampleset_db.txt"),
    );
    let _ = supervisor.initialize();

    Fixture {
        manager: SessionManager::new(cfg, nodelist, None),
        supervisor,
        link: RecordingLink::new(),
        _dir: dir,
    }
}

impl Fixture {
    fn tick(&mut self, frame: Option<&DecodedFrame>) {
        self.manager.tick(frame, &mut self.link, &mut self.supervisor);
    }

    fn sent_opcodes(&self) -> Vec<Opcode> {
        self.link
            .frames()
            .iter()
            .map(|f| decode(f).opcode)
            .collect()
    }

    fn log_dir(&self) -> std::path::PathBuf {
        self._dir.path().join("logs")
    }

    fn state_log_text(&self) -> String {
        std::fs::read_to_string(self.log_dir().join("base_states.log")).unwrap_or_default()
    }
}

/// An ack-init response carrying a header-info block.
fn ack_init_frame(source_mac: u32, unit_mac: u32, descriptor: u16, dcb: u8) -> DecodedFrame {
    let mut f = [0u8; 128];
    f[0] = 0x74;
    f[1] = 0x53;
    f[2] = 0x01;
    f[3..7].copy_from_slice(&source_mac.to_be_bytes());
    f[7] = 0x01;
    f[15] = 0x5A; // header-info marker
    f[19] = dcb;
    f[20..24].copy_from_slice(&unit_mac.to_be_bytes());
    f[24..26].copy_from_slice(&descriptor.to_be_bytes());
    f[26..28].copy_from_slice(&2025u16.to_be_bytes());
    f[28] = 10;
    f[29] = 3;
    f[30] = 7;
    f[31] = 41;
    f[32] = 9;
    f[41] = 192;
    f[45] = b'1';
    f[126] = 0x75;
    f[127] = 0x50;
    decode(&f)
}

/// A slow-mode upload data segment with a valid checksum.
fn data_frame(source_mac: u32, segment: u16) -> DecodedFrame {
    let mut f = [0u8; 128];
    f[0] = 0x74;
    f[1] = 0x53;
    f[2] = 0x01;
    f[3..7].copy_from_slice(&source_mac.to_be_bytes());
    f[7] = 0x01;
    f[45] = b'3';
    f[47..49].copy_from_slice(&segment.to_be_bytes());
    f[49] = 0xBB;
    for i in 0..32usize {
        let v = segment as i16;
        f[51 + i * 2..53 + i * 2].copy_from_slice(&v.to_be_bytes());
    }
    f[126] = 0x75;
    f[127] = 0x50;
    stamp_upload_checksum(&mut f, false);
    decode(&f)
}

#[test]
fn idle_with_empty_lists_transmits_nothing() {
    let mut fx = fixture(&[], false);
    // The seeded node list file is empty of valid nodes
    std::fs::write(fx._dir.path().join("nodelist_force.txt"), "").unwrap();

    for _ in 0..5 {
        fx.tick(None);
    }
    assert_eq!(fx.manager.state(), SessionState::Idle);
    assert!(fx.link.frames().is_empty());
}

#[test]
fn interrogation_sends_sample_command() {
    let mut fx = fixture(&[NODE_MAC], false);
    fx.tick(None);

    assert_eq!(fx.manager.state(), SessionState::CommandSequence);
    let frames = fx.link.frames();
    assert_eq!(frames.len(), 1);
    let d = decode(&frames[0]);
    assert_eq!(d.opcode, Opcode::SampleData);
    assert_eq!(d.source_mac, 0xFFFF_FFFF);
    assert_eq!(&frames[0][13..17], &NODE_MAC.to_be_bytes());
}

#[test]
fn node_alive_no_data_settles_then_advances() {
    let mut fx = fixture(&[NODE_MAC], false);
    fx.tick(None);

    // Ack with no data pending
    let ack = ack_init_frame(NODE_MAC, UNIT_MAC, 0x0000, 0x00);
    fx.tick(Some(&ack));
    assert_eq!(fx.manager.state(), SessionState::CommandSequence);

    // Settling window runs 500 ms; nothing advances before it elapses
    fx.tick(None);
    assert_eq!(fx.manager.state(), SessionState::CommandSequence);

    std::thread::sleep(Duration::from_millis(550));
    fx.tick(None);
    assert_eq!(fx.manager.state(), SessionState::Idle);

    // An alive touch file was left behind
    let touch = fx
        ._dir
        .path()
        .join(format!("echobase_alive_{:08x}.txt", NODE_MAC));
    assert!(touch.exists());
}

#[test]
fn upload_happy_path_writes_files_and_result_line() {
    let mut fx = fixture(&[NODE_MAC], false);
    fx.tick(None); // send interrogation

    // descriptor 0x0100: ultrasonic channel, L=0 -> 256 samples, 8 segments
    let ack = ack_init_frame(NODE_MAC, UNIT_MAC, 0x0100, 0x01);
    fx.tick(Some(&ack));
    assert_eq!(fx.manager.state(), SessionState::DataUploadInit);

    // Init settling (120 ms), then the init command goes out
    std::thread::sleep(Duration::from_millis(130));
    fx.link.clear();
    fx.tick(None);
    assert_eq!(fx.manager.state(), SessionState::DataUploadActive);
    assert_eq!(fx.sent_opcodes(), vec![Opcode::UploadPartial]);

    // Active settling (150 ms), then the first data request
    std::thread::sleep(Duration::from_millis(160));
    fx.tick(None);
    assert_eq!(fx.sent_opcodes().len(), 2);

    // All eight segments arrive
    for seg in 0..8u16 {
        let frame = data_frame(NODE_MAC, seg);
        fx.tick(Some(&frame));
    }

    // Completion path ran: files written, back to idle
    assert_eq!(fx.manager.state(), SessionState::Idle);
    let log = fx.state_log_text();
    assert!(log.contains("UPLOAD_RESULT: SUCCESS"));
    assert!(log.contains("Segments: 8/8 (100.0%)"));

    let data_dir = fx._dir.path().join("data").join(format!("{:08x}_ch1", UNIT_MAC));
    assert!(data_dir.join("2025_10_03__07_41_09.txt").exists());
    let dc = fx
        ._dir
        .path()
        .join("data")
        .join("dcvals")
        .join(format!("DC_{:08x}_2025_10_03__07_41_09.txt", UNIT_MAC));
    assert!(dc.exists());
    assert!(fx.log_dir().join("headers.log").exists());
}

#[test]
fn lossy_upload_recovers_via_partial_request() {
    let mut fx = fixture(&[NODE_MAC], false);
    fx.tick(None);

    let ack = ack_init_frame(NODE_MAC, UNIT_MAC, 0x0100, 0x01);
    fx.tick(Some(&ack));
    std::thread::sleep(Duration::from_millis(130));
    fx.tick(None); // init
    std::thread::sleep(Duration::from_millis(160));
    fx.tick(None); // first data request

    // Only segments 0..6 arrive; segment 7 is lost
    for seg in 0..7u16 {
        let frame = data_frame(NODE_MAC, seg);
        fx.tick(Some(&frame));
    }
    assert_eq!(fx.manager.state(), SessionState::DataUploadActive);

    // Packet timeout fires (completion 7/8 -> 250 ms threshold) and the
    // retry strategy picks a partial request
    std::thread::sleep(Duration::from_millis(300));
    fx.link.clear();
    fx.tick(None);
    assert_eq!(fx.manager.state(), SessionState::DataUploadRetry);

    let frames = fx.link.frames();
    assert_eq!(frames.len(), 1);
    match decode(&frames[0]).body {
        framing::FrameBody::PartialRequest {
            start_segment,
            segments,
        } => {
            assert_eq!(start_segment, 7);
            assert_eq!(segments, vec![7]);
        }
        other => panic!("unexpected body {:?}", other),
    }

    // The missing segment lands and the session completes
    let frame = data_frame(NODE_MAC, 7);
    fx.tick(Some(&frame));
    assert_eq!(fx.manager.state(), SessionState::Idle);
    assert!(fx.state_log_text().contains("UPLOAD_RESULT: SUCCESS"));
}

#[test]
fn stray_ack_during_upload_is_ignored() {
    let mut fx = fixture(&[NODE_MAC], false);
    fx.tick(None);

    let ack = ack_init_frame(NODE_MAC, UNIT_MAC, 0x0100, 0x01);
    fx.tick(Some(&ack));
    std::thread::sleep(Duration::from_millis(130));
    fx.tick(None);
    assert_eq!(fx.manager.state(), SessionState::DataUploadActive);

    // A straggler ack arrives mid-upload; the session must not restart
    let stray = ack_init_frame(NODE_MAC, UNIT_MAC, 0x0100, 0x01);
    fx.tick(Some(&stray));
    assert_eq!(fx.manager.state(), SessionState::DataUploadActive);
}

#[test]
fn out_of_range_segment_does_not_count() {
    let mut fx = fixture(&[NODE_MAC], false);
    fx.tick(None);

    let ack = ack_init_frame(NODE_MAC, UNIT_MAC, 0x0100, 0x01);
    fx.tick(Some(&ack));
    std::thread::sleep(Duration::from_millis(130));
    fx.tick(None);

    // Remote overshoots past the final segment
    let frame = data_frame(NODE_MAC, 8);
    fx.tick(Some(&frame));
    let frame = data_frame(NODE_MAC, 0);
    fx.tick(Some(&frame));
    assert_eq!(fx.manager.state(), SessionState::DataUploadActive);
    assert!(!fx.state_log_text().contains("UPLOAD_RESULT"));
}

#[test]
fn monitor_mode_never_transmits() {
    let mut fx = fixture(&[NODE_MAC], true);
    for _ in 0..10 {
        fx.tick(None);
    }
    let ack = ack_init_frame(NODE_MAC, UNIT_MAC, 0x0100, 0x01);
    fx.tick(Some(&ack));

    assert_eq!(fx.manager.state(), SessionState::Idle);
    assert!(fx.link.frames().is_empty());
    // No alive file either: monitor mode only listens
    let touch = Path::new(fx._dir.path()).join(format!("echobase_alive_{:08x}.txt", NODE_MAC));
    assert!(!touch.exists());
}
