//! Wireless sensor network base station daemon.
//!
//! Single-threaded cooperative main loop; the only other thread is the
//! byte pump moving serial octets into the frame ring.

mod config;
mod radio;
mod serial;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use framing::decode::{decode, hex_dump};
use framing::frame::RssiParams;
use framing::{FrameRing, Scan};
use scheduling::{NodeList, SamplesetSupervisor};
use session::{ConfigBroadcaster, SessionConfig, SessionManager};
use signal_hook::consts::{SIGINT, SIGTERM};
use wire_types::SerialLink;

use crate::config::Config;
use crate::radio::{rf_channel_adjustment, NoopPins, RadioManager};
use crate::serial::{drain_into_ring, NoFlowControl, PortLink};

const RADIO_STARTUP_RETRY_DELAY: Duration = Duration::from_millis(200);
const DATABASE_FLUSH_INTERVAL: Duration = Duration::from_secs(3600);
const SAMPLING_FILE_CHECK_INTERVAL: Duration = Duration::from_secs(120);
const PING_FILE_UPDATE_MODULO: u64 = 1500;

/// Wireless sensor network base station.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Receive-only mode: no transmissions, no config broadcasts.
    #[arg(long)]
    monitor: bool,

    /// Configuration file path.
    #[arg(long, default_value = "./config.txt")]
    config: PathBuf,
}

fn touch(path: &std::path::Path) {
    if let Err(e) = std::fs::File::create(path) {
        log::warn!("Failed to touch {}: {}", path.display(), e);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config file: {}", cli.config.display()))?;

    if cli.monitor {
        log::info!("MONITOR MODE ENABLED - receive-only operation");
    }
    log::info!("Config loaded from: {}", cli.config.display());
    log::info!("system.ping_file: {}", cfg.ping_file().display());
    log::info!(
        "system.radio_check_period_seconds: {}",
        cfg.radio_check_period_seconds()
    );
    log::info!("session.pi_buffer_size: {}", cfg.ring_size());
    log::info!("session.timer_interval_us: {}", cfg.timer_interval_us());
    log::info!("session.main_loop_delay_us: {}", cfg.main_loop_delay_us());
    log::info!("session.response_timeout_ms: {}", cfg.response_timeout_ms());
    log::info!("uart.device: {}", cfg.serial_device());
    log::info!("output.root_filehandler: {}", cfg.root_filehandler().display());

    if !cfg.validate() {
        bail!("configuration invalid");
    }

    touch(&cfg.ping_file());

    // SIGTERM / SIGINT: finish the current iteration, flush, exit
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))
        .context("failed to register SIGTERM handler")?;
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))
        .context("failed to register SIGINT handler")?;

    // ---- Sampleset management ----
    log::info!("Initializing sampleset management...");
    let mut supervisor =
        SamplesetSupervisor::new(cfg.sampling_file(), cfg.sampleset_database_file());
    match supervisor.initialize() {
        Ok(true) => supervisor.log_samplesets(),
        Ok(false) => log::warn!("No samplesets configured - node-list-only operation"),
        Err(e) => log::warn!("Sampleset supervisor initialization failed: {}", e),
    }

    // ---- Radio bring-up (retry until the hardware answers) ----
    log::info!("Starting radio...");
    let mut radio = RadioManager::new(Box::new(NoopPins), &cfg.serial_device());
    let port = loop {
        if shutdown.load(Ordering::Relaxed) {
            log::info!("Shutdown requested during radio bring-up");
            let _ = supervisor.flush_database();
            return Ok(());
        }
        match radio.start() {
            Some(port) => break port,
            None => std::thread::sleep(RADIO_STARTUP_RETRY_DELAY),
        }
    };
    log::info!("Radio is OK!");

    // Radio adjustment bytes: last writer wins, drained once per loop
    let mut adjustments: VecDeque<u8> = VecDeque::new();
    if let Some(byte) = rf_channel_adjustment(&cfg.rf_channel_file()) {
        adjustments.push_back(byte);
    }

    // ---- Byte pump ----
    let ring = Arc::new(Mutex::new(FrameRing::new(cfg.ring_size() as usize)));
    let pump_paused = Arc::new(AtomicBool::new(false));
    let mut link = PortLink::new(port, Box::new(NoFlowControl));
    let pump_handle = {
        let mut reader = link
            .try_clone_port()
            .context("failed to clone serial port for the byte pump")?;
        let ring = Arc::clone(&ring);
        let shutdown = Arc::clone(&shutdown);
        let paused = Arc::clone(&pump_paused);
        let interval = Duration::from_micros(cfg.timer_interval_us() as u64);
        std::thread::spawn(move || {
            // The pump touches only the serial device and the ring; all
            // protocol state lives on the main thread.
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if paused.load(Ordering::Relaxed) {
                    continue;
                }
                if let Ok(mut ring) = ring.lock() {
                    drain_into_ring(reader.as_mut(), &mut ring);
                }
            }
        })
    };

    // ---- Session machinery ----
    let broadcaster = if cli.monitor {
        None
    } else {
        let rssi = RssiParams {
            threshold: cfg.rssi_threshold() as i8,
            delay: cfg.rssi_delay() as u8,
            increment: cfg.rssi_increment() as u8,
            power_adjust: cfg.power_adjust() as u8,
        };
        match ConfigBroadcaster::new(
            cfg.config_files_directory(),
            rssi,
            cfg.broadcast_interval_hours() as u64,
        ) {
            Some(broadcaster) => {
                log::info!(
                    "Config broadcaster initialized from: {}",
                    cfg.config_files_directory().display()
                );
                Some(broadcaster)
            }
            None => {
                log::warn!("Config broadcasting disabled");
                None
            }
        }
    };

    let mut nodelist = NodeList::new(cfg.node_list_file());
    match nodelist.load() {
        Ok(true) => log::info!("Node list loaded: {} EchoBox nodes", nodelist.len()),
        _ => log::info!("Node list not available yet - will retry"),
    }

    let session_cfg = SessionConfig {
        monitor_mode: cli.monitor,
        max_dwell_count: cfg.dwell_count() as u32,
        max_sampleset_dwell_count: cfg.dwell_count() as u32,
        config_erase_age: 24,
        force_partial_upload: cfg.force_partial_upload(),
        clip_negative_temperatures: cfg.clip_negative_temperatures(),
        nodelist_dir: cfg.nodelist_directory(),
        log_dir: cfg.log_directory(),
        data_root: cfg.data_files_directory(),
    };
    let mut manager = SessionManager::new(session_cfg, nodelist, broadcaster);

    // ---- Main loop ----
    let loop_delay = Duration::from_micros(cfg.main_loop_delay_us().max(1) as u64);
    let radio_check_period = Duration::from_secs(cfg.radio_check_period_seconds() as u64);
    let mut last_radio_check = Instant::now();
    let mut last_db_flush = Instant::now();
    let mut last_sampling_check = Instant::now();
    let mut iteration: u64 = 0;
    let mut fullness_warned = false;

    log::info!("Startup complete. Entering main loop.");

    while !shutdown.load(Ordering::Relaxed) {
        // Periodic radio register re-validation. The pump pauses so the
        // register replies reach us instead of the frame ring.
        if last_radio_check.elapsed() >= radio_check_period {
            pump_paused.store(true, Ordering::Relaxed);
            radio.periodic_check(link.port_mut());
            pump_paused.store(false, Ordering::Relaxed);
            last_radio_check = Instant::now();
        }

        if last_db_flush.elapsed() >= DATABASE_FLUSH_INTERVAL {
            log::info!("Performing hourly database flush");
            if let Err(e) = supervisor.flush_database() {
                log::error!("Database flush failed: {}", e);
            }
            last_db_flush = Instant::now();
        }

        if last_sampling_check.elapsed() >= SAMPLING_FILE_CHECK_INTERVAL {
            match supervisor.check_and_reload_if_changed() {
                Ok(true) => {
                    log::info!("Sampling configuration changed - samplesets updated");
                    supervisor.log_samplesets();
                }
                Ok(false) => {}
                Err(e) => log::warn!("Sampling file check failed: {}", e),
            }
            last_sampling_check = Instant::now();
        }

        // Radio setting changes: last-wins semantics
        if let Some(&last) = adjustments.back() {
            adjustments.clear();
            pump_paused.store(true, Ordering::Relaxed);
            radio.apply_adjustment(link.port_mut(), last);
            pump_paused.store(false, Ordering::Relaxed);
        }

        // One frame-scan step, then one state-machine tick
        let scan = match ring.lock() {
            Ok(mut ring) => {
                let percent = ring.fullness_percent();
                if percent >= 80 && !fullness_warned {
                    log::warn!("RX ring is {}% full", percent);
                    fullness_warned = true;
                } else if percent < 50 {
                    fullness_warned = false;
                }
                ring.scan()
            }
            Err(_) => Scan::Pending,
        };

        match scan {
            Scan::Frame(frame) => {
                let decoded = decode(&frame);
                log::info!(
                    "RX: '{}' [{}] from 0x{:08x}, Data: {}",
                    decoded.raw_opcode as char,
                    decoded.opcode.name(),
                    decoded.source_mac,
                    hex_dump(&frame[..])
                );
                manager.tick(Some(&decoded), &mut link, &mut supervisor);
            }
            Scan::Skipped(byte) => {
                log::debug!("Resync: dropped byte 0x{:02x}", byte);
                manager.tick(None, &mut link, &mut supervisor);
            }
            Scan::Pending => {
                manager.tick(None, &mut link, &mut supervisor);
            }
        }

        iteration += 1;
        if iteration % PING_FILE_UPDATE_MODULO == 0 {
            touch(&cfg.ping_file());
        }

        std::thread::sleep(loop_delay);
    }

    // ---- Shutdown ----
    log::info!("Shutting down - flushing database and closing serial port");
    if let Err(e) = supervisor.flush_database() {
        log::error!("Final database flush failed: {}", e);
    }
    let _ = link.flush();
    let _ = pump_handle.join();
    Ok(())
}
