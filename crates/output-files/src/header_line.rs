//! The one-line-per-dataset header log.

use std::io::Write;
use std::path::Path;

use chrono::Local;
use wire_types::convert;

use crate::{ensure_dir, DatasetRecord, OutputError};

pub const HEADER_LOG_NAME: &str = "headers.log";

fn push_field(line: &mut String, text: String) {
    line.push(' ');
    line.push_str(&text);
}

/// Render the header entry for one dataset, without the timestamp prefix.
/// Diagnostic fields are only emitted when they carry signal, which keeps
/// the lines short for healthy nodes.
pub fn build_header_line(record: &DatasetRecord<'_>) -> String {
    let header = record.header;
    let status = record.status;
    let descriptor = header.descriptor;

    let mut line = String::from("Push_header echo");
    push_field(&mut line, format!("ECHO={:08x}", record.source_mac));
    push_field(&mut line, format!("MIST={:08x}", header.unit_mac));

    let mut desc = String::from("Desc (");
    if header.rssi != 0 && header.rssi != 255 {
        desc.push_str(&format!("{} ", header.rssi));
    }
    desc.push_str(&format!(
        "{:04x} L={})",
        descriptor.raw(),
        descriptor.sample_count()
    ));
    push_field(&mut line, desc);

    let dt = header.dataset_time;
    line.push_str(&format!(
        "  {:04}/{:02}/{:02}-{:02}:{:02}:{:02}",
        dt.year, dt.month, dt.day, dt.hour, dt.min, dt.sec
    ));

    push_field(&mut line, format!("DCB={:02x}", header.data_control_bits));
    push_field(&mut line, format!("CRC={:08x}", status.on_deck_crc));
    push_field(&mut line, format!("DataSize={}", record.samples.len()));
    push_field(&mut line, format!("ChMask={:02x}", descriptor.channel_mask()));

    let mut channels = String::from("Ch=[");
    let mut first = true;
    for (bit, name) in [(0x01, "US"), (0x02, "X"), (0x04, "Y"), (0x08, "Z")] {
        if descriptor.channel_mask() & bit != 0 {
            if !first {
                channels.push(',');
            }
            channels.push_str(name);
            first = false;
        }
    }
    if first {
        channels.push_str("None");
    }
    channels.push(']');
    push_field(&mut line, channels);

    push_field(&mut line, format!("SR={}", descriptor.rate_label()));
    push_field(
        &mut line,
        format!("Mode={}", if descriptor.rms_only() { "RMS" } else { "DATA" }),
    );

    if status.rssi_value != 0 && status.rssi_value != 255 {
        push_field(&mut line, format!("Rssi={}", status.rssi_value));
    }
    if status.ambient_rssi != 0 && status.ambient_rssi != 255 {
        push_field(&mut line, format!("ARssi={}", status.ambient_rssi));
    }
    if status.ram_corruption_reset_count != 0 {
        push_field(&mut line, format!("RCnt={}", status.ram_corruption_reset_count));
    }
    if status.firmware != 0 {
        push_field(&mut line, format!("FW={:02x}", status.firmware));
    }
    if status.datasets_processed != 0 {
        push_field(&mut line, format!("DSETS={}", status.datasets_processed));
    }
    if status.packet_correction != 0 {
        push_field(&mut line, format!("PCORR={}", status.packet_correction));
    }
    if status.node_clock_year != 0 {
        push_field(
            &mut line,
            format!(
                "PI={:04}-{:02}-{:02} {:02}:{:02}",
                status.node_clock_year,
                status.node_clock_month,
                status.node_clock_day,
                status.node_clock_hour,
                status.node_clock_min
            ),
        );
    }
    if status.spi_restart_count != 0 {
        push_field(&mut line, format!("RSPI={}", status.spi_restart_count));
    }
    if status.global_power_control != 0 {
        push_field(&mut line, format!("RPA={}", status.global_power_control));
    }
    if status.reboot_count != 0 {
        push_field(&mut line, format!("RBT={}", status.reboot_count));
    }
    if status.undervoltage_count != 0 {
        push_field(&mut line, format!("RUVOLT={}", status.undervoltage_count));
    }
    if status.debug_flags != 0 {
        push_field(&mut line, format!("DBG={:04x}", status.debug_flags));
    }
    if status.ble_on != 0 {
        push_field(&mut line, format!("BLE={}", status.ble_on));
    }
    if status.fpga_on != 0 {
        push_field(&mut line, format!("FPGA={}", status.fpga_on));
    }
    if status.min_count != 0 {
        push_field(&mut line, format!("MICNT={}", status.min_count));
    }
    if status.fail_count != 0 {
        push_field(&mut line, format!("FAIL={}", status.fail_count));
    }

    // Battery and temperature round out the line for trending
    let volts = convert::battery_to_volts(header.battery_raw);
    let temp = convert::temperature_to_fahrenheit(
        header.temperature_raw,
        record.clip_negative_temperatures,
    );
    push_field(&mut line, format!("Bat={:.1}V", volts));
    push_field(&mut line, format!("Temp={:.1}F", temp));

    line
}

/// Append the timestamped header line to `<log_dir>/headers.log`.
pub fn append_header_log(log_dir: &Path, record: &DatasetRecord<'_>) -> Result<(), OutputError> {
    ensure_dir(log_dir)?;
    let stamp = Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
    let line = format!("{} - {}", stamp, build_header_line(record));

    let path = log_dir.join(HEADER_LOG_NAME);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", line)?;

    log::info!(target: "header_writer", "Header entry written: {}", line);
    Ok(())
}
