//! Radio bring-up and supervision over the register mini-protocol.
//!
//! The radio answers four-byte command frames (`0xFF 0x02 <addr> <val>`,
//! or `0xFF 0x02 0xFE <addr>` for reads) with a `0x06` ack while its
//! command-mode pin is held. Pin control itself lives behind `RadioPins`;
//! the GPIO driver is an external collaborator.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::serial::open_port;

pub const DEFAULT_POWER_LEVEL: u8 = 7;
pub const DEFAULT_CHANNEL: u8 = 0;

const ACK: u8 = 0x06;
const REGISTER_REPLY_TIMEOUT: Duration = Duration::from_millis(400);

/// GPIO lines the radio needs: command-mode select, clear-to-send,
/// buffer-empty, and reset. Headless hosts run the no-op implementation.
pub trait RadioPins: Send {
    fn init(&mut self) -> bool {
        true
    }
    fn set_command_mode(&mut self, _on: bool) {}
    fn wait_cts(&mut self) {}
    fn reset_radio(&mut self) {}
}

pub struct NoopPins;

impl RadioPins for NoopPins {}

/// Fixed register program: power, channel, addressing mode, data timeout,
/// CRC, byte-count trigger, CSMA, idle mode, compatibility, command-mode
/// hold, packet options.
fn program_regs(power: u8, channel: u8) -> [(u8, u8); 11] {
    [
        (0x4d, power),
        (0x4b, channel),
        (0x4f, 0x04),
        (0x50, 0x02),
        (0x53, 0x01),
        (0x54, 0x90),
        (0x56, 0x01),
        (0x58, 0x00),
        (0x70, 0x00),
        (0x6e, 0x01),
        (0xd3, 0x00),
    ]
}

/// Non-volatile registers checked and rewritten only when wrong: minimum
/// carrier RSSI for CSMA and command-mode hold.
const NV_REGS: [(u8, u8); 2] = [(0x3f, 0xba), (0x23, 0x01)];

/// Baud ladder tried until a register read answers. The radio is then
/// reprogrammed to run at 115200.
const BAUD_LADDER: [(u8, u32); 6] = [
    (5, 115_200),
    (2, 19_200),
    (3, 38_400),
    (4, 57_600),
    (6, 10_400),
    (7, 31_250),
];

pub struct RadioManager {
    pins: Box<dyn RadioPins>,
    device: String,
    channel: u8,
    power: u8,
}

impl RadioManager {
    pub fn new(pins: Box<dyn RadioPins>, device: &str) -> Self {
        Self {
            pins,
            device: device.to_string(),
            channel: DEFAULT_CHANNEL,
            power: DEFAULT_POWER_LEVEL,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn power(&self) -> u8 {
        self.power
    }

    fn flush_input(port: &mut dyn SerialPort) {
        let _ = port.clear(serialport::ClearBuffer::Input);
    }

    fn read_reply(port: &mut dyn SerialPort, want: usize, out: &mut [u8]) -> usize {
        let deadline = Instant::now() + REGISTER_REPLY_TIMEOUT;
        let mut got = 0usize;
        while got < want && Instant::now() < deadline {
            match port.bytes_to_read() {
                Ok(0) | Err(_) => std::thread::sleep(Duration::from_millis(10)),
                Ok(_) => match port.read(&mut out[got..want]) {
                    Ok(n) => got += n,
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(_) => break,
                },
            }
        }
        got
    }

    /// Write one register. True on the expected ack.
    fn radio_command(&mut self, port: &mut dyn SerialPort, addr: u8, value: u8) -> bool {
        log::info!(target: "radio", "Write radio reg {:02x} to {:02x}", addr, value);
        Self::flush_input(port);
        self.pins.set_command_mode(true);

        let cmd = [0xff, 0x02, addr, value];
        for &b in &cmd {
            self.pins.wait_cts();
            if port.write_all(&[b]).is_err() {
                self.pins.set_command_mode(false);
                return false;
            }
        }
        let _ = port.flush();

        let mut reply = [0u8; 1];
        let got = Self::read_reply(port, 1, &mut reply);
        self.pins.set_command_mode(false);
        got == 1 && reply[0] == ACK
    }

    /// Read one register: ack, echoed address, value.
    fn read_radio(&mut self, port: &mut dyn SerialPort, addr: u8) -> Option<u8> {
        Self::flush_input(port);
        self.pins.set_command_mode(true);

        let cmd = [0xff, 0x02, 0xfe, addr];
        for &b in &cmd {
            self.pins.wait_cts();
            if port.write_all(&[b]).is_err() {
                self.pins.set_command_mode(false);
                return None;
            }
        }
        let _ = port.flush();

        let mut reply = [0u8; 3];
        let got = Self::read_reply(port, 3, &mut reply);
        self.pins.set_command_mode(false);

        if got >= 3 && reply[0] == ACK && reply[1] == addr {
            Some(reply[2])
        } else {
            None
        }
    }

    /// Verify the volatile register program. True when everything matches.
    fn check_radio(&mut self, port: &mut dyn SerialPort) -> bool {
        let mut ok = true;
        let mut checks = vec![(0x4eu8, 0x05u8)];
        checks.extend(
            program_regs(self.power, self.channel)
                .iter()
                .filter(|(addr, _)| *addr != 0x4b)
                .copied(),
        );
        for (addr, expect) in checks {
            match self.read_radio(port, addr) {
                Some(value) if value == expect => {
                    log::info!(target: "radio", "Confirmed reg {:02x} val {:02x}", addr, value);
                }
                Some(value) => {
                    log::error!(
                        target: "radio",
                        "Radio reg {:02x} val {:02x} expected {:02x}",
                        addr, value, expect
                    );
                    ok = false;
                }
                None => {
                    log::error!(target: "radio", "Unable to check register {:02x}", addr);
                }
            }
        }
        ok
    }

    /// Full bring-up: find the radio on the baud ladder, force it to
    /// 115200, program and verify the register set. Returns the port at
    /// its final rate, or None (caller retries indefinitely).
    pub fn start(&mut self) -> Option<Box<dyn SerialPort>> {
        if !self.pins.init() {
            log::error!(target: "radio", "Unable to init GPIO controller");
            return None;
        }
        self.pins.reset_radio();

        let mut port: Option<Box<dyn SerialPort>> = None;
        let mut baud_code = 0u8;

        for (code, baud) in BAUD_LADDER {
            let mut candidate = match open_port(&self.device, baud) {
                Ok(port) => port,
                Err(e) => {
                    log::error!(target: "radio", "Cannot open {} at {}: {}", self.device, baud, e);
                    return None;
                }
            };
            log::info!(target: "radio", "Trying baud rate {}", baud);
            if let Some(value) = self.read_radio(candidate.as_mut(), 0x4e) {
                log::info!(target: "radio", "Radio answered at {} (reg 4e = {:02x})", baud, value);
                baud_code = value;
                port = Some(candidate);
                break;
            }
        }

        let mut port = match port {
            Some(port) => port,
            None => {
                log::info!(target: "radio", "No response on any baud rate");
                return None;
            }
        };

        if baud_code != 5 {
            log::info!(target: "radio", "Switching radio to 115200");
            if !self.radio_command(port.as_mut(), 0x4e, 0x05) {
                return None;
            }
            drop(port);
            port = open_port(&self.device, 115_200).ok()?;
            std::thread::sleep(Duration::from_millis(100));
            match self.read_radio(port.as_mut(), 0x4e) {
                Some(5) => log::info!(target: "radio", "Baud rate set OK"),
                _ => {
                    log::info!(target: "radio", "Baud rate set failed");
                    return None;
                }
            }
        }

        let mut ok = true;
        for (addr, value) in program_regs(self.power, self.channel) {
            std::thread::sleep(Duration::from_millis(20));
            if !self.radio_command(port.as_mut(), addr, value) {
                log::error!(target: "radio", "Unable to program register {:02x}", addr);
                ok = false;
            }
        }
        if !ok {
            log::error!(target: "radio", "Radio programming failed");
            return None;
        }

        if !self.check_radio(port.as_mut()) {
            return None;
        }

        // NV registers only get rewritten when their value drifted
        for (addr, expect) in NV_REGS {
            match self.read_radio(port.as_mut(), addr) {
                Some(value) if value == expect => {
                    log::info!(target: "radio", "Confirmed reg {:02x}", addr);
                }
                Some(_) => {
                    log::error!(target: "radio", "Unexpected value of register {:02x}", addr);
                    if !self.radio_command(port.as_mut(), addr, expect) {
                        log::error!(target: "radio", "Unable to program register {:02x}", addr);
                        return None;
                    }
                }
                None => {
                    log::error!(target: "radio", "Unable to check register {:02x}", addr);
                    return None;
                }
            }
        }

        log::info!(target: "radio", "Radio bring-up complete");
        Some(port)
    }

    /// Re-validate the register program, rewriting anything that drifted.
    pub fn periodic_check(&mut self, port: &mut dyn SerialPort) {
        log::info!(target: "radio", "Periodic radio check...");
        let mut regs: Vec<(u8, u8)> = program_regs(self.power, self.channel).to_vec();
        regs.push((0x3f, 0xba));
        for (addr, expect) in regs {
            match self.read_radio(port, addr) {
                Some(value) if value == expect => {
                    log::info!(target: "radio", "Confirmed reg {:02x} val {:02x}", addr, value);
                }
                Some(value) => {
                    log::error!(
                        target: "radio",
                        "Radio reg {:02x} val {:02x} expected {:02x}",
                        addr, value, expect
                    );
                    if !self.radio_command(port, addr, expect) {
                        log::error!(target: "radio", "Unable to program register {:02x}", addr);
                    }
                }
                None => {
                    log::error!(target: "radio", "Unable to check register {:02x}", addr);
                }
            }
        }
    }

    pub fn set_channel(&mut self, port: &mut dyn SerialPort, channel: u8) -> bool {
        if channel > 5 {
            return false;
        }
        log::info!(target: "radio", "Radio channel change {}", channel);
        if self.radio_command(port, 0x4b, channel) {
            self.channel = channel;
            true
        } else {
            false
        }
    }

    pub fn set_tx_power(&mut self, port: &mut dyn SerialPort, power: u8) -> bool {
        if !(5..=7).contains(&power) {
            return false;
        }
        log::info!(target: "radio", "Radio power change {}", power);
        if self.radio_command(port, 0x4d, power) {
            self.power = power;
            true
        } else {
            false
        }
    }

    /// Apply one queued adjustment byte: `0x80 | channel` or
    /// `0xC0 | power`.
    pub fn apply_adjustment(&mut self, port: &mut dyn SerialPort, byte: u8) {
        if byte & 0xC0 == 0x80 {
            let channel = byte & 0x07;
            if channel <= 5 {
                self.set_channel(port, channel);
            }
        } else if byte & 0xC0 == 0xC0 {
            let power = byte & 0x07;
            if (5..=7).contains(&power) {
                self.set_tx_power(port, power);
            }
        }
    }
}

/// Read the RF channel file and queue a channel-change byte. Invalid or
/// missing files leave the channel alone.
pub fn rf_channel_adjustment(path: &std::path::Path) -> Option<u8> {
    let text = std::fs::read_to_string(path).ok()?;
    let channel: i32 = text.split_whitespace().next()?.parse().ok()?;
    if (0..=5).contains(&channel) {
        log::info!(target: "radio", "Set RF channel to {} from {}", channel, path.display());
        Some(0x80 | (channel as u8 & 0x07))
    } else {
        log::info!(target: "radio", "Invalid channel {} in {}", channel, path.display());
        None
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rf_channel_adjustment_encoding() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "3").unwrap();
        assert_eq!(rf_channel_adjustment(file.path()), Some(0x83));
    }

    #[test]
    fn test_rf_channel_adjustment_rejects_out_of_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "9").unwrap();
        assert_eq!(rf_channel_adjustment(file.path()), None);
    }

    #[test]
    fn test_rf_channel_adjustment_missing_file() {
        assert_eq!(
            rf_channel_adjustment(std::path::Path::new("/nonexistent/channel.txt")),
            None
        );
    }

    #[test]
    fn test_program_regs_cover_required_set() {
        let regs = program_regs(7, 0);
        assert_eq!(regs[0], (0x4d, 7));
        assert_eq!(regs[1], (0x4b, 0));
        assert!(regs.iter().any(|&(a, v)| a == 0x53 && v == 0x01)); // CRC on
        assert!(regs.iter().any(|&(a, v)| a == 0x56 && v == 0x01)); // CSMA on
    }
}
