//! `serialport`-backed implementation of the `SerialLink` seam, plus the
//! RX drain used by the byte pump.

use std::io::{Read, Write};
use std::time::Duration;

use framing::FrameRing;
use serialport::SerialPort;
use wire_types::{LinkError, SerialLink};

/// Hardware flow-control hook: the radio raises "buffer empty" between
/// 128-byte bursts. The GPIO driver is out of scope, so the hook is a
/// trait object; headless builds use the no-op implementation.
pub trait FlowControl: Send {
    fn wait_buffer_empty(&mut self);
}

pub struct NoFlowControl;

impl FlowControl for NoFlowControl {
    fn wait_buffer_empty(&mut self) {}
}

/// Write half of the serial device. Throttles on the flow-control hook
/// every 128 bytes so long bursts do not overrun the radio.
pub struct PortLink {
    port: Box<dyn SerialPort>,
    flow: Box<dyn FlowControl>,
    bytes_since_throttle: usize,
}

const THROTTLE_INTERVAL: usize = 128;

impl PortLink {
    pub fn new(port: Box<dyn SerialPort>, flow: Box<dyn FlowControl>) -> Self {
        Self {
            port,
            flow,
            bytes_since_throttle: 0,
        }
    }

    /// Clone of the underlying device for the pump thread's read half.
    pub fn try_clone_port(&self) -> serialport::Result<Box<dyn SerialPort>> {
        self.port.try_clone()
    }

    /// Direct device access for the radio register protocol (used with
    /// the byte pump paused).
    pub fn port_mut(&mut self) -> &mut dyn SerialPort {
        self.port.as_mut()
    }
}

impl SerialLink for PortLink {
    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        self.port.write_all(&[byte])?;
        self.bytes_since_throttle += 1;
        if self.bytes_since_throttle >= THROTTLE_INTERVAL {
            self.bytes_since_throttle = 0;
            self.flow.wait_buffer_empty();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        self.port.flush()?;
        Ok(())
    }
}

/// Open the device at `baud` with a short read timeout (reads are polled,
/// never parked).
pub fn open_port(device: &str, baud: u32) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(device, baud)
        .timeout(Duration::from_millis(10))
        .open()
}

/// Move every available byte from the device into the frame ring. Called
/// from the pump thread only; returns the number of bytes moved.
pub fn drain_into_ring(port: &mut dyn SerialPort, ring: &mut FrameRing) -> usize {
    let available = match port.bytes_to_read() {
        Ok(n) => n as usize,
        Err(_) => return 0,
    };
    if available == 0 {
        return 0;
    }

    let mut buf = [0u8; 512];
    let mut moved = 0usize;
    let mut remaining = available;
    while remaining > 0 {
        let want = remaining.min(buf.len());
        match port.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => {
                ring.extend(&buf[..n]);
                moved += n;
                remaining = remaining.saturating_sub(n);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => {
                log::warn!(target: "serial", "Serial read error: {}", e);
                break;
            }
        }
    }
    moved
}
