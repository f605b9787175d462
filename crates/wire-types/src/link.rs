use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Port not open")]
    NotOpen,
    #[error("Other: {0}")]
    Other(String),
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(e.to_string())
    }
}

/// Byte-oriented serial link the protocol core transmits through.
///
/// The session machinery never owns the port; frames flow out through a
/// `&mut dyn SerialLink` handle passed into each tick. The receive half is
/// driven separately by the byte pump into the frame ring.
pub trait SerialLink {
    /// Blocking write of a single byte. The implementation may throttle on
    /// hardware flow control.
    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError>;

    /// Push any buffered TX bytes to the wire.
    fn flush(&mut self) -> Result<(), LinkError>;

    /// Transmit one full 128-byte wire frame.
    fn send_frame(&mut self, frame: &[u8; 128]) -> Result<(), LinkError> {
        for &b in frame.iter() {
            self.write_byte(b)?;
        }
        Ok(())
    }
}

/// A link that records transmitted frames. Used by tests throughout the
/// workspace and by monitor mode diagnostics.
#[derive(Default)]
pub struct RecordingLink {
    pub bytes: Vec<u8>,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The frames sent so far, split at 128-byte boundaries.
    pub fn frames(&self) -> Vec<[u8; 128]> {
        self.bytes
            .chunks_exact(128)
            .map(|chunk| {
                let mut frame = [0u8; 128];
                frame.copy_from_slice(chunk);
                frame
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl SerialLink for RecordingLink {
    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        self.bytes.push(byte);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_send_frame_writes_all_bytes() {
        let mut link = RecordingLink::new();
        let frame = [0xABu8; 128];
        link.send_frame(&frame).unwrap();
        assert_eq!(link.bytes.len(), 128);
        assert_eq!(link.frames().len(), 1);
        assert_eq!(link.frames()[0], frame);
    }

    #[test]
    fn test_partial_frame_not_reported() {
        let mut link = RecordingLink::new();
        for _ in 0..100 {
            link.write_byte(0).unwrap();
        }
        assert!(link.frames().is_empty());
    }
}
