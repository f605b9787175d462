use wire_types::timing::SAMPLES_PER_SEGMENT;

#[derive(Debug, Clone)]
struct Segment {
    received: bool,
    samples: [i16; 32],
}

/// Ordered store of fixed-width sample segments with a received flag per
/// slot. Storage is idempotent and order-independent: the remote can send
/// in any order, duplicates keep the first arrival.
#[derive(Debug, Default)]
pub struct SegmentTracker {
    segments: Vec<Segment>,
    received: usize,
}

impl SegmentTracker {
    pub fn new(total_segments: usize) -> Self {
        Self {
            segments: vec![
                Segment {
                    received: false,
                    samples: [0; 32],
                };
                total_segments
            ],
            received: 0,
        }
    }

    /// Segments needed for `sample_count` samples, rounded up.
    pub fn for_samples(sample_count: u32) -> Self {
        Self::new(sample_count.div_ceil(SAMPLES_PER_SEGMENT) as usize)
    }

    pub fn total_count(&self) -> usize {
        self.segments.len()
    }

    pub fn received_count(&self) -> usize {
        self.received
    }

    pub fn missing_count(&self) -> usize {
        self.total_count() - self.received
    }

    pub fn completion_ratio(&self) -> f64 {
        if self.segments.is_empty() {
            0.0
        } else {
            self.received as f64 / self.segments.len() as f64
        }
    }

    pub fn is_received(&self, index: usize) -> bool {
        self.segments.get(index).map(|s| s.received).unwrap_or(false)
    }

    /// Store a segment. Returns true only on the first in-range arrival;
    /// out-of-range indices and duplicates are no-ops.
    pub fn mark_received(&mut self, index: usize, samples: &[i16; 32]) -> bool {
        let Some(slot) = self.segments.get_mut(index) else {
            return false;
        };
        if slot.received {
            return false;
        }
        slot.samples = *samples;
        slot.received = true;
        self.received += 1;
        true
    }

    /// Indices still outstanding, ascending.
    pub fn missing(&self) -> Vec<u16> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.received)
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// Complete means every segment arrived and the session was non-empty.
    pub fn is_complete(&self) -> bool {
        !self.segments.is_empty() && self.received == self.segments.len()
    }

    /// All samples in segment order, `total * 32` values.
    pub fn flat_samples(&self) -> Vec<i16> {
        let mut out = Vec::with_capacity(self.segments.len() * 32);
        for seg in &self.segments {
            out.extend_from_slice(&seg.samples);
        }
        out
    }

    /// Drop all progress but keep the segment count.
    pub fn clear(&mut self) {
        for seg in &mut self.segments {
            seg.received = false;
            seg.samples = [0; 32];
        }
        self.received = 0;
    }
}
