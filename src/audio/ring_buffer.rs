use std::collections::VecDeque;

/// Holds the most recent `capacity` samples; older samples are evicted.
pub struct RingBuffer {
    buffer: VecDeque<f32>,
    capacity: usize,
    total_written: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            total_written: 0,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.total_written += samples.len() as u64;
        // Only the tail of an oversized block can survive.
        let samples = &samples[samples.len().saturating_sub(self.capacity)..];
        for &sample in samples {
            if self.buffer.len() >= self.capacity {
                self.buffer.pop_front();
            }
            self.buffer.push_back(sample);
        }
    }

    /// Copy the newest samples into `out`, right-aligned. Slots with no
    /// sample yet are zeroed.
    pub fn copy_latest(&self, out: &mut [f32]) {
        let take = self.buffer.len().min(out.len());
        let pad = out.len() - take;
        out[..pad].fill(0.0);
        let skip = self.buffer.len() - take;
        for (slot, &sample) in out[pad..].iter_mut().zip(self.buffer.iter().skip(skip)) {
            *slot = sample;
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Samples pushed since creation, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
