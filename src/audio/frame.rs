//! Fixed-size sample buffer reused by every relay iteration.

/// Number of samples moved per loop iteration.
///
/// `min_buffer` is the smallest buffer the platform reports as safe; the
/// multiplier adds a stability margin on top of it.
pub fn frame_samples(min_buffer: usize, multiplier: usize) -> usize {
    min_buffer.max(1).saturating_mul(multiplier.max(1))
}

/// Mono i16 frame owned by the relay thread.
///
/// Allocated once when the session starts; the loop only ever borrows slices.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(len: usize) -> Self {
        Self {
            samples: vec![0i16; len.max(1)],
        }
    }

    /// The whole buffer, for a capture read.
    pub fn as_mut_slice(&mut self) -> &mut [i16] {
        &mut self.samples
    }

    /// The first `count` samples, for gain and playback.
    pub fn filled_mut(&mut self, count: usize) -> &mut [i16] {
        let end = count.min(self.samples.len());
        &mut self.samples[..end]
    }
}
