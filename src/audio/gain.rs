//! Software gain stage and the volume scalar shared with the relay thread.

use std::sync::atomic::{AtomicU32, Ordering};

/// Multiply every sample by `gain`, rounding and saturating to the i16 range.
///
/// A gain of exactly 1.0 leaves the frame untouched without visiting it.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        let amplified = (*sample as f32 * gain).round();
        *sample = amplified.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Volume written by the control thread and read once per loop iteration.
///
/// Stored as the bit pattern of an `f32` so both sides stay lock-free.
#[derive(Debug)]
pub struct GainState {
    bits: AtomicU32,
    max: f32,
}

impl GainState {
    pub fn new(initial: f32, max: f32) -> Self {
        let max = if max.is_finite() && max > 0.0 { max } else { 1.0 };
        let state = Self {
            bits: AtomicU32::new(1.0f32.to_bits()),
            max,
        };
        state.set(initial);
        state
    }

    /// Store a new volume, clamped to `[0, max]`. NaN is ignored.
    ///
    /// Returns the value the relay will actually use.
    pub fn set(&self, volume: f32) -> f32 {
        if volume.is_nan() {
            log::warn!("Ignoring NaN volume");
            return self.get();
        }
        let clamped = volume.clamp(0.0, self.max);
        self.bits.store(clamped.to_bits(), Ordering::Release);
        clamped
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn max(&self) -> f32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_saturates() {
        let mut frame = [100, -100, 20000, -20000];
        apply_gain(&mut frame, 2.0);
        assert_eq!(frame, [200, -200, 32767, -32768]);
    }

    #[test]
    fn unity_gain_is_identity() {
        let original = [i16::MIN, -1, 0, 1, 12345, i16::MAX];
        let mut frame = original;
        apply_gain(&mut frame, 1.0);
        assert_eq!(frame, original);
    }

    #[test]
    fn extreme_gains_saturate_without_wrapping() {
        let inputs = [i16::MIN, -32767, -1000, -1, 0, 1, 1000, 32766, i16::MAX];
        for gain in [1.5, 3.99, 4.0, 100.0, f32::MAX] {
            let mut frame = inputs;
            apply_gain(&mut frame, gain);
            for (out, input) in frame.iter().zip(inputs.iter()) {
                assert_eq!(out.signum(), input.signum(), "gain {gain} input {input}");
            }
            assert_eq!(frame[0], i16::MIN);
            assert_eq!(frame[8], i16::MAX);
        }

        let mut frame = inputs;
        apply_gain(&mut frame, 0.0);
        assert!(frame.iter().all(|s| *s == 0));
    }

    #[test]
    fn magnitude_grows_with_gain() {
        let gains = [0.0f32, 0.1, 0.5, 0.9, 1.0, 1.3, 2.0, 3.0];
        for input in [1i16, 7, 100, 1234, 8000] {
            let mut previous = i16::MIN;
            for gain in gains {
                let mut frame = [input];
                apply_gain(&mut frame, gain);
                assert!(frame[0] >= previous, "gain {gain} input {input}");
                previous = frame[0];
            }
        }
    }

    #[test]
    fn rounds_to_nearest() {
        let mut frame = [3, -3, 5];
        apply_gain(&mut frame, 0.5);
        // 1.5 -> 2, -1.5 -> -2, 2.5 -> 3 (round half away from zero)
        assert_eq!(frame, [2, -2, 3]);
    }

    #[test]
    fn gain_state_clamps_and_ignores_nan() {
        let gain = GainState::new(1.0, 4.0);
        assert_eq!(gain.set(2.5), 2.5);
        assert_eq!(gain.set(9.0), 4.0);
        assert_eq!(gain.get(), 4.0);
        assert_eq!(gain.set(-1.0), 0.0);
        assert_eq!(gain.set(f32::NAN), 0.0);
        assert_eq!(gain.set(f32::INFINITY), 4.0);
    }

    #[test]
    fn gain_state_initial_value_is_clamped() {
        assert_eq!(GainState::new(10.0, 4.0).get(), 4.0);
        assert_eq!(GainState::new(f32::NAN, 4.0).get(), 1.0);
    }
}
