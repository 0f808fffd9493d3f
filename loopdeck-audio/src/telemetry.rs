//! Telemetry - rate-limited peak/playhead reporting and control-side meters.
//!
//! The renderer computes a post-fader mono peak and a playhead position per
//! active pad every block, but pushes them at most ~10 Hz per pad. The
//! control plane folds received peaks into [`PadMeters`], which decays them
//! exponentially with a fixed half-life and clears values that fall below a
//! small threshold.

use crate::constants::{NUM_PADS, TELEMETRY_HZ};
use crate::messages::AudioMessage;

/// Peak decay half-life on the control side, in seconds.
const PEAK_HALF_LIFE_SECS: f32 = 0.25;

/// Peaks below this are treated as silence and cleared.
const PEAK_CLEAR_THRESHOLD: f32 = 1e-3;

/// Render-side per-pad report throttle.
pub struct TelemetryThrottle {
    interval_frames: u32,
    countdown: [u32; NUM_PADS],
}

impl TelemetryThrottle {
    pub fn new(sample_rate: u32) -> Self {
        let interval_frames = (sample_rate as f32 / TELEMETRY_HZ) as u32;
        Self {
            interval_frames,
            countdown: [0; NUM_PADS],
        }
    }

    /// Advance a pad's timer by one block. Returns true when a report is
    /// due, rearming the timer.
    #[inline]
    pub fn due(&mut self, id: usize, block_frames: u32) -> bool {
        let remaining = self.countdown[id].saturating_sub(block_frames);
        if remaining == 0 {
            self.countdown[id] = self.interval_frames;
            true
        } else {
            self.countdown[id] = remaining;
            false
        }
    }

    /// Rearm a pad so its next report fires after a full interval.
    pub fn rearm(&mut self, id: usize) {
        self.countdown[id] = self.interval_frames;
    }
}

/// Control-side pad meters fed from polled telemetry events.
pub struct PadMeters {
    peaks: [f32; NUM_PADS],
    playheads: [Option<u64>; NUM_PADS],
}

impl Default for PadMeters {
    fn default() -> Self {
        Self::new()
    }
}

impl PadMeters {
    pub fn new() -> Self {
        Self {
            peaks: [0.0; NUM_PADS],
            playheads: [None; NUM_PADS],
        }
    }

    /// Fold one telemetry event into the meters. Non-meter events pass
    /// through untouched.
    pub fn apply(&mut self, event: &AudioMessage) {
        match *event {
            AudioMessage::PadPeak { id, peak } => {
                if id < NUM_PADS {
                    self.peaks[id] = self.peaks[id].max(peak.clamp(0.0, 1.0));
                }
            }
            AudioMessage::PadPlayhead { id, position } => {
                if id < NUM_PADS {
                    self.playheads[id] = Some(position);
                }
            }
            AudioMessage::Pong | AudioMessage::Stopped => {}
        }
    }

    /// Exponentially decay all peaks by `dt` seconds of wall time, clearing
    /// those that drop below the silence threshold.
    pub fn decay(&mut self, dt_secs: f32) {
        if dt_secs <= 0.0 {
            return;
        }
        let factor = 0.5f32.powf(dt_secs / PEAK_HALF_LIFE_SECS);
        for peak in &mut self.peaks {
            *peak *= factor;
            if *peak < PEAK_CLEAR_THRESHOLD {
                *peak = 0.0;
            }
        }
    }

    /// Clear a pad's meter and playhead (on stop or unload).
    pub fn clear(&mut self, id: usize) {
        self.peaks[id] = 0.0;
        self.playheads[id] = None;
    }

    pub fn peak(&self, id: usize) -> f32 {
        self.peaks[id]
    }

    pub fn playhead(&self, id: usize) -> Option<u64> {
        self.playheads[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_interval() {
        let mut throttle = TelemetryThrottle::new(48_000);

        // First block reports immediately, then holds for ~1/10 s
        assert!(throttle.due(0, 512));
        let mut elapsed = 0;
        let mut fired = false;
        for _ in 0..20 {
            elapsed += 512;
            if throttle.due(0, 512) {
                fired = true;
                break;
            }
        }
        assert!(fired);
        assert!(elapsed >= 4096, "fired after only {} frames", elapsed);
    }

    #[test]
    fn test_throttle_is_per_pad() {
        let mut throttle = TelemetryThrottle::new(48_000);
        assert!(throttle.due(0, 512));
        assert!(throttle.due(1, 512));
        assert!(!throttle.due(0, 512));
    }

    #[test]
    fn test_meters_keep_max_until_decay() {
        let mut meters = PadMeters::new();
        meters.apply(&AudioMessage::PadPeak { id: 2, peak: 0.6 });
        meters.apply(&AudioMessage::PadPeak { id: 2, peak: 0.3 });
        assert_eq!(meters.peak(2), 0.6);
    }

    #[test]
    fn test_decay_halves_after_half_life() {
        let mut meters = PadMeters::new();
        meters.apply(&AudioMessage::PadPeak { id: 0, peak: 0.8 });
        meters.decay(PEAK_HALF_LIFE_SECS);
        assert!((meters.peak(0) - 0.4).abs() < 1e-3);
    }

    #[test]
    fn test_small_peaks_clear_to_zero() {
        let mut meters = PadMeters::new();
        meters.apply(&AudioMessage::PadPeak { id: 0, peak: 0.002 });
        meters.decay(PEAK_HALF_LIFE_SECS);
        assert_eq!(meters.peak(0), 0.0);
    }

    #[test]
    fn test_playhead_tracks_latest() {
        let mut meters = PadMeters::new();
        meters.apply(&AudioMessage::PadPlayhead { id: 5, position: 100 });
        meters.apply(&AudioMessage::PadPlayhead { id: 5, position: 250 });
        assert_eq!(meters.playhead(5), Some(250));

        meters.clear(5);
        assert_eq!(meters.playhead(5), None);
    }
}
