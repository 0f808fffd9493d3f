//! Tempo and key model.
//!
//! The renderer owns a single [`TempoState`], mutated only through queued
//! control messages, and derives a tempo ratio and transpose per voice every
//! block. The control plane keeps its own mirror for BPM-lock anchoring; the
//! renderer never persists anything.

use crate::constants::{NUM_PADS, SPEED_MAX, SPEED_MIN};

/// Renderer-local tempo and lock state.
#[derive(Debug, Clone)]
pub struct TempoState {
    /// Global playback speed multiplier, clamped to [0.5, 2.0].
    pub speed: f32,
    /// When on, tempo changes are pitch-compensated.
    pub key_lock: bool,
    /// When on, pads with a known BPM follow `master_bpm`.
    pub bpm_lock: bool,
    /// Shared master BPM; meaningful while `bpm_lock` is on.
    pub master_bpm: Option<f32>,
    /// Per-pad BPM as reported by analysis or set manually.
    pub pad_bpm: [Option<f32>; NUM_PADS],
}

impl Default for TempoState {
    fn default() -> Self {
        Self {
            speed: 1.0,
            key_lock: false,
            bpm_lock: false,
            master_bpm: None,
            pad_bpm: [None; NUM_PADS],
        }
    }
}

impl TempoState {
    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed.clamp(SPEED_MIN, SPEED_MAX);
    }

    /// Playback-rate multiplier for a pad.
    ///
    /// BPM-lock off: the raw global speed. BPM-lock on with both master and
    /// pad BPM known: `master / pad_bpm`, clamped to the speed range; any
    /// missing BPM falls back to the raw speed.
    pub fn tempo_ratio(&self, id: usize) -> f32 {
        if self.bpm_lock {
            if let (Some(master), Some(pad)) = (self.master_bpm, self.pad_bpm[id]) {
                if pad > 0.0 {
                    return (master / pad).clamp(SPEED_MIN, SPEED_MAX);
                }
            }
        }
        self.speed
    }

    /// Pitch compensation in semitones for a given tempo ratio.
    ///
    /// Key-lock cancels the pitch shift a bare rate change would cause:
    /// `-12 * log2(ratio)`.
    pub fn transpose_semitones(&self, tempo_ratio: f32) -> f32 {
        if self.key_lock {
            -12.0 * tempo_ratio.log2()
        } else {
            0.0
        }
    }
}

/// Master BPM anchor used when BPM-lock engages (and re-derived on speed
/// changes while locked): the selected pad's BPM at the current speed.
pub fn anchored_master_bpm(pad_bpm: f32, speed: f32) -> f32 {
    pad_bpm * speed
}
