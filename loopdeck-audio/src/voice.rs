//! Voice - one active playback instance of a pad.
//!
//! The engine owns a fixed pool of [`MAX_VOICES`](crate::constants::MAX_VOICES)
//! voices, allocated up front so triggering never allocates on the render
//! context. A voice keeps its own loop cursor, isolator state and pitch
//! shifter; binding a voice to a pad resets that state and bumps the shared
//! buffer's reference count, releasing drops it.

use crate::bank::{LoopRegion, SharedSample};
use crate::isolator::IsolatorEq;
use crate::stretch::PitchShifter;

/// Per-block one-pole coefficient for tempo-ratio/transpose smoothing.
/// Reaches ~95% of a step in about 10 blocks.
const BLOCK_SMOOTH: f32 = 0.25;

/// Per-frame one-pole coefficient for gain smoothing (~5 ms at 48 kHz).
const GAIN_SMOOTH: f32 = 0.005;

/// Targets the engine derives for a voice each block.
#[derive(Debug, Clone, Copy)]
pub struct VoiceTargets {
    /// Pad gain times trigger velocity.
    pub gain: f32,
    /// Linear isolator band gains `[low, mid, high]`.
    pub band_gains: [f32; 3],
    /// Playback-rate multiplier.
    pub tempo_ratio: f32,
    /// Pitch correction in semitones.
    pub transpose: f32,
}

pub struct Voice {
    active: bool,
    paused: bool,
    pad: usize,
    /// Monotonic trigger counter; the smallest live serial is the eviction
    /// victim when the pool is exhausted.
    serial: u64,
    sample: Option<SharedSample>,
    /// Fractional frame cursor, always within the loop region while active.
    frame_pos: f64,
    velocity: f32,

    // Smoothed runtime state
    gain: f32,
    band_gains: [f32; 3],
    tempo_ratio: f32,
    transpose: f32,

    eq: IsolatorEq,
    shifter: PitchShifter,
}

impl Voice {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            active: false,
            paused: false,
            pad: 0,
            serial: 0,
            sample: None,
            frame_pos: 0.0,
            velocity: 1.0,
            gain: 0.0,
            band_gains: [1.0; 3],
            tempo_ratio: 1.0,
            transpose: 0.0,
            eq: IsolatorEq::new(sample_rate),
            shifter: PitchShifter::new(),
        }
    }

    /// Bind this voice to a pad, starting at the loop region start.
    /// Smoothed parameters snap to their targets so a fresh trigger has no
    /// fade-in from stale state.
    pub fn bind(
        &mut self,
        pad: usize,
        sample: SharedSample,
        region: LoopRegion,
        velocity: f32,
        serial: u64,
        targets: &VoiceTargets,
    ) {
        self.active = true;
        self.paused = false;
        self.pad = pad;
        self.serial = serial;
        self.sample = Some(sample);
        self.frame_pos = region.start as f64;
        self.velocity = velocity.clamp(0.0, 1.0);
        self.gain = targets.gain;
        self.band_gains = targets.band_gains;
        self.tempo_ratio = targets.tempo_ratio;
        self.transpose = targets.transpose;
        self.eq.reset();
        self.shifter.reset();
        self.shifter.set_transpose(targets.transpose);
    }

    /// Release the voice and drop its buffer reference.
    pub fn release(&mut self) {
        self.active = false;
        self.paused = false;
        self.sample = None;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.active {
            self.paused = paused;
        }
    }

    pub fn pad(&self) -> usize {
        self.pad
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    /// Integer frame position of the cursor.
    pub fn playhead(&self) -> u64 {
        self.frame_pos as u64
    }

    #[cfg(test)]
    pub fn frame_pos(&self) -> f64 {
        self.frame_pos
    }

    /// Render one block additively into an interleaved stereo buffer and
    /// return the block's post-fader mono peak.
    ///
    /// The cursor advances by the smoothed tempo ratio per output frame and
    /// wraps exactly within `region`; the region is re-read every block so
    /// control-plane updates take effect on live voices.
    pub fn render_add(
        &mut self,
        output: &mut [f32],
        region: LoopRegion,
        targets: &VoiceTargets,
    ) -> f32 {
        if !self.active || self.paused {
            return 0.0;
        }
        let Some(sample) = self.sample.clone() else {
            return 0.0;
        };

        // The region may have moved under the cursor since last block
        if self.frame_pos < region.start as f64 {
            self.frame_pos = region.start as f64;
        }
        self.frame_pos = region.wrap(self.frame_pos);

        // Cross-block smoothing of the stretch parameters
        self.tempo_ratio += (targets.tempo_ratio - self.tempo_ratio) * BLOCK_SMOOTH;
        self.transpose += (targets.transpose - self.transpose) * BLOCK_SMOOTH;
        self.shifter.set_transpose(self.transpose);

        let ratio = self.tempo_ratio as f64;
        let mut peak = 0.0f32;

        for frame in output.chunks_exact_mut(2) {
            // Per-frame gain smoothing keeps pad gain and EQ rides click-free
            self.gain += (targets.gain - self.gain) * GAIN_SMOOTH;
            for b in 0..3 {
                self.band_gains[b] += (targets.band_gains[b] - self.band_gains[b]) * GAIN_SMOOTH;
            }

            let (dry_l, dry_r) = read_frame(&sample, region, self.frame_pos);
            let (l, r) = match self.shifter.process(dry_l, dry_r) {
                Some(wet) => wet,
                // Stretch warm-up: the stage's latency appears as silence
                None => (0.0, 0.0),
            };

            let [l, r] = self.eq.process_frame([l, r], &self.band_gains);
            let l = l * self.gain;
            let r = r * self.gain;

            frame[0] += l;
            frame[1] += r;

            let mono = 0.5 * (l + r);
            peak = peak.max(mono.abs());

            self.frame_pos = region.wrap(self.frame_pos + ratio);
        }

        peak
    }
}

/// Read a stereo frame at a fractional cursor with linear interpolation,
/// wrapping the lookahead frame inside the loop region.
#[inline]
fn read_frame(sample: &SharedSample, region: LoopRegion, pos: f64) -> (f32, f32) {
    let idx = pos as u64;
    let frac = (pos - idx as f64) as f32;
    let (l0, r0) = sample.frame(idx);
    let (l1, r1) = sample.frame(region.next_frame(idx));
    (l0 + frac * (l1 - l0), r0 + frac * (r1 - r0))
}
