//! Message protocol between the control surface and the render context.
//!
//! Both directions are plain tagged unions, exhaustively matched in the
//! mixer so the render path stays branch-predictable and allocation-free.
//! The only shared ownership crossing the boundary is the reference-count
//! bump on a [`SharedSample`] inside `LoadSample` - not an allocation.

use crate::bank::SharedSample;

/// Commands pushed from the control plane to the renderer.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// Publish a finished buffer into a pad slot. Replaces (and implicitly
    /// unloads) any previous contents; voices on the pad are superseded.
    LoadSample { id: usize, sample: SharedSample },
    /// Drop a pad's buffer and stop its voices.
    UnloadSample { id: usize },
    /// Trigger a pad at the given velocity (0.0 to 1.0). Restarts from the
    /// loop region start, superseding any previous voice of the pad.
    PlaySample { id: usize, velocity: f32 },
    /// Stop all voices of a pad.
    StopSample { id: usize },
    /// Hold a pad's voices in place; they keep their position and buffer
    /// reference but render silence.
    PauseSample { id: usize },
    /// Resume a paused pad.
    ResumeSample { id: usize },
    /// Stop every voice.
    StopAll,
    /// Global playback speed multiplier (0.5 to 2.0).
    SetSpeed(f32),
    /// Master output volume (0.0 to 2.0).
    SetMasterVolume(f32),
    /// Per-pad gain (0.0 to 2.0).
    SetPadGain { id: usize, gain: f32 },
    /// Per-pad isolator band levels in dB.
    SetPadEq {
        id: usize,
        low_db: f32,
        mid_db: f32,
        high_db: f32,
    },
    /// Per-pad loop bounds in integer frames at the buffer's rate.
    SetPadLoopRegion { id: usize, start: u64, end: u64 },
    /// Pitch compensation on/off.
    SetKeyLock(bool),
    /// Master-BPM tempo derivation on/off.
    SetBpmLock(bool),
    /// Shared master BPM used while BPM-lock is on.
    SetMasterBpm(f32),
    /// Per-pad BPM; `None` clears it.
    SetPadBpm { id: usize, bpm: Option<f32> },
    /// Liveness probe; answered with [`AudioMessage::Pong`].
    Ping,
}

impl ControlMessage {
    /// The pad this message addresses, when it addresses one.
    pub fn pad_id(&self) -> Option<usize> {
        match *self {
            ControlMessage::LoadSample { id, .. }
            | ControlMessage::UnloadSample { id }
            | ControlMessage::PlaySample { id, .. }
            | ControlMessage::StopSample { id }
            | ControlMessage::PauseSample { id }
            | ControlMessage::ResumeSample { id }
            | ControlMessage::SetPadGain { id, .. }
            | ControlMessage::SetPadEq { id, .. }
            | ControlMessage::SetPadLoopRegion { id, .. }
            | ControlMessage::SetPadBpm { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Events flowing back from the renderer to the control plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioMessage {
    /// Answer to [`ControlMessage::Ping`].
    Pong,
    /// The live-voice count returned to zero.
    Stopped,
    /// Post-fader mono peak of a pad over the last report window, in [0, 1].
    PadPeak { id: usize, peak: f32 },
    /// Current integer frame position of a pad's voice within its buffer.
    PadPlayhead { id: usize, position: u64 },
}
