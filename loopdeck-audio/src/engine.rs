//! Audio engine - the render core and its control-plane handle.
//!
//! [`EngineState`] lives inside the output callback and is the single owner
//! of the sample bank, the voice pool and the tempo state. Every block it
//! drains the control ring, applies messages, renders voices additively and
//! reports telemetry. It never allocates, locks or blocks; faults on the
//! render path are absorbed (evict oldest, ignore bad input), never raised.
//!
//! [`EngineHandle`] is the other side: it validates caller input and turns
//! the public control API into queued messages. A full ring silently drops
//! the message by design - the high-rate traffic is best-effort.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tracing::info;

use crate::bank::{SampleBank, SharedSample};
use crate::channel::{
    control_channel, telemetry_channel, ControlReceiver, ControlSender, TelemetryReceiver,
    TelemetrySender,
};
use crate::constants::{
    EQ_DB_KILL, EQ_DB_MAX, MASTER_VOLUME_MAX, MASTER_VOLUME_MIN, MAX_VOICES, NUM_PADS,
    PAD_GAIN_MAX, PAD_GAIN_MIN, QUEUE_CAPACITY, SPEED_MAX, SPEED_MIN,
};
use crate::isolator::band_gain;
use crate::messages::{AudioMessage, ControlMessage};
use crate::telemetry::TelemetryThrottle;
use crate::tempo::TempoState;
use crate::voice::{Voice, VoiceTargets};

/// Caller-input errors surfaced synchronously by the control API.
#[derive(Debug, Error, PartialEq)]
pub enum ControlError {
    #[error("pad id {0} out of range (0..{max})", max = NUM_PADS)]
    InvalidPad(usize),
    #[error("parameter `{0}` must be finite")]
    NonFinite(&'static str),
    #[error("invalid loop region: start {start} must be below end {end}")]
    InvalidRegion { start: u64, end: u64 },
    #[error("bpm must be finite and positive, got {0}")]
    InvalidBpm(f32),
}

/// Failures while opening the platform output stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("failed to query output config: {0}")]
    Config(#[from] cpal::DefaultStreamConfigError),
    #[error("failed to build output stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("failed to start output stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
}

/// Per-pad mix parameters, applied to every voice of the pad.
#[derive(Debug, Clone, Copy)]
struct PadParams {
    gain: f32,
    eq_db: [f32; 3],
}

impl Default for PadParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            eq_db: [0.0; 3],
        }
    }
}

/// Per-frame one-pole coefficient for master volume smoothing.
const MASTER_SMOOTH: f32 = 0.005;

/// The render core. Owned by the output callback; tests drive `process`
/// directly.
pub struct EngineState {
    sample_rate: u32,
    bank: SampleBank,
    voices: Vec<Voice>,
    pads: [PadParams; NUM_PADS],
    tempo: TempoState,
    master_volume: f32,
    master_smooth: f32,
    next_serial: u64,
    throttle: TelemetryThrottle,
    rx: ControlReceiver,
    tx: TelemetrySender,
}

impl EngineState {
    fn new(sample_rate: u32, rx: ControlReceiver, tx: TelemetrySender) -> Self {
        Self {
            sample_rate,
            bank: SampleBank::new(),
            voices: (0..MAX_VOICES)
                .map(|_| Voice::new(sample_rate as f32))
                .collect(),
            pads: [PadParams::default(); NUM_PADS],
            tempo: TempoState::default(),
            master_volume: 1.0,
            master_smooth: 1.0,
            next_serial: 1,
            throttle: TelemetryThrottle::new(sample_rate),
            rx,
            tx,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of live voices.
    pub fn live_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.is_active()).count()
    }

    /// Render one interleaved stereo block.
    pub fn process(&mut self, output: &mut [f32]) {
        self.drain_control();

        output.fill(0.0);
        let block_frames = (output.len() / 2) as u32;

        let mut pad_peaks = [0.0f32; NUM_PADS];
        let mut pad_heads: [Option<u64>; NUM_PADS] = [None; NUM_PADS];

        for i in 0..self.voices.len() {
            if !self.voices[i].is_active() {
                continue;
            }
            let pad = self.voices[i].pad();
            let Some(slot) = self.bank.slot(pad) else {
                // A voice without a slot cannot sound; drop it
                self.voices[i].release();
                continue;
            };
            let region = slot.region;
            let targets = self.voice_targets(pad, self.voices[i].velocity());

            let peak = self.voices[i].render_add(output, region, &targets);

            if !self.voices[i].is_paused() {
                pad_peaks[pad] = pad_peaks[pad].max(peak);
                pad_heads[pad] = Some(self.voices[i].playhead());
            }
        }

        // Master gain with per-frame smoothing, soft-clipped on the mix bus
        for frame in output.chunks_exact_mut(2) {
            self.master_smooth += (self.master_volume - self.master_smooth) * MASTER_SMOOTH;
            frame[0] = soft_clip(frame[0] * self.master_smooth);
            frame[1] = soft_clip(frame[1] * self.master_smooth);
        }

        for pad in 0..NUM_PADS {
            if let Some(position) = pad_heads[pad] {
                if self.throttle.due(pad, block_frames) {
                    self.tx.send(AudioMessage::PadPeak {
                        id: pad,
                        peak: pad_peaks[pad].min(1.0),
                    });
                    self.tx.send(AudioMessage::PadPlayhead { id: pad, position });
                }
            }
        }
    }

    /// Apply at most one ring's worth of pending commands.
    fn drain_control(&mut self) {
        for _ in 0..QUEUE_CAPACITY {
            match self.rx.recv() {
                Some(msg) => self.handle_message(msg),
                None => break,
            }
        }
    }

    fn handle_message(&mut self, msg: ControlMessage) {
        // The handle validates ids; the render context still absorbs a bad
        // one rather than indexing out of bounds
        if msg.pad_id().is_some_and(|id| id >= NUM_PADS) {
            return;
        }

        let live_before = self.live_voices();

        match msg {
            ControlMessage::LoadSample { id, sample } => {
                // Replacing a slot supersedes its voices
                self.release_pad_voices(id);
                self.bank.load(id, sample);
            }
            ControlMessage::UnloadSample { id } => {
                self.release_pad_voices(id);
                self.bank.unload(id);
                self.throttle.rearm(id);
            }
            ControlMessage::PlaySample { id, velocity } => self.trigger(id, velocity),
            ControlMessage::StopSample { id } => self.release_pad_voices(id),
            ControlMessage::PauseSample { id } => self.set_pad_paused(id, true),
            ControlMessage::ResumeSample { id } => self.set_pad_paused(id, false),
            ControlMessage::StopAll => {
                for voice in &mut self.voices {
                    voice.release();
                }
            }
            ControlMessage::SetSpeed(speed) => self.tempo.set_speed(speed),
            ControlMessage::SetMasterVolume(volume) => {
                self.master_volume = volume.clamp(MASTER_VOLUME_MIN, MASTER_VOLUME_MAX);
            }
            ControlMessage::SetPadGain { id, gain } => {
                self.pads[id].gain = gain.clamp(PAD_GAIN_MIN, PAD_GAIN_MAX);
            }
            ControlMessage::SetPadEq {
                id,
                low_db,
                mid_db,
                high_db,
            } => {
                self.pads[id].eq_db = [low_db, mid_db, high_db];
            }
            ControlMessage::SetPadLoopRegion { id, start, end } => {
                // Invalid regions are absorbed; the slot keeps its bounds
                self.bank.set_region(id, start, end);
            }
            ControlMessage::SetKeyLock(on) => self.tempo.key_lock = on,
            ControlMessage::SetBpmLock(on) => self.tempo.bpm_lock = on,
            ControlMessage::SetMasterBpm(bpm) => {
                if bpm.is_finite() && bpm > 0.0 {
                    self.tempo.master_bpm = Some(bpm);
                }
            }
            ControlMessage::SetPadBpm { id, bpm } => {
                self.tempo.pad_bpm[id] = bpm.filter(|b| b.is_finite() && *b > 0.0);
            }
            ControlMessage::Ping => {
                self.tx.send(AudioMessage::Pong);
            }
        }

        if live_before > 0 && self.live_voices() == 0 {
            self.tx.send(AudioMessage::Stopped);
        }
    }

    fn voice_targets(&self, id: usize, velocity: f32) -> VoiceTargets {
        let params = &self.pads[id];
        let ratio = self.tempo.tempo_ratio(id);
        VoiceTargets {
            gain: params.gain * velocity,
            band_gains: [
                band_gain(params.eq_db[0]),
                band_gain(params.eq_db[1]),
                band_gain(params.eq_db[2]),
            ],
            tempo_ratio: ratio,
            transpose: self.tempo.transpose_semitones(ratio),
        }
    }

    /// Trigger a pad. Empty slots are ignored; an occupied pool evicts the
    /// oldest live voice rather than dropping the trigger.
    fn trigger(&mut self, id: usize, velocity: f32) {
        let Some(slot) = self.bank.slot(id) else {
            return;
        };
        let sample = slot.sample.clone();
        let region = slot.region;

        // Retrigger supersedes the pad's previous voices
        self.release_pad_voices(id);

        let index = self.claim_voice_slot();
        let serial = self.next_serial;
        self.next_serial += 1;

        let velocity = velocity.clamp(0.0, 1.0);
        let targets = self.voice_targets(id, velocity);
        self.voices[index].bind(id, sample, region, velocity, serial, &targets);
    }

    /// Index of a free pool slot, or the oldest live voice when exhausted.
    fn claim_voice_slot(&mut self) -> usize {
        if let Some(free) = self.voices.iter().position(|v| !v.is_active()) {
            return free;
        }
        let mut oldest = 0;
        let mut oldest_serial = u64::MAX;
        for (i, voice) in self.voices.iter().enumerate() {
            if voice.serial() < oldest_serial {
                oldest_serial = voice.serial();
                oldest = i;
            }
        }
        self.voices[oldest].release();
        oldest
    }

    fn release_pad_voices(&mut self, id: usize) {
        for voice in &mut self.voices {
            if voice.is_active() && voice.pad() == id {
                voice.release();
            }
        }
    }

    fn set_pad_paused(&mut self, id: usize, paused: bool) {
        for voice in &mut self.voices {
            if voice.is_active() && voice.pad() == id {
                voice.set_paused(paused);
            }
        }
    }

    #[cfg(test)]
    fn pad_playhead(&self, id: usize) -> Option<u64> {
        self.voices
            .iter()
            .find(|v| v.is_active() && v.pad() == id)
            .map(|v| v.playhead())
    }

    #[cfg(test)]
    fn pad_is_live(&self, id: usize) -> bool {
        self.voices.iter().any(|v| v.is_active() && v.pad() == id)
    }
}

/// Control-plane handle: validated API over the message rings.
pub struct EngineHandle {
    tx: ControlSender,
    rx: TelemetryReceiver,
    sample_rate: u32,
}

impl EngineHandle {
    /// Output rate that published buffers must be normalized to.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    fn send(&mut self, msg: ControlMessage) {
        // Best-effort by design; a full ring drops the message
        let _ = self.tx.send(msg);
    }

    /// Publish a finished buffer into a pad slot.
    pub fn publish_sample(&mut self, id: usize, sample: SharedSample) -> Result<(), ControlError> {
        check_pad(id)?;
        self.send(ControlMessage::LoadSample { id, sample });
        Ok(())
    }

    pub fn unload(&mut self, id: usize) -> Result<(), ControlError> {
        check_pad(id)?;
        self.send(ControlMessage::UnloadSample { id });
        Ok(())
    }

    pub fn trigger(&mut self, id: usize, velocity: f32) -> Result<(), ControlError> {
        check_pad(id)?;
        check_finite(velocity, "velocity")?;
        self.send(ControlMessage::PlaySample { id, velocity });
        Ok(())
    }

    pub fn stop(&mut self, id: usize) -> Result<(), ControlError> {
        check_pad(id)?;
        self.send(ControlMessage::StopSample { id });
        Ok(())
    }

    pub fn pause(&mut self, id: usize) -> Result<(), ControlError> {
        check_pad(id)?;
        self.send(ControlMessage::PauseSample { id });
        Ok(())
    }

    pub fn resume(&mut self, id: usize) -> Result<(), ControlError> {
        check_pad(id)?;
        self.send(ControlMessage::ResumeSample { id });
        Ok(())
    }

    pub fn stop_all(&mut self) {
        self.send(ControlMessage::StopAll);
    }

    /// Global speed multiplier; finite values are clamped to [0.5, 2.0].
    pub fn set_speed(&mut self, speed: f32) -> Result<(), ControlError> {
        check_finite(speed, "speed")?;
        self.send(ControlMessage::SetSpeed(speed.clamp(SPEED_MIN, SPEED_MAX)));
        Ok(())
    }

    pub fn set_master_volume(&mut self, volume: f32) -> Result<(), ControlError> {
        check_finite(volume, "volume")?;
        self.send(ControlMessage::SetMasterVolume(volume));
        Ok(())
    }

    pub fn set_pad_gain(&mut self, id: usize, gain: f32) -> Result<(), ControlError> {
        check_pad(id)?;
        check_finite(gain, "gain")?;
        self.send(ControlMessage::SetPadGain { id, gain });
        Ok(())
    }

    pub fn set_pad_eq(
        &mut self,
        id: usize,
        low_db: f32,
        mid_db: f32,
        high_db: f32,
    ) -> Result<(), ControlError> {
        check_pad(id)?;
        check_finite(low_db, "low_db")?;
        check_finite(mid_db, "mid_db")?;
        check_finite(high_db, "high_db")?;
        let clamp = |db: f32| db.clamp(EQ_DB_KILL, EQ_DB_MAX);
        self.send(ControlMessage::SetPadEq {
            id,
            low_db: clamp(low_db),
            mid_db: clamp(mid_db),
            high_db: clamp(high_db),
        });
        Ok(())
    }

    /// Loop bounds in integer frames at the buffer's rate. Bounds beyond
    /// the buffer are rejected by the renderer; ordering is checked here.
    pub fn set_pad_loop_region(
        &mut self,
        id: usize,
        start: u64,
        end: u64,
    ) -> Result<(), ControlError> {
        check_pad(id)?;
        if start >= end {
            return Err(ControlError::InvalidRegion { start, end });
        }
        self.send(ControlMessage::SetPadLoopRegion { id, start, end });
        Ok(())
    }

    pub fn set_key_lock(&mut self, on: bool) {
        self.send(ControlMessage::SetKeyLock(on));
    }

    pub fn set_bpm_lock(&mut self, on: bool) {
        self.send(ControlMessage::SetBpmLock(on));
    }

    pub fn set_master_bpm(&mut self, bpm: f32) -> Result<(), ControlError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(ControlError::InvalidBpm(bpm));
        }
        self.send(ControlMessage::SetMasterBpm(bpm));
        Ok(())
    }

    pub fn set_pad_bpm(&mut self, id: usize, bpm: Option<f32>) -> Result<(), ControlError> {
        check_pad(id)?;
        if let Some(b) = bpm {
            if !b.is_finite() || b <= 0.0 {
                return Err(ControlError::InvalidBpm(b));
            }
        }
        self.send(ControlMessage::SetPadBpm { id, bpm });
        Ok(())
    }

    pub fn ping(&mut self) {
        self.send(ControlMessage::Ping);
    }

    /// Pop the next telemetry event, if any. Never blocks.
    pub fn poll_telemetry(&mut self) -> Option<AudioMessage> {
        self.rx.recv()
    }
}

fn check_pad(id: usize) -> Result<(), ControlError> {
    if id < NUM_PADS {
        Ok(())
    } else {
        Err(ControlError::InvalidPad(id))
    }
}

fn check_finite(value: f32, name: &'static str) -> Result<(), ControlError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ControlError::NonFinite(name))
    }
}

/// Build an engine and its handle without opening a device (embedding and
/// tests drive [`EngineState::process`] themselves).
pub fn engine_pair(sample_rate: u32) -> (EngineState, EngineHandle) {
    let (control_tx, control_rx) = control_channel();
    let (telemetry_tx, telemetry_rx) = telemetry_channel();
    let state = EngineState::new(sample_rate, control_rx, telemetry_tx);
    let handle = EngineHandle {
        tx: control_tx,
        rx: telemetry_rx,
        sample_rate,
    };
    (state, handle)
}

/// A running platform output stream. Dropping (or [`close`](Self::close))
/// stops the stream first; queued messages die with the engine after that,
/// matching the shutdown order the concurrency model requires.
pub struct OutputStream {
    _stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}

impl OutputStream {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Stop the stream explicitly.
    pub fn close(self) {}
}

/// Frames per chunk when adapting non-stereo devices.
const SCRATCH_FRAMES: usize = 8192;

fn stream_error(err: cpal::StreamError) {
    tracing::error!("audio stream error: {err}");
}

/// Open the default output device and start rendering.
///
/// The engine moves into the callback; the returned handle is the only way
/// to reach it. The stream object must be kept alive for as long as audio
/// should run.
pub fn open_output() -> Result<(OutputStream, EngineHandle), StreamError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(StreamError::NoDevice)?;
    let supported = device.default_output_config()?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config: cpal::StreamConfig = supported.into();

    let (mut state, handle) = engine_pair(sample_rate);

    let stream = if channels == 2 {
        device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                state.process(data);
            },
            stream_error,
            None,
        )?
    } else {
        // Render stereo internally and adapt in fixed-size chunks so the
        // callback never allocates
        let ch = channels as usize;
        let mut scratch = vec![0.0f32; SCRATCH_FRAMES * 2];
        device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for chunk in data.chunks_mut(SCRATCH_FRAMES * ch) {
                    let frames = chunk.len() / ch;
                    let stereo = &mut scratch[..frames * 2];
                    state.process(stereo);
                    if ch == 1 {
                        for (i, out) in chunk.iter_mut().enumerate() {
                            *out = 0.5 * (stereo[i * 2] + stereo[i * 2 + 1]);
                        }
                    } else {
                        for f in 0..frames {
                            chunk[f * ch] = stereo[f * 2];
                            chunk[f * ch + 1] = stereo[f * 2 + 1];
                            for extra in 2..ch {
                                chunk[f * ch + extra] = 0.0;
                            }
                        }
                    }
                }
            },
            stream_error,
            None,
        )?
    };

    stream.play()?;
    info!(sample_rate, channels, "audio output started");

    Ok((
        OutputStream {
            _stream: stream,
            sample_rate,
            channels,
        },
        handle,
    ))
}

/// Soft clip threshold - gives the knee room before the ceiling.
const SOFT_CLIP_THRESHOLD: f32 = 0.75;
/// Soft clip ceiling.
const SOFT_CLIP_CEILING: f32 = 0.89;

/// Gentle soft clipper for the mix bus. Transparent below the threshold,
/// asymptotic approach to the ceiling above it.
#[inline(always)]
fn soft_clip(x: f32) -> f32 {
    let abs_x = x.abs();
    if abs_x <= SOFT_CLIP_THRESHOLD {
        return x;
    }

    let sign = x.signum();
    let knee_width = SOFT_CLIP_CEILING - SOFT_CLIP_THRESHOLD;
    let over = abs_x - SOFT_CLIP_THRESHOLD;
    let ratio = over / knee_width;

    let compressed = SOFT_CLIP_THRESHOLD + knee_width * (1.0 - (-ratio * 3.0).exp());
    sign * compressed.min(SOFT_CLIP_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::{SampleData, SharedSample};
    use std::sync::Arc;

    const BLOCK: usize = 512;

    fn constant_sample(frames: u64, value: f32) -> SharedSample {
        Arc::new(SampleData::new(vec![value; frames as usize], 1, 48000))
    }

    fn process_blocks(state: &mut EngineState, blocks: usize) {
        let mut buf = vec![0.0f32; BLOCK * 2];
        for _ in 0..blocks {
            state.process(&mut buf);
        }
    }

    fn drain_events(handle: &mut EngineHandle) -> Vec<AudioMessage> {
        let mut events = Vec::new();
        while let Some(ev) = handle.poll_telemetry() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn test_voice_capacity_and_oldest_eviction() {
        let (mut state, mut handle) = engine_pair(48_000);

        for pad in 0..NUM_PADS {
            handle.publish_sample(pad, constant_sample(48_000, 0.1)).unwrap();
        }
        // 33 triggers on distinct pads: the pool caps at 32 and pad 0,
        // the oldest, is evicted by the 33rd
        for pad in 0..=MAX_VOICES {
            handle.trigger(pad, 1.0).unwrap();
        }
        process_blocks(&mut state, 1);

        assert_eq!(state.live_voices(), MAX_VOICES);
        assert!(!state.pad_is_live(0));
        assert!(state.pad_is_live(1));
        assert!(state.pad_is_live(MAX_VOICES));
    }

    #[test]
    fn test_retrigger_restarts_at_region_start() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.publish_sample(0, constant_sample(48_000, 0.1)).unwrap();
        handle.trigger(0, 1.0).unwrap();
        process_blocks(&mut state, 4);
        assert!(state.pad_playhead(0).unwrap() >= 3 * BLOCK as u64);

        handle.trigger(0, 1.0).unwrap();
        process_blocks(&mut state, 1);
        assert_eq!(state.live_voices(), 1);
        assert!(state.pad_playhead(0).unwrap() <= BLOCK as u64);
    }

    #[test]
    fn test_trigger_on_empty_slot_is_a_noop() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.trigger(7, 1.0).unwrap();
        process_blocks(&mut state, 1);
        assert_eq!(state.live_voices(), 0);
    }

    #[test]
    fn test_stop_and_unload_of_idle_pad_are_benign() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.stop(3).unwrap();
        handle.unload(3).unwrap();
        process_blocks(&mut state, 1);
        assert_eq!(state.live_voices(), 0);
        // No Stopped event: nothing was live
        assert!(drain_events(&mut handle).is_empty());
    }

    #[test]
    fn test_ping_pong() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.ping();
        process_blocks(&mut state, 1);
        assert!(drain_events(&mut handle)
            .iter()
            .any(|e| matches!(e, AudioMessage::Pong)));
    }

    #[test]
    fn test_stop_all_emits_stopped() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.publish_sample(0, constant_sample(48_000, 0.2)).unwrap();
        handle.publish_sample(1, constant_sample(48_000, 0.2)).unwrap();
        handle.trigger(0, 1.0).unwrap();
        handle.trigger(1, 1.0).unwrap();
        process_blocks(&mut state, 1);
        drain_events(&mut handle);

        handle.stop_all();
        process_blocks(&mut state, 1);
        assert_eq!(state.live_voices(), 0);
        assert!(drain_events(&mut handle)
            .iter()
            .any(|e| matches!(e, AudioMessage::Stopped)));
    }

    #[test]
    fn test_peak_telemetry_flows_while_playing() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.publish_sample(0, constant_sample(48_000, 0.5)).unwrap();
        handle.trigger(0, 1.0).unwrap();
        process_blocks(&mut state, 12);

        let events = drain_events(&mut handle);
        let peak = events.iter().find_map(|e| match e {
            AudioMessage::PadPeak { id: 0, peak } => Some(*peak),
            _ => None,
        });
        assert!(peak.is_some_and(|p| p > 0.0), "no positive peak in {:?}", events);
        assert!(events
            .iter()
            .any(|e| matches!(e, AudioMessage::PadPlayhead { id: 0, .. })));
    }

    #[test]
    fn test_unload_silences_pad_and_stops_telemetry() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.publish_sample(0, constant_sample(48_000, 0.5)).unwrap();
        handle.trigger(0, 1.0).unwrap();
        process_blocks(&mut state, 2);
        drain_events(&mut handle);

        handle.unload(0).unwrap();
        process_blocks(&mut state, 1);
        let events = drain_events(&mut handle);
        assert!(events.iter().any(|e| matches!(e, AudioMessage::Stopped)));

        // Further triggers are no-ops and no pad telemetry flows
        handle.trigger(0, 1.0).unwrap();
        process_blocks(&mut state, 12);
        assert_eq!(state.live_voices(), 0);
        assert!(drain_events(&mut handle)
            .iter()
            .all(|e| !matches!(e, AudioMessage::PadPeak { id: 0, .. })));
    }

    #[test]
    fn test_load_supersedes_playing_voices() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.publish_sample(0, constant_sample(48_000, 0.5)).unwrap();
        handle.trigger(0, 1.0).unwrap();
        process_blocks(&mut state, 1);
        assert_eq!(state.live_voices(), 1);

        handle.publish_sample(0, constant_sample(24_000, 0.3)).unwrap();
        process_blocks(&mut state, 1);
        assert_eq!(state.live_voices(), 0);
    }

    #[test]
    fn test_paused_pad_keeps_position_and_goes_silent() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.publish_sample(0, constant_sample(48_000, 0.5)).unwrap();
        handle.trigger(0, 1.0).unwrap();
        process_blocks(&mut state, 2);

        handle.pause(0).unwrap();
        process_blocks(&mut state, 1);
        let held = state.pad_playhead(0).unwrap();
        process_blocks(&mut state, 3);
        assert_eq!(state.pad_playhead(0), Some(held));

        handle.resume(0).unwrap();
        process_blocks(&mut state, 2);
        assert!(state.pad_playhead(0).unwrap() > held);
    }

    #[test]
    fn test_pad_id_validation() {
        let (_state, mut handle) = engine_pair(48_000);

        assert!(handle.trigger(0, 1.0).is_ok());
        assert!(handle.trigger(NUM_PADS - 1, 1.0).is_ok());
        assert_eq!(
            handle.trigger(NUM_PADS, 1.0),
            Err(ControlError::InvalidPad(NUM_PADS))
        );
        assert!(handle.stop(NUM_PADS).is_err());
        assert!(handle.set_pad_gain(NUM_PADS, 1.0).is_err());
        assert!(handle
            .publish_sample(NUM_PADS, constant_sample(16, 0.0))
            .is_err());
    }

    #[test]
    fn test_parameter_validation() {
        let (_state, mut handle) = engine_pair(48_000);

        assert_eq!(
            handle.set_speed(f32::NAN),
            Err(ControlError::NonFinite("speed"))
        );
        assert!(handle.set_speed(3.0).is_ok()); // finite values clamp
        assert!(handle.set_master_bpm(0.0).is_err());
        assert!(handle.set_pad_bpm(0, Some(f32::INFINITY)).is_err());
        assert!(handle.set_pad_bpm(0, None).is_ok());
        assert_eq!(
            handle.set_pad_loop_region(0, 500, 500),
            Err(ControlError::InvalidRegion { start: 500, end: 500 })
        );
    }

    #[test]
    fn test_speed_reaches_renderer() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.set_speed(1.5).unwrap();
        process_blocks(&mut state, 1);
        assert_eq!(state.tempo.speed, 1.5);
    }

    #[test]
    fn test_invalid_region_message_is_absorbed() {
        let (mut state, mut handle) = engine_pair(48_000);
        handle.publish_sample(0, constant_sample(1000, 0.1)).unwrap();
        handle.set_pad_loop_region(0, 100, 5000).unwrap(); // past buffer end
        process_blocks(&mut state, 1);
        let region = state.bank.slot(0).unwrap().region;
        assert_eq!(region, crate::bank::LoopRegion { start: 0, end: 1000 });
    }

    #[test]
    fn test_soft_clip_is_transparent_below_threshold() {
        assert_eq!(soft_clip(0.5), 0.5);
        assert_eq!(soft_clip(-0.5), -0.5);
        assert!(soft_clip(1.5) <= SOFT_CLIP_CEILING);
        assert!(soft_clip(-1.5) >= -SOFT_CLIP_CEILING);
    }
}
