//! Session - the control-surface façade over engine and loader.
//!
//! The session owns the engine handle, the loader and the control-plane
//! metadata the renderer must not carry: per-pad analysis results, loop
//! settings, the tempo mirror used for BPM-lock anchoring, and the pad
//! meters. Finished loads are published to the engine when their event is
//! polled, which keeps publication the final pipeline step - two racing
//! loads to one pad resolve by completion order, last writer wins.

use std::path::PathBuf;

use tracing::debug;

use loopdeck_analysis::Analysis;
use loopdeck_audio::{
    anchored_master_bpm, AudioMessage, ControlError, EngineHandle, LoopRegion, PadMeters,
    NUM_PADS, SPEED_MAX, SPEED_MIN,
};

use crate::grid::{self, LoopSettings};
use crate::loader::{LoadEvent, SampleLoader};
use crate::project::{PadSnapshot, ProjectSnapshot};

/// Control-plane metadata for one pad.
#[derive(Debug, Clone)]
struct PadState {
    loaded: bool,
    frames: u64,
    duration_secs: f64,
    analysis: Analysis,
    cache_path: Option<PathBuf>,
    manual_bpm: Option<f32>,
    gain: f32,
    eq_db: [f32; 3],
    loop_settings: LoopSettings,
    region: Option<LoopRegion>,
}

impl Default for PadState {
    fn default() -> Self {
        Self {
            loaded: false,
            frames: 0,
            duration_secs: 0.0,
            analysis: Analysis::default(),
            cache_path: None,
            manual_bpm: None,
            gain: 1.0,
            eq_db: [0.0; 3],
            loop_settings: LoopSettings::default(),
            region: None,
        }
    }
}

/// The control surface's entry point to the looping core.
pub struct Session {
    engine: EngineHandle,
    loader: SampleLoader,
    pads: Vec<PadState>,
    meters: PadMeters,
    speed: f32,
    key_lock: bool,
    bpm_lock: bool,
    master_bpm: Option<f32>,
    selected_pad: usize,
}

impl Session {
    pub fn new(engine: EngineHandle, loader: SampleLoader) -> Self {
        Self {
            engine,
            loader,
            pads: (0..NUM_PADS).map(|_| PadState::default()).collect(),
            meters: PadMeters::new(),
            speed: 1.0,
            key_lock: false,
            bpm_lock: false,
            master_bpm: None,
            selected_pad: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.engine.sample_rate()
    }

    // ---- Loading -------------------------------------------------------

    /// Start loading a file into a pad. Progress, success and failure
    /// arrive through [`poll_loader`](Self::poll_loader).
    pub fn load(&mut self, id: usize, path: impl Into<PathBuf>) -> Result<(), ControlError> {
        check_pad(id)?;
        self.loader.load(id, path.into());
        Ok(())
    }

    /// Poll the loader event queue. A `Success` event publishes its buffer
    /// to the engine and refreshes the pad's BPM and loop region before
    /// being handed to the caller.
    pub fn poll_loader(&mut self) -> Option<LoadEvent> {
        let event = self.loader.poll()?;

        if let LoadEvent::Success {
            id,
            sample,
            duration_secs,
            analysis,
            cache_path,
        } = &event
        {
            let id = *id;
            let _ = self.engine.publish_sample(id, sample.clone());

            let pad = &mut self.pads[id];
            pad.loaded = true;
            pad.frames = sample.frames();
            pad.duration_secs = *duration_secs;
            pad.analysis = analysis.clone();
            pad.cache_path = cache_path.clone();

            let effective = self.effective_bpm(id);
            let _ = self.engine.set_pad_bpm(id, effective);
            self.refresh_region(id);
            debug!(id, frames = self.pads[id].frames, "pad published");
        }

        Some(event)
    }

    // ---- Playback ------------------------------------------------------

    pub fn trigger(&mut self, id: usize, velocity: f32) -> Result<(), ControlError> {
        self.engine.trigger(id, velocity)
    }

    pub fn stop(&mut self, id: usize) -> Result<(), ControlError> {
        self.engine.stop(id)
    }

    pub fn pause(&mut self, id: usize) -> Result<(), ControlError> {
        self.engine.pause(id)
    }

    pub fn resume(&mut self, id: usize) -> Result<(), ControlError> {
        self.engine.resume(id)
    }

    pub fn stop_all(&mut self) {
        self.engine.stop_all();
    }

    /// Drop a pad's sample and all control-plane state attached to it.
    pub fn unload(&mut self, id: usize) -> Result<(), ControlError> {
        self.engine.unload(id)?;
        self.pads[id] = PadState::default();
        self.meters.clear(id);
        Ok(())
    }

    // ---- Mix parameters ------------------------------------------------

    pub fn set_master_volume(&mut self, volume: f32) -> Result<(), ControlError> {
        self.engine.set_master_volume(volume)
    }

    pub fn set_pad_gain(&mut self, id: usize, gain: f32) -> Result<(), ControlError> {
        self.engine.set_pad_gain(id, gain)?;
        self.pads[id].gain = gain;
        Ok(())
    }

    pub fn set_pad_eq(
        &mut self,
        id: usize,
        low_db: f32,
        mid_db: f32,
        high_db: f32,
    ) -> Result<(), ControlError> {
        self.engine.set_pad_eq(id, low_db, mid_db, high_db)?;
        self.pads[id].eq_db = [low_db, mid_db, high_db];
        Ok(())
    }

    // ---- Tempo and key -------------------------------------------------

    /// Global speed; while BPM-locked this re-anchors the master BPM from
    /// the selected pad at the new speed.
    pub fn set_speed(&mut self, speed: f32) -> Result<(), ControlError> {
        self.engine.set_speed(speed)?;
        self.speed = speed.clamp(SPEED_MIN, SPEED_MAX);
        if self.bpm_lock {
            self.reanchor_master();
        }
        Ok(())
    }

    pub fn set_key_lock(&mut self, on: bool) {
        self.key_lock = on;
        self.engine.set_key_lock(on);
    }

    /// Engage or release BPM-lock. Engaging anchors
    /// `master_bpm = pad_bpm(selected) * speed` before the lock message so
    /// the renderer never sees the lock without its master.
    pub fn set_bpm_lock(&mut self, on: bool) {
        self.bpm_lock = on;
        if on {
            self.reanchor_master();
        }
        self.engine.set_bpm_lock(on);
    }

    pub fn set_master_bpm(&mut self, bpm: f32) -> Result<(), ControlError> {
        self.engine.set_master_bpm(bpm)?;
        self.master_bpm = Some(bpm);
        Ok(())
    }

    /// Manual per-pad BPM override; `None` falls back to the detected BPM.
    pub fn set_pad_bpm(&mut self, id: usize, bpm: Option<f32>) -> Result<(), ControlError> {
        check_pad(id)?;
        if let Some(b) = bpm {
            // Engine-side validation without mutating our mirror first
            self.engine.set_pad_bpm(id, Some(b))?;
        }
        self.pads[id].manual_bpm = bpm;
        let effective = self.effective_bpm(id);
        let _ = self.engine.set_pad_bpm(id, effective);
        self.refresh_region(id);
        if self.bpm_lock && id == self.selected_pad {
            self.reanchor_master();
        }
        Ok(())
    }

    /// Select the pad BPM-lock anchors to.
    pub fn select_pad(&mut self, id: usize) -> Result<(), ControlError> {
        check_pad(id)?;
        self.selected_pad = id;
        Ok(())
    }

    fn reanchor_master(&mut self) {
        if let Some(bpm) = self.effective_bpm(self.selected_pad) {
            let master = anchored_master_bpm(bpm, self.speed);
            self.master_bpm = Some(master);
            let _ = self.engine.set_master_bpm(master);
        }
    }

    fn effective_bpm(&self, id: usize) -> Option<f32> {
        self.pads[id].manual_bpm.or(self.pads[id].analysis.bpm)
    }

    // ---- Loop regions --------------------------------------------------

    /// Manually set loop bounds in frames. While auto-loop is on the bounds
    /// snap to the pad's beat grid; with it off they are taken as-is.
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

        let pad = &self.pads[id];
        let snapped = if pad.loop_settings.auto_loop {
            self.effective_bpm(id).and_then(|bpm| {
                grid::snap_region(
                    start,
                    end,
                    bpm as f64,
                    pad.analysis.anchor_secs(),
                    self.engine.sample_rate(),
                    pad.frames,
                )
            })
        } else {
            None
        };

        let mut region = snapped.unwrap_or(LoopRegion { start, end });
        if self.pads[id].frames > 0 {
            region.end = region.end.min(self.pads[id].frames);
        }
        if region.start >= region.end {
            return Err(ControlError::InvalidRegion { start, end });
        }

        self.pads[id].region = Some(region);
        self.engine.set_pad_loop_region(id, region.start, region.end)
    }

    pub fn set_auto_loop(&mut self, id: usize, on: bool) -> Result<(), ControlError> {
        check_pad(id)?;
        self.pads[id].loop_settings.auto_loop = on;
        self.refresh_region(id);
        Ok(())
    }

    pub fn set_loop_bars(&mut self, id: usize, bars: u32) -> Result<(), ControlError> {
        check_pad(id)?;
        self.pads[id].loop_settings.bar_count = bars;
        self.refresh_region(id);
        Ok(())
    }

    pub fn set_loop_offset(&mut self, id: usize, offset_frames: i64) -> Result<(), ControlError> {
        check_pad(id)?;
        self.pads[id].loop_settings.offset_frames = offset_frames;
        self.refresh_region(id);
        Ok(())
    }

    /// Recompute a pad's region from its settings and push it to the
    /// renderer. Falls back to the full buffer when the grid cannot apply.
    fn refresh_region(&mut self, id: usize) {
        let pad = &self.pads[id];
        if !pad.loaded || pad.frames == 0 {
            return;
        }

        let region = self
            .effective_bpm(id)
            .and_then(|bpm| {
                grid::auto_loop_region(
                    &pad.analysis,
                    bpm as f64,
                    &pad.loop_settings,
                    pad.frames,
                    self.engine.sample_rate(),
                )
            })
            .unwrap_or_else(|| LoopRegion::full(pad.frames));

        self.pads[id].region = Some(region);
        let _ = self.engine.set_pad_loop_region(id, region.start, region.end);
    }

    // ---- Telemetry -----------------------------------------------------

    pub fn ping(&mut self) {
        self.engine.ping();
    }

    /// Pop the next telemetry event, folding meter updates in as it passes.
    pub fn poll_telemetry(&mut self) -> Option<AudioMessage> {
        let event = self.engine.poll_telemetry()?;
        self.meters.apply(&event);
        Some(event)
    }

    /// Decay pad meters by elapsed wall time.
    pub fn decay_meters(&mut self, dt_secs: f32) {
        self.meters.decay(dt_secs);
    }

    pub fn meters(&self) -> &PadMeters {
        &self.meters
    }

    // ---- State views ---------------------------------------------------

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn key_lock(&self) -> bool {
        self.key_lock
    }

    pub fn bpm_lock(&self) -> bool {
        self.bpm_lock
    }

    pub fn master_bpm(&self) -> Option<f32> {
        self.master_bpm
    }

    pub fn selected_pad(&self) -> usize {
        self.selected_pad
    }

    pub fn pad_is_loaded(&self, id: usize) -> bool {
        self.pads.get(id).is_some_and(|p| p.loaded)
    }

    pub fn pad_region(&self, id: usize) -> Option<LoopRegion> {
        self.pads.get(id).and_then(|p| p.region)
    }

    pub fn pad_analysis(&self, id: usize) -> Option<&Analysis> {
        self.pads.get(id).filter(|p| p.loaded).map(|p| &p.analysis)
    }

    /// Plain serializable values for the persistence collaborator.
    pub fn snapshot(&self) -> ProjectSnapshot {
        let mut snapshot = ProjectSnapshot {
            speed: self.speed,
            key_lock: self.key_lock,
            bpm_lock: self.bpm_lock,
            master_bpm: self.master_bpm,
            ..Default::default()
        };

        for (index, pad) in self.pads.iter().enumerate() {
            snapshot.pads[index] = PadSnapshot {
                cache_path: pad.cache_path.clone(),
                loop_start: pad.region.map(|r| r.start),
                loop_end: pad.region.map(|r| r.end),
                auto_loop: pad.loop_settings.auto_loop,
                bar_count: pad.loop_settings.bar_count,
                loop_offset: pad.loop_settings.offset_frames,
                gain: pad.gain,
                eq_db: pad.eq_db,
                detected_bpm: pad.analysis.bpm,
                manual_bpm: pad.manual_bpm,
                key: pad.analysis.key.clone(),
            };
        }

        snapshot
    }
}

fn check_pad(id: usize) -> Result<(), ControlError> {
    if id < NUM_PADS {
        Ok(())
    } else {
        Err(ControlError::InvalidPad(id))
    }
}
