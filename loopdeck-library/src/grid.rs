//! Loop-region grid math.
//!
//! Loop bounds are integer frame indices at the buffer's rate so the mixer
//! wrap stays exact. With auto-loop on, bounds snap to a 1/64-note grid
//! (`beat/16`) anchored at the detected downbeat, else the first beat, else
//! zero, shifted by a per-pad offset clamped to one bar. All of this runs
//! in the control plane; the renderer only ever sees the resulting
//! `SetPadLoopRegion`.

use loopdeck_analysis::Analysis;
use loopdeck_audio::LoopRegion;

/// Grid resolution: 16 divisions per beat is a 1/64-note grid.
pub const GRID_DIVISIONS_PER_BEAT: u32 = 16;

/// Bar length assumed by the auto-loop (4/4).
pub const BEATS_PER_BAR: u32 = 4;

/// Per-pad loop controls held by the control plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    /// Snap bounds to the grid and derive length from `bar_count`.
    pub auto_loop: bool,
    /// Loop length in bars while auto-loop is on.
    pub bar_count: u32,
    /// Shift of the loop start in frames, clamped to one bar either way.
    pub offset_frames: i64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            auto_loop: true,
            bar_count: 4,
            offset_frames: 0,
        }
    }
}

/// One beat in frames at the given tempo.
pub fn beat_frames(bpm: f64, sample_rate: u32) -> f64 {
    60.0 / bpm * sample_rate as f64
}

/// One grid step (1/64 note) in frames.
pub fn grid_step_frames(bpm: f64, sample_rate: u32) -> f64 {
    beat_frames(bpm, sample_rate) / GRID_DIVISIONS_PER_BEAT as f64
}

/// Snap a position to the nearest grid line of the given step, measured
/// from the anchor.
pub fn snap_to_grid(pos: f64, anchor: f64, step: f64) -> f64 {
    anchor + ((pos - anchor) / step).round() * step
}

/// Derive the auto-loop region for a pad: `bar_count` bars from the anchor
/// plus the bar-clamped offset, both bounds snapped to the grid.
///
/// Returns `None` when auto-loop is off, the tempo is unknown, or the
/// derived region collapses; the caller falls back to the full buffer.
pub fn auto_loop_region(
    analysis: &Analysis,
    bpm: f64,
    settings: &LoopSettings,
    frames: u64,
    sample_rate: u32,
) -> Option<LoopRegion> {
    if !settings.auto_loop || settings.bar_count == 0 || bpm <= 0.0 || frames == 0 {
        return None;
    }

    let step = grid_step_frames(bpm, sample_rate);
    let bar = beat_frames(bpm, sample_rate) * BEATS_PER_BAR as f64;
    let anchor = analysis.anchor_secs() * sample_rate as f64;

    let offset = (settings.offset_frames as f64).clamp(-bar, bar);
    let start_raw = anchor + offset;
    let length = bar * settings.bar_count as f64;

    let start = snap_to_grid(start_raw, anchor, step).round().max(0.0) as u64;
    let end = (snap_to_grid(start_raw + length, anchor, step).round().max(0.0) as u64).min(frames);

    if start < end {
        Some(LoopRegion { start, end })
    } else {
        None
    }
}

/// Snap manually chosen bounds to the grid (used while auto-loop is on).
/// Returns `None` when the snapped region collapses or the tempo is unknown.
pub fn snap_region(
    start: u64,
    end: u64,
    bpm: f64,
    anchor_secs: f64,
    sample_rate: u32,
    frames: u64,
) -> Option<LoopRegion> {
    if bpm <= 0.0 || frames == 0 {
        return None;
    }
    let step = grid_step_frames(bpm, sample_rate);
    let anchor = anchor_secs * sample_rate as f64;

    let snapped_start = snap_to_grid(start as f64, anchor, step).round().max(0.0) as u64;
    let snapped_end =
        (snap_to_grid(end as f64, anchor, step).round().max(0.0) as u64).min(frames);

    if snapped_start < snapped_end {
        Some(LoopRegion {
            start: snapped_start,
            end: snapped_end,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis_with_anchor(downbeat: Option<f64>, first_beat: Option<f64>) -> Analysis {
        Analysis {
            bpm: Some(120.0),
            key: None,
            beats: first_beat.into_iter().collect(),
            downbeats: downbeat.into_iter().collect(),
        }
    }

    #[test]
    fn test_grid_step_at_120_bpm() {
        // beat = 0.5 s = 24000 frames at 48 kHz; 1/64 note = 1500 frames
        assert_eq!(beat_frames(120.0, 48_000), 24_000.0);
        assert_eq!(grid_step_frames(120.0, 48_000), 1_500.0);
    }

    #[test]
    fn test_one_bar_from_zero_anchor() {
        let analysis = analysis_with_anchor(None, None);
        let settings = LoopSettings {
            bar_count: 1,
            ..Default::default()
        };

        let region = auto_loop_region(&analysis, 120.0, &settings, 480_000, 48_000).unwrap();
        assert_eq!(region, LoopRegion { start: 0, end: 96_000 });
    }

    #[test]
    fn test_anchor_prefers_downbeat() {
        let analysis = analysis_with_anchor(Some(0.5), Some(0.1));
        let settings = LoopSettings {
            bar_count: 1,
            ..Default::default()
        };

        let region = auto_loop_region(&analysis, 120.0, &settings, 480_000, 48_000).unwrap();
        assert_eq!(region, LoopRegion { start: 24_000, end: 120_000 });
    }

    #[test]
    fn test_offset_snaps_to_grid() {
        let analysis = analysis_with_anchor(None, None);
        let settings = LoopSettings {
            bar_count: 1,
            offset_frames: 800, // rounds to one grid step of 1500
            ..Default::default()
        };

        let region = auto_loop_region(&analysis, 120.0, &settings, 480_000, 48_000).unwrap();
        assert_eq!(region.start, 1_500);
        assert_eq!(region.end, 97_500);
    }

    #[test]
    fn test_offset_is_bar_clamped() {
        let analysis = analysis_with_anchor(None, None);
        let settings = LoopSettings {
            bar_count: 1,
            offset_frames: 10_000_000, // far past one bar
            ..Default::default()
        };

        let region = auto_loop_region(&analysis, 120.0, &settings, 480_000, 48_000).unwrap();
        assert_eq!(region.start, 96_000); // exactly one bar
    }

    #[test]
    fn test_auto_loop_off_yields_none() {
        let analysis = analysis_with_anchor(None, None);
        let settings = LoopSettings {
            auto_loop: false,
            ..Default::default()
        };
        assert!(auto_loop_region(&analysis, 120.0, &settings, 480_000, 48_000).is_none());
    }

    #[test]
    fn test_unknown_bpm_yields_none() {
        let analysis = analysis_with_anchor(None, None);
        let settings = LoopSettings::default();
        assert!(auto_loop_region(&analysis, 0.0, &settings, 480_000, 48_000).is_none());
    }

    #[test]
    fn test_end_clamps_to_buffer() {
        let analysis = analysis_with_anchor(None, None);
        let settings = LoopSettings {
            bar_count: 4,
            ..Default::default()
        };

        // 4 bars at 120 BPM need 384000 frames; the buffer has fewer
        let region = auto_loop_region(&analysis, 120.0, &settings, 100_000, 48_000).unwrap();
        assert_eq!(region.end, 100_000);
    }

    #[test]
    fn test_snap_region_rounds_manual_bounds() {
        let region = snap_region(100, 95_900, 120.0, 0.0, 48_000, 480_000).unwrap();
        assert_eq!(region, LoopRegion { start: 0, end: 96_000 });
    }

    #[test]
    fn test_snap_region_collapse_is_none() {
        // Both bounds round to the same grid line
        assert!(snap_region(10, 20, 120.0, 0.0, 48_000, 480_000).is_none());
    }
}
