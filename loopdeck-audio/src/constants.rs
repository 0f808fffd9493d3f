//! Engine configuration constants and parameter limits.

/// Size of the pad grid (GRID_SIZE x GRID_SIZE).
pub const GRID_SIZE: usize = 6;

/// Total number of sample pads.
pub const NUM_PADS: usize = GRID_SIZE * GRID_SIZE;

/// Maximum number of voices that can sound simultaneously.
pub const MAX_VOICES: usize = 32;

/// Capacity of each cross-thread message queue.
pub const QUEUE_CAPACITY: usize = 1024;

/// Minimum global playback speed multiplier (50%).
pub const SPEED_MIN: f32 = 0.5;

/// Maximum global playback speed multiplier (200%).
pub const SPEED_MAX: f32 = 2.0;

/// Minimum master volume (silence).
pub const MASTER_VOLUME_MIN: f32 = 0.0;

/// Maximum master volume.
pub const MASTER_VOLUME_MAX: f32 = 2.0;

/// Minimum per-pad gain.
pub const PAD_GAIN_MIN: f32 = 0.0;

/// Maximum per-pad gain.
pub const PAD_GAIN_MAX: f32 = 2.0;

/// Isolator band control floor in dB. At or below this the band is killed
/// (exact linear 0.0), not merely attenuated.
pub const EQ_DB_KILL: f32 = -26.0;

/// Isolator band control ceiling in dB (+6 dB boost).
pub const EQ_DB_MAX: f32 = 6.0;

/// Low/mid crossover frequency of the isolator in Hz.
pub const CROSSOVER_LOW_HZ: f32 = 300.0;

/// Mid/high crossover frequency of the isolator in Hz.
pub const CROSSOVER_HIGH_HZ: f32 = 3500.0;

/// Per-pad telemetry rate in Hz (peak + playhead reports).
pub const TELEMETRY_HZ: f32 = 10.0;
