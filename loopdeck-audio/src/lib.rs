//! Loopdeck audio engine - real-time looping core.
//!
//! A fixed grid of sample pads rendered by a voice mixer that runs inside
//! the platform audio callback. The control plane talks to it exclusively
//! through two lock-free SPSC message rings; decoded buffers cross the
//! boundary as reference-counted handles, never as copies.

pub mod bank;
pub mod channel;
pub mod constants;
pub mod engine;
pub mod isolator;
pub mod messages;
pub mod stretch;
pub mod telemetry;
pub mod tempo;
pub mod voice;

pub use bank::{LoopRegion, SampleData, SharedSample};
pub use constants::{MAX_VOICES, NUM_PADS, QUEUE_CAPACITY, SPEED_MAX, SPEED_MIN};
pub use engine::{engine_pair, open_output, ControlError, EngineHandle, EngineState, OutputStream, StreamError};
pub use messages::{AudioMessage, ControlMessage};
pub use telemetry::PadMeters;
pub use tempo::{anchored_master_bpm, TempoState};
