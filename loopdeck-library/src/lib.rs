//! Loopdeck sample library - loading, caching and the session façade.
//!
//! Everything in this crate runs on the control plane: the asynchronous
//! loader pipeline, the decoded-sample disk cache, loop-grid math, project
//! snapshots, and [`Session`], the façade a control surface talks to.

pub mod cache;
pub mod grid;
pub mod loader;
pub mod project;
pub mod session;

pub use cache::{CacheError, CachedPcm, SampleCache};
pub use grid::{auto_loop_region, snap_region, snap_to_grid, LoopSettings};
pub use loader::{LoadError, LoadEvent, LoadStage, SampleLoader};
pub use project::{PadSnapshot, ProjectSnapshot};
pub use session::Session;
