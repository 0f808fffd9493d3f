//! Analysis interface for Loopdeck.
//!
//! BPM, key and beat-grid detection is an external collaborator: the loader
//! hands it decoded mono samples and gets back an [`Analysis`]. The call is
//! blocking and only ever made off the render thread. This crate defines
//! the seam; detection backends implement [`Analyzer`].

use thiserror::Error;

/// Result of analyzing a decoded sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    /// Detected tempo, if the material carried one.
    pub bpm: Option<f32>,
    /// Detected musical key, e.g. Camelot notation ("8A", "12B").
    pub key: Option<String>,
    /// Beat onset times in seconds from the start of the buffer.
    pub beats: Vec<f64>,
    /// Bar-start (downbeat) times in seconds, a subset of `beats`.
    pub downbeats: Vec<f64>,
}

impl Analysis {
    /// Grid anchor in seconds: the first downbeat, else the first beat,
    /// else zero.
    pub fn anchor_secs(&self) -> f64 {
        self.downbeats
            .first()
            .or_else(|| self.beats.first())
            .copied()
            .unwrap_or(0.0)
    }
}

/// Errors an analysis backend can report.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("not enough audio to analyze ({frames} frames)")]
    TooShort { frames: usize },
    #[error("analysis backend failure: {0}")]
    Backend(String),
}

/// A blocking analysis backend.
///
/// Implementations receive mono samples at the given rate and either return
/// a full [`Analysis`] or an error; partial results go into the `Option`
/// fields rather than the error path.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, mono: &[f32], sample_rate: u32) -> Result<Analysis, AnalysisError>;
}
