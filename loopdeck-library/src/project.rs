//! Project-state values handed to the persistence collaborator.
//!
//! The core never writes project files itself; it produces these plain
//! snapshots and can read them back. The format is the simple key=value
//! text used for local configuration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use loopdeck_audio::NUM_PADS;

/// Everything worth persisting about one pad.
#[derive(Debug, Clone, PartialEq)]
pub struct PadSnapshot {
    /// Decoded-sample cache blob, relative to the cache root.
    pub cache_path: Option<PathBuf>,
    /// Loop bounds in frames at the output rate.
    pub loop_start: Option<u64>,
    pub loop_end: Option<u64>,
    pub auto_loop: bool,
    pub bar_count: u32,
    pub loop_offset: i64,
    pub gain: f32,
    pub eq_db: [f32; 3],
    pub detected_bpm: Option<f32>,
    pub manual_bpm: Option<f32>,
    pub key: Option<String>,
}

impl Default for PadSnapshot {
    fn default() -> Self {
        Self {
            cache_path: None,
            loop_start: None,
            loop_end: None,
            auto_loop: true,
            bar_count: 4,
            loop_offset: 0,
            gain: 1.0,
            eq_db: [0.0; 3],
            detected_bpm: None,
            manual_bpm: None,
            key: None,
        }
    }
}

impl PadSnapshot {
    /// Pads without a cached sample carry nothing worth writing.
    fn is_empty(&self) -> bool {
        self.cache_path.is_none()
    }
}

/// Whole-project state: per-pad snapshots plus the global tempo surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSnapshot {
    pub pads: Vec<PadSnapshot>,
    pub speed: f32,
    pub key_lock: bool,
    pub bpm_lock: bool,
    pub master_bpm: Option<f32>,
}

impl Default for ProjectSnapshot {
    fn default() -> Self {
        Self {
            pads: vec![PadSnapshot::default(); NUM_PADS],
            speed: 1.0,
            key_lock: false,
            bpm_lock: false,
            master_bpm: None,
        }
    }
}

impl ProjectSnapshot {
    /// Load a snapshot from a file, defaulting on absence or parse trouble.
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Write the snapshot to a file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    /// Parse from simple key=value lines.
    fn parse(content: &str) -> Self {
        let mut snapshot = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            if let Some(rest) = key.strip_prefix("pad.") {
                let Some((index, field)) = rest.split_once('.') else {
                    continue;
                };
                let Ok(index) = index.parse::<usize>() else {
                    continue;
                };
                if index >= snapshot.pads.len() {
                    continue;
                }
                Self::parse_pad_field(&mut snapshot.pads[index], field, value);
            } else {
                match key {
                    "speed" => {
                        if let Ok(v) = value.parse() {
                            snapshot.speed = v;
                        }
                    }
                    "key_lock" => snapshot.key_lock = value == "true",
                    "bpm_lock" => snapshot.bpm_lock = value == "true",
                    "master_bpm" => snapshot.master_bpm = value.parse().ok(),
                    _ => {} // Ignore unknown keys
                }
            }
        }

        snapshot
    }

    fn parse_pad_field(pad: &mut PadSnapshot, field: &str, value: &str) {
        match field {
            "cache_path" => {
                if !value.is_empty() {
                    pad.cache_path = Some(PathBuf::from(value));
                }
            }
            "loop" => {
                if let Some((start, end)) = value.split_once("..") {
                    pad.loop_start = start.parse().ok();
                    pad.loop_end = end.parse().ok();
                }
            }
            "auto_loop" => pad.auto_loop = value == "true",
            "bars" => {
                if let Ok(v) = value.parse() {
                    pad.bar_count = v;
                }
            }
            "loop_offset" => {
                if let Ok(v) = value.parse() {
                    pad.loop_offset = v;
                }
            }
            "gain" => {
                if let Ok(v) = value.parse() {
                    pad.gain = v;
                }
            }
            "eq" => {
                let parts: Vec<f32> = value
                    .split(',')
                    .filter_map(|p| p.trim().parse().ok())
                    .collect();
                if parts.len() == 3 {
                    pad.eq_db = [parts[0], parts[1], parts[2]];
                }
            }
            "bpm_detected" => pad.detected_bpm = value.parse().ok(),
            "bpm_manual" => pad.manual_bpm = value.parse().ok(),
            "key" => {
                if !value.is_empty() {
                    pad.key = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    /// Serialize to simple key=value lines; empty pads are omitted.
    fn serialize(&self) -> String {
        let mut lines = vec!["# Loopdeck project state".to_string()];

        lines.push(format!("speed={}", self.speed));
        lines.push(format!("key_lock={}", self.key_lock));
        lines.push(format!("bpm_lock={}", self.bpm_lock));
        if let Some(bpm) = self.master_bpm {
            lines.push(format!("master_bpm={}", bpm));
        }

        for (index, pad) in self.pads.iter().enumerate() {
            if pad.is_empty() {
                continue;
            }
            if let Some(ref path) = pad.cache_path {
                lines.push(format!("pad.{}.cache_path={}", index, path.display()));
            }
            if let (Some(start), Some(end)) = (pad.loop_start, pad.loop_end) {
                lines.push(format!("pad.{}.loop={}..{}", index, start, end));
            }
            lines.push(format!("pad.{}.auto_loop={}", index, pad.auto_loop));
            lines.push(format!("pad.{}.bars={}", index, pad.bar_count));
            lines.push(format!("pad.{}.loop_offset={}", index, pad.loop_offset));
            lines.push(format!("pad.{}.gain={}", index, pad.gain));
            lines.push(format!(
                "pad.{}.eq={},{},{}",
                index, pad.eq_db[0], pad.eq_db[1], pad.eq_db[2]
            ));
            if let Some(bpm) = pad.detected_bpm {
                lines.push(format!("pad.{}.bpm_detected={}", index, bpm));
            }
            if let Some(bpm) = pad.manual_bpm {
                lines.push(format!("pad.{}.bpm_manual={}", index, bpm));
            }
            if let Some(ref key) = pad.key {
                lines.push(format!("pad.{}.key={}", index, key));
            }
        }

        lines.join("\n")
    }
}
