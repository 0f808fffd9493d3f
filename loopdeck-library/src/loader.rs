//! Asynchronous sample loading pipeline.
//!
//! Each load runs on its own worker thread: decode (Symphonia) → resample
//! to the engine's output rate (rubato) → channel-layout check (mono and
//! stereo only) → blocking analysis call → wrap as a shared buffer. The
//! worker reports through a polled event channel; the buffer itself is
//! published separately by the session, which makes publication the final
//! pipeline step - two racing loads to one slot resolve last-writer-wins.
//!
//! Progress is a weighted composite over the decode, resample and analysis
//! stages and only ever moves forward. Any stage failure ends that load
//! with an `Error` event and leaves every slot untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, info, warn};

use loopdeck_analysis::{Analysis, AnalysisError, Analyzer};
use loopdeck_audio::{SampleData, SharedSample};

use crate::cache::SampleCache;

/// Progress weight of the decode stage.
const DECODE_WEIGHT: f32 = 0.5;
/// Progress weight of the resample stage.
const RESAMPLE_WEIGHT: f32 = 0.3;

/// Errors that can end a load attempt.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no audio track found in file")]
    NoAudioTrack,
    #[error("unsupported channel layout ({0} channels; mono or stereo only)")]
    UnsupportedLayout(u16),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("resample error: {0}")]
    Resample(String),
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),
}

/// Pipeline stage attached to progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Cache,
    Decode,
    Resample,
    Analyze,
}

/// Events reported by load workers, polled by the control plane.
#[derive(Debug, Clone)]
pub enum LoadEvent {
    Started {
        id: usize,
    },
    Progress {
        id: usize,
        percent: f32,
        stage: LoadStage,
    },
    /// The pipeline finished; the session publishes `sample` to the engine.
    Success {
        id: usize,
        sample: SharedSample,
        duration_secs: f64,
        analysis: Analysis,
        /// Decoded-sample cache blob, relative to the cache root, for the
        /// persistence collaborator.
        cache_path: Option<PathBuf>,
    },
    Error {
        id: usize,
        message: String,
    },
}

/// Spawns and tracks sample load workers.
pub struct SampleLoader {
    target_rate: u32,
    analyzer: Arc<dyn Analyzer>,
    cache: Option<Arc<Mutex<SampleCache>>>,
    event_tx: Sender<LoadEvent>,
    event_rx: Receiver<LoadEvent>,
}

impl SampleLoader {
    /// Loader producing buffers at `target_rate`, analyzing with the given
    /// collaborator.
    pub fn new(target_rate: u32, analyzer: Arc<dyn Analyzer>) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            target_rate,
            analyzer,
            cache: None,
            event_tx,
            event_rx,
        }
    }

    /// Attach a decoded-sample cache.
    pub fn with_cache(mut self, cache: SampleCache) -> Self {
        self.cache = Some(Arc::new(Mutex::new(cache)));
        self
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Start loading a file for a pad on a worker thread. In-flight loads
    /// are never cancelled; racing loads to one pad resolve by completion
    /// order.
    pub fn load(&self, id: usize, path: PathBuf) -> JoinHandle<()> {
        let tx = self.event_tx.clone();
        let analyzer = Arc::clone(&self.analyzer);
        let cache = self.cache.clone();
        let target_rate = self.target_rate;

        thread::spawn(move || {
            let _ = tx.send(LoadEvent::Started { id });
            match run_pipeline(id, &path, target_rate, analyzer.as_ref(), cache.as_deref(), &tx) {
                Ok((sample, analysis, cache_path)) => {
                    info!(id, path = %path.display(), frames = sample.frames(), "sample loaded");
                    let duration_secs = sample.duration_secs();
                    let _ = tx.send(LoadEvent::Success {
                        id,
                        sample,
                        duration_secs,
                        analysis,
                        cache_path,
                    });
                }
                Err(err) => {
                    warn!(id, path = %path.display(), "load failed: {err}");
                    let _ = tx.send(LoadEvent::Error {
                        id,
                        message: err.to_string(),
                    });
                }
            }
        })
    }

    /// Pop the next pending load event, if any. Never blocks.
    pub fn poll(&self) -> Option<LoadEvent> {
        self.event_rx.try_recv().ok()
    }
}

/// Monotonic progress reporter; quantized so queues don't flood.
struct ProgressReporter<'a> {
    tx: &'a Sender<LoadEvent>,
    id: usize,
    last: f32,
}

impl<'a> ProgressReporter<'a> {
    fn new(tx: &'a Sender<LoadEvent>, id: usize) -> Self {
        Self { tx, id, last: 0.0 }
    }

    fn report(&mut self, stage: LoadStage, percent: f32) {
        let percent = percent.clamp(0.0, 1.0);
        if percent > self.last + 0.009 {
            self.last = percent;
            let _ = self.tx.send(LoadEvent::Progress {
                id: self.id,
                percent,
                stage,
            });
        }
    }
}

fn run_pipeline(
    id: usize,
    path: &Path,
    target_rate: u32,
    analyzer: &dyn Analyzer,
    cache: Option<&Mutex<SampleCache>>,
    tx: &Sender<LoadEvent>,
) -> Result<(SharedSample, Analysis, Option<PathBuf>), LoadError> {
    let mut progress = ProgressReporter::new(tx, id);

    let meta = std::fs::metadata(path)?;
    let file_size = meta.len();
    let modified_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let cached =
        cache.and_then(|c| c.lock().get(path, file_size, modified_time, target_rate));

    let (samples, channels, cache_path) = match cached {
        Some(pcm) => {
            debug!(id, path = %path.display(), "decoded-sample cache hit");
            progress.report(LoadStage::Cache, DECODE_WEIGHT + RESAMPLE_WEIGHT);
            (pcm.samples, pcm.channels, Some(pcm.blob))
        }
        None => {
            let decoded = decode_file(path, &mut progress)?;

            let samples = if decoded.sample_rate != target_rate {
                resample(
                    &decoded.samples,
                    decoded.sample_rate,
                    target_rate,
                    decoded.channels,
                    &mut progress,
                )?
            } else {
                progress.report(LoadStage::Resample, DECODE_WEIGHT + RESAMPLE_WEIGHT);
                decoded.samples
            };

            let cache_path = match cache {
                Some(c) => match c.lock().put(
                    path,
                    file_size,
                    modified_time,
                    target_rate,
                    decoded.channels,
                    &samples,
                ) {
                    Ok(blob) => Some(blob),
                    Err(err) => {
                        warn!(id, "sample cache write failed: {err}");
                        None
                    }
                },
                None => None,
            };

            (samples, decoded.channels, cache_path)
        }
    };

    progress.report(LoadStage::Analyze, DECODE_WEIGHT + RESAMPLE_WEIGHT + 0.01);

    // Blocking analysis collaborator call, always off the render thread
    let analysis = if channels == 1 {
        analyzer.analyze(&samples, target_rate)?
    } else {
        let mono: Vec<f32> = samples
            .chunks_exact(2)
            .map(|f| 0.5 * (f[0] + f[1]))
            .collect();
        analyzer.analyze(&mono, target_rate)?
    };

    let sample = Arc::new(SampleData::new(samples, channels, target_rate));
    Ok((sample, analysis, cache_path))
}

struct DecodedFile {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

/// Decode a whole file to interleaved f32 using Symphonia.
fn decode_file(path: &Path, progress: &mut ProgressReporter<'_>) -> Result<DecodedFile, LoadError> {
    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| LoadError::Decode(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(LoadError::NoAudioTrack)?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params.sample_rate.unwrap_or(44100);
    let channels = codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(2);
    if channels == 0 || channels > 2 {
        return Err(LoadError::UnsupportedLayout(channels));
    }
    let total_frames = codec_params.n_frames;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| LoadError::Decode(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(_) => break,
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(_) => continue,
        };

        let spec = *decoded.spec();
        let duration = decoded.capacity() as u64;

        let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());

        if let Some(total) = total_frames {
            let done = (samples.len() / channels as usize) as u64;
            progress.report(
                LoadStage::Decode,
                DECODE_WEIGHT * done as f32 / total as f32,
            );
        }
    }

    if samples.is_empty() {
        return Err(LoadError::Decode("no audio frames decoded".into()));
    }

    progress.report(LoadStage::Decode, DECODE_WEIGHT);

    Ok(DecodedFile {
        samples,
        channels,
        sample_rate,
    })
}

/// Resample interleaved audio to the target rate with rubato.
fn resample(
    samples: &[f32],
    source_rate: u32,
    target_rate: u32,
    channels: u16,
    progress: &mut ProgressReporter<'_>,
) -> Result<Vec<f32>, LoadError> {
    use rubato::{FftFixedInOut, Resampler};

    let channels_usize = channels as usize;
    let frames = samples.len() / channels_usize;

    let mut resampler = FftFixedInOut::<f32>::new(
        source_rate as usize,
        target_rate as usize,
        1024,
        channels_usize,
    )
    .map_err(|e| LoadError::Resample(e.to_string()))?;

    // Deinterleave
    let deinterleaved: Vec<Vec<f32>> = (0..channels_usize)
        .map(|ch| {
            (0..frames)
                .map(|f| samples[f * channels_usize + ch])
                .collect()
        })
        .collect();

    let chunk_size = resampler.input_frames_next();
    let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels_usize];

    let mut pos = 0;
    while pos + chunk_size <= frames {
        let input_refs: Vec<&[f32]> = deinterleaved
            .iter()
            .map(|ch| &ch[pos..pos + chunk_size])
            .collect();

        let resampled = resampler
            .process(&input_refs, None)
            .map_err(|e| LoadError::Resample(e.to_string()))?;

        for (ch, data) in resampled.into_iter().enumerate() {
            output[ch].extend(data);
        }

        pos += chunk_size;
        progress.report(
            LoadStage::Resample,
            DECODE_WEIGHT + RESAMPLE_WEIGHT * pos as f32 / frames as f32,
        );
    }

    // Remaining partial chunk, zero-padded; keep only the proportional tail
    if pos < frames {
        let remaining = frames - pos;
        let padded: Vec<Vec<f32>> = deinterleaved
            .iter()
            .map(|ch| {
                let mut v = ch[pos..].to_vec();
                v.resize(chunk_size, 0.0);
                v
            })
            .collect();

        let input_refs: Vec<&[f32]> = padded.iter().map(|v| v.as_slice()).collect();

        if let Ok(resampled) = resampler.process(&input_refs, None) {
            for (ch, data) in resampled.into_iter().enumerate() {
                let tail_frames =
                    (remaining * target_rate as usize) / source_rate as usize;
                output[ch].extend(&data[..tail_frames.min(data.len())]);
            }
        }
    }

    progress.report(LoadStage::Resample, DECODE_WEIGHT + RESAMPLE_WEIGHT);

    // Reinterleave
    let output_frames = output[0].len();
    let mut interleaved = Vec::with_capacity(output_frames * channels_usize);
    for frame_idx in 0..output_frames {
        for channel in &output {
            interleaved.push(channel[frame_idx]);
        }
    }

    Ok(interleaved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAnalyzer;

    impl Analyzer for StubAnalyzer {
        fn analyze(&self, _mono: &[f32], _rate: u32) -> Result<Analysis, AnalysisError> {
            Ok(Analysis {
                bpm: Some(120.0),
                key: Some("8A".into()),
                beats: vec![0.0, 0.5, 1.0, 1.5],
                downbeats: vec![0.0],
            })
        }
    }

    struct FailingAnalyzer;

    impl Analyzer for FailingAnalyzer {
        fn analyze(&self, _mono: &[f32], _rate: u32) -> Result<Analysis, AnalysisError> {
            Err(AnalysisError::Backend("no beat found".into()))
        }
    }

    static FILE_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "loopdeck-loader-test-{}-{}-{}",
            std::process::id(),
            FILE_SEQ.fetch_add(1, Ordering::Relaxed),
            name
        ))
    }

    /// Minimal 16-bit PCM WAV writer for fixtures.
    fn write_wav(path: &Path, samples: &[f32], sample_rate: u32, channels: u16) {
        let data_len = (samples.len() * 2) as u32;
        let byte_rate = sample_rate * channels as u32 * 2;
        let block_align = channels * 2;

        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&byte_rate.to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for &s in samples {
            bytes.extend_from_slice(&((s * 32767.0) as i16).to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn sine(frames: usize, freq: f32, rate: f32) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin() * 0.5)
            .collect()
    }

    fn collect_events(loader: &SampleLoader, worker: JoinHandle<()>) -> Vec<LoadEvent> {
        worker.join().unwrap();
        let mut events = Vec::new();
        while let Some(ev) = loader.poll() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn test_mono_44k_file_resamples_to_48k() {
        let path = temp_path("mono44k.wav");
        write_wav(&path, &sine(88_200, 440.0, 44_100.0), 44_100, 1);

        let loader = SampleLoader::new(48_000, Arc::new(StubAnalyzer));
        let events = collect_events(&loader, loader.load(0, path.clone()));

        assert!(matches!(events.first(), Some(LoadEvent::Started { id: 0 })));

        let success = events.iter().find_map(|e| match e {
            LoadEvent::Success {
                sample,
                duration_secs,
                analysis,
                ..
            } => Some((sample.clone(), *duration_secs, analysis.clone())),
            _ => None,
        });
        let (sample, duration_secs, analysis) = success.expect("load should succeed");

        // 2 s at 44.1 kHz lands near 2 s at 48 kHz (chunked tail may trim)
        assert_eq!(sample.sample_rate(), 48_000);
        assert_eq!(sample.channels(), 1);
        assert!((sample.frames() as i64 - 96_000).unsigned_abs() < 2048);
        assert!((duration_secs - 2.0).abs() < 0.05);
        assert_eq!(analysis.bpm, Some(120.0));
        assert_eq!(analysis.key.as_deref(), Some("8A"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let path = temp_path("progress.wav");
        write_wav(&path, &sine(88_200, 220.0, 44_100.0), 44_100, 1);

        let loader = SampleLoader::new(48_000, Arc::new(StubAnalyzer));
        let events = collect_events(&loader, loader.load(3, path.clone()));

        let mut last = 0.0f32;
        let mut seen = 0;
        for event in &events {
            if let LoadEvent::Progress { id, percent, .. } = event {
                assert_eq!(*id, 3);
                assert!(*percent >= last, "progress went backwards: {events:?}");
                assert!(*percent <= 1.0);
                last = *percent;
                seen += 1;
            }
        }
        assert!(seen > 0);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_reports_error() {
        let loader = SampleLoader::new(48_000, Arc::new(StubAnalyzer));
        let events = collect_events(
            &loader,
            loader.load(1, PathBuf::from("/nonexistent/nothing.wav")),
        );

        assert!(events
            .iter()
            .any(|e| matches!(e, LoadEvent::Error { id: 1, .. })));
        assert!(!events.iter().any(|e| matches!(e, LoadEvent::Success { .. })));
    }

    #[test]
    fn test_analysis_failure_fails_the_load() {
        let path = temp_path("analysis-fail.wav");
        write_wav(&path, &sine(44_100, 440.0, 44_100.0), 44_100, 1);

        let loader = SampleLoader::new(48_000, Arc::new(FailingAnalyzer));
        let events = collect_events(&loader, loader.load(2, path.clone()));

        let message = events.iter().find_map(|e| match e {
            LoadEvent::Error { id: 2, message } => Some(message.clone()),
            _ => None,
        });
        assert!(message.is_some_and(|m| m.contains("no beat found")));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_stereo_stays_stereo() {
        let path = temp_path("stereo.wav");
        let mono = sine(48_000, 440.0, 48_000.0);
        let stereo: Vec<f32> = mono.iter().flat_map(|&s| [s, -s]).collect();
        write_wav(&path, &stereo, 48_000, 2);

        let loader = SampleLoader::new(48_000, Arc::new(StubAnalyzer));
        let events = collect_events(&loader, loader.load(0, path.clone()));

        let sample = events
            .iter()
            .find_map(|e| match e {
                LoadEvent::Success { sample, .. } => Some(sample.clone()),
                _ => None,
            })
            .expect("load should succeed");
        assert_eq!(sample.channels(), 2);
        assert_eq!(sample.frames(), 48_000);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_second_load_hits_the_cache() {
        let path = temp_path("cached.wav");
        write_wav(&path, &sine(44_100, 330.0, 44_100.0), 44_100, 1);

        let cache_dir = temp_path("cache-dir");
        let cache = SampleCache::open(&cache_dir).unwrap();
        let loader = SampleLoader::new(48_000, Arc::new(StubAnalyzer)).with_cache(cache);

        let first = collect_events(&loader, loader.load(0, path.clone()));
        assert!(first.iter().any(|e| matches!(e, LoadEvent::Success { .. })));

        let second = collect_events(&loader, loader.load(0, path.clone()));
        // A hit skips decode and resample: progress starts at their summed weight
        let first_progress = second.iter().find_map(|e| match e {
            LoadEvent::Progress { percent, stage, .. } => Some((*percent, *stage)),
            _ => None,
        });
        assert!(matches!(
            first_progress,
            Some((p, LoadStage::Cache)) if p >= DECODE_WEIGHT + RESAMPLE_WEIGHT - 0.01
        ));
        assert!(second.iter().any(|e| matches!(e, LoadEvent::Success { .. })));

        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_dir_all(cache_dir);
    }
}
