//! Decoded-sample disk cache.
//!
//! Loading is dominated by decode and resample, so the loader keeps the
//! finished PCM on disk: raw little-endian f32 blobs next to a SQLite index
//! keyed on (path, size, mtime, target rate). A hit skips straight to
//! analysis; a stale or unreadable entry is treated as a miss. The cache is
//! a loader detail - it never holds project state.

use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cached decoded audio, already at the target rate.
#[derive(Debug, Clone)]
pub struct CachedPcm {
    pub samples: Vec<f32>,
    pub channels: u16,
    /// Blob location relative to the cache root.
    pub blob: PathBuf,
}

/// PCM cache backed by SQLite plus raw blob files.
pub struct SampleCache {
    conn: Connection,
    blob_dir: PathBuf,
}

impl SampleCache {
    /// SQL schema for the samples table.
    const SCHEMA: &'static str = r#"
        CREATE TABLE IF NOT EXISTS samples (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            modified_time INTEGER NOT NULL,
            target_rate INTEGER NOT NULL,
            channels INTEGER NOT NULL,
            frames INTEGER NOT NULL,
            blob TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(path, target_rate)
        );
        CREATE INDEX IF NOT EXISTS idx_samples_path ON samples(path);
    "#;

    /// Open or create a cache rooted at the given directory.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        let blob_dir = dir.join("blobs");
        std::fs::create_dir_all(&blob_dir)?;

        let conn = Connection::open(dir.join("index.db"))?;
        conn.execute_batch(Self::SCHEMA)?;
        Ok(Self { conn, blob_dir })
    }

    /// Default cache location under the user cache directory.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("loopdeck")
    }

    /// Fetch cached PCM if the source file hasn't changed. Stale index rows
    /// and missing or truncated blobs count as misses.
    pub fn get(
        &self,
        path: &Path,
        file_size: u64,
        modified_time: u64,
        target_rate: u32,
    ) -> Option<CachedPcm> {
        let row = self
            .conn
            .query_row(
                "SELECT channels, frames, blob FROM samples
                 WHERE path = ?1 AND file_size = ?2 AND modified_time = ?3
                   AND target_rate = ?4",
                params![
                    path.to_string_lossy().to_string(),
                    file_size,
                    modified_time,
                    target_rate
                ],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .ok()?;

        let (channels, frames, blob) = row;
        let bytes = std::fs::read(self.blob_dir.join(&blob)).ok()?;
        if bytes.len() as u64 != frames * channels as u64 * 4 {
            return None;
        }

        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        debug!(path = %path.display(), frames, "sample cache hit");
        Some(CachedPcm {
            samples,
            channels,
            blob: PathBuf::from("blobs").join(blob),
        })
    }

    /// Store decoded PCM, replacing any entry for the same path and rate.
    /// Returns the blob path relative to the cache root.
    pub fn put(
        &self,
        path: &Path,
        file_size: u64,
        modified_time: u64,
        target_rate: u32,
        channels: u16,
        samples: &[f32],
    ) -> Result<PathBuf, CacheError> {
        let name = format!(
            "{:016x}.pcm",
            fnv1a(format!("{}:{}", path.display(), target_rate).as_bytes())
        );

        let mut bytes = Vec::with_capacity(samples.len() * 4);
        for &s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        std::fs::write(self.blob_dir.join(&name), bytes)?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let frames = samples.len() as u64 / channels as u64;

        self.conn.execute(
            r#"INSERT OR REPLACE INTO samples
               (path, file_size, modified_time, target_rate, channels, frames, blob, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                path.to_string_lossy().to_string(),
                file_size,
                modified_time,
                target_rate,
                channels,
                frames,
                name,
                now,
            ],
        )?;

        Ok(PathBuf::from("blobs").join(name))
    }

    /// Number of cached entries.
    pub fn count(&self) -> Result<usize, CacheError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Drop all entries and their blobs.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.conn.execute("DELETE FROM samples", [])?;
        for entry in std::fs::read_dir(&self.blob_dir)?.flatten() {
            let _ = std::fs::remove_file(entry.path());
        }
        Ok(())
    }
}

/// Deterministic 64-bit FNV-1a for blob names (std's hasher is seeded per
/// process, which would orphan blobs across runs).
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn temp_cache() -> (SampleCache, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "loopdeck-cache-test-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        (SampleCache::open(&dir).unwrap(), dir)
    }

    #[test]
    fn test_store_and_get_round_trip() {
        let (cache, dir) = temp_cache();
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 / 500.0) - 1.0).collect();

        cache
            .put(Path::new("/music/loop.wav"), 4096, 1_700_000_000, 48_000, 2, &samples)
            .unwrap();

        let hit = cache
            .get(Path::new("/music/loop.wav"), 4096, 1_700_000_000, 48_000)
            .unwrap();
        assert_eq!(hit.channels, 2);
        assert_eq!(hit.samples, samples);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_changed_file_misses() {
        let (cache, dir) = temp_cache();
        cache
            .put(Path::new("/music/loop.wav"), 4096, 1_700_000_000, 48_000, 1, &[0.5; 64])
            .unwrap();

        assert!(cache
            .get(Path::new("/music/loop.wav"), 9999, 1_700_000_000, 48_000)
            .is_none());
        assert!(cache
            .get(Path::new("/music/loop.wav"), 4096, 1_800_000_000, 48_000)
            .is_none());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_rate_is_part_of_the_key() {
        let (cache, dir) = temp_cache();
        cache
            .put(Path::new("/music/loop.wav"), 4096, 1_700_000_000, 48_000, 1, &[0.5; 64])
            .unwrap();

        assert!(cache
            .get(Path::new("/music/loop.wav"), 4096, 1_700_000_000, 44_100)
            .is_none());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_truncated_blob_is_a_miss() {
        let (cache, dir) = temp_cache();
        let blob = cache
            .put(Path::new("/music/loop.wav"), 4096, 1_700_000_000, 48_000, 1, &[0.5; 64])
            .unwrap();

        std::fs::write(dir.join(&blob), [0u8; 8]).unwrap();
        assert!(cache
            .get(Path::new("/music/loop.wav"), 4096, 1_700_000_000, 48_000)
            .is_none());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_replace_updates_in_place() {
        let (cache, dir) = temp_cache();
        let path = Path::new("/music/loop.wav");

        cache.put(path, 4096, 1, 48_000, 1, &[0.1; 32]).unwrap();
        cache.put(path, 4096, 2, 48_000, 1, &[0.2; 32]).unwrap();
        assert_eq!(cache.count().unwrap(), 1);

        let hit = cache.get(path, 4096, 2, 48_000).unwrap();
        assert_eq!(hit.samples[0], 0.2);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_clear() {
        let (cache, dir) = temp_cache();
        cache
            .put(Path::new("/a.wav"), 1, 1, 48_000, 1, &[0.0; 16])
            .unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.count().unwrap(), 0);

        let _ = std::fs::remove_dir_all(dir);
    }
}
