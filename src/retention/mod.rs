//! Retention Store (spec.md §4.B) — durable append-only persistence of
//! snapshots, with size-conscious compression and bounded storage.
//!
//! Segment files are line-delimited JSON keyed by UTC date, optionally
//! gzip-compressed via `flate2`, following the pack's established use
//! of `flate2` for this kind of at-rest compression.

use crate::config::RetentionConfig;
use crate::model::MetricSnapshot;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("io error on segment {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct RetentionStore {
    config: RetentionConfig,
    /// Serializes append/compress/evict mutations; queries take a
    /// read lock on the same underlying directory state implicitly by
    /// relying on write-atomicity of a single `write_all` per line, so
    /// they don't need to hold this mutex (spec.md §4.B concurrency
    /// discipline).
    write_lock: Mutex<()>,
}

impl RetentionStore {
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            config,
            write_lock: Mutex::new(()),
        }
    }

    fn storage_dir(&self) -> &Path {
        Path::new(&self.config.storage_dir)
    }

    fn ensure_dir(&self) -> Result<(), RetentionError> {
        fs::create_dir_all(self.storage_dir()).map_err(|source| RetentionError::Io {
            path: self.config.storage_dir.clone(),
            source,
        })
    }

    fn plain_path(&self, date: &str) -> PathBuf {
        self.storage_dir().join(format!("metrics-{date}.jsonl"))
    }

    fn gz_path(&self, date: &str) -> PathBuf {
        self.storage_dir().join(format!("metrics-{date}.jsonl.gz"))
    }

    /// Appends one JSON line to the segment keyed by the snapshot's
    /// UTC date, creating the segment (and directory) if absent.
    pub fn append(&self, snapshot: &MetricSnapshot) -> Result<(), RetentionError> {
        let _guard = self.write_lock.lock();
        self.ensure_dir()?;

        let date = snapshot.utc_date();
        let path = self.plain_path(&date);
        let mut line = serde_json::to_string(snapshot)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| RetentionError::Io {
                path: path.display().to_string(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| RetentionError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    /// Returns snapshots whose UTC date falls within `[from, to]`
    /// (inclusive, `YYYY-MM-DD`), ascending by date, file order within
    /// a date. Transparently decompresses `.gz` segments.
    pub fn query(&self, from: &str, to: &str) -> Result<Vec<MetricSnapshot>, RetentionError> {
        let mut dates = self.list_segment_dates()?;
        dates.retain(|d| d.as_str() >= from && d.as_str() <= to);
        dates.sort();

        let mut out = Vec::new();
        for date in dates {
            out.extend(self.read_segment(&date)?);
        }
        Ok(out)
    }

    fn list_segment_dates(&self) -> Result<Vec<String>, RetentionError> {
        if !self.storage_dir().exists() {
            return Ok(Vec::new());
        }
        let mut dates = Vec::new();
        for entry in fs::read_dir(self.storage_dir()).map_err(|source| RetentionError::Io {
            path: self.config.storage_dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| RetentionError::Io {
                path: self.config.storage_dir.clone(),
                source,
            })?;
            if let Some(date) = parse_segment_date(&entry.file_name().to_string_lossy()) {
                if !dates.contains(&date) {
                    dates.push(date);
                }
            }
        }
        Ok(dates)
    }

    fn read_segment(&self, date: &str) -> Result<Vec<MetricSnapshot>, RetentionError> {
        let gz = self.gz_path(date);
        let plain = self.plain_path(date);

        let reader: Box<dyn BufRead> = if gz.exists() {
            let file = File::open(&gz).map_err(|source| RetentionError::Io {
                path: gz.display().to_string(),
                source,
            })?;
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else if plain.exists() {
            let file = File::open(&plain).map_err(|source| RetentionError::Io {
                path: plain.display().to_string(),
                source,
            })?;
            Box::new(BufReader::new(file))
        } else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|source| RetentionError::Io {
                path: date.to_string(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }

    /// Gzip-compresses every segment older than `compress_after_days`
    /// that isn't compressed yet, then atomically unlinks the plain
    /// source. Idempotent: already-compressed segments are skipped.
    pub fn compress_aged(&self) -> Result<usize, RetentionError> {
        let _guard = self.write_lock.lock();
        let horizon = self.compress_horizon_date();
        let mut compressed = 0;

        for date in self.list_segment_dates()? {
            if date >= horizon {
                continue;
            }
            let gz = self.gz_path(&date);
            let plain = self.plain_path(&date);
            if gz.exists() || !plain.exists() {
                continue;
            }

            let mut input = File::open(&plain).map_err(|source| RetentionError::Io {
                path: plain.display().to_string(),
                source,
            })?;
            let mut buf = Vec::new();
            input
                .read_to_end(&mut buf)
                .map_err(|source| RetentionError::Io {
                    path: plain.display().to_string(),
                    source,
                })?;

            let tmp = self.storage_dir().join(format!("metrics-{date}.jsonl.gz.tmp"));
            {
                let out = File::create(&tmp).map_err(|source| RetentionError::Io {
                    path: tmp.display().to_string(),
                    source,
                })?;
                let mut encoder = GzEncoder::new(out, Compression::default());
                encoder
                    .write_all(&buf)
                    .map_err(|source| RetentionError::Io {
                        path: tmp.display().to_string(),
                        source,
                    })?;
                encoder.finish().map_err(|source| RetentionError::Io {
                    path: tmp.display().to_string(),
                    source,
                })?;
            }
            fs::rename(&tmp, &gz).map_err(|source| RetentionError::Io {
                path: gz.display().to_string(),
                source,
            })?;
            fs::remove_file(&plain).map_err(|source| RetentionError::Io {
                path: plain.display().to_string(),
                source,
            })?;
            compressed += 1;
        }
        Ok(compressed)
    }

    /// Deletes segments (compressed or not) older than `retention_days`.
    pub fn evict_aged(&self) -> Result<usize, RetentionError> {
        let _guard = self.write_lock.lock();
        let horizon = self.retention_horizon_date();
        let mut evicted = 0;
        for date in self.list_segment_dates()? {
            if date >= horizon {
                continue;
            }
            for path in [self.plain_path(&date), self.gz_path(&date)] {
                if path.exists() {
                    fs::remove_file(&path).map_err(|source| RetentionError::Io {
                        path: path.display().to_string(),
                        source,
                    })?;
                }
            }
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Deletes segments in ascending age order until total bytes are
    /// under `max_bytes` (a cap of 0 means unlimited, a no-op).
    pub fn enforce_size_cap(&self) -> Result<usize, RetentionError> {
        if self.config.max_bytes == 0 {
            return Ok(0);
        }
        let _guard = self.write_lock.lock();
        let mut dates = self.list_segment_dates()?;
        dates.sort();

        let mut total = self.total_bytes_locked()?;
        let mut removed = 0;
        for date in dates {
            if total <= self.config.max_bytes {
                break;
            }
            for path in [self.plain_path(&date), self.gz_path(&date)] {
                if let Ok(meta) = fs::metadata(&path) {
                    total = total.saturating_sub(meta.len());
                    fs::remove_file(&path).map_err(|source| RetentionError::Io {
                        path: path.display().to_string(),
                        source,
                    })?;
                }
            }
            removed += 1;
        }
        Ok(removed)
    }

    pub fn total_bytes(&self) -> Result<u64, RetentionError> {
        let _guard = self.write_lock.lock();
        self.total_bytes_locked()
    }

    fn total_bytes_locked(&self) -> Result<u64, RetentionError> {
        if !self.storage_dir().exists() {
            return Ok(0);
        }
        let mut total = 0u64;
        for entry in fs::read_dir(self.storage_dir()).map_err(|source| RetentionError::Io {
            path: self.config.storage_dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| RetentionError::Io {
                path: self.config.storage_dir.clone(),
                source,
            })?;
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    fn compress_horizon_date(&self) -> String {
        (chrono::Utc::now() - chrono::Duration::days(self.config.compress_after_days as i64))
            .format("%Y-%m-%d")
            .to_string()
    }

    fn retention_horizon_date(&self) -> String {
        (chrono::Utc::now() - chrono::Duration::days(self.config.retention_days as i64))
            .format("%Y-%m-%d")
            .to_string()
    }
}

fn parse_segment_date(filename: &str) -> Option<String> {
    let rest = filename.strip_prefix("metrics-")?;
    let date = rest
        .strip_suffix(".jsonl.gz")
        .or_else(|| rest.strip_suffix(".jsonl"))?;
    if date.len() == 10 {
        Some(date.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DomainMetrics, HostMetrics};

    fn store_in(dir: &Path) -> RetentionStore {
        RetentionStore::new(RetentionConfig {
            storage_dir: dir.to_string_lossy().to_string(),
            retention_days: 30,
            compress_after_days: 7,
            cleanup_interval_ms: 1,
            compress_interval_ms: 1,
            max_bytes: 0,
        })
    }

    fn snapshot_at(ts_ms: i64) -> MetricSnapshot {
        MetricSnapshot::new(ts_ms, HostMetrics::default(), DomainMetrics::default())
    }

    #[test]
    fn append_then_query_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let snap = snapshot_at(1_700_000_000_000);
        store.append(&snap).unwrap();

        let date = snap.utc_date();
        let found = store.query(&date, &date).unwrap();
        assert_eq!(found, vec![snap]);
    }

    #[test]
    fn compress_aged_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let old_ts = (chrono::Utc::now() - chrono::Duration::days(10)).timestamp_millis();
        store.append(&snapshot_at(old_ts)).unwrap();

        let first = store.compress_aged().unwrap();
        assert_eq!(first, 1);
        let second = store.compress_aged().unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn evict_aged_removes_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let old_ts = (chrono::Utc::now() - chrono::Duration::days(40)).timestamp_millis();
        let snap = snapshot_at(old_ts);
        store.append(&snap).unwrap();

        let evicted = store.evict_aged().unwrap();
        assert_eq!(evicted, 1);
        assert!(store.query(&snap.utc_date(), &snap.utc_date()).unwrap().is_empty());

        // Idempotent: nothing left to evict.
        assert_eq!(store.evict_aged().unwrap(), 0);
    }

    #[test]
    fn query_transparently_decompresses() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let old_ts = (chrono::Utc::now() - chrono::Duration::days(10)).timestamp_millis();
        let snap = snapshot_at(old_ts);
        store.append(&snap).unwrap();
        store.compress_aged().unwrap();

        let found = store.query(&snap.utc_date(), &snap.utc_date()).unwrap();
        assert_eq!(found, vec![snap]);
    }

    #[test]
    fn missing_directory_is_auto_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested").join("metrics");
        let store = store_in(&nested);
        store.append(&snapshot_at(0)).unwrap();
        assert!(nested.exists());
    }
}
