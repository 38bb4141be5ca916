//! Checkpointing: periodic, atomic snapshots of crawl state, and the
//! restore path that makes `crawl → kill → resume` equivalent to an
//! uninterrupted run.
//!
//! File layout:
//!   line 1        JSON header `{version, config_digest, options_digest,
//!                 stats, timestamp, host_backoffs}`
//!   `@@visited`   then one canonical URL per line
//!   `@@frontier`  then one JSON frontier entry per line, priority-ordered
//!
//! Writes are atomic: temp file → fsync → rename.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CrawlError;
use crate::frontier::{Frontier, FrontierSnapshot};
use crate::models::{epoch_secs, CrawlStats, UrlRecord};
use crate::scheduler::HostScheduler;

pub const CHECKPOINT_VERSION: u32 = 1;

const VISITED_MARKER: &str = "@@visited";
const FRONTIER_MARKER: &str = "@@frontier";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub version: u32,
    /// Digest over host allow-list + normalization rules; must match to
    /// restore.
    pub config_digest: String,
    /// Digest over the remaining options; a mismatch only warns.
    #[serde(default)]
    pub options_digest: String,
    pub stats: CrawlStats,
    pub timestamp: u64,
    #[serde(default)]
    pub host_backoffs: std::collections::HashMap<String, f64>,
}

#[derive(Debug)]
pub struct CheckpointData {
    pub header: CheckpointHeader,
    pub snapshot: FrontierSnapshot,
}

/// Write a checkpoint atomically.
pub fn save(
    path: &Path,
    header: &CheckpointHeader,
    snapshot: &FrontierSnapshot,
) -> Result<(), CrawlError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_path_for(path);
    {
        let file = std::fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer(&mut writer, header)?;
        writer.write_all(b"\n")?;

        writer.write_all(VISITED_MARKER.as_bytes())?;
        writer.write_all(b"\n")?;
        for url in &snapshot.visited {
            writer.write_all(url.as_bytes())?;
            writer.write_all(b"\n")?;
        }

        writer.write_all(FRONTIER_MARKER.as_bytes())?;
        writer.write_all(b"\n")?;
        for record in &snapshot.pending {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| CrawlError::Checkpoint(format!("flush failed: {}", e)))?;
        file.sync_all()?;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// Load and validate a checkpoint.
///
/// Restore is valid only when the schema version is known and the compat
/// digest matches; differing unrelated options emit a warning.
pub fn load(path: &Path, expected_compat_digest: &str, expected_options_digest: &str)
    -> Result<CheckpointData, CrawlError>
{
    let file = std::fs::File::open(path)
        .map_err(|e| CrawlError::Checkpoint(format!("cannot open {}: {}", path.display(), e)))?;
    let reader = std::io::BufReader::new(file);
    let mut lines = reader.lines();

    let header_line = lines
        .next()
        .ok_or_else(|| CrawlError::Checkpoint("empty checkpoint file".into()))??;
    let header: CheckpointHeader = serde_json::from_str(&header_line)
        .map_err(|e| CrawlError::Checkpoint(format!("bad header: {}", e)))?;

    if header.version != CHECKPOINT_VERSION {
        return Err(CrawlError::Checkpoint(format!(
            "unknown checkpoint version {} (supported: {})",
            header.version, CHECKPOINT_VERSION
        )));
    }
    if header.config_digest != expected_compat_digest {
        return Err(CrawlError::Checkpoint(
            "checkpoint was written under an incompatible host policy or \
             normalization rules; refusing to resume"
                .into(),
        ));
    }
    if !header.options_digest.is_empty() && header.options_digest != expected_options_digest {
        tracing::warn!("checkpoint was written with different non-critical options");
    }

    let mut snapshot = FrontierSnapshot {
        host_backoffs: header.host_backoffs.clone(),
        ..Default::default()
    };

    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Visited,
        Pending,
    }
    let mut section = Section::Preamble;

    for line in lines {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed {
            VISITED_MARKER => {
                section = Section::Visited;
                continue;
            }
            FRONTIER_MARKER => {
                section = Section::Pending;
                continue;
            }
            _ => {}
        }
        match section {
            Section::Preamble => {
                return Err(CrawlError::Checkpoint(format!(
                    "unexpected content before {} marker",
                    VISITED_MARKER
                )));
            }
            Section::Visited => snapshot.visited.push(trimmed.to_string()),
            Section::Pending => {
                let record: UrlRecord = serde_json::from_str(trimmed)
                    .map_err(|e| CrawlError::Checkpoint(format!("bad frontier entry: {}", e)))?;
                snapshot.pending.push(record);
            }
        }
    }

    Ok(CheckpointData { header, snapshot })
}

/// Drives periodic checkpoints: every `interval` admitted URLs and on
/// shutdown.
pub struct Checkpointer {
    path: PathBuf,
    interval: u64,
    since_last: AtomicU64,
    config_digest: String,
    options_digest: String,
}

impl Checkpointer {
    pub fn new(path: PathBuf, interval: u64, config_digest: String, options_digest: String) -> Self {
        Self {
            path,
            interval: interval.max(1),
            since_last: AtomicU64::new(0),
            config_digest,
            options_digest,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Count one admission; true when a snapshot is due.
    pub fn note_admission(&self) -> bool {
        let count = self.since_last.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.interval {
            self.since_last.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Snapshot the frontier and scheduler state to disk.
    pub async fn save_now(
        &self,
        frontier: &Arc<dyn Frontier>,
        scheduler: &HostScheduler,
        stats: &CrawlStats,
    ) -> Result<(), CrawlError> {
        let mut snapshot = frontier.snapshot().await?;
        snapshot.host_backoffs = scheduler.backoff_snapshot();

        let header = CheckpointHeader {
            version: CHECKPOINT_VERSION,
            config_digest: self.config_digest.clone(),
            options_digest: self.options_digest.clone(),
            stats: stats.clone(),
            timestamp: epoch_secs(),
            host_backoffs: snapshot.host_backoffs.clone(),
        };

        save(&self.path, &header, &snapshot)?;
        tracing::info!(
            path = %self.path.display(),
            visited = snapshot.visited.len(),
            pending = snapshot.pending.len(),
            "checkpoint written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(config_digest: &str) -> CheckpointHeader {
        CheckpointHeader {
            version: CHECKPOINT_VERSION,
            config_digest: config_digest.to_string(),
            options_digest: "opts".to_string(),
            stats: CrawlStats {
                processed: 3,
                succeeded: 2,
                errored: 1,
            },
            timestamp: epoch_secs(),
            host_backoffs: Default::default(),
        }
    }

    fn snapshot() -> FrontierSnapshot {
        FrontierSnapshot {
            visited: vec!["https://h/a".to_string(), "https://h/b".to_string()],
            pending: vec![UrlRecord::new(
                "https://h/c".to_string(),
                "h".to_string(),
                1,
                0.5,
                Some("https://h/a".to_string()),
            )],
            host_backoffs: Default::default(),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        save(&path, &header("digest"), &snapshot()).unwrap();
        let data = load(&path, "digest", "opts").unwrap();

        assert_eq!(data.header.stats.processed, 3);
        assert_eq!(data.snapshot.visited.len(), 2);
        assert_eq!(data.snapshot.pending.len(), 1);
        assert_eq!(data.snapshot.pending[0].url, "https://h/c");
        assert_eq!(data.snapshot.pending[0].parent.as_deref(), Some("https://h/a"));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut h = header("digest");
        h.version = 99;
        save(&path, &h, &snapshot()).unwrap();

        assert!(load(&path, "digest", "opts").is_err());
    }

    #[test]
    fn test_rejects_incompatible_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &header("digest-a"), &snapshot()).unwrap();

        assert!(load(&path, "digest-b", "opts").is_err());
    }

    #[test]
    fn test_differing_options_only_warn() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &header("digest"), &snapshot()).unwrap();

        // Same compat digest, different options digest: loads fine
        assert!(load(&path, "digest", "other-opts").is_ok());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &header("digest"), &snapshot()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["state.json"]);
    }

    #[test]
    fn test_consecutive_checkpoints_grow_visited() {
        // visited(C) ⊆ visited(C') for consecutive checkpoints
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let first = snapshot();
        save(&path, &header("digest"), &first).unwrap();
        let loaded_first = load(&path, "digest", "opts").unwrap();

        let mut second = snapshot();
        second.visited.push("https://h/c".to_string());
        second.pending.clear();
        save(&path, &header("digest"), &second).unwrap();
        let loaded_second = load(&path, "digest", "opts").unwrap();

        for url in &loaded_first.snapshot.visited {
            assert!(loaded_second.snapshot.visited.contains(url));
        }
    }

    #[test]
    fn test_note_admission_interval() {
        let checkpointer = Checkpointer::new(
            PathBuf::from("/tmp/unused"),
            3,
            "d".into(),
            "o".into(),
        );
        assert!(!checkpointer.note_admission());
        assert!(!checkpointer.note_admission());
        assert!(checkpointer.note_admission());
        assert!(!checkpointer.note_admission());
    }
}
