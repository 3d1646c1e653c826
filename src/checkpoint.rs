//! Resumable progress, one JSON file per checkpoint scope.
//!
//! Files are written to a temp path and renamed into place so a crash mid-write
//! never leaves a truncated checkpoint behind.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::normalization::slug::slugify_token;
use crate::partition::PartitionSpec;

/// Position of the last item whose writes have landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Index into the full (unpartitioned) work list.
    pub index: usize,
    pub item_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cursor: Cursor,
    pub processed_count: u64,
    pub matched_count: u64,
    pub created_count: u64,
    pub skipped_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// True when the item at `index` was already handled by the checkpointed run.
    pub fn covers(&self, index: usize) -> bool {
        index <= self.cursor.index
    }
}

pub struct CheckpointStore {
    path: PathBuf,
    interval: Duration,
    last_saved: Instant,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last_saved: Instant::now(),
        }
    }

    /// `<dir>/<provider>.json`, or `<dir>/<provider>.p<i>of<W>.json` for a partition.
    pub fn for_scope(
        dir: &Path,
        provider: &str,
        partition: Option<PartitionSpec>,
        interval: Duration,
    ) -> Self {
        let mut stem = slugify_token(provider);
        if stem.is_empty() {
            stem = "provider".to_string();
        }
        let file = match partition {
            Some(p) => format!("{stem}.{}.json", p.scope_suffix()),
            None => format!("{stem}.json"),
        };
        Self::new(dir.join(file), interval)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the time-based cadence says a save is due.
    pub fn is_due(&self) -> bool {
        self.last_saved.elapsed() >= self.interval
    }

    pub fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating checkpoint dir {}", parent.display()))?;
            }
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint).context("serialising checkpoint")?;
        fs::write(&tmp_path, &body)
            .with_context(|| format!("writing checkpoint tmp {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming checkpoint tmp {}", self.path.display()))?;
        self.last_saved = Instant::now();
        debug!(
            path = %self.path.display(),
            index = checkpoint.cursor.index,
            item_id = %checkpoint.cursor.item_id,
            processed = checkpoint.processed_count,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Save only when the cadence interval has elapsed. Returns whether it saved.
    pub fn maybe_save(&mut self, checkpoint: &Checkpoint) -> Result<bool> {
        if !self.is_due() {
            return Ok(false);
        }
        self.save(checkpoint)?;
        Ok(true)
    }

    /// Last saved checkpoint. A missing file means "start from the beginning";
    /// an unreadable one is logged and treated the same, since replay is safe.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading checkpoint {}", self.path.display()))
            }
        };
        match serde_json::from_slice::<Checkpoint>(&body) {
            Ok(cp) => Ok(Some(cp)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint unparseable; starting from the beginning");
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing checkpoint {}", self.path.display())),
        }
    }
}
