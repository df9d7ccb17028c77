//! Durable run progress.
//!
//! The checkpoint is a single JSON document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "completed_keys": [{"page": 1, "chunk": 0}, ...],
//!   "records_so_far": [{"key": {...}, "index": 0, "value": {...}}, ...],
//!   "failures": [{"key": {...}, "reason": {"kind": "malformed", ...}}]
//! }
//! ```
//!
//! ## Atomicity
//!
//! A flush writes the whole document to a temporary file in the same
//! directory, syncs it, then renames it over the checkpoint. A crash at any
//! point leaves either the previous checkpoint or the new one, never a torn
//! file. Records and completed keys are written together, so a key is never
//! marked complete without its records.
//!
//! A failed unit counts as completed: it is listed in `completed_keys` and
//! in `failures`, and is not dispatched again unless the caller asks to
//! retry failures.

use crate::error::{ExtractError, FailedUnit};
use crate::unit::{Record, UnitKey, UnitResult, UnitStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Progress of a run as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub completed_keys: BTreeSet<UnitKey>,
    #[serde(default)]
    pub records_so_far: Vec<Record>,
    #[serde(default)]
    pub failures: Vec<FailedUnit>,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            completed_keys: BTreeSet::new(),
            records_so_far: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl RunProgress {
    pub fn is_empty(&self) -> bool {
        self.completed_keys.is_empty() && self.records_so_far.is_empty()
    }

    /// Drop progress for keys outside `requested`; returns the keys dropped.
    pub fn restrict_to(&mut self, requested: &BTreeSet<UnitKey>) -> usize {
        let before = self.completed_keys.len();
        self.completed_keys.retain(|k| requested.contains(k));
        self.records_so_far.retain(|r| requested.contains(&r.key));
        self.failures.retain(|f| requested.contains(&f.key));
        before - self.completed_keys.len()
    }

    /// Make failed units pending again; returns how many were released.
    pub fn release_failures(&mut self) -> usize {
        let failures = std::mem::take(&mut self.failures);
        for failed in &failures {
            self.completed_keys.remove(&failed.key);
        }
        failures.len()
    }

    /// Fold one unit result in. Returns `false` for an already completed key.
    pub fn apply(&mut self, result: UnitResult) -> bool {
        if !self.completed_keys.insert(result.key) {
            return false;
        }
        if let UnitStatus::Failed(reason) = result.status {
            self.failures.push(FailedUnit {
                key: result.key,
                reason,
            });
        }
        self.records_so_far.extend(result.records);
        true
    }
}

/// Owns the on-disk checkpoint for one run.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    progress: RunProgress,
    flush_every: usize,
    unflushed: usize,
    flushes: usize,
}

impl CheckpointStore {
    /// Checkpoint path used when none is given: `<output stem>.progress.json`.
    pub fn default_path(output: &Path) -> PathBuf {
        output.with_extension("progress.json")
    }

    /// Open the checkpoint at `path`, loading prior progress if the file exists.
    pub fn open(path: impl Into<PathBuf>, flush_every: usize) -> Result<Self, ExtractError> {
        let path = path.into();
        let progress = Self::load(&path)?;
        if !progress.is_empty() {
            info!(
                "Resuming from {}: {} units done, {} records",
                path.display(),
                progress.completed_keys.len(),
                progress.records_so_far.len()
            );
        }
        Ok(Self {
            path,
            progress,
            flush_every: flush_every.max(1),
            unflushed: 0,
            flushes: 0,
        })
    }

    /// Read progress from `path`; a missing file is empty progress.
    pub fn load(path: &Path) -> Result<RunProgress, ExtractError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RunProgress::default())
            }
            Err(e) => {
                return Err(ExtractError::CheckpointCorrupt {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                })
            }
        };

        let progress: RunProgress =
            serde_json::from_str(&text).map_err(|e| ExtractError::CheckpointCorrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;

        if progress.version > CHECKPOINT_VERSION {
            return Err(ExtractError::CheckpointCorrupt {
                path: path.to_path_buf(),
                detail: format!(
                    "written by a newer version (format {} > {})",
                    progress.version, CHECKPOINT_VERSION
                ),
            });
        }
        Ok(progress)
    }

    /// Delete the checkpoint at `path` if it exists.
    pub fn discard(path: &Path) -> Result<(), ExtractError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!("Discarded checkpoint {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ExtractError::CheckpointWriteFailed {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    /// Keep only progress for `requested` keys.
    pub fn restrict_to(&mut self, requested: &BTreeSet<UnitKey>) {
        let dropped = self.progress.restrict_to(requested);
        if dropped > 0 {
            warn!(
                "Checkpoint holds {} units outside the requested range; ignoring them",
                dropped
            );
        }
    }

    /// Make failed units pending again.
    pub fn release_failures(&mut self) {
        let released = self.progress.release_failures();
        if released > 0 {
            info!("Retrying {} previously failed units", released);
        }
    }

    /// Record a unit result. Returns `true` when a flush is due.
    pub fn record(&mut self, result: UnitResult) -> bool {
        let key = result.key;
        if self.progress.apply(result) {
            self.unflushed += 1;
        } else {
            warn!("Duplicate result for {} ignored", key);
        }
        self.unflushed >= self.flush_every
    }

    /// Number of results recorded since the last flush.
    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    /// Number of successful flushes made through this store.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Durably replace the checkpoint with the current progress.
    pub fn flush(&mut self) -> Result<(), ExtractError> {
        self.write_atomic()
            .map_err(|source| ExtractError::CheckpointWriteFailed {
                path: self.path.clone(),
                source,
            })?;
        self.unflushed = 0;
        self.flushes += 1;
        debug!(
            "Checkpoint flushed: {} units, {} records",
            self.progress.completed_keys.len(),
            self.progress.records_so_far.len()
        );
        Ok(())
    }

    fn write_atomic(&self) -> std::io::Result<()> {
        replace_atomically(&self.path, |w| {
            serde_json::to_writer(w, &self.progress).map_err(std::io::Error::other)
        })
    }

    /// Delete the checkpoint after a successful run and return the progress.
    pub fn finish(self) -> Result<RunProgress, ExtractError> {
        Self::discard(&self.path)?;
        Ok(self.progress)
    }
}

/// Durably replace `path` with whatever `write` produces.
///
/// Writes a temporary file in the target's directory, syncs it, then
/// renames it over `path`. On error the previous file is untouched.
pub(crate) fn replace_atomically<F>(path: &Path, write: F) -> std::io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
