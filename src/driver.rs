//! The run driver: load progress, dispatch remaining units, accumulate
//! results, checkpoint, and write the assembled output.
//!
//! ## States
//!
//! ```text
//! Idle ─▶ Loading ─▶ Running ─▶ Draining ─▶ Finalizing ─▶ Done
//!            │          │           │             │
//!            └──────────┴───────────┴─────────────┴──▶ Failed
//! ```
//!
//! * **Loading**: plan keys, read the checkpoint, compute what remains.
//!   With nothing remaining the driver goes straight to Finalizing.
//! * **Running**: the producer task fills the bounded channel; the pool
//!   consumes it. Results are folded into the checkpoint as they arrive.
//! * **Draining**: every unit has been dispatched; outstanding units finish.
//! * **Finalizing**: final flush, assemble, write output, remove checkpoint.
//!   The output is synced to disk before the checkpoint goes away.
//!
//! A unit that fails is recorded and the run carries on. A call the
//! provider rejects outright fails the run, after flushing what finished.
//!
//! Only the accumulation loop mutates run progress; workers hand results
//! back through the pool's stream and never touch shared state.

use crate::assemble;
use crate::checkpoint::{self, CheckpointStore};
use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::output::{RunOutcome, RunReport, RunSummary};
use crate::pipeline::llm::InferenceClient;
use crate::pipeline::parse::ResponseParser;
use crate::pipeline::producer::UnitProducer;
use crate::pipeline::worker::{self, Worker};
use crate::progress::ProgressCallback;
use crate::unit::UnitKey;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    Loading,
    Running,
    Draining,
    Finalizing,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Loading => "loading",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Finalizing => "finalizing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Current state plus the observer to notify on transitions.
struct StateTracker {
    state: RunState,
    progress: Option<ProgressCallback>,
}

impl StateTracker {
    fn new(progress: Option<ProgressCallback>) -> Self {
        Self {
            state: RunState::Idle,
            progress,
        }
    }

    fn advance(&mut self, to: RunState) {
        let from = self.state;
        if from == to || from.is_terminal() {
            return;
        }
        info!("Run state: {} → {}", from, to);
        self.state = to;
        if let Some(ref cb) = self.progress {
            cb.on_state_change(from, to);
        }
    }
}

/// Where a run writes its output and its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub output: PathBuf,
    pub checkpoint: PathBuf,
}

impl RunPaths {
    /// Output at `output`, checkpoint next to it.
    pub fn for_output(output: impl Into<PathBuf>) -> Self {
        let output = output.into();
        let checkpoint = CheckpointStore::default_path(&output);
        Self { output, checkpoint }
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<PathBuf>) -> Self {
        self.checkpoint = checkpoint.into();
        self
    }
}

/// A fully wired extraction run.
///
/// The three collaborators are trait objects so tests can drive the whole
/// state machine with in-memory fakes.
pub struct Pipeline {
    config: ExtractionConfig,
    producer: Arc<dyn UnitProducer>,
    client: Arc<dyn InferenceClient>,
    parser: Arc<dyn ResponseParser>,
}

impl Pipeline {
    pub fn new(
        config: ExtractionConfig,
        producer: Arc<dyn UnitProducer>,
        client: Arc<dyn InferenceClient>,
        parser: Arc<dyn ResponseParser>,
    ) -> Self {
        Self {
            config,
            producer,
            client,
            parser,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Run to completion.
    ///
    /// Per-unit failures never abort the run; they are recorded and
    /// reported in the summary. `Err` means the run could not proceed
    /// (bad setup, checkpoint or output I/O). Dropping the returned future
    /// cancels the run; the last flushed checkpoint stays on disk.
    pub async fn run(&self, paths: &RunPaths) -> Result<RunReport, ExtractError> {
        let mut tracker = StateTracker::new(self.config.progress_callback.clone());
        match self.run_inner(paths, &mut tracker).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!("Run failed in state {}: {}", tracker.state, e);
                tracker.advance(RunState::Failed);
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        paths: &RunPaths,
        tracker: &mut StateTracker,
    ) -> Result<RunReport, ExtractError> {
        let started = Instant::now();
        let cb = self.config.progress_callback.clone();

        tracker.advance(RunState::Loading);

        // Without a checkpoint there is nothing to finish; fail before planning.
        let output_blocked = paths.output.exists() && !self.config.overwrite;
        if output_blocked && (self.config.fresh || !paths.checkpoint.exists()) {
            return Err(ExtractError::OutputExists {
                path: paths.output.clone(),
            });
        }

        let keys = self.producer.plan().await?;
        let requested: BTreeSet<UnitKey> = keys.iter().copied().collect();

        if self.config.fresh {
            CheckpointStore::discard(&paths.checkpoint)?;
        }
        let mut store = CheckpointStore::open(&paths.checkpoint, self.config.checkpoint_every)?;
        store.restrict_to(&requested);
        if self.config.retry_failed {
            store.release_failures();
        }

        let done = &store.progress().completed_keys;
        let resumed = done.len();
        let remaining: Vec<UnitKey> = keys.into_iter().filter(|k| !done.contains(k)).collect();

        // A complete checkpoint next to an existing output means the last run
        // stopped between writing the output and removing the checkpoint.
        if output_blocked && !remaining.is_empty() {
            return Err(ExtractError::OutputExists {
                path: paths.output.clone(),
            });
        }

        info!(
            "{} units requested, {} already done, {} to process",
            requested.len(),
            resumed,
            remaining.len()
        );
        if let Some(ref cb) = cb {
            cb.on_run_start(requested.len(), resumed);
        }

        let processed = remaining.len();
        if !remaining.is_empty() {
            tracker.advance(RunState::Running);
            self.dispatch(remaining, &mut store, tracker).await?;
        }

        tracker.advance(RunState::Finalizing);
        if store.unflushed() > 0 {
            store.flush()?;
            if let Some(ref cb) = cb {
                let p = store.progress();
                cb.on_checkpoint(p.completed_keys.len(), p.records_so_far.len());
            }
        }

        let outcome = assemble::assemble(
            store.progress().records_so_far.clone(),
            &self.config.corrections,
        );
        write_output(&paths.output, &outcome).await?;
        let checkpoint_flushes = store.flushes();
        let progress = store.finish()?;

        let summary = RunSummary {
            total_units: requested.len(),
            resumed_units: resumed,
            processed_units: processed,
            failed: progress.failures,
            total_records: outcome.records.len(),
            checkpoint_flushes,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if summary.failed.is_empty() {
            info!(
                "Run complete: {} records from {} units",
                summary.total_records, summary.total_units
            );
        } else {
            warn!(
                "Run complete: {} records, {} of {} units failed",
                summary.total_records,
                summary.failed.len(),
                summary.total_units
            );
        }

        tracker.advance(RunState::Done);
        if let Some(ref cb) = cb {
            cb.on_run_complete(&summary);
        }

        Ok(RunReport { outcome, summary })
    }

    /// Running and Draining: produce, process and accumulate `remaining`.
    async fn dispatch(
        &self,
        remaining: Vec<UnitKey>,
        store: &mut CheckpointStore,
        tracker: &mut StateTracker,
    ) -> Result<(), ExtractError> {
        let cb = self.config.progress_callback.clone();
        let mut left = remaining.len();

        let (tx, rx) = mpsc::channel(self.config.channel_capacity());
        let producer = Arc::clone(&self.producer);
        let mut producer_task = tokio::spawn(async move { producer.produce(remaining, tx).await });
        let mut producer_done = false;

        let worker = Worker::new(
            Arc::clone(&self.client),
            Arc::clone(&self.parser),
            self.config.retry_policy(),
            cb.clone(),
        );
        let results = worker::run_pool(&worker, rx, self.config.workers);
        tokio::pin!(results);

        loop {
            tokio::select! {
                joined = &mut producer_task, if !producer_done => {
                    producer_done = true;
                    joined.map_err(|e| ExtractError::Internal(format!("Producer task failed: {}", e)))?;
                    tracker.advance(RunState::Draining);
                }
                next = results.next() => {
                    let Some(next) = next else { break };
                    let result = match next {
                        Ok(result) => result,
                        Err(e) => {
                            producer_task.abort();
                            if store.unflushed() > 0 {
                                store.flush()?;
                            }
                            return Err(e);
                        }
                    };
                    left = left.saturating_sub(1);
                    if store.record(result) || left == 0 {
                        store.flush()?;
                        if let Some(ref cb) = cb {
                            let p = store.progress();
                            cb.on_checkpoint(p.completed_keys.len(), p.records_so_far.len());
                        }
                    }
                }
            }
        }

        if !producer_done {
            producer_task
                .await
                .map_err(|e| ExtractError::Internal(format!("Producer task failed: {}", e)))?;
            tracker.advance(RunState::Draining);
        }

        if left > 0 {
            warn!("{} units were never produced; they stay pending", left);
        }
        Ok(())
    }
}

/// Durably write the records as a pretty JSON array (temp file, fsync, rename).
async fn write_output(path: &Path, outcome: &RunOutcome) -> Result<(), ExtractError> {
    let fail = |source: std::io::Error| ExtractError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(&outcome.records)
        .map_err(|e| fail(std::io::Error::other(e)))?;

    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        checkpoint::replace_atomically(&target, |w| w.write_all(&json))
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("Output writer task failed: {}", e)))?
    .map_err(fail)?;

    info!("Wrote {} records to {}", outcome.records.len(), path.display());
    Ok(())
}
