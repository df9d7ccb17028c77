//! Progress-callback trait for run and unit events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the pipeline dispatches, retries and completes units.
//!
//! Callers can forward events to a terminal progress bar, a channel or a log
//! without the library knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use lexiscan::{ExtractionConfig, ExtractionProgressCallback, UnitKey};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_unit_complete(&self, key: UnitKey, records: usize) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{key}: {records} records ({done} done)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::driver::RunState;
use crate::error::FailureReason;
use crate::output::RunSummary;
use crate::unit::UnitKey;
use std::sync::Arc;
use std::time::Duration;

/// Called by the pipeline as it processes a run.
///
/// Unit-level methods may be called concurrently from several in-flight
/// units, so implementations must synchronise their own state. Every method
/// has a no-op default.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once remaining work is known.
    ///
    /// * `total_units` : units requested for the run
    /// * `already_done`: units restored from a checkpoint
    fn on_run_start(&self, total_units: usize, already_done: usize) {
        let _ = (total_units, already_done);
    }

    /// Called on every driver state transition.
    fn on_state_change(&self, from: RunState, to: RunState) {
        let _ = (from, to);
    }

    /// Called just before the first inference call of a unit.
    fn on_unit_start(&self, key: UnitKey) {
        let _ = key;
    }

    /// Called when a transient failure is about to be retried.
    ///
    /// * `attempt`: 1-indexed number of the call that failed
    /// * `wait`   : backoff before the next call
    fn on_retry(&self, key: UnitKey, attempt: u32, wait: Duration, error: &str) {
        let _ = (key, attempt, wait, error);
    }

    /// Called when a unit produced records (possibly zero).
    fn on_unit_complete(&self, key: UnitKey, records: usize) {
        let _ = (key, records);
    }

    /// Called when a unit finished as a failure.
    fn on_unit_failed(&self, key: UnitKey, reason: &FailureReason) {
        let _ = (key, reason);
    }

    /// Called after each durable checkpoint flush.
    ///
    /// * `completed`: units recorded in the checkpoint
    /// * `records`  : records recorded in the checkpoint
    fn on_checkpoint(&self, completed: usize, records: usize) {
        let _ = (completed, records);
    }

    /// Called once after the output has been written.
    fn on_run_complete(&self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
