//! Run outcome and summary types.

use crate::error::FailedUnit;
use crate::unit::Record;
use serde::{Deserialize, Serialize};

/// The assembled records of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// All records, sorted by (unit key, index) with corrections applied.
    pub records: Vec<Record>,
    /// Number of correction rules that changed a field.
    pub corrections_applied: usize,
}

/// What happened during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Units requested by the run's page range.
    pub total_units: usize,
    /// Units restored from a checkpoint and not dispatched again.
    pub resumed_units: usize,
    /// Units dispatched by this run.
    pub processed_units: usize,
    /// Every failed unit in the final progress, earlier runs included.
    pub failed: Vec<FailedUnit>,
    pub total_records: usize,
    /// Durable checkpoint writes made by this run.
    pub checkpoint_flushes: usize,
    /// Wall-clock time of the run.
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn succeeded_units(&self) -> usize {
        self.total_units.saturating_sub(self.failed.len())
    }
}

/// Returned by a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: RunSummary,
}
