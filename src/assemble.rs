//! Final assembly: order records by key and apply the correction table.
//!
//! Completion order is arbitrary under concurrency, so the assembler sorts by
//! `(key, index)` with a stable sort. Two records from the same unit keep
//! their emission order.
//!
//! ## Correction table
//!
//! Known OCR misreadings are fixed after extraction, from a JSON file:
//!
//! ```json
//! {
//!   "version": 1,
//!   "corrections": [
//!     { "field": "headword", "from": "kene", "to": "kené", "page": 85 },
//!     { "field": "part_of_speech", "from": "v. £.", "to": "v. t." }
//!   ]
//! }
//! ```
//!
//! A rule replaces a string field whose whole value equals `from`. When
//! `page` is set, only records whose unit starts on that page match.

use crate::error::ExtractError;
use crate::output::RunOutcome;
use crate::unit::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// One correction rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub field: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
}

impl Correction {
    fn apply(&self, record: &mut Record) -> bool {
        if self.page.is_some_and(|p| p != record.key.page) {
            return false;
        }
        match record.value.get_mut(&self.field) {
            Some(Value::String(s)) if *s == self.from => {
                *s = self.to.clone();
                true
            }
            _ => false,
        }
    }
}

/// Post-extraction fixes for known misreadings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionTable {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub corrections: Vec<Correction>,
}

impl CorrectionTable {
    /// Load a table from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let invalid = |detail: String| ExtractError::CorrectionTableInvalid {
            path: path.to_path_buf(),
            detail,
        };
        let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let table: Self = serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;
        info!(
            "Loaded {} corrections from {}",
            table.corrections.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.corrections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corrections.is_empty()
    }

    /// Apply every rule to `record`; returns how many changed it.
    pub fn apply(&self, record: &mut Record) -> usize {
        self.corrections
            .iter()
            .filter(|c| c.apply(record))
            .count()
    }
}

/// Sort `records` into output order and apply `corrections`.
pub fn assemble(mut records: Vec<Record>, corrections: &CorrectionTable) -> RunOutcome {
    records.sort_by_key(|r| (r.key, r.index));

    let corrections_applied = if corrections.is_empty() {
        0
    } else {
        records.iter_mut().map(|r| corrections.apply(r)).sum()
    };

    debug!(
        "Assembled {} records ({} corrections applied)",
        records.len(),
        corrections_applied
    );

    RunOutcome {
        records,
        corrections_applied,
    }
}
