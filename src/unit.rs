//! Work units and the records they produce.
//!
//! A [`WorkUnit`] is one dispatchable piece of input (a rendered page or a
//! segmented text chunk). Its [`UnitKey`] is the only ordering information
//! the pipeline ever trusts: completion order is arbitrary, and the final
//! output is re-sorted by key before it is written.

use crate::error::FailureReason;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordering key of a work unit, unique within a run.
///
/// Field order matters: the derived `Ord` compares `page` first, then
/// `chunk`. The page strategy always uses `chunk = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    /// 1-indexed page the unit starts on.
    pub page: usize,
    /// Index of the chunk among the chunks starting on `page`.
    pub chunk: usize,
}

impl UnitKey {
    /// Key for a whole page.
    pub fn page(page: usize) -> Self {
        Self { page, chunk: 0 }
    }

    /// Key for the `chunk`-th segment starting on `page`.
    pub fn chunk(page: usize, chunk: usize) -> Self {
        Self { page, chunk }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.chunk == 0 {
            write!(f, "p{}", self.page)
        } else {
            write!(f, "p{}#{}", self.page, self.chunk)
        }
    }
}

/// What gets sent to the inference service.
#[derive(Clone, PartialEq, Eq)]
pub enum Payload {
    /// Encoded page image (PNG from the pdfium renderer).
    Image { bytes: Vec<u8>, mime: String },
    /// Raw text (a page's text layer or one segmented chunk).
    Text(String),
}

impl Payload {
    /// Variant name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Image { .. } => "image",
            Payload::Text(_) => "text",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Image { bytes, .. } => bytes.len(),
            Payload::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Image payloads run to megabytes; keep them out of debug logs.
impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Image { bytes, mime } => f
                .debug_struct("Image")
                .field("mime", mime)
                .field("bytes", &bytes.len())
                .finish(),
            Payload::Text(t) => f.debug_tuple("Text").field(&t.len()).finish(),
        }
    }
}

/// One dispatchable piece of work.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub key: UnitKey,
    pub payload: Payload,
    /// Task-specific prompt describing what to extract.
    pub instruction: String,
}

/// One structured extraction result.
///
/// `value` is opaque to the pipeline. `key` and `index` carry provenance and
/// fix the record's place in the final output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: UnitKey,
    /// Emission order inside the unit.
    pub index: usize,
    pub value: serde_json::Value,
}

/// Final status of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Success,
    Failed(FailureReason),
}

/// Outcome of processing one [`WorkUnit`], emitted exactly once per unit.
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub key: UnitKey,
    pub records: Vec<Record>,
    pub status: UnitStatus,
    /// Number of inference calls made (0 when rendering failed).
    pub attempts: u32,
    pub duration_ms: u64,
}

impl UnitResult {
    /// A zero-record failure.
    pub fn failed(key: UnitKey, reason: FailureReason, attempts: u32, duration_ms: u64) -> Self {
        Self {
            key,
            records: Vec::new(),
            status: UnitStatus::Failed(reason),
            attempts,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, UnitStatus::Success)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.status {
            UnitStatus::Success => None,
            UnitStatus::Failed(reason) => Some(reason),
        }
    }
}
