//! Error types for the lexiscan library.
//!
//! Errors are split by blast radius:
//!
//! * [`ExtractError`]: **Fatal**: the run cannot proceed at all (missing
//!   source document, provider not configured, checkpoint cannot be written).
//!   Returned as `Err(ExtractError)` from [`crate::extract`] and
//!   [`crate::driver::Pipeline::run`].
//!
//! * [`FailureReason`]: **Per-unit**: one work unit could not be turned into
//!   records (retries exhausted, unparsable response, render glitch). Stored
//!   in the checkpoint and the run summary; the run carries on.
//!
//! * [`CallError`], [`MalformedResponse`], [`RenderError`]: what the three
//!   external collaborators report. The worker pool classifies them into
//!   retries or a [`FailureReason`].

use crate::unit::UnitKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the lexiscan library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Source errors ─────────────────────────────────────────────────────
    /// Source document was not found at the given path.
    #[error("Source document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The PDF could not be opened by the rendering backend.
    #[error("Source document '{path}' could not be opened: {detail}")]
    SourceUnreadable { path: PathBuf, detail: String },

    /// The requested page range selects no page of the document.
    #[error("Page range {start}-{end} selects no pages (document has {total} pages)")]
    EmptyPageRange { start: usize, end: usize, total: usize },

    /// The segmentation strategy needs text but the renderer produced an image.
    #[error("Page {page}: segmentation needs a text payload, renderer returned {found}")]
    TextPayloadRequired { page: usize, found: &'static str },

    /// Rendering the whole-run text for segmentation failed.
    #[error("Text extraction failed for page {page}: {detail}")]
    TextExtractionFailed { page: usize, detail: String },

    // ── Inference setup errors ────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The provider refused a call outright (bad credentials, unknown model).
    /// Every other unit would be refused the same way, so the run stops.
    #[error("LLM provider rejected unit {key}: {detail}\nCheck the API key and model name.")]
    InferenceRejected { key: UnitKey, detail: String },

    // ── Checkpoint / output errors ────────────────────────────────────────
    /// The checkpoint exists but cannot be decoded.
    #[error("Checkpoint '{path}' is unreadable: {detail}\nRe-run with --fresh to discard it.")]
    CheckpointCorrupt { path: PathBuf, detail: String },

    /// Writing the checkpoint failed; the previous durable checkpoint is intact.
    #[error("Failed to write checkpoint '{path}': {source}")]
    CheckpointWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output file already exists and overwriting was not requested.
    #[error("Output file already exists: '{path}'\nUse --force to overwrite it.")]
    OutputExists { path: PathBuf },

    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The correction table could not be loaded.
    #[error("Failed to load correction table '{path}': {detail}")]
    CorrectionTableInvalid { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or place libpdfium next to the binary.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure reported by an [`crate::pipeline::llm::InferenceClient`].
///
/// Every variant except [`CallError::Rejected`] is retried with backoff until
/// the unit's retry budget runs out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// HTTP 429 or provider-specific quota signal.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other error returned by the service (5xx, overloaded, network).
    #[error("service error: {0}")]
    ServiceError(String),

    /// The call did not complete within the per-call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Permanent refusal: authentication, unknown model, invalid request.
    /// Never retried; aborts the run.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl CallError {
    /// Worth another call after a backoff.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CallError::Rejected(_))
    }
}

/// The inference service answered, but the text could not be turned into records.
///
/// Parsing is deterministic, so this is never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed response: {0}")]
pub struct MalformedResponse(pub String);

/// A single page could not be rendered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Page {page}: rendering failed: {detail}")]
pub struct RenderError {
    pub page: usize,
    pub detail: String,
}

/// Why a unit finished without records.
///
/// Stored in the checkpoint and surfaced in the run summary, so it is
/// serialisable and carries only owned data.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The service kept rate limiting until the retry budget ran out.
    #[error("rate limited on all {attempts} attempts")]
    RateLimitedExhausted { attempts: u32 },

    /// Every attempt timed out.
    #[error("timed out on all {attempts} attempts")]
    TimeoutExhausted { attempts: u32 },

    /// Service errors until the retry budget ran out.
    #[error("service error after {attempts} attempts: {detail}")]
    ServiceErrorExhausted { attempts: u32, detail: String },

    /// The response could not be parsed.
    #[error("malformed response: {detail}")]
    Malformed { detail: String },

    /// The page could not be rendered into a payload.
    #[error("render failed: {detail}")]
    RenderFailed { detail: String },
}

impl FailureReason {
    /// Short machine-readable label, used in summaries and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::RateLimitedExhausted { .. } => "rate_limited_exhausted",
            FailureReason::TimeoutExhausted { .. } => "timeout_exhausted",
            FailureReason::ServiceErrorExhausted { .. } => "service_error_exhausted",
            FailureReason::Malformed { .. } => "malformed",
            FailureReason::RenderFailed { .. } => "render_failed",
        }
    }
}

/// One failed unit as listed in the checkpoint and the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub key: UnitKey,
    pub reason: FailureReason,
}
