//! # lexiscan
//!
//! Extract structured dictionary entries and vocabulary from scanned books
//! using a multimodal LLM, concurrently and resumably.
//!
//! ## Why this crate?
//!
//! A 500-page bilingual dictionary takes hours of model calls. Rate limits
//! hit mid-run, processes get killed, and a page the model misreads must not
//! take the whole run down with it. This crate splits the book into work
//! units (whole pages, or entry-sized text chunks), runs a bounded pool of
//! concurrent calls with retry and backoff, and checkpoints progress
//! atomically so an interrupted run resumes where it stopped.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Source   validate the document (%PDF magic, permissions)
//!  ├─ 2. Plan     page keys, or text-layer segments keyed (page, chunk)
//!  ├─ 3. Produce  render on demand into a bounded channel (backpressure)
//!  ├─ 4. Workers  W concurrent calls, timeout + exponential backoff
//!  ├─ 5. Collect  fold results into the checkpoint, flush every K units
//!  └─ 6. Output   sort by key, apply corrections, write JSON atomically
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lexiscan::{extract, ExtractionConfig, PageRange};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from ANTHROPIC_API_KEY / OPENAI_API_KEY / ...
//!     let config = ExtractionConfig::builder()
//!         .pages(PageRange::new(21, 549))
//!         .workers(5)
//!         .build()?;
//!     let report = extract("dictionary.pdf", "entries.json", &config).await?;
//!     eprintln!(
//!         "{} records, {} failed units",
//!         report.summary.total_records,
//!         report.summary.failed.len()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Resuming
//!
//! Progress is kept in `<output>.progress.json` next to the output. Re-run
//! the same command after an interruption and only the missing units are
//! dispatched. Pass `fresh(true)` to start over, `retry_failed(true)` to
//! also re-dispatch units that failed before the interruption. A completed
//! run removes its checkpoint.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `lexiscan` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assemble;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod unit;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use assemble::{Correction, CorrectionTable};
pub use config::{
    ExtractionConfig, ExtractionConfigBuilder, PageRange, RecordSchema, RetryPolicy, UnitStrategy,
};
pub use driver::{Pipeline, RunPaths, RunState};
pub use error::{CallError, ExtractError, FailedUnit, FailureReason, MalformedResponse, RenderError};
pub use extract::{extract, extract_sync, extract_with_paths, page_count};
pub use output::{RunOutcome, RunReport, RunSummary};
pub use pipeline::llm::InferenceClient;
pub use pipeline::parse::ResponseParser;
pub use pipeline::producer::{Dispatch, UnitProducer};
pub use pipeline::render::PageRenderer;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use unit::{Payload, Record, UnitKey, UnitResult, UnitStatus, WorkUnit};
