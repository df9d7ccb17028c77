//! Configuration types for an extraction run.
//!
//! Every knob lives in [`ExtractionConfig`], built via
//! [`ExtractionConfigBuilder`]. One struct is easy to clone into the worker
//! futures, print in debug logs, and diff between two runs.

use crate::assemble::CorrectionTable;
use crate::error::ExtractError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one extraction run.
///
/// # Example
/// ```rust
/// use lexiscan::{ExtractionConfig, PageRange};
///
/// let config = ExtractionConfig::builder()
///     .pages(PageRange::new(85, 98))
///     .workers(5)
///     .max_retries(5)
///     .build()
///     .unwrap();
/// assert_eq!(config.channel_capacity(), 10);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Pages to process (1-indexed, inclusive). Default: the whole document.
    pub pages: PageRange,

    /// How the source is cut into work units. Default: one unit per page.
    pub strategy: UnitStrategy,

    /// Shape of the records the service is asked to return.
    pub schema: RecordSchema,

    /// Number of concurrent inference calls. Default: 5.
    ///
    /// Rate limits, not CPU, bound throughput here. Lower this if the run
    /// spends most of its time in rate-limit backoff.
    pub workers: usize,

    /// Capacity of the queue between the producer and the workers.
    /// Default: `2 × workers`.
    pub channel_capacity: Option<usize>,

    /// Retry budget per unit for transient failures. Default: 5.
    ///
    /// A unit is called at most `max_retries` times; the failure that uses up
    /// the budget marks the unit failed without a further wait.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds. Default: 30 000.
    ///
    /// The `i`-th wait (0-based) is `retry_backoff_ms × 2^i`: 30 s, 60 s,
    /// 120 s, 240 s with the defaults.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds, independent of backoff. Default: 300.
    pub call_timeout_secs: u64,

    /// Flush the checkpoint every N completed units. Default: 5.
    pub checkpoint_every: usize,

    /// Discard any existing checkpoint and start cold. Default: false.
    pub fresh: bool,

    /// Re-queue units recorded as failed in the checkpoint. Default: false.
    pub retry_failed: bool,

    /// Overwrite an existing output file. Default: false.
    pub overwrite: bool,

    /// LLM model identifier. If None, the provider default is used.
    pub model: Option<String>,

    /// LLM provider name (e.g. "anthropic", "openai").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0 (transcription, not creativity).
    pub temperature: f32,

    /// Maximum tokens per response. Default: 16 384.
    ///
    /// Dense dictionary pages list 20+ entries with examples; a low cap
    /// truncates the JSON array mid-entry and the unit fails as malformed.
    pub max_tokens: usize,

    /// Longest edge of a rendered page image in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Custom instruction. If None, the default for (strategy, schema) is used.
    pub instruction: Option<String>,

    /// Progress events receiver.
    pub progress_callback: Option<ProgressCallback>,

    /// Literal-text corrections applied by the assembler.
    pub corrections: CorrectionTable,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            pages: PageRange::default(),
            strategy: UnitStrategy::default(),
            schema: RecordSchema::default(),
            workers: 5,
            channel_capacity: None,
            max_retries: 5,
            retry_backoff_ms: 30_000,
            call_timeout_secs: 300,
            checkpoint_every: 5,
            fresh: false,
            retry_failed: false,
            overwrite: false,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 16_384,
            max_rendered_pixels: 2000,
            instruction: None,
            progress_callback: None,
            corrections: CorrectionTable::default(),
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("pages", &self.pages)
            .field("strategy", &self.strategy)
            .field("schema", &self.schema)
            .field("workers", &self.workers)
            .field("channel_capacity", &self.channel_capacity())
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("checkpoint_every", &self.checkpoint_every)
            .field("fresh", &self.fresh)
            .field("retry_failed", &self.retry_failed)
            .field("overwrite", &self.overwrite)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("corrections", &self.corrections.len())
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Effective queue capacity.
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(self.workers * 2).max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_millis(self.retry_backoff_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn pages(mut self, pages: PageRange) -> Self {
        self.config.pages = pages;
        self
    }

    pub fn strategy(mut self, strategy: UnitStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn schema(mut self, schema: RecordSchema) -> Self {
        self.config.schema = schema;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn channel_capacity(mut self, n: usize) -> Self {
        self.config.channel_capacity = Some(n.max(1));
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.call_timeout_secs = secs.max(1);
        self
    }

    pub fn checkpoint_every(mut self, n: usize) -> Self {
        self.config.checkpoint_every = n.max(1);
        self
    }

    pub fn fresh(mut self, v: bool) -> Self {
        self.config.fresh = v;
        self
    }

    pub fn retry_failed(mut self, v: bool) -> Self {
        self.config.retry_failed = v;
        self
    }

    pub fn overwrite(mut self, v: bool) -> Self {
        self.config.overwrite = v;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.instruction = Some(instruction.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn corrections(mut self, table: CorrectionTable) -> Self {
        self.config.corrections = table;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.pages.start == 0 {
            return Err(ExtractError::InvalidConfig(
                "Pages are 1-indexed, start must be ≥ 1".into(),
            ));
        }
        if let Some(end) = c.pages.end {
            if end < c.pages.start {
                return Err(ExtractError::InvalidConfig(format!(
                    "Page range {}-{}: start must be <= end",
                    c.pages.start, end
                )));
            }
        }
        if c.workers == 0 {
            return Err(ExtractError::InvalidConfig("Workers must be ≥ 1".into()));
        }
        if c.max_tokens == 0 {
            return Err(ExtractError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

/// Retry and timeout settings handed to each worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of calls per unit.
    pub max_retries: u32,
    pub base: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// Wait after the `failure`-th (0-based) transient failure.
    pub fn backoff(&self, failure: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(failure))
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Contiguous, 1-indexed, inclusive page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    /// `None` means "to the last page".
    pub end: Option<usize>,
}

impl Default for PageRange {
    fn default() -> Self {
        Self {
            start: 1,
            end: None,
        }
    }
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn starting_at(start: usize) -> Self {
        Self { start, end: None }
    }

    /// Expand into 1-indexed page numbers, clipped to `total_pages`.
    pub fn to_pages(&self, total_pages: usize) -> Vec<usize> {
        let start = self.start.max(1);
        let end = self.end.unwrap_or(total_pages).min(total_pages);
        (start..=end).collect()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-end", self.start),
        }
    }
}

/// How the source document is cut into work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnitStrategy {
    /// One unit per page; payload is the rendered page image. (default)
    #[default]
    Pages,
    /// One unit per headword-delimited chunk of the pages' text layer.
    Segments,
}

/// Shape of the records requested from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordSchema {
    /// A JSON array of dictionary entries. (default)
    #[default]
    DictionaryEntries,
    /// A JSON object with `words`, `suffixes` and `prefixes` arrays.
    Vocabulary,
}
