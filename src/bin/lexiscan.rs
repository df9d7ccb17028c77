//! CLI binary for lexiscan.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig`, renders progress, and prints a run summary.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use lexiscan::{
    extract_with_paths, page_count, CorrectionTable, ExtractionConfig, ExtractionProgressCallback,
    FailureReason, PageRange, ProgressCallback, RecordSchema, RunPaths, RunState, RunSummary,
    UnitKey, UnitStrategy,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished unit. Units finish out
/// of order, so per-unit timing is keyed by unit.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<UnitKey, Instant>>,
    failures: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening source…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            failures: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, key: UnitKey) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&key))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_units: usize, already_done: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} units  \
             ⏱ {elapsed_precise}  ETA {eta_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_units as u64);
        self.bar.set_position(already_done as u64);
        self.bar.set_style(style);
        self.bar.set_message("");
        self.bar.reset_eta();

        let resumed = if already_done > 0 {
            format!(" ({already_done} resumed from checkpoint)")
        } else {
            String::new()
        };
        self.bar.println(format!(
            "{} {}{}",
            cyan("◆"),
            bold(&format!("{total_units} units"),),
            dim(&resumed)
        ));
    }

    fn on_state_change(&self, _from: RunState, to: RunState) {
        let prefix = match to {
            RunState::Loading => "Loading",
            RunState::Running => "Extracting",
            RunState::Draining => "Draining",
            RunState::Finalizing => "Writing",
            _ => return,
        };
        self.bar.set_prefix(prefix);
    }

    fn on_unit_start(&self, key: UnitKey) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(key, Instant::now());
        }
    }

    fn on_retry(&self, key: UnitKey, attempt: u32, wait: Duration, error: &str) {
        let msg: String = error.chars().take(60).collect();
        self.bar.println(format!(
            "  {} {:<8} attempt {} failed: {}  {}",
            yellow("↻"),
            key.to_string(),
            attempt,
            msg,
            dim(&format!("retry in {:.0}s", wait.as_secs_f64())),
        ));
    }

    fn on_unit_complete(&self, key: UnitKey, records: usize) {
        let secs = self.elapsed_secs(key);
        self.bar.println(format!(
            "  {} {:<8}  {:<12}  {}",
            green("✓"),
            key.to_string(),
            dim(&format!("{records:>4} records")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_unit_failed(&self, key: UnitKey, reason: &FailureReason) {
        let secs = self.elapsed_secs(key);
        self.failures.fetch_add(1, Ordering::SeqCst);
        let msg: String = reason.to_string().chars().take(80).collect();
        self.bar.println(format!(
            "  {} {:<8}  {}  {}",
            red("✗"),
            key.to_string(),
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_checkpoint(&self, completed: usize, records: usize) {
        self.bar
            .set_message(dim(&format!("saved {completed} units / {records} records")));
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        self.bar.finish_and_clear();
        let failed = self.failures.load(Ordering::SeqCst);
        if failed == 0 {
            eprintln!(
                "{} {} units processed, {} records",
                green("✔"),
                bold(&summary.processed_units.to_string()),
                bold(&summary.total_records.to_string())
            );
        } else {
            eprintln!(
                "{} {} units processed ({} failed this run)",
                cyan("⚠"),
                bold(&summary.processed_units.to_string()),
                red(&failed.to_string())
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Dictionary pages 21-549, one vision call per page
  lexiscan dictionary.pdf -o data/entries.json --start 21 --end 549

  # Interrupted? Run the same command again to resume.
  lexiscan dictionary.pdf -o data/entries.json --start 21 --end 549

  # Resume an interrupted run, re-dispatching units that failed before it stopped
  lexiscan dictionary.pdf -o data/entries.json --retry-failed

  # Text-layer segmentation, one call per entry chunk
  lexiscan dictionary.pdf -o data/entries.json --strategy segments

  # Course vocabulary
  lexiscan course.pdf -o data/vocabulary.json --schema vocabulary

  # Fix known OCR misreadings after extraction
  lexiscan dictionary.pdf -o data/entries.json --corrections fixes.json

PROGRESS:
  Progress is saved to <output>.progress.json every --checkpoint-every units
  and removed once the output is written. Ctrl-C keeps the last save.

ENVIRONMENT VARIABLES:
  ANTHROPIC_API_KEY       Anthropic API key (preferred when set)
  OPENAI_API_KEY          OpenAI API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (anthropic, openai, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium
"#;

/// Extract structured records from scanned books using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "lexiscan",
    version,
    about = "Extract structured dictionary entries from scanned books using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Source PDF.
    input: PathBuf,

    /// Output JSON file. Defaults to the input path with a .json extension.
    #[arg(short, long, env = "LEXISCAN_OUTPUT")]
    output: Option<PathBuf>,

    /// Checkpoint file. Defaults to <output>.progress.json.
    #[arg(long, env = "LEXISCAN_CHECKPOINT")]
    checkpoint: Option<PathBuf>,

    /// First page to process (1-indexed).
    #[arg(long, env = "LEXISCAN_START", default_value_t = 1)]
    start: usize,

    /// Last page to process (inclusive). Defaults to the last page.
    #[arg(long, env = "LEXISCAN_END")]
    end: Option<usize>,

    /// How to split the document into work units.
    #[arg(long, env = "LEXISCAN_STRATEGY", value_enum, default_value = "pages")]
    strategy: StrategyArg,

    /// Shape of the records to extract.
    #[arg(long, env = "LEXISCAN_SCHEMA", value_enum, default_value = "dictionary")]
    schema: SchemaArg,

    /// Number of concurrent inference calls.
    #[arg(short, long, env = "LEXISCAN_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Work channel capacity. Defaults to twice the worker count.
    #[arg(long, env = "LEXISCAN_CHANNEL_CAPACITY")]
    channel_capacity: Option<usize>,

    /// Maximum inference calls per unit.
    #[arg(long, env = "LEXISCAN_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Base backoff in milliseconds, doubled after each failed call.
    #[arg(long, env = "LEXISCAN_RETRY_BACKOFF_MS", default_value_t = 30_000)]
    retry_backoff_ms: u64,

    /// Per-call timeout in seconds.
    #[arg(long, env = "LEXISCAN_CALL_TIMEOUT", default_value_t = 300)]
    call_timeout: u64,

    /// Flush the checkpoint after this many finished units.
    #[arg(long, env = "LEXISCAN_CHECKPOINT_EVERY", default_value_t = 5)]
    checkpoint_every: usize,

    /// Ignore and delete any existing checkpoint.
    #[arg(long)]
    fresh: bool,

    /// Overwrite an existing output file.
    #[arg(short, long)]
    force: bool,

    /// Re-dispatch units recorded as failed in the checkpoint of an
    /// interrupted run. A completed run removes its checkpoint.
    #[arg(long)]
    retry_failed: bool,

    /// LLM model ID (e.g. claude-sonnet-4-20250514, gpt-4.1).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: anthropic, openai, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Path to a text file with a custom instruction.
    #[arg(long, env = "LEXISCAN_INSTRUCTION")]
    instruction: Option<PathBuf>,

    /// Path to a JSON correction table applied to the output.
    #[arg(long, env = "LEXISCAN_CORRECTIONS")]
    corrections: Option<PathBuf>,

    /// Max LLM output tokens per unit.
    #[arg(long, env = "LEXISCAN_MAX_TOKENS", default_value_t = 16384)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "LEXISCAN_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Longest side of rendered page images, in pixels.
    #[arg(long, env = "LEXISCAN_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// Print this many records from the output after the run.
    #[arg(long, default_value_t = 3)]
    sample: usize,

    /// Print the page count only, no extraction.
    #[arg(long)]
    inspect_only: bool,

    /// Disable progress bar.
    #[arg(long, env = "LEXISCAN_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "LEXISCAN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "LEXISCAN_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Pages,
    Segments,
}

impl From<StrategyArg> for UnitStrategy {
    fn from(v: StrategyArg) -> Self {
        match v {
            StrategyArg::Pages => UnitStrategy::Pages,
            StrategyArg::Segments => UnitStrategy::Segments,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SchemaArg {
    Dictionary,
    Vocabulary,
}

impl From<SchemaArg> for RecordSchema {
    fn from(v: SchemaArg) -> Self {
        match v {
            SchemaArg::Dictionary => RecordSchema::DictionaryEntries,
            SchemaArg::Vocabulary => RecordSchema::Vocabulary,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; verbose mode always wins.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let pages = page_count(&cli.input)
            .await
            .context("Failed to inspect source")?;
        println!("File:   {}", cli.input.display());
        println!("Pages:  {}", pages);
        return Ok(());
    }

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension("json"));
    let mut paths = RunPaths::for_output(&output);
    if let Some(ref checkpoint) = cli.checkpoint {
        paths = paths.with_checkpoint(checkpoint);
    }

    // ── Run, cancellable with Ctrl-C ─────────────────────────────────────
    let report = tokio::select! {
        report = extract_with_paths(&cli.input, &paths, &config) => {
            report.context("Extraction failed")?
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!(
                "\n{} Interrupted. Progress up to the last save is in {}",
                cyan("⚠"),
                bold(&paths.checkpoint.display().to_string())
            );
            std::process::exit(130);
        }
    };

    if cli.quiet {
        return Ok(());
    }

    // ── Summary ──────────────────────────────────────────────────────────
    let summary = &report.summary;
    eprintln!(
        "{}  {}/{} units ({} resumed)  {} records  {}ms  →  {}",
        if summary.failed.is_empty() {
            green("✔")
        } else {
            cyan("⚠")
        },
        summary.succeeded_units(),
        summary.total_units,
        summary.resumed_units,
        summary.total_records,
        summary.duration_ms,
        bold(&output.display().to_string()),
    );
    if report.outcome.corrections_applied > 0 {
        eprintln!(
            "   {} corrections applied",
            dim(&report.outcome.corrections_applied.to_string())
        );
    }
    if !summary.failed.is_empty() {
        eprintln!("   {} failed units:", red(&summary.failed.len().to_string()));
        for failed in &summary.failed {
            eprintln!("     {:<8} {}", failed.key.to_string(), dim(&failed.reason.to_string()));
        }
        // The checkpoint went with the completed run; --retry-failed only
        // applies to an interrupted one.
        eprintln!(
            "   {}",
            dim("Their pages produced no records. Re-run with --force to process the range again.")
        );
    }

    for record in report.outcome.records.iter().take(cli.sample) {
        let json = serde_json::to_string(&record.value).context("Failed to serialise record")?;
        let shown: String = json.chars().take(160).collect();
        eprintln!("   {} {}", dim(&record.key.to_string()), shown);
    }

    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let pages = match cli.end {
        Some(end) => PageRange::new(cli.start, end),
        None => PageRange::starting_at(cli.start),
    };

    let mut builder = ExtractionConfig::builder()
        .pages(pages)
        .strategy(cli.strategy.into())
        .schema(cli.schema.into())
        .workers(cli.workers)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .call_timeout_secs(cli.call_timeout)
        .checkpoint_every(cli.checkpoint_every)
        .fresh(cli.fresh)
        .overwrite(cli.force)
        .retry_failed(cli.retry_failed)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_rendered_pixels(cli.max_pixels);

    if let Some(n) = cli.channel_capacity {
        builder = builder.channel_capacity(n);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref path) = cli.instruction {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read instruction from {:?}", path))?;
        builder = builder.instruction(text);
    }
    if let Some(ref path) = cli.corrections {
        builder = builder.corrections(CorrectionTable::load(path)?);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
