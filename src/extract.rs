//! High-level entry points: wire pdfium, the LLM provider and the parser
//! into a [`Pipeline`] and run it.
//!
//! Use [`Pipeline`] directly to plug in a different renderer, inference
//! client or parser.

use crate::config::{ExtractionConfig, UnitStrategy};
use crate::driver::{Pipeline, RunPaths};
use crate::error::ExtractError;
use crate::output::RunReport;
use crate::pipeline::llm::{self, LlmInferenceClient};
use crate::pipeline::parse::parser_for;
use crate::pipeline::producer::{PageProducer, SegmentProducer, UnitProducer};
use crate::pipeline::render::{PageRenderer, PdfiumRenderer, RenderMode};
use crate::pipeline::source;
use crate::prompts;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Extract records from `source` into `output`, resuming from the
/// checkpoint next to `output` when one exists.
///
/// # Returns
/// `Ok(RunReport)` once the output is written, even if some units failed
/// (check `report.summary.failed`).
///
/// # Errors
/// Returns `Err(ExtractError)` only for fatal errors:
/// - source missing, unreadable or not a PDF
/// - no LLM provider configured
/// - checkpoint or output I/O failures
pub async fn extract(
    source: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<RunReport, ExtractError> {
    extract_with_paths(source, &RunPaths::for_output(output.as_ref()), config).await
}

/// [`extract`] with an explicit checkpoint location.
pub async fn extract_with_paths(
    source: impl AsRef<Path>,
    paths: &RunPaths,
    config: &ExtractionConfig,
) -> Result<RunReport, ExtractError> {
    let source = source::validate_source(source.as_ref())?;
    info!("Extracting {} → {}", source.display(), paths.output.display());

    // Fail on a missing API key before spending time on pdfium.
    let provider = llm::resolve_provider(config)?;

    let mode = match config.strategy {
        UnitStrategy::Pages => RenderMode::Image,
        UnitStrategy::Segments => RenderMode::Text,
    };
    let renderer: Arc<dyn PageRenderer> =
        Arc::new(PdfiumRenderer::open(&source, mode, config.max_rendered_pixels).await?);

    let instruction = config
        .instruction
        .clone()
        .unwrap_or_else(|| prompts::default_instruction(config.strategy, config.schema).to_string());

    let producer: Arc<dyn UnitProducer> = match config.strategy {
        UnitStrategy::Pages => Arc::new(PageProducer::new(renderer, config.pages, instruction)),
        UnitStrategy::Segments => {
            Arc::new(SegmentProducer::new(renderer, config.pages, instruction))
        }
    };

    let pipeline = Pipeline::new(
        config.clone(),
        producer,
        Arc::new(LlmInferenceClient::new(provider, config)),
        parser_for(config.schema),
    );
    pipeline.run(paths).await
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    source: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<RunReport, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(source, output, config))
}

/// Page count of a source document.
///
/// Does not require an LLM provider or API key.
pub async fn page_count(source: impl AsRef<Path>) -> Result<usize, ExtractError> {
    let source = source::validate_source(source.as_ref())?;
    let renderer = PdfiumRenderer::open(&source, RenderMode::Text, 0).await?;
    Ok(renderer.page_count())
}
