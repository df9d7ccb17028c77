//! Page rendering: turn a 1-indexed page into a [`Payload`] via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is CPU-heavy. Every pdfium call runs under
//! `tokio::task::spawn_blocking` so the producer never stalls the runtime's
//! worker threads while the inference calls are in flight.
//!
//! ## Why reopen the document per page?
//!
//! A `PdfDocument` borrows its `Pdfium` binding, so it cannot be parked in a
//! struct shared across tasks. Opening is cheap next to rasterisation, and
//! rendering one page at a time keeps at most one bitmap alive per call.

use crate::error::{ExtractError, RenderError};
use crate::pipeline::encode;
use crate::unit::Payload;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Renders pages of the source document.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Number of pages in the source document.
    fn page_count(&self) -> usize;

    /// Render a 1-indexed page.
    async fn render(&self, page: usize) -> Result<Payload, RenderError>;
}

/// What the pdfium renderer produces for each page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Rasterised PNG, for vision prompts.
    Image,
    /// The page's text layer, for segmentation.
    Text,
}

/// [`PageRenderer`] backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    path: PathBuf,
    mode: RenderMode,
    max_pixels: u32,
    page_count: usize,
}

impl PdfiumRenderer {
    /// Open `path` and read its page count.
    ///
    /// Fails with a setup error when pdfium cannot be bound or the document
    /// cannot be loaded, before any unit is dispatched.
    pub async fn open(
        path: &Path,
        mode: RenderMode,
        max_pixels: u32,
    ) -> Result<Self, ExtractError> {
        let owned = path.to_path_buf();
        let page_count = tokio::task::spawn_blocking(move || count_pages_blocking(&owned))
            .await
            .map_err(|e| ExtractError::Internal(format!("Page count task panicked: {}", e)))??;

        info!("Source loaded: {} pages ({:?} mode)", page_count, mode);

        Ok(Self {
            path: path.to_path_buf(),
            mode,
            max_pixels,
            page_count,
        })
    }
}

#[async_trait]
impl PageRenderer for PdfiumRenderer {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn render(&self, page: usize) -> Result<Payload, RenderError> {
        if page == 0 || page > self.page_count {
            return Err(RenderError {
                page,
                detail: format!("out of range (document has {} pages)", self.page_count),
            });
        }

        let path = self.path.clone();
        let mode = self.mode;
        let max_pixels = self.max_pixels;

        tokio::task::spawn_blocking(move || render_page_blocking(&path, page, mode, max_pixels))
            .await
            .map_err(|e| RenderError {
                page,
                detail: format!("render task panicked: {}", e),
            })?
    }
}

/// Bind to pdfium: `PDFIUM_LIB_PATH`, then the working directory, then the system.
fn bind_pdfium() -> Result<Pdfium, String> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&"./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| format!("{:?}", e))?;

    Ok(Pdfium::new(bindings))
}

fn count_pages_blocking(path: &Path) -> Result<usize, ExtractError> {
    let pdfium = bind_pdfium().map_err(ExtractError::PdfiumBindingFailed)?;
    let document =
        pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| ExtractError::SourceUnreadable {
                path: path.to_path_buf(),
                detail: format!("{:?}", e),
            })?;
    Ok(document.pages().len() as usize)
}

fn render_page_blocking(
    path: &Path,
    page: usize,
    mode: RenderMode,
    max_pixels: u32,
) -> Result<Payload, RenderError> {
    let fail = |detail: String| RenderError { page, detail };

    let pdfium = bind_pdfium().map_err(fail)?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| fail(format!("{:?}", e)))?;
    let pages = document.pages();
    let pdf_page = pages
        .get((page - 1) as u16)
        .map_err(|e| fail(format!("{:?}", e)))?;

    match mode {
        RenderMode::Text => {
            let text = pdf_page
                .text()
                .map_err(|e| fail(format!("{:?}", e)))?
                .all();
            debug!("Page {}: {} chars of text", page, text.len());
            Ok(Payload::Text(text))
        }
        RenderMode::Image => {
            let render_config = PdfRenderConfig::new()
                .set_target_width(max_pixels as i32)
                .set_maximum_height(max_pixels as i32);
            let bitmap = pdf_page
                .render_with_config(&render_config)
                .map_err(|e| fail(format!("{:?}", e)))?;
            let image = bitmap.as_image();
            debug!(
                "Page {}: rendered {}x{} px",
                page,
                image.width(),
                image.height()
            );
            let bytes = encode::encode_png(&image).map_err(|e| fail(e.to_string()))?;
            Ok(Payload::Image {
                bytes,
                mime: encode::PNG_MIME.to_string(),
            })
        }
    }
}
