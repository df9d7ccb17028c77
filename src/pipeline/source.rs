//! Source validation: fail fast on a missing, unreadable or non-PDF input.
//!
//! pdfium reports a bad file as an opaque load error deep inside a blocking
//! task. Checking existence, permissions and the `%PDF` magic up front gives
//! the caller an actionable setup error before anything is dispatched.

use crate::error::ExtractError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Validate a local source document and return its path.
pub fn validate_source(path: &Path) -> Result<PathBuf, ExtractError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(ExtractError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(ExtractError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExtractError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(ExtractError::FileNotFound { path });
        }
    }

    debug!("Validated source: {}", path.display());
    Ok(path)
}
