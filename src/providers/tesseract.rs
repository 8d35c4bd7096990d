//! Tesseract CLI wrapper used for the last-resort OCR stage.
//!
//! The prompt is ignored: Tesseract only reads pixels. The output is plain
//! text which the pipeline turns into a low-confidence candidate.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{ExtractionProvider, PromptSpec, ProviderError, ProviderKind};

pub const BINARY_ENV: &str = "TESSERACT_BIN";
pub const DEFAULT_BINARY: &str = "tesseract";

/// Page segmentation mode 6: assume a single uniform block of text.
/// Receipts are one column, so this beats the automatic layout analysis.
const PAGE_SEG_MODE: &str = "6";

pub struct TesseractProvider {
    binary: PathBuf,
    language: String,
}

impl TesseractProvider {
    pub fn new(binary: impl Into<PathBuf>, language: &str) -> Self {
        Self {
            binary: binary.into(),
            language: language.to_string(),
        }
    }

    pub fn from_env() -> Self {
        let binary = std::env::var(BINARY_ENV).unwrap_or_else(|_| DEFAULT_BINARY.to_string());
        Self::new(binary, "eng")
    }
}

#[async_trait]
impl ExtractionProvider for TesseractProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Tesseract
    }

    async fn extract(&self, image_png: &[u8], _prompt: &PromptSpec) -> Result<String, ProviderError> {
        let mut input = tempfile::Builder::new()
            .prefix("receipt-ocr-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| ProviderError::Ocr(format!("Failed to create temp image: {e}")))?;
        input
            .write_all(image_png)
            .and_then(|_| input.flush())
            .map_err(|e| ProviderError::Ocr(format!("Failed to write temp image: {e}")))?;

        let output = tokio::process::Command::new(&self.binary)
            .arg(input.path())
            .arg("stdout")
            .args(["-l", &self.language, "--psm", PAGE_SEG_MODE])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Ocr(format!("{}: {e}", self.binary.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Ocr(stderr.trim().to_string()));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            return Err(ProviderError::Ocr("OCR produced no text".into()));
        }

        tracing::debug!(chars = text.len(), "Tesseract OCR complete");
        Ok(text)
    }
}
