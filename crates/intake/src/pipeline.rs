use std::path::PathBuf;
use thiserror::Error;

use crate::extractor::{ExtractError, TextExtractor};
use crate::hash;
use crate::store::FileStore;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Text extraction failed: {0}")]
    Extract(#[from] ExtractError),
}

/// Outcome of taking in one uploaded file.
#[derive(Debug)]
pub struct IntakeResult {
    /// SHA-256 hex digest of the file bytes.
    pub hash_hex: String,
    pub stored_path: PathBuf,
    /// Extracted text, or why extraction failed. A failed extraction still
    /// leaves the file stored so it can be reprocessed later.
    pub text: Result<String, String>,
}

/// Orchestrates: hash → content-store → extract.
pub struct FileIntake<S: FileStore, E: TextExtractor> {
    store: S,
    extractor: E,
}

impl<S: FileStore, E: TextExtractor> FileIntake<S, E> {
    pub fn new(store: S, extractor: E) -> Self {
        Self { store, extractor }
    }

    pub async fn process_bytes(&self, data: &[u8], ext: &str) -> Result<IntakeResult, IntakeError> {
        let hash_hex = hash::sha256_hex(data);
        let ext = normalize_ext(ext);
        let stored_path = self.store.store(&hash_hex, &ext, data).await?;

        let text = match self.extractor.extract(data, &ext) {
            Ok(text) => Ok(text),
            Err(e) => {
                tracing::warn!(hash = %hash_hex, "text extraction failed: {e}");
                Err(e.to_string())
            }
        };

        Ok(IntakeResult {
            hash_hex,
            stored_path,
            text,
        })
    }

    /// Reads a previously stored file back and extracts its text again.
    pub async fn reextract(&self, stored_path: &std::path::Path) -> Result<String, IntakeError> {
        let data = self.store.retrieve(stored_path).await?;
        let ext = stored_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        Ok(self.extractor.extract(&data, ext)?)
    }
}

fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim().trim_start_matches('.').to_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        "bin".to_string()
    } else {
        ext
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{MockExtractor, Utf8TextExtractor};
    use crate::store::LocalFileStore;

    #[tokio::test]
    async fn process_bytes_stores_and_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let intake = FileIntake::new(LocalFileStore::new(dir.path()), Utf8TextExtractor);
        let data = b"15/01/2024 CARREFOUR AED 120.50";

        let result = intake.process_bytes(data, ".TXT").await.unwrap();
        assert_eq!(result.hash_hex, hash::sha256_hex(data));
        assert!(result.stored_path.exists());
        assert_eq!(result.text.as_deref(), Ok("15/01/2024 CARREFOUR AED 120.50"));

        let again = intake.reextract(&result.stored_path).await.unwrap();
        assert_eq!(again, "15/01/2024 CARREFOUR AED 120.50");
    }

    #[tokio::test]
    async fn extraction_failure_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let intake = FileIntake::new(LocalFileStore::new(dir.path()), MockExtractor::failing("blurry"));
        let result = intake.process_bytes(b"\x89PNG", "png").await.unwrap();
        assert!(result.stored_path.exists());
        assert!(result.text.is_err());
    }

    #[test]
    fn odd_extensions_become_bin() {
        assert_eq!(normalize_ext(""), "bin");
        assert_eq!(normalize_ext("../x"), "bin");
        assert_eq!(normalize_ext("PDF"), "pdf");
    }
}
