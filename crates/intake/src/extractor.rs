use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Unsupported file type: '{0}'")]
    Unsupported(String),
    #[error("File is not valid UTF-8 text")]
    NotText,
    #[error("Extraction engine error: {0}")]
    Engine(String),
}

/// Turns stored file bytes (statement PDFs, screenshots) into text for the
/// parser. OCR and PDF engines plug in behind this trait.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], extension: &str) -> Result<String, ExtractError>;
}

impl<T: TextExtractor + ?Sized> TextExtractor for Box<T> {
    fn extract(&self, bytes: &[u8], extension: &str) -> Result<String, ExtractError> {
        (**self).extract(bytes, extension)
    }
}

/// Accepts files that are already text (exported statements, saved
/// messages). Anything else needs a real engine.
pub struct Utf8TextExtractor;

const TEXT_EXTENSIONS: &[&str] = &["txt", "text", "csv", "eml", "msg"];

impl TextExtractor for Utf8TextExtractor {
    fn extract(&self, bytes: &[u8], extension: &str) -> Result<String, ExtractError> {
        let ext = extension.trim_start_matches('.').to_lowercase();
        if !TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ExtractError::Unsupported(ext));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::NotText)
    }
}

/// Returns a pre-set string, or a pre-set failure.
pub struct MockExtractor {
    result: Result<String, String>,
}

impl MockExtractor {
    pub fn new(text: impl Into<String>) -> Self {
        Self { result: Ok(text.into()) }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self { result: Err(message.into()) }
    }
}

impl TextExtractor for MockExtractor {
    fn extract(&self, _bytes: &[u8], _extension: &str) -> Result<String, ExtractError> {
        self.result.clone().map_err(ExtractError::Engine)
    }
}
