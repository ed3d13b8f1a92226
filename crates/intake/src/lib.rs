pub mod extractor;
pub mod hash;
pub mod pipeline;
pub mod store;

pub use extractor::{ExtractError, MockExtractor, TextExtractor, Utf8TextExtractor};
pub use hash::{sha256_bytes, sha256_hex, to_hex};
pub use pipeline::{FileIntake, IntakeError, IntakeResult};
pub use store::{FileStore, LocalFileStore};
