//! Utility modules.

pub mod file;
pub mod retry;
pub mod text;

pub use file::{calculate_checksum, calculate_file_checksum, read_document_text};
pub use retry::{RetryConfig, Retryable, with_retry};
