//! Writer backend trait for bar records
//!
//! Appending only serializes into memory; nothing reaches storage until `flush`.
//! Keeping the two steps apart lets the caller tell an unencodable record (the bar
//! is not exported) from a failed disk append (the bar is exported, its line waits
//! in the buffer for the next flush).

use super::record::BarRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait RecordWriterBackend: Send {
    /// Serialize one record into the pending buffer
    fn append(&mut self, record: &BarRecord) -> Result<(), WriterError>;

    /// Buffer has reached its flush threshold
    fn should_flush(&self) -> bool;

    /// Write pending lines to storage, returning how many were written.
    /// Lines that could not be written stay pending.
    fn flush(&mut self) -> Result<usize, WriterError>;

    /// Lines appended but not yet written
    fn pending(&self) -> usize;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}
