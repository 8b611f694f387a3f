//! Store traits for fetch result persistence.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ChatId, FetchResult};

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize output: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Destination for fetch results.
pub trait ResultSink {
    /// Persist one fetch result and return where it went.
    fn persist(&mut self, chat_id: &ChatId, result: &FetchResult) -> StoreResult<PathBuf>;
}
