//! In-memory sink for dry runs and testing.

use std::path::PathBuf;

use crate::store::{file::output_file_name, ResultSink, StoreResult};
use crate::types::{ChatId, FetchResult};

/// Keeps every persisted result instead of writing files.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Vec<(ChatId, FetchResult)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> &[(ChatId, FetchResult)] {
        &self.results
    }
}

impl ResultSink for MemorySink {
    fn persist(&mut self, chat_id: &ChatId, result: &FetchResult) -> StoreResult<PathBuf> {
        self.results.push((chat_id.clone(), result.clone()));
        Ok(PathBuf::from(output_file_name(chat_id, result)))
    }
}
