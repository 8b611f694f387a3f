//! Timestamped JSON files, one per fetch.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::SecondsFormat;
use log::info;
use serde::Serialize;

use crate::store::{ResultSink, StoreResult};
use crate::types::{ChatId, FetchResult, Message};

#[derive(Debug, Serialize)]
struct OutputDocument<'a> {
    metadata: OutputMetadata,
    messages: &'a [Message],
}

#[derive(Debug, Serialize)]
struct OutputMetadata {
    chat_id: String,
    retrieved_at: String,
    total_messages: usize,
    api_response: ApiResponseInfo,
}

#[derive(Debug, Serialize)]
struct ApiResponseInfo {
    status: &'static str,
    timestamp: String,
    mock: bool,
}

/// `waha_messages_{chat}_{YYYYmmdd_HHMMSS}.json`
pub fn output_file_name(chat_id: &ChatId, result: &FetchResult) -> String {
    format!(
        "waha_messages_{}_{}.json",
        chat_id.sanitized(),
        result.retrieved_at.format("%Y%m%d_%H%M%S")
    )
}

/// Writes each fetch result to its own file under `output_dir`.
#[derive(Debug, Clone)]
pub struct FileSink {
    output_dir: PathBuf,
}

impl FileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write one result file. An existing file of the same name is replaced.
    pub fn write(&self, chat_id: &ChatId, result: &FetchResult) -> StoreResult<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;

        let retrieved_at = result.retrieved_at.to_rfc3339_opts(SecondsFormat::Micros, false);
        let document = OutputDocument {
            metadata: OutputMetadata {
                chat_id: chat_id.to_string(),
                retrieved_at: retrieved_at.clone(),
                total_messages: result.messages.len(),
                api_response: ApiResponseInfo {
                    status: "success",
                    timestamp: retrieved_at,
                    mock: result.mock,
                },
            },
            messages: &result.messages,
        };

        let path = self.output_dir.join(output_file_name(chat_id, result));
        fs::write(&path, serde_json::to_string_pretty(&document)?)?;
        info!("saved {} messages to {}", result.messages.len(), path.display());
        Ok(path)
    }
}

impl ResultSink for FileSink {
    fn persist(&mut self, chat_id: &ChatId, result: &FetchResult) -> StoreResult<PathBuf> {
        self.write(chat_id, result)
    }
}
