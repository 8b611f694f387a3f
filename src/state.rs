use std::collections::HashMap;

use chrono::{DateTime, Local};

use crate::types::{ChatId, FetchResult};

/// Last successful fetch per chat, kept for the lifetime of a scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerState {
    last_fetch: HashMap<ChatId, DateTime<Local>>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// When the chat was last fetched successfully, if ever.
    pub fn last_fetch(&self, chat_id: &ChatId) -> Option<DateTime<Local>> {
        self.last_fetch.get(chat_id).copied()
    }

    /// Record a successful fetch.
    pub fn record_fetch(&mut self, chat_id: &ChatId, at: DateTime<Local>) {
        self.last_fetch.insert(chat_id.clone(), at);
    }

    /// Whether `result` holds anything newer than the previous fetch of the
    /// chat. Advisory only; a chat never fetched before always counts as new.
    pub fn has_new_messages(&self, chat_id: &ChatId, result: &FetchResult) -> bool {
        let Some(newest) = result.newest_timestamp() else {
            return false;
        };

        match self.last_fetch(chat_id) {
            Some(previous) => newest > previous.timestamp(),
            None => true,
        }
    }
}
