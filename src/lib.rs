//! waha-harvester: scheduled message retrieval from a WAHA gateway.
//!
//! Polls the gateway for configured chats inside an active-hours window,
//! writes every fetch to a timestamped JSON file, and flattens exported
//! message and chat records for downstream use.
//!
//! ## Modules
//!
//! - `types` - Chat ids, messages and fetch results
//! - `client` - Blocking gateway client and the `MessageSource` seam
//! - `mock` - Synthetic messages for use without a live session
//! - `store` - Result files and JSON array appends
//! - `config` - Configuration file handling
//! - `scheduler` - Fetch cycles, interval loop and retry
//! - `projection` - Message/chat flattening and contact enrichment
//! - `query` - Search, filters and statistics over the output directory

pub mod projection;
pub mod query;
pub mod store;
pub mod types;

mod client;
mod config;
mod mock;
mod scheduler;
mod state;

pub use client::{
    classify_status, ClientError, ConnectionReport, FetchRequest, GatewayClient, MessageSource,
};
pub use config::{
    ActiveHours, ChatTarget, ConfigError, ConfigStore, GatewaySettings, HarvesterConfig,
    ScheduleConfig, SortOrder, DEFAULT_BASE_URL, DEFAULT_CHAT_ID,
};
pub use mock::{MockSource, MAX_MOCK_MESSAGES};
pub use scheduler::{fetch_with_retry, CycleReport, HarvestError, Scheduler};
pub use state::SchedulerState;

pub use store::{FileSink, MemorySink, ResultSink, StoreError};
pub use types::{ChatId, FetchResult, Message};
