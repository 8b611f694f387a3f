use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::NaiveTime;
use log::{error, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::ChatId;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_CHAT_ID: &str = "6282243673017@c.us";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration root must be a JSON object")]
    NotAnObject,
    #[error("failed to parse configuration: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to access configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection settings for the gateway client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Base URL of the gateway, without trailing slash.
    pub base_url: String,
    /// Basic auth user name.
    pub username: String,
    /// Basic auth password.
    pub password: String,
    /// Value sent in the `X-API-Key` header.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            username: "admin".into(),
            password: "change-me".into(),
            api_key: "change-me".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl GatewaySettings {
    /// Override the base URL. Trailing slashes are dropped.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the basic auth credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Override the API key header value.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Sort direction requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// One conversation tracked for periodic retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTarget {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl ChatTarget {
    pub fn new(chat_id: ChatId, name: impl Into<String>) -> Self {
        Self {
            chat_id,
            name: Some(name.into()),
            enabled: true,
            limit: default_limit(),
            sort_by: default_sort_by(),
            sort_order: SortOrder::Desc,
        }
    }

    /// Configured name, or the chat id when none is set.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.chat_id.to_string())
    }
}

/// Daily window during which scheduled fetching is permitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    #[serde(default = "default_window_start")]
    pub start: String,
    #[serde(default = "default_window_end")]
    pub end: String,
}

impl ActiveHours {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Parse both bounds as `HH:MM`.
    pub fn bounds(&self) -> Result<(NaiveTime, NaiveTime), chrono::ParseError> {
        let start = NaiveTime::parse_from_str(&self.start, "%H:%M")?;
        let end = NaiveTime::parse_from_str(&self.end, "%H:%M")?;
        Ok((start, end))
    }

    /// Whether `now` falls inside the window. A window whose start is after
    /// its end wraps past midnight. Unparseable bounds never block fetching.
    pub fn contains(&self, now: NaiveTime) -> bool {
        match self.bounds() {
            Ok((start, end)) if start <= end => start <= now && now <= end,
            Ok((start, end)) => now >= start || now <= end,
            Err(err) => {
                error!(
                    "invalid active hours {}-{}: {err}; treating as always active",
                    self.start, self.end
                );
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval")]
    pub interval_minutes: u64,
    /// `None`, `null` and `{}` all mean fetching is always permitted.
    #[serde(
        default,
        deserialize_with = "window_or_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub enabled_hours: Option<ActiveHours>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval(),
            enabled_hours: Some(ActiveHours::new("08:00", "22:00")),
        }
    }
}

impl ScheduleConfig {
    /// Whether fetching is permitted at `now`. No window means always.
    pub fn is_active_at(&self, now: NaiveTime) -> bool {
        self.enabled_hours
            .as_ref()
            .map(|window| window.contains(now))
            .unwrap_or(true)
    }

    /// Time between cycle starts; at least one minute.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1).saturating_mul(60))
    }
}

/// Full harvester configuration as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvesterConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub api_key: String,
    pub output_dir: String,
    pub chats: Vec<ChatTarget>,
    pub schedule: ScheduleConfig,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        let gateway = GatewaySettings::default();
        Self {
            base_url: gateway.base_url,
            username: gateway.username,
            password: gateway.password,
            api_key: gateway.api_key,
            output_dir: "output".into(),
            chats: vec![ChatTarget::new(default_chat_id(), "Primary Chat")],
            schedule: ScheduleConfig::default(),
        }
    }
}

impl HarvesterConfig {
    /// Two-target sample written by `init-config`.
    pub fn sample() -> Self {
        let mut secondary = ChatTarget::new(ChatId::user("628123456789"), "Secondary Chat");
        secondary.enabled = false;
        secondary.limit = 50;

        let mut config = Self::default();
        config.chats.push(secondary);
        config
    }

    /// Chat targets that take part in scheduled fetching, in configured order.
    pub fn enabled_chats(&self) -> impl Iterator<Item = &ChatTarget> {
        self.chats.iter().filter(|chat| chat.enabled)
    }

    /// Gateway connection settings derived from this configuration.
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings::default()
            .with_base_url(self.base_url.clone())
            .with_credentials(self.username.clone(), self.password.clone())
            .with_api_key(self.api_key.clone())
    }

    /// Decode `value` key by key on top of the defaults. Missing keys keep
    /// their default and nested objects that are present are not merged.
    /// A key of the wrong type keeps its default, and a chat entry that does
    /// not decode is dropped; both are logged. Only a non-object root fails.
    pub fn merge_with_defaults(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(mut map) = value else {
            return Err(ConfigError::NotAnObject);
        };

        let mut config = Self::default();
        take_key(&mut map, "base_url", &mut config.base_url);
        take_key(&mut map, "username", &mut config.username);
        take_key(&mut map, "password", &mut config.password);
        take_key(&mut map, "api_key", &mut config.api_key);
        take_key(&mut map, "output_dir", &mut config.output_dir);
        take_key(&mut map, "schedule", &mut config.schedule);

        match map.remove("chats") {
            None => {}
            Some(Value::Array(entries)) => {
                config.chats = entries
                    .into_iter()
                    .enumerate()
                    .filter_map(|(index, entry)| match serde_json::from_value(entry) {
                        Ok(chat) => Some(chat),
                        Err(err) => {
                            warn!("ignoring chat entry {index} in config: {err}");
                            None
                        }
                    })
                    .collect();
            }
            Some(other) => warn!("config key `chats` must be a list, got {other}; using defaults"),
        }

        Ok(config)
    }
}

/// Replace `slot` with the decoded value of `key`, if present and well typed.
fn take_key<T: DeserializeOwned>(map: &mut Map<String, Value>, key: &str, slot: &mut T) {
    let Some(raw) = map.remove(key) else {
        return;
    };
    match serde_json::from_value(raw) {
        Ok(value) => *slot = value,
        Err(err) => warn!("config key `{key}` is invalid ({err}); using the default"),
    }
}

/// JSON file holding a [`HarvesterConfig`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store backed by the file at `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, writing the default when the file does not
    /// exist yet. Unreadable files, invalid JSON and non-object roots fall
    /// back to the default.
    pub fn load(&self) -> HarvesterConfig {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = HarvesterConfig::default();
                if let Err(err) = self.save(&config) {
                    error!("could not write default config to {}: {err}", self.path.display());
                }
                return config;
            }
            Err(err) => {
                warn!("could not read {}: {err}; using defaults", self.path.display());
                return HarvesterConfig::default();
            }
        };

        match serde_json::from_str::<Value>(&contents)
            .map_err(ConfigError::from)
            .and_then(HarvesterConfig::merge_with_defaults)
        {
            Ok(config) => config,
            Err(err) => {
                warn!("error loading config file {}: {err}; using defaults", self.path.display());
                HarvesterConfig::default()
            }
        }
    }

    /// Persist the configuration as pretty JSON.
    pub fn save(&self, config: &HarvesterConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, serialized)?;
        info!("config saved to {}", self.path.display());
        Ok(())
    }
}

fn window_or_none<'de, D>(deserializer: D) -> Result<Option<ActiveHours>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn default_chat_id() -> ChatId {
    ChatId::user("6282243673017")
}

fn default_enabled() -> bool {
    true
}

fn default_limit() -> u32 {
    100
}

fn default_sort_by() -> String {
    "timestamp".into()
}

fn default_interval() -> u64 {
    30
}

fn default_window_start() -> String {
    "00:00".into()
}

fn default_window_end() -> String {
    "23:59".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_missing_keys_filled_from_defaults() {
        let config =
            HarvesterConfig::merge_with_defaults(json!({ "base_url": "http://gw:3000" })).unwrap();
        let defaults = HarvesterConfig::default();
        assert_eq!(config.base_url, "http://gw:3000");
        assert_eq!(config.username, defaults.username);
        assert_eq!(config.output_dir, defaults.output_dir);
        assert_eq!(config.chats, defaults.chats);
        assert_eq!(config.schedule, defaults.schedule);
    }

    #[test]
    fn test_merge_is_shallow() {
        let config = HarvesterConfig::merge_with_defaults(json!({
            "schedule": { "interval_minutes": 5 },
            "chats": [{ "chat_id": "628111@c.us" }]
        }))
        .unwrap();
        assert_eq!(config.schedule.interval_minutes, 5);
        assert_eq!(config.schedule.enabled_hours, None);
        assert_eq!(config.chats.len(), 1);
        let chat = &config.chats[0];
        assert!(chat.enabled);
        assert_eq!(chat.limit, 100);
        assert_eq!(chat.sort_order, SortOrder::Desc);
        assert_eq!(chat.display_name(), "628111@c.us");
    }

    #[test]
    fn test_bad_chat_entry_keeps_rest_of_config() {
        let config = HarvesterConfig::merge_with_defaults(json!({
            "base_url": "http://my-gateway:3000",
            "username": "me",
            "chats": [
                { "chat_id": "628111@c.us" },
                { "chat_id": "628222@c.us", "limit": "fifty" },
                { "chat_id": "" },
                { "name": "no id" }
            ]
        }))
        .unwrap();
        assert_eq!(config.base_url, "http://my-gateway:3000");
        assert_eq!(config.username, "me");
        assert_eq!(config.password, HarvesterConfig::default().password);
        let ids: Vec<String> = config.chats.iter().map(|c| c.chat_id.to_string()).collect();
        assert_eq!(ids, vec!["628111@c.us"]);
    }

    #[test]
    fn test_mistyped_keys_keep_their_defaults() {
        let config = HarvesterConfig::merge_with_defaults(json!({
            "username": 42,
            "output_dir": "archive",
            "schedule": { "interval_minutes": "often" },
            "chats": { "chat_id": "628111@c.us" }
        }))
        .unwrap();
        let defaults = HarvesterConfig::default();
        assert_eq!(config.username, defaults.username);
        assert_eq!(config.output_dir, "archive");
        assert_eq!(config.schedule, defaults.schedule);
        assert_eq!(config.chats, defaults.chats);
    }

    #[test]
    fn test_store_keeps_valid_parts_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waha_config.json");
        fs::write(
            &path,
            r#"{"base_url":"http://my-gateway:3000","chats":[{"chat_id":"628111@c.us"},{"chat_id":"628222@c.us","limit":"fifty"}]}"#,
        )
        .unwrap();

        let config = ConfigStore::new(&path).load();
        assert_eq!(config.base_url, "http://my-gateway:3000");
        assert_eq!(config.chats.len(), 1);
        assert_eq!(config.chats[0].chat_id, ChatId::user("628111"));
    }

    #[test]
    fn test_empty_window_is_always_active() {
        let config = HarvesterConfig::merge_with_defaults(json!({
            "schedule": { "interval_minutes": 10, "enabled_hours": {} }
        }))
        .unwrap();
        assert_eq!(config.schedule.enabled_hours, None);
        let late = NaiveTime::from_hms_opt(23, 59, 30).unwrap();
        assert!(config.schedule.is_active_at(late));

        let config = HarvesterConfig::merge_with_defaults(json!({
            "schedule": { "enabled_hours": null }
        }))
        .unwrap();
        assert_eq!(config.schedule.enabled_hours, None);
    }

    #[test]
    fn test_partial_window_fills_bounds() {
        let config = HarvesterConfig::merge_with_defaults(json!({
            "schedule": { "enabled_hours": { "start": "09:00" } }
        }))
        .unwrap();
        assert_eq!(config.schedule.enabled_hours, Some(ActiveHours::new("09:00", "23:59")));
    }

    #[test]
    fn test_huge_interval_does_not_overflow() {
        let schedule = ScheduleConfig {
            interval_minutes: u64::MAX,
            enabled_hours: None,
        };
        assert_eq!(schedule.interval(), Duration::from_secs(u64::MAX));
        let schedule = ScheduleConfig {
            interval_minutes: 0,
            enabled_hours: None,
        };
        assert_eq!(schedule.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_merge_rejects_non_object() {
        assert!(matches!(
            HarvesterConfig::merge_with_defaults(json!([1, 2])),
            Err(ConfigError::NotAnObject)
        ));
    }

    #[test]
    fn test_no_window_is_always_active() {
        let schedule = ScheduleConfig {
            interval_minutes: 30,
            enabled_hours: None,
        };
        for hour in 0..24 {
            assert!(schedule.is_active_at(at(hour, 30)));
        }
    }

    #[test]
    fn test_daytime_window() {
        let window = ActiveHours::new("08:00", "22:00");
        assert!(window.contains(at(8, 0)));
        assert!(window.contains(at(12, 0)));
        assert!(window.contains(at(22, 0)));
        assert!(!window.contains(at(7, 59)));
        assert!(!window.contains(at(23, 0)));
    }

    #[test]
    fn test_overnight_window() {
        let window = ActiveHours::new("22:00", "08:00");
        assert!(window.contains(at(23, 0)));
        assert!(window.contains(at(7, 0)));
        assert!(!window.contains(at(12, 0)));
    }

    #[test]
    fn test_unparseable_window_is_active() {
        let window = ActiveHours::new("8am", "22:00");
        assert!(window.contains(at(3, 0)));
    }

    #[test]
    fn test_store_writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("waha_config.json");
        let store = ConfigStore::new(&path);

        let config = store.load();
        assert_eq!(config, HarvesterConfig::default());
        assert!(path.exists());

        let reread: HarvesterConfig =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reread, config);
    }

    #[test]
    fn test_store_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waha_config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = ConfigStore::new(&path).load();
        assert_eq!(config, HarvesterConfig::default());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_sample_has_disabled_secondary() {
        let sample = HarvesterConfig::sample();
        assert_eq!(sample.chats.len(), 2);
        assert_eq!(sample.enabled_chats().count(), 1);
        assert_eq!(sample.chats[1].limit, 50);
    }

    #[test]
    fn test_gateway_settings_trim_slash() {
        let mut config = HarvesterConfig::default();
        config.base_url = "http://gw:3000/".into();
        assert_eq!(config.gateway_settings().base_url, "http://gw:3000");
    }
}
