//! Message and fetch result types.

use chrono::{DateTime, Local, TimeZone};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A single message as returned by the gateway.
///
/// Fields the gateway sends beyond the ones modelled here are kept in
/// `extra` and written back out unchanged. Modelled fields never reject an
/// entry: a value of an unexpected type decodes to the field's default,
/// and `ack` is kept exactly as sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, deserialize_with = "lenient")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub from: String,
    #[serde(default, deserialize_with = "lenient")]
    pub to: String,
    /// Seconds since the Unix epoch. Fractional and string values are truncated.
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "lenient")]
    pub body: Option<String>,
    #[serde(rename = "fromMe", default, deserialize_with = "lenient")]
    pub from_me: bool,
    #[serde(rename = "hasMedia", default, deserialize_with = "lenient")]
    pub has_media: bool,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Media attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Delivery acknowledgement reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Pending,
    Sent,
    Received,
    Read,
    Unknown(i64),
}

impl AckStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => AckStatus::Pending,
            1 => AckStatus::Sent,
            2 => AckStatus::Received,
            3 => AckStatus::Read,
            other => AckStatus::Unknown(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AckStatus::Pending => "pending",
            AckStatus::Sent => "sent",
            AckStatus::Received => "received",
            AckStatus::Read => "read",
            AckStatus::Unknown(_) => "unknown",
        }
    }
}

impl Message {
    /// Acknowledgement state, if the gateway reported a numeric one.
    pub fn ack_status(&self) -> Option<AckStatus> {
        self.ack.as_ref().and_then(Value::as_i64).map(AckStatus::from_code)
    }

    /// Local wall-clock time of the message.
    pub fn sent_at(&self) -> Option<DateTime<Local>> {
        Local.timestamp_opt(self.timestamp, 0).single()
    }
}

/// Normalized outcome of one poll for one chat.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub messages: Vec<Message>,
    pub total: usize,
    pub has_more: bool,
    pub mock: bool,
    pub retrieved_at: DateTime<Local>,
}

impl FetchResult {
    /// Build a result from a decoded gateway response body.
    pub fn from_response(body: &Value, retrieved_at: DateTime<Local>) -> Self {
        let messages = normalize_messages(body);
        let total = body
            .get("total")
            .and_then(Value::as_u64)
            .map(|t| t as usize)
            .unwrap_or(messages.len());
        let has_more = body.get("hasMore").and_then(Value::as_bool).unwrap_or(false);
        let mock = body.get("mock").and_then(Value::as_bool).unwrap_or(false);

        Self {
            messages,
            total,
            has_more,
            mock,
            retrieved_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Largest message timestamp, regardless of the sort order requested.
    pub fn newest_timestamp(&self) -> Option<i64> {
        self.messages.iter().map(|m| m.timestamp).max()
    }

    /// Oldest and newest message timestamps.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        let oldest = self.messages.iter().map(|m| m.timestamp).min()?;
        let newest = self.newest_timestamp()?;
        Some((oldest, newest))
    }
}

/// Extract the message collection from either response shape the gateway
/// uses: a bare list, or an object carrying `messages` (or `data`).
pub fn normalize_messages(body: &Value) -> Vec<Message> {
    let items = match body {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("messages").or_else(|| map.get("data")) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<Message>(item.clone()) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!("skipping unreadable message entry: {err}");
                None
            }
        })
        .collect()
}

/// An entry of the contact directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn epoch_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    };
    Ok(seconds.unwrap_or_default())
}
