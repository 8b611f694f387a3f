//! Flattening of exported message and chat records.
//!
//! Message records are projected through an explicit field schema; chat
//! export entries become contact summaries; contact names can be refreshed
//! from a newer dump.

use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{Local, TimeZone};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::Contact;

/// Output format of the derived `datetime` field.
pub const DATETIME_FORMAT: &str = "%d/%m/%y %H:%M:%S";

/// Fields produced when none are requested explicitly.
pub const DEFAULT_FIELDS: &str = "timestamp,from_user,from_name,to_user,to_name,message,datetime";

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("{0} does not hold a JSON array")]
    NotAnArray(String),
}

/// A field that can be requested in a message projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageField {
    Timestamp,
    FromUser,
    FromName,
    ToUser,
    ToName,
    Message,
    Datetime,
    Id,
    FromMe,
    Source,
    HasMedia,
}

impl MessageField {
    pub const ALL: [MessageField; 11] = [
        MessageField::Timestamp,
        MessageField::FromUser,
        MessageField::FromName,
        MessageField::ToUser,
        MessageField::ToName,
        MessageField::Message,
        MessageField::Datetime,
        MessageField::Id,
        MessageField::FromMe,
        MessageField::Source,
        MessageField::HasMedia,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MessageField::Timestamp => "timestamp",
            MessageField::FromUser => "from_user",
            MessageField::FromName => "from_name",
            MessageField::ToUser => "to_user",
            MessageField::ToName => "to_name",
            MessageField::Message => "message",
            MessageField::Datetime => "datetime",
            MessageField::Id => "id",
            MessageField::FromMe => "fromMe",
            MessageField::Source => "source",
            MessageField::HasMedia => "hasMedia",
        }
    }
}

impl fmt::Display for MessageField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageField::ALL
            .iter()
            .copied()
            .find(|field| field.name() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Parse a comma separated field list. Unknown names are dropped.
pub fn parse_field_list(list: &str) -> Vec<MessageField> {
    let mut fields = Vec::new();
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match name.parse::<MessageField>() {
            Ok(field) if !fields.contains(&field) => fields.push(field),
            Ok(_) => {}
            Err(unknown) => debug!("ignoring unknown field {unknown:?}"),
        }
    }
    fields
}

/// Identifier to display name lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactDirectory {
    names: HashMap<String, String>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from contact-shaped JSON entries; entries lacking a non-empty
    /// `id` or `name` are skipped.
    pub fn from_records(records: &[Value]) -> Self {
        let names = records
            .iter()
            .filter_map(|record| {
                let id = record.get("id")?.as_str().filter(|s| !s.is_empty())?;
                let name = record.get("name")?.as_str().filter(|s| !s.is_empty())?;
                Some((id.to_string(), name.to_string()))
            })
            .collect();
        Self { names }
    }

    /// Load a contact file. Missing or unreadable files give an empty
    /// directory.
    pub fn load(path: &Path) -> Self {
        match read_records(path) {
            Ok(records) => {
                let directory = Self::from_records(&records);
                info!("loaded {} contacts from {}", directory.len(), path.display());
                directory
            }
            Err(err) => {
                warn!("{err}; contact names will not be added");
                Self::new()
            }
        }
    }

    pub fn insert(&mut self, contact: Contact) {
        self.names.insert(contact.id, contact.name);
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Project one exported message record onto the requested fields.
///
/// Output keys follow the schema order, not the request order. A sender or
/// recipient known to `contacts` gets its display name right after the id.
pub fn project_message(
    record: &Value,
    fields: &[MessageField],
    contacts: Option<&ContactDirectory>,
) -> Map<String, Value> {
    let wants = |field: MessageField| fields.contains(&field);
    let mut out = Map::new();

    if wants(MessageField::Timestamp) {
        if let Some(ts) = record.get("timestamp") {
            out.insert("timestamp".into(), ts.clone());
        }
    }

    let parties = [
        (MessageField::FromUser, "from", "from_user", "from_name"),
        (MessageField::ToUser, "to", "to_user", "to_name"),
    ];
    for (field, source_key, id_key, name_key) in parties {
        if !wants(field) {
            continue;
        }
        let Some(id) = record.get(source_key) else {
            continue;
        };
        out.insert(id_key.into(), id.clone());
        let name = id
            .as_str()
            .and_then(|id| contacts.and_then(|c| c.name_of(id)));
        if let Some(name) = name {
            out.insert(name_key.into(), Value::String(name.to_string()));
        }
    }

    if wants(MessageField::Message) {
        if let Some(body) = record.get("body") {
            out.insert("message".into(), body.clone());
        }
    }

    if wants(MessageField::Datetime) {
        if let Some(formatted) = record
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(format_timestamp)
        {
            out.insert("datetime".into(), Value::String(formatted));
        }
    }

    for field in [
        MessageField::Id,
        MessageField::FromMe,
        MessageField::Source,
        MessageField::HasMedia,
    ] {
        if wants(field) {
            if let Some(value) = record.get(field.name()) {
                out.insert(field.name().into(), value.clone());
            }
        }
    }

    out
}

/// Local time rendering of an epoch timestamp.
pub fn format_timestamp(secs: i64) -> Option<String> {
    Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format(DATETIME_FORMAT).to_string())
}

/// Flattened view of one chat export entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    pub last_message: String,
    pub last_from: String,
}

/// Summarise a chat export entry. Entries without an `id` yield `None`.
pub fn project_chat(record: &Value) -> Option<ChatSummary> {
    let id = record.get("id").and_then(id_string)?;
    let name = record
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let (last_message, last_from) = match record.get("lastMessage") {
        Some(last) if is_truthy(last) => (
            last.get("body")
                .and_then(Value::as_str)
                .unwrap_or("No message body")
                .to_string(),
            last.get("from")
                .and_then(Value::as_str)
                .unwrap_or("No sender")
                .to_string(),
        ),
        _ => ("No last message".to_string(), "No sender".to_string()),
    };

    Some(ChatSummary {
        id,
        name,
        last_message,
        last_from,
    })
}

/// Overwrite `name` on every record whose `id` appears in `source` with a
/// name. Returns how many records changed.
pub fn refresh_contact_names(records: &mut [Value], source: &[Value]) -> usize {
    let latest: HashMap<&str, &Value> = source
        .iter()
        .filter_map(|item| Some((item.get("id")?.as_str()?, item.get("name")?)))
        .collect();

    let mut updated = 0;
    for record in records.iter_mut() {
        let Some(id) = record.get("id").and_then(Value::as_str) else {
            continue;
        };
        let Some(&name) = latest.get(id) else {
            continue;
        };
        let name = name.clone();
        let id = id.to_string();
        if let Some(map) = record.as_object_mut() {
            let old = map.insert("name".into(), name.clone());
            debug!(
                "updated {id}: {} -> {}",
                old.as_ref().and_then(Value::as_str).unwrap_or("N/A"),
                name.as_str().unwrap_or("N/A")
            );
            updated += 1;
        }
    }
    updated
}

/// Directory a bare `project-messages` input name is looked up in.
pub const MESSAGE_EXPORT_DIR: &str = "messagesId";

/// Directory a bare `project-chats` input name is looked up in.
pub const CHAT_EXPORT_DIR: &str = "chatId";

/// A bare file name is taken from `export_dir`; any path with a directory
/// part is used as given.
pub fn resolve_input(input: &Path, export_dir: &Path) -> PathBuf {
    let bare = input
        .parent()
        .map_or(true, |parent| parent.as_os_str().is_empty());
    if bare && !input.is_absolute() {
        export_dir.join(input)
    } else {
        input.to_path_buf()
    }
}

/// Read an input file that must hold a JSON array.
pub fn read_records(path: &Path) -> Result<Vec<Value>, ProjectionError> {
    let display = path.display().to_string();
    let contents = fs::read_to_string(path).map_err(|source| ProjectionError::Read {
        path: display.clone(),
        source,
    })?;
    match serde_json::from_str(&contents) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(ProjectionError::NotAnArray(display)),
        Err(source) => Err(ProjectionError::Parse {
            path: display,
            source,
        }),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("_serialized")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Number(_) => true,
    }
}
