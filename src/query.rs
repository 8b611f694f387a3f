//! Read-side queries over the JSON files in the output directory.
//!
//! Files are classified by name into contact and message collections.
//! Contacts can be searched, sorted and paged; messages can additionally be
//! filtered by party, time range, media and direction. The statistics
//! functions summarise both collections.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, Local, NaiveDate, SecondsFormat, TimeZone, Timelike};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{config::SortOrder, projection::ContactDirectory};

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("file {0} not found")]
    NotFound(PathBuf),
    #[error("invalid file name `{0}`")]
    InvalidFileName(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid date `{0}`; expected YYYY-MM-DD, RFC 3339 or epoch seconds")]
    InvalidDate(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

/// What a file in the output directory holds, judged by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Contacts,
    Messages,
    Backup,
    Unknown,
}

impl FileKind {
    pub fn of(file_name: &str) -> Self {
        let name = file_name.to_lowercase();
        let mentions = |words: &[&str]| words.iter().any(|word| name.contains(word));
        if mentions(&["kontak", "contact", "coworker", "devteam", "person"]) {
            FileKind::Contacts
        } else if mentions(&["data", "message", "pesan", "response"]) {
            FileKind::Messages
        } else if mentions(&["backup", "old", "archive"]) {
            FileKind::Backup
        } else {
            FileKind::Unknown
        }
    }
}

/// `.json` files directly under `dir`, sorted by name. A missing directory
/// has no files.
pub fn json_files(dir: &Path) -> QueryResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(QueryError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

/// Records of one file. Both plain arrays and harvester result documents
/// (`{"metadata": .., "messages": [..]}`) are understood.
pub fn read_file_records(path: &Path) -> QueryResult<Vec<Value>> {
    let contents = fs::read_to_string(path).map_err(|source| QueryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&contents).map_err(|source| QueryError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    })
}

/// Load records of `kind` from `dir`, tagging each with its `source` file.
///
/// With `file` set only that file is read and a failure is an error. Without
/// it every file of `kind` is read and unreadable files are skipped.
pub fn load_records(dir: &Path, kind: FileKind, file: Option<&str>) -> QueryResult<Vec<Value>> {
    let paths = match file {
        Some(name) => {
            let bare = Path::new(name)
                .file_name()
                .filter(|bare| bare.len() == name.len())
                .ok_or_else(|| QueryError::InvalidFileName(name.to_string()))?;
            let path = dir.join(bare);
            if !path.is_file() {
                return Err(QueryError::NotFound(path));
            }
            vec![path]
        }
        None => json_files(dir)?
            .into_iter()
            .filter(|path| FileKind::of(&file_label(path)) == kind)
            .collect(),
    };

    let mut records = Vec::new();
    for path in &paths {
        let items = match read_file_records(path) {
            Ok(items) => items,
            Err(err) if file.is_none() => {
                warn!("skipping {}: {err}", path.display());
                continue;
            }
            Err(err) => return Err(err),
        };
        let label = file_label(path);
        debug!("loaded {} records from {label}", items.len());
        records.extend(items.into_iter().map(|mut item| {
            if let Value::Object(map) = &mut item {
                map.insert("source".into(), Value::String(label.clone()));
            }
            item
        }));
    }
    Ok(records)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Parse a date bound: `YYYY-MM-DD` (local midnight, or the last second of
/// that day when `end_of_day`), an RFC 3339 timestamp, or epoch seconds.
pub fn parse_date_bound(raw: &str, end_of_day: bool) -> QueryResult<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_opt(23, 59, 59)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        return time
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|dt| dt.timestamp())
            .ok_or_else(|| QueryError::InvalidDate(raw.to_string()));
    }
    raw.parse::<i64>()
        .map_err(|_| QueryError::InvalidDate(raw.to_string()))
}

/// Inclusive bounds on a message timestamp, in epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeFilter {
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
}

impl TimeFilter {
    pub fn is_unbounded(&self) -> bool {
        self.start_ts.is_none() && self.end_ts.is_none()
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start_ts.map_or(true, |start| ts >= start) && self.end_ts.map_or(true, |end| ts <= end)
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub total: usize,
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
    pub items: Vec<Value>,
}

impl Page {
    fn of(items: Vec<Value>, limit: usize, offset: usize) -> Self {
        let total = items.len();
        let items: Vec<Value> = items.into_iter().skip(offset).take(limit).collect();
        Self {
            total,
            count: items.len(),
            limit,
            offset,
            has_more: offset.saturating_add(limit) < total,
            items,
        }
    }
}

/// Search, sort and paging for contact records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactQuery {
    /// Case-insensitive match against `name`, `id` and `phone`.
    pub search: Option<String>,
    pub sort_by: String,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
    /// Keep only these keys of each record.
    pub fields: Option<Vec<String>>,
}

impl Default for ContactQuery {
    fn default() -> Self {
        Self {
            search: None,
            sort_by: "name".into(),
            order: SortOrder::Asc,
            limit: 100,
            offset: 0,
            fields: None,
        }
    }
}

impl ContactQuery {
    pub fn matches(&self, contact: &Value) -> bool {
        match &self.search {
            Some(term) => contains_any(contact, &["name", "id", "phone"], term),
            None => true,
        }
    }

    pub fn apply(&self, contacts: Vec<Value>) -> Page {
        let mut matching: Vec<Value> = contacts.into_iter().filter(|c| self.matches(c)).collect();
        sort_records(&mut matching, &self.sort_by, self.order);
        let mut page = Page::of(matching, self.limit, self.offset);
        if let Some(fields) = &self.fields {
            page.items = page.items.iter().map(|item| select_fields(item, fields)).collect();
        }
        page
    }
}

/// Filters, sort and paging for message records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    /// Either party of the message.
    pub contact_id: Option<String>,
    pub from_user: Option<String>,
    pub to_user: Option<String>,
    /// Case-insensitive match against `body`, `message`, `from` and `to`.
    pub search: Option<String>,
    pub time: TimeFilter,
    pub has_media: Option<bool>,
    pub from_me: Option<bool>,
    pub sort_by: String,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            contact_id: None,
            from_user: None,
            to_user: None,
            search: None,
            time: TimeFilter::default(),
            has_media: None,
            from_me: None,
            sort_by: "timestamp".into(),
            order: SortOrder::Asc,
            limit: 100,
            offset: 0,
        }
    }
}

impl MessageQuery {
    pub fn matches(&self, message: &Value) -> bool {
        let sender = |id: &str| field_is(message, "from", id) || field_is(message, "from_user", id);
        let receiver = |id: &str| field_is(message, "to", id) || field_is(message, "to_user", id);

        if let Some(id) = &self.contact_id {
            if !sender(id) && !receiver(id) {
                return false;
            }
        }
        if self.from_user.as_deref().is_some_and(|id| !sender(id)) {
            return false;
        }
        if self.to_user.as_deref().is_some_and(|id| !receiver(id)) {
            return false;
        }
        if !self.time.is_unbounded() && !self.time.contains(timestamp_of(message).unwrap_or(0)) {
            return false;
        }
        if let Some(term) = &self.search {
            if !contains_any(message, &["body", "message", "from", "to"], term) {
                return false;
            }
        }
        if self.has_media.is_some_and(|want| truthy(message.get("hasMedia")) != want) {
            return false;
        }
        if self.from_me.is_some_and(|want| truthy(message.get("fromMe")) != want) {
            return false;
        }
        true
    }

    /// Only the filters of this query; sort and paging are ignored.
    pub fn filter<'a>(&self, messages: &'a [Value]) -> Vec<&'a Value> {
        messages.iter().filter(|m| self.matches(m)).collect()
    }

    pub fn apply(&self, messages: Vec<Value>) -> Page {
        let mut matching: Vec<Value> = messages.into_iter().filter(|m| self.matches(m)).collect();
        sort_records(&mut matching, &self.sort_by, self.order);
        Page::of(matching, self.limit, self.offset)
    }
}

/// Messages exchanged with one counterpart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactActivity {
    pub contact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message_count: usize,
    pub percentage: f64,
}

/// Message count for one hour of the day or day of the week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeActivity {
    pub period: u32,
    pub message_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSpan {
    pub earliest: String,
    pub latest: String,
    pub span_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LengthStats {
    pub average: f64,
    pub min: usize,
    pub max: usize,
    pub median: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageStats {
    pub total_messages: usize,
    pub media_messages: usize,
    pub text_messages: usize,
    pub sent_messages: usize,
    pub received_messages: usize,
    pub unique_senders: usize,
    pub unique_receivers: usize,
    pub unique_contacts: usize,
    pub source_files: Vec<String>,
    /// Counterparts ordered by message count, highest first.
    pub per_contact: Vec<ContactActivity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeSpan>,
    /// Hours 0-23, local time.
    pub activity_by_hour: Vec<TimeActivity>,
    /// 0 is Sunday.
    pub activity_by_weekday: Vec<TimeActivity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_hour: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_day: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_lengths: Option<LengthStats>,
}

/// Summarise `messages`. Counterpart names come from `directory` when given.
pub fn message_stats(messages: &[&Value], directory: Option<&ContactDirectory>) -> MessageStats {
    let total = messages.len();
    let media = messages.iter().filter(|m| truthy(m.get("hasMedia"))).count();
    let sent = messages.iter().filter(|m| truthy(m.get("fromMe"))).count();

    let senders: BTreeSet<&str> = messages.iter().filter_map(|m| party(m, "from", "from_user")).collect();
    let receivers: BTreeSet<&str> = messages.iter().filter_map(|m| party(m, "to", "to_user")).collect();
    let source_files: BTreeSet<String> = messages
        .iter()
        .filter_map(|m| m.get("source").and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for message in messages {
        if let Some(contact) = counterpart(message) {
            *counts.entry(contact).or_default() += 1;
        }
    }
    let mut per_contact: Vec<ContactActivity> = counts
        .into_iter()
        .map(|(contact_id, message_count)| ContactActivity {
            contact_id: contact_id.to_string(),
            name: directory
                .and_then(|d| d.name_of(contact_id))
                .map(str::to_string),
            message_count,
            percentage: percentage(message_count, total),
        })
        .collect();
    per_contact.sort_by(|a, b| {
        b.message_count
            .cmp(&a.message_count)
            .then_with(|| a.contact_id.cmp(&b.contact_id))
    });

    let times: Vec<DateTime<Local>> = messages
        .iter()
        .filter_map(|m| timestamp_of(m))
        .filter(|ts| *ts > 0)
        .filter_map(|ts| Local.timestamp_opt(ts, 0).single())
        .collect();

    let mut by_hour = vec![0usize; 24];
    let mut by_weekday = vec![0usize; 7];
    for time in &times {
        by_hour[time.hour() as usize] += 1;
        by_weekday[time.weekday().num_days_from_sunday() as usize] += 1;
    }

    let time_range = match (times.iter().min(), times.iter().max()) {
        (Some(earliest), Some(latest)) => Some(TimeSpan {
            earliest: earliest.to_rfc3339_opts(SecondsFormat::Secs, false),
            latest: latest.to_rfc3339_opts(SecondsFormat::Secs, false),
            span_days: (latest.timestamp() - earliest.timestamp() + 86_399) / 86_400,
        }),
        _ => None,
    };

    let lengths: Vec<usize> = messages
        .iter()
        .filter_map(|m| m.get("body").and_then(Value::as_str))
        .map(|body| body.chars().count())
        .filter(|len| *len > 0)
        .collect();

    MessageStats {
        total_messages: total,
        media_messages: media,
        text_messages: total - media,
        sent_messages: sent,
        received_messages: total - sent,
        unique_senders: senders.len(),
        unique_receivers: receivers.len(),
        unique_contacts: senders.union(&receivers).count(),
        source_files: source_files.into_iter().collect(),
        per_contact,
        time_range,
        peak_hour: peak(&by_hour).map(|i| i as u32),
        peak_day: peak(&by_weekday).map(|i| WEEKDAYS[i]),
        activity_by_hour: periods(by_hour),
        activity_by_weekday: periods(by_weekday),
        message_lengths: length_stats(lengths),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactStats {
    /// Distinct contact ids across all files.
    pub total_contacts: usize,
    /// Contacts with a real last message.
    pub active_contacts: usize,
    pub contacts_with_names: usize,
    pub contacts_by_source: BTreeMap<String, usize>,
}

pub fn contact_stats(contacts: &[Value]) -> ContactStats {
    let mut seen: HashMap<&str, &Value> = HashMap::new();
    let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
    for contact in contacts {
        let Some(id) = contact.get("id").and_then(Value::as_str) else {
            continue;
        };
        seen.entry(id).or_insert(contact);
        if let Some(source) = contact.get("source").and_then(Value::as_str) {
            *by_source.entry(source.to_string()).or_default() += 1;
        }
    }

    let active = seen
        .values()
        .filter(|c| {
            c.get("last_message")
                .and_then(Value::as_str)
                .is_some_and(|m| !m.is_empty() && m != "No last message")
        })
        .count();
    let named = seen
        .values()
        .filter(|c| {
            c.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| !n.is_empty() && n != "Unknown")
        })
        .count();

    ContactStats {
        total_contacts: seen.len(),
        active_contacts: active,
        contacts_with_names: named,
        contacts_by_source: by_source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub total_files: usize,
    pub total_size: u64,
    pub file_types: BTreeMap<FileKind, usize>,
}

pub fn file_stats(dir: &Path) -> QueryResult<FileStats> {
    let files = json_files(dir)?;
    let mut file_types = BTreeMap::new();
    let mut total_size = 0;
    for path in &files {
        total_size += fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        *file_types.entry(FileKind::of(&file_label(path))).or_default() += 1;
    }
    Ok(FileStats {
        total_files: files.len(),
        total_size,
        file_types,
    })
}

/// Everything `stats` reports, plus a few ratios derived from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub files: FileStats,
    pub contacts: ContactStats,
    pub messages: MessageStats,
    pub average_messages_per_contact: usize,
    pub active_contacts_rate: f64,
    pub media_message_rate: f64,
    pub sent_message_rate: f64,
}

impl Summary {
    pub fn new(files: FileStats, contacts: ContactStats, messages: MessageStats) -> Self {
        let average_messages_per_contact = match contacts.total_contacts {
            0 => 0,
            n => (messages.total_messages as f64 / n as f64).round() as usize,
        };
        Self {
            average_messages_per_contact,
            active_contacts_rate: percentage(contacts.active_contacts, contacts.total_contacts),
            media_message_rate: percentage(messages.media_messages, messages.total_messages),
            sent_message_rate: percentage(messages.sent_messages, messages.total_messages),
            files,
            contacts,
            messages,
        }
    }
}

fn text(record: &Value, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn contains_any(record: &Value, keys: &[&str], term: &str) -> bool {
    let term = term.to_lowercase();
    keys.iter()
        .filter_map(|key| text(record, key))
        .any(|value| value.to_lowercase().contains(&term))
}

fn field_is(record: &Value, key: &str, expected: &str) -> bool {
    record.get(key).and_then(Value::as_str) == Some(expected)
}

fn party<'a>(record: &'a Value, key: &str, projected_key: &str) -> Option<&'a str> {
    record
        .get(key)
        .or_else(|| record.get(projected_key))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// The other side of the conversation: the receiver of outgoing messages,
/// the sender of everything else.
fn counterpart(record: &Value) -> Option<&str> {
    if truthy(record.get("fromMe")) {
        party(record, "to", "to_user")
    } else {
        party(record, "from", "from_user")
    }
}

fn timestamp_of(record: &Value) -> Option<i64> {
    match record.get("timestamp")? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn sort_records(records: &mut [Value], key: &str, order: SortOrder) {
    records.sort_by(|a, b| {
        let ordering = compare_values(a.get(key), b.get(key));
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

/// Missing values sort first, then numbers, then strings.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) | Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            x.to_lowercase().cmp(&y.to_lowercase())
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn select_fields(record: &Value, fields: &[String]) -> Value {
    let mut selected = Map::new();
    for field in fields {
        if let Some(value) = record.get(field.as_str()) {
            selected.insert(field.clone(), value.clone());
        }
    }
    Value::Object(selected)
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 * 10_000.0 / whole as f64).round() / 100.0
}

fn peak(counts: &[usize]) -> Option<usize> {
    let max = *counts.iter().max()?;
    if max == 0 {
        return None;
    }
    counts.iter().position(|count| *count == max)
}

fn periods(counts: Vec<usize>) -> Vec<TimeActivity> {
    counts
        .into_iter()
        .enumerate()
        .map(|(period, message_count)| TimeActivity {
            period: period as u32,
            message_count,
        })
        .collect()
}

fn length_stats(mut lengths: Vec<usize>) -> Option<LengthStats> {
    if lengths.is_empty() {
        return None;
    }
    lengths.sort_unstable();
    let n = lengths.len();
    let sum: usize = lengths.iter().sum();
    let median = if n % 2 == 0 {
        (lengths[n / 2 - 1] + lengths[n / 2]) as f64 / 2.0
    } else {
        lengths[n / 2] as f64
    };
    Some(LengthStats {
        average: (sum as f64 / n as f64 * 100.0).round() / 100.0,
        min: lengths[0],
        max: lengths[n - 1],
        median,
    })
}
