//! Chat identifiers as used by the WAHA gateway.
//!
//! Identifiers look like `6281234567890@c.us` for individual chats and
//! `1203630xxxx@g.us` for groups.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Known chat servers on the gateway
pub mod servers {
    pub const USER: &str = "c.us";
    pub const GROUP: &str = "g.us";
    pub const BROADCAST: &str = "broadcast";
    pub const NEWSLETTER: &str = "newsletter";
}

/// Characters that must not reach a file name.
const PATH_HOSTILE: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// ChatId identifies one conversation on the gateway.
///
/// The server part is optional; bare phone numbers are accepted and kept as
/// they were written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChatId {
    pub user: String,
    pub server: Option<String>,
}

impl ChatId {
    /// Creates a chat id from its user and server parts.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: Some(server.into()),
        }
    }

    /// Creates an individual chat id (`@c.us`).
    pub fn user(phone: impl Into<String>) -> Self {
        Self::new(phone, servers::USER)
    }

    /// Returns true if this is a group chat.
    pub fn is_group(&self) -> bool {
        self.server.as_deref() == Some(servers::GROUP)
    }

    /// Returns the id with the `@c.us` suffix dropped, for display.
    pub fn display_name(&self) -> String {
        match self.server.as_deref() {
            Some(servers::USER) | None => self.user.clone(),
            Some(server) => format!("{}@{}", self.user, server),
        }
    }

    /// Returns the path segment form: percent-encoded, nothing left safe.
    pub fn url_encoded(&self) -> String {
        urlencoding::encode(&self.to_string()).into_owned()
    }

    /// Returns a form of the id usable inside a file name.
    pub fn sanitized(&self) -> String {
        sanitize(&self.to_string())
    }
}

/// Strips the individual-chat suffix and `+`, and neutralises characters that
/// would escape or break a file name.
pub fn sanitize(raw: &str) -> String {
    raw.replace("@c.us", "")
        .replace('+', "")
        .chars()
        .map(|c| {
            if PATH_HOSTILE.contains(&c) || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server {
            Some(server) => write!(f, "{}@{}", self.user, server),
            None => write!(f, "{}", self.user),
        }
    }
}

/// Error returned when a chat id cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatIdParseError(pub String);

impl fmt::Display for ChatIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid chat id: {}", self.0)
    }
}

impl std::error::Error for ChatIdParseError {}

impl FromStr for ChatId {
    type Err = ChatIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ChatIdParseError("empty".to_string()));
        }

        match s.split_once('@') {
            Some((user, server)) => {
                if user.is_empty() || server.is_empty() || server.contains('@') {
                    return Err(ChatIdParseError(s.to_string()));
                }
                Ok(Self::new(user, server))
            }
            None => Ok(Self {
                user: s.to_string(),
                server: None,
            }),
        }
    }
}

impl TryFrom<String> for ChatId {
    type Error = ChatIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChatId> for String {
    fn from(id: ChatId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_chat() {
        let id: ChatId = "6282243673017@c.us".parse().unwrap();
        assert_eq!(id.user, "6282243673017");
        assert_eq!(id.server.as_deref(), Some(servers::USER));
        assert!(!id.is_group());
    }

    #[test]
    fn test_parse_group_chat() {
        let id: ChatId = "120363000000000000@g.us".parse().unwrap();
        assert!(id.is_group());
        assert_eq!(id.display_name(), "120363000000000000@g.us");
    }

    #[test]
    fn test_parse_bare_number() {
        let id: ChatId = "628123456789".parse().unwrap();
        assert_eq!(id.server, None);
        assert_eq!(id.to_string(), "628123456789");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<ChatId>().is_err());
        assert!("@c.us".parse::<ChatId>().is_err());
        assert!("123@".parse::<ChatId>().is_err());
        assert!("1@2@3".parse::<ChatId>().is_err());
    }

    #[test]
    fn test_url_encoding_escapes_at_sign() {
        let id = ChatId::user("6282243673017");
        assert_eq!(id.url_encoded(), "6282243673017%40c.us");
    }

    #[test]
    fn test_sanitized_file_component() {
        assert_eq!(ChatId::user("+6282243673017").sanitized(), "6282243673017");
        assert_eq!(sanitize("../evil/chat@g.us"), ".._evil_chat@g.us");
        assert_eq!(sanitize("a b:c"), "a_b_c");
    }

    #[test]
    fn test_display_name_drops_user_suffix() {
        assert_eq!(ChatId::user("628123").display_name(), "628123");
    }

    #[test]
    fn test_serde_as_string() {
        let id = ChatId::user("628123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"628123@c.us\"");
        let back: ChatId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
