use std::io::Read;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Local;
use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::{GatewaySettings, SortOrder},
    types::{ChatId, FetchResult},
};

/// Response bodies larger than this are refused.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Chat user used by the connection probe; it does not need to exist.
const PROBE_USER: &str = "test";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error talking to the gateway: {0}")]
    Network(String),
    #[error("gateway session needs a QR code scan: {0}")]
    QrScanRequired(String),
    #[error("gateway session is disconnected: {0}")]
    SessionDisconnected(String),
    #[error("gateway rejected the credentials: {0}")]
    Unauthorized(String),
    #[error("gateway session is not ready: {0}")]
    SessionNotReady(String),
    #[error("gateway returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("failed to decode gateway response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Transient failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }

    /// Operator-facing advice for session and auth failures.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ClientError::QrScanRequired(_) => Some(
                "the WhatsApp session needs a QR code scan; use --mock-data to develop without a live session",
            ),
            ClientError::SessionDisconnected(_) => {
                Some("the WhatsApp session is disconnected; reconnect it on the gateway and try again")
            }
            ClientError::Unauthorized(_) => {
                Some("check the username, password and API key configured for the gateway")
            }
            ClientError::SessionNotReady(_) => {
                Some("the gateway session is not started yet; start it or use --mock-data")
            }
            ClientError::Network(_) => {
                Some("make sure the WAHA server is running at the configured URL")
            }
            _ => None,
        }
    }
}

/// Map a non-success gateway response onto the error taxonomy.
pub fn classify_status(code: u16, body: String) -> ClientError {
    match code {
        401 | 422 if body.contains("SCAN_QR_CODE") => ClientError::QrScanRequired(body),
        401 | 422 if body.contains("DISCONNECTED") => ClientError::SessionDisconnected(body),
        401 => ClientError::Unauthorized(body),
        422 => ClientError::SessionNotReady(body),
        _ => ClientError::Status { code, body },
    }
}

/// Pagination and sort parameters for one message request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub chat_id: ChatId,
    pub limit: u32,
    pub offset: u32,
    pub sort_by: String,
    pub sort_order: SortOrder,
}

impl FetchRequest {
    /// First page of 100 messages for `chat_id`, newest first.
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            limit: 100,
            offset: 0,
            sort_by: "timestamp".into(),
            sort_order: SortOrder::Desc,
        }
    }

    /// Override the page size.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Override the number of messages skipped.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Override the sort field and direction.
    pub fn with_sort(mut self, sort_by: impl Into<String>, sort_order: SortOrder) -> Self {
        self.sort_by = sort_by.into();
        self.sort_order = sort_order;
        self
    }
}

/// Anything that can produce a [`FetchResult`] for a chat.
pub trait MessageSource {
    fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResult, ClientError>;
}

impl<T: MessageSource + ?Sized> MessageSource for Box<T> {
    fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResult, ClientError> {
        (**self).fetch(request)
    }
}

/// Status codes observed by [`GatewayClient::test_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionReport {
    pub root_status: u16,
    pub probe_status: Option<u16>,
}

impl ConnectionReport {
    /// The server answered; 404 on the root just means no index route.
    pub fn is_reachable(&self) -> bool {
        matches!(self.root_status, 200 | 404)
    }

    /// The message endpoint exists. 401 and 422 still prove it is there.
    pub fn api_responding(&self) -> bool {
        self.probe_status.is_some()
    }
}

/// Blocking HTTP client for the WAHA gateway.
pub struct GatewayClient {
    settings: GatewaySettings,
    agent: ureq::Agent,
    authorization: String,
}

impl GatewayClient {
    pub fn new(settings: GatewaySettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(settings.timeout)
            .user_agent(concat!("waha-harvester/", env!("CARGO_PKG_VERSION")))
            .build();
        let credentials = format!("{}:{}", settings.username, settings.password);
        let authorization = format!("Basic {}", STANDARD.encode(credentials));

        Self {
            settings,
            agent,
            authorization,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// URL of the message listing endpoint for a chat.
    pub fn messages_url(&self, chat_id: &ChatId) -> String {
        format!(
            "{}/api/default/chats/{}/messages",
            self.settings.base_url.trim_end_matches('/'),
            chat_id.url_encoded()
        )
    }

    fn get(&self, url: &str) -> ureq::Request {
        self.agent
            .get(url)
            .set("Authorization", &self.authorization)
            .set("X-API-Key", &self.settings.api_key)
            .set("Content-Type", "application/json")
    }

    /// Fetch one page of messages for a chat.
    pub fn fetch_messages(&self, request: &FetchRequest) -> Result<FetchResult, ClientError> {
        let url = self.messages_url(&request.chat_id);
        info!(
            "requesting messages from {url} (limit {}, offset {}, {} {})",
            request.limit,
            request.offset,
            request.sort_by,
            request.sort_order.as_str()
        );

        let response = self
            .get(&url)
            .query("sortBy", &request.sort_by)
            .query("sortOrder", request.sort_order.as_str())
            .query("limit", &request.limit.to_string())
            .query("offset", &request.offset.to_string())
            .call();

        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                let err = classify_status(code, body);
                warn!("gateway refused request for {}: {err}", request.chat_id);
                return Err(err);
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(ClientError::Network(transport.to_string()));
            }
        };

        let code = response.status();
        debug!("gateway answered HTTP {code}");
        let body = read_body(response)?;
        if code != 200 {
            return Err(ClientError::Status { code, body });
        }

        let value: Value =
            serde_json::from_str(&body).map_err(|err| ClientError::Decode(err.to_string()))?;
        let result = FetchResult::from_response(&value, Local::now());
        info!("retrieved {} messages for {}", result.messages.len(), request.chat_id);
        Ok(result)
    }

    /// Probe the gateway root and the message endpoint.
    pub fn test_connection(&self) -> Result<ConnectionReport, ClientError> {
        let root = format!("{}/", self.settings.base_url.trim_end_matches('/'));
        let root_status = self.status_of(&root)?;
        info!("connection test {root}: HTTP {root_status}");

        let probe = format!("{}?limit=1", self.messages_url(&ChatId::user(PROBE_USER)));
        let probe_status = match self.status_of(&probe) {
            Ok(status) => Some(status),
            Err(err) => {
                warn!("probe of {probe} failed: {err}");
                None
            }
        };
        if let Some(status) = probe_status {
            info!("connection test {probe}: HTTP {status}");
        }

        Ok(ConnectionReport {
            root_status,
            probe_status,
        })
    }

    fn status_of(&self, url: &str) -> Result<u16, ClientError> {
        match self.get(url).call() {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(ureq::Error::Transport(transport)) => Err(ClientError::Network(transport.to_string())),
        }
    }
}

impl MessageSource for GatewayClient {
    fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResult, ClientError> {
        self.fetch_messages(request)
    }
}

fn read_body(response: ureq::Response) -> Result<String, ClientError> {
    let mut body = String::new();
    response
        .into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
        .map_err(|err| ClientError::Network(err.to_string()))?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_qr_scan() {
        let err = classify_status(422, r#"{"status":"SCAN_QR_CODE"}"#.into());
        assert!(matches!(err, ClientError::QrScanRequired(_)));
        assert!(err.hint().unwrap().contains("QR"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_disconnected() {
        let err = classify_status(422, "session DISCONNECTED".into());
        assert!(matches!(err, ClientError::SessionDisconnected(_)));
        let err = classify_status(401, "DISCONNECTED".into());
        assert!(matches!(err, ClientError::SessionDisconnected(_)));
    }

    #[test]
    fn test_classify_plain_auth_failures() {
        assert!(matches!(classify_status(401, "nope".into()), ClientError::Unauthorized(_)));
        assert!(matches!(classify_status(422, "STARTING".into()), ClientError::SessionNotReady(_)));
    }

    #[test]
    fn test_classify_other_status() {
        match classify_status(500, "boom".into()) {
            ClientError::Status { code, body } => {
                assert_eq!(code, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(ClientError::Network("refused".into()).is_transient());
        assert!(!ClientError::Decode("bad".into()).is_transient());
        assert!(!ClientError::Status { code: 503, body: String::new() }.is_transient());
    }

    #[test]
    fn test_messages_url_encodes_chat_id() {
        let client = GatewayClient::new(GatewaySettings::default().with_base_url("http://gw:3000/"));
        assert_eq!(
            client.messages_url(&ChatId::user("628123")),
            "http://gw:3000/api/default/chats/628123%40c.us/messages"
        );
    }

    #[test]
    fn test_basic_auth_header() {
        let client = GatewayClient::new(GatewaySettings::default().with_credentials("admin", "secret"));
        assert_eq!(client.authorization, "Basic YWRtaW46c2VjcmV0");
    }

    #[test]
    fn test_connection_report_reachability() {
        let report = ConnectionReport {
            root_status: 404,
            probe_status: Some(401),
        };
        assert!(report.is_reachable());
        assert!(report.api_responding());
        let report = ConnectionReport {
            root_status: 502,
            probe_status: None,
        };
        assert!(!report.is_reachable());
    }

    #[test]
    fn test_unreachable_gateway_is_network_error() {
        let client = GatewayClient::new(
            GatewaySettings::default()
                .with_base_url("http://127.0.0.1:9")
                .with_timeout(std::time::Duration::from_secs(2)),
        );
        let err = client
            .fetch_messages(&FetchRequest::new(ChatId::user("628123")))
            .unwrap_err();
        assert!(err.is_transient());
    }
}
