//! Messenger Graph API client.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GraphConfig;

use super::{IdentityLookup, LookupError, Transport, TransportError};

const MAX_ERROR_BODY_CHARS: usize = 256;

static TOKEN_LIKE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"EA[A-Za-z0-9]{20,}").ok());

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// `POST /me/messages` request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct SendRequest {
    /// Recipient.
    pub recipient: Recipient,
    /// Message payload.
    pub message: MessageBody,
    /// Messaging type (e.g. `MESSAGE_TAG`).
    pub messaging_type: String,
    /// Message tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Recipient block.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct Recipient {
    /// Canonical numeric id.
    pub id: String,
}

/// Text message block.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct MessageBody {
    /// Message text.
    pub text: String,
}

/// Graph error envelope: `{"error": {"message": "..."}}`.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// Node lookup response: `{"id": "...", "name": "..."}`.
#[derive(Debug, Deserialize)]
struct NodeResponse {
    id: Option<String>,
    name: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Graph API client implementing [`Transport`] and [`IdentityLookup`].
#[derive(Clone)]
pub struct GraphClient {
    api_root: String,
    access_token: String,
    messaging_type: String,
    tag: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphClient")
            .field("api_root", &self.api_root)
            .field("access_token", &"[REDACTED]")
            .field("messaging_type", &self.messaging_type)
            .field("tag", &self.tag)
            .finish()
    }
}

impl GraphClient {
    /// Create a client for the configured API root.
    pub fn new(config: &GraphConfig, access_token: impl Into<String>) -> Self {
        Self {
            api_root: api_root(config),
            access_token: access_token.into(),
            messaging_type: config.messaging_type.clone(),
            tag: Some(config.tag.clone()).filter(|t| !t.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    /// Check the access token with `GET /me`, returning the account name.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the token is rejected or the request fails.
    pub async fn verify_token(&self) -> Result<String, TransportError> {
        let response = self
            .client
            .get(format!("{}/me", self.api_root))
            .query(&[("access_token", self.access_token.as_str())])
            .send()
            .await
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: parse_error_message(&body),
            });
        }

        let node: NodeResponse = serde_json::from_str(&body).map_err(|e| {
            TransportError::Network(format!("unexpected /me response: {e}"))
        })?;
        Ok(node.name.unwrap_or_else(|| "unknown".to_owned()))
    }
}

#[async_trait]
impl Transport for GraphClient {
    async fn deliver(&self, target: &str, body: &str) -> Result<(), TransportError> {
        let request = build_send_request(target, body, &self.messaging_type, self.tag.as_deref());

        let response = self
            .client
            .post(format!("{}/me/messages", self.api_root))
            .query(&[("access_token", self.access_token.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "message accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            message: parse_error_message(&body),
        })
    }
}

#[async_trait]
impl IdentityLookup for GraphClient {
    async fn username_to_id(&self, username: &str) -> Result<Option<String>, LookupError> {
        let response = self
            .client
            .get(format!("{}/{username}", self.api_root))
            .query(&[("fields", "id"), ("access_token", self.access_token.as_str())])
            .send()
            .await
            .map_err(|e| LookupError::Network(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LookupError::Network(e.without_url().to_string()))?;

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(LookupError::Status {
                status: status.as_u16(),
                message: parse_error_message(&body),
            });
        }

        parse_lookup_response(&body)
    }
}

// ---------------------------------------------------------------------------
// Request / Response helpers (pub for integration testing)
// ---------------------------------------------------------------------------

/// `{api_base}/{api_version}` without a trailing slash.
#[doc(hidden)]
pub fn api_root(config: &GraphConfig) -> String {
    let base = config.api_base.trim_end_matches('/');
    let version = config.api_version.trim_matches('/');
    if version.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{version}")
    }
}

/// Build the send request body.
#[doc(hidden)]
pub fn build_send_request(
    target: &str,
    text: &str,
    messaging_type: &str,
    tag: Option<&str>,
) -> SendRequest {
    SendRequest {
        recipient: Recipient {
            id: target.to_owned(),
        },
        message: MessageBody {
            text: text.to_owned(),
        },
        messaging_type: messaging_type.to_owned(),
        tag: tag.map(str::to_owned),
    }
}

/// Extract `error.message` from a Graph error body, or a sanitized excerpt.
#[doc(hidden)]
pub fn parse_error_message(body: &str) -> String {
    if let Ok(ErrorEnvelope {
        error: ErrorDetail {
            message: Some(message),
        },
    }) = serde_json::from_str::<ErrorEnvelope>(body)
    {
        return sanitize(&message);
    }

    let sanitized = sanitize(body);
    if sanitized.is_empty() {
        "unknown error".to_owned()
    } else {
        sanitized
    }
}

/// Parse a node lookup body into an id. A missing id is a miss, not an error.
///
/// # Errors
///
/// Returns [`LookupError::Parse`] if the body is not JSON.
#[doc(hidden)]
pub fn parse_lookup_response(body: &str) -> Result<Option<String>, LookupError> {
    let node: NodeResponse =
        serde_json::from_str(body).map_err(|e| LookupError::Parse(e.to_string()))?;
    Ok(node.id.filter(|id| !id.trim().is_empty()))
}

/// Collapse whitespace, mask access tokens, and cap the length.
fn sanitize(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let masked = match TOKEN_LIKE.as_ref() {
        Some(re) => re.replace_all(&collapsed, "[REDACTED]").into_owned(),
        None => collapsed,
    };

    if masked.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = masked.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    masked
}
