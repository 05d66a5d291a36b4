//! Delivery and identity-lookup seams.
//!
//! The dispatch engine only sees the [`Transport`] and [`IdentityLookup`]
//! traits. [`graph::GraphClient`] implements both against the Messenger Graph
//! API; tests substitute scripted fakes.

pub mod graph;

use std::time::Duration;

use async_trait::async_trait;

/// Delivery failure. Every variant is treated the same by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The API answered with a non-success status.
    #[error("delivery rejected with status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// API error message or sanitized body.
        message: String,
    },

    /// The request never completed (DNS, TLS, connection reset, …).
    #[error("network error: {0}")]
    Network(String),

    /// The request exceeded its time budget.
    #[error("delivery timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Identity lookup failure. Resolution degrades instead of propagating it.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The API answered with a non-success status other than not-found.
    #[error("lookup rejected with status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// API error message or sanitized body.
        message: String,
    },

    /// The request never completed.
    #[error("lookup network error: {0}")]
    Network(String),

    /// The response body did not match the expected shape.
    #[error("lookup response parse error: {0}")]
    Parse(String),
}

/// Delivers one framed message body to a canonical target id.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `body` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on any non-success outcome.
    async fn deliver(&self, target: &str, body: &str) -> Result<(), TransportError>;
}

/// Maps a profile username to a numeric user id.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Look up `username`. `Ok(None)` means the user does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] when the lookup itself fails.
    async fn username_to_id(&self, username: &str) -> Result<Option<String>, LookupError>;
}

/// Lookup used when no API credential is configured: every username misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

#[async_trait]
impl IdentityLookup for NoLookup {
    async fn username_to_id(&self, _username: &str) -> Result<Option<String>, LookupError> {
        Ok(None)
    }
}
