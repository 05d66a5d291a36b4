//! Recipient identifier resolution.
//!
//! Turns free-form operator input (bare ids, thread URLs, profile URLs) into
//! a [`TargetDescriptor`]. Classification rules, first match wins:
//!
//! 1. all digits, at least `thread_id_min_digits` long → thread id
//! 2. `/messages/e2ee/t/<digits>` anywhere in the text → thread id
//! 3. profile URL with a numeric `id` query parameter → user id
//! 4. profile URL with a username path segment → identity lookup
//! 5. all digits, at least `user_id_min_digits` long → user id
//! 6. anything else → unknown

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::transport::IdentityLookup;

/// Digit count at which a bare number is read as a thread id.
pub const DEFAULT_THREAD_ID_MIN_DIGITS: usize = 16;

/// Digit count at which a bare number is read as a user id.
pub const DEFAULT_USER_ID_MIN_DIGITS: usize = 10;

/// Length of ids produced by [`heuristic_thread_id`].
const HEURISTIC_THREAD_ID_LEN: usize = 17;

static THREAD_URL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/messages/e2ee/t/(\d+)").ok());

static USERNAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.]{0,49}$").ok());

/// Hosts whose profile URLs are understood.
const PROFILE_HOSTS: &[&str] = &["facebook.com", "fb.com", "messenger.com"];

/// First path segments that are never usernames.
const RESERVED_SEGMENTS: &[&str] = &[
    "profile.php",
    "messages",
    "people",
    "groups",
    "pages",
    "events",
    "watch",
    "marketplace",
    "login",
    "t",
];

/// Kind of a resolved target, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Numeric user id.
    UserId,
    /// Numeric conversation thread id.
    ThreadId,
    /// Profile URL whose username could not be resolved.
    UnresolvedUrl,
    /// Input matched no rule.
    Unknown,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UserId => "user_id",
            Self::ThreadId => "thread_id",
            Self::UnresolvedUrl => "unresolved_url",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Deliverable numeric user id.
    UserId(String),
    /// Deliverable numeric thread id.
    ThreadId(String),
    /// Username URL the identity lookup could not resolve.
    UnresolvedUrl {
        /// Username extracted from the URL.
        username: String,
    },
    /// Unrecognised input.
    Unknown,
}

/// Immutable resolution result plus the operator's original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    target: Target,
    source_text: String,
}

impl TargetDescriptor {
    fn new(target: Target, source_text: &str) -> Self {
        Self {
            target,
            source_text: source_text.to_owned(),
        }
    }

    /// The classified target.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Kind discriminator.
    pub fn kind(&self) -> TargetKind {
        match self.target {
            Target::UserId(_) => TargetKind::UserId,
            Target::ThreadId(_) => TargetKind::ThreadId,
            Target::UnresolvedUrl { .. } => TargetKind::UnresolvedUrl,
            Target::Unknown => TargetKind::Unknown,
        }
    }

    /// Numeric id used for delivery, if the target has one.
    pub fn canonical_value(&self) -> Option<&str> {
        match &self.target {
            Target::UserId(id) | Target::ThreadId(id) => Some(id),
            Target::UnresolvedUrl { .. } | Target::Unknown => None,
        }
    }

    /// Original operator input.
    pub fn source_text(&self) -> &str {
        &self.source_text
    }
}

/// Digit-length boundaries used by rules 1 and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverThresholds {
    /// Minimum digits for a bare number to count as a thread id.
    pub thread_id_min_digits: usize,
    /// Minimum digits for a bare number to count as a user id.
    pub user_id_min_digits: usize,
}

impl Default for ResolverThresholds {
    fn default() -> Self {
        Self {
            thread_id_min_digits: DEFAULT_THREAD_ID_MIN_DIGITS,
            user_id_min_digits: DEFAULT_USER_ID_MIN_DIGITS,
        }
    }
}

/// Outcome of the offline classification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Fully classified without network access.
    Resolved(TargetDescriptor),
    /// Rule 4 matched; the username needs an identity lookup.
    NeedsLookup {
        /// Username to resolve.
        username: String,
    },
}

/// Classify `raw` without touching the network.
pub fn classify(raw: &str, thresholds: &ResolverThresholds) -> Classification {
    let text = raw.trim();
    let resolved = |target| Classification::Resolved(TargetDescriptor::new(target, raw));

    if text.is_empty() {
        return resolved(Target::Unknown);
    }

    let digits_only = is_all_digits(text);

    if digits_only && text.len() >= thresholds.thread_id_min_digits {
        return resolved(Target::ThreadId(text.to_owned()));
    }

    if let Some(thread) = THREAD_URL
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
    {
        return resolved(Target::ThreadId(thread.as_str().to_owned()));
    }

    if let Some(url) = parse_profile_url(text) {
        let numeric_id = url
            .query_pairs()
            .find(|(name, _)| name == "id")
            .map(|(_, value)| value.into_owned())
            .filter(|value| is_all_digits(value));
        if let Some(id) = numeric_id {
            return resolved(Target::UserId(id));
        }

        if let Some(username) = username_segment(&url) {
            return Classification::NeedsLookup { username };
        }
    }

    if digits_only && text.len() >= thresholds.user_id_min_digits {
        return resolved(Target::UserId(text.to_owned()));
    }

    resolved(Target::Unknown)
}

/// Resolves target text, consulting an identity lookup for usernames.
#[derive(Clone)]
pub struct TargetResolver {
    thresholds: ResolverThresholds,
    lookup: Arc<dyn IdentityLookup>,
    lookup_timeout: Duration,
}

impl std::fmt::Debug for TargetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetResolver")
            .field("thresholds", &self.thresholds)
            .field("lookup_timeout", &self.lookup_timeout)
            .finish_non_exhaustive()
    }
}

impl TargetResolver {
    /// Create a resolver.
    pub fn new(
        thresholds: ResolverThresholds,
        lookup: Arc<dyn IdentityLookup>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            thresholds,
            lookup,
            lookup_timeout,
        }
    }

    /// Resolve `raw` into a descriptor. Never fails: lookup errors, misses,
    /// and timeouts all degrade to [`Target::UnresolvedUrl`].
    pub async fn resolve(&self, raw: &str) -> TargetDescriptor {
        let username = match classify(raw, &self.thresholds) {
            Classification::Resolved(descriptor) => {
                debug!(kind = %descriptor.kind(), "target classified");
                return descriptor;
            }
            Classification::NeedsLookup { username } => username,
        };

        let outcome =
            tokio::time::timeout(self.lookup_timeout, self.lookup.username_to_id(&username)).await;

        let target = match outcome {
            Ok(Ok(Some(id))) if is_all_digits(&id) => {
                debug!(%username, %id, "username resolved");
                Target::UserId(id)
            }
            Ok(Ok(Some(id))) => {
                warn!(%username, %id, "identity lookup returned a non-numeric id");
                Target::UnresolvedUrl { username }
            }
            Ok(Ok(None)) => {
                warn!(%username, "identity lookup found no such user");
                Target::UnresolvedUrl { username }
            }
            Ok(Err(e)) => {
                warn!(%username, error = %e, "identity lookup failed");
                Target::UnresolvedUrl { username }
            }
            Err(_) => {
                warn!(
                    %username,
                    timeout_secs = self.lookup_timeout.as_secs(),
                    "identity lookup timed out"
                );
                Target::UnresolvedUrl { username }
            }
        };

        TargetDescriptor::new(target, raw)
    }
}

/// Best-effort thread id guess derived from a user id.
///
/// Ids shorter than 15 digits are zero-padded to 17, longer ones truncated to
/// 17. No remote confirmation is performed; this is a display hint only and
/// must never be used as a delivery target.
pub fn heuristic_thread_id(user_id: &str) -> String {
    if user_id.len() < 15 {
        format!("{user_id:0>width$}", width = HEURISTIC_THREAD_ID_LEN)
    } else {
        user_id.chars().take(HEURISTIC_THREAD_ID_LEN).collect()
    }
}

fn is_all_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

fn parse_profile_url(text: &str) -> Option<Url> {
    let url = Url::parse(text)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .or_else(|| {
            if text.contains("://") || text.contains(char::is_whitespace) {
                None
            } else {
                Url::parse(&format!("https://{text}")).ok()
            }
        })?;

    let host = url.host_str()?.to_ascii_lowercase();
    let known = PROFILE_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{h}")));
    known.then_some(url)
}

fn username_segment(url: &Url) -> Option<String> {
    let first = url.path_segments()?.find(|s| !s.is_empty())?;
    if RESERVED_SEGMENTS.contains(&first.to_ascii_lowercase().as_str()) || is_all_digits(first) {
        return None;
    }
    USERNAME
        .as_ref()
        .filter(|re| re.is_match(first))
        .map(|_| first.to_owned())
}
