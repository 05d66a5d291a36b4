//! Envelope sealing and opening.
//!
//! # Envelope format
//!
//! `base64url( version (1) || nonce (12) || ciphertext + tag (16) )`
//!
//! The cipher is ChaCha20-Poly1305 with a random nonce per message, so two
//! seals of the same plaintext never produce the same envelope. The version
//! byte is bound as associated data.
//!
//! # Framing
//!
//! The transmitted body wraps the envelope in human-readable text:
//!
//! ```text
//! 🔐 E2EE ENCRYPTED MESSAGE
//! ENCRYPTED_MESSAGE_START
//! <envelope>
//! ENCRYPTED_MESSAGE_END
//! ⏰ 14:05:09
//! ```
//!
//! [`open`] finds the envelope between the markers, or falls back to trying
//! the whole text and then each line.

use base64::alphabet;
use base64::engine::general_purpose::URL_SAFE;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, TimeZone};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::vault::CryptoKey;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// ChaCha20-Poly1305 nonce length.
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Line preceding the envelope in a framed body.
pub const START_MARKER: &str = "ENCRYPTED_MESSAGE_START";

/// Line following the envelope in a framed body.
pub const END_MARKER: &str = "ENCRYPTED_MESSAGE_END";

/// Default banner placed above the envelope.
pub const DEFAULT_HEADER: &str = "🔐 E2EE ENCRYPTED MESSAGE";

/// Accepts padded and unpadded base64url on input.
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Errors from opening an envelope. Never carries partial plaintext.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    /// The input contained no candidate envelope text.
    #[error("no envelope found in message body")]
    NotFound,

    /// The envelope text is not valid base64url.
    #[error("envelope is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// The decoded envelope is too short to hold version, nonce, and tag.
    #[error("envelope is truncated ({0} bytes)")]
    Truncated(usize),

    /// The envelope was produced by an unknown format version.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    /// Authentication failed: wrong key or tampered ciphertext.
    #[error("authentication failed: wrong key or tampered ciphertext")]
    Authentication,

    /// The authenticated plaintext is not UTF-8.
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Encryption failure. Only reachable if the AEAD rejects the input length.
#[derive(Debug, thiserror::Error)]
#[error("encryption failed: {0}")]
pub struct SealError(String);

/// Encrypt `plaintext` under `key` and return the base64url envelope.
///
/// # Errors
///
/// Returns [`SealError`] if the cipher rejects the input.
pub fn seal(plaintext: &str, key: &CryptoKey) -> Result<String, SealError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_bytes(),
                aad: &[ENVELOPE_VERSION],
            },
        )
        .map_err(|e| SealError(e.to_string()))?;

    let mut raw = Vec::with_capacity(ciphertext.len().saturating_add(1 + NONCE_LEN));
    raw.push(ENVELOPE_VERSION);
    raw.extend_from_slice(&nonce);
    raw.extend_from_slice(&ciphertext);

    Ok(URL_SAFE.encode(raw))
}

/// Locate, authenticate, and decrypt an envelope inside `text`.
///
/// `text` may be a bare envelope or a framed body. Without markers every
/// non-empty line is tried in turn; the first that opens wins.
///
/// # Errors
///
/// Returns [`DecryptError`] when no envelope opens under `key`.
pub fn open(text: &str, key: &CryptoKey) -> Result<String, DecryptError> {
    if let Some(envelope) = extract_marked(text) {
        return open_envelope(envelope, key);
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecryptError::NotFound);
    }

    let mut best = match open_envelope(trimmed, key) {
        Ok(plaintext) => return Ok(plaintext),
        Err(e) => e,
    };

    for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line == trimmed {
            continue;
        }
        match open_envelope(line, key) {
            Ok(plaintext) => return Ok(plaintext),
            // A structurally valid envelope explains the failure better than
            // a line that was never base64 to begin with.
            Err(e) if rank(&e) > rank(&best) => best = e,
            Err(_) => {}
        }
    }

    Err(best)
}

/// Wrap an envelope in the outer message body.
pub fn frame<Tz: TimeZone>(envelope: &str, header: &str, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{header}\n{START_MARKER}\n{envelope}\n{END_MARKER}\n⏰ {}",
        now.format("%H:%M:%S")
    )
}

/// Seal `plaintext` and frame the envelope in one step.
///
/// Returns `(envelope, body)`.
///
/// # Errors
///
/// Returns [`SealError`] if encryption fails.
pub fn seal_framed<Tz: TimeZone>(
    plaintext: &str,
    key: &CryptoKey,
    header: &str,
    now: &DateTime<Tz>,
) -> Result<(String, String), SealError>
where
    Tz::Offset: std::fmt::Display,
{
    let envelope = seal(plaintext, key)?;
    let body = frame(&envelope, header, now);
    Ok((envelope, body))
}

fn open_envelope(envelope: &str, key: &CryptoKey) -> Result<String, DecryptError> {
    let raw = LENIENT_URL_SAFE.decode(envelope.trim())?;
    if raw.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(DecryptError::Truncated(raw.len()));
    }

    let version = raw[0];
    if version != ENVELOPE_VERSION {
        return Err(DecryptError::UnsupportedVersion(version));
    }

    let (nonce, ciphertext) = raw[1..].split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &[version],
            },
        )
        .map_err(|_| DecryptError::Authentication)?;

    String::from_utf8(plaintext).map_err(|_| DecryptError::InvalidUtf8)
}

/// Text between the start marker and the end marker (or the next line).
fn extract_marked(text: &str) -> Option<&str> {
    let start = text.find(START_MARKER)?;
    let rest = text.get(start..)?.strip_prefix(START_MARKER)?;
    let candidate = match rest.find(END_MARKER) {
        Some(end) => &rest[..end],
        None => rest.trim_start().lines().next().unwrap_or_default(),
    };
    let candidate = candidate.trim();
    if candidate.is_empty() {
        None
    } else {
        Some(candidate)
    }
}

fn rank(error: &DecryptError) -> u8 {
    match error {
        DecryptError::NotFound => 0,
        DecryptError::Encoding(_) => 1,
        DecryptError::Truncated(_) => 2,
        DecryptError::UnsupportedVersion(_) => 3,
        DecryptError::InvalidUtf8 => 4,
        DecryptError::Authentication => 5,
    }
}
