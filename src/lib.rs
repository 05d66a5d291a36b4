//! Sealpost: a rotating encrypted-message dispatcher.
//!
//! Single Rust binary. Resolves a recipient identifier, seals each message in
//! a ChaCha20-Poly1305 envelope under a password-derived key, and delivers the
//! rotating message set through the Messenger Graph API on a fixed interval,
//! backing off after failures.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;

pub mod codec;
pub mod ring;
pub mod target;
pub mod vault;

pub mod audit;
pub mod dispatch;
pub mod transport;
