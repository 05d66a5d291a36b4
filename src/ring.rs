//! Cyclic message rotation.

use std::path::{Path, PathBuf};

/// Errors from building or reloading a [`MessageRing`].
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// A ring must hold at least one message.
    #[error("message ring requires at least one message")]
    EmptyRing,

    /// The message source could not be read.
    #[error("failed to read messages from {}: {source}", path.display())]
    Read {
        /// Message file path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Ordered, non-empty message list with a cursor.
///
/// The cursor only moves on [`MessageRing::advance`], which callers invoke
/// after a confirmed delivery. A failed send leaves the cursor in place so the
/// same message is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRing {
    items: Vec<String>,
    cursor: usize,
}

impl MessageRing {
    /// Build a ring positioned at the first item.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::EmptyRing`] if `items` is empty.
    pub fn new(items: Vec<String>) -> Result<Self, RingError> {
        if items.is_empty() {
            return Err(RingError::EmptyRing);
        }
        Ok(Self { items, cursor: 0 })
    }

    /// Message at the cursor, and whether advancing past it completes a cycle.
    pub fn next(&self) -> (&str, bool) {
        (&self.items[self.cursor], self.following() == 0)
    }

    /// Move the cursor forward. Returns `true` when it wraps back to 0.
    pub fn advance(&mut self) -> bool {
        self.cursor = self.following();
        self.cursor == 0
    }

    fn following(&self) -> usize {
        self.cursor
            .checked_add(1)
            .and_then(|next| next.checked_rem(self.items.len()))
            .unwrap_or(0)
    }

    /// Replace all items and rewind to the start.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::EmptyRing`] if `items` is empty; the ring is left
    /// unchanged.
    pub fn reload(&mut self, items: Vec<String>) -> Result<(), RingError> {
        if items.is_empty() {
            return Err(RingError::EmptyRing);
        }
        self.items = items;
        self.cursor = 0;
        Ok(())
    }

    /// Current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always `false` for a constructed ring.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Split text into messages: one per line, trimmed. Blank lines and lines
/// starting with `#` are dropped.
pub fn parse_messages(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

/// Read a message file.
///
/// # Errors
///
/// Returns [`RingError::Read`] if the file cannot be read, or
/// [`RingError::EmptyRing`] if it holds no non-blank lines.
pub fn load_messages(path: &Path) -> Result<Vec<String>, RingError> {
    let text = std::fs::read_to_string(path).map_err(|source| RingError::Read {
        path: path.to_owned(),
        source,
    })?;
    let items = parse_messages(&text);
    if items.is_empty() {
        return Err(RingError::EmptyRing);
    }
    Ok(items)
}
