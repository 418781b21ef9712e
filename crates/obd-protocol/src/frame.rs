//! Reply Framing
//!
//! Splits the adapter's byte stream into discrete reply lines. The ELM327
//! ends every reply with its `>` prompt and separates lines with CR (plus LF
//! when linefeeds are enabled), so any of those bytes closes a frame.

use thiserror::Error;

/// Default cap on buffered bytes without a delimiter
pub const DEFAULT_FRAME_LIMIT: usize = 4096;

/// Adapter prompt character
pub const PROMPT: u8 = b'>';

/// Framing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// More than `limit` bytes arrived without a delimiter
    ///
    /// `frames` holds the frames the same chunk completed before the cap
    /// was hit; they are valid replies and should still be delivered.
    #[error("Framing overflow: more than {limit} bytes without a delimiter")]
    Overflow { limit: usize, frames: Vec<String> },
}

/// Incremental frame assembler with carry-over between reads
#[derive(Debug, Clone)]
pub struct FrameReader {
    buffer: String,
    limit: usize,
}

impl FrameReader {
    /// Create a reader with the default buffer cap
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_FRAME_LIMIT)
    }

    /// Create a reader that fails once `limit` bytes are buffered
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit,
        }
    }

    /// Feed raw bytes, returning every frame they complete
    ///
    /// Frames are trimmed and empty frames are dropped. Bytes after the last
    /// delimiter stay buffered for the next call. Non-ASCII bytes are
    /// discarded. On overflow the buffer is cleared and the frames completed
    /// so far travel on the error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, FrameError> {
        let mut frames = Vec::new();

        for &byte in bytes {
            if is_delimiter(byte) {
                let frame = self.buffer.trim();
                if !frame.is_empty() {
                    frames.push(frame.to_string());
                }
                self.buffer.clear();
            } else if byte.is_ascii() {
                if self.buffer.len() >= self.limit {
                    self.buffer.clear();
                    return Err(FrameError::Overflow {
                        limit: self.limit,
                        frames,
                    });
                }
                self.buffer.push(byte as char);
            }
        }

        Ok(frames)
    }

    /// Bytes received since the last delimiter
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_delimiter(byte: u8) -> bool {
    matches!(byte, PROMPT | b'\r' | b'\n')
}
