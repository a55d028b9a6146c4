//! Script sources: stable identity plus a modification stamp.

use crate::error::{EngineError, Result};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// An addressable script.
///
/// Equality of sources is defined by [`id`](Source::id) alone. The
/// modification stamp is opaque: consumers must only ever compare stamps for
/// inequality, never for ordering.
pub trait Source: fmt::Debug + Send + Sync {
    /// Stable identifier for this source.
    fn id(&self) -> &str;

    /// Opaque stamp that changes whenever the source content changes.
    fn modification_stamp(&self) -> u64;

    /// The script text, for sources that carry it inline.
    fn text(&self) -> Option<String> {
        None
    }
}

/// An in-memory script source.
///
/// The text can be replaced after creation; the modification stamp is a
/// fingerprint of the current text, so any edit changes the stamp.
#[derive(Debug)]
pub struct MemorySource {
    id: String,
    text: RwLock<String>,
    stamp: AtomicU64,
}

impl MemorySource {
    /// Errors if the id is empty.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(EngineError::invalid_argument("memory source requires an id"));
        }
        let text = text.into();
        let stamp = text_fingerprint(&text);
        Ok(Self { id, text: RwLock::new(text), stamp: AtomicU64::new(stamp) })
    }

    /// Replaces the script text and refreshes the modification stamp.
    pub fn set_text(&self, text: impl Into<String>) {
        let text = text.into();
        let stamp = text_fingerprint(&text);
        *self.text.write() = text;
        self.stamp.store(stamp, Ordering::Release);
    }
}

impl Source for MemorySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn modification_stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    fn text(&self) -> Option<String> {
        Some(self.text.read().clone())
    }
}

fn text_fingerprint(text: &str) -> u64 {
    let digest: [u8; 16] = Md5::digest(text.as_bytes()).into();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}
