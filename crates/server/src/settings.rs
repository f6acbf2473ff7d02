//! Per-connection delivery settings.
//!
//! The thresholds and the visibility flag are read on every send and written
//! by the command dispatcher, so each lives in its own atomic. The digest
//! field list is replaced as a whole and read while building digests; it has
//! a dedicated lock that is never held across an await.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use protocol::Header;

/// Digest threshold of a fresh connection: never digest.
pub const DEFAULT_DIGEST_THRESHOLD: i32 = -1;

/// Compression threshold of a fresh connection, in bytes.
pub const DEFAULT_COMPRESS_THRESHOLD: i32 = 512;

/// Mutable settings of one server-side connection.
#[derive(Debug)]
pub struct ConnSettings {
    digest_threshold: AtomicI32,
    compress_threshold: AtomicI32,
    visible: AtomicBool,
    digest_fields: Mutex<Vec<String>>,
}

impl Default for ConnSettings {
    fn default() -> Self {
        Self::new(DEFAULT_DIGEST_THRESHOLD, DEFAULT_COMPRESS_THRESHOLD)
    }
}

impl ConnSettings {
    /// Creates settings with the given thresholds, visible and with no
    /// digest fields.
    pub fn new(digest_threshold: i32, compress_threshold: i32) -> Self {
        Self {
            digest_threshold: AtomicI32::new(digest_threshold),
            compress_threshold: AtomicI32::new(compress_threshold),
            visible: AtomicBool::new(true),
            digest_fields: Mutex::new(Vec::new()),
        }
    }

    /// Message size above which a digest is sent instead. Negative disables.
    pub fn digest_threshold(&self) -> i32 {
        self.digest_threshold.load(Ordering::Acquire)
    }

    pub fn set_digest_threshold(&self, threshold: i32) {
        self.digest_threshold.store(threshold, Ordering::Release);
    }

    /// Message size above which frames are compressed. Zero or negative disables.
    pub fn compress_threshold(&self) -> i32 {
        self.compress_threshold.load(Ordering::Acquire)
    }

    pub fn set_compress_threshold(&self, threshold: i32) {
        self.compress_threshold.store(threshold, Ordering::Release);
    }

    pub fn visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Release);
    }

    /// Returns a copy of the digest field list.
    pub fn digest_fields(&self) -> Vec<String> {
        self.fields().clone()
    }

    /// Replaces the digest field list.
    pub fn set_digest_fields(&self, fields: Vec<String>) {
        *self.fields() = fields;
    }

    /// True if a message of `size` bytes must be replaced by a digest.
    ///
    /// A message exactly at the threshold is still sent in full.
    pub fn should_digest(&self, size: usize) -> bool {
        exceeds(self.digest_threshold(), size, 0)
    }

    /// True if a frame for a message of `size` bytes should be compressed.
    pub fn should_compress(&self, size: usize) -> bool {
        exceeds(self.compress_threshold(), size, 1)
    }

    /// Collects the digest fields present in `header` or `extra`.
    ///
    /// When a field appears in both, the value from `extra` wins.
    pub fn digest_info(&self, header: &Header, extra: Option<&Header>) -> Header {
        let fields = self.fields();
        let mut info = Header::new();
        for field in fields.iter() {
            let value = extra
                .and_then(|extra| extra.get(field))
                .or_else(|| header.get(field));
            if let Some(value) = value {
                info.insert(field.clone(), value.clone());
            }
        }
        info
    }

    fn fields(&self) -> MutexGuard<'_, Vec<String>> {
        self.digest_fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// `threshold >= min && threshold < size`, without overflow.
fn exceeds(threshold: i32, size: usize, min: i32) -> bool {
    threshold >= min && (threshold as usize) < size
}
