//! Process-wide memoisation of built indexes.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::index::LazyIndex;
use crate::vocabulary::Vocabulary;
use crate::Result;

/// Cache key: a collision-resistant digest over the regex source and the
/// vocabulary digest.
pub type Fingerprint = [u8; 32];

pub fn fingerprint(regex: &str, vocabulary: &Vocabulary) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(regex.as_bytes());
    hasher.update(vocabulary.digest());
    hasher.finalize().into()
}

/// Keyed memo of in-flight and finished builds.
///
/// Entries are held weakly: the cache never keeps an index alive on its own,
/// and an entry whose last external owner is gone is replaced on the next
/// request for its key.
pub struct IndexCache {
    entries: Mutex<HashMap<Fingerprint, Weak<LazyIndex>>>,
    disabled: AtomicBool,
}

impl IndexCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::default()),
            disabled: AtomicBool::new(!enabled),
        }
    }

    /// Returns the shared handle for `(regex, vocabulary)`, building it if no
    /// live handle exists.
    ///
    /// The lookup and insert happen under one short-lived lock, so concurrent
    /// callers with the same key always end up sharing a single handle and a
    /// single background build.
    pub fn get_or_build(&self, regex: &str, vocabulary: &Vocabulary) -> Result<Arc<LazyIndex>> {
        if self.is_disabled() {
            return Ok(Arc::new(LazyIndex::new(regex, vocabulary)?));
        }

        let key = fingerprint(regex, vocabulary);
        let mut entries = self.entries.lock();
        if let Some(index) = entries.get(&key).and_then(Weak::upgrade) {
            trace!(target: "fsm_index::cache", "index cache hit");
            return Ok(index);
        }
        let index = Arc::new(LazyIndex::new(regex, vocabulary)?);
        entries.insert(key, Arc::downgrade(&index));
        Ok(index)
    }

    /// Drops every entry. Live handles stay valid; only the memo is gone.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Bypasses the cache for the rest of the process lifetime.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }
}

/// Truthy values of `DISABLE_CACHE` bypass the cache from startup.
fn cache_disabled(value: Option<&str>) -> bool {
    match value {
        Some(value) => !matches!(value.trim(), "" | "0" | "false" | "False" | "FALSE"),
        None => false,
    }
}

static CACHE: Lazy<IndexCache> =
    Lazy::new(|| IndexCache::new(!cache_disabled(env::var("DISABLE_CACHE").ok().as_deref())));

/// The process-wide cache consulted by [`crate::build`].
pub fn cache() -> &'static IndexCache {
    &CACHE
}
