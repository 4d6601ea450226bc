//! The database proper: keyspace + expires, and the deferred-free
//! decisions.

use fredis_dict::{BytesKeys, Dict, DictEntry};
use fredis_error::{FredisError, Result};
use fredis_jobs::{BackgroundWorkers, Job};
use fredis_types::Object;
use tracing::debug;

/// The main key → object dictionary.
pub type Keyspace = Dict<Vec<u8>, Object, BytesKeys>;

/// Key → absolute expiry, unix milliseconds.
pub type Expires = Dict<Vec<u8>, i64, BytesKeys>;

/// Destructor effort above which a value is freed on the lazy-free
/// worker instead of the request thread. Effort is measured in
/// container elements (see [`Object::free_effort`]); below the
/// threshold the synchronous drop is cheaper than queueing.
pub const LAZYFREE_THRESHOLD: usize = 64;

/// One numbered database of the server.
pub struct Database {
    dict: Keyspace,
    expires: Expires,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dict: Keyspace::new(BytesKeys),
            expires: Expires::new(BytesKeys),
        }
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dict.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Number of keys carrying an expiry.
    #[must_use]
    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    /// The keyspace dictionary, for traversal.
    #[must_use]
    pub fn keyspace(&self) -> &Keyspace {
        &self.dict
    }

    /// The expires dictionary, for traversal.
    #[must_use]
    pub fn expires(&self) -> &Expires {
        &self.expires
    }

    // === Point operations ===

    /// Add a key that must not exist yet.
    pub fn add(&mut self, key: Vec<u8>, object: Object) -> Result<()> {
        self.dict.add(key, object)
    }

    /// Install the object under the key, overwriting any previous
    /// value. Returns `true` when the key is new.
    pub fn set(&mut self, key: Vec<u8>, object: Object) -> bool {
        self.dict.replace(key, object)
    }

    /// Look a key up, letting the lookup pay one rehash step.
    pub fn get(&mut self, key: &[u8]) -> Option<&Object> {
        self.dict.fetch(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Object> {
        self.dict.find_mut(key).map(DictEntry::value_mut)
    }

    /// Read-only lookup for shared-borrow paths (snapshot writer).
    #[must_use]
    pub fn peek(&self, key: &[u8]) -> Option<&Object> {
        self.dict.peek(key).map(DictEntry::value)
    }

    // === Expiry ===

    /// Attach an absolute expiry to an existing key.
    pub fn set_expire(&mut self, key: &[u8], at_unix_ms: i64) -> Result<()> {
        if self.dict.peek(key).is_none() {
            return Err(FredisError::KeyNotFound);
        }
        self.expires.replace(key.to_vec(), at_unix_ms);
        Ok(())
    }

    /// The key's absolute expiry, if any.
    #[must_use]
    pub fn expire_at(&self, key: &[u8]) -> Option<i64> {
        self.expires.peek(key).map(|entry| *entry.value())
    }

    /// Detach the key's expiry. Returns whether one was present.
    pub fn clear_expire(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key).is_ok()
    }

    // === Removal ===

    /// Remove a key synchronously, running destructors on the calling
    /// thread.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        if self.expires.len() > 0 {
            let _ = self.expires.remove(key);
        }
        self.dict.remove(key)
    }

    /// Remove a key, deferring an expensive destructor to the
    /// lazy-free worker. Cheap values are dropped inline: queueing
    /// costs more than their destructor.
    pub fn remove_async(&mut self, key: &[u8], workers: &BackgroundWorkers) -> Result<()> {
        if self.expires.len() > 0 {
            let _ = self.expires.remove(key);
        }
        let entry = self.dict.unlink(key)?;
        if entry.value().free_effort() > LAZYFREE_THRESHOLD {
            debug!(effort = entry.value().free_effort(), "deferring value free");
            workers.submit(Job::LazyFree(entry));
        }
        Ok(())
    }

    /// Drop every key synchronously.
    pub fn clear(&mut self) {
        self.dict.clear();
        self.expires.clear();
    }

    /// Retire both tables to the lazy-free worker and start empty.
    /// The worker drops the pair as one job, keeping multi-million
    /// entry flushes off the request thread.
    pub fn clear_async(&mut self, workers: &BackgroundWorkers) {
        let dict = std::mem::replace(&mut self.dict, Keyspace::new(BytesKeys));
        let expires = std::mem::replace(&mut self.expires, Expires::new(BytesKeys));
        if dict.is_empty() && expires.is_empty() {
            return;
        }
        debug!(keys = dict.len(), "deferring database free");
        workers.submit(Job::LazyFree(Box::new((dict, expires))));
    }

    // === Sizing ===

    /// Pre-size both tables from a snapshot's resize hints so loading
    /// does not rehash its way up from the initial size.
    pub fn expand_hints(&mut self, db_size: usize, expires_size: usize) {
        // Rejections (tiny hints, rehash in progress) only cost us the
        // pre-sizing, never correctness.
        let _ = self.dict.expand(db_size);
        let _ = self.expires.expand(expires_size);
    }

    /// Give both dictionaries a slice of wall clock to advance any
    /// in-flight migration. Returns the number of chunked steps.
    pub fn rehash_for_ms(&mut self, ms: u64) -> usize {
        let mut steps = 0;
        if self.dict.is_rehashing() {
            steps += self.dict.rehash_for_ms(ms);
        }
        if self.expires.is_rehashing() {
            steps += self.expires.rehash_for_ms(ms);
        }
        steps
    }

    /// Shrink sparse tables back toward their load target.
    pub fn resize_to_fit(&mut self) {
        let _ = self.dict.resize_to_fit();
        let _ = self.expires.resize_to_fit();
    }
}
