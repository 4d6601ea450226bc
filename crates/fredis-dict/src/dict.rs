//! Core dictionary: tables, entries, incremental rehash, and the
//! point operations.

use std::borrow::Borrow;
use std::cell::Cell;
use std::time::{Duration, Instant};

use fredis_error::{FredisError, Result};
use rand::Rng;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::iter::Iter;

/// Initial bucket count of a freshly used table.
pub const INITIAL_SIZE: usize = 4;

/// Load ratio above which a table grows even when the process-wide
/// resize switch is off.
const FORCE_RESIZE_RATIO: usize = 5;

/// Bucket migrations per chunk inside [`Dict::rehash_for_ms`].
const REHASH_BATCH: usize = 100;

/// The per-dictionary key capability: how keys hash and compare.
///
/// Different stores share the container with different key semantics
/// (the keyspace, the expires table, a script cache), so hashing and
/// equality are supplied per dictionary rather than baked into the key
/// type. Duplication and destruction, which the capability also covers
/// in pointer-based designs, are `Clone` and `Drop` here.
///
/// Implementations must keep `hash` and `key_eq` consistent across
/// every borrowed form of the key they are instantiated with: two keys
/// that compare equal must hash equally.
pub trait DictType<K: ?Sized> {
    fn hash(&self, key: &K) -> u64;
    fn key_eq(&self, a: &K, b: &K) -> bool;
}

/// Byte-string keys hashed with the process-seeded xxh3.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesKeys;

impl<K: ?Sized + AsRef<[u8]>> DictType<K> for BytesKeys {
    fn hash(&self, key: &K) -> u64 {
        xxh3_64_with_seed(key.as_ref(), crate::hash_seed())
    }

    fn key_eq(&self, a: &K, b: &K) -> bool {
        a.as_ref() == b.as_ref()
    }
}

/// One key/value record. Records sharing a bucket form a singly
/// linked chain; each record owns its successor.
#[derive(Debug)]
pub struct DictEntry<K, V> {
    pub(crate) key: K,
    pub(crate) val: V,
    pub(crate) next: Link<K, V>,
}

pub(crate) type Link<K, V> = Option<Box<DictEntry<K, V>>>;

impl<K, V> DictEntry<K, V> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &V {
        &self.val
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.val
    }

    /// Consume a detached entry, running no destructors beyond the
    /// caller's own use of the parts.
    #[must_use]
    pub fn into_pair(self) -> (K, V) {
        (self.key, self.val)
    }
}

/// One of the two bucket arrays.
#[derive(Debug)]
pub(crate) struct Table<K, V> {
    pub(crate) buckets: Box<[Link<K, V>]>,
    pub(crate) used: usize,
}

impl<K, V> Table<K, V> {
    fn unallocated() -> Self {
        Self {
            buckets: Vec::new().into_boxed_slice(),
            used: 0,
        }
    }

    fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Self {
            buckets: buckets.into_boxed_slice(),
            used: 0,
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.buckets.len()
    }

    /// `size - 1`; only meaningful on an allocated table.
    #[inline]
    pub(crate) fn mask(&self) -> usize {
        self.buckets.len().wrapping_sub(1)
    }
}

/// Summary counters for one dictionary, main table view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DictStats {
    /// Bucket count of the main table.
    pub size: usize,
    /// Live entries across both tables.
    pub used: usize,
    /// Non-empty buckets in the main table.
    pub buckets_used: usize,
    /// Longest chain in the main table.
    pub max_chain_length: usize,
    /// Whether an incremental rehash is in progress.
    pub rehashing: bool,
}

/// The dictionary proper. See the crate docs for the traversal
/// contracts; the type itself is single-writer by design and is not
/// `Sync`.
#[derive(Debug)]
pub struct Dict<K, V, T: DictType<K>> {
    pub(crate) ty: T,
    pub(crate) tables: [Table<K, V>; 2],
    /// Next main-table bucket awaiting migration; `None` when no
    /// rehash is in progress. Every bucket below it is empty.
    pub(crate) rehash_idx: Option<usize>,
    /// Live safe iterators. While non-zero, incremental rehash steps
    /// are suppressed so bucket positions cannot move mid-walk.
    pub(crate) safe_iterators: Cell<usize>,
}

impl<K, V, T: DictType<K> + Default> Default for Dict<K, V, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<K, V, T: DictType<K>> Dict<K, V, T> {
    #[must_use]
    pub fn new(ty: T) -> Self {
        Self {
            ty,
            tables: [Table::unallocated(), Table::unallocated()],
            rehash_idx: None,
            safe_iterators: Cell::new(0),
        }
    }

    /// Live entries across both tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total allocated buckets across both tables.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.tables[0].size() + self.tables[1].size()
    }

    #[must_use]
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx.is_some()
    }

    /// Hash a key with this dictionary's capability.
    pub fn hash_key<Q>(&self, key: &Q) -> u64
    where
        Q: ?Sized,
        T: DictType<Q>,
    {
        DictType::<Q>::hash(&self.ty, key)
    }

    // === Sizing ===

    /// Grow (or first-allocate) so the table holds at least `size`
    /// buckets, rounded up to a power of two.
    ///
    /// Rejected while a rehash is running, when `size` is below the
    /// live entry count, and when the rounded size equals the current
    /// one (rehashing to the same size does no work).
    pub fn expand(&mut self, size: usize) -> Result<()> {
        if self.is_rehashing() {
            return Err(FredisError::RehashInProgress);
        }
        if self.tables[0].used > size {
            return Err(FredisError::InvalidResize {
                target: size,
                used: self.tables[0].used,
            });
        }
        let real_size = next_power(size);
        if real_size == self.tables[0].size() {
            return Err(FredisError::InvalidResize {
                target: size,
                used: self.tables[0].used,
            });
        }

        let table = Table::with_size(real_size);
        if self.tables[0].buckets.is_empty() {
            // First allocation: no entries to migrate, not a rehash.
            self.tables[0] = table;
            return Ok(());
        }
        self.tables[1] = table;
        self.rehash_idx = Some(0);
        Ok(())
    }

    /// Shrink the table to the smallest power of two that keeps the
    /// load ratio at or below one.
    pub fn resize_to_fit(&mut self) -> Result<()> {
        if !crate::resize_enabled() {
            return Err(FredisError::ResizeDisabled);
        }
        if self.is_rehashing() {
            return Err(FredisError::RehashInProgress);
        }
        let minimal = self.tables[0].used.max(INITIAL_SIZE);
        self.expand(minimal)
    }

    /// Allocate or grow ahead of an insert.
    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.tables[0].size() == 0 {
            // expand cannot be rejected: the table is unallocated.
            let _ = self.expand(INITIAL_SIZE);
            return;
        }
        let used = self.tables[0].used;
        let size = self.tables[0].size();
        if used >= size && (crate::resize_enabled() || used / size > FORCE_RESIZE_RATIO) {
            // expand cannot be rejected: no rehash is active and the
            // target exceeds the live count.
            let _ = self.expand(used * 2);
        }
    }

    // === Incremental rehash ===

    /// Perform up to `n` bucket migrations. Returns `true` while keys
    /// remain in the old table.
    ///
    /// Empty buckets at the cursor are skipped but bounded: after
    /// `n * 10` empty probes the call yields even if it migrated
    /// nothing, so a sparse table cannot stall the caller.
    pub fn rehash(&mut self, n: usize) -> bool {
        let mut empty_visits = n * 10;
        if !self.is_rehashing() {
            return false;
        }

        let mut steps = n;
        while steps > 0 && self.tables[0].used != 0 {
            steps -= 1;

            let mut idx = self.rehash_idx.expect("rehash cursor set while rehashing");
            debug_assert!(idx < self.tables[0].size());
            while self.tables[0].buckets[idx].is_none() {
                idx += 1;
                self.rehash_idx = Some(idx);
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }

            // Migrate every entry of this bucket to its new position.
            let mut chain = self.tables[0].buckets[idx].take();
            while let Some(mut entry) = chain {
                chain = entry.next.take();
                let dest = (self.ty.hash(&entry.key) as usize) & self.tables[1].mask();
                entry.next = self.tables[1].buckets[dest].take();
                self.tables[1].buckets[dest] = Some(entry);
                self.tables[0].used -= 1;
                self.tables[1].used += 1;
            }
            self.rehash_idx = Some(idx + 1);
        }

        if self.tables[0].used == 0 {
            self.tables[0] = std::mem::replace(&mut self.tables[1], Table::unallocated());
            self.rehash_idx = None;
            return false;
        }
        true
    }

    /// Rehash in chunks of 100 buckets until at least `ms`
    /// milliseconds of wall clock have elapsed or the migration
    /// completes. Returns the number of chunked steps performed.
    pub fn rehash_for_ms(&mut self, ms: u64) -> usize {
        let start = Instant::now();
        let budget = Duration::from_millis(ms);
        let mut rehashes = 0;
        while self.rehash(REHASH_BATCH) {
            rehashes += REHASH_BATCH;
            if start.elapsed() > budget {
                break;
            }
        }
        rehashes
    }

    /// One piggybacked migration step, skipped while a safe iterator
    /// is live (relocating buckets under an iterator would double
    /// yield or drop entries).
    pub(crate) fn rehash_step(&mut self) {
        if self.safe_iterators.get() == 0 {
            self.rehash(1);
        }
    }

    // === Point operations ===

    /// Insert a new key. Fails with [`FredisError::KeyExists`] if the
    /// key is already present.
    pub fn add(&mut self, key: K, val: V) -> Result<()> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.ty.hash(&key);
        let Some((table, idx)) = self.free_slot(&key, hash) else {
            return Err(FredisError::KeyExists);
        };
        self.link_front(table, idx, key, val);
        Ok(())
    }

    /// Insert the key if absent (value built lazily), otherwise hand
    /// back the existing entry. The flag is `true` when a new entry
    /// was created.
    pub fn add_or_find_with(
        &mut self,
        key: K,
        make: impl FnOnce() -> V,
    ) -> (&mut DictEntry<K, V>, bool) {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.ty.hash(&key);
        match self.free_slot(&key, hash) {
            Some((table, idx)) => {
                self.link_front(table, idx, key, make());
                let entry = self.tables[table].buckets[idx]
                    .as_deref_mut()
                    .expect("bucket head was just installed");
                (entry, true)
            }
            None => {
                let entry = self
                    .find_entry_mut(&key, hash)
                    .expect("free_slot reported the key as present");
                (entry, false)
            }
        }
    }

    /// Install `val` under `key`, overwriting any previous value.
    /// Returns `true` when the key was newly added, `false` when an
    /// existing value was replaced. The old value is dropped only
    /// after the new one is in place.
    pub fn replace(&mut self, key: K, val: V) -> bool {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.ty.hash(&key);
        if let Some(entry) = self.find_entry_mut(&key, hash) {
            let old = std::mem::replace(&mut entry.val, val);
            drop(old);
            return false;
        }
        let (table, idx) = self
            .free_slot(&key, hash)
            .expect("key was just found absent");
        self.link_front(table, idx, key, val);
        true
    }

    /// Look the key up, advancing the rehash by one step first when
    /// one is active.
    pub fn find<Q>(&mut self, key: &Q) -> Option<&DictEntry<K, V>>
    where
        Q: ?Sized,
        K: Borrow<Q>,
        T: DictType<Q>,
    {
        if self.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.peek(key)
    }

    /// Read-only lookup that never advances the rehash. Used on paths
    /// that only hold a shared borrow, like the snapshot writer
    /// resolving expires while iterating the keyspace.
    pub fn peek<Q>(&self, key: &Q) -> Option<&DictEntry<K, V>>
    where
        Q: ?Sized,
        K: Borrow<Q>,
        T: DictType<Q>,
    {
        if self.is_empty() {
            return None;
        }
        let hash = DictType::<Q>::hash(&self.ty, key);
        for table in &self.tables {
            if table.size() == 0 {
                break;
            }
            let idx = (hash as usize) & table.mask();
            let mut cur = table.buckets[idx].as_deref();
            while let Some(entry) = cur {
                if DictType::<Q>::key_eq(&self.ty, key, entry.key.borrow()) {
                    return Some(entry);
                }
                cur = entry.next.as_deref();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// [`Dict::find`], projected to the value.
    pub fn fetch<Q>(&mut self, key: &Q) -> Option<&V>
    where
        Q: ?Sized,
        K: Borrow<Q>,
        T: DictType<Q>,
    {
        self.find(key).map(DictEntry::value)
    }

    /// Mutable lookup with the same contract as [`Dict::find`].
    pub fn find_mut<Q>(&mut self, key: &Q) -> Option<&mut DictEntry<K, V>>
    where
        Q: ?Sized,
        K: Borrow<Q>,
        T: DictType<Q>,
    {
        if self.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = DictType::<Q>::hash(&self.ty, key);
        self.lookup_mut(key, hash)
    }

    /// Remove the key, dropping both key and value. Fails with
    /// [`FredisError::KeyNotFound`] if absent.
    pub fn remove<Q>(&mut self, key: &Q) -> Result<()>
    where
        Q: ?Sized,
        K: Borrow<Q>,
        T: DictType<Q>,
    {
        match self.unlink(key) {
            Ok(entry) => {
                drop(entry);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Detach the entry without running destructors: the caller owns
    /// the returned box and decides when (and on which thread) it is
    /// dropped.
    pub fn unlink<Q>(&mut self, key: &Q) -> Result<Box<DictEntry<K, V>>>
    where
        Q: ?Sized,
        K: Borrow<Q>,
        T: DictType<Q>,
    {
        if self.is_empty() {
            return Err(FredisError::KeyNotFound);
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = DictType::<Q>::hash(&self.ty, key);
        let rehashing = self.is_rehashing();
        let Self { ty, tables, .. } = self;

        for table in tables.iter_mut() {
            if table.size() == 0 {
                break;
            }
            let idx = (hash as usize) & table.mask();
            let Table { buckets, used } = table;

            let mut link = &mut buckets[idx];
            while link
                .as_deref()
                .is_some_and(|entry| !DictType::<Q>::key_eq(ty, key, entry.key.borrow()))
            {
                link = &mut link.as_deref_mut().expect("checked non-empty").next;
            }
            if link.is_some() {
                let mut removed = link.take().expect("checked non-empty");
                *link = removed.next.take();
                *used -= 1;
                return Ok(removed);
            }
            if !rehashing {
                break;
            }
        }
        Err(FredisError::KeyNotFound)
    }

    /// Drop every entry and both tables, resetting to the pristine
    /// state.
    pub fn clear(&mut self) {
        self.tables = [Table::unallocated(), Table::unallocated()];
        self.rehash_idx = None;
        self.safe_iterators.set(0);
    }

    // === Random access ===

    /// One entry chosen (approximately) uniformly: first a non-empty
    /// bucket, then a uniform position within its chain. Chain-length
    /// skew bounds the per-entry probability within a factor of two of
    /// uniform either way.
    pub fn random_entry(&mut self) -> Option<&DictEntry<K, V>> {
        if self.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }

        let mut rng = rand::thread_rng();
        let (table, idx) = if let Some(cursor) = self.rehash_idx {
            // Buckets below the cursor are already empty; draw from
            // the still-populated span of both tables.
            let s0 = self.tables[0].size();
            let s1 = self.tables[1].size();
            loop {
                let h = cursor + rng.gen_range(0..(s0 + s1 - cursor));
                let (table, idx) = if h >= s0 { (1, h - s0) } else { (0, h) };
                if self.tables[table].buckets[idx].is_some() {
                    break (table, idx);
                }
            }
        } else {
            loop {
                let idx = rng.gen::<usize>() & self.tables[0].mask();
                if self.tables[0].buckets[idx].is_some() {
                    break (0, idx);
                }
            }
        };

        let mut chain_len = 0;
        let mut cur = self.tables[table].buckets[idx].as_deref();
        while let Some(entry) = cur {
            chain_len += 1;
            cur = entry.next.as_deref();
        }

        let mut pick = rng.gen_range(0..chain_len);
        let mut cur = self.tables[table].buckets[idx]
            .as_deref()
            .expect("bucket chosen non-empty");
        while pick > 0 {
            cur = cur.next.as_deref().expect("chain shorter than counted");
            pick -= 1;
        }
        Some(cur)
    }

    /// Collect up to `count` entries from random consecutive buckets.
    ///
    /// Best effort for approximation algorithms: the result may be
    /// shorter than `count`, is not uniformly distributed, and in
    /// pathological layouts may contain duplicates. Total work is
    /// bounded by `count * 10` bucket probes; runs of five or more
    /// empty buckets (past `count` of them) re-randomize the start.
    pub fn sample(&mut self, count: usize) -> Vec<&DictEntry<K, V>> {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }

        // Pay for the sampling with a proportional amount of rehash
        // work first.
        for _ in 0..count {
            if self.is_rehashing() {
                self.rehash_step();
            } else {
                break;
            }
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut max_mask = self.tables[0].mask();
        if tables > 1 {
            max_mask = max_mask.max(self.tables[1].mask());
        }

        let mut rng = rand::thread_rng();
        let mut i = rng.gen::<usize>() & max_mask;
        let mut empty_run = 0_usize;
        let mut maxsteps = count * 10;
        let mut out: Vec<&DictEntry<K, V>> = Vec::with_capacity(count);

        while out.len() < count && maxsteps > 0 {
            maxsteps -= 1;
            for table in 0..tables {
                if tables == 2 && table == 0 {
                    if let Some(cursor) = self.rehash_idx {
                        if i < cursor {
                            // Below the cursor the main table is empty.
                            // When the position is also out of range
                            // for the new (smaller) table, neither
                            // table has anything there: jump ahead.
                            if i >= self.tables[1].size() {
                                i = cursor;
                            } else {
                                continue;
                            }
                        }
                    }
                }
                if i >= self.tables[table].size() {
                    continue;
                }
                match self.tables[table].buckets[i].as_deref() {
                    None => {
                        empty_run += 1;
                        if empty_run >= 5 && empty_run > count {
                            i = rng.gen::<usize>() & max_mask;
                            empty_run = 0;
                        }
                    }
                    Some(head) => {
                        empty_run = 0;
                        let mut cur = Some(head);
                        while let Some(entry) = cur {
                            out.push(entry);
                            if out.len() == count {
                                return out;
                            }
                            cur = entry.next.as_deref();
                        }
                    }
                }
            }
            i = (i + 1) & max_mask;
        }
        out
    }

    // === Iteration ===

    /// Fast iterator: cheap, but the dictionary must not change while
    /// it is alive. Verified by fingerprint on drop; a mismatch is a
    /// contract violation and panics.
    pub fn iter(&self) -> Iter<'_, K, V, T> {
        Iter::new(self, false)
    }

    /// Safe iterator: suspends incremental rehashing for its lifetime
    /// so bucket positions are stable across the whole walk.
    pub fn iter_safe(&self) -> Iter<'_, K, V, T> {
        Iter::new(self, true)
    }

    /// Summary counters over the main table.
    #[must_use]
    pub fn stats(&self) -> DictStats {
        let mut buckets_used = 0;
        let mut max_chain_length = 0;
        for bucket in &self.tables[0].buckets {
            let mut chain_len = 0;
            let mut cur = bucket.as_deref();
            while let Some(entry) = cur {
                chain_len += 1;
                cur = entry.next.as_deref();
            }
            if chain_len > 0 {
                buckets_used += 1;
                max_chain_length = max_chain_length.max(chain_len);
            }
        }
        DictStats {
            size: self.tables[0].size(),
            used: self.len(),
            buckets_used,
            max_chain_length,
            rehashing: self.is_rehashing(),
        }
    }

    /// Fingerprint of the table state: pointers, sizes, and used
    /// counts folded through an integer mix so that the same values in
    /// a different order hash differently.
    pub(crate) fn fingerprint(&self) -> u64 {
        let parts = [
            self.tables[0].buckets.as_ptr() as u64,
            self.tables[0].size() as u64,
            self.tables[0].used as u64,
            self.tables[1].buckets.as_ptr() as u64,
            self.tables[1].size() as u64,
            self.tables[1].used as u64,
        ];
        let mut hash = 0_u64;
        for part in parts {
            hash = mix64(hash.wrapping_add(part));
        }
        hash
    }

    // === Internal helpers ===

    /// Find the (table, bucket) an absent key would be inserted into,
    /// or `None` when the key is already present. Triggers the
    /// auto-expand check first; while rehashing the slot is always in
    /// the new table.
    fn free_slot(&mut self, key: &K, hash: u64) -> Option<(usize, usize)> {
        self.expand_if_needed();
        let mut target = (0, 0);
        for table in 0..2 {
            let idx = (hash as usize) & self.tables[table].mask();
            target = (table, idx);
            let mut cur = self.tables[table].buckets[idx].as_deref();
            while let Some(entry) = cur {
                if self.ty.key_eq(key, &entry.key) {
                    return None;
                }
                cur = entry.next.as_deref();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        Some(target)
    }

    fn link_front(&mut self, table: usize, idx: usize, key: K, val: V) {
        let entry = Box::new(DictEntry {
            key,
            val,
            next: self.tables[table].buckets[idx].take(),
        });
        self.tables[table].buckets[idx] = Some(entry);
        self.tables[table].used += 1;
    }

    fn find_entry_mut(&mut self, key: &K, hash: u64) -> Option<&mut DictEntry<K, V>> {
        let rehashing = self.is_rehashing();
        let Self { ty, tables, .. } = self;
        for table in tables.iter_mut() {
            if table.size() == 0 {
                break;
            }
            let idx = (hash as usize) & table.mask();
            let mut cur = table.buckets[idx].as_deref_mut();
            while let Some(entry) = cur {
                if ty.key_eq(key, &entry.key) {
                    return Some(entry);
                }
                cur = entry.next.as_deref_mut();
            }
            if !rehashing {
                break;
            }
        }
        None
    }

    fn lookup_mut<Q>(&mut self, key: &Q, hash: u64) -> Option<&mut DictEntry<K, V>>
    where
        Q: ?Sized,
        K: Borrow<Q>,
        T: DictType<Q>,
    {
        let rehashing = self.is_rehashing();
        let Self { ty, tables, .. } = self;
        for table in tables.iter_mut() {
            if table.size() == 0 {
                break;
            }
            let idx = (hash as usize) & table.mask();
            let mut cur = table.buckets[idx].as_deref_mut();
            while let Some(entry) = cur {
                if DictType::<Q>::key_eq(ty, key, entry.key.borrow()) {
                    return Some(entry);
                }
                cur = entry.next.as_deref_mut();
            }
            if !rehashing {
                break;
            }
        }
        None
    }
}

/// Smallest power of two at or above `size`, floored at the initial
/// table size.
fn next_power(size: usize) -> usize {
    let mut power = INITIAL_SIZE;
    while power < size {
        power *= 2;
    }
    power
}

/// Thomas Wang's 64-bit integer mix.
fn mix64(mut hash: u64) -> u64 {
    hash = (!hash).wrapping_add(hash << 21);
    hash ^= hash >> 24;
    hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
    hash ^= hash >> 14;
    hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
    hash ^= hash >> 28;
    hash.wrapping_add(hash << 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_dict() -> Dict<Vec<u8>, u64, BytesKeys> {
        Dict::new(BytesKeys)
    }

    #[test]
    fn test_add_find_remove() {
        let mut dict = bytes_dict();
        dict.add(b"alpha".to_vec(), 1).expect("fresh key should insert");
        dict.add(b"beta".to_vec(), 2).expect("fresh key should insert");

        assert!(matches!(
            dict.add(b"alpha".to_vec(), 9),
            Err(FredisError::KeyExists)
        ));
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.fetch(b"alpha".as_slice()), Some(&1));

        dict.remove(b"alpha".as_slice()).expect("present key should remove");
        assert_eq!(dict.find(b"alpha".as_slice()).map(DictEntry::value), None);
        assert!(matches!(
            dict.remove(b"alpha".as_slice()),
            Err(FredisError::KeyNotFound)
        ));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_replace_reports_overwrite() {
        let mut dict = bytes_dict();
        assert!(dict.replace(b"k".to_vec(), 1));
        assert!(!dict.replace(b"k".to_vec(), 2));
        assert_eq!(dict.fetch(b"k".as_slice()), Some(&2));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_add_or_find_with() {
        let mut dict = bytes_dict();
        let (entry, added) = dict.add_or_find_with(b"n".to_vec(), || 10);
        assert!(added);
        assert_eq!(*entry.value(), 10);

        let (entry, added) = dict.add_or_find_with(b"n".to_vec(), || 99);
        assert!(!added);
        assert_eq!(*entry.value(), 10);
        *entry.value_mut() += 1;
        assert_eq!(dict.fetch(b"n".as_slice()), Some(&11));
    }

    #[test]
    fn test_unlink_defers_destruction() {
        let mut dict = bytes_dict();
        dict.add(b"k".to_vec(), 7).expect("fresh key should insert");
        let entry = dict.unlink(b"k".as_slice()).expect("present key should unlink");
        assert_eq!(dict.len(), 0);
        let (key, val) = entry.into_pair();
        assert_eq!(key, b"k".to_vec());
        assert_eq!(val, 7);
    }

    // Inserting a hundred keys through the growth path: every prefix
    // stays reachable and the two used counters always account for
    // every insert, whichever table holds it.
    #[test]
    fn test_incremental_growth_keeps_all_keys_reachable() {
        let mut dict = bytes_dict();
        let mut keys = Vec::new();
        for i in 0..100_u64 {
            let key = format!("k{i}").into_bytes();
            keys.push(key.clone());
            dict.add(key, i).expect("fresh key should insert");

            assert_eq!(dict.tables[0].used + dict.tables[1].used, (i + 1) as usize);
            for (j, key) in keys.iter().enumerate() {
                assert_eq!(
                    dict.fetch(key.as_slice()),
                    Some(&(j as u64)),
                    "key {j} lost after inserting {i}"
                );
            }
        }
    }

    #[test]
    fn test_rehash_drains_old_table() {
        let mut dict = bytes_dict();
        for i in 0..64_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        // Drive whatever migration the growth left pending all the way
        // through, then check the terminal state.
        while dict.rehash(10) {}
        assert!(!dict.is_rehashing());
        assert_eq!(dict.tables[1].used, 0);
        assert_eq!(dict.tables[1].size(), 0);
        assert_eq!(dict.len(), 64);
    }

    #[test]
    fn test_rehash_bounds_empty_bucket_probes() {
        let mut dict = bytes_dict();
        // A single key in a large table leaves long empty runs.
        dict.expand(1024).expect("explicit expand");
        dict.add(b"solo".to_vec(), 1).expect("insert");
        dict.expand(2048).expect("start rehash");
        assert!(dict.is_rehashing());
        // One step visits at most 10 empty buckets, so a sparse table
        // needs several calls even though only one bucket has data.
        let before = dict.rehash_idx.expect("rehashing");
        dict.rehash(1);
        if dict.is_rehashing() {
            let after = dict.rehash_idx.expect("rehashing");
            assert!(after - before <= 10 + 1);
        }
    }

    #[test]
    fn test_expand_rejections() {
        let mut dict = bytes_dict();
        for i in 0..8_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        assert!(matches!(
            dict.expand(2),
            Err(FredisError::InvalidResize { .. })
        ));
        let size = dict.tables[0].size();
        assert!(matches!(
            dict.expand(size),
            Err(FredisError::InvalidResize { .. })
        ));
        dict.expand(size * 2).expect("growth should start");
        assert!(matches!(
            dict.expand(size * 4),
            Err(FredisError::RehashInProgress)
        ));
    }

    #[test]
    fn test_resize_to_fit_honors_global_switch() {
        let mut dict = bytes_dict();
        for i in 0..32_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        for i in 0..28_u64 {
            dict.remove(format!("k{i}").into_bytes().as_slice())
                .expect("remove");
        }
        while dict.rehash(100) {}

        crate::disable_resize();
        assert!(matches!(
            dict.resize_to_fit(),
            Err(FredisError::ResizeDisabled)
        ));
        crate::enable_resize();
        dict.resize_to_fit().expect("shrink should start");
        while dict.rehash(100) {}
        assert_eq!(dict.tables[0].size(), INITIAL_SIZE);
        assert_eq!(dict.len(), 4);
    }

    #[test]
    fn test_random_entry_returns_live_entries() {
        let mut dict = bytes_dict();
        assert!(dict.random_entry().is_none());
        for i in 0..50_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        for _ in 0..200 {
            let (key, val) = {
                let entry = dict.random_entry().expect("non-empty dict");
                (entry.key().clone(), *entry.value())
            };
            assert_eq!(dict.peek(key.as_slice()).map(DictEntry::value), Some(&val));
        }
    }

    // Bucket bias bounds the per-entry hit rate within a factor of
    // two of uniform either way; the asserted window is much wider
    // than that, so only a broken selection can trip it.
    #[test]
    fn test_random_entry_is_roughly_uniform() {
        let mut dict = bytes_dict();
        let n = 16_u64;
        for i in 0..n {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        let draws = 20_000;
        let mut hits = vec![0_u32; n as usize];
        for _ in 0..draws {
            let picked = *dict.random_entry().expect("non-empty dict").value();
            hits[picked as usize] += 1;
        }
        for (i, &count) in hits.iter().enumerate() {
            assert!(
                (200..=5_000).contains(&count),
                "entry {i} drawn {count} times out of {draws}"
            );
        }
    }

    #[test]
    fn test_sample_bounds() {
        let mut dict = bytes_dict();
        for i in 0..1000_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        let sampled: Vec<(Vec<u8>, u64)> = dict
            .sample(100)
            .into_iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        assert!(sampled.len() <= 100);
        assert!(!sampled.is_empty());
        for (key, val) in &sampled {
            assert_eq!(dict.peek(key.as_slice()).map(DictEntry::value), Some(val));
        }
    }

    #[test]
    fn test_sample_on_small_dict_caps_at_len() {
        let mut dict = bytes_dict();
        for i in 0..5_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        assert!(dict.sample(100).len() <= 5);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut dict = bytes_dict();
        for i in 0..100_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        dict.clear();
        assert_eq!(dict.len(), 0);
        assert_eq!(dict.slots(), 0);
        assert!(!dict.is_rehashing());
        dict.add(b"again".to_vec(), 1).expect("reuse after clear");
    }

    #[test]
    fn test_rehash_for_ms_makes_progress() {
        let mut dict = bytes_dict();
        for i in 0..4096_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        dict.expand(dict.tables[0].size() * 2).expect("start rehash");
        let steps = dict.rehash_for_ms(50);
        assert!(steps > 0);
    }

    #[test]
    fn test_stats_reflects_contents() {
        let mut dict = bytes_dict();
        for i in 0..16_u64 {
            dict.add(format!("k{i}").into_bytes(), i).expect("insert");
        }
        while dict.rehash(100) {}
        let stats = dict.stats();
        assert_eq!(stats.used, 16);
        assert!(stats.buckets_used > 0);
        assert!(stats.max_chain_length >= 1);
        assert!(!stats.rehashing);
    }

    #[test]
    fn test_next_power() {
        assert_eq!(next_power(0), INITIAL_SIZE);
        assert_eq!(next_power(4), 4);
        assert_eq!(next_power(5), 8);
        assert_eq!(next_power(1000), 1024);
    }
}
