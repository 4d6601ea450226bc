//! The primary associative container of the FrankenRedis storage core.
//!
//! A [`Dict`] is a chained hash table over two power-of-two bucket
//! arrays. Growing or shrinking never blocks the request path: a
//! resize allocates the second table and migration proceeds one bucket
//! at a time, piggybacked on ordinary lookups and writes plus an
//! explicit time-budgeted driver ([`Dict::rehash_for_ms`]). While a
//! rehash is active, reads consult both tables and writes land in the
//! new one.
//!
//! Traversal comes in three flavors with different contracts:
//!
//! - [`Dict::iter_safe`] suspends incremental rehashing for its
//!   lifetime, so bucket positions are stable for the whole walk (the
//!   snapshot writer relies on this).
//! - [`Dict::iter`] is the cheap variant: it records a fingerprint of
//!   the table state and panics on drop if the dictionary changed
//!   under it.
//! - [`Dict::scan`] is a stateless cursor traversal that tolerates
//!   resizes *between* calls, at the price of possibly yielding an
//!   entry more than once.

mod dict;
mod iter;
mod scan;

pub use dict::{BytesKeys, Dict, DictEntry, DictStats, DictType, INITIAL_SIZE};
pub use iter::Iter;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-wide resize switch.
///
/// Turned off while a copy-on-write snapshot child is alive so bucket
/// migration does not touch pages the child shares with us. Even when
/// off, a table more than five times overloaded is still allowed to
/// grow (see [`Dict`]'s insert path).
static DICT_CAN_RESIZE: AtomicBool = AtomicBool::new(true);

/// Process-wide seed for the keyed byte-string hash.
static HASH_SEED: AtomicU64 = AtomicU64::new(0);

/// Allow automatic resizing again.
pub fn enable_resize() {
    DICT_CAN_RESIZE.store(true, Ordering::Relaxed);
}

/// Suppress automatic resizing (except under extreme load).
pub fn disable_resize() {
    DICT_CAN_RESIZE.store(false, Ordering::Relaxed);
}

/// Current state of the process-wide resize switch.
#[must_use]
pub fn resize_enabled() -> bool {
    DICT_CAN_RESIZE.load(Ordering::Relaxed)
}

/// Set the keyed-hash seed. Call once at startup, before any
/// dictionary is populated: changing the seed under live tables makes
/// every stored key unreachable.
pub fn set_hash_seed(seed: u64) {
    HASH_SEED.store(seed, Ordering::Relaxed);
}

/// The current keyed-hash seed.
#[must_use]
pub fn hash_seed() -> u64 {
    HASH_SEED.load(Ordering::Relaxed)
}
