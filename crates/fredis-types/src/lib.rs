//! Value model and allocator accounting for the FrankenRedis storage
//! core.
//!
//! The keyspace maps byte-string keys to [`Object`]s. An object is a
//! [`Value`] plus the per-key eviction metadata that rides along in
//! snapshots. Aggregate values that the element-level container types
//! already keep in a serialized form (packed lists, integer sets) are
//! carried here as opaque blobs; the snapshot layer writes them
//! byte-for-byte.

pub mod mem;
pub mod stream;
pub mod value;

pub use mem::{set_oom_handler, used_memory, CountingAllocator};
pub use stream::{PendingEntry, Stream, StreamConsumer, StreamGroup, StreamId};
pub use value::{
    HashEntry, ModuleField, ModuleValue, Object, QuickList, QuickListNode, SortedSetEntry, Value,
};
