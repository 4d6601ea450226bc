//! The dynamically-typed values the keyspace can hold.

use std::fmt;

use crate::stream::Stream;

/// A value stored under one key.
///
/// Strings come in two in-memory shapes: raw bytes, and a decoded
/// integer for strings that are exact decimal representations of an
/// `i64` (the common counter workload). Aggregates whose container
/// types keep their elements in a single serialized buffer (packed
/// lists, packed hashes, packed sorted sets, integer sets) are carried
/// as those buffers verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A raw byte string.
    Str(Vec<u8>),
    /// A string whose content is the decimal form of this integer.
    Int(i64),
    /// A list of packed-list nodes.
    List(QuickList),
    /// A set of unique members, hash-table encoded.
    Set(Vec<Vec<u8>>),
    /// A set of integers, carried as the container's serialized buffer.
    IntSet(Vec<u8>),
    /// A sorted set as (member, score) pairs, index encoded.
    SortedSet(Vec<SortedSetEntry>),
    /// A small sorted set, carried as one packed buffer of alternating
    /// member and score entries.
    SortedSetPacked(Vec<u8>),
    /// A hash as (field, value) pairs, hash-table encoded.
    Hash(Vec<HashEntry>),
    /// A small hash, carried as one packed buffer of alternating field
    /// and value entries.
    HashPacked(Vec<u8>),
    /// An append-only stream with consumer groups.
    Stream(Box<Stream>),
    /// An extension-module value: opaque fields only the owning module
    /// can interpret.
    Module(ModuleValue),
}

impl Value {
    /// Short type name used in logs and diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) | Self::Int(_) => "string",
            Self::List(_) => "list",
            Self::Set(_) | Self::IntSet(_) => "set",
            Self::SortedSet(_) | Self::SortedSetPacked(_) => "zset",
            Self::Hash(_) | Self::HashPacked(_) => "hash",
            Self::Stream(_) => "stream",
            Self::Module(_) => "module",
        }
    }

    /// The byte content of a string value, materializing the decimal
    /// form for integer-shaped strings.
    #[must_use]
    pub fn as_string_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Str(bytes) => Some(bytes.clone()),
            Self::Int(n) => Some(n.to_string().into_bytes()),
            _ => None,
        }
    }
}

/// One entry of an index-encoded sorted set.
#[derive(Clone, Debug, PartialEq)]
pub struct SortedSetEntry {
    pub member: Vec<u8>,
    pub score: f64,
}

/// One field of a hash-table encoded hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashEntry {
    pub field: Vec<u8>,
    pub value: Vec<u8>,
}

/// A list value: a sequence of packed-list nodes.
///
/// Each node is a self-contained packed buffer of elements. Cold nodes
/// may additionally be held in their compressed form; the snapshot
/// layer writes those without recompressing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuickList {
    pub nodes: Vec<QuickListNode>,
}

impl QuickList {
    #[must_use]
    pub fn new(nodes: Vec<QuickListNode>) -> Self {
        Self { nodes }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One node of a [`QuickList`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuickListNode {
    /// A packed buffer of elements, uncompressed.
    Plain(Vec<u8>),
    /// A node kept compressed in memory. `raw_len` is the length of the
    /// uncompressed buffer, needed to frame the blob on disk.
    Compressed { data: Vec<u8>, raw_len: usize },
}

/// An extension-module value.
///
/// The core cannot interpret the payload; it only knows how to frame
/// the fields on the wire. `id` identifies the owning module type.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleValue {
    pub id: u64,
    pub fields: Vec<ModuleField>,
}

/// One framed field of a module value.
#[derive(Clone, Debug, PartialEq)]
pub enum ModuleField {
    UInt(u64),
    SInt(i64),
    Float(f32),
    Double(f64),
    String(Vec<u8>),
}

/// A stored object: a value plus the eviction metadata that snapshots
/// carry per key.
///
/// `idle` is seconds since last access (recency eviction); `freq` is
/// the logarithmic 0-255 access counter (frequency eviction). Which of
/// the two is populated depends on the server's eviction policy; a key
/// loaded from a snapshot carries whichever the writer recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    pub value: Value,
    pub idle: Option<u64>,
    pub freq: Option<u8>,
}

impl Object {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            value,
            idle: None,
            freq: None,
        }
    }

    /// Estimated destructor cost, in container elements.
    ///
    /// Values above the deferred-free threshold are dropped on a
    /// background worker instead of the request thread. Blob-backed
    /// shapes are one allocation no matter their logical cardinality,
    /// so they always report 1.
    #[must_use]
    pub fn free_effort(&self) -> usize {
        match &self.value {
            Value::Str(_) | Value::Int(_) => 1,
            Value::List(list) => list.len(),
            Value::Set(members) => members.len(),
            Value::SortedSet(entries) => entries.len(),
            Value::Hash(fields) => fields.len(),
            Value::IntSet(_) | Value::SortedSetPacked(_) | Value::HashPacked(_) => 1,
            Value::Stream(stream) => {
                stream.packs.len()
                    + stream
                        .groups
                        .iter()
                        .map(|group| 1 + group.pending.len() + group.consumers.len())
                        .sum::<usize>()
            }
            Value::Module(module) => module.fields.len().max(1),
        }
    }
}

impl From<Value> for Object {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} object", self.value.type_name())
    }
}
