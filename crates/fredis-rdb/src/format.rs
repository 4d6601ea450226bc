//! Wire-format constants.
//!
//! File layout:
//!
//! ```text
//! "REDIS"            5 ASCII bytes of magic
//! "0009"             4 ASCII digits of format version
//! [AUX fields]       zero or more (name, value) string pairs
//! per database:
//!   SELECTDB <idx>
//!   RESIZEDB <keyspace size> <expires size>
//!   per entry:
//!     [EXPIRETIME_MS <8 bytes LE>] [IDLE <len>] [FREQ <1 byte>]
//!     <type tag> <key string> <value>
//! EOF
//! <8 bytes LE>       CRC-64 of everything above (0 = disabled)
//! ```
//!
//! Numbers inside length fields are big-endian; expiry timestamps and
//! binary doubles are little-endian.

/// Format version this writer emits. The loader accepts `1..=9`.
pub const RDB_VERSION: u32 = 9;

/// First bytes of every snapshot.
pub const MAGIC: &[u8; 5] = b"REDIS";

/// Checksum is verified for files at or above this version.
pub const MIN_CHECKSUM_VERSION: u32 = 5;

// === Opcodes (special "types" above the value-tag space) ===

/// Module auxiliary data, outside any keyspace entry.
pub const OP_MODULE_AUX: u8 = 247;
/// Seconds of idle time for the next entry (recency eviction).
pub const OP_IDLE: u8 = 248;
/// Logarithmic access counter for the next entry (frequency eviction).
pub const OP_FREQ: u8 = 249;
/// A (name, value) auxiliary string pair.
pub const OP_AUX: u8 = 250;
/// Table-size hints for the database being loaded.
pub const OP_RESIZEDB: u8 = 251;
/// Absolute expiry for the next entry, unix milliseconds, 8 bytes LE.
pub const OP_EXPIRETIME_MS: u8 = 252;
/// Legacy absolute expiry in unix seconds, 4 bytes LE. Read, never
/// written.
pub const OP_EXPIRETIME: u8 = 253;
/// Switch the target database.
pub const OP_SELECTDB: u8 = 254;
/// End of the entry stream; the CRC-64 trailer follows.
pub const OP_EOF: u8 = 255;

// === Value type tags ===

pub const TYPE_STRING: u8 = 0;
/// Sorted set with ASCII-encoded scores. Read, never written.
pub const TYPE_ZSET_LEGACY: u8 = 3;
pub const TYPE_SET: u8 = 2;
pub const TYPE_HASH: u8 = 4;
/// Sorted set with binary64 scores.
pub const TYPE_ZSET: u8 = 5;
pub const TYPE_MODULE: u8 = 7;
pub const TYPE_SET_INTSET: u8 = 11;
pub const TYPE_ZSET_PACKED: u8 = 12;
pub const TYPE_HASH_PACKED: u8 = 13;
pub const TYPE_LIST_QUICKLIST: u8 = 14;
pub const TYPE_STREAM: u8 = 15;

/// True for tags that introduce a keyspace entry (as opposed to the
/// opcodes above).
#[must_use]
pub const fn is_value_type(tag: u8) -> bool {
    matches!(
        tag,
        TYPE_STRING
            | TYPE_ZSET_LEGACY
            | TYPE_SET
            | TYPE_HASH
            | TYPE_ZSET
            | TYPE_MODULE
            | TYPE_SET_INTSET
            | TYPE_ZSET_PACKED
            | TYPE_HASH_PACKED
            | TYPE_LIST_QUICKLIST
            | TYPE_STREAM
    )
}

// === Length-encoding discriminators ===

/// `00xxxxxx`: 6-bit length.
pub const LEN_6BIT: u8 = 0;
/// `01xxxxxx xxxxxxxx`: 14-bit length.
pub const LEN_14BIT: u8 = 1;
/// Exactly `0x80`, then 4 bytes big-endian.
pub const LEN_32BIT: u8 = 0x80;
/// Exactly `0x81`, then 8 bytes big-endian.
pub const LEN_64BIT: u8 = 0x81;
/// `11xxxxxx`: the low 6 bits select a special string encoding.
pub const LEN_ENCVAL: u8 = 3;

// === Special string encodings (under LEN_ENCVAL) ===

pub const ENC_INT8: u8 = 0;
pub const ENC_INT16: u8 = 1;
pub const ENC_INT32: u8 = 2;
pub const ENC_LZF: u8 = 3;

// === Module value field opcodes ===

pub const MODULE_OP_EOF: u64 = 0;
pub const MODULE_OP_SINT: u64 = 1;
pub const MODULE_OP_UINT: u64 = 2;
pub const MODULE_OP_FLOAT: u64 = 3;
pub const MODULE_OP_DOUBLE: u64 = 4;
pub const MODULE_OP_STRING: u64 = 5;

// === Legacy double sentinels ===

/// Prefix byte meaning "not a number".
pub const DOUBLE_NAN: u8 = 253;
/// Prefix byte meaning positive infinity.
pub const DOUBLE_POS_INF: u8 = 254;
/// Prefix byte meaning negative infinity.
pub const DOUBLE_NEG_INF: u8 = 255;

// === Replication framing ===

/// Prologue of a socket-streamed snapshot: `$EOF:`, then this many
/// random hex bytes, then CRLF. The same hex bytes terminate the
/// stream.
pub const EOF_MARK_SIZE: usize = 40;

/// Longest decimal string the integer special-encoding considers.
pub const INT_ENCODABLE_MAX_LEN: usize = 11;

/// Strings must beat this length before LZF is attempted; shorter
/// inputs cannot win back the framing overhead.
pub const LZF_MIN_STRING_LEN: usize = 20;

/// LZF output must save at least this many bytes to be kept.
pub const LZF_MIN_SAVING: usize = 4;
