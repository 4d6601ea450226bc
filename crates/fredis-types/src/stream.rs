//! Stream value model: entry packs, consumer groups, pending entries.

use std::collections::BTreeMap;
use std::fmt;

/// A stream entry id: milliseconds clock plus a sequence counter for
/// entries created in the same millisecond. Orders lexicographically
/// by (ms, seq), which is the order ids are appended in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The wire form: 16 bytes, both words big-endian, so that the
    /// byte-wise ordering of encoded ids matches the id ordering.
    #[must_use]
    pub fn to_big_endian(self) -> [u8; 16] {
        let mut buf = [0_u8; 16];
        buf[..8].copy_from_slice(&self.ms.to_be_bytes());
        buf[8..].copy_from_slice(&self.seq.to_be_bytes());
        buf
    }

    /// Decode the 16-byte big-endian wire form.
    #[must_use]
    pub fn from_big_endian(buf: &[u8; 16]) -> Self {
        let mut ms = [0_u8; 8];
        let mut seq = [0_u8; 8];
        ms.copy_from_slice(&buf[..8]);
        seq.copy_from_slice(&buf[8..]);
        Self {
            ms: u64::from_be_bytes(ms),
            seq: u64::from_be_bytes(seq),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// An append-only stream.
///
/// Entries live in packed buffers keyed by the id of the first entry
/// each pack holds; the ordered map stands in for the radix tree the
/// container type uses, and iterating it yields packs in id order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stream {
    /// First-entry id → packed entries buffer.
    pub packs: BTreeMap<StreamId, Vec<u8>>,
    /// Total number of entries across all packs. Tracked explicitly
    /// because counting pack contents would mean parsing them.
    pub length: u64,
    /// Highest id ever appended, even if since deleted.
    pub last_id: StreamId,
    /// Consumer groups reading this stream.
    pub groups: Vec<StreamGroup>,
}

/// A consumer group and its delivery state.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamGroup {
    pub name: Vec<u8>,
    /// Last id delivered to this group.
    pub last_id: StreamId,
    /// Delivered-but-unacknowledged entries, ordered by id.
    pub pending: Vec<PendingEntry>,
    pub consumers: Vec<StreamConsumer>,
}

/// One delivered-but-unacknowledged entry in a group's pending list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: StreamId,
    /// Unix milliseconds of the most recent delivery.
    pub delivery_time: i64,
    pub delivery_count: u64,
}

/// One consumer inside a group. The consumer's pending list holds ids
/// only; the delivery metadata lives in the group's list, and the two
/// are joined by id when a snapshot is loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConsumer {
    pub name: Vec<u8>,
    /// Unix milliseconds of the consumer's last interaction.
    pub seen_time: i64,
    pub pending: Vec<StreamId>,
}
