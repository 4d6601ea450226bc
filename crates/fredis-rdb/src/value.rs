//! Whole-value serialization, dispatched by type tag.
//!
//! Each value shape has its own producer and consumer pair. Aggregates
//! whose containers already hold a serialized buffer (packed lists,
//! packed hashes and sorted sets, integer sets) go to disk as that
//! buffer in string position, so loading rebuilds the in-memory form
//! without touching individual elements.

use std::io::{Read, Write};

use fredis_error::{corrupt, FredisError, Result};
use fredis_types::{
    HashEntry, ModuleField, ModuleValue, PendingEntry, QuickList, QuickListNode, SortedSetEntry,
    Stream, StreamConsumer, StreamGroup, StreamId, Value,
};

use crate::format::{
    MODULE_OP_DOUBLE, MODULE_OP_EOF, MODULE_OP_FLOAT, MODULE_OP_SINT, MODULE_OP_STRING,
    MODULE_OP_UINT, TYPE_HASH, TYPE_HASH_PACKED, TYPE_LIST_QUICKLIST, TYPE_MODULE, TYPE_SET,
    TYPE_SET_INTSET, TYPE_STREAM, TYPE_STRING, TYPE_ZSET, TYPE_ZSET_LEGACY, TYPE_ZSET_PACKED,
};
use crate::encoding::LoadedString;
use crate::io::{Emitter, Loader};

/// The type tag under which a value serializes.
#[must_use]
pub fn value_type_tag(value: &Value) -> u8 {
    match value {
        Value::Str(_) | Value::Int(_) => TYPE_STRING,
        Value::List(_) => TYPE_LIST_QUICKLIST,
        Value::Set(_) => TYPE_SET,
        Value::IntSet(_) => TYPE_SET_INTSET,
        Value::SortedSet(_) => TYPE_ZSET,
        Value::SortedSetPacked(_) => TYPE_ZSET_PACKED,
        Value::Hash(_) => TYPE_HASH,
        Value::HashPacked(_) => TYPE_HASH_PACKED,
        Value::Stream(_) => TYPE_STREAM,
        Value::Module(_) => TYPE_MODULE,
    }
}

/// Serialize one value (the bytes after its type tag and key).
pub fn write_value<W: Write>(emitter: &mut Emitter<W>, value: &Value) -> Result<()> {
    match value {
        Value::Str(bytes) => emitter.write_string(bytes),
        Value::Int(n) => emitter.write_int_string(*n),

        Value::List(list) => {
            emitter.write_len(list.nodes.len() as u64)?;
            for node in &list.nodes {
                match node {
                    QuickListNode::Plain(data) => emitter.write_string(data)?,
                    // Cold nodes are already LZF blocks; frame them as
                    // such instead of recompressing.
                    QuickListNode::Compressed { data, raw_len } => {
                        emitter.write_lzf_blob(data, *raw_len)?;
                    }
                }
            }
            Ok(())
        }

        Value::Set(members) => {
            emitter.write_len(members.len() as u64)?;
            for member in members {
                emitter.write_string(member)?;
            }
            Ok(())
        }

        Value::IntSet(blob) | Value::SortedSetPacked(blob) | Value::HashPacked(blob) => {
            emitter.write_string(blob)
        }

        Value::SortedSet(entries) => {
            emitter.write_len(entries.len() as u64)?;
            for entry in entries {
                emitter.write_string(&entry.member)?;
                emitter.write_double_binary(entry.score)?;
            }
            Ok(())
        }

        Value::Hash(fields) => {
            emitter.write_len(fields.len() as u64)?;
            for field in fields {
                emitter.write_string(&field.field)?;
                emitter.write_string(&field.value)?;
            }
            Ok(())
        }

        Value::Stream(stream) => write_stream(emitter, stream),
        Value::Module(module) => write_module(emitter, module),
    }
}

/// Deserialize one value from its type tag.
pub fn read_value<R: Read>(loader: &mut Loader<R>, tag: u8) -> Result<Value> {
    match tag {
        TYPE_STRING => Ok(match loader.read_string()? {
            LoadedString::Int(n) => Value::Int(n),
            LoadedString::Raw(bytes) => Value::Str(bytes),
        }),

        TYPE_LIST_QUICKLIST => {
            let nodes = loader.read_plain_len()?;
            let mut list = QuickList::default();
            for _ in 0..nodes {
                list.nodes
                    .push(QuickListNode::Plain(loader.read_string_bytes()?));
            }
            Ok(Value::List(list))
        }

        TYPE_SET => {
            let count = loader.read_plain_len()?;
            let mut members = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
            for _ in 0..count {
                members.push(loader.read_string_bytes()?);
            }
            Ok(Value::Set(members))
        }

        TYPE_SET_INTSET => Ok(Value::IntSet(loader.read_string_bytes()?)),
        TYPE_ZSET_PACKED => Ok(Value::SortedSetPacked(loader.read_string_bytes()?)),
        TYPE_HASH_PACKED => Ok(Value::HashPacked(loader.read_string_bytes()?)),

        TYPE_ZSET | TYPE_ZSET_LEGACY => {
            let count = loader.read_plain_len()?;
            let mut entries = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
            for _ in 0..count {
                let member = loader.read_string_bytes()?;
                let score = if tag == TYPE_ZSET {
                    loader.read_double_binary()?
                } else {
                    loader.read_double_legacy()?
                };
                entries.push(SortedSetEntry { member, score });
            }
            Ok(Value::SortedSet(entries))
        }

        TYPE_HASH => {
            let count = loader.read_plain_len()?;
            let mut fields = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
            for _ in 0..count {
                let field = loader.read_string_bytes()?;
                let value = loader.read_string_bytes()?;
                fields.push(HashEntry { field, value });
            }
            Ok(Value::Hash(fields))
        }

        TYPE_STREAM => Ok(Value::Stream(Box::new(read_stream(loader)?))),

        TYPE_MODULE => {
            let id = loader.read_plain_len()?;
            // No module registry exists in this core; the payload is
            // uninterpretable without the owning module.
            Err(FredisError::UnknownModule { id })
        }

        other => Err(corrupt!("unknown value type tag {other}")),
    }
}

// === Streams ===

fn write_stream<W: Write>(emitter: &mut Emitter<W>, stream: &Stream) -> Result<()> {
    // Entry packs, keyed by their first entry id in big-endian wire
    // form so byte order equals id order.
    emitter.write_len(stream.packs.len() as u64)?;
    for (id, pack) in &stream.packs {
        emitter.write_string(&id.to_big_endian())?;
        emitter.write_string(pack)?;
    }

    emitter.write_len(stream.length)?;
    emitter.write_len(stream.last_id.ms)?;
    emitter.write_len(stream.last_id.seq)?;

    emitter.write_len(stream.groups.len() as u64)?;
    for group in &stream.groups {
        emitter.write_string(&group.name)?;
        emitter.write_len(group.last_id.ms)?;
        emitter.write_len(group.last_id.seq)?;

        // Group-level pending entries carry full delivery state.
        emitter.write_len(group.pending.len() as u64)?;
        for entry in &group.pending {
            emitter.write_raw(&entry.id.to_big_endian())?;
            emitter.write_ms_time(entry.delivery_time)?;
            emitter.write_len(entry.delivery_count)?;
        }

        // Consumer-level pending lists are ids only; the group list
        // above is the authority for delivery state.
        emitter.write_len(group.consumers.len() as u64)?;
        for consumer in &group.consumers {
            emitter.write_string(&consumer.name)?;
            emitter.write_ms_time(consumer.seen_time)?;
            emitter.write_len(consumer.pending.len() as u64)?;
            for id in &consumer.pending {
                emitter.write_raw(&id.to_big_endian())?;
            }
        }
    }
    Ok(())
}

fn read_stream_id_string<R: Read>(loader: &mut Loader<R>) -> Result<StreamId> {
    let bytes = loader.read_string_bytes()?;
    let wire: &[u8; 16] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| corrupt!("stream pack key of {} bytes, expected 16", bytes.len()))?;
    Ok(StreamId::from_big_endian(wire))
}

fn read_stream_id_raw<R: Read>(loader: &mut Loader<R>) -> Result<StreamId> {
    let mut wire = [0_u8; 16];
    loader.read_exact_buf(&mut wire)?;
    Ok(StreamId::from_big_endian(&wire))
}

fn read_stream<R: Read>(loader: &mut Loader<R>) -> Result<Stream> {
    let mut stream = Stream::default();

    let packs = loader.read_plain_len()?;
    for _ in 0..packs {
        let id = read_stream_id_string(loader)?;
        let pack = loader.read_string_bytes()?;
        stream.packs.insert(id, pack);
    }

    stream.length = loader.read_plain_len()?;
    stream.last_id = StreamId {
        ms: loader.read_plain_len()?,
        seq: loader.read_plain_len()?,
    };

    let groups = loader.read_plain_len()?;
    for _ in 0..groups {
        let name = loader.read_string_bytes()?;
        let last_id = StreamId {
            ms: loader.read_plain_len()?,
            seq: loader.read_plain_len()?,
        };

        let pending_count = loader.read_plain_len()?;
        let mut pending = Vec::with_capacity(usize::try_from(pending_count).unwrap_or(0));
        for _ in 0..pending_count {
            let id = read_stream_id_raw(loader)?;
            let delivery_time = loader.read_ms_time()?;
            let delivery_count = loader.read_plain_len()?;
            pending.push(PendingEntry {
                id,
                delivery_time,
                delivery_count,
            });
        }

        let consumer_count = loader.read_plain_len()?;
        let mut consumers = Vec::with_capacity(usize::try_from(consumer_count).unwrap_or(0));
        for _ in 0..consumer_count {
            let name = loader.read_string_bytes()?;
            let seen_time = loader.read_ms_time()?;
            let ids = loader.read_plain_len()?;
            let mut consumer_pending = Vec::with_capacity(usize::try_from(ids).unwrap_or(0));
            for _ in 0..ids {
                consumer_pending.push(read_stream_id_raw(loader)?);
            }
            consumers.push(StreamConsumer {
                name,
                seen_time,
                pending: consumer_pending,
            });
        }

        stream.groups.push(StreamGroup {
            name,
            last_id,
            pending,
            consumers,
        });
    }
    Ok(stream)
}

// === Modules ===

fn write_module<W: Write>(emitter: &mut Emitter<W>, module: &ModuleValue) -> Result<()> {
    emitter.write_len(module.id)?;
    for field in &module.fields {
        match field {
            ModuleField::UInt(v) => {
                emitter.write_len(MODULE_OP_UINT)?;
                emitter.write_len(*v)?;
            }
            ModuleField::SInt(v) => {
                emitter.write_len(MODULE_OP_SINT)?;
                emitter.write_len(*v as u64)?;
            }
            ModuleField::Float(v) => {
                emitter.write_len(MODULE_OP_FLOAT)?;
                emitter.write_float_binary(*v)?;
            }
            ModuleField::Double(v) => {
                emitter.write_len(MODULE_OP_DOUBLE)?;
                emitter.write_double_binary(*v)?;
            }
            ModuleField::String(s) => {
                emitter.write_len(MODULE_OP_STRING)?;
                emitter.write_string(s)?;
            }
        }
    }
    emitter.write_len(MODULE_OP_EOF)
}
