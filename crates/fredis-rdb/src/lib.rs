//! RDB snapshot serializer for the FrankenRedis storage core.
//!
//! Writes and reads the entire multi-database state as one
//! self-describing binary file: a magic header with a format version,
//! auxiliary metadata fields, per-database sections of type-tagged
//! length-prefixed entries, and an end marker followed by a CRC-64
//! trailer over every preceding byte.
//!
//! The module split follows the data path. [`io`] owns the
//! checksumming byte streams and the special sinks (incremental-fsync
//! file, replication fan-out). [`encoding`] owns the primitive wire
//! forms: compact lengths, integer-encoded strings, LZF framing,
//! the two double formats, timestamps. [`value`] dispatches whole
//! values by type tag. [`save`] and [`load`] drive full files, and
//! [`background`] runs the fork-based save with its bookkeeping.

pub mod background;
pub mod encoding;
pub mod format;
pub mod io;
pub mod load;
pub mod lzf;
pub mod save;
pub mod value;

pub use background::{remove_temp_file, Persistence, SaveOutcome};
pub use format::RDB_VERSION;
pub use io::{Emitter, FanoutWriter, IncrementalFsyncFile, Loader};
pub use load::{load_from_file, load_snapshot, LoadInfo, LoadOptions};
pub use save::{
    save_to_file, write_snapshot, write_snapshot_to_buffer, write_snapshot_with_eof_mark,
    SaveInfo, SaveOptions,
};
