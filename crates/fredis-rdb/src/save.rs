//! The save pipeline: auxiliary preamble, per-database sections,
//! entry metadata, end marker, checksum trailer — into a buffer, a
//! temp file atomically renamed into place, or a replication stream
//! framed by an end-of-file mark.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fredis_core::Database;
use fredis_error::{FredisError, Result};
use fredis_types::Object;
use rand::Rng;
use tracing::{info, warn};

use crate::format::{
    EOF_MARK_SIZE, OP_AUX, OP_EOF, OP_EXPIRETIME_MS, OP_FREQ, OP_IDLE, OP_RESIZEDB, OP_SELECTDB,
    RDB_VERSION,
};
use crate::io::{Emitter, IncrementalFsyncFile, AUTOSYNC_BYTES};
use crate::value::{value_type_tag, write_value};

/// Replication state persisted alongside the keyspace so a restarted
/// process can resume a partial-sync conversation, plus the cached
/// script bodies a follower may still reference.
#[derive(Clone, Debug, Default)]
pub struct SaveInfo {
    /// Database the replication stream was selecting.
    pub repl_stream_db: u64,
    /// 40-hex-char replication id.
    pub repl_id: String,
    /// Master replication offset at save time.
    pub repl_offset: i64,
    /// Cached script bodies, one auxiliary field each.
    pub scripts: Vec<Vec<u8>>,
}

/// Writer-side switches.
#[derive(Clone, Copy, Debug)]
pub struct SaveOptions {
    /// Maintain and write the CRC-64 trailer (zero trailer when off).
    pub checksum: bool,
    /// Attempt LZF on long strings.
    pub compression: bool,
    /// Spread fsync over the write instead of one flush at the end.
    pub incremental_fsync: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            checksum: true,
            compression: true,
            incremental_fsync: true,
        }
    }
}

/// Serialize the full multi-database state into `emitter`, trailer
/// included.
pub fn write_snapshot<W: Write>(
    emitter: &mut Emitter<W>,
    dbs: &[Database],
    info: Option<&SaveInfo>,
) -> Result<()> {
    let magic = format!("REDIS{RDB_VERSION:04}");
    emitter.write_raw(magic.as_bytes())?;
    write_aux_preamble(emitter, info)?;

    for (index, db) in dbs.iter().enumerate() {
        if db.is_empty() {
            continue;
        }
        emitter.write_opcode(OP_SELECTDB)?;
        emitter.write_len(index as u64)?;

        // Table sizes are hints so the loader pre-sizes instead of
        // rehashing its way up.
        emitter.write_opcode(OP_RESIZEDB)?;
        emitter.write_len(db.len() as u64)?;
        emitter.write_len(db.expires_len() as u64)?;

        // The safe iterator suspends incremental rehash, so bucket
        // positions hold still for the whole walk.
        for entry in db.keyspace().iter_safe() {
            let expire = db.expire_at(entry.key());
            write_entry(emitter, entry.key(), entry.value(), expire)?;
        }
    }

    if let Some(info) = info {
        for script in &info.scripts {
            write_aux(emitter, b"lua", script)?;
        }
    }

    emitter.write_opcode(OP_EOF)?;
    let checksum = emitter.finalize_checksum();
    emitter.write_raw(&checksum.to_le_bytes())?;
    Ok(())
}

/// One keyspace entry: optional metadata opcodes, type tag, key,
/// value.
fn write_entry<W: Write>(
    emitter: &mut Emitter<W>,
    key: &[u8],
    object: &Object,
    expire_at_ms: Option<i64>,
) -> Result<()> {
    if let Some(at) = expire_at_ms {
        emitter.write_opcode(OP_EXPIRETIME_MS)?;
        emitter.write_ms_time(at)?;
    }
    if let Some(idle) = object.idle {
        emitter.write_opcode(OP_IDLE)?;
        emitter.write_len(idle)?;
    }
    if let Some(freq) = object.freq {
        // The frequency counter is logarithmic, one byte covers it.
        emitter.write_opcode(OP_FREQ)?;
        emitter.write_raw(&[freq])?;
    }
    emitter.write_opcode(value_type_tag(&object.value))?;
    emitter.write_string(key)?;
    write_value(emitter, &object.value)
}

fn write_aux<W: Write>(emitter: &mut Emitter<W>, name: &[u8], value: &[u8]) -> Result<()> {
    emitter.write_opcode(OP_AUX)?;
    emitter.write_string(name)?;
    emitter.write_string(value)
}

fn write_aux_int<W: Write>(emitter: &mut Emitter<W>, name: &[u8], value: i64) -> Result<()> {
    write_aux(emitter, name, value.to_string().as_bytes())
}

fn write_aux_preamble<W: Write>(emitter: &mut Emitter<W>, info: Option<&SaveInfo>) -> Result<()> {
    let bits: i64 = if cfg!(target_pointer_width = "64") {
        64
    } else {
        32
    };
    let ctime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64);

    write_aux(emitter, b"redis-ver", env!("CARGO_PKG_VERSION").as_bytes())?;
    write_aux_int(emitter, b"redis-bits", bits)?;
    write_aux_int(emitter, b"ctime", ctime)?;
    write_aux_int(emitter, b"used-mem", fredis_types::used_memory() as i64)?;

    if let Some(info) = info {
        write_aux_int(emitter, b"repl-stream-db", info.repl_stream_db as i64)?;
        write_aux(emitter, b"repl-id", info.repl_id.as_bytes())?;
        write_aux_int(emitter, b"repl-offset", info.repl_offset)?;
    }
    Ok(())
}

/// Serialize into a fresh buffer. The workhorse of tests and of
/// in-memory transfer paths.
pub fn write_snapshot_to_buffer(
    dbs: &[Database],
    info: Option<&SaveInfo>,
    opts: &SaveOptions,
) -> Result<Vec<u8>> {
    let mut emitter = Emitter::with_options(Vec::new(), opts.checksum, opts.compression);
    write_snapshot(&mut emitter, dbs, info)?;
    Ok(emitter.into_inner())
}

/// The temp file a save under this process id writes before renaming.
#[must_use]
pub fn temp_file_path(dest: &Path, pid: u32) -> PathBuf {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    dir.join(format!("temp-{pid}.rdb"))
}

/// Save to `dest` durably: write `temp-<pid>.rdb` beside it, fsync,
/// and atomically rename over the destination. On any error the temp
/// file is removed and `dest` is left untouched.
pub fn save_to_file(
    dest: &Path,
    dbs: &[Database],
    info: Option<&SaveInfo>,
    opts: &SaveOptions,
) -> Result<()> {
    let temp_path = temp_file_path(dest, std::process::id());

    if let Err(err) = write_temp_file(&temp_path, dbs, info, opts) {
        warn!(error = %err, temp = %temp_path.display(), "write error saving DB on disk");
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = std::fs::rename(&temp_path, dest) {
        warn!(
            error = %err,
            temp = %temp_path.display(),
            dest = %dest.display(),
            "cannot move temp DB file onto the final destination"
        );
        let _ = std::fs::remove_file(&temp_path);
        return Err(err.into());
    }

    info!(dest = %dest.display(), "DB saved on disk");
    Ok(())
}

fn write_temp_file(
    temp_path: &Path,
    dbs: &[Database],
    info: Option<&SaveInfo>,
    opts: &SaveOptions,
) -> Result<()> {
    let file = File::create(temp_path)?;
    let threshold = if opts.incremental_fsync {
        AUTOSYNC_BYTES
    } else {
        0
    };
    let sink = BufWriter::new(IncrementalFsyncFile::with_threshold(file, threshold));
    let mut emitter = Emitter::with_options(sink, opts.checksum, opts.compression);

    write_snapshot(&mut emitter, dbs, info)?;
    emitter.flush()?;

    let file = emitter
        .into_inner()
        .into_inner()
        .map_err(|err| FredisError::from(err.into_error()))?
        .into_inner();
    file.sync_all()?;
    Ok(())
}

/// Stream a snapshot to a socket-like sink, framed so receivers can
/// find the end without parsing the payload: `$EOF:<40 hex>\r\n`
/// first, the snapshot, then the same 40 hex bytes again.
pub fn write_snapshot_with_eof_mark<W: Write>(
    mut sink: W,
    dbs: &[Database],
    info: Option<&SaveInfo>,
    opts: &SaveOptions,
) -> Result<W> {
    let mark = random_eof_mark();
    sink.write_all(b"$EOF:")?;
    sink.write_all(&mark)?;
    sink.write_all(b"\r\n")?;

    let mut emitter = Emitter::with_options(sink, opts.checksum, opts.compression);
    write_snapshot(&mut emitter, dbs, info)?;

    let mut sink = emitter.into_inner();
    sink.write_all(&mark)?;
    sink.flush()?;
    Ok(sink)
}

fn random_eof_mark() -> [u8; EOF_MARK_SIZE] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let mut mark = [0_u8; EOF_MARK_SIZE];
    for byte in &mut mark {
        *byte = HEX[rng.gen_range(0..HEX.len())];
    }
    mark
}

#[cfg(test)]
mod tests {
    use super::*;
    use fredis_types::Value;

    fn one_db() -> Vec<Database> {
        let mut db = Database::new();
        db.add(b"greeting".to_vec(), Object::new(Value::Str(b"hello".to_vec())))
            .expect("fresh key");
        vec![db]
    }

    #[test]
    fn test_snapshot_magic_and_trailer() {
        let buf =
            write_snapshot_to_buffer(&one_db(), None, &SaveOptions::default()).expect("save");
        assert_eq!(&buf[..9], b"REDIS0009");

        // The trailer is the CRC-64 of everything before it.
        let body = &buf[..buf.len() - 8];
        let recorded = u64::from_le_bytes(buf[buf.len() - 8..].try_into().expect("8 bytes"));
        let crc = crc::Crc::<u64>::new(&crc::CRC_64_REDIS);
        assert_eq!(recorded, crc.checksum(body));
        assert_eq!(body[body.len() - 1], OP_EOF);
    }

    #[test]
    fn test_checksum_disabled_writes_zero_trailer() {
        let opts = SaveOptions {
            checksum: false,
            ..SaveOptions::default()
        };
        let buf = write_snapshot_to_buffer(&one_db(), None, &opts).expect("save");
        assert_eq!(&buf[buf.len() - 8..], &[0_u8; 8]);
    }

    #[test]
    fn test_empty_databases_are_skipped() {
        let dbs = vec![Database::new(), Database::new()];
        let buf = write_snapshot_to_buffer(&dbs, None, &SaveOptions::default()).expect("save");
        assert!(
            !buf[9..buf.len() - 9].contains(&OP_SELECTDB),
            "no SELECTDB section for empty databases"
        );
    }

    #[test]
    fn test_eof_mark_frames_the_stream() {
        let out = write_snapshot_with_eof_mark(
            Vec::new(),
            &one_db(),
            None,
            &SaveOptions::default(),
        )
        .expect("stream");

        assert_eq!(&out[..5], b"$EOF:");
        let mark = &out[5..5 + EOF_MARK_SIZE];
        assert!(mark.iter().all(u8::is_ascii_hexdigit));
        assert_eq!(&out[5 + EOF_MARK_SIZE..5 + EOF_MARK_SIZE + 2], b"\r\n");
        assert_eq!(&out[out.len() - EOF_MARK_SIZE..], mark);

        let payload = &out[5 + EOF_MARK_SIZE + 2..out.len() - EOF_MARK_SIZE];
        assert_eq!(&payload[..9], b"REDIS0009");
    }

    #[test]
    fn test_temp_file_path_is_sibling_of_destination() {
        assert_eq!(
            temp_file_path(Path::new("/var/lib/fredis/dump.rdb"), 1234),
            Path::new("/var/lib/fredis/temp-1234.rdb")
        );
        assert_eq!(
            temp_file_path(Path::new("dump.rdb"), 9),
            Path::new("./temp-9.rdb")
        );
    }

    #[test]
    fn test_save_to_file_writes_and_renames() {
        let dir = tempfile::tempdir().expect("temp dir");
        let dest = dir.path().join("dump.rdb");
        save_to_file(&dest, &one_db(), None, &SaveOptions::default()).expect("save");

        let bytes = std::fs::read(&dest).expect("read back");
        assert_eq!(&bytes[..9], b"REDIS0009");
        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("list dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("temp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
