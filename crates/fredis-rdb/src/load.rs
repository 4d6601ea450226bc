//! The load pipeline: opcode loop, per-entry scratch metadata, aux
//! recognition, checksum verification.
//!
//! Loading is all-or-nothing: any structural damage surfaces as an
//! integrity error and the caller must not serve the partially loaded
//! state. Every such error carries the source location of the check
//! that rejected the stream.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use fredis_core::Database;
use fredis_error::{corrupt, FredisError, Result};
use fredis_types::Object;
use tracing::{debug, info, warn};

use crate::format::{
    is_value_type, MIN_CHECKSUM_VERSION, OP_AUX, OP_EOF, OP_EXPIRETIME, OP_EXPIRETIME_MS,
    OP_FREQ, OP_IDLE, OP_MODULE_AUX, OP_RESIZEDB, OP_SELECTDB,
};
use crate::io::Loader;
use crate::value::read_value;

/// Loader-side switches.
#[derive(Clone, Copy, Debug)]
pub struct LoadOptions {
    /// Verify the CRC-64 trailer (files of version ≥ 5). A recorded
    /// zero means the writer disabled checksums; that is logged and
    /// accepted.
    pub verify_checksum: bool,
    /// Keep keys whose expiry is already in the past. A replica
    /// loading its master's snapshot must keep them: the master owns
    /// expiry, and dropping them here would desynchronize the pair.
    pub keep_expired: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            keep_expired: false,
        }
    }
}

/// State recovered from auxiliary fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadInfo {
    pub repl_stream_db: Option<u64>,
    pub repl_id: Option<String>,
    pub repl_offset: Option<i64>,
    /// Cached script bodies, in file order.
    pub scripts: Vec<Vec<u8>>,
}

fn unix_ms_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Load one snapshot stream into `dbs`. The magic header is consumed
/// here if the caller has not already read it.
pub fn load_snapshot<R: Read>(
    loader: &mut Loader<R>,
    dbs: &mut [Database],
    opts: &LoadOptions,
) -> Result<LoadInfo> {
    if loader.version() == 0 {
        loader.read_header()?;
    }
    let version = loader.version();
    let now_ms = unix_ms_now();

    let mut load_info = LoadInfo::default();
    let mut current_db = 0_usize;

    // Metadata opcodes set scratch state that applies to the next
    // keyspace entry only.
    let mut expire_at_ms: Option<i64> = None;
    let mut idle: Option<u64> = None;
    let mut freq: Option<u8> = None;

    loop {
        let opcode = loader.read_u8()?;
        match opcode {
            OP_EXPIRETIME => {
                // Legacy seconds form, scaled up on the spot.
                expire_at_ms = Some(loader.read_secs_time()? * 1000);
            }
            OP_EXPIRETIME_MS => {
                expire_at_ms = Some(loader.read_ms_time()?);
            }
            OP_FREQ => {
                freq = Some(loader.read_u8()?);
            }
            OP_IDLE => {
                idle = Some(loader.read_plain_len()?);
            }
            OP_EOF => break,
            OP_SELECTDB => {
                let index = loader.read_plain_len()?;
                let index = usize::try_from(index)
                    .ok()
                    .filter(|&i| i < dbs.len())
                    .ok_or_else(|| {
                        corrupt!(
                            "snapshot selects database {index}, only {} configured",
                            dbs.len()
                        )
                    })?;
                current_db = index;
            }
            OP_RESIZEDB => {
                let db_size = loader.read_plain_len()?;
                let expires_size = loader.read_plain_len()?;
                dbs[current_db].expand_hints(
                    usize::try_from(db_size).unwrap_or(usize::MAX),
                    usize::try_from(expires_size).unwrap_or(usize::MAX),
                );
            }
            OP_AUX => {
                let name = loader.read_string_bytes()?;
                let value = loader.read_string_bytes()?;
                apply_aux_field(&mut load_info, &name, value);
            }
            OP_MODULE_AUX => {
                let id = loader.read_plain_len()?;
                return Err(FredisError::UnknownModule { id });
            }
            tag if is_value_type(tag) => {
                let key = loader.read_string_bytes()?;
                let value = read_value(loader, tag)?;

                // A primary loading its own file drops keys that
                // expired while the server was down.
                let keep = opts.keep_expired || expire_at_ms.map_or(true, |at| at >= now_ms);
                if keep {
                    let mut object = Object::new(value);
                    object.idle = idle;
                    object.freq = freq;
                    let db = &mut dbs[current_db];
                    if let Some(at) = expire_at_ms {
                        db.set(key.clone(), object);
                        db.set_expire(&key, at)?;
                    } else {
                        db.set(key, object);
                    }
                }

                expire_at_ms = None;
                idle = None;
                freq = None;
            }
            other => return Err(corrupt!("unknown opcode {other}")),
        }
    }

    if version >= MIN_CHECKSUM_VERSION {
        let computed = loader.finalize_checksum();
        let mut trailer = [0_u8; 8];
        loader.read_exact_buf(&mut trailer)?;
        let recorded = u64::from_le_bytes(trailer);
        if opts.verify_checksum {
            if recorded == 0 {
                warn!("snapshot was saved with checksum disabled, no verification performed");
            } else if recorded != computed {
                return Err(FredisError::ChecksumMismatch { recorded, computed });
            }
        }
    }

    Ok(load_info)
}

fn apply_aux_field(info: &mut LoadInfo, name: &[u8], value: Vec<u8>) {
    match name {
        b"repl-stream-db" => {
            info.repl_stream_db = ascii_to_u64(&value);
        }
        b"repl-id" => {
            if value.len() == 40 {
                info.repl_id = String::from_utf8(value).ok();
            }
        }
        b"repl-offset" => {
            info.repl_offset = ascii_to_i64(&value);
        }
        b"lua" => {
            info.scripts.push(value);
        }
        _ if name.first() == Some(&b'%') => {
            // Fields whose name starts with '%' are informational and
            // meant to be surfaced at load time.
            info!(
                name = %String::from_utf8_lossy(name),
                value = %String::from_utf8_lossy(&value),
                "snapshot info field"
            );
        }
        _ => {
            // Forward compatibility: unknown auxiliary fields are
            // skipped, not fatal.
            debug!(
                name = %String::from_utf8_lossy(name),
                "unrecognized auxiliary field"
            );
        }
    }
}

fn ascii_to_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn ascii_to_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Load a snapshot file from disk.
pub fn load_from_file(path: &Path, dbs: &mut [Database], opts: &LoadOptions) -> Result<LoadInfo> {
    info!(path = %path.display(), "loading snapshot");
    let file = File::open(path)?;
    let mut loader = Loader::new(BufReader::new(file));
    loader.read_header()?;
    let load_info = load_snapshot(&mut loader, dbs, opts)?;
    info!(path = %path.display(), "DB loaded from disk");
    Ok(load_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Emitter;
    use crate::save::{write_snapshot_to_buffer, SaveInfo, SaveOptions};
    use fredis_types::Value;

    #[test]
    fn test_unknown_opcode_is_corruption() {
        let mut emitter = Emitter::new(Vec::new());
        emitter.write_raw(b"REDIS0009").expect("magic");
        emitter.write_opcode(246).expect("bogus opcode");
        let buf = emitter.into_inner();

        let mut loader = Loader::new(buf.as_slice());
        let mut dbs = vec![Database::new()];
        let err = load_snapshot(&mut loader, &mut dbs, &LoadOptions::default())
            .expect_err("opcode 246 must be rejected");
        assert!(matches!(err, FredisError::Corrupt { .. }), "{err:?}");
    }

    #[test]
    fn test_select_of_unconfigured_database_is_corruption() {
        let mut db = Database::new();
        db.add(b"k".to_vec(), Object::new(Value::Str(b"v".to_vec())))
            .expect("fresh key");
        // Written as database 0 of a one-database server...
        let buf = write_snapshot_to_buffer(&[Database::new(), db], None, &SaveOptions::default())
            .expect("save");

        // ...but loaded into a server configured with one database.
        let mut dbs = vec![Database::new()];
        let mut loader = Loader::new(buf.as_slice());
        let err = load_snapshot(&mut loader, &mut dbs, &LoadOptions::default())
            .expect_err("database index out of range");
        assert!(matches!(err, FredisError::Corrupt { .. }), "{err:?}");
    }

    #[test]
    fn test_truncated_stream_reports_short_read() {
        let db = {
            let mut db = Database::new();
            db.add(b"k".to_vec(), Object::new(Value::Str(vec![7; 100])))
                .expect("fresh key");
            db
        };
        let buf =
            write_snapshot_to_buffer(&[db], None, &SaveOptions::default()).expect("save");

        let mut dbs = vec![Database::new()];
        let mut loader = Loader::new(&buf[..buf.len() / 2]);
        let err = load_snapshot(&mut loader, &mut dbs, &LoadOptions::default())
            .expect_err("truncation must fail the load");
        assert!(
            matches!(err, FredisError::ShortRead { .. } | FredisError::Corrupt { .. }),
            "{err:?}"
        );
    }

    #[test]
    fn test_expired_keys_are_filtered_unless_kept() {
        let mut db = Database::new();
        db.add(b"gone".to_vec(), Object::new(Value::Str(b"v".to_vec())))
            .expect("fresh key");
        db.set_expire(b"gone", 1_000).expect("key exists");
        db.add(b"alive".to_vec(), Object::new(Value::Str(b"v".to_vec())))
            .expect("fresh key");
        db.set_expire(b"alive", i64::MAX).expect("key exists");
        let buf =
            write_snapshot_to_buffer(&[db], None, &SaveOptions::default()).expect("save");

        let mut dbs = vec![Database::new()];
        let mut loader = Loader::new(buf.as_slice());
        load_snapshot(&mut loader, &mut dbs, &LoadOptions::default()).expect("load");
        assert!(dbs[0].peek(b"gone").is_none(), "stale key must be dropped");
        assert!(dbs[0].peek(b"alive").is_some());

        let mut dbs = vec![Database::new()];
        let mut loader = Loader::new(buf.as_slice());
        let opts = LoadOptions {
            keep_expired: true,
            ..LoadOptions::default()
        };
        load_snapshot(&mut loader, &mut dbs, &opts).expect("load");
        assert!(
            dbs[0].peek(b"gone").is_some(),
            "replica mode must keep master-owned expiries"
        );
        assert_eq!(dbs[0].expire_at(b"gone"), Some(1_000));
    }

    #[test]
    fn test_aux_fields_roundtrip_through_load_info() {
        let mut db = Database::new();
        db.add(b"k".to_vec(), Object::new(Value::Str(b"v".to_vec())))
            .expect("fresh key");
        let info = SaveInfo {
            repl_stream_db: 3,
            repl_id: "f".repeat(40),
            repl_offset: 123_456_789,
            scripts: vec![b"return 1".to_vec(), b"return 2".to_vec()],
        };
        let buf = write_snapshot_to_buffer(&[db], Some(&info), &SaveOptions::default())
            .expect("save");

        let mut dbs = vec![Database::new()];
        let mut loader = Loader::new(buf.as_slice());
        let loaded = load_snapshot(&mut loader, &mut dbs, &LoadOptions::default()).expect("load");
        assert_eq!(loaded.repl_stream_db, Some(3));
        assert_eq!(loaded.repl_id.as_deref(), Some("f".repeat(40).as_str()));
        assert_eq!(loaded.repl_offset, Some(123_456_789));
        assert_eq!(loaded.scripts, info.scripts);
    }
}
