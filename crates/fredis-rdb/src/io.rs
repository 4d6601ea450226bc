//! Checksumming byte streams and snapshot sinks.
//!
//! Every byte a snapshot writes or reads flows through an [`Emitter`]
//! or [`Loader`], which maintain a running CRC-64 (Jones polynomial)
//! alongside the transfer so the trailer can be produced and verified
//! without a second pass. Two special sinks cover the non-file
//! targets: [`IncrementalFsyncFile`] spreads fsync cost over the whole
//! write, and [`FanoutWriter`] streams one snapshot to many
//! destinations at once, dropping targets as they fail.

use std::fs::File;
use std::io::{self, Read, Write};

use crc::{Crc, Digest, CRC_64_REDIS};
use fredis_error::{FredisError, Result};

use crate::format::{self, MAGIC};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// Sync-to-disk cadence of [`IncrementalFsyncFile`]: flushing every
/// 32 MiB keeps the final fsync from having to push the whole file at
/// once.
pub const AUTOSYNC_BYTES: u64 = 32 * 1024 * 1024;

// === Emitter ===

/// A buffered, checksumming writer for one snapshot.
pub struct Emitter<W: Write> {
    sink: W,
    digest: Option<Digest<'static, u64>>,
    processed: u64,
    pub(crate) compression: bool,
}

impl<W: Write> Emitter<W> {
    /// Checksumming, compressing emitter; the common configuration.
    pub fn new(sink: W) -> Self {
        Self::with_options(sink, true, true)
    }

    pub fn with_options(sink: W, checksum: bool, compression: bool) -> Self {
        Self {
            sink,
            digest: checksum.then(|| CRC64.digest()),
            processed: 0,
            compression,
        }
    }

    /// Write raw bytes, folding them into the running checksum.
    pub fn write_raw(&mut self, buf: &[u8]) -> Result<()> {
        if let Some(digest) = self.digest.as_mut() {
            digest.update(buf);
        }
        self.sink.write_all(buf)?;
        self.processed += buf.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Close the checksum and return it; 0 when checksumming is off.
    /// Bytes written afterwards (the trailer itself, stream framing)
    /// are not checksummed.
    pub fn finalize_checksum(&mut self) -> u64 {
        self.digest.take().map_or(0, |d| d.finalize())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    #[must_use]
    pub fn get_ref(&self) -> &W {
        &self.sink
    }
}

// === Loader ===

/// A checksumming reader for one snapshot.
pub struct Loader<R: Read> {
    source: R,
    digest: Option<Digest<'static, u64>>,
    processed: u64,
    version: u32,
}

impl<R: Read> Loader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            digest: Some(CRC64.digest()),
            processed: 0,
            version: 0,
        }
    }

    /// Read and validate the magic header, returning the file's
    /// format version.
    pub fn read_header(&mut self) -> Result<u32> {
        let mut header = [0_u8; 9];
        self.read_exact_buf(&mut header)?;
        if &header[..5] != MAGIC {
            return Err(FredisError::WrongSignature);
        }
        let digits = std::str::from_utf8(&header[5..]).map_err(|_| FredisError::WrongSignature)?;
        let version: u32 = digits.parse().map_err(|_| FredisError::WrongSignature)?;
        if version < 1 || version > format::RDB_VERSION {
            return Err(FredisError::UnsupportedVersion { version });
        }
        self.version = version;
        Ok(version)
    }

    /// Format version parsed by [`Loader::read_header`].
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Fill `buf` completely, reporting exactly how short the stream
    /// came up when it ends early.
    pub fn read_exact_buf(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(FredisError::ShortRead {
                        expected: buf.len(),
                        actual: filled,
                    });
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(digest) = self.digest.as_mut() {
            digest.update(buf);
        }
        self.processed += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0_u8; 1];
        self.read_exact_buf(&mut byte)?;
        Ok(byte[0])
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_exact_buf(&mut buf)?;
        Ok(buf)
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Close the checksum over everything read so far and return it.
    /// The trailer is read afterwards, un-checksummed, and compared
    /// against this value.
    pub fn finalize_checksum(&mut self) -> u64 {
        self.digest.take().map_or(0, |d| d.finalize())
    }
}

// === File sink with spread-out fsync ===

/// A file writer that issues a data sync every [`AUTOSYNC_BYTES`]
/// written, so a multi-gigabyte save does not hand the disk one giant
/// flush at the end.
pub struct IncrementalFsyncFile {
    file: File,
    since_sync: u64,
    threshold: u64,
}

impl IncrementalFsyncFile {
    #[must_use]
    pub fn new(file: File) -> Self {
        Self::with_threshold(file, AUTOSYNC_BYTES)
    }

    #[must_use]
    pub fn with_threshold(file: File, threshold: u64) -> Self {
        Self {
            file,
            since_sync: 0,
            threshold,
        }
    }

    pub fn into_inner(self) -> File {
        self.file
    }
}

impl Write for IncrementalFsyncFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.since_sync += written as u64;
        if self.threshold > 0 && self.since_sync >= self.threshold {
            self.file.sync_data()?;
            self.since_sync = 0;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

// === Replication fan-out ===

/// Streams one byte sequence to several targets.
///
/// A failing target is dropped from the set (its error is kept for the
/// caller) and the stream continues for the others; the write as a
/// whole fails only when no healthy target remains.
pub struct FanoutWriter<W: Write> {
    targets: Vec<FanoutTarget<W>>,
}

struct FanoutTarget<W: Write> {
    sink: W,
    error: Option<io::Error>,
}

impl<W: Write> FanoutWriter<W> {
    #[must_use]
    pub fn new(sinks: Vec<W>) -> Self {
        Self {
            targets: sinks
                .into_iter()
                .map(|sink| FanoutTarget { sink, error: None })
                .collect(),
        }
    }

    /// Targets that have not failed yet.
    #[must_use]
    pub fn healthy_targets(&self) -> usize {
        self.targets.iter().filter(|t| t.error.is_none()).count()
    }

    /// Per-target results, in construction order.
    pub fn into_results(self) -> Vec<std::result::Result<W, io::Error>> {
        self.targets
            .into_iter()
            .map(|t| match t.error {
                None => Ok(t.sink),
                Some(err) => Err(err),
            })
            .collect()
    }

    fn for_each_healthy(
        &mut self,
        mut op: impl FnMut(&mut W) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut healthy = 0_usize;
        for target in &mut self.targets {
            if target.error.is_some() {
                continue;
            }
            match op(&mut target.sink) {
                Ok(()) => healthy += 1,
                Err(err) => target.error = Some(err),
            }
        }
        if healthy == 0 {
            return Err(io::Error::other(FredisError::AllTargetsFailed {
                targets: self.targets.len(),
            }));
        }
        Ok(())
    }
}

impl<W: Write> Write for FanoutWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.for_each_healthy(|sink| sink.write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.for_each_healthy(Write::flush)
    }
}
