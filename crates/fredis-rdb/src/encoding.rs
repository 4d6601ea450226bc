//! Primitive wire forms: compact lengths, integer-encoded and
//! LZF-compressed strings, the two double formats, timestamps.
//!
//! Length encoding, selected by the top two bits of the first byte:
//!
//! ```text
//! 00LLLLLL                      6-bit length
//! 01LLLLLL LLLLLLLL             14-bit length
//! 0x80 <4 bytes BE>             32-bit length
//! 0x81 <8 bytes BE>             64-bit length
//! 11EEEEEE                      special string encoding E
//! ```
//!
//! Special encodings pack a decimal string as a little-endian integer
//! (8/16/32 bits) or as an LZF block framed by compressed length and
//! original length.

use std::io::{Read, Write};

use fredis_error::{corrupt, Result};

use crate::format::{
    DOUBLE_NAN, DOUBLE_NEG_INF, DOUBLE_POS_INF, ENC_INT16, ENC_INT32, ENC_INT8, ENC_LZF,
    INT_ENCODABLE_MAX_LEN, LEN_14BIT, LEN_32BIT, LEN_64BIT, LEN_6BIT, LEN_ENCVAL,
    LZF_MIN_SAVING, LZF_MIN_STRING_LEN,
};
use crate::io::{Emitter, Loader};
use crate::lzf;

/// Outcome of reading a length byte: an actual length, or the
/// discriminator of a special string encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Length {
    Plain(u64),
    Encoded(u8),
}

/// A loaded string in its cheapest faithful form: raw bytes, or the
/// integer a special encoding carried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadedString {
    Raw(Vec<u8>),
    Int(i64),
}

impl LoadedString {
    /// The string's byte content, materializing the decimal form of
    /// integer-encoded strings.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Raw(bytes) => bytes,
            Self::Int(value) => value.to_string().into_bytes(),
        }
    }
}

/// Integer special-encoding of `value`: `(buffer, length)`, or `None`
/// when the value needs more than 32 bits.
fn encode_integer(value: i64) -> Option<([u8; 5], usize)> {
    let mut buf = [0_u8; 5];
    if let Ok(v) = i8::try_from(value) {
        buf[0] = (LEN_ENCVAL << 6) | ENC_INT8;
        buf[1] = v as u8;
        Some((buf, 2))
    } else if let Ok(v) = i16::try_from(value) {
        buf[0] = (LEN_ENCVAL << 6) | ENC_INT16;
        buf[1..3].copy_from_slice(&v.to_le_bytes());
        Some((buf, 3))
    } else if let Ok(v) = i32::try_from(value) {
        buf[0] = (LEN_ENCVAL << 6) | ENC_INT32;
        buf[1..5].copy_from_slice(&v.to_le_bytes());
        Some((buf, 5))
    } else {
        None
    }
}

/// Integer special-encoding of a decimal string, accepted only when
/// re-formatting the parsed value reproduces the input exactly (no
/// leading zeros, no plus sign, no whitespace).
fn integer_string_encoding(s: &[u8]) -> Option<([u8; 5], usize)> {
    let text = std::str::from_utf8(s).ok()?;
    let value: i64 = text.parse().ok()?;
    if value.to_string().as_bytes() != s {
        return None;
    }
    encode_integer(value)
}

impl<W: Write> Emitter<W> {
    /// One opcode or type-tag byte.
    pub fn write_opcode(&mut self, opcode: u8) -> Result<()> {
        self.write_raw(&[opcode])
    }

    /// A compact length.
    pub fn write_len(&mut self, len: u64) -> Result<()> {
        if len < 1 << 6 {
            self.write_raw(&[(LEN_6BIT << 6) | len as u8])
        } else if len < 1 << 14 {
            self.write_raw(&[(LEN_14BIT << 6) | (len >> 8) as u8, (len & 0xff) as u8])
        } else if let Ok(len32) = u32::try_from(len) {
            self.write_raw(&[LEN_32BIT])?;
            self.write_raw(&len32.to_be_bytes())
        } else {
            self.write_raw(&[LEN_64BIT])?;
            self.write_raw(&len.to_be_bytes())
        }
    }

    /// A string, choosing the densest applicable form: integer
    /// special-encoding for short decimal strings, LZF for long
    /// compressible ones, verbatim otherwise.
    pub fn write_string(&mut self, s: &[u8]) -> Result<()> {
        if s.len() <= INT_ENCODABLE_MAX_LEN {
            if let Some((buf, len)) = integer_string_encoding(s) {
                return self.write_raw(&buf[..len]);
            }
        }
        if self.compression && s.len() > LZF_MIN_STRING_LEN && self.try_write_lzf(s)? {
            return Ok(());
        }
        self.write_len(s.len() as u64)?;
        if !s.is_empty() {
            self.write_raw(s)?;
        }
        Ok(())
    }

    /// An integer in string position: special-encoded when it fits 32
    /// bits, as its decimal text otherwise.
    pub fn write_int_string(&mut self, value: i64) -> Result<()> {
        if let Some((buf, len)) = encode_integer(value) {
            return self.write_raw(&buf[..len]);
        }
        let text = value.to_string();
        self.write_len(text.len() as u64)?;
        self.write_raw(text.as_bytes())
    }

    /// Compress and emit when it pays for itself; `Ok(false)` means
    /// the caller should store verbatim.
    fn try_write_lzf(&mut self, s: &[u8]) -> Result<bool> {
        let Some(budget) = s.len().checked_sub(LZF_MIN_SAVING) else {
            return Ok(false);
        };
        match lzf::compress(s, budget) {
            Some(packed) => {
                self.write_lzf_blob(&packed, s.len())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// An already-compressed block in string position: tag, compressed
    /// length, original length, bytes.
    pub fn write_lzf_blob(&mut self, packed: &[u8], raw_len: usize) -> Result<()> {
        self.write_raw(&[(LEN_ENCVAL << 6) | ENC_LZF])?;
        self.write_len(packed.len() as u64)?;
        self.write_len(raw_len as u64)?;
        self.write_raw(packed)
    }

    /// IEEE-754 binary64, little-endian. The form used inside sorted
    /// sets since format version 8.
    pub fn write_double_binary(&mut self, value: f64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// IEEE-754 binary32, little-endian.
    pub fn write_float_binary(&mut self, value: f32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// The legacy ASCII double: one prefix byte that is either a
    /// sentinel (nan, ±inf) or the byte length of the decimal text
    /// that follows.
    pub fn write_double_legacy(&mut self, value: f64) -> Result<()> {
        if value.is_nan() {
            return self.write_raw(&[DOUBLE_NAN]);
        }
        if value.is_infinite() {
            let sentinel = if value < 0.0 {
                DOUBLE_NEG_INF
            } else {
                DOUBLE_POS_INF
            };
            return self.write_raw(&[sentinel]);
        }
        let text = value.to_string();
        debug_assert!(text.len() < usize::from(DOUBLE_NAN));
        self.write_raw(&[text.len() as u8])?;
        self.write_raw(text.as_bytes())
    }

    /// Absolute unix-millisecond timestamp, 8 bytes little-endian.
    pub fn write_ms_time(&mut self, unix_ms: i64) -> Result<()> {
        self.write_raw(&unix_ms.to_le_bytes())
    }
}

impl<R: Read> Loader<R> {
    /// Read a length byte (and its extension bytes).
    pub fn read_len(&mut self) -> Result<Length> {
        let first = self.read_u8()?;
        match first >> 6 {
            x if x == LEN_6BIT => Ok(Length::Plain(u64::from(first & 0x3f))),
            x if x == LEN_14BIT => {
                let second = self.read_u8()?;
                Ok(Length::Plain(
                    (u64::from(first & 0x3f) << 8) | u64::from(second),
                ))
            }
            x if x == LEN_ENCVAL => Ok(Length::Encoded(first & 0x3f)),
            _ => match first {
                LEN_32BIT => {
                    let mut buf = [0_u8; 4];
                    self.read_exact_buf(&mut buf)?;
                    Ok(Length::Plain(u64::from(u32::from_be_bytes(buf))))
                }
                LEN_64BIT => {
                    let mut buf = [0_u8; 8];
                    self.read_exact_buf(&mut buf)?;
                    Ok(Length::Plain(u64::from_be_bytes(buf)))
                }
                other => Err(corrupt!("unknown length encoding byte {other:#04x}")),
            },
        }
    }

    /// Read a length that must not be a special encoding.
    pub fn read_plain_len(&mut self) -> Result<u64> {
        match self.read_len()? {
            Length::Plain(len) => Ok(len),
            Length::Encoded(enc) => Err(corrupt!(
                "special string encoding {enc} where a plain length is required"
            )),
        }
    }

    /// Read a string in any of its wire forms.
    pub fn read_string(&mut self) -> Result<LoadedString> {
        match self.read_len()? {
            Length::Encoded(enc) => match enc {
                ENC_INT8 => {
                    let byte = self.read_u8()?;
                    Ok(LoadedString::Int(i64::from(byte as i8)))
                }
                ENC_INT16 => {
                    let mut buf = [0_u8; 2];
                    self.read_exact_buf(&mut buf)?;
                    Ok(LoadedString::Int(i64::from(i16::from_le_bytes(buf))))
                }
                ENC_INT32 => {
                    let mut buf = [0_u8; 4];
                    self.read_exact_buf(&mut buf)?;
                    Ok(LoadedString::Int(i64::from(i32::from_le_bytes(buf))))
                }
                ENC_LZF => {
                    let compressed_len = self.read_plain_len()?;
                    let raw_len = self.read_plain_len()?;
                    let packed = self.read_bytes(usize::try_from(compressed_len).map_err(
                        |_| corrupt!("lzf compressed length {compressed_len} overflows usize"),
                    )?)?;
                    let raw_len = usize::try_from(raw_len)
                        .map_err(|_| corrupt!("lzf original length {raw_len} overflows usize"))?;
                    Ok(LoadedString::Raw(lzf::decompress(&packed, raw_len)?))
                }
                other => Err(corrupt!("unknown string encoding {other}")),
            },
            Length::Plain(len) => {
                let len = usize::try_from(len)
                    .map_err(|_| corrupt!("string length {len} overflows usize"))?;
                Ok(LoadedString::Raw(self.read_bytes(len)?))
            }
        }
    }

    /// [`Loader::read_string`], flattened to bytes.
    pub fn read_string_bytes(&mut self) -> Result<Vec<u8>> {
        Ok(self.read_string()?.into_bytes())
    }

    /// Binary64 little-endian.
    pub fn read_double_binary(&mut self) -> Result<f64> {
        let mut buf = [0_u8; 8];
        self.read_exact_buf(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    /// Binary32 little-endian.
    pub fn read_float_binary(&mut self) -> Result<f32> {
        let mut buf = [0_u8; 4];
        self.read_exact_buf(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    /// The legacy ASCII double form.
    pub fn read_double_legacy(&mut self) -> Result<f64> {
        let prefix = self.read_u8()?;
        match prefix {
            DOUBLE_NAN => Ok(f64::NAN),
            DOUBLE_POS_INF => Ok(f64::INFINITY),
            DOUBLE_NEG_INF => Ok(f64::NEG_INFINITY),
            len => {
                let text = self.read_bytes(usize::from(len))?;
                std::str::from_utf8(&text)
                    .ok()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| corrupt!("malformed ascii double"))
            }
        }
    }

    /// Absolute unix-millisecond timestamp, 8 bytes little-endian.
    pub fn read_ms_time(&mut self) -> Result<i64> {
        let mut buf = [0_u8; 8];
        self.read_exact_buf(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// The legacy 4-byte seconds expiry.
    pub fn read_secs_time(&mut self) -> Result<i64> {
        let mut buf = [0_u8; 4];
        self.read_exact_buf(&mut buf)?;
        Ok(i64::from(i32::from_le_bytes(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn emit(f: impl FnOnce(&mut Emitter<Vec<u8>>)) -> Vec<u8> {
        let mut emitter = Emitter::new(Vec::new());
        f(&mut emitter);
        emitter.into_inner()
    }

    fn load(bytes: &[u8]) -> Loader<&[u8]> {
        Loader::new(bytes)
    }

    #[test]
    fn test_len_wire_shapes() {
        assert_eq!(emit(|e| e.write_len(0).expect("len")), [0x00]);
        assert_eq!(emit(|e| e.write_len(63).expect("len")), [0x3f]);
        assert_eq!(emit(|e| e.write_len(64).expect("len")), [0x40, 64]);
        assert_eq!(emit(|e| e.write_len(16383).expect("len")), [0x7f, 0xff]);
        assert_eq!(
            emit(|e| e.write_len(16384).expect("len")),
            [0x80, 0x00, 0x00, 0x40, 0x00]
        );
        assert_eq!(
            emit(|e| e.write_len(u64::from(u32::MAX)).expect("len")),
            [0x80, 0xff, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            emit(|e| e.write_len(u64::from(u32::MAX) + 1).expect("len")),
            [0x81, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_int16_string_wire_shape() {
        // "12345" packs into the 16-bit integer form: tag 0xc1, then
        // 0x3039 little-endian.
        let bytes = emit(|e| e.write_string(b"12345").expect("string"));
        assert_eq!(bytes, [0xc1, 0x39, 0x30]);

        let mut loader = load(&bytes);
        assert_eq!(
            loader.read_string().expect("string"),
            LoadedString::Int(12345)
        );
        assert_eq!(
            loader.processed() as usize,
            bytes.len(),
            "no trailing bytes"
        );
    }

    #[test]
    fn test_integer_encoding_widths() {
        assert_eq!(emit(|e| e.write_string(b"7").expect("s")), [0xc0, 7]);
        assert_eq!(
            emit(|e| e.write_string(b"-128").expect("s")),
            [0xc0, 0x80]
        );
        assert_eq!(
            emit(|e| e.write_string(b"-129").expect("s")),
            [0xc1, 0x7f, 0xff]
        );
        let bytes = emit(|e| e.write_string(b"100000").expect("s"));
        assert_eq!(bytes[0], 0xc2);
        assert_eq!(bytes.len(), 5);
        // Too wide for 32 bits: stored as plain text.
        let bytes = emit(|e| e.write_string(b"12345678901").expect("s"));
        assert_eq!(bytes[0] >> 6, 0);
        assert_eq!(&bytes[1..], b"12345678901");
    }

    #[test]
    fn test_non_canonical_decimals_stay_verbatim() {
        for s in [&b"007"[..], b"+5", b" 5", b"5 ", b"-0", b""] {
            let bytes = emit(|e| e.write_string(s).expect("s"));
            assert_eq!(bytes[0] >> 6, 0, "{s:?} must not integer-encode");
            let mut loader = load(&bytes);
            assert_eq!(
                loader.read_string().expect("s"),
                LoadedString::Raw(s.to_vec())
            );
        }
    }

    #[test]
    fn test_long_compressible_string_uses_lzf() {
        let input = vec![b'x'; 300];
        let bytes = emit(|e| e.write_string(&input).expect("s"));
        assert_eq!(bytes[0], 0xc3, "lzf tag expected");
        assert!(bytes.len() < input.len());

        let mut loader = load(&bytes);
        assert_eq!(
            loader.read_string().expect("s"),
            LoadedString::Raw(input)
        );
    }

    #[test]
    fn test_compression_switch_off_stores_verbatim() {
        let input = vec![b'x'; 300];
        let mut emitter = Emitter::with_options(Vec::new(), true, false);
        emitter.write_string(&input).expect("s");
        let bytes = emitter.into_inner();
        assert_ne!(bytes[0], 0xc3);
        let mut loader = load(&bytes);
        assert_eq!(
            loader.read_string().expect("s"),
            LoadedString::Raw(input)
        );
    }

    #[test]
    fn test_incompressible_long_string_stays_verbatim() {
        // Keyed pseudo-random bytes with no 3-byte repeats worth a
        // reference; the compressor cannot beat its budget.
        let mut state = 0x9e37_79b9_u32;
        let input: Vec<u8> = (0..300)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        let bytes = emit(|e| e.write_string(&input).expect("s"));
        assert_eq!(bytes[0] >> 6, 0, "plain length prefix expected");
        let mut loader = load(&bytes);
        assert_eq!(loader.read_string().expect("s").into_bytes(), input);
    }

    #[test]
    fn test_double_legacy_sentinels_and_text() {
        let bytes = emit(|e| e.write_double_legacy(f64::NAN).expect("d"));
        assert_eq!(bytes, [DOUBLE_NAN]);
        let bytes = emit(|e| e.write_double_legacy(f64::INFINITY).expect("d"));
        assert_eq!(bytes, [DOUBLE_POS_INF]);
        let bytes = emit(|e| e.write_double_legacy(f64::NEG_INFINITY).expect("d"));
        assert_eq!(bytes, [DOUBLE_NEG_INF]);

        for v in [0.0, -1.5, 3.141592653589793, 1e300, -2.2e-308] {
            let bytes = emit(|e| e.write_double_legacy(v).expect("d"));
            let mut loader = load(&bytes);
            assert_eq!(loader.read_double_legacy().expect("d"), v);
        }
        let nan_bytes = emit(|e| e.write_double_legacy(f64::NAN).expect("d"));
        let mut loader = load(&nan_bytes);
        assert!(loader.read_double_legacy().expect("d").is_nan());
    }

    #[test]
    fn test_double_binary_is_little_endian() {
        let bytes = emit(|e| e.write_double_binary(1.0).expect("d"));
        assert_eq!(bytes, 1.0_f64.to_le_bytes());
        let mut loader = load(&bytes);
        assert_eq!(loader.read_double_binary().expect("d"), 1.0);
    }

    #[test]
    fn test_ms_time_is_little_endian() {
        let bytes = emit(|e| e.write_ms_time(0x0102_0304_0506_0708).expect("t"));
        assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        let mut loader = load(&bytes);
        assert_eq!(loader.read_ms_time().expect("t"), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_secs_time_scales_to_ms_at_call_site() {
        let bytes = [0x10, 0x00, 0x00, 0x00];
        let mut loader = load(&bytes);
        assert_eq!(loader.read_secs_time().expect("t"), 16);
    }

    proptest! {
        #[test]
        fn prop_len_roundtrips_and_is_injective(a in any::<u64>(), b in any::<u64>()) {
            let bytes_a = emit(|e| e.write_len(a).expect("len"));
            let mut loader = load(&bytes_a);
            prop_assert_eq!(loader.read_len().expect("len"), Length::Plain(a));
            prop_assert_eq!(loader.processed() as usize, bytes_a.len());

            let bytes_b = emit(|e| e.write_len(b).expect("len"));
            if a != b {
                prop_assert_ne!(bytes_a, bytes_b);
            }
        }

        #[test]
        fn prop_int_strings_roundtrip_to_identical_ascii(v in any::<i64>()) {
            let text = v.to_string().into_bytes();
            let bytes = emit(|e| e.write_string(&text).expect("s"));
            let mut loader = load(&bytes);
            let back = loader.read_string().expect("s").into_bytes();
            prop_assert_eq!(back, text);
        }

        #[test]
        fn prop_strings_roundtrip_binary_safe(s in proptest::collection::vec(any::<u8>(), 0..600)) {
            let bytes = emit(|e| e.write_string(&s).expect("s"));
            let mut loader = load(&bytes);
            prop_assert_eq!(loader.read_string().expect("s").into_bytes(), s);
        }
    }
}
