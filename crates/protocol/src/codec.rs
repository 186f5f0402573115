//! Wire codec primitives
//!
//! Everything on the wire is big-endian. Variable-length integers use the
//! usual 7-bits-per-byte scheme with the continuation flag in the high bit;
//! a 32-bit value occupies 1-5 bytes, a 64-bit value 1-10. Strings are
//! var-int length-prefixed UTF-8 with a per-field cap; a declared length over
//! the cap (or past the end of the buffer) is a decode error, never a silent
//! truncation.
//!
//! All reads operate on [`bytes::Bytes`] cursors and check the remaining
//! length before consuming anything, so a truncated frame surfaces as
//! [`ProtocolError::BufferTooShort`] instead of a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Largest frame the framing layer will accept (length prefix included),
/// matching the 21-bit budget of a 3-byte var-int length.
pub const MAX_FRAME_LEN: usize = (1 << 21) - 1;

/// Default cap for free-form protocol strings, in characters.
pub const DEFAULT_STRING_CAP: usize = 32767;

fn ensure(buf: &impl Buf, need: usize) -> Result<()> {
    if buf.remaining() < need {
        Err(ProtocolError::BufferTooShort {
            need: need - buf.remaining(),
            have: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

// ---- fixed-width primitives --------------------------------------------

pub fn read_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn read_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn read_f64(buf: &mut Bytes) -> Result<f64> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

pub fn read_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(read_u8(buf)? != 0)
}

pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

// ---- var-ints ----------------------------------------------------------

/// Writes a 32-bit var-int (1-5 bytes).
pub fn write_var_int(buf: &mut BytesMut, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8((v & 0x7f) as u8 | 0x80);
        v >>= 7;
    }
}

/// Writes a 64-bit var-long (1-10 bytes).
pub fn write_var_long(buf: &mut BytesMut, value: i64) {
    let mut v = value as u64;
    loop {
        if v & !0x7f == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8((v & 0x7f) as u8 | 0x80);
        v >>= 7;
    }
}

/// Reads a 32-bit var-int, failing fast on truncation or an overlong
/// encoding past the natural 5-byte range.
pub fn read_var_int(buf: &mut Bytes) -> Result<i32> {
    let mut value: u32 = 0;
    for i in 0..5 {
        if !buf.has_remaining() {
            return Err(ProtocolError::BufferTooShort { need: 1, have: 0 });
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtocolError::VarIntTooLong { max_bytes: 5 })
}

/// Reads a 64-bit var-long.
pub fn read_var_long(buf: &mut Bytes) -> Result<i64> {
    let mut value: u64 = 0;
    for i in 0..10 {
        if !buf.has_remaining() {
            return Err(ProtocolError::BufferTooShort { need: 1, have: 0 });
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i64);
        }
    }
    Err(ProtocolError::VarIntTooLong { max_bytes: 10 })
}

/// Number of bytes [`write_var_int`] will emit for `value`.
pub fn var_int_len(value: i32) -> usize {
    let mut v = value as u32;
    let mut len = 1;
    while v & !0x7f != 0 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Attempts to read a var-int from the front of a raw byte slice without a
/// cursor, for framing code that must not consume partial prefixes.
///
/// Returns `Ok(None)` when the slice ends before the var-int does, and the
/// `(value, encoded_len)` pair otherwise.
pub fn try_peek_var_int(data: &[u8]) -> Result<Option<(i32, usize)>> {
    let mut value: u32 = 0;
    for (i, &byte) in data.iter().take(5).enumerate() {
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value as i32, i + 1)));
        }
    }
    if data.len() >= 5 {
        Err(ProtocolError::VarIntTooLong { max_bytes: 5 })
    } else {
        Ok(None)
    }
}

// ---- strings and blobs -------------------------------------------------

/// Reads a var-int length-prefixed UTF-8 string, rejecting declared lengths
/// over `cap` characters (or over `4 * cap` bytes, the UTF-8 worst case)
/// with a decode error.
pub fn read_string(buf: &mut Bytes, cap: usize) -> Result<String> {
    let declared = read_var_int(buf)?;
    if declared < 0 {
        return Err(ProtocolError::MalformedFrame("negative string length"));
    }
    let declared = declared as usize;
    if declared > cap.saturating_mul(4) {
        return Err(ProtocolError::StringTooLong { declared, cap });
    }
    ensure(buf, declared)?;
    let raw = buf.split_to(declared);
    let text = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    if text.chars().count() > cap {
        return Err(ProtocolError::StringTooLong { declared, cap });
    }
    Ok(text.to_owned())
}

/// Writes a var-int length-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, value: &str) {
    write_var_int(buf, value.len() as i32);
    buf.put_slice(value.as_bytes());
}

/// Reads a var-int length-prefixed byte blob with a cap.
pub fn read_blob(buf: &mut Bytes, cap: usize) -> Result<Vec<u8>> {
    let declared = read_var_int(buf)?;
    if declared < 0 {
        return Err(ProtocolError::MalformedFrame("negative byte array length"));
    }
    let declared = declared as usize;
    if declared > cap {
        return Err(ProtocolError::BlobTooLong { declared, cap });
    }
    ensure(buf, declared)?;
    Ok(buf.split_to(declared).to_vec())
}

/// Writes a var-int length-prefixed byte blob.
pub fn write_blob(buf: &mut BytesMut, value: &[u8]) {
    write_var_int(buf, value.len() as i32);
    buf.put_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_var_int(value: i32) -> usize {
        let mut buf = BytesMut::new();
        write_var_int(&mut buf, value);
        let len = buf.len();
        let mut bytes = buf.freeze();
        assert_eq!(read_var_int(&mut bytes).unwrap(), value);
        assert!(!bytes.has_remaining());
        len
    }

    #[test]
    fn var_int_byte_count_bands() {
        assert_eq!(roundtrip_var_int(0), 1);
        assert_eq!(roundtrip_var_int(127), 1);
        assert_eq!(roundtrip_var_int(128), 2);
        assert_eq!(roundtrip_var_int(16383), 2);
        assert_eq!(roundtrip_var_int(16384), 3);
        assert_eq!(roundtrip_var_int(2097151), 3);
        assert_eq!(roundtrip_var_int(2097152), 4);
        assert_eq!(roundtrip_var_int(268435455), 4);
        assert_eq!(roundtrip_var_int(268435456), 5);
        assert_eq!(roundtrip_var_int(i32::MAX), 5);
        // negative values always use the full five bytes
        assert_eq!(roundtrip_var_int(-1), 5);
        assert_eq!(roundtrip_var_int(i32::MIN), 5);
    }

    #[test]
    fn var_int_len_matches_encoder() {
        for value in [0, 1, 127, 128, 300, 16384, -1, i32::MAX, i32::MIN] {
            let mut buf = BytesMut::new();
            write_var_int(&mut buf, value);
            assert_eq!(var_int_len(value), buf.len(), "value {value}");
        }
    }

    #[test]
    fn truncated_var_int_fails() {
        let mut bytes = Bytes::from_static(&[0x80, 0x80]);
        assert!(matches!(
            read_var_int(&mut bytes),
            Err(ProtocolError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn overlong_var_int_fails() {
        let mut bytes = Bytes::from_static(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(matches!(
            read_var_int(&mut bytes),
            Err(ProtocolError::VarIntTooLong { max_bytes: 5 })
        ));
    }

    #[test]
    fn string_over_cap_is_rejected_not_truncated() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "abcdefgh");
        let mut bytes = buf.freeze();
        let err = read_string(&mut bytes, 4).unwrap_err();
        assert!(matches!(err, ProtocolError::StringTooLong { .. }));
    }

    #[test]
    fn string_declared_past_buffer_fails() {
        let mut buf = BytesMut::new();
        write_var_int(&mut buf, 64);
        buf.put_slice(b"short");
        let mut bytes = buf.freeze();
        assert!(matches!(
            read_string(&mut bytes, 128),
            Err(ProtocolError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn peek_var_int_incomplete_and_complete() {
        assert_eq!(try_peek_var_int(&[]).unwrap(), None);
        assert_eq!(try_peek_var_int(&[0x80]).unwrap(), None);
        assert_eq!(try_peek_var_int(&[0x05, 0xff]).unwrap(), Some((5, 1)));
        assert_eq!(try_peek_var_int(&[0xac, 0x02]).unwrap(), Some((300, 2)));
    }
}
