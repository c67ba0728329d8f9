//! Record serialisation primitives.
//!
//! All integers are big-endian. A buffer is an `i32` length followed by that
//! many bytes (a negative length decodes as empty); a string is the same with
//! UTF-8 contents.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Error decoding a record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    /// Input ended before the field was complete.
    Truncated,
    /// A buffer or string length field was out of range.
    BadLength(i32),
    /// String contents were not valid UTF-8.
    Utf8,
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Truncated => write!(f, "record truncated"),
            ArchiveError::BadLength(len) => write!(f, "bad field length {len}"),
            ArchiveError::Utf8 => write!(f, "string field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ArchiveError {}

pub fn read_i32(buf: &mut Bytes) -> Result<i32, ArchiveError> {
    if buf.remaining() < 4 {
        return Err(ArchiveError::Truncated);
    }
    Ok(buf.get_i32())
}

pub fn read_i64(buf: &mut Bytes) -> Result<i64, ArchiveError> {
    if buf.remaining() < 8 {
        return Err(ArchiveError::Truncated);
    }
    Ok(buf.get_i64())
}

/// Read a length-prefixed byte buffer. Negative lengths decode as empty.
pub fn read_buffer(buf: &mut Bytes) -> Result<Vec<u8>, ArchiveError> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Ok(Vec::new());
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(ArchiveError::Truncated);
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

/// Read a length-prefixed UTF-8 string.
pub fn read_string(buf: &mut Bytes) -> Result<String, ArchiveError> {
    let raw = read_buffer(buf)?;
    String::from_utf8(raw).map_err(|_| ArchiveError::Utf8)
}

pub fn write_i32(buf: &mut BytesMut, v: i32) {
    buf.put_i32(v);
}

pub fn write_i64(buf: &mut BytesMut, v: i64) {
    buf.put_i64(v);
}

pub fn write_buffer(buf: &mut BytesMut, v: &[u8]) {
    buf.put_i32(v.len() as i32);
    buf.put_slice(v);
}

pub fn write_string(buf: &mut BytesMut, v: &str) {
    write_buffer(buf, v.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_round_trip() {
        let mut buf = BytesMut::new();
        write_i32(&mut buf, -7);
        write_i64(&mut buf, 0x1122_3344_5566_7788);
        let mut bytes = buf.freeze();
        assert_eq!(read_i32(&mut bytes).unwrap(), -7);
        assert_eq!(read_i64(&mut bytes).unwrap(), 0x1122_3344_5566_7788);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = BytesMut::new();
        write_i32(&mut buf, 1);
        assert_eq!(&buf[..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_buffer_round_trip() {
        let mut buf = BytesMut::new();
        write_buffer(&mut buf, b"passwd");
        let mut bytes = buf.freeze();
        assert_eq!(read_buffer(&mut bytes).unwrap(), b"passwd");
    }

    #[test]
    fn test_negative_buffer_length_is_empty() {
        let mut buf = BytesMut::new();
        write_i32(&mut buf, -1);
        let mut bytes = buf.freeze();
        assert_eq!(read_buffer(&mut bytes).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "digest");
        let mut bytes = buf.freeze();
        assert_eq!(read_string(&mut bytes).unwrap(), "digest");
    }

    #[test]
    fn test_truncated_fields() {
        let mut bytes = Bytes::from_static(&[0, 0]);
        assert_eq!(read_i32(&mut bytes), Err(ArchiveError::Truncated));

        let mut bytes = Bytes::from_static(&[0, 0, 0, 9, b'x']);
        assert_eq!(read_buffer(&mut bytes), Err(ArchiveError::Truncated));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = BytesMut::new();
        write_buffer(&mut buf, &[0xff, 0xfe]);
        let mut bytes = buf.freeze();
        assert_eq!(read_string(&mut bytes), Err(ArchiveError::Utf8));
    }
}
