//! Length-prefixed string and small integer helpers shared by the headers.

use bytes::{Buf, BufMut, Bytes};

use crate::WireError;

/// Upper bound for a single string field
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Write a string as a 7-bit encoded length followed by UTF-8 bytes
pub fn put_string<B: BufMut>(buf: &mut B, value: &str) {
    let mut len = value.len() as u64;
    while len >= 0x80 {
        buf.put_u8((len as u8) | 0x80);
        len >>= 7;
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
}

/// Read a string written by [`put_string`]
pub fn get_string(buf: &mut Bytes) -> Result<String, WireError> {
    let mut len: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(WireError::Incomplete);
        }
        let byte = buf.get_u8();
        len |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return Err(WireError::String);
        }
    }

    let len = len as usize;
    if len > MAX_STRING_LEN {
        return Err(WireError::String);
    }
    if buf.remaining() < len {
        return Err(WireError::Incomplete);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::String)
}

/// Encoded size of a string field
pub fn string_len(value: &str) -> usize {
    let mut len = value.len();
    let mut prefix = 1;
    while len >= 0x80 {
        prefix += 1;
        len >>= 7;
    }
    prefix + value.len()
}

/// Read a strict boolean byte
pub fn get_flag(buf: &mut Bytes) -> Result<bool, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Incomplete);
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::Flag(other)),
    }
}

pub(crate) fn need(buf: &Bytes, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Incomplete)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_string_roundtrip_long_prefix() {
        let value = "x".repeat(300);
        let mut buf = BytesMut::new();
        put_string(&mut buf, &value);
        assert_eq!(buf.len(), string_len(&value));
        assert_eq!(buf[0], 0xAC);
        assert_eq!(buf[1], 0x02);

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), value);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_truncated_string() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello");
        let mut bytes = buf.freeze().slice(..3);
        assert_eq!(get_string(&mut bytes), Err(WireError::Incomplete));
    }

    #[test]
    fn test_flag_domain() {
        let mut bytes = Bytes::from_static(&[0, 1, 2]);
        assert!(!get_flag(&mut bytes).unwrap());
        assert!(get_flag(&mut bytes).unwrap());
        assert_eq!(get_flag(&mut bytes), Err(WireError::Flag(2)));
    }
}
