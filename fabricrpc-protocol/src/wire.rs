//! Minimal protobuf wire-format helpers.
//!
//! Just enough of the encoding to read and write the two RPC header
//! messages without pulling in a schema compiler.

/// Wire type for varint (int32, int64, uint32, uint64, bool, enum).
pub const WIRE_TYPE_VARINT: u8 = 0;
/// Wire type for 64-bit fixed values.
pub const WIRE_TYPE_FIXED64: u8 = 1;
/// Wire type for length-delimited (string, bytes, embedded messages).
pub const WIRE_TYPE_LEN: u8 = 2;
/// Wire type for 32-bit fixed values.
pub const WIRE_TYPE_FIXED32: u8 = 5;

pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint, advancing `buf`. Returns `None` on truncation or overflow.
pub fn decode_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        let (&byte, rest) = buf.split_first()?;
        *buf = rest;

        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

pub fn encode_tag(field_number: u32, wire_type: u8, buf: &mut Vec<u8>) {
    encode_varint(((field_number as u64) << 3) | (wire_type as u64), buf);
}

/// Decodes a field tag, returning (field_number, wire_type).
pub fn decode_tag(buf: &mut &[u8]) -> Option<(u32, u8)> {
    let tag = decode_varint(buf)?;
    let field_number = (tag >> 3) as u32;
    let wire_type = (tag & 0x07) as u8;
    Some((field_number, wire_type))
}

pub fn encode_string(field_number: u32, s: &str, buf: &mut Vec<u8>) {
    encode_tag(field_number, WIRE_TYPE_LEN, buf);
    encode_varint(s.len() as u64, buf);
    buf.extend_from_slice(s.as_bytes());
}

/// Encodes an int32 field. Negative values are sign-extended to ten bytes.
pub fn encode_int32(field_number: u32, value: i32, buf: &mut Vec<u8>) {
    encode_tag(field_number, WIRE_TYPE_VARINT, buf);
    encode_varint(value as i64 as u64, buf);
}

/// Reads an int32 field value back from its varint. Fails if the value does
/// not fit in 32 bits once sign-extension is undone.
pub fn decode_int32(buf: &mut &[u8]) -> Option<Result<i32, u64>> {
    let raw = decode_varint(buf)?;
    Some(i32::try_from(raw as i64).map_err(|_| raw))
}

pub fn decode_length_delimited<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = usize::try_from(decode_varint(buf)?).ok()?;
    if buf.len() < len {
        return None;
    }
    let (data, rest) = buf.split_at(len);
    *buf = rest;
    Some(data)
}

/// Skips a field of the given wire type.
pub fn skip_field(wire_type: u8, buf: &mut &[u8]) -> Option<()> {
    let width = match wire_type {
        WIRE_TYPE_VARINT => {
            decode_varint(buf)?;
            return Some(());
        }
        WIRE_TYPE_LEN => {
            decode_length_delimited(buf)?;
            return Some(());
        }
        WIRE_TYPE_FIXED64 => 8,
        WIRE_TYPE_FIXED32 => 4,
        _ => return None,
    };
    if buf.len() < width {
        return None;
    }
    *buf = &buf[width..];
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_single_byte() {
        let mut buf = Vec::new();
        encode_varint(1, &mut buf);
        assert_eq!(buf, vec![0x01]);
    }

    #[test]
    fn test_varint_multi_byte() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, vec![0xAC, 0x02]);

        let mut slice = buf.as_slice();
        assert_eq!(decode_varint(&mut slice), Some(300));
        assert!(slice.is_empty());
    }

    #[test]
    fn test_varint_truncated() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert_eq!(decode_varint(&mut slice), None);
    }

    #[test]
    fn test_negative_int32_uses_ten_bytes() {
        let mut buf = Vec::new();
        encode_int32(1, -1, &mut buf);
        // One tag byte plus ten varint bytes.
        assert_eq!(buf.len(), 11);

        let mut slice = &buf[1..];
        assert_eq!(decode_int32(&mut slice), Some(Ok(-1)));
    }

    #[test]
    fn test_int32_out_of_range() {
        let mut buf = Vec::new();
        encode_varint((1u64 << 32) + 5, &mut buf);
        let mut slice = buf.as_slice();
        assert_eq!(decode_int32(&mut slice), Some(Err((1u64 << 32) + 5)));

        let mut truncated: &[u8] = &[0x80];
        assert_eq!(decode_int32(&mut truncated), None);
    }

    #[test]
    fn test_tag() {
        let mut buf = Vec::new();
        encode_tag(2, WIRE_TYPE_LEN, &mut buf);
        assert_eq!(buf, vec![0x12]);
        let mut slice = buf.as_slice();
        assert_eq!(decode_tag(&mut slice), Some((2, WIRE_TYPE_LEN)));
    }

    #[test]
    fn test_length_delimited_truncated() {
        let mut slice: &[u8] = &[0x05, b'a', b'b'];
        assert_eq!(decode_length_delimited(&mut slice), None);
    }

    #[test]
    fn test_skip_field() {
        let mut buf = Vec::new();
        encode_string(7, "ignored", &mut buf);
        encode_int32(8, 42, &mut buf);

        let mut slice = buf.as_slice();
        let (_, wire_type) = decode_tag(&mut slice).unwrap();
        skip_field(wire_type, &mut slice).unwrap();
        let (field, wire_type) = decode_tag(&mut slice).unwrap();
        assert_eq!((field, wire_type), (8, WIRE_TYPE_VARINT));
        skip_field(wire_type, &mut slice).unwrap();
        assert!(slice.is_empty());

        let mut slice: &[u8] = &[0x00];
        assert_eq!(skip_field(3, &mut slice), None);
    }
}
