//! Tagged binary payload codec
//!
//! `[u8 version][u32 count]` followed by `count` entries of
//! `[u16 key len][key][u8 tag][body]`. All integers are big-endian; array
//! element bytes follow the byte order declared in the frame header.

use std::collections::HashSet;

use bytes::{Buf, BufMut};

use super::{ByteOrder, DType, NdArray, PayloadMap, Value, WireError, RESERVED_CREDENTIALS_KEY};
use crate::types::Credentials;

pub const PAYLOAD_VERSION: u8 = 1;

const TAG_STR: u8 = 0x01;
const TAG_F64: u8 = 0x02;
const TAG_I64: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_CREDENTIALS: u8 = 0x7F;

// ─────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────

/// Serialize credentials plus variables into a payload blob.
///
/// Array elements are written little-endian, matching the `byteorder`
/// that [`encode_frame`](super::encode_frame) puts in the header.
pub fn encode_payload(credentials: &Credentials, payload: &PayloadMap) -> Result<Vec<u8>, WireError> {
    if payload.contains_key(RESERVED_CREDENTIALS_KEY) {
        return Err(WireError::ReservedKey(RESERVED_CREDENTIALS_KEY.to_string()));
    }

    let count = u32::try_from(payload.len() + 1).map_err(|_| WireError::TooLong {
        what: "entry count",
        len: payload.len(),
    })?;

    let mut out = Vec::with_capacity(64);
    out.put_u8(PAYLOAD_VERSION);
    out.put_u32(count);

    put_key(&mut out, RESERVED_CREDENTIALS_KEY)?;
    out.put_u8(TAG_CREDENTIALS);
    put_str(&mut out, &credentials.name)?;
    put_str(&mut out, &credentials.role)?;

    for (key, value) in payload {
        put_key(&mut out, key)?;
        put_value(&mut out, value)?;
    }

    Ok(out)
}

fn put_key(out: &mut Vec<u8>, key: &str) -> Result<(), WireError> {
    let len = u16::try_from(key.len()).map_err(|_| WireError::TooLong {
        what: "variable name",
        len: key.len(),
    })?;
    out.put_u16(len);
    out.put_slice(key.as_bytes());
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    put_blob(out, s.as_bytes(), "string")
}

fn put_blob(out: &mut Vec<u8>, data: &[u8], what: &'static str) -> Result<(), WireError> {
    let len = u32::try_from(data.len()).map_err(|_| WireError::TooLong {
        what,
        len: data.len(),
    })?;
    out.put_u32(len);
    out.put_slice(data);
    Ok(())
}

fn put_value(out: &mut Vec<u8>, value: &Value) -> Result<(), WireError> {
    match value {
        Value::Str(s) => {
            out.put_u8(TAG_STR);
            put_str(out, s)?;
        }
        Value::Float(v) => {
            out.put_u8(TAG_F64);
            out.put_u64(v.to_bits());
        }
        Value::Int(v) => {
            out.put_u8(TAG_I64);
            out.put_i64(*v);
        }
        Value::Bool(v) => {
            out.put_u8(TAG_BOOL);
            out.put_u8(u8::from(*v));
        }
        Value::Bytes(b) => {
            out.put_u8(TAG_BYTES);
            put_blob(out, b, "byte string")?;
        }
        Value::Array(a) => {
            let ndim = u8::try_from(a.shape().len()).map_err(|_| WireError::TooLong {
                what: "array rank",
                len: a.shape().len(),
            })?;
            out.put_u8(TAG_ARRAY);
            out.put_u8(a.dtype() as u8);
            out.put_u8(ndim);
            for &dim in a.shape() {
                out.put_u64(dim as u64);
            }
            out.put_u64(a.raw_bytes().len() as u64);
            out.put_slice(a.raw_bytes());
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────

/// Parse a payload blob back into the sender's credentials and variables.
///
/// `order` is the byte order declared by the frame header; big-endian array
/// elements are swapped into the in-memory little-endian layout.
pub fn decode_payload(
    mut buf: &[u8],
    order: ByteOrder,
) -> Result<(Credentials, PayloadMap), WireError> {
    let version = get_u8(&mut buf, "version")?;
    if version != PAYLOAD_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let count = get_u32(&mut buf, "entry count")?;

    let mut seen = HashSet::new();
    let mut credentials = None;
    let mut payload = PayloadMap::new();

    for _ in 0..count {
        let key_len = get_u16(&mut buf, "key length")? as usize;
        let key = get_string(&mut buf, key_len, "variable name")?;
        if !seen.insert(key.clone()) {
            return Err(WireError::DuplicateKey(key));
        }

        let tag = get_u8(&mut buf, "value tag")?;
        if key == RESERVED_CREDENTIALS_KEY {
            if tag != TAG_CREDENTIALS {
                return Err(WireError::ReservedKey(key));
            }
            let name_len = get_u32(&mut buf, "credentials")? as usize;
            let name = get_string(&mut buf, name_len, "credentials")?;
            let role_len = get_u32(&mut buf, "credentials")? as usize;
            let role = get_string(&mut buf, role_len, "credentials")?;
            credentials = Some(Credentials::new(name, role));
            continue;
        }

        let value = get_value(&mut buf, tag, order)?;
        payload.insert(key, value);
    }

    if buf.has_remaining() {
        return Err(WireError::TrailingBytes(buf.remaining()));
    }

    let credentials = credentials.ok_or(WireError::MissingCredentials)?;
    Ok((credentials, payload))
}

fn get_value(buf: &mut &[u8], tag: u8, order: ByteOrder) -> Result<Value, WireError> {
    match tag {
        TAG_STR => {
            let len = get_u32(buf, "string length")? as usize;
            Ok(Value::Str(get_string(buf, len, "string value")?))
        }
        TAG_F64 => {
            ensure(buf, 8, "f64 value")?;
            Ok(Value::Float(f64::from_bits(buf.get_u64())))
        }
        TAG_I64 => {
            ensure(buf, 8, "i64 value")?;
            Ok(Value::Int(buf.get_i64()))
        }
        TAG_BOOL => Ok(Value::Bool(get_u8(buf, "bool value")? != 0)),
        TAG_BYTES => {
            let len = get_u32(buf, "bytes length")? as usize;
            Ok(Value::Bytes(get_bytes(buf, len, "bytes value")?))
        }
        TAG_ARRAY => {
            let dtype = DType::from_tag(get_u8(buf, "array dtype")?)?;
            let ndim = get_u8(buf, "array rank")? as usize;
            let mut shape = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                ensure(buf, 8, "array shape")?;
                let dim = usize::try_from(buf.get_u64()).map_err(|_| WireError::TooLong {
                    what: "array dimension",
                    len: usize::MAX,
                })?;
                shape.push(dim);
            }
            ensure(buf, 8, "array length")?;
            let len = usize::try_from(buf.get_u64()).map_err(|_| WireError::TooLong {
                what: "array data",
                len: usize::MAX,
            })?;
            let data = get_bytes(buf, len, "array data")?;
            let mut array = NdArray::from_raw(dtype, shape, data)?;
            if order == ByteOrder::Big {
                array.swap_byte_order();
            }
            Ok(Value::Array(array))
        }
        other => Err(WireError::UnknownTag(other)),
    }
}

fn ensure(buf: &&[u8], n: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated(what))
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, WireError> {
    ensure(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], what: &'static str) -> Result<u16, WireError> {
    ensure(buf, 2, what)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, WireError> {
    ensure(buf, 4, what)?;
    Ok(buf.get_u32())
}

fn get_bytes(buf: &mut &[u8], len: usize, what: &'static str) -> Result<Vec<u8>, WireError> {
    ensure(buf, len, what)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn get_string(buf: &mut &[u8], len: usize, what: &'static str) -> Result<String, WireError> {
    String::from_utf8(get_bytes(buf, len, what)?).map_err(|_| WireError::InvalidUtf8(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("c1", "client")
    }

    fn sample() -> PayloadMap {
        let mut p = PayloadMap::new();
        p.insert("name".into(), Value::from("résumé"));
        p.insert("pi".into(), Value::Float(std::f64::consts::PI));
        p.insert("nan".into(), Value::Float(f64::from_bits(0x7ff8_dead_beef_0001)));
        p.insert("count".into(), Value::Int(-42));
        p.insert("ready".into(), Value::Bool(true));
        p.insert("blob".into(), Value::Bytes(vec![0, 1, 2, 255]));
        p.insert(
            "m".into(),
            Value::Array(NdArray::from_f64(vec![3, 3], &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]).unwrap()),
        );
        p.insert(
            "img".into(),
            Value::Array(NdArray::from_u8(vec![2, 2, 3], &[7u8; 12]).unwrap()),
        );
        p.insert("scalar".into(), Value::Array(NdArray::from_i32(vec![], &[9]).unwrap()));
        p.insert("empty".into(), Value::Array(NdArray::from_f32(vec![0], &[]).unwrap()));
        p
    }

    #[test]
    fn test_roundtrip_preserves_every_value() {
        let payload = sample();
        let bytes = encode_payload(&creds(), &payload).unwrap();
        let (c, decoded) = decode_payload(&bytes, ByteOrder::Little).unwrap();

        assert_eq!(c, creds());
        assert_eq!(decoded, payload);
        let nan = decoded["nan"].as_f64().unwrap();
        assert_eq!(nan.to_bits(), 0x7ff8_dead_beef_0001);
    }

    #[test]
    fn test_empty_payload_still_carries_credentials() {
        let bytes = encode_payload(&creds(), &PayloadMap::new()).unwrap();
        let (c, decoded) = decode_payload(&bytes, ByteOrder::Little).unwrap();
        assert_eq!(c, creds());
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_reserved_key_rejected_on_encode() {
        let mut p = PayloadMap::new();
        p.insert(RESERVED_CREDENTIALS_KEY.into(), Value::Int(1));
        assert!(matches!(
            encode_payload(&creds(), &p),
            Err(WireError::ReservedKey(_))
        ));
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        let bytes = encode_payload(&creds(), &sample()).unwrap();
        for cut in 0..bytes.len() {
            let err = decode_payload(&bytes[..cut], ByteOrder::Little).unwrap_err();
            assert!(
                matches!(err, WireError::Truncated(_) | WireError::MissingCredentials),
                "cut at {} gave {:?}",
                cut,
                err
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_payload(&creds(), &sample()).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_payload(&bytes, ByteOrder::Little),
            Err(WireError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut p = PayloadMap::new();
        p.insert("x".into(), Value::Bool(false));
        let mut bytes = encode_payload(&creds(), &p).unwrap();
        // the bool entry is last: [u16 1]["x"][tag][u8]
        let tag_pos = bytes.len() - 2;
        bytes[tag_pos] = 0x42;
        assert!(matches!(
            decode_payload(&bytes, ByteOrder::Little),
            Err(WireError::UnknownTag(0x42))
        ));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut bytes = Vec::new();
        bytes.put_u8(PAYLOAD_VERSION);
        bytes.put_u32(3);
        for _ in 0..2 {
            bytes.put_u16(1);
            bytes.put_slice(b"a");
            bytes.put_u8(TAG_BOOL);
            bytes.put_u8(1);
        }
        assert!(matches!(
            decode_payload(&bytes, ByteOrder::Little),
            Err(WireError::DuplicateKey(k)) if k == "a"
        ));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut bytes = Vec::new();
        bytes.put_u8(PAYLOAD_VERSION);
        bytes.put_u32(1);
        bytes.put_u16(1);
        bytes.put_slice(b"a");
        bytes.put_u8(TAG_I64);
        bytes.put_i64(5);
        assert!(matches!(
            decode_payload(&bytes, ByteOrder::Little),
            Err(WireError::MissingCredentials)
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = Vec::new();
        bytes.put_u8(PAYLOAD_VERSION);
        bytes.put_u32(1);
        bytes.put_u16(2);
        bytes.put_slice(&[0xff, 0xfe]);
        assert!(matches!(
            decode_payload(&bytes, ByteOrder::Little),
            Err(WireError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_array_length_mismatch_rejected() {
        let mut bytes = encode_payload(&creds(), &PayloadMap::new()).unwrap();
        // bump the entry count and append a 2x2 f64 array with 3 elements
        bytes[1..5].copy_from_slice(&2u32.to_be_bytes());
        bytes.put_u16(1);
        bytes.put_slice(b"m");
        bytes.put_u8(TAG_ARRAY);
        bytes.put_u8(DType::F64 as u8);
        bytes.put_u8(2);
        bytes.put_u64(2);
        bytes.put_u64(2);
        bytes.put_u64(24);
        bytes.put_slice(&[0u8; 24]);
        assert!(matches!(
            decode_payload(&bytes, ByteOrder::Little),
            Err(WireError::ArrayLength { expected: 32, actual: 24, .. })
        ));
    }

    #[test]
    fn test_big_endian_arrays_are_swapped() {
        let mut bytes = encode_payload(&creds(), &PayloadMap::new()).unwrap();
        bytes[1..5].copy_from_slice(&2u32.to_be_bytes());
        bytes.put_u16(1);
        bytes.put_slice(b"v");
        bytes.put_u8(TAG_ARRAY);
        bytes.put_u8(DType::I32 as u8);
        bytes.put_u8(1);
        bytes.put_u64(2);
        bytes.put_u64(8);
        bytes.put_i32(1);
        bytes.put_i32(-2);

        let (_, decoded) = decode_payload(&bytes, ByteOrder::Big).unwrap();
        let v = decoded["v"].as_array().unwrap();
        assert_eq!(v.to_f64_vec(), vec![1.0, -2.0]);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = encode_payload(&creds(), &PayloadMap::new()).unwrap();
        bytes[0] = 9;
        assert!(matches!(
            decode_payload(&bytes, ByteOrder::Little),
            Err(WireError::UnsupportedVersion(9))
        ));
    }
}
