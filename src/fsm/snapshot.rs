//! Snapshot stream codec
//!
//! A snapshot is a self-contained byte stream that fully reconstructs the
//! state machine:
//!
//! ```text
//! MAGIC(4) = "CETE"
//! VERSION(1) = 0x01
//! repeated records:
//!   TAG(1)            0x00 user-kv, 0x01 metadata, 0xFF end-of-stream
//!   KEY_LEN(varint)   KEY_BYTES
//!   VAL_LEN(varint)   VAL_BYTES
//! ```
//!
//! Records are grouped user-kv first, then metadata, each group in
//! ascending key order, terminated by the end-of-stream tag. Varints are
//! protobuf base-128. Readers reject unknown versions, unknown tags, and
//! any bytes after the end-of-stream tag.

use bytes::Buf;
use prost::encoding::{decode_varint, encode_varint};

use crate::errors::KvsError;
use crate::kv::store::Pairs;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"CETE";
pub const SNAPSHOT_VERSION: u8 = 0x01;

const TAG_USER: u8 = 0x00;
const TAG_META: u8 = 0x01;
const TAG_END: u8 = 0xFF;

/// Encode both namespaces into a snapshot stream. The caller supplies the
/// pairs in ascending key order (engine scans already are).
pub fn encode(user: &Pairs, meta: &Pairs) -> Vec<u8> {
    let mut out = Vec::with_capacity(stream_size_hint(user, meta));
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.push(SNAPSHOT_VERSION);
    for (key, value) in user {
        write_record(&mut out, TAG_USER, key, value);
    }
    for (key, value) in meta {
        write_record(&mut out, TAG_META, key, value);
    }
    out.push(TAG_END);
    out
}

/// Decode a snapshot stream into (user pairs, metadata pairs).
pub fn decode(data: &[u8]) -> Result<(Pairs, Pairs), KvsError> {
    let mut buf = data;
    if buf.remaining() < SNAPSHOT_MAGIC.len() + 1 {
        return Err(malformed("stream shorter than header"));
    }

    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != SNAPSHOT_MAGIC {
        return Err(malformed("bad magic"));
    }
    let version = buf.get_u8();
    if version != SNAPSHOT_VERSION {
        return Err(malformed(&format!("unsupported version {:#04x}", version)));
    }

    let mut user = Vec::new();
    let mut meta = Vec::new();
    let mut ended = false;

    while buf.has_remaining() {
        if ended {
            return Err(malformed("record after end-of-stream"));
        }
        let tag = buf.get_u8();
        if tag == TAG_END {
            ended = true;
            continue;
        }
        let key = read_chunk(&mut buf)?;
        let value = read_chunk(&mut buf)?;
        match tag {
            TAG_USER => user.push((key, value)),
            TAG_META => meta.push((key, value)),
            other => return Err(malformed(&format!("unknown record tag {:#04x}", other))),
        }
    }

    if !ended {
        return Err(malformed("missing end-of-stream tag"));
    }
    Ok((user, meta))
}

fn write_record(out: &mut Vec<u8>, tag: u8, key: &[u8], value: &[u8]) {
    out.push(tag);
    encode_varint(key.len() as u64, out);
    out.extend_from_slice(key);
    encode_varint(value.len() as u64, out);
    out.extend_from_slice(value);
}

fn read_chunk(buf: &mut &[u8]) -> Result<Vec<u8>, KvsError> {
    let len = decode_varint(buf).map_err(|e| malformed(&e.to_string()))? as usize;
    if buf.remaining() < len {
        return Err(malformed("record truncated"));
    }
    let mut chunk = vec![0u8; len];
    buf.copy_to_slice(&mut chunk);
    Ok(chunk)
}

fn stream_size_hint(user: &Pairs, meta: &Pairs) -> usize {
    let records: usize = user
        .iter()
        .chain(meta.iter())
        .map(|(k, v)| k.len() + v.len() + 11)
        .sum();
    records + 6
}

fn malformed(reason: &str) -> KvsError {
    KvsError::Serialization { reason: format!("snapshot stream: {}", reason) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Pairs, Pairs) {
        let user = vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), Vec::new()),
        ];
        let meta = vec![(b"n1".to_vec(), b"addr".to_vec())];
        (user, meta)
    }

    #[test]
    fn roundtrip() {
        let (user, meta) = sample();
        let stream = encode(&user, &meta);
        let (decoded_user, decoded_meta) = decode(&stream).unwrap();
        assert_eq!(decoded_user, user);
        assert_eq!(decoded_meta, meta);
    }

    #[test]
    fn header_layout_is_fixed() {
        let stream = encode(&Vec::new(), &Vec::new());
        assert_eq!(&stream[..4], b"CETE");
        assert_eq!(stream[4], 0x01);
        assert_eq!(stream[5], 0xFF);
        assert_eq!(stream.len(), 6);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut stream = encode(&Vec::new(), &Vec::new());
        stream[0] = b'X';
        assert!(decode(&stream).is_err());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut stream = encode(&Vec::new(), &Vec::new());
        stream[4] = 0x02;
        assert!(decode(&stream).is_err());
    }

    #[test]
    fn rejects_bytes_after_end_of_stream() {
        let mut stream = encode(&Vec::new(), &Vec::new());
        stream.push(TAG_USER);
        assert!(decode(&stream).is_err());
    }

    #[test]
    fn rejects_missing_end_of_stream() {
        let (user, meta) = sample();
        let mut stream = encode(&user, &meta);
        stream.pop();
        assert!(decode(&stream).is_err());
    }

    #[test]
    fn rejects_truncated_record() {
        let (user, meta) = sample();
        let stream = encode(&user, &meta);
        assert!(decode(&stream[..stream.len() - 3]).is_err());
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut stream = vec![];
        stream.extend_from_slice(b"CETE");
        stream.push(0x01);
        stream.push(0x07);
        stream.push(0x00);
        stream.push(0x00);
        stream.push(TAG_END);
        assert!(decode(&stream).is_err());
    }
}
