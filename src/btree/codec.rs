// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Node wire codecs.
//!
//! A [`NodeCodec`] encodes/decodes the key list, value list (leaves), or
//! child-key list (internal nodes) carried by one node. Each encoded list is
//! self-delimiting (it carries its own item count), so a node's keys and
//! values can simply be read back to back without any external length
//! bookkeeping.
//!
//! Two codecs ship: [`BytesCodec`] (`"SS"`, matching the on-disk shape of
//! `examples/original_source/utils.py`'s `BytesList`: a 4-byte count, then
//! one signed 32-bit size per item, then the concatenated payloads) and
//! [`TypedCodec`] (`"PP"`, replacing the original's pickle-based variant
//! with `bincode`: the whole list serialized as one blob, framed with an
//! explicit 4-byte length).
//!
//! Child *descriptors* (internal-node routing pointers) are never run
//! through a codec; they are always eight raw bytes per entry, independent
//! of which codec stores the node's keys.

use crate::error::{Error, Result};

/// Encodes/decodes a node's key or value list.
pub trait NodeCodec {
    /// Two-byte tag persisted in the B+Tree header, identifying which codec
    /// wrote a given tree's nodes.
    const TAG: [u8; 2];

    /// Encodes `items`, self-delimited so [`NodeCodec::decode_items`] can
    /// recover both the items and how many bytes they occupied.
    fn encode_items(items: &[Vec<u8>]) -> Vec<u8>;

    /// Decodes a list previously written by [`NodeCodec::encode_items`] from
    /// the front of `data`, returning the items and the number of bytes
    /// consumed.
    fn decode_items(data: &[u8]) -> Result<(Vec<Vec<u8>>, usize)>;
}

/// A 4-byte item count, then one signed 32-bit size per item (`-1` would
/// mean absent, though node lists never contain absent entries), then the
/// concatenated payloads.
pub struct BytesCodec;

impl NodeCodec for BytesCodec {
    const TAG: [u8; 2] = *b"SS";

    fn encode_items(items: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(items.len() as u32).to_be_bytes());
        for item in items {
            out.extend_from_slice(&(item.len() as i32).to_be_bytes());
        }
        for item in items {
            out.extend_from_slice(item);
        }
        out
    }

    fn decode_items(data: &[u8]) -> Result<(Vec<Vec<u8>>, usize)> {
        if data.len() < 4 {
            return Err(Error::corrupt("node item list: truncated count"));
        }
        let count = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;

        let sizes_start = 4;
        let sizes_end = sizes_start + count * 4;
        if data.len() < sizes_end {
            return Err(Error::corrupt("node item list: truncated size table"));
        }

        let mut sizes = Vec::with_capacity(count);
        for i in 0..count {
            let start = sizes_start + i * 4;
            let size = i32::from_be_bytes(data[start..start + 4].try_into().unwrap());
            if size < 0 {
                return Err(Error::corrupt("node item list: unexpected absent entry"));
            }
            sizes.push(size as usize);
        }

        let mut items = Vec::with_capacity(count);
        let mut cursor = sizes_end;
        for size in sizes {
            let end = cursor + size;
            if data.len() < end {
                return Err(Error::corrupt("node item list: truncated payload"));
            }
            items.push(data[cursor..end].to_vec());
            cursor = end;
        }

        Ok((items, cursor))
    }
}

/// A single `bincode`-encoded `Vec<Vec<u8>>`, framed with an explicit 4-byte
/// length prefix so callers can tell how much of the buffer it consumed.
///
/// Stands in for the original's pickle-based typed codec: a full
/// self-describing serialization rather than a flat run of opaque byte
/// strings.
pub struct TypedCodec;

impl NodeCodec for TypedCodec {
    const TAG: [u8; 2] = *b"PP";

    fn encode_items(items: &[Vec<u8>]) -> Vec<u8> {
        let body = bincode::serialize(items).expect("Vec<Vec<u8>> is always serializable");
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn decode_items(data: &[u8]) -> Result<(Vec<Vec<u8>>, usize)> {
        if data.len() < 4 {
            return Err(Error::corrupt("typed node list: truncated length"));
        }
        let len = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
        if data.len() < 4 + len {
            return Err(Error::corrupt("typed node list: truncated payload"));
        }
        let items: Vec<Vec<u8>> = bincode::deserialize(&data[4..4 + len])
            .map_err(|e| Error::corrupt(format!("typed node list: {e}")))?;
        Ok((items, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_codec_roundtrips() {
        let items = vec![b"one".to_vec(), b"".to_vec(), b"three".to_vec()];
        let buf = BytesCodec::encode_items(&items);
        let (decoded, consumed) = BytesCodec::decode_items(&buf).unwrap();
        assert_eq!(decoded, items);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn bytes_codec_allows_trailing_bytes_after_the_list() {
        let items = vec![b"a".to_vec(), b"bb".to_vec()];
        let mut buf = BytesCodec::encode_items(&items);
        buf.extend_from_slice(b"trailing");
        let (decoded, consumed) = BytesCodec::decode_items(&buf).unwrap();
        assert_eq!(decoded, items);
        assert!(consumed < buf.len());
    }

    #[test]
    fn typed_codec_roundtrips() {
        let items = vec![b"alpha".to_vec(), b"beta".to_vec()];
        let buf = TypedCodec::encode_items(&items);
        let (decoded, consumed) = TypedCodec::decode_items(&buf).unwrap();
        assert_eq!(decoded, items);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn bytes_codec_rejects_truncated_payload() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&10i32.to_be_bytes());
        buf.extend_from_slice(b"short");
        assert!(BytesCodec::decode_items(&buf).is_err());
    }
}
