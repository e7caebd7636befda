//! The canonical list codec (RLP) used for node hashing and proof
//! serialization.
//!
//! The encoder side works on [`Item`]s, a recursive structure of byte
//! strings and lists with one extra shape: [`Item::Encoded`], an
//! already-encoded sub-item spliced into its parent verbatim. The splice is
//! what makes the embedded-node rule possible — a small child node is placed
//! raw inside its parent's list instead of being referenced by hash.
//!
//! The decoder is strict: it rejects non-minimal length encodings,
//! truncated input, trailing bytes and over-long length-of-length fields.
//! Anything the decoder accepts re-encodes to the exact same bytes.

use enum_as_inner::EnumAsInner;
use ethereum_types::{H256, U256};
use thiserror::Error;

/// Single byte strings below this value are their own encoding.
const SINGLE_BYTE_MAX: u8 = 0x7f;

/// Offset of the short-string length prefix (`0x80 + len`).
const STRING_OFFSET: u8 = 0x80;

/// Offset of the short-list length prefix (`0xc0 + len`).
const LIST_OFFSET: u8 = 0xc0;

/// Longest payload representable with a short (single byte) prefix.
const SHORT_LEN_MAX: usize = 55;

/// An item to be encoded.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Item {
    /// A plain byte string.
    String(Vec<u8>),

    /// An ordered list of sub-items.
    List(Vec<Item>),

    /// An already-encoded item, spliced into the output verbatim.
    Encoded(Vec<u8>),
}

impl Item {
    /// The empty byte string (encodes to `0x80`).
    pub const fn empty_string() -> Self {
        Item::String(Vec::new())
    }

    /// A 32 byte hash as a byte string.
    pub fn hash(h: &H256) -> Self {
        Item::String(h.as_bytes().to_vec())
    }

    /// An unsigned integer as a minimum-length big-endian byte string.
    ///
    /// Zero encodes as the empty string, per the canonical integer rule.
    pub fn uint(v: u64) -> Self {
        let bytes = v.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        Item::String(bytes[skip..].to_vec())
    }

    /// A 256-bit unsigned integer as a minimum-length big-endian byte
    /// string.
    pub fn u256(v: &U256) -> Self {
        let mut bytes = [0u8; 32];
        v.to_big_endian(&mut bytes);
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        Item::String(bytes[skip..].to_vec())
    }
}

/// Encodes a single item into a fresh buffer.
pub fn encode(item: &Item) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    append_item(&mut out, item);
    out
}

fn append_item(out: &mut Vec<u8>, item: &Item) {
    match item {
        Item::String(s) => append_string(out, s),
        Item::List(items) => {
            // Encode the payload first; its length determines the prefix.
            let mut payload = Vec::with_capacity(64);
            for sub in items {
                append_item(&mut payload, sub);
            }
            append_length(out, payload.len(), LIST_OFFSET);
            out.extend_from_slice(&payload);
        }
        Item::Encoded(raw) => out.extend_from_slice(raw),
    }
}

fn append_string(out: &mut Vec<u8>, s: &[u8]) {
    if s.len() == 1 && s[0] <= SINGLE_BYTE_MAX {
        out.push(s[0]);
        return;
    }
    append_length(out, s.len(), STRING_OFFSET);
    out.extend_from_slice(s);
}

fn append_length(out: &mut Vec<u8>, len: usize, offset: u8) {
    if len <= SHORT_LEN_MAX {
        out.push(offset + len as u8);
        return;
    }

    let be = (len as u64).to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    out.push(offset + SHORT_LEN_MAX as u8 + (be.len() - skip) as u8);
    out.extend_from_slice(&be[skip..]);
}

/// A fully decoded item. Unlike [`Item`] there is no raw variant; spliced
/// sub-encodings come back as the lists or strings they are.
#[derive(Clone, Debug, EnumAsInner, Eq, Hash, PartialEq)]
pub enum Decoded {
    /// A plain byte string.
    String(Vec<u8>),

    /// An ordered list of sub-items.
    List(Vec<Decoded>),
}

impl Decoded {
    /// Re-encodes the item. Since the decoder only accepts canonical input,
    /// `encode_decoded(decode(data)?) == data` for all `data`.
    pub fn to_item(&self) -> Item {
        match self {
            Decoded::String(s) => Item::String(s.clone()),
            Decoded::List(items) => Item::List(items.iter().map(Decoded::to_item).collect()),
        }
    }
}

/// Re-encodes a decoded item into its canonical byte form.
pub fn encode_decoded(decoded: &Decoded) -> Vec<u8> {
    encode(&decoded.to_item())
}

/// An error produced by the strict decoder. Every variant means the input
/// is not the canonical encoding of any item.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, PartialEq)]
pub enum DecodeError {
    /// The input ended before the announced length was reached.
    #[error("input ended before the announced length was reached")]
    UnexpectedEnd,

    /// A complete item was decoded but bytes remained.
    #[error("trailing bytes after a complete item")]
    TrailingBytes,

    /// A length was encoded in more bytes than necessary, or a single-byte
    /// string was wrapped in a length prefix.
    #[error("length encoding is not minimal")]
    NonMinimalLength,

    /// A length-of-length field announced a payload beyond any possible
    /// input.
    #[error("announced length does not fit in the address space")]
    LengthOverflow,
}

/// Decodes a single item from `data`, rejecting non-canonical input and
/// trailing bytes.
pub fn decode(data: &[u8]) -> Result<Decoded, DecodeError> {
    let (item, rest) = decode_item(data)?;
    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(item)
}

fn decode_item(data: &[u8]) -> Result<(Decoded, &[u8]), DecodeError> {
    let (&prefix, rest) = data.split_first().ok_or(DecodeError::UnexpectedEnd)?;

    match prefix {
        0x00..=0x7f => Ok((Decoded::String(vec![prefix]), rest)),
        0x80..=0xb7 => {
            let len = (prefix - STRING_OFFSET) as usize;
            let (payload, rest) = take(rest, len)?;
            if payload.len() == 1 && payload[0] <= SINGLE_BYTE_MAX {
                // Should have been encoded as the byte itself.
                return Err(DecodeError::NonMinimalLength);
            }
            Ok((Decoded::String(payload.to_vec()), rest))
        }
        0xb8..=0xbf => {
            let (len, rest) = decode_long_length(rest, (prefix - 0xb7) as usize)?;
            let (payload, rest) = take(rest, len)?;
            Ok((Decoded::String(payload.to_vec()), rest))
        }
        0xc0..=0xf7 => {
            let len = (prefix - LIST_OFFSET) as usize;
            let (payload, rest) = take(rest, len)?;
            Ok((decode_list_payload(payload)?, rest))
        }
        0xf8..=0xff => {
            let (len, rest) = decode_long_length(rest, (prefix - 0xf7) as usize)?;
            let (payload, rest) = take(rest, len)?;
            Ok((decode_list_payload(payload)?, rest))
        }
    }
}

fn decode_long_length(data: &[u8], len_of_len: usize) -> Result<(usize, &[u8]), DecodeError> {
    let (len_bytes, rest) = take(data, len_of_len)?;
    if len_bytes[0] == 0 {
        return Err(DecodeError::NonMinimalLength);
    }
    if len_bytes.len() > std::mem::size_of::<usize>() {
        return Err(DecodeError::LengthOverflow);
    }

    let mut len = 0usize;
    for b in len_bytes {
        len = (len << 8) | *b as usize;
    }
    if len <= SHORT_LEN_MAX {
        // Would have fit in the short form.
        return Err(DecodeError::NonMinimalLength);
    }
    Ok((len, rest))
}

fn decode_list_payload(mut payload: &[u8]) -> Result<Decoded, DecodeError> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let (item, rest) = decode_item(payload)?;
        items.push(item);
        payload = rest;
    }
    Ok(Decoded::List(items))
}

fn take(data: &[u8], n: usize) -> Result<(&[u8], &[u8]), DecodeError> {
    if data.len() < n {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(data.split_at(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt(item: Item) {
        let encoded = encode(&item);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(encode_decoded(&decoded), encoded);
    }

    #[test]
    fn empty_string_encodes_to_0x80() {
        assert_eq!(encode(&Item::empty_string()), vec![0x80]);
    }

    #[test]
    fn empty_list_encodes_to_0xc0() {
        assert_eq!(encode(&Item::List(vec![])), vec![0xc0]);
    }

    #[test]
    fn single_low_byte_is_its_own_encoding() {
        assert_eq!(encode(&Item::String(vec![0x00])), vec![0x00]);
        assert_eq!(encode(&Item::String(vec![0x7f])), vec![0x7f]);
        assert_eq!(encode(&Item::String(vec![0x80])), vec![0x81, 0x80]);
    }

    #[test]
    fn known_vectors() {
        // "dog"
        assert_eq!(
            encode(&Item::String(b"dog".to_vec())),
            vec![0x83, b'd', b'o', b'g']
        );
        // ["cat", "dog"]
        assert_eq!(
            encode(&Item::List(vec![
                Item::String(b"cat".to_vec()),
                Item::String(b"dog".to_vec()),
            ])),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
    }

    #[test]
    fn long_string_boundary() {
        let s55 = Item::String(vec![7; 55]);
        let s56 = Item::String(vec![7; 56]);

        let e55 = encode(&s55);
        assert_eq!(e55[0], 0x80 + 55);
        assert_eq!(e55.len(), 56);

        let e56 = encode(&s56);
        assert_eq!(&e56[..2], &[0xb8, 56]);
        assert_eq!(e56.len(), 58);

        rt(s55);
        rt(s56);
    }

    #[test]
    fn long_list_boundary() {
        let items: Vec<_> = (0..60).map(|_| Item::String(vec![0x11])).collect();
        let encoded = encode(&Item::List(items));
        assert_eq!(&encoded[..2], &[0xf8, 60]);
        rt(decode(&encoded).map(|d| d.to_item()).unwrap());
    }

    #[test]
    fn uint_is_minimum_length_big_endian() {
        assert_eq!(encode(&Item::uint(0)), vec![0x80]);
        assert_eq!(encode(&Item::uint(15)), vec![0x0f]);
        assert_eq!(encode(&Item::uint(1024)), vec![0x82, 0x04, 0x00]);
        assert_eq!(
            encode(&Item::u256(&U256::from(1024))),
            vec![0x82, 0x04, 0x00]
        );
        assert_eq!(encode(&Item::u256(&U256::zero())), vec![0x80]);
    }

    #[test]
    fn encoded_item_is_spliced_verbatim() {
        let inner = encode(&Item::List(vec![Item::String(b"ab".to_vec())]));
        let outer = encode(&Item::List(vec![
            Item::Encoded(inner.clone()),
            Item::String(vec![]),
        ]));

        // The splice must appear untouched inside the payload.
        assert_eq!(&outer[1..1 + inner.len()], inner.as_slice());

        // And decoding sees through the splice to a nested list.
        let decoded = decode(&outer).unwrap();
        let items = decoded.as_list().unwrap();
        assert!(items[0].is_list());
    }

    #[test]
    fn nested_lists_round_trip() {
        rt(Item::List(vec![
            Item::List(vec![]),
            Item::List(vec![Item::List(vec![]), Item::String(vec![1, 2, 3])]),
            Item::String(vec![0xff; 40]),
        ]));
    }

    #[test]
    fn matches_rlp_crate_output() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x42],
            vec![0x80],
            (0u8..100).collect(),
        ];
        for bytes in cases {
            let ours = encode(&Item::String(bytes.clone()));
            let theirs = rlp::encode(&bytes);
            assert_eq!(ours, theirs.to_vec());
        }

        let list = vec![b"cat".to_vec(), b"dog".to_vec(), vec![0u8; 60]];
        let ours = encode(&Item::List(
            list.iter().map(|s| Item::String(s.clone())).collect(),
        ));
        let theirs = rlp::encode_list::<Vec<u8>, _>(&list);
        assert_eq!(ours, theirs.to_vec());
    }

    #[test]
    fn rejects_truncated_input() {
        assert_eq!(decode(&[]), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decode(&[0x83, b'd', b'o']), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decode(&[0xb8]), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decode(&[0xc2, 0x81]), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert_eq!(decode(&[0x80, 0x00]), Err(DecodeError::TrailingBytes));
        assert_eq!(decode(&[0xc0, 0xc0]), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn rejects_non_minimal_encodings() {
        // 0x05 wrapped in a length prefix.
        assert_eq!(decode(&[0x81, 0x05]), Err(DecodeError::NonMinimalLength));
        // Short length in long form.
        let mut short_in_long = vec![0xb8, 55];
        short_in_long.extend(vec![0u8; 55]);
        assert_eq!(decode(&short_in_long), Err(DecodeError::NonMinimalLength));
        // Leading zero in the length-of-length.
        let mut padded_len = vec![0xb9, 0x00, 56];
        padded_len.extend(vec![0u8; 56]);
        assert_eq!(decode(&padded_len), Err(DecodeError::NonMinimalLength));
    }

    #[test]
    fn rejects_non_minimal_nested_items() {
        // A list whose payload holds a non-minimal string.
        assert_eq!(
            decode(&[0xc2, 0x81, 0x05]),
            Err(DecodeError::NonMinimalLength)
        );
    }

    #[test]
    fn rejects_absurd_lengths() {
        let data = [0xbf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode(&data),
            Err(DecodeError::LengthOverflow | DecodeError::UnexpectedEnd)
        ));
    }
}
