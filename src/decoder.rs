//! Strict decoding of canonical node encodings back into structural node
//! descriptions.
//!
//! Used by proof verification (and by an archive layer loading encoded
//! nodes). The decoder only reconstructs what the encoding actually
//! carries: leaves come back with the path suffix of their edge, not the
//! full key or address, and branch children are empty, a 32 byte hash, or
//! an embedded raw encoding.
//!
//! Everything the trie cannot emit is rejected: wrong list arities, child
//! hashes of odd sizes, branches with fewer than two children, a populated
//! 17th branch slot, values with leading zeros, non-minimal account
//! fields.

use bytes::Bytes;
use enum_as_inner::EnumAsInner;
use ethereum_types::{H256, U256};
use thiserror::Error;

use crate::nibbles::{CompactDecodeError, Path};
use crate::node::{AccountInfo, Value};
use crate::rlp::{self, Decoded, DecodeError};

/// One child slot of a decoded branch or extension.
#[derive(Clone, Debug, EnumAsInner, Eq, Hash, PartialEq)]
pub enum DecodedChild {
    /// No child.
    Empty,
    /// A child referenced by its 32 byte hash.
    Hash(H256),
    /// A child embedded verbatim; holds its raw canonical encoding.
    Embedded(Bytes),
}

/// A node decoded from its canonical encoding.
#[derive(Clone, Debug, EnumAsInner, Eq, PartialEq)]
pub enum DecodedNode {
    /// The empty node.
    Empty,
    /// A branch with 16 child slots.
    Branch {
        /// The child slots, one per nibble.
        children: Box<[DecodedChild; 16]>,
    },
    /// An extension with its path and successor.
    Extension {
        /// The shared nibble path.
        path: Path,
        /// The successor below the path.
        next: DecodedChild,
    },
    /// An account leaf.
    Account {
        /// The path suffix on the leaf edge.
        path: Path,
        /// Nonce, balance and code hash.
        info: AccountInfo,
        /// The root hash of the account's storage trie.
        storage_root: H256,
    },
    /// A storage value leaf.
    Value {
        /// The path suffix on the leaf edge.
        path: Path,
        /// The stored value, restored to its full 32 byte width.
        value: Value,
    },
}

/// An error rejecting a byte string that is not the canonical encoding of
/// any trie node.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum NodeDecodeError {
    /// The codec layer rejected the input.
    #[error("canonical codec rejected the encoding: {0}")]
    Codec(#[from] DecodeError),

    /// The compact path prefix was rejected.
    #[error("invalid compact path in node encoding: {0}")]
    CompactPath(#[from] CompactDecodeError),

    /// The item structure does not describe any node.
    #[error("malformed node encoding: {0}")]
    Malformed(&'static str),
}

/// Decodes the canonical encoding of a node.
pub fn decode_node(data: &[u8]) -> Result<DecodedNode, NodeDecodeError> {
    match rlp::decode(data)? {
        Decoded::String(s) if s.is_empty() => Ok(DecodedNode::Empty),
        Decoded::String(_) => Err(NodeDecodeError::Malformed(
            "a node encoding is a list or the empty string",
        )),
        Decoded::List(items) => match items.len() {
            17 => decode_branch(items),
            2 => decode_edge(items),
            _ => Err(NodeDecodeError::Malformed(
                "a node list has either 2 or 17 items",
            )),
        },
    }
}

fn decode_branch(items: Vec<Decoded>) -> Result<DecodedNode, NodeDecodeError> {
    let mut items = items.into_iter();
    let mut children: Box<[DecodedChild; 16]> =
        Box::new(std::array::from_fn(|_| DecodedChild::Empty));

    for slot in children.iter_mut() {
        *slot = decode_child(items.next().expect("a 17 item list was checked"))?;
    }

    match items.next() {
        Some(Decoded::String(s)) if s.is_empty() => {}
        _ => {
            // Keys are fixed-length in state and storage tries, so no key
            // can ever terminate at a branch.
            return Err(NodeDecodeError::Malformed("populated 17th branch slot"));
        }
    }

    let non_empty = children.iter().filter(|c| !c.is_empty()).count();
    if non_empty < 2 {
        return Err(NodeDecodeError::Malformed(
            "branch with fewer than two children",
        ));
    }
    Ok(DecodedNode::Branch { children })
}

fn decode_child(item: Decoded) -> Result<DecodedChild, NodeDecodeError> {
    match item {
        Decoded::String(s) => match s.len() {
            0 => Ok(DecodedChild::Empty),
            32 => Ok(DecodedChild::Hash(H256::from_slice(&s))),
            _ => Err(NodeDecodeError::Malformed(
                "a child reference is empty or a 32 byte hash",
            )),
        },
        Decoded::List(_) => {
            // An embedded child; its canonical bytes are recovered by
            // re-encoding (the strict decoder makes this lossless).
            let raw = rlp::encode_decoded(&item);
            if raw.len() >= 32 {
                return Err(NodeDecodeError::Malformed(
                    "embedded child encoding of 32 bytes or more",
                ));
            }
            Ok(DecodedChild::Embedded(raw.into()))
        }
    }
}

fn decode_edge(items: Vec<Decoded>) -> Result<DecodedNode, NodeDecodeError> {
    let mut items = items.into_iter();

    let compact = match items.next() {
        Some(Decoded::String(s)) => s,
        _ => {
            return Err(NodeDecodeError::Malformed(
                "the first item of an edge node is the compact path",
            ))
        }
    };
    let (is_leaf, path) = Path::from_compact(&compact)?;
    let payload = items.next().expect("a 2 item list was checked");

    match is_leaf {
        false => decode_extension(path, payload),
        true => decode_leaf(path, payload),
    }
}

fn decode_extension(path: Path, payload: Decoded) -> Result<DecodedNode, NodeDecodeError> {
    if path.is_empty() {
        return Err(NodeDecodeError::Malformed("extension with an empty path"));
    }
    let next = decode_child(payload)?;
    if next.is_empty() {
        return Err(NodeDecodeError::Malformed(
            "extension without a successor",
        ));
    }
    Ok(DecodedNode::Extension { path, next })
}

fn decode_leaf(path: Path, payload: Decoded) -> Result<DecodedNode, NodeDecodeError> {
    let payload = match payload {
        Decoded::String(s) => s,
        Decoded::List(_) => {
            return Err(NodeDecodeError::Malformed(
                "a leaf payload is an encoded byte string",
            ))
        }
    };

    // The payload is itself a canonical encoding: a byte string for a
    // storage value, a 4 item list for an account.
    match rlp::decode(&payload)? {
        Decoded::String(v) => decode_value(path, v),
        Decoded::List(fields) => decode_account(path, fields),
    }
}

fn decode_value(path: Path, stripped: Vec<u8>) -> Result<DecodedNode, NodeDecodeError> {
    if stripped.is_empty() {
        return Err(NodeDecodeError::Malformed("zero value stored in a leaf"));
    }
    if stripped.len() > 32 {
        return Err(NodeDecodeError::Malformed("value longer than 32 bytes"));
    }
    if stripped[0] == 0 {
        return Err(NodeDecodeError::Malformed("value with leading zero bytes"));
    }

    let mut value = H256::zero();
    value.0[32 - stripped.len()..].copy_from_slice(&stripped);
    Ok(DecodedNode::Value { path, value })
}

fn decode_account(path: Path, fields: Vec<Decoded>) -> Result<DecodedNode, NodeDecodeError> {
    if fields.len() != 4 {
        return Err(NodeDecodeError::Malformed(
            "an account value is a 4 item list",
        ));
    }
    let mut fields = fields.into_iter();

    let nonce = decode_uint_field(fields.next().expect("arity checked"), 8)?;
    let balance = decode_uint_field(fields.next().expect("arity checked"), 32)?;
    let storage_root = decode_hash_field(fields.next().expect("arity checked"))?;
    let code_hash = decode_hash_field(fields.next().expect("arity checked"))?;

    let mut nonce_bytes = [0u8; 8];
    nonce_bytes[8 - nonce.len()..].copy_from_slice(&nonce);

    Ok(DecodedNode::Account {
        path,
        info: AccountInfo {
            nonce: u64::from_be_bytes(nonce_bytes),
            balance: U256::from_big_endian(&balance),
            code_hash,
        },
        storage_root,
    })
}

fn decode_uint_field(item: Decoded, max_len: usize) -> Result<Vec<u8>, NodeDecodeError> {
    let bytes = match item {
        Decoded::String(s) => s,
        Decoded::List(_) => {
            return Err(NodeDecodeError::Malformed(
                "an account integer field is a byte string",
            ))
        }
    };
    if bytes.len() > max_len {
        return Err(NodeDecodeError::Malformed("integer field too long"));
    }
    if !bytes.is_empty() && bytes[0] == 0 {
        return Err(NodeDecodeError::Malformed(
            "integer field with leading zero bytes",
        ));
    }
    Ok(bytes)
}

fn decode_hash_field(item: Decoded) -> Result<H256, NodeDecodeError> {
    match item {
        Decoded::String(s) if s.len() == 32 => Ok(H256::from_slice(&s)),
        _ => Err(NodeDecodeError::Malformed(
            "an account hash field is a 32 byte string",
        )),
    }
}
