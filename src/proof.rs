//! Witness proofs: content-addressed sets of encoded nodes sufficient to
//! verify an account or storage slot against a trusted root hash.
//!
//! Extraction walks a hashed trie from the root to the target leaf and
//! records `keccak(encoding) → encoding` for every visited node. Embedded
//! children contribute no entry of their own; their bytes live inside the
//! parent encoding. One account proof and all its storage proofs share a
//! single db, deduplicating shared ancestors.
//!
//! Verification re-walks the path through the db, checking that every
//! fetched entry actually hashes to the key it was fetched under, so a
//! tampered db cannot substitute content. A structurally sound walk that
//! ends in an empty slot or a diverging leaf proves *absence* and
//! verifies to `Ok(None)`; only missing entries and malformed encodings
//! reject the proof.

use std::collections::HashMap;

use bytes::Bytes;
use ethereum_types::H256;
use keccak_hash::keccak;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoder::{decode_node, DecodedChild, DecodedNode, NodeDecodeError};
use crate::nibbles::Path;
use crate::node::{AccountInfo, Address, Key, Node, NodeRef, Value};
use crate::node_manager::NodeManager;
use crate::rlp::{self, Item};
use crate::trie_hashing::{encode_node_read, EMPTY_NODE_HASH};
use crate::trie_ops::{TrieOpError, TrieOpResult};

/// A content-addressed map from node hash to canonical node encoding.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProofDb {
    entries: HashMap<H256, Bytes>,
}

impl ProofDb {
    /// The encoding stored under a hash, if present.
    pub fn get(&self, hash: &H256) -> Option<&Bytes> {
        self.entries.get(hash)
    }

    /// Stores an encoding under its keccak256 hash and returns the hash.
    pub fn insert(&mut self, encoded: Vec<u8>) -> H256 {
        let hash = keccak(&encoded);
        self.entries.insert(hash, encoded.into());
        hash
    }

    /// Set union with another db. Identical hashes always carry identical
    /// bytes, so the union is conflict-free.
    pub fn merge(&mut self, other: ProofDb) {
        self.entries.extend(other.entries);
    }

    /// The number of stored encodings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the db holds no encodings.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(hash, encoding)` pairs in implementation-defined
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (&H256, &Bytes)> {
        self.entries.iter()
    }
}

/// The root hash and terminal outcome of one proved path.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct StorageProof {
    /// The storage trie root the walk starts from.
    pub root: H256,
    /// Whether extraction terminated at a leaf matching the key.
    pub exists: bool,
}

/// A witness proof for one account and any number of its storage slots,
/// all sharing one content-addressed db.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccountProof {
    db: ProofDb,
    root: H256,
    exists: bool,
    storage: HashMap<Key, StorageProof>,
}

impl AccountProof {
    /// The shared content-addressed db.
    pub fn db(&self) -> &ProofDb {
        &self.db
    }

    /// The root hash of the account trie the proof was extracted from.
    pub fn root(&self) -> H256 {
        self.root
    }

    /// Whether extraction terminated at an account leaf with the queried
    /// address.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// The storage proof extracted for a key, if one was requested.
    pub fn storage_proof(&self, key: &Key) -> Option<StorageProof> {
        self.storage.get(key).copied()
    }

    /// Verifies the account against the proof's own root hash.
    pub fn verify_account(&self, address: &Address) -> Result<Option<ProvedAccount>, ProofError> {
        prove_account(&self.db, self.root, address)
    }

    /// Verifies a storage slot. The storage root is taken from the
    /// *verified* account, binding the slot to the account trie root.
    pub fn verify_slot(&self, address: &Address, key: &Key) -> Result<Option<Value>, ProofError> {
        match self.verify_account(address)? {
            None => Ok(None),
            Some(account) => prove_storage(&self.db, account.storage_root, key),
        }
    }

    /// Merges another proof for the same trie into this one: set union on
    /// the dbs, extension of the per-key storage roots.
    pub fn merge(&mut self, other: AccountProof) {
        self.db.merge(other.db);
        self.storage.extend(other.storage);
    }
}

/// The account data recovered by a successful verification.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ProvedAccount {
    /// Nonce, balance and code hash.
    pub info: AccountInfo,
    /// The root hash of the account's storage trie.
    pub storage_root: H256,
}

/// An error rejecting a witness proof. Absence of the queried account or
/// slot is not an error; it verifies to `Ok(None)`.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum ProofError {
    /// A node on the path has no entry in the db.
    #[error("proof db is missing the node {0:?}")]
    MissingNode(H256),

    /// An entry stores bytes that do not hash to its key.
    #[error("proof db entry does not hash to its key {0:?}")]
    HashMismatch(H256),

    /// An entry is not a canonical node encoding.
    #[error(transparent)]
    MalformedEncoding(#[from] NodeDecodeError),

    /// The decoded nodes do not form a valid descent path.
    #[error("proof path is inconsistent: {0}")]
    Inconsistent(&'static str),
}

// ---------------------------------------------------------------------------
//                              Verification
// ---------------------------------------------------------------------------

/// Verifies an account against a trusted root hash. Addresses are hashed
/// with keccak256, as the reference trie does.
pub fn prove_account(
    db: &ProofDb,
    root: H256,
    address: &Address,
) -> Result<Option<ProvedAccount>, ProofError> {
    let path = Path::from_key(&keccak(address.as_bytes()));
    match walk(db, root, path)? {
        None => Ok(None),
        Some(DecodedNode::Account {
            info, storage_root, ..
        }) => Ok(Some(ProvedAccount { info, storage_root })),
        Some(_) => Err(ProofError::Inconsistent(
            "account walk terminated at a storage value leaf",
        )),
    }
}

/// Verifies a storage slot against a trusted storage trie root.
pub fn prove_storage(
    db: &ProofDb,
    storage_root: H256,
    key: &Key,
) -> Result<Option<Value>, ProofError> {
    let path = Path::from_key(&keccak(key.as_bytes()));
    match walk(db, storage_root, path)? {
        None => Ok(None),
        Some(DecodedNode::Value { value, .. }) => Ok(Some(value)),
        Some(_) => Err(ProofError::Inconsistent(
            "storage walk terminated at an account leaf",
        )),
    }
}

fn fetch(db: &ProofDb, hash: &H256) -> Result<Bytes, ProofError> {
    let encoded = db.get(hash).ok_or(ProofError::MissingNode(*hash))?;
    if keccak(encoded) != *hash {
        return Err(ProofError::HashMismatch(*hash));
    }
    Ok(encoded.clone())
}

/// The shared descent state machine: decode the node under the current
/// hash, consume nibbles per variant, terminate at a leaf (`Some`), an
/// absence (`None`) or an inconsistency (`Err`).
fn walk(db: &ProofDb, root: H256, full_path: Path) -> Result<Option<DecodedNode>, ProofError> {
    let mut remaining = full_path;
    let mut encoded = fetch(db, &root)?;

    loop {
        let node = decode_node(&encoded)?;
        let next = match node {
            DecodedNode::Empty => return Ok(None),
            DecodedNode::Branch { children } => {
                if remaining.is_empty() {
                    return Err(ProofError::Inconsistent("key exhausted at a branch"));
                }
                let nib = remaining.first();
                remaining = remaining.drop_front(1);
                children[nib as usize].clone()
            }
            DecodedNode::Extension { path, next } => {
                if !remaining.starts_with(&path) {
                    // The path diverges here; the key cannot be present.
                    return Ok(None);
                }
                remaining = remaining.drop_front(path.len());
                next
            }
            leaf @ DecodedNode::Account { .. } => {
                let path = match &leaf {
                    DecodedNode::Account { path, .. } => *path,
                    _ => unreachable!(),
                };
                return Ok((path == remaining).then_some(leaf));
            }
            leaf @ DecodedNode::Value { .. } => {
                let path = match &leaf {
                    DecodedNode::Value { path, .. } => *path,
                    _ => unreachable!(),
                };
                return Ok((path == remaining).then_some(leaf));
            }
        };

        encoded = match next {
            DecodedChild::Empty => return Ok(None),
            DecodedChild::Hash(h) => fetch(db, &h)?,
            // Embedded children live inside the already-verified parent
            // bytes; no db lookup is involved.
            DecodedChild::Embedded(raw) => raw,
        };
    }
}

// ---------------------------------------------------------------------------
//                               Extraction
// ---------------------------------------------------------------------------

/// Extracts a witness proof for `address` and the given storage keys from
/// a hashed trie. Requires all hashes below `root` to be settled.
pub(crate) fn create_account_proof<M: NodeManager>(
    m: &M,
    root: NodeRef,
    address: &Address,
    keys: &[Key],
) -> TrieOpResult<AccountProof> {
    let config = m.config();
    if config.hash_algorithm != crate::node_manager::HashAlgorithm::Reference
        || config.key_hashing != crate::node_manager::KeyHashing::Keccak
    {
        return Err(TrieOpError::InvariantViolation(
            "witness proofs require the reference hashing scheme",
        ));
    }
    let root_hash = crate::trie_hashing::get_hash(m, root)?;
    let mut db = ProofDb::default();

    let account = collect_account_path(m, root, address, &mut db)?;
    let mut proof = AccountProof {
        db: ProofDb::default(),
        root: root_hash,
        exists: account.is_some(),
        storage: HashMap::new(),
    };

    if let Some((storage, storage_root)) = account {
        for key in keys {
            let exists = collect_storage_path(m, storage, key, &mut db)?;
            proof.storage.insert(
                *key,
                StorageProof {
                    root: storage_root,
                    exists,
                },
            );
        }
    }

    proof.db = db;
    Ok(proof)
}

/// Walks the account trie to the leaf for `address`, recording every
/// non-embedded node encoding. Returns the storage root of the account
/// when it exists.
fn collect_account_path<M: NodeManager>(
    m: &M,
    root: NodeRef,
    address: &Address,
    db: &mut ProofDb,
) -> TrieOpResult<Option<(NodeRef, H256)>> {
    let mut node_ref = root;
    let mut path = Path::from_key(&m.hash_address(address));
    let mut embedded = false;

    loop {
        if node_ref.is_empty() {
            // The empty node is addressable in the db so that absence in
            // an empty (sub)trie verifies.
            db.insert(rlp::encode(&Item::empty_string()));
            return Ok(None);
        }
        let handle = m.get_read(&node_ref)?;
        let node = handle.get();
        if !embedded {
            db.insert(encode_node_read(m, node)?);
        }

        match node {
            Node::Empty => return Ok(None),
            Node::Branch(b) => {
                if path.is_empty() {
                    return Err(TrieOpError::InvariantViolation(
                        "key exhausted at a branch node",
                    ));
                }
                let nib = path.first();
                path = path.drop_front(1);
                let child = b.children[nib as usize];
                if child.is_empty() {
                    return Ok(None);
                }
                embedded = b.is_embedded(nib);
                node_ref = child;
            }
            Node::Extension(e) => {
                if !path.starts_with(&e.path) {
                    return Ok(None);
                }
                path = path.drop_front(e.path.len());
                embedded = e.next_embedded;
                node_ref = e.next;
            }
            Node::Account(a) => {
                let matches = a.path_length as usize == path.len() && a.address == *address;
                let storage_root = match a.storage.is_empty() {
                    true => EMPTY_NODE_HASH,
                    false => a.storage_hash,
                };
                return Ok(matches.then_some((a.storage, storage_root)));
            }
            Node::Value(_) => {
                return Err(TrieOpError::InvariantViolation(
                    "value leaf found in the account trie",
                ))
            }
        }
    }
}

/// Walks a storage trie to the leaf for `key`, recording every
/// non-embedded node encoding. Returns whether the slot exists.
fn collect_storage_path<M: NodeManager>(
    m: &M,
    root: NodeRef,
    key: &Key,
    db: &mut ProofDb,
) -> TrieOpResult<bool> {
    let mut node_ref = root;
    let mut path = Path::from_key(&m.hash_key(key));
    let mut embedded = false;

    loop {
        if node_ref.is_empty() {
            db.insert(rlp::encode(&Item::empty_string()));
            return Ok(false);
        }
        let handle = m.get_read(&node_ref)?;
        let node = handle.get();
        if !embedded {
            db.insert(encode_node_read(m, node)?);
        }

        match node {
            Node::Empty => return Ok(false),
            Node::Branch(b) => {
                if path.is_empty() {
                    return Err(TrieOpError::InvariantViolation(
                        "key exhausted at a branch node",
                    ));
                }
                let nib = path.first();
                path = path.drop_front(1);
                let child = b.children[nib as usize];
                if child.is_empty() {
                    return Ok(false);
                }
                embedded = b.is_embedded(nib);
                node_ref = child;
            }
            Node::Extension(e) => {
                if !path.starts_with(&e.path) {
                    return Ok(false);
                }
                path = path.drop_front(e.path.len());
                embedded = e.next_embedded;
                node_ref = e.next;
            }
            Node::Value(v) => {
                return Ok(v.path_length as usize == path.len() && v.key == *key);
            }
            Node::Account(_) => {
                return Err(TrieOpError::InvariantViolation(
                    "account leaf found in a storage trie",
                ))
            }
        }
    }
}
