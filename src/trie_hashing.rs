//! The dual hashing pipeline: a fast direct hash and the reference
//! (Ethereum-compatible) hash over canonical node encodings.
//!
//! Both hashers share one recursion shape. In *update* mode (driven by
//! [`update_hashes`]) nodes are visited under write handles, dirty
//! subtrees are re-hashed, the results are cached back into the nodes and
//! optionally reported as `(path, hash)` records. In *read* mode (driven
//! by [`get_hash`] and proof extraction) nothing is written; the walk
//! refuses tries with stale hashes instead of silently trusting them.
//!
//! The reference hasher applies the embedded-node rule: a child whose
//! canonical encoding is shorter than 32 bytes is spliced verbatim into
//! its parent's encoding instead of being referenced by hash. A cheap
//! lower-bound size estimate avoids encoding large children just to learn
//! they are not embedded.

use ethereum_types::H256;
use keccak_hash::keccak;
use sha2::{Digest, Sha256};

use crate::nibbles::{NodePath, Path};
use crate::node::{Node, NodeRef};
use crate::node_manager::{HashAlgorithm, NodeManager, WriteHandle};
use crate::rlp::{self, Item};
use crate::trie_ops::{
    account_mut, account_ref, branch_mut, branch_ref, extension_mut, extension_ref, TrieOpError,
    TrieOpResult,
};

/// The reference hash of the empty node: `keccak256` of the codec encoding
/// of the empty byte string.
pub const EMPTY_NODE_HASH: H256 = keccak_hash::KECCAK_NULL_RLP;

/// The location and value of one refreshed node hash, reported to external
/// observers (the archive) when hash tracking is enabled.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NodeHashRecord {
    /// The node's location below the trie root.
    pub path: NodePath,
    /// The refreshed hash.
    pub hash: H256,
}

struct HashCollector {
    enabled: bool,
    records: Vec<NodeHashRecord>,
}

impl HashCollector {
    fn new(enabled: bool) -> Self {
        HashCollector {
            enabled,
            records: Vec::new(),
        }
    }

    fn add(&mut self, path: &NodePath, hash: H256) {
        if self.enabled {
            self.records.push(NodeHashRecord {
                path: path.clone(),
                hash,
            });
        }
    }
}

/// Refreshes all dirty hashes below `root` with the configured algorithm
/// and returns the root hash plus any collected hash records.
pub(crate) fn update_hashes<M: NodeManager>(
    m: &M,
    root: NodeRef,
) -> TrieOpResult<(H256, Vec<NodeHashRecord>)> {
    let mut collector = HashCollector::new(m.config().track_node_hashes);
    let hash = match m.config().hash_algorithm {
        HashAlgorithm::Direct => update_direct(m, root, &NodePath::root(), &mut collector)?,
        HashAlgorithm::Reference => update_reference(m, root, &NodePath::root(), &mut collector)?,
    };
    Ok((hash, collector.records))
}

/// The root hash of an already-hashed trie; read-only. Fails with
/// [`TrieOpError::DirtyTrie`] when dirty flags are set below `root`.
pub(crate) fn get_hash<M: NodeManager>(m: &M, root: NodeRef) -> TrieOpResult<H256> {
    match m.config().hash_algorithm {
        HashAlgorithm::Direct => {
            if root.is_empty() {
                return Ok(H256::zero());
            }
            let handle = m.get_read(&root)?;
            if handle.get().has_dirty_flags() {
                return Err(TrieOpError::DirtyTrie);
            }
            Ok(direct_hash_of(handle.get()))
        }
        HashAlgorithm::Reference => {
            if root.is_empty() {
                return Ok(EMPTY_NODE_HASH);
            }
            let handle = m.get_read(&root)?;
            let data = encode_node_read(m, handle.get())?;
            Ok(keccak(&data))
        }
    }
}

// ---------------------------------------------------------------------------
//                             Direct hasher
// ---------------------------------------------------------------------------

fn update_direct<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    path: &NodePath,
    collector: &mut HashCollector,
) -> TrieOpResult<H256> {
    if node_ref.is_empty() {
        return Ok(H256::zero());
    }

    let mut handle = m.get_write(&node_ref)?;
    let (hash, dirty) = handle.get().hash_and_dirty();
    if !dirty {
        return Ok(hash);
    }

    refresh_children_direct(m, node_ref, &mut handle, path, collector)?;

    let hash = direct_hash_of(handle.get());
    handle.get_mut().set_hash(hash);
    m.mark_dirty(&node_ref, &mut handle);
    collector.add(path, hash);
    Ok(hash)
}

fn refresh_children_direct<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    handle: &mut WriteHandle,
    path: &NodePath,
    collector: &mut HashCollector,
) -> TrieOpResult<()> {
    match handle.get() {
        Node::Branch(_) => {
            let (children, dirty_mask) = {
                let b = branch_ref(handle)?;
                (b.children, b.dirty_children)
            };
            let mut modified = false;
            for (i, child) in children.iter().enumerate() {
                if child.is_empty() || dirty_mask & (1 << i) == 0 {
                    continue;
                }
                let h = update_direct(m, *child, &path.child(i as u8), collector)?;
                branch_mut(handle)?.hashes[i] = h;
                modified = true;
            }
            branch_mut(handle)?.clear_child_dirty_flags();
            if modified {
                m.mark_dirty(&node_ref, handle);
            }
        }
        Node::Extension(e) => {
            if e.next_dirty {
                let next = e.next;
                let h = update_direct(m, next, &path.next(), collector)?;
                let e = extension_mut(handle)?;
                e.next_hash = h;
                e.next_dirty = false;
                m.mark_dirty(&node_ref, handle);
            }
        }
        Node::Account(a) => {
            if a.storage_dirty {
                let storage = a.storage;
                let h = update_direct(m, storage, &path.next(), collector)?;
                let a = account_mut(handle)?;
                a.storage_hash = h;
                a.storage_dirty = false;
                m.mark_dirty(&node_ref, handle);
            }
        }
        Node::Value(_) | Node::Empty => {}
    }
    Ok(())
}

/// The direct hash of a node over its canonical field bytes and the cached
/// child hashes: `sha256(tag || fields || child_hashes)`.
fn direct_hash_of(node: &Node) -> H256 {
    let mut hasher = Sha256::new();
    match node {
        Node::Empty => return H256::zero(),
        Node::Branch(b) => {
            hasher.update(b"B");
            for (i, child) in b.children.iter().enumerate() {
                match child.is_empty() {
                    true => hasher.update(b"E"),
                    false => hasher.update(b.hashes[i].as_bytes()),
                }
            }
        }
        Node::Extension(e) => {
            hasher.update(b"E");
            let nibbles: Vec<u8> = e.path.iter().collect();
            hasher.update(&[nibbles.len() as u8]);
            hasher.update(&nibbles);
            hasher.update(e.next_hash.as_bytes());
        }
        Node::Account(a) => {
            hasher.update(b"A");
            hasher.update(a.address.as_bytes());
            let mut balance = [0u8; 32];
            a.info.balance.to_big_endian(&mut balance);
            hasher.update(balance);
            hasher.update(a.info.nonce.to_be_bytes());
            hasher.update(a.info.code_hash.as_bytes());
            hasher.update(a.storage_hash.as_bytes());
        }
        Node::Value(v) => {
            hasher.update(b"V");
            hasher.update(v.key.as_bytes());
            hasher.update(v.value.as_bytes());
        }
    }
    H256::from_slice(&hasher.finalize())
}

// ---------------------------------------------------------------------------
//                            Reference hasher
// ---------------------------------------------------------------------------

fn update_reference<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    path: &NodePath,
    collector: &mut HashCollector,
) -> TrieOpResult<H256> {
    if node_ref.is_empty() {
        return Ok(EMPTY_NODE_HASH);
    }

    let mut handle = m.get_write(&node_ref)?;
    let (hash, dirty) = handle.get().hash_and_dirty();
    if !dirty {
        return Ok(hash);
    }

    let data = encode_node_update(m, node_ref, &mut handle, path, collector)?;
    let hash = keccak(&data);
    handle.get_mut().set_hash(hash);
    m.mark_dirty(&node_ref, &mut handle);
    collector.add(path, hash);
    Ok(hash)
}

/// Encodes a node in update mode: stale child hashes and embedded flags
/// are refreshed (recursively re-hashing dirty subtrees) before the
/// encoding is assembled.
fn encode_node_update<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    handle: &mut WriteHandle,
    path: &NodePath,
    collector: &mut HashCollector,
) -> TrieOpResult<Vec<u8>> {
    match handle.get() {
        Node::Empty => Ok(rlp::encode(&Item::empty_string())),
        Node::Branch(_) => {
            let (children, dirty_mask) = {
                let b = branch_ref(handle)?;
                (b.children, b.dirty_children)
            };

            let mut modified = false;
            for (i, child) in children.iter().enumerate() {
                if child.is_empty() || dirty_mask & (1 << i) == 0 {
                    continue;
                }
                let child_path = path.child(i as u8);
                let embedded = is_embedded(m, *child, &child_path, collector)?;
                let h = update_reference(m, *child, &child_path, collector)?;

                let b = branch_mut(handle)?;
                b.set_embedded(i as u8, embedded);
                b.hashes[i] = h;
                modified = true;
            }
            branch_mut(handle)?.clear_child_dirty_flags();
            if modified {
                m.mark_dirty(&node_ref, handle);
            }

            let mut items = Vec::with_capacity(17);
            let b = branch_ref(handle)?;
            for (i, child) in b.children.iter().enumerate() {
                if child.is_empty() {
                    items.push(Item::empty_string());
                } else if b.is_embedded(i as u8) {
                    let ch = m.get_read(child)?;
                    items.push(Item::Encoded(encode_node_read(m, ch.get())?));
                } else {
                    items.push(Item::hash(&b.hashes[i]));
                }
            }
            // Branch nodes never terminate a key in state or storage
            // tries; the 17th slot stays empty.
            items.push(Item::empty_string());
            Ok(rlp::encode(&Item::List(items)))
        }
        Node::Extension(e) => {
            if e.next_dirty {
                let next = e.next;
                let next_path = path.next();
                let embedded = is_embedded(m, next, &next_path, collector)?;
                let h = update_reference(m, next, &next_path, collector)?;

                let e = extension_mut(handle)?;
                e.next_embedded = embedded;
                e.next_hash = h;
                e.next_dirty = false;
                m.mark_dirty(&node_ref, handle);
            }

            let e = extension_ref(handle)?;
            let next_item = match e.next_embedded {
                true => {
                    let ch = m.get_read(&e.next)?;
                    Item::Encoded(encode_node_read(m, ch.get())?)
                }
                false => Item::hash(&e.next_hash),
            };
            Ok(rlp::encode(&Item::List(vec![
                Item::String(e.path.to_compact(false)),
                next_item,
            ])))
        }
        Node::Account(a) => {
            if a.storage_dirty {
                let storage = a.storage;
                let h = update_reference(m, storage, &path.next(), collector)?;
                let a = account_mut(handle)?;
                a.storage_hash = h;
                a.storage_dirty = false;
                m.mark_dirty(&node_ref, handle);
            }
            Ok(encode_account_leaf(m, account_ref(handle)?))
        }
        Node::Value(v) => Ok(encode_value_leaf(m, v)),
    }
}

/// Encodes a node in read mode: cached hashes and embedded flags are used
/// as they are; any dirty flag fails the encoding, since the cached data
/// could be stale.
pub(crate) fn encode_node_read<M: NodeManager>(m: &M, node: &Node) -> TrieOpResult<Vec<u8>> {
    if node.has_dirty_flags() {
        return Err(TrieOpError::DirtyTrie);
    }

    match node {
        Node::Empty => Ok(rlp::encode(&Item::empty_string())),
        Node::Branch(b) => {
            let mut items = Vec::with_capacity(17);
            for (i, child) in b.children.iter().enumerate() {
                if child.is_empty() {
                    items.push(Item::empty_string());
                } else if b.is_embedded(i as u8) {
                    let ch = m.get_read(child)?;
                    items.push(Item::Encoded(encode_node_read(m, ch.get())?));
                } else {
                    items.push(Item::hash(&b.hashes[i]));
                }
            }
            items.push(Item::empty_string());
            Ok(rlp::encode(&Item::List(items)))
        }
        Node::Extension(e) => {
            let next_item = match e.next_embedded {
                true => {
                    let ch = m.get_read(&e.next)?;
                    Item::Encoded(encode_node_read(m, ch.get())?)
                }
                false => Item::hash(&e.next_hash),
            };
            Ok(rlp::encode(&Item::List(vec![
                Item::String(e.path.to_compact(false)),
                next_item,
            ])))
        }
        Node::Account(a) => Ok(encode_account_leaf(m, a)),
        Node::Value(v) => Ok(encode_value_leaf(m, v)),
    }
}

/// The canonical leaf encoding of an account: the compact-encoded partial
/// path and the encoded 4-element value list.
fn encode_account_leaf<M: NodeManager>(m: &M, a: &crate::node::AccountNode) -> Vec<u8> {
    let storage_root = match a.storage.is_empty() {
        true => EMPTY_NODE_HASH,
        false => a.storage_hash,
    };
    let value = rlp::encode(&Item::List(vec![
        Item::uint(a.info.nonce),
        Item::u256(&a.info.balance),
        Item::hash(&storage_root),
        Item::hash(&a.info.code_hash),
    ]));

    let leaf_path = Path::from_key(&m.hash_address(&a.address)).suffix(a.path_length as usize);
    rlp::encode(&Item::List(vec![
        Item::String(leaf_path.to_compact(true)),
        Item::String(value),
    ]))
}

/// The canonical leaf encoding of a storage slot: the compact-encoded
/// partial path and the encoded value with leading zeros stripped.
fn encode_value_leaf<M: NodeManager>(m: &M, v: &crate::node::ValueNode) -> Vec<u8> {
    let stripped: Vec<u8> = v
        .value
        .as_bytes()
        .iter()
        .skip_while(|b| **b == 0)
        .copied()
        .collect();

    let leaf_path = Path::from_key(&m.hash_key(&v.key)).suffix(v.path_length as usize);
    rlp::encode(&Item::List(vec![
        Item::String(leaf_path.to_compact(true)),
        Item::String(rlp::encode(&Item::String(stripped))),
    ]))
}

// ---------------------------------------------------------------------------
//                           Embedded-node rule
// ---------------------------------------------------------------------------

/// Determines whether a node is embedded in its parent: its canonical
/// encoding is strictly shorter than 32 bytes. A lower-bound size estimate
/// is consulted first so that large subtrees are never fully encoded just
/// for this check.
fn is_embedded<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    path: &NodePath,
    collector: &mut HashCollector,
) -> TrieOpResult<bool> {
    if node_ref.is_empty() {
        return Ok(false);
    }

    let mut handle = m.get_write(&node_ref)?;
    let min_size = lower_bound_size(m, handle.get(), 32)?;
    if min_size >= 32 {
        return Ok(false);
    }

    let encoded = encode_node_update(m, node_ref, &mut handle, path, collector)?;
    Ok(encoded.len() < 32)
}

/// A cheap lower bound on the encoded size of a node, cut off at `limit`.
fn lower_bound_size<M: NodeManager>(m: &M, node: &Node, limit: usize) -> TrieOpResult<usize> {
    match node {
        Node::Empty => Ok(1),
        Node::Account(_) => {
            // Storage root and code hash alone guarantee 64 bytes; nothing
            // more precise is ever needed for a limit of 32.
            Ok(64)
        }
        Node::Branch(b) => {
            let mut sum = 1; // the empty 17th element

            // Sum up settled hashes first since they are cheap.
            for (i, child) in b.children.iter().enumerate() {
                if child.is_empty() {
                    sum += 1;
                } else if !b.is_child_dirty(i as u8) && !b.is_embedded(i as u8) {
                    sum += 32;
                }
            }
            if sum >= limit {
                return Ok(sum);
            }

            for (i, child) in b.children.iter().enumerate() {
                if sum >= limit {
                    return Ok(limit);
                }
                if child.is_empty() || !(b.is_child_dirty(i as u8) || b.is_embedded(i as u8)) {
                    continue;
                }
                let ch = m.get_read(child)?;
                let size = lower_bound_size(m, ch.get(), limit - sum)?;
                sum += size.min(32);
            }
            Ok(sum)
        }
        Node::Extension(e) => {
            let mut sum = 1; // list header
            sum += e.path.len() / 2 + 1;
            if sum >= limit {
                return Ok(sum);
            }

            let next = m.get_read(&e.next)?;
            let size = lower_bound_size(m, next.get(), limit - sum)?;
            Ok(sum + size.min(32))
        }
        Node::Value(v) => {
            let mut size = v.path_length as usize / 2 + 1;
            if size > 1 {
                size += 1; // one extra byte for the length
            }
            if size >= limit {
                return Ok(size);
            }

            let stripped = v.value.as_bytes().iter().skip_while(|b| **b == 0).count();
            Ok(size + stripped + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use eth_trie::{EthTrie, MemoryDB, Trie};
    use ethereum_types::U256;
    use keccak_hash::keccak;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::node::{AccountInfo, Address, Key, Value, EMPTY_CODE_HASH};
    use crate::node_manager::{Config, InMemoryNodeManager};
    use crate::testing_utils::{addr, common_setup, info, key, value};
    use crate::trie_ops::StateTrie;

    fn reference_manager() -> InMemoryNodeManager {
        InMemoryNodeManager::new(Config::reference())
    }

    /// Computes the expected root with the `eth_trie` crate as the ground
    /// truth. Keys are inserted pre-hashed, values pre-encoded.
    fn eth_trie_root(entries: &[(H256, Vec<u8>)]) -> H256 {
        let mut truth = EthTrie::new(Arc::new(MemoryDB::new(true)));
        for (k, v) in entries {
            truth.insert(k.as_bytes(), v).unwrap();
        }
        // Both H256 types are identical; eth_trie just re-exports its own.
        H256(truth.root_hash().unwrap().0)
    }

    fn encoded_account(info: &AccountInfo, storage_root: H256) -> Vec<u8> {
        rlp::encode(&Item::List(vec![
            Item::uint(info.nonce),
            Item::u256(&info.balance),
            Item::hash(&storage_root),
            Item::hash(&info.code_hash),
        ]))
    }

    fn encoded_slot_value(v: &Value) -> Vec<u8> {
        let stripped: Vec<u8> = v.as_bytes().iter().skip_while(|b| **b == 0).copied().collect();
        rlp::encode(&Item::String(stripped))
    }

    fn realistic_info(n: u64) -> AccountInfo {
        AccountInfo {
            nonce: n,
            balance: U256::from(n) * 1_000_000_007u64,
            code_hash: EMPTY_CODE_HASH,
        }
    }

    #[test]
    fn empty_trie_has_the_well_known_root() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let trie = StateTrie::empty();

        let expected =
            H256::from_str("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")
                .unwrap();
        assert_eq!(EMPTY_NODE_HASH, expected);
        assert_eq!(trie.update_hashes(&m)?.0, expected);
        assert_eq!(trie.get_hash(&m)?, expected);
        Ok(())
    }

    #[test]
    fn single_account_root_matches_the_reference_implementation(
    ) -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();

        let a = Address::from_low_u64_be(1);
        let i = AccountInfo {
            nonce: 0,
            balance: U256::zero(),
            code_hash: EMPTY_CODE_HASH,
        };
        // Zero nonce and balance alone would make the info "empty", so give
        // it a nonce.
        let i = AccountInfo { nonce: 1, ..i };
        trie.set_account(&m, &a, &i)?;

        let (root, _) = trie.update_hashes(&m)?;
        let expected = eth_trie_root(&[(keccak(a.as_bytes()), encoded_account(&i, EMPTY_NODE_HASH))]);
        assert_eq!(root, expected);
        Ok(())
    }

    #[test]
    fn two_accounts_diverging_at_the_first_nibble_form_a_shallow_branch(
    ) -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();

        // Find two addresses whose hashed paths diverge at nibble 0.
        let mut picked = Vec::new();
        for n in 1u64.. {
            let a = Address::from_low_u64_be(n);
            let first = Path::from_key(&m.hash_address(&a)).first();
            if picked.is_empty() {
                picked.push((a, first));
            } else if first != picked[0].1 {
                picked.push((a, first));
                break;
            }
        }
        let (a, b) = (picked[0].0, picked[1].0);

        trie.set_account(&m, &a, &realistic_info(1))?;
        trie.set_account(&m, &b, &realistic_info(2))?;

        let root = m.get_read(&trie.root())?;
        match root.get() {
            Node::Branch(_) => {}
            n => panic!("expected a branch root, got {:?}", crate::utils::NodeKind::from(n)),
        }
        drop(root);

        let (root, _) = trie.update_hashes(&m)?;
        let expected = eth_trie_root(&[
            (
                keccak(a.as_bytes()),
                encoded_account(&realistic_info(1), EMPTY_NODE_HASH),
            ),
            (
                keccak(b.as_bytes()),
                encoded_account(&realistic_info(2), EMPTY_NODE_HASH),
            ),
        ]);
        assert_eq!(root, expected);
        Ok(())
    }

    #[test]
    fn mass_account_roots_match_the_reference_implementation(
    ) -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();
        let mut rng = StdRng::seed_from_u64(3);

        let mut truth = Vec::new();
        for n in 0..100u64 {
            let a = Address::from_low_u64_be(rng.gen());
            let i = realistic_info(n + 1);
            trie.set_account(&m, &a, &i)?;
            truth.push((keccak(a.as_bytes()), encoded_account(&i, EMPTY_NODE_HASH)));

            // Compare after every insertion, as the reference trie does.
            let (root, _) = trie.update_hashes(&m)?;
            assert_eq!(root, eth_trie_root(&truth));
        }
        trie.check_invariants(&m)
    }

    #[test]
    fn storage_roots_match_the_reference_implementation() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();
        let mut rng = StdRng::seed_from_u64(4);

        let a = addr(1);
        let i = realistic_info(7);
        trie.set_account(&m, &a, &i)?;

        let mut slots = Vec::new();
        for _ in 0..50 {
            let k = Key::from_low_u64_be(rng.gen());
            let v = Value::from_low_u64_be(rng.gen_range(1..u64::MAX));
            trie.set_slot(&m, &a, &k, &v)?;
            slots.push((keccak(k.as_bytes()), encoded_slot_value(&v)));
        }
        trie.update_hashes(&m)?;

        let storage_root = crate::trie_ops::with_account(&m, trie.root(), &a, |acc| {
            acc.storage_hash
        })?
        .unwrap();
        assert_eq!(storage_root, eth_trie_root(&slots));

        let (root, _) = trie.update_hashes(&m)?;
        let expected = eth_trie_root(&[(keccak(a.as_bytes()), encoded_account(&i, storage_root))]);
        assert_eq!(root, expected);
        Ok(())
    }

    #[test]
    fn clearing_the_last_slot_restores_the_empty_storage_root(
    ) -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();

        let a = addr(1);
        trie.set_account(&m, &a, &realistic_info(1))?;
        let (root_without_storage, _) = trie.update_hashes(&m)?;

        trie.set_slot(&m, &a, &key(1), &value(9))?;
        let (root_with_storage, _) = trie.update_hashes(&m)?;
        assert_ne!(root_with_storage, root_without_storage);

        trie.set_slot(&m, &a, &key(1), &Value::zero())?;
        let (root, _) = trie.update_hashes(&m)?;
        assert_eq!(root, root_without_storage);

        let storage_hash =
            crate::trie_ops::with_account(&m, trie.root(), &a, |acc| acc.storage_hash)?.unwrap();
        assert_eq!(storage_hash, EMPTY_NODE_HASH);
        Ok(())
    }

    #[test]
    fn insertion_order_does_not_change_the_root_hash() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let mut rng = StdRng::seed_from_u64(5);
        let mut addrs: Vec<Address> = (0..100u64)
            .map(|_| Address::from_low_u64_be(rng.gen()))
            .collect();

        let m1 = reference_manager();
        let mut t1 = StateTrie::empty();
        for (n, a) in addrs.iter().enumerate() {
            t1.set_account(&m1, a, &realistic_info(n as u64 + 1))?;
        }
        let infos: std::collections::HashMap<Address, u64> = addrs
            .iter()
            .enumerate()
            .map(|(n, a)| (*a, n as u64 + 1))
            .collect();

        use rand::seq::SliceRandom;
        addrs.shuffle(&mut rng);
        let m2 = reference_manager();
        let mut t2 = StateTrie::empty();
        for a in &addrs {
            t2.set_account(&m2, a, &realistic_info(infos[a]))?;
        }

        assert_eq!(t1.update_hashes(&m1)?.0, t2.update_hashes(&m2)?.0);
        Ok(())
    }

    #[test]
    fn inserting_then_deleting_everything_restores_the_empty_root(
    ) -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();
        let mut rng = StdRng::seed_from_u64(6);

        let addrs: Vec<Address> = (0..60u64)
            .map(|_| Address::from_low_u64_be(rng.gen()))
            .collect();
        for (n, a) in addrs.iter().enumerate() {
            trie.set_account(&m, a, &realistic_info(n as u64 + 1))?;
        }
        trie.update_hashes(&m)?;

        for a in &addrs {
            trie.delete_account(&m, a)?;
        }
        assert_eq!(trie.update_hashes(&m)?.0, EMPTY_NODE_HASH);
        Ok(())
    }

    #[test]
    fn deletion_roots_match_the_reference_implementation() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();
        let mut rng = StdRng::seed_from_u64(8);

        let entries: Vec<(Address, AccountInfo)> = (0..60u64)
            .map(|n| (Address::from_low_u64_be(rng.gen()), realistic_info(n + 1)))
            .collect();
        for (a, i) in &entries {
            trie.set_account(&m, a, i)?;
        }

        let half = entries.len() / 2;
        for (a, _) in &entries[..half] {
            trie.delete_account(&m, a)?;
        }

        let truth: Vec<_> = entries[half..]
            .iter()
            .map(|(a, i)| (keccak(a.as_bytes()), encoded_account(i, EMPTY_NODE_HASH)))
            .collect();
        assert_eq!(trie.update_hashes(&m)?.0, eth_trie_root(&truth));
        trie.check_invariants(&m)
    }

    #[test]
    fn get_hash_refuses_dirty_tries() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();

        trie.set_account(&m, &addr(1), &realistic_info(1))?;
        assert_eq!(trie.get_hash(&m).unwrap_err(), TrieOpError::DirtyTrie);

        let (root, _) = trie.update_hashes(&m)?;
        assert_eq!(trie.get_hash(&m)?, root);

        // A later mutation makes it dirty again.
        trie.set_account(&m, &addr(1), &realistic_info(2))?;
        assert_eq!(trie.get_hash(&m).unwrap_err(), TrieOpError::DirtyTrie);
        Ok(())
    }

    #[test]
    fn update_is_incremental_and_clears_dirty_flags() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();

        for n in 1..=20u64 {
            trie.set_account(&m, &Address::from_low_u64_be(n), &realistic_info(n))?;
        }
        let (first, _) = trie.update_hashes(&m)?;

        // A second refresh re-walks nothing and returns the cached hash.
        let (second, _) = trie.update_hashes(&m)?;
        assert_eq!(first, second);
        trie.check_invariants(&m)?;

        let handle = m.get_read(&trie.root())?;
        assert!(!handle.get().has_dirty_flags());
        Ok(())
    }

    #[test]
    fn hash_records_are_tracked_when_configured() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        // Identity key hashing keeps the structure predictable: the two
        // addresses diverge at the very first nibble.
        let mut config = Config::direct();
        config.track_node_hashes = true;
        let m = InMemoryNodeManager::new(config);
        let mut trie = StateTrie::empty();

        trie.set_account(&m, &addr(0x10), &realistic_info(1))?;
        trie.set_account(&m, &addr(0x20), &realistic_info(2))?;

        let (root, records) = trie.update_hashes(&m)?;
        // One record per refreshed node: two leaves and the branch.
        assert_eq!(records.len(), 3);
        assert!(records.iter().any(|r| r.hash == root && r.path.steps().is_empty()));

        // A clean refresh reports nothing.
        let (_, records) = trie.update_hashes(&m)?;
        assert!(records.is_empty());
        Ok(())
    }

    #[test]
    fn small_value_leaves_are_embedded_in_their_parent() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        // Reference encoding over identity-hashed keys: embedded nodes
        // need leaves with short remaining paths, which random keccak
        // images never produce in a small trie.
        let m = InMemoryNodeManager::new(Config {
            hash_algorithm: crate::node_manager::HashAlgorithm::Reference,
            key_hashing: crate::node_manager::KeyHashing::Identity,
            track_node_hashes: false,
        });
        let mut trie = StateTrie::empty();

        let a = addr(1);
        trie.set_account(&m, &a, &realistic_info(1))?;
        // The keys differ only in their last nibble, so the storage trie
        // is a 63-nibble extension over a branch with two tiny leaves.
        let (k1, k2) = (Key::from_low_u64_be(1), Key::from_low_u64_be(2));
        trie.set_slot(&m, &a, &k1, &Value::from_low_u64_be(0x0a))?;
        trie.set_slot(&m, &a, &k2, &Value::from_low_u64_be(0x0b))?;
        trie.update_hashes(&m)?;

        let storage =
            crate::trie_ops::with_account(&m, trie.root(), &a, |acc| acc.storage)?.unwrap();

        let (branch_ref, branch_is_embedded) = {
            let handle = m.get_read(&storage)?;
            match handle.get() {
                Node::Extension(e) => {
                    assert_eq!(e.path.len(), 63);
                    (e.next, e.next_embedded)
                }
                n => panic!(
                    "expected an extension storage root, got {:?}",
                    crate::utils::NodeKind::from(n)
                ),
            }
        };
        // The branch holds two 3-byte leaves, so it is itself embedded.
        assert!(branch_is_embedded);

        let handle = m.get_read(&branch_ref)?;
        let branch_encoding = encode_node_read(&m, handle.get())?;
        let b = match handle.get() {
            Node::Branch(b) => b,
            _ => unreachable!(),
        };
        for (i, c) in b.children.iter().enumerate() {
            if c.is_empty() {
                continue;
            }
            assert!(b.is_embedded(i as u8));
            let ch = m.get_read(c)?;
            let child_encoding = encode_node_read(&m, ch.get())?;
            assert!(child_encoding.len() < 32);
            // The embedded rule splices the child's raw bytes into the
            // parent encoding.
            assert!(branch_encoding
                .windows(child_encoding.len())
                .any(|w| w == child_encoding.as_slice()));
        }
        drop(handle);

        // And the storage root still matches the reference implementation
        // (eth_trie does not hash keys, matching identity hashing).
        let slots = [
            (k1, encoded_slot_value(&Value::from_low_u64_be(0x0a))),
            (k2, encoded_slot_value(&Value::from_low_u64_be(0x0b))),
        ];
        let storage_root =
            crate::trie_ops::with_account(&m, trie.root(), &a, |acc| acc.storage_hash)?.unwrap();
        assert_eq!(storage_root, eth_trie_root(&slots));
        Ok(())
    }

    #[test]
    fn node_encodings_decode_back_to_their_content() -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m = reference_manager();
        let mut trie = StateTrie::empty();

        let a = addr(1);
        let i = realistic_info(9);
        trie.set_account(&m, &a, &i)?;
        trie.set_slot(&m, &a, &key(1), &Value::from_low_u64_be(0xbeef))?;
        trie.update_hashes(&m)?;

        // The single account sits at the root with the full 64 nibble
        // path on its edge.
        let handle = m.get_read(&trie.root())?;
        let encoded = encode_node_read(&m, handle.get())?;
        let decoded = crate::decoder::decode_node(&encoded).unwrap();
        match decoded {
            crate::decoder::DecodedNode::Account {
                path,
                info,
                storage_root,
            } => {
                assert_eq!(path, Path::from_key(&m.hash_address(&a)));
                assert_eq!(info, i);
                let expected_root = match handle.get() {
                    Node::Account(acc) => acc.storage_hash,
                    _ => unreachable!(),
                };
                assert_eq!(storage_root, expected_root);
            }
            n => panic!("expected an account leaf, got {:?}", n),
        }
        let storage = match handle.get() {
            Node::Account(acc) => acc.storage,
            _ => unreachable!(),
        };
        drop(handle);

        // The single slot sits at the storage root the same way.
        let handle = m.get_read(&storage)?;
        let encoded = encode_node_read(&m, handle.get())?;
        match crate::decoder::decode_node(&encoded).unwrap() {
            crate::decoder::DecodedNode::Value { path, value } => {
                assert_eq!(path, Path::from_key(&m.hash_key(&key(1))));
                assert_eq!(value, Value::from_low_u64_be(0xbeef));
            }
            n => panic!("expected a value leaf, got {:?}", n),
        }
        Ok(())
    }

    #[test]
    fn direct_hashing_is_deterministic_and_state_dependent(
    ) -> crate::trie_ops::TrieOpResult<()> {
        common_setup();
        let m1 = InMemoryNodeManager::new(Config::direct());
        let m2 = InMemoryNodeManager::new(Config::direct());
        let mut t1 = StateTrie::empty();
        let mut t2 = StateTrie::empty();

        assert_eq!(t1.update_hashes(&m1)?.0, H256::zero());

        for n in 1..=10u64 {
            t1.set_account(&m1, &addr(n), &info(n))?;
            t2.set_account(&m2, &addr(n), &info(n))?;
        }
        t1.set_slot(&m1, &addr(3), &key(1), &value(1))?;
        t2.set_slot(&m2, &addr(3), &key(1), &value(1))?;

        let h1 = t1.update_hashes(&m1)?.0;
        let h2 = t2.update_hashes(&m2)?.0;
        assert_eq!(h1, h2);
        assert_eq!(t1.get_hash(&m1)?, h1);

        t1.set_slot(&m1, &addr(3), &key(1), &value(2))?;
        assert_ne!(t1.update_hashes(&m1)?.0, h1);
        Ok(())
    }
}
