//! The contract between the trie and its node store, plus the in-memory
//! store used for testing and light workloads.
//!
//! The trie never owns nodes; it borrows them through read or write handles
//! acquired here, scoped to a single operation. Every handle acquisition is
//! a potential wait (lock, page-in, or a cooperative cancellation point for
//! managers that support it).

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ethereum_types::H256;
use keccak_hash::keccak;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::nibbles::Path;
use crate::node::{
    AccountInfo, AccountNode, Address, BranchNode, ExtensionNode, Key, Node, NodeId, NodeRef,
    Value, ValueNode,
};
use crate::trie_ops::{TrieOpError, TrieOpResult};

/// Selects the node hashing algorithm of a trie.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashAlgorithm {
    /// A fast tag-based hash over node content and child hashes.
    Direct,
    /// The reference (Ethereum-compatible) hash over the canonical node
    /// encoding.
    Reference,
}

/// Selects how addresses and storage keys are turned into descent paths.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyHashing {
    /// Keys are used as-is (addresses zero-padded to 32 bytes).
    Identity,
    /// Keys are hashed with keccak256 before descending.
    Keccak,
}

/// The configuration of a trie, owned by its node manager.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Config {
    /// The node hashing algorithm.
    pub hash_algorithm: HashAlgorithm,
    /// The key hashing mode. The reference algorithm requires
    /// [`KeyHashing::Keccak`].
    pub key_hashing: KeyHashing,
    /// Whether hash refreshes report `(path, hash)` records.
    pub track_node_hashes: bool,
}

impl Config {
    /// Direct hashing over unhashed keys.
    pub const fn direct() -> Self {
        Config {
            hash_algorithm: HashAlgorithm::Direct,
            key_hashing: KeyHashing::Identity,
            track_node_hashes: false,
        }
    }

    /// Reference (Ethereum-compatible) hashing over keccak-hashed keys.
    pub const fn reference() -> Self {
        Config {
            hash_algorithm: HashAlgorithm::Reference,
            key_hashing: KeyHashing::Keccak,
            track_node_hashes: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::reference()
    }
}

/// Shared access to a node, released on drop.
pub struct ReadHandle {
    guard: ArcRwLockReadGuard<RawRwLock, Node>,
}

impl ReadHandle {
    /// The node behind the handle.
    pub fn get(&self) -> &Node {
        &self.guard
    }
}

impl Debug for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadHandle").field(self.get()).finish()
    }
}

/// Exclusive access to a node, released on drop.
pub struct WriteHandle {
    guard: ArcRwLockWriteGuard<RawRwLock, Node>,
}

impl WriteHandle {
    /// The node behind the handle.
    pub fn get(&self) -> &Node {
        &self.guard
    }

    /// Mutable access to the node behind the handle.
    pub fn get_mut(&mut self) -> &mut Node {
        &mut self.guard
    }
}

impl Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteHandle").field(self.get()).finish()
    }
}

/// The node store contract the trie operates against.
///
/// Implementations own the nodes; the trie holds handles only for the
/// duration of a single operation. All methods may block inside handle
/// acquisition and may fail with [`TrieOpError::Io`] or
/// [`TrieOpError::Cancelled`].
pub trait NodeManager {
    /// Acquires shared access to the referenced node.
    fn get_read(&self, r: &NodeRef) -> TrieOpResult<ReadHandle>;

    /// Acquires exclusive access to the referenced node.
    fn get_write(&self, r: &NodeRef) -> TrieOpResult<WriteHandle>;

    /// Stores a new node and returns its reference along with exclusive
    /// access to it.
    fn create(&self, node: Node) -> TrieOpResult<(NodeRef, WriteHandle)>;

    /// Creates an empty branch node.
    fn create_branch(&self) -> TrieOpResult<(NodeRef, WriteHandle)> {
        self.create(Node::Branch(BranchNode::new()))
    }

    /// Creates an extension node with the given path and successor.
    fn create_extension(&self, path: Path, next: NodeRef) -> TrieOpResult<(NodeRef, WriteHandle)> {
        self.create(Node::Extension(ExtensionNode::new(path, next)))
    }

    /// Creates an account leaf without storage.
    fn create_leaf_account(
        &self,
        address: Address,
        path_length: u8,
        info: AccountInfo,
    ) -> TrieOpResult<(NodeRef, WriteHandle)> {
        self.create(Node::Account(AccountNode::new(address, path_length, info)))
    }

    /// Creates a storage value leaf.
    fn create_leaf_value(
        &self,
        key: Key,
        path_length: u8,
        value: Value,
    ) -> TrieOpResult<(NodeRef, WriteHandle)> {
        self.create(Node::Value(ValueNode::new(key, path_length, value)))
    }

    /// Notifies the manager that the node behind the handle was modified,
    /// so a persistent store can schedule it for write-back.
    fn mark_dirty(&self, r: &NodeRef, handle: &mut WriteHandle);

    /// Detaches and reclaims a node. Releasing the empty reference is a
    /// no-op.
    fn release(&self, r: &NodeRef) -> TrieOpResult<()>;

    /// The trie configuration.
    fn config(&self) -> Config;

    /// The descent path source for an address, per the configured key
    /// hashing mode.
    fn hash_address(&self, address: &Address) -> H256 {
        match self.config().key_hashing {
            KeyHashing::Keccak => keccak(address.as_bytes()),
            KeyHashing::Identity => {
                let mut h = H256::zero();
                h.0[..20].copy_from_slice(address.as_bytes());
                h
            }
        }
    }

    /// The descent path source for a storage key, per the configured key
    /// hashing mode.
    fn hash_key(&self, key: &Key) -> H256 {
        match self.config().key_hashing {
            KeyHashing::Keccak => keccak(key.as_bytes()),
            KeyHashing::Identity => *key,
        }
    }
}

/// A node store keeping all nodes in memory.
///
/// Released slots are recycled through a free list. A cooperative
/// cancellation flag fails all further handle acquisitions with
/// [`TrieOpError::Cancelled`] until cleared; in-flight mutations unwind at
/// the next handle boundary, leaving dirty flags set but the structure
/// intact.
#[derive(Debug)]
pub struct InMemoryNodeManager {
    config: Config,
    nodes: RwLock<Vec<Option<Arc<RwLock<Node>>>>>,
    free: Mutex<Vec<u64>>,
    cancelled: AtomicBool,
}

impl InMemoryNodeManager {
    /// Creates an empty store with the given configuration.
    pub fn new(config: Config) -> Self {
        InMemoryNodeManager {
            config,
            nodes: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Requests cooperative cancellation: every later handle acquisition
    /// fails with [`TrieOpError::Cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Clears a previously requested cancellation so operations can be
    /// retried.
    pub fn clear_cancellation(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// The number of live (not released) nodes in the store.
    pub fn live_nodes(&self) -> usize {
        self.nodes.read().iter().filter(|n| n.is_some()).count()
    }

    fn check_cancelled(&self) -> TrieOpResult<()> {
        match self.cancelled.load(Ordering::Acquire) {
            true => Err(TrieOpError::Cancelled),
            false => Ok(()),
        }
    }

    fn slot(&self, id: NodeId) -> TrieOpResult<Arc<RwLock<Node>>> {
        if id.is_empty() {
            return Err(TrieOpError::Io(
                "the empty node has no backing slot".to_string(),
            ));
        }

        self.nodes
            .read()
            .get(id.index() as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| TrieOpError::Io(format!("no live node for {:?}", id)))
    }
}

impl NodeManager for InMemoryNodeManager {
    fn get_read(&self, r: &NodeRef) -> TrieOpResult<ReadHandle> {
        self.check_cancelled()?;
        let slot = self.slot(r.id())?;
        Ok(ReadHandle {
            guard: slot.read_arc(),
        })
    }

    fn get_write(&self, r: &NodeRef) -> TrieOpResult<WriteHandle> {
        self.check_cancelled()?;
        let slot = self.slot(r.id())?;
        Ok(WriteHandle {
            guard: slot.write_arc(),
        })
    }

    fn create(&self, node: Node) -> TrieOpResult<(NodeRef, WriteHandle)> {
        let slot = Arc::new(RwLock::new(node));
        let guard = slot.write_arc();

        // The free-list lock is never held together with the slab lock.
        let recycled = self.free.lock().pop();
        let index = match recycled {
            Some(index) => {
                self.nodes.write()[index as usize] = Some(slot);
                index
            }
            None => {
                let mut nodes = self.nodes.write();
                nodes.push(Some(slot));
                (nodes.len() - 1) as u64
            }
        };

        Ok((
            NodeRef::new(NodeId::from_index(index)),
            WriteHandle { guard },
        ))
    }

    fn mark_dirty(&self, _r: &NodeRef, _handle: &mut WriteHandle) {
        // In-memory nodes are always current; a page-backed store would
        // schedule the page for write-back here.
    }

    fn release(&self, r: &NodeRef) -> TrieOpResult<()> {
        if r.is_empty() {
            return Ok(());
        }

        let index = r.id().index();
        {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(index as usize) {
                Some(slot) if slot.is_some() => *slot = None,
                _ => {
                    return Err(TrieOpError::Io(format!(
                        "released {:?} twice or out of range",
                        r.id()
                    )))
                }
            }
        }
        self.free.lock().push(index);
        Ok(())
    }

    fn config(&self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_nodes_are_readable_and_writable() -> TrieOpResult<()> {
        let manager = InMemoryNodeManager::new(Config::direct());

        let (r, handle) = manager.create_leaf_value(H256::zero(), 64, H256::repeat_byte(9))?;
        drop(handle);

        {
            let mut handle = manager.get_write(&r)?;
            match handle.get_mut() {
                Node::Value(v) => v.value = H256::repeat_byte(7),
                _ => unreachable!(),
            }
        }

        let handle = manager.get_read(&r)?;
        match handle.get() {
            Node::Value(v) => assert_eq!(v.value, H256::repeat_byte(7)),
            _ => unreachable!(),
        }

        Ok(())
    }

    #[test]
    fn released_slots_are_recycled() -> TrieOpResult<()> {
        let manager = InMemoryNodeManager::new(Config::direct());

        let (a, handle) = manager.create_branch()?;
        drop(handle);
        let (b, handle) = manager.create_branch()?;
        drop(handle);
        assert_eq!(manager.live_nodes(), 2);

        manager.release(&a)?;
        assert_eq!(manager.live_nodes(), 1);
        assert!(manager.get_read(&a).is_err());
        assert!(manager.release(&a).is_err());

        // The freed slot is reused for the next allocation.
        let (c, handle) = manager.create_branch()?;
        drop(handle);
        assert_eq!(c.id(), a.id());
        assert_ne!(c.id(), b.id());

        Ok(())
    }

    #[test]
    fn releasing_the_empty_reference_is_a_no_op() {
        let manager = InMemoryNodeManager::new(Config::direct());
        assert_eq!(manager.release(&NodeRef::EMPTY), Ok(()));
    }

    #[test]
    fn cancellation_fails_handle_acquisition_until_cleared() -> TrieOpResult<()> {
        let manager = InMemoryNodeManager::new(Config::direct());
        let (r, handle) = manager.create_branch()?;
        drop(handle);

        manager.cancel();
        assert_eq!(manager.get_read(&r).unwrap_err(), TrieOpError::Cancelled);
        assert_eq!(manager.get_write(&r).unwrap_err(), TrieOpError::Cancelled);

        manager.clear_cancellation();
        assert!(manager.get_read(&r).is_ok());

        Ok(())
    }

    #[test]
    fn key_hashing_modes_differ() {
        let identity = InMemoryNodeManager::new(Config::direct());
        let keccak = InMemoryNodeManager::new(Config::reference());

        let addr = Address::repeat_byte(0xab);
        let mut padded = H256::zero();
        padded.0[..20].copy_from_slice(addr.as_bytes());

        assert_eq!(identity.hash_address(&addr), padded);
        assert_ne!(keccak.hash_address(&addr), padded);

        let key = H256::repeat_byte(0x11);
        assert_eq!(identity.hash_key(&key), key);
        assert_ne!(keccak.hash_key(&key), key);
    }
}
