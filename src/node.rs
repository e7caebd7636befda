//! The five node variants of the state trie and their identities.

use ethereum_types::{H160, H256, U256};

use crate::nibbles::Path;

/// A 20 byte account address.
pub type Address = H160;

/// A 32 byte storage slot key.
pub type Key = H256;

/// A 32 byte storage slot value.
pub type Value = H256;

/// The hash of the empty byte string; the code hash of accounts without
/// code.
pub const EMPTY_CODE_HASH: H256 = keccak_hash::KECCAK_EMPTY;

/// The nonce, balance and code hash of an account.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct AccountInfo {
    /// The number of transactions sent from the account.
    pub nonce: u64,
    /// The account balance.
    pub balance: U256,
    /// The hash of the account's code.
    pub code_hash: H256,
}

impl AccountInfo {
    /// Returns `true` if the info describes a non-existing account: zero
    /// nonce, zero balance and no code. Setting an empty info deletes the
    /// account.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0
            && self.balance.is_zero()
            && (self.code_hash.is_zero() || self.code_hash == EMPTY_CODE_HASH)
    }
}

/// The stable identity of a node within its manager.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct NodeId(u64);

impl NodeId {
    /// The id of the empty node. It has no backing storage.
    pub const EMPTY: NodeId = NodeId(u64::MAX);

    /// Creates an id from a manager-assigned index.
    pub const fn from_index(index: u64) -> Self {
        NodeId(index)
    }

    /// The manager-assigned index behind the id.
    pub const fn index(&self) -> u64 {
        self.0
    }

    /// Returns `true` for the empty-node sentinel.
    pub const fn is_empty(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.is_empty() {
            true => write!(f, "NodeId(empty)"),
            false => write!(f, "NodeId({})", self.0),
        }
    }
}

/// A reference to a node, used in child slots and as the root of a trie.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeRef {
    id: NodeId,
}

impl NodeRef {
    /// The reference to the empty node.
    pub const EMPTY: NodeRef = NodeRef { id: NodeId::EMPTY };

    /// Creates a reference to the node with the given id.
    pub const fn new(id: NodeId) -> Self {
        NodeRef { id }
    }

    /// The id of the referenced node.
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Returns `true` if this reference denotes the empty node.
    pub const fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        NodeRef::EMPTY
    }
}

/// A node of the state trie.
///
/// Account and value leaves are distinct variants: which one a trie holds
/// is a property of the trie (account trie vs. per-account storage trie),
/// not a runtime capability of the node.
#[derive(Clone, Debug)]
pub enum Node {
    /// The absence of a subtree.
    Empty,
    /// A radix-16 inner node.
    Branch(BranchNode),
    /// A shared path segment above a branch.
    Extension(ExtensionNode),
    /// The terminal node of an account; owns the account's storage trie.
    Account(AccountNode),
    /// The terminal node of a storage slot.
    Value(ValueNode),
}

/// A radix-16 inner node with one child slot per nibble.
#[derive(Clone, Debug)]
pub struct BranchNode {
    /// The children, one per nibble value.
    pub(crate) children: [NodeRef; 16],
    /// Cached hashes of the non-empty children.
    pub(crate) hashes: [H256; 16],
    /// Bitmask of children whose encoding is embedded in this node's.
    pub(crate) embedded: u16,
    /// Bitmask of children whose cached hash is stale.
    pub(crate) dirty_children: u16,
    /// Cached hash of this node.
    pub(crate) hash: H256,
    /// Set when the cached hash is stale.
    pub(crate) dirty: bool,
    /// Set when the node is immutable; mutations copy it first.
    pub(crate) frozen: bool,
}

impl BranchNode {
    pub(crate) fn new() -> Self {
        BranchNode {
            children: [NodeRef::EMPTY; 16],
            hashes: [H256::zero(); 16],
            embedded: 0,
            dirty_children: 0,
            hash: H256::zero(),
            dirty: true,
            frozen: false,
        }
    }

    pub(crate) fn is_embedded(&self, i: u8) -> bool {
        self.embedded & (1 << i) != 0
    }

    pub(crate) fn set_embedded(&mut self, i: u8, embedded: bool) {
        match embedded {
            true => self.embedded |= 1 << i,
            false => self.embedded &= !(1 << i),
        }
    }

    pub(crate) fn is_child_dirty(&self, i: u8) -> bool {
        self.dirty_children & (1 << i) != 0
    }

    pub(crate) fn mark_child_dirty(&mut self, i: u8) {
        self.dirty_children |= 1 << i;
        self.dirty = true;
    }

    pub(crate) fn clear_child_dirty_flags(&mut self) {
        self.dirty_children = 0;
    }

    pub(crate) fn non_empty_children(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    /// The slot and reference of the only non-empty child. Must only be
    /// called when exactly one child remains.
    pub(crate) fn single_child(&self) -> Option<(u8, NodeRef)> {
        let mut found = None;
        for (i, c) in self.children.iter().enumerate() {
            if !c.is_empty() {
                if found.is_some() {
                    return None;
                }
                found = Some((i as u8, *c));
            }
        }
        found
    }
}

/// A node compressing a run of single-successor branches.
#[derive(Clone, Debug)]
pub struct ExtensionNode {
    /// The shared nibble path. Never empty.
    pub(crate) path: Path,
    /// The successor; always a branch.
    pub(crate) next: NodeRef,
    /// Cached hash of the successor.
    pub(crate) next_hash: H256,
    /// Set when the successor's encoding is embedded in this node's.
    pub(crate) next_embedded: bool,
    /// Set when the cached successor hash is stale.
    pub(crate) next_dirty: bool,
    /// Cached hash of this node.
    pub(crate) hash: H256,
    /// Set when the cached hash is stale.
    pub(crate) dirty: bool,
    /// Set when the node is immutable; mutations copy it first.
    pub(crate) frozen: bool,
}

impl ExtensionNode {
    pub(crate) fn new(path: Path, next: NodeRef) -> Self {
        ExtensionNode {
            path,
            next,
            next_hash: H256::zero(),
            next_embedded: false,
            next_dirty: true,
            hash: H256::zero(),
            dirty: true,
            frozen: false,
        }
    }
}

/// The terminal node of an account. The remaining nibbles of the hashed
/// address covered by the leaf edge are given by `path_length`; the address
/// itself is stored so the full path can be re-derived.
#[derive(Clone, Debug)]
pub struct AccountNode {
    /// The address of the account.
    pub(crate) address: Address,
    /// The number of trailing hashed-address nibbles on the leaf edge.
    pub(crate) path_length: u8,
    /// Nonce, balance and code hash.
    pub(crate) info: AccountInfo,
    /// The root of the account's storage trie.
    pub(crate) storage: NodeRef,
    /// Cached hash of the storage trie root.
    pub(crate) storage_hash: H256,
    /// Set when the cached storage hash is stale.
    pub(crate) storage_dirty: bool,
    /// Cached hash of this node.
    pub(crate) hash: H256,
    /// Set when the cached hash is stale.
    pub(crate) dirty: bool,
    /// Set when the node is immutable; mutations copy it first.
    pub(crate) frozen: bool,
}

impl AccountNode {
    pub(crate) fn new(address: Address, path_length: u8, info: AccountInfo) -> Self {
        AccountNode {
            address,
            path_length,
            info,
            storage: NodeRef::EMPTY,
            storage_hash: H256::zero(),
            storage_dirty: true,
            hash: H256::zero(),
            dirty: true,
            frozen: false,
        }
    }

    /// The account's info.
    pub fn info(&self) -> AccountInfo {
        self.info
    }
}

/// The terminal node of a storage slot.
#[derive(Clone, Debug)]
pub struct ValueNode {
    /// The storage key the slot lives under.
    pub(crate) key: Key,
    /// The number of trailing hashed-key nibbles on the leaf edge.
    pub(crate) path_length: u8,
    /// The stored value.
    pub(crate) value: Value,
    /// Cached hash of this node.
    pub(crate) hash: H256,
    /// Set when the cached hash is stale.
    pub(crate) dirty: bool,
    /// Set when the node is immutable; mutations copy it first.
    pub(crate) frozen: bool,
}

impl ValueNode {
    pub(crate) fn new(key: Key, path_length: u8, value: Value) -> Self {
        ValueNode {
            key,
            path_length,
            value,
            hash: H256::zero(),
            dirty: true,
            frozen: false,
        }
    }
}

impl Node {
    /// The cached hash and whether it is stale.
    pub fn hash_and_dirty(&self) -> (H256, bool) {
        match self {
            Node::Empty => (H256::zero(), false),
            Node::Branch(n) => (n.hash, n.dirty),
            Node::Extension(n) => (n.hash, n.dirty),
            Node::Account(n) => (n.hash, n.dirty),
            Node::Value(n) => (n.hash, n.dirty),
        }
    }

    /// Stores a freshly computed hash and clears the node's own dirty flag.
    pub fn set_hash(&mut self, hash: H256) {
        match self {
            Node::Empty => {}
            Node::Branch(n) => {
                n.hash = hash;
                n.dirty = false;
            }
            Node::Extension(n) => {
                n.hash = hash;
                n.dirty = false;
            }
            Node::Account(n) => {
                n.hash = hash;
                n.dirty = false;
            }
            Node::Value(n) => {
                n.hash = hash;
                n.dirty = false;
            }
        }
    }

    /// Returns `true` if the node's own hash or any of its tracked child
    /// hashes is stale.
    pub fn has_dirty_flags(&self) -> bool {
        match self {
            Node::Empty => false,
            Node::Branch(n) => n.dirty || n.dirty_children != 0,
            Node::Extension(n) => n.dirty || n.next_dirty,
            Node::Account(n) => n.dirty || n.storage_dirty,
            Node::Value(n) => n.dirty,
        }
    }

    /// Returns `true` if the node is frozen.
    pub fn is_frozen(&self) -> bool {
        match self {
            Node::Empty => true,
            Node::Branch(n) => n.frozen,
            Node::Extension(n) => n.frozen,
            Node::Account(n) => n.frozen,
            Node::Value(n) => n.frozen,
        }
    }

    pub(crate) fn set_frozen(&mut self, frozen: bool) {
        match self {
            Node::Empty => {}
            Node::Branch(n) => n.frozen = frozen,
            Node::Extension(n) => n.frozen = frozen,
            Node::Account(n) => n.frozen = frozen,
            Node::Value(n) => n.frozen = frozen,
        }
    }

    pub(crate) fn as_branch(&self) -> Option<&BranchNode> {
        match self {
            Node::Branch(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn as_branch_mut(&mut self) -> Option<&mut BranchNode> {
        match self {
            Node::Branch(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn as_extension_mut(&mut self) -> Option<&mut ExtensionNode> {
        match self {
            Node::Extension(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn as_account(&self) -> Option<&AccountNode> {
        match self {
            Node::Account(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn as_account_mut(&mut self) -> Option<&mut AccountNode> {
        match self {
            Node::Account(n) => Some(n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_account_info_is_detected() {
        assert!(AccountInfo::default().is_empty());
        assert!(AccountInfo {
            code_hash: EMPTY_CODE_HASH,
            ..Default::default()
        }
        .is_empty());

        assert!(!AccountInfo {
            nonce: 1,
            ..Default::default()
        }
        .is_empty());
        assert!(!AccountInfo {
            balance: U256::one(),
            ..Default::default()
        }
        .is_empty());
        assert!(!AccountInfo {
            code_hash: H256::repeat_byte(1),
            ..Default::default()
        }
        .is_empty());
    }

    #[test]
    fn branch_child_bitmasks_work() {
        let mut b = BranchNode::new();

        assert!(!b.is_embedded(7));
        b.set_embedded(7, true);
        assert!(b.is_embedded(7));
        b.set_embedded(7, false);
        assert!(!b.is_embedded(7));

        b.dirty = false;
        b.mark_child_dirty(15);
        assert!(b.is_child_dirty(15));
        assert!(b.dirty);
        b.clear_child_dirty_flags();
        assert!(!b.is_child_dirty(15));
    }

    #[test]
    fn single_child_is_only_reported_for_one_survivor() {
        let mut b = BranchNode::new();
        b.children[3] = NodeRef::new(NodeId::from_index(42));
        assert_eq!(
            b.single_child(),
            Some((3, NodeRef::new(NodeId::from_index(42))))
        );

        b.children[9] = NodeRef::new(NodeId::from_index(43));
        assert_eq!(b.single_child(), None);
    }
}
