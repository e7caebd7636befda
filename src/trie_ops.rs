//! The structural operations of the state trie: path-directed insert,
//! update and delete over the five node variants, including branch
//! splitting, extension merging, single-child collapse and storage-subtree
//! clearing.
//!
//! All operations take the node manager as a parameter and hold handles
//! only for their own duration. Mutating recursions return `(NodeRef,
//! changed)` so each parent can decide whether to rewrite its child slot
//! and mark itself dirty; copy-on-write on frozen nodes falls out of the
//! same shape, since a copied node comes back as a different reference.

use ethereum_types::H256;
use log::trace;
use thiserror::Error;

use crate::nibbles::{Nibble, Path};
use crate::node::{AccountInfo, Address, Key, Node, NodeRef, Value};
use crate::node_manager::{NodeManager, WriteHandle};
use crate::proof::AccountProof;
use crate::trie_hashing::{self, NodeHashRecord};
use crate::utils::NodeKind;

/// Stores the result of trie operations. Returns a [`TrieOpError`] upon
/// failure.
pub type TrieOpResult<T> = Result<T, TrieOpError>;

/// An error type for trie operations.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum TrieOpError {
    /// A structural invariant of the trie was found broken. Not
    /// recoverable.
    #[error("structural invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// The node store failed to serve a handle. The operation may be
    /// retried; dirty flags left behind keep a later re-hash correct.
    #[error("node store access failed: {0}")]
    Io(String),

    /// A read-only hash or proof was requested on a trie with stale
    /// hashes.
    #[error("operation requires a fully hashed trie but dirty flags are set")]
    DirtyTrie,

    /// A cooperative cancellation was observed at a handle boundary.
    #[error("operation cancelled")]
    Cancelled,
}

/// A state trie rooted at a node owned by some manager.
///
/// The trie holds no reference to the manager; every operation takes it as
/// a parameter, so one manager can host any number of tries (including the
/// storage tries hanging off account leaves, which share the manager of
/// their account trie).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct StateTrie {
    root: NodeRef,
}

impl StateTrie {
    /// Creates an empty trie.
    pub const fn empty() -> Self {
        StateTrie {
            root: NodeRef::EMPTY,
        }
    }

    /// The current root node reference.
    pub const fn root(&self) -> NodeRef {
        self.root
    }

    /// Looks up an account. Returns `None` for absent accounts, including
    /// when part of the descent path does not exist.
    pub fn get_account<M: NodeManager>(
        &self,
        m: &M,
        address: &Address,
    ) -> TrieOpResult<Option<AccountInfo>> {
        with_account(m, self.root, address, |a| a.info())
    }

    /// Creates or updates an account. Setting empty info (zero nonce, zero
    /// balance, no code) deletes the account and its storage instead.
    pub fn set_account<M: NodeManager>(
        &mut self,
        m: &M,
        address: &Address,
        info: &AccountInfo,
    ) -> TrieOpResult<()> {
        let path = Path::from_key(&m.hash_address(address));
        let (root, _) = set_account_intern(m, self.root, path, address, info)?;
        self.root = root;
        Ok(())
    }

    /// Deletes an account and releases its storage trie.
    pub fn delete_account<M: NodeManager>(
        &mut self,
        m: &M,
        address: &Address,
    ) -> TrieOpResult<()> {
        self.set_account(m, address, &AccountInfo::default())
    }

    /// Looks up a storage slot. Returns `None` when the account or the
    /// slot is absent; callers treat that as the zero value.
    pub fn get_slot<M: NodeManager>(
        &self,
        m: &M,
        address: &Address,
        key: &Key,
    ) -> TrieOpResult<Option<Value>> {
        let storage = match with_account(m, self.root, address, |a| a.storage)? {
            Some(storage) => storage,
            None => return Ok(None),
        };
        get_value(m, storage, key)
    }

    /// Sets a storage slot of an existing account. Setting the zero value
    /// deletes the slot. Setting a slot of an absent account is a no-op;
    /// the outer layer creates accounts before writing their storage.
    pub fn set_slot<M: NodeManager>(
        &mut self,
        m: &M,
        address: &Address,
        key: &Key,
        value: &Value,
    ) -> TrieOpResult<()> {
        let key_path = Path::from_key(&m.hash_key(key));
        self.modify_account(m, address, |m, a| {
            let (new_root, changed) = set_value_intern(m, a.storage, key_path, key, value)?;
            if changed {
                a.storage = new_root;
                a.storage_dirty = true;
            }
            Ok(changed)
        })
    }

    /// Removes every storage slot of an account, releasing the whole
    /// storage trie.
    pub fn clear_storage<M: NodeManager>(
        &mut self,
        m: &M,
        address: &Address,
    ) -> TrieOpResult<()> {
        self.modify_account(m, address, |m, a| {
            if a.storage.is_empty() {
                return Ok(false);
            }
            let old = a.storage;
            a.storage = NodeRef::EMPTY;
            a.storage_dirty = true;
            release_subtree(m, old)?;
            Ok(true)
        })
    }

    /// Refreshes the hashes of all dirty nodes below the root and returns
    /// the root hash, along with the `(path, hash)` records of refreshed
    /// nodes when the configuration asks for them.
    pub fn update_hashes<M: NodeManager>(
        &self,
        m: &M,
    ) -> TrieOpResult<(H256, Vec<NodeHashRecord>)> {
        trie_hashing::update_hashes(m, self.root)
    }

    /// The root hash of an already-hashed trie. Fails with
    /// [`TrieOpError::DirtyTrie`] when any dirty flag is set below the
    /// root.
    pub fn get_hash<M: NodeManager>(&self, m: &M) -> TrieOpResult<H256> {
        trie_hashing::get_hash(m, self.root)
    }

    /// Extracts a witness proof for an account and any number of its
    /// storage slots. The trie must be hashed first.
    pub fn create_account_proof<M: NodeManager>(
        &self,
        m: &M,
        address: &Address,
        keys: &[Key],
    ) -> TrieOpResult<AccountProof> {
        crate::proof::create_account_proof(m, self.root, address, keys)
    }

    /// Recursively marks every node below the root immutable. Later
    /// mutations descending through frozen nodes copy them instead.
    pub fn freeze<M: NodeManager>(&self, m: &M) -> TrieOpResult<()> {
        freeze_subtree(m, self.root)
    }

    /// Walks every reachable node and checks the structural invariants:
    /// branch arity, extension shape, leaf depth and upward dirty-flag
    /// propagation.
    pub fn check_invariants<M: NodeManager>(&self, m: &M) -> TrieOpResult<()> {
        check_invariants_intern(m, self.root, 0, TrieLevel::Account)
    }

    fn modify_account<M, F>(&mut self, m: &M, address: &Address, mut f: F) -> TrieOpResult<()>
    where
        M: NodeManager,
        F: FnMut(&M, &mut crate::node::AccountNode) -> TrieOpResult<bool>,
    {
        let path = Path::from_key(&m.hash_address(address));
        let (root, _) = modify_account_intern(m, self.root, path, address, &mut f)?;
        self.root = root;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
//                              Read paths
// ---------------------------------------------------------------------------

/// Walks to the account leaf for `address` and applies `f` to it under a
/// read handle. `None` when the account does not exist.
pub(crate) fn with_account<M, T>(
    m: &M,
    root: NodeRef,
    address: &Address,
    f: impl FnOnce(&crate::node::AccountNode) -> T,
) -> TrieOpResult<Option<T>>
where
    M: NodeManager,
{
    let mut node_ref = root;
    let mut path = Path::from_key(&m.hash_address(address));

    loop {
        if node_ref.is_empty() {
            return Ok(None);
        }
        let handle = m.get_read(&node_ref)?;

        match handle.get() {
            Node::Empty => return Ok(None),
            Node::Branch(b) => {
                if path.is_empty() {
                    return Ok(None);
                }
                let nib = path.first();
                trace!("Get traversed Branch (nibble: {:x})", nib);
                node_ref = b.children[nib as usize];
                path = path.drop_front(1);
            }
            Node::Extension(e) => {
                trace!("Get traversed Extension (path: {})", e.path);
                if !path.starts_with(&e.path) {
                    return Ok(None);
                }
                path = path.drop_front(e.path.len());
                node_ref = e.next;
            }
            Node::Account(a) => {
                trace!("Get traversed Account leaf ({:?})", a.address);
                let matches = a.path_length as usize == path.len() && a.address == *address;
                return Ok(matches.then(|| f(a)));
            }
            Node::Value(_) => {
                return Err(TrieOpError::InvariantViolation(
                    "value leaf found in the account trie",
                ))
            }
        }
    }
}

fn get_value<M: NodeManager>(m: &M, root: NodeRef, key: &Key) -> TrieOpResult<Option<Value>> {
    let mut node_ref = root;
    let mut path = Path::from_key(&m.hash_key(key));

    loop {
        if node_ref.is_empty() {
            return Ok(None);
        }
        let handle = m.get_read(&node_ref)?;

        match handle.get() {
            Node::Empty => return Ok(None),
            Node::Branch(b) => {
                if path.is_empty() {
                    return Ok(None);
                }
                node_ref = b.children[path.first() as usize];
                path = path.drop_front(1);
            }
            Node::Extension(e) => {
                if !path.starts_with(&e.path) {
                    return Ok(None);
                }
                path = path.drop_front(e.path.len());
                node_ref = e.next;
            }
            Node::Value(v) => {
                let matches = v.path_length as usize == path.len() && v.key == *key;
                return Ok(matches.then_some(v.value));
            }
            Node::Account(_) => {
                return Err(TrieOpError::InvariantViolation(
                    "account leaf found in a storage trie",
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
//                         Mutating recursions
// ---------------------------------------------------------------------------

fn set_account_intern<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    path: Path,
    address: &Address,
    info: &AccountInfo,
) -> TrieOpResult<(NodeRef, bool)> {
    if node_ref.is_empty() {
        if info.is_empty() {
            return Ok((NodeRef::EMPTY, false));
        }
        trace!("Insert traversed Empty; creating account leaf for {:?}", address);
        let (leaf, mut handle) = m.create_leaf_account(*address, path.len() as u8, *info)?;
        m.mark_dirty(&leaf, &mut handle);
        return Ok((leaf, true));
    }

    let handle = m.get_write(&node_ref)?;
    match NodeKind::from(handle.get()) {
        NodeKind::Empty => Err(TrieOpError::InvariantViolation(
            "stored node resolved to the empty variant",
        )),
        NodeKind::Branch => {
            if path.is_empty() {
                return Err(TrieOpError::InvariantViolation(
                    "key exhausted at a branch node",
                ));
            }
            let nib = path.first();
            trace!("Insert traversed Branch (nibble: {:x})", nib);
            let child = branch_ref(&handle)?.children[nib as usize];

            let (new_child, changed) =
                set_account_intern(m, child, path.drop_front(1), address, info)?;
            match changed {
                false => Ok((node_ref, false)),
                true => set_branch_child(m, node_ref, handle, nib, new_child),
            }
        }
        NodeKind::Extension => {
            let (ext_path, next) = {
                let e = extension_ref(&handle)?;
                (e.path, e.next)
            };
            trace!("Insert traversed Extension (path: {})", ext_path);
            let cp = path.common_prefix_len(&ext_path);

            if cp == ext_path.len() {
                let (new_next, changed) =
                    set_account_intern(m, next, path.drop_front(cp), address, info)?;
                return match changed {
                    false => Ok((node_ref, false)),
                    true => set_extension_next(m, node_ref, handle, new_next),
                };
            }

            if info.is_empty() {
                // Nothing to delete along a diverging path.
                return Ok((node_ref, false));
            }
            if cp == path.len() {
                return Err(TrieOpError::InvariantViolation(
                    "key exhausted inside an extension path",
                ));
            }

            let new_leaf = {
                let rest = path.drop_front(cp + 1);
                let (leaf, mut lh) = m.create_leaf_account(*address, rest.len() as u8, *info)?;
                m.mark_dirty(&leaf, &mut lh);
                leaf
            };
            split_extension(m, node_ref, handle, path, cp, ext_path, new_leaf)
        }
        NodeKind::Account => {
            let (leaf_addr, leaf_path_len) = {
                let a = account_ref(&handle)?;
                (a.address, a.path_length)
            };
            if leaf_path_len as usize != path.len() {
                return Err(TrieOpError::InvariantViolation(
                    "account leaf depth does not match the descent key length",
                ));
            }

            if leaf_addr == *address {
                if info.is_empty() {
                    trace!("Deleting account leaf for {:?}", address);
                    let (storage, frozen) = {
                        let a = account_ref(&handle)?;
                        (a.storage, a.frozen)
                    };
                    drop(handle);
                    release_subtree(m, storage)?;
                    if !frozen {
                        m.release(&node_ref)?;
                    }
                    return Ok((NodeRef::EMPTY, true));
                }

                if account_ref(&handle)?.info == *info {
                    return Ok((node_ref, false));
                }
                trace!("Updating account leaf for {:?}", address);
                let (node_ref, mut handle, _) = ensure_mutable(m, node_ref, handle)?;
                {
                    let a = account_mut(&mut handle)?;
                    a.info = *info;
                    a.dirty = true;
                }
                m.mark_dirty(&node_ref, &mut handle);
                return Ok((node_ref, true));
            }

            // Diverging account: split the leaf edge with a branch.
            if info.is_empty() {
                return Ok((node_ref, false));
            }
            trace!("Splitting account leaf ({:?} vs {:?})", leaf_addr, address);

            let leaf_path =
                Path::from_key(&m.hash_address(&leaf_addr)).suffix(leaf_path_len as usize);
            let cp = path.common_prefix_len(&leaf_path);

            let (existing, mut eh, _) = ensure_mutable(m, node_ref, handle)?;
            {
                let a = account_mut(&mut eh)?;
                a.path_length = (path.len() - cp - 1) as u8;
                a.dirty = true;
            }
            m.mark_dirty(&existing, &mut eh);
            drop(eh);

            let new_leaf = {
                let rest = path.drop_front(cp + 1);
                let (leaf, mut lh) = m.create_leaf_account(*address, rest.len() as u8, *info)?;
                m.mark_dirty(&leaf, &mut lh);
                leaf
            };

            let branched =
                branch_over_two(m, leaf_path.nibble_at(cp), existing, path.nibble_at(cp), new_leaf)?;
            Ok((extension_above(m, path.head(cp), branched)?, true))
        }
        NodeKind::Value => Err(TrieOpError::InvariantViolation(
            "value leaf found in the account trie",
        )),
    }
}

fn set_value_intern<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    path: Path,
    key: &Key,
    value: &Value,
) -> TrieOpResult<(NodeRef, bool)> {
    if node_ref.is_empty() {
        if value.is_zero() {
            return Ok((NodeRef::EMPTY, false));
        }
        let (leaf, mut handle) = m.create_leaf_value(*key, path.len() as u8, *value)?;
        m.mark_dirty(&leaf, &mut handle);
        return Ok((leaf, true));
    }

    let handle = m.get_write(&node_ref)?;
    match NodeKind::from(handle.get()) {
        NodeKind::Empty => Err(TrieOpError::InvariantViolation(
            "stored node resolved to the empty variant",
        )),
        NodeKind::Branch => {
            if path.is_empty() {
                return Err(TrieOpError::InvariantViolation(
                    "key exhausted at a branch node",
                ));
            }
            let nib = path.first();
            let child = branch_ref(&handle)?.children[nib as usize];

            let (new_child, changed) =
                set_value_intern(m, child, path.drop_front(1), key, value)?;
            match changed {
                false => Ok((node_ref, false)),
                true => set_branch_child(m, node_ref, handle, nib, new_child),
            }
        }
        NodeKind::Extension => {
            let (ext_path, next) = {
                let e = extension_ref(&handle)?;
                (e.path, e.next)
            };
            let cp = path.common_prefix_len(&ext_path);

            if cp == ext_path.len() {
                let (new_next, changed) =
                    set_value_intern(m, next, path.drop_front(cp), key, value)?;
                return match changed {
                    false => Ok((node_ref, false)),
                    true => set_extension_next(m, node_ref, handle, new_next),
                };
            }

            if value.is_zero() {
                return Ok((node_ref, false));
            }
            if cp == path.len() {
                return Err(TrieOpError::InvariantViolation(
                    "key exhausted inside an extension path",
                ));
            }

            let new_leaf = {
                let rest = path.drop_front(cp + 1);
                let (leaf, mut lh) = m.create_leaf_value(*key, rest.len() as u8, *value)?;
                m.mark_dirty(&leaf, &mut lh);
                leaf
            };
            split_extension(m, node_ref, handle, path, cp, ext_path, new_leaf)
        }
        NodeKind::Value => {
            let (leaf_key, leaf_path_len) = match handle.get() {
                Node::Value(v) => (v.key, v.path_length),
                _ => unreachable!(),
            };
            if leaf_path_len as usize != path.len() {
                return Err(TrieOpError::InvariantViolation(
                    "value leaf depth does not match the descent key length",
                ));
            }

            if leaf_key == *key {
                if value.is_zero() {
                    trace!("Deleting value leaf for key {:?}", key);
                    let frozen = handle.get().is_frozen();
                    drop(handle);
                    if !frozen {
                        m.release(&node_ref)?;
                    }
                    return Ok((NodeRef::EMPTY, true));
                }

                let same = match handle.get() {
                    Node::Value(v) => v.value == *value,
                    _ => unreachable!(),
                };
                if same {
                    return Ok((node_ref, false));
                }
                let (node_ref, mut handle, _) = ensure_mutable(m, node_ref, handle)?;
                match handle.get_mut() {
                    Node::Value(v) => {
                        v.value = *value;
                        v.dirty = true;
                    }
                    _ => unreachable!(),
                }
                m.mark_dirty(&node_ref, &mut handle);
                return Ok((node_ref, true));
            }

            if value.is_zero() {
                return Ok((node_ref, false));
            }

            let leaf_path = Path::from_key(&m.hash_key(&leaf_key)).suffix(leaf_path_len as usize);
            let cp = path.common_prefix_len(&leaf_path);

            let (existing, mut eh, _) = ensure_mutable(m, node_ref, handle)?;
            match eh.get_mut() {
                Node::Value(v) => {
                    v.path_length = (path.len() - cp - 1) as u8;
                    v.dirty = true;
                }
                _ => unreachable!(),
            }
            m.mark_dirty(&existing, &mut eh);
            drop(eh);

            let new_leaf = {
                let rest = path.drop_front(cp + 1);
                let (leaf, mut lh) = m.create_leaf_value(*key, rest.len() as u8, *value)?;
                m.mark_dirty(&leaf, &mut lh);
                leaf
            };

            let branched =
                branch_over_two(m, leaf_path.nibble_at(cp), existing, path.nibble_at(cp), new_leaf)?;
            Ok((extension_above(m, path.head(cp), branched)?, true))
        }
        NodeKind::Account => Err(TrieOpError::InvariantViolation(
            "account leaf found in a storage trie",
        )),
    }
}

fn modify_account_intern<M, F>(
    m: &M,
    node_ref: NodeRef,
    path: Path,
    address: &Address,
    f: &mut F,
) -> TrieOpResult<(NodeRef, bool)>
where
    M: NodeManager,
    F: FnMut(&M, &mut crate::node::AccountNode) -> TrieOpResult<bool>,
{
    if node_ref.is_empty() {
        return Ok((NodeRef::EMPTY, false));
    }

    let handle = m.get_write(&node_ref)?;
    match NodeKind::from(handle.get()) {
        NodeKind::Empty => Err(TrieOpError::InvariantViolation(
            "stored node resolved to the empty variant",
        )),
        NodeKind::Branch => {
            if path.is_empty() {
                return Err(TrieOpError::InvariantViolation(
                    "key exhausted at a branch node",
                ));
            }
            let nib = path.first();
            let child = branch_ref(&handle)?.children[nib as usize];

            let (new_child, changed) =
                modify_account_intern(m, child, path.drop_front(1), address, f)?;
            match changed {
                false => Ok((node_ref, false)),
                true => set_branch_child(m, node_ref, handle, nib, new_child),
            }
        }
        NodeKind::Extension => {
            let (ext_path, next) = {
                let e = extension_ref(&handle)?;
                (e.path, e.next)
            };
            let cp = path.common_prefix_len(&ext_path);
            if cp != ext_path.len() {
                return Ok((node_ref, false));
            }

            let (new_next, changed) =
                modify_account_intern(m, next, path.drop_front(cp), address, f)?;
            match changed {
                false => Ok((node_ref, false)),
                true => set_extension_next(m, node_ref, handle, new_next),
            }
        }
        NodeKind::Account => {
            let matches = {
                let a = account_ref(&handle)?;
                a.path_length as usize == path.len() && a.address == *address
            };
            if !matches {
                return Ok((node_ref, false));
            }

            let (new_ref, mut handle, copied) = ensure_mutable(m, node_ref, handle)?;
            let changed = f(m, account_mut(&mut handle)?)?;
            if !changed {
                // The closure touched nothing; a copy made up front for a
                // frozen leaf is surplus.
                if copied {
                    drop(handle);
                    m.release(&new_ref)?;
                }
                return Ok((node_ref, false));
            }

            account_mut(&mut handle)?.dirty = true;
            m.mark_dirty(&new_ref, &mut handle);
            Ok((new_ref, true))
        }
        NodeKind::Value => Err(TrieOpError::InvariantViolation(
            "value leaf found in the account trie",
        )),
    }
}

// ---------------------------------------------------------------------------
//                       Structural rewrite helpers
// ---------------------------------------------------------------------------

/// Rewrites one child slot of a branch and restores the branch invariants:
/// a branch left with a single child collapses into its successor.
fn set_branch_child<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    handle: WriteHandle,
    nib: Nibble,
    new_child: NodeRef,
) -> TrieOpResult<(NodeRef, bool)> {
    let (node_ref, mut handle, _) = ensure_mutable(m, node_ref, handle)?;

    let remaining = {
        let b = branch_mut(&mut handle)?;
        b.children[nib as usize] = new_child;
        b.mark_child_dirty(nib);
        match new_child.is_empty() {
            true => b.non_empty_children(),
            false => usize::MAX,
        }
    };
    m.mark_dirty(&node_ref, &mut handle);

    match remaining {
        0 => Err(TrieOpError::InvariantViolation(
            "branch had fewer than two children before the deletion",
        )),
        1 => {
            let (survivor_nib, survivor) = branch_ref(&handle)?.single_child().ok_or(
                TrieOpError::InvariantViolation("branch child count changed under a write handle"),
            )?;
            drop(handle);

            trace!(
                "Branch collapsed; absorbing nibble {:x} into the survivor",
                survivor_nib
            );
            let collapsed = absorb_branch_nibble(m, survivor_nib, survivor)?;
            // `ensure_mutable` above guarantees the branch is not frozen.
            m.release(&node_ref)?;
            Ok((collapsed, true))
        }
        _ => Ok((node_ref, true)),
    }
}

/// Absorbs a collapsing branch's last nibble into its surviving child.
fn absorb_branch_nibble<M: NodeManager>(
    m: &M,
    nib: Nibble,
    survivor: NodeRef,
) -> TrieOpResult<NodeRef> {
    let handle = m.get_write(&survivor)?;
    match NodeKind::from(handle.get()) {
        NodeKind::Branch => {
            // A fresh one-nibble extension keeps the survivor in place.
            drop(handle);
            let (ext, mut eh) = m.create_extension(Path::from_nibble(nib), survivor)?;
            m.mark_dirty(&ext, &mut eh);
            Ok(ext)
        }
        NodeKind::Extension => {
            let (survivor, mut handle, _) = ensure_mutable(m, survivor, handle)?;
            {
                let e = extension_mut(&mut handle)?;
                e.path = e.path.prepended(nib);
                e.dirty = true;
            }
            m.mark_dirty(&survivor, &mut handle);
            Ok(survivor)
        }
        NodeKind::Account | NodeKind::Value => {
            let (survivor, mut handle, _) = ensure_mutable(m, survivor, handle)?;
            match handle.get_mut() {
                Node::Account(a) => {
                    a.path_length += 1;
                    a.dirty = true;
                }
                Node::Value(v) => {
                    v.path_length += 1;
                    v.dirty = true;
                }
                _ => unreachable!(),
            }
            m.mark_dirty(&survivor, &mut handle);
            Ok(survivor)
        }
        NodeKind::Empty => Err(TrieOpError::InvariantViolation(
            "surviving branch child resolved to the empty variant",
        )),
    }
}

/// Rewrites the successor of an extension and restores I2: a successor
/// that collapsed into an extension is merged, one that collapsed into a
/// leaf absorbs the extension's path.
fn set_extension_next<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    handle: WriteHandle,
    new_next: NodeRef,
) -> TrieOpResult<(NodeRef, bool)> {
    if new_next.is_empty() {
        return Err(TrieOpError::InvariantViolation(
            "extension successor vanished during a mutation",
        ));
    }

    let next_handle = m.get_write(&new_next)?;
    match NodeKind::from(next_handle.get()) {
        NodeKind::Branch => {
            drop(next_handle);
            let (node_ref, mut handle, _) = ensure_mutable(m, node_ref, handle)?;
            {
                let e = extension_mut(&mut handle)?;
                e.next = new_next;
                e.next_dirty = true;
                e.dirty = true;
            }
            m.mark_dirty(&node_ref, &mut handle);
            Ok((node_ref, true))
        }
        NodeKind::Extension => {
            // Merge adjacent extensions.
            let (tail_path, tail_next, tail_frozen) = {
                let e = extension_ref(&next_handle)?;
                (e.path, e.next, e.frozen)
            };
            drop(next_handle);

            let (node_ref, mut handle, _) = ensure_mutable(m, node_ref, handle)?;
            {
                let e = extension_mut(&mut handle)?;
                e.path = e.path.join(&tail_path);
                e.next = tail_next;
                e.next_dirty = true;
                e.dirty = true;
            }
            m.mark_dirty(&node_ref, &mut handle);
            if !tail_frozen {
                m.release(&new_next)?;
            }
            Ok((node_ref, true))
        }
        NodeKind::Account | NodeKind::Value => {
            // The extension's whole path folds into the leaf edge.
            let ext_path_len = extension_ref(&handle)?.path.len() as u8;
            let ext_frozen = handle.get().is_frozen();
            drop(handle);

            let (leaf, mut lh, _) = ensure_mutable(m, new_next, next_handle)?;
            match lh.get_mut() {
                Node::Account(a) => {
                    a.path_length += ext_path_len;
                    a.dirty = true;
                }
                Node::Value(v) => {
                    v.path_length += ext_path_len;
                    v.dirty = true;
                }
                _ => unreachable!(),
            }
            m.mark_dirty(&leaf, &mut lh);
            drop(lh);

            if !ext_frozen {
                m.release(&node_ref)?;
            }
            Ok((leaf, true))
        }
        NodeKind::Empty => Err(TrieOpError::InvariantViolation(
            "extension successor resolved to the empty variant",
        )),
    }
}

/// Splits an extension whose path diverges from the descent key at `cp`
/// nibbles: a branch takes over at the divergence, with the shortened
/// extension (or its bare successor) on one side and `new_leaf` on the
/// other, optionally below a shortened prefix extension.
fn split_extension<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    handle: WriteHandle,
    path: Path,
    cp: usize,
    ext_path: Path,
    new_leaf: NodeRef,
) -> TrieOpResult<(NodeRef, bool)> {
    let remainder = ext_path.drop_front(cp + 1);
    let frozen = handle.get().is_frozen();

    let existing = match remainder.is_empty() {
        true => {
            // The branch covers the extension's last nibble; its successor
            // moves up and the extension node is retired.
            let next = extension_ref(&handle)?.next;
            drop(handle);
            if !frozen {
                m.release(&node_ref)?;
            }
            next
        }
        false => {
            let (shortened, mut handle, _) = ensure_mutable(m, node_ref, handle)?;
            {
                let e = extension_mut(&mut handle)?;
                e.path = remainder;
                e.dirty = true;
            }
            m.mark_dirty(&shortened, &mut handle);
            shortened
        }
    };

    let branched = branch_over_two(
        m,
        ext_path.nibble_at(cp),
        existing,
        path.nibble_at(cp),
        new_leaf,
    )?;
    Ok((extension_above(m, path.head(cp), branched)?, true))
}

/// Creates a branch holding exactly the two given children.
fn branch_over_two<M: NodeManager>(
    m: &M,
    nib_a: Nibble,
    child_a: NodeRef,
    nib_b: Nibble,
    child_b: NodeRef,
) -> TrieOpResult<NodeRef> {
    let (branch, mut handle) = m.create_branch()?;
    {
        let b = branch_mut(&mut handle)?;
        b.children[nib_a as usize] = child_a;
        b.mark_child_dirty(nib_a);
        b.children[nib_b as usize] = child_b;
        b.mark_child_dirty(nib_b);
    }
    m.mark_dirty(&branch, &mut handle);
    Ok(branch)
}

/// Places an extension with the given prefix above a node, or returns the
/// node itself for an empty prefix.
fn extension_above<M: NodeManager>(
    m: &M,
    prefix: Path,
    below: NodeRef,
) -> TrieOpResult<NodeRef> {
    if prefix.is_empty() {
        return Ok(below);
    }
    let (ext, mut handle) = m.create_extension(prefix, below)?;
    m.mark_dirty(&ext, &mut handle);
    Ok(ext)
}

/// Returns a reference and handle under which the node may be mutated:
/// the node itself, or a fresh unfrozen copy when the node is frozen.
fn ensure_mutable<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    handle: WriteHandle,
) -> TrieOpResult<(NodeRef, WriteHandle, bool)> {
    if !handle.get().is_frozen() {
        return Ok((node_ref, handle, false));
    }

    let mut copy = handle.get().clone();
    copy.set_frozen(false);
    drop(handle);

    let (copy_ref, copy_handle) = m.create(copy)?;
    trace!("Copied frozen node {:?} to {:?}", node_ref, copy_ref);
    Ok((copy_ref, copy_handle, true))
}

// ---------------------------------------------------------------------------
//                        Subtree-wide operations
// ---------------------------------------------------------------------------

/// Releases every non-frozen node reachable from `node_ref`. Frozen
/// subtrees stay behind for the snapshots that froze them.
pub(crate) fn release_subtree<M: NodeManager>(m: &M, node_ref: NodeRef) -> TrieOpResult<()> {
    if node_ref.is_empty() {
        return Ok(());
    }

    let handle = m.get_read(&node_ref)?;
    if handle.get().is_frozen() {
        return Ok(());
    }

    let mut children = Vec::new();
    match handle.get() {
        Node::Empty => {}
        Node::Branch(b) => children.extend(b.children.iter().filter(|c| !c.is_empty())),
        Node::Extension(e) => children.push(e.next),
        Node::Account(a) => children.push(a.storage),
        Node::Value(_) => {}
    }
    drop(handle);

    for child in children {
        release_subtree(m, child)?;
    }
    m.release(&node_ref)
}

fn freeze_subtree<M: NodeManager>(m: &M, node_ref: NodeRef) -> TrieOpResult<()> {
    if node_ref.is_empty() {
        return Ok(());
    }

    let mut handle = m.get_write(&node_ref)?;
    if handle.get().is_frozen() {
        // Freezing is recursive and sticky, so the subtree is done too.
        return Ok(());
    }
    handle.get_mut().set_frozen(true);
    m.mark_dirty(&node_ref, &mut handle);

    let mut children = Vec::new();
    match handle.get() {
        Node::Empty => {}
        Node::Branch(b) => children.extend(b.children.iter().filter(|c| !c.is_empty())),
        Node::Extension(e) => children.push(e.next),
        Node::Account(a) => children.push(a.storage),
        Node::Value(_) => {}
    }
    drop(handle);

    for child in children {
        freeze_subtree(m, child)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
//                          Invariant checking
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Eq, PartialEq)]
enum TrieLevel {
    Account,
    Storage,
}

/// Walks the trie and checks I1 (branch arity), I2/I3 (extension shape),
/// I4/I5 (leaf depth per trie level) and I7 (dirty flags propagate to the
/// root). Returns the dirtiness of the visited node.
fn check_invariants_intern<M: NodeManager>(
    m: &M,
    node_ref: NodeRef,
    depth: usize,
    level: TrieLevel,
) -> TrieOpResult<()> {
    if node_ref.is_empty() {
        return Ok(());
    }
    let handle = m.get_read(&node_ref)?;

    match handle.get() {
        Node::Empty => Err(TrieOpError::InvariantViolation(
            "stored node resolved to the empty variant",
        )),
        Node::Branch(b) => {
            if b.non_empty_children() < 2 {
                return Err(TrieOpError::InvariantViolation(
                    "branch with fewer than two children",
                ));
            }
            let children = b.children;
            for (i, child) in children.iter().enumerate() {
                if child.is_empty() {
                    continue;
                }
                let child_dirty = {
                    let ch = m.get_read(child)?;
                    if let Node::Extension(e) = ch.get() {
                        if e.path.is_empty() {
                            return Err(TrieOpError::InvariantViolation(
                                "branch child is an extension with an empty path",
                            ));
                        }
                    }
                    ch.get().has_dirty_flags()
                };
                if child_dirty && !(b.is_child_dirty(i as u8) && b.dirty) {
                    return Err(TrieOpError::InvariantViolation(
                        "dirty child below a clean branch",
                    ));
                }
            }
            drop(handle);
            for child in children.iter().filter(|c| !c.is_empty()) {
                check_invariants_intern(m, *child, depth + 1, level)?;
            }
            Ok(())
        }
        Node::Extension(e) => {
            if e.path.is_empty() {
                return Err(TrieOpError::InvariantViolation("extension with empty path"));
            }
            let (next, path_len) = (e.next, e.path.len());
            let next_dirty_flag = e.next_dirty;
            let self_dirty = e.dirty;
            drop(handle);

            let nh = m.get_read(&next)?;
            match nh.get() {
                Node::Extension(_) => {
                    return Err(TrieOpError::InvariantViolation(
                        "extension points at another extension",
                    ))
                }
                Node::Branch(_) => {}
                _ => {
                    return Err(TrieOpError::InvariantViolation(
                        "extension successor is not a branch",
                    ))
                }
            }
            if nh.get().has_dirty_flags() && !(next_dirty_flag && self_dirty) {
                return Err(TrieOpError::InvariantViolation(
                    "dirty successor below a clean extension",
                ));
            }
            drop(nh);

            check_invariants_intern(m, next, depth + path_len, level)
        }
        Node::Account(a) => {
            if level != TrieLevel::Account {
                return Err(TrieOpError::InvariantViolation(
                    "account leaf found in a storage trie",
                ));
            }
            if depth + a.path_length as usize != crate::nibbles::MAX_PATH_LEN {
                return Err(TrieOpError::InvariantViolation(
                    "account leaf depth plus path length is not the key length",
                ));
            }
            let storage = a.storage;
            let storage_dirty_flag = a.storage_dirty;
            let self_dirty = a.dirty;
            drop(handle);

            if !storage.is_empty() {
                let sh = m.get_read(&storage)?;
                if sh.get().has_dirty_flags() && !(storage_dirty_flag && self_dirty) {
                    return Err(TrieOpError::InvariantViolation(
                        "dirty storage root below a clean account leaf",
                    ));
                }
            }
            check_invariants_intern(m, storage, 0, TrieLevel::Storage)
        }
        Node::Value(v) => {
            if level != TrieLevel::Storage {
                return Err(TrieOpError::InvariantViolation(
                    "value leaf found in the account trie",
                ));
            }
            if depth + v.path_length as usize != crate::nibbles::MAX_PATH_LEN {
                return Err(TrieOpError::InvariantViolation(
                    "value leaf depth plus path length is not the key length",
                ));
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
//                          Variant accessors
// ---------------------------------------------------------------------------

pub(crate) fn branch_ref(handle: &WriteHandle) -> TrieOpResult<&crate::node::BranchNode> {
    handle.get().as_branch().ok_or(TrieOpError::InvariantViolation(
        "expected a branch node",
    ))
}

pub(crate) fn branch_mut(handle: &mut WriteHandle) -> TrieOpResult<&mut crate::node::BranchNode> {
    handle
        .get_mut()
        .as_branch_mut()
        .ok_or(TrieOpError::InvariantViolation("expected a branch node"))
}

pub(crate) fn extension_ref(handle: &WriteHandle) -> TrieOpResult<&crate::node::ExtensionNode> {
    match handle.get() {
        Node::Extension(e) => Ok(e),
        _ => Err(TrieOpError::InvariantViolation("expected an extension node")),
    }
}

pub(crate) fn extension_mut(handle: &mut WriteHandle) -> TrieOpResult<&mut crate::node::ExtensionNode> {
    handle
        .get_mut()
        .as_extension_mut()
        .ok_or(TrieOpError::InvariantViolation("expected an extension node"))
}

pub(crate) fn account_ref(handle: &WriteHandle) -> TrieOpResult<&crate::node::AccountNode> {
    handle.get().as_account().ok_or(TrieOpError::InvariantViolation(
        "expected an account leaf",
    ))
}

pub(crate) fn account_mut(handle: &mut WriteHandle) -> TrieOpResult<&mut crate::node::AccountNode> {
    handle
        .get_mut()
        .as_account_mut()
        .ok_or(TrieOpError::InvariantViolation("expected an account leaf"))
}
