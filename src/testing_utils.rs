use ethereum_types::{H256, U256};

use crate::node::{AccountInfo, Address, Key, Value};

pub(crate) fn common_setup() {
    // Try init since multiple tests calling `init` will cause an error.
    let _ = pretty_env_logger::try_init();
}

/// A test address with the distinguishing bytes leading, so small values
/// diverge in the first nibbles under identity key hashing.
pub(crate) fn addr(n: u64) -> Address {
    let mut a = Address::zero();
    a.0[..8].copy_from_slice(&n.to_le_bytes());
    a
}

/// Non-empty account info derived from a seed. Do not call with zero.
pub(crate) fn info(n: u64) -> AccountInfo {
    assert_ne!(n, 0, "info(0) would describe a non-existing account");
    AccountInfo {
        nonce: n,
        balance: U256::from(n) * 1000,
        code_hash: H256::zero(),
    }
}

pub(crate) fn key(n: u64) -> Key {
    H256::from_low_u64_be(n)
}

pub(crate) fn value(n: u64) -> Value {
    H256::from_low_u64_be(n)
}
