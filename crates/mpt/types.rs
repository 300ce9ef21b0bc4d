use ethereum_types::{H160, H256, U256};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// 20-byte account address.
pub type Address = H160;
/// 32-byte storage slot key.
pub type Key = H256;
/// 32-byte storage slot value.
pub type Value = H256;
/// 32-byte node or code hash.
pub type Hash = H256;
/// Account transaction counter.
pub type Nonce = u64;
/// 256-bit account balance.
pub type Balance = U256;

lazy_static! {
    /// Hash of the empty byte string, the code hash of accounts without code.
    pub static ref EMPTY_CODE_HASH: H256 = keccak(&[]);
}

pub fn keccak(data: &[u8]) -> H256 {
    H256::from_slice(Keccak256::digest(data).as_slice())
}

/// The balance, nonce and code hash of an account.
///
/// An account with an all-zero info is considered non-existent; writing such
/// an info deletes the account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub nonce: Nonce,
    pub balance: Balance,
    pub code_hash: Hash,
}

impl AccountInfo {
    pub fn is_empty(&self) -> bool {
        self.nonce == 0
            && self.balance.is_zero()
            && (self.code_hash.is_zero() || self.code_hash == *EMPTY_CODE_HASH)
    }
}
