pub mod archive;
mod cache;
pub mod error;
mod forest;
mod hasher;
mod hashstore;
pub mod live;
pub mod nibbles;
mod node;
pub mod node_id;
mod paged;
mod pool;
pub mod types;
pub mod update;
pub mod witness;

use std::time::Duration;

use arbor_rlp::constants::RLP_NULL;
use ethereum_types::H256;
use lazy_static::lazy_static;

pub use archive::ArchiveTrie;
pub use error::StoreError;
pub use forest::Forest;
pub use live::LiveTrie;
pub use nibbles::Nibbles;
pub use node_id::NodeId;
pub use types::{AccountInfo, Address, Balance, Hash, Key, Nonce, Value};
pub use update::Update;
pub use witness::WitnessProof;

lazy_static! {
    /// Hash of an empty trie, keccak of the RLP of the empty string.
    pub static ref EMPTY_TRIE_HASH: H256 = types::keccak(&[RLP_NULL]);
}

/// The hashing scheme of a forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasherKind {
    /// SHA-256 over tagged node fields; cheap, not Ethereum-compatible.
    Direct,
    /// Ethereum's RLP + Keccak-256 Merkle Patricia Trie hashing.
    Mpt,
}

/// Whether an instance keeps only the mutable head or the whole block history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Live,
    Archive,
}

/// Open-time configuration of a forest.
#[derive(Debug, Clone)]
pub struct MptConfig {
    /// Navigate by `keccak(address)` / `keccak(key)` instead of the raw bytes.
    /// Required for Ethereum compatibility.
    pub hashed_paths: bool,
    /// Leaves carry the length of their unconsumed path, as hex-prefix
    /// encoding needs. Required for Ethereum compatibility.
    pub track_suffix_len: bool,
    pub hasher: HasherKind,
    /// Node cache capacity in entries; also bounds the hash read cache.
    pub node_cache_capacity: usize,
    /// Page cache capacity per typed pool, in pages.
    pub page_cache_pages: usize,
    /// Background flusher period; zero disables the flusher.
    pub flush_period: Duration,
}

impl MptConfig {
    /// The configuration producing Ethereum-identical state roots.
    pub fn ethereum() -> Self {
        Self {
            hashed_paths: true,
            track_suffix_len: true,
            hasher: HasherKind::Mpt,
            node_cache_capacity: 100_000,
            page_cache_pages: 1024,
            flush_period: Duration::from_secs(1),
        }
    }

    /// Internal configuration: raw paths and the direct hasher.
    pub fn direct() -> Self {
        Self {
            hashed_paths: false,
            track_suffix_len: false,
            hasher: HasherKind::Direct,
            ..Self::ethereum()
        }
    }
}

impl Default for MptConfig {
    fn default() -> Self {
        Self::ethereum()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn empty_trie_hash_matches_ethereum() {
        assert_eq!(
            EMPTY_TRIE_HASH.0,
            hex!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")
        );
    }
}
