//! Block and header types.
//!
//! The header hash is the Keccak-256 digest of the header's canonical JSON
//! encoding; two structurally equal headers therefore hash equal. The mining
//! pre-image (`pow_bytes`) is the same encoding with the solution fields
//! (`mixDigest`, `nonce`) zeroed, so a solved header commits to the exact
//! bytes the miner searched over.

use ethereum_types::{H256, U256};
use serde::{Deserialize, Serialize};

use super::{hex_bytes, Address, Transaction};
use crate::crypto::keccak256;
use crate::params;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub uncle_hash: H256,
    pub coinbase: Address,
    pub state_root: H256,
    pub tx_root: H256,
    pub receipt_root: H256,
    #[serde(with = "hex_bytes")]
    pub bloom: Vec<u8>,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub time: u64,
    #[serde(with = "hex_bytes")]
    pub extra: Vec<u8>,
    pub mix_digest: H256,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("header serialization is infallible")
    }

    pub fn hash(&self) -> H256 {
        keccak256(&self.canonical_bytes())
    }

    /// Header encoding with the solution fields zeroed, the input to
    /// hashimoto for both mining and verification.
    pub fn pow_bytes(&self) -> Vec<u8> {
        let mut sealed = self.clone();
        sealed.mix_digest = H256::zero();
        sealed.nonce = 0;
        sealed.canonical_bytes()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
}

impl Block {
    /// Assemble a block, computing the transaction and uncle commitments.
    pub fn new(
        parent_hash: H256,
        coinbase: Address,
        state_root: H256,
        difficulty: U256,
        number: u64,
        gas_limit: u64,
        gas_used: u64,
        time: u64,
        extra: Vec<u8>,
        transactions: Vec<Transaction>,
        uncles: Vec<BlockHeader>,
    ) -> Self {
        let header = BlockHeader {
            parent_hash,
            uncle_hash: uncle_root(&uncles),
            coinbase,
            state_root,
            tx_root: tx_root(&transactions),
            receipt_root: H256::zero(),
            bloom: vec![0u8; 256],
            difficulty,
            number,
            gas_limit,
            gas_used,
            time,
            extra,
            mix_digest: H256::zero(),
            nonce: 0,
        };
        Self {
            header,
            transactions,
            uncles,
        }
    }

    pub fn genesis() -> Self {
        Self::new(
            H256::zero(),
            Address::zero(),
            H256::zero(),
            U256::from(params::INITIAL_DIFFICULTY),
            0,
            params::GENESIS_GAS_LIMIT,
            0,
            params::GENESIS_TIME,
            params::GENESIS_EXTRA.to_vec(),
            Vec::new(),
            Vec::new(),
        )
    }

    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> H256 {
        self.header.parent_hash
    }

    pub fn difficulty(&self) -> U256 {
        self.header.difficulty
    }
}

/// Commitment over the transaction list; the empty list commits to the zero
/// digest.
pub fn tx_root(transactions: &[Transaction]) -> H256 {
    if transactions.is_empty() {
        return H256::zero();
    }
    let encoded = serde_json::to_vec(transactions).expect("transaction serialization is infallible");
    keccak256(&encoded)
}

/// Commitment over the uncle list; the empty list commits to the zero digest.
pub fn uncle_root(uncles: &[BlockHeader]) -> H256 {
    if uncles.is_empty() {
        return H256::zero();
    }
    let encoded = serde_json::to_vec(uncles).expect("header serialization is infallible");
    keccak256(&encoded)
}
