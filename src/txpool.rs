//! The pending-transaction pool: a hash-deduplicated set with no ordering
//! or eviction policy of its own. Block producers layer selection on top;
//! the chain observer evicts transactions confirmed by accepted blocks.

use std::collections::HashMap;

use ethereum_types::H256;
use parking_lot::RwLock;

use crate::errors::ValidationError;
use crate::types::{Block, Transaction};

#[derive(Default)]
pub struct TxPool {
    pending: RwLock<HashMap<H256, Transaction>>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the transaction; duplicates are silently absorbed. Returns the
    /// transaction's hash.
    pub fn add(&self, tx: Transaction) -> H256 {
        let hash = tx.hash();
        self.pending.write().entry(hash).or_insert(tx);
        hash
    }

    pub fn get(&self, hash: H256) -> Option<Transaction> {
        self.pending.read().get(&hash).cloned()
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        self.pending.read().values().cloned().collect()
    }

    pub fn remove(&self, hash: H256) {
        self.pending.write().remove(&hash);
    }

    pub fn remove_many(&self, hashes: &[H256]) {
        let mut pending = self.pending.write();
        for hash in hashes {
            pending.remove(hash);
        }
    }

    /// Drop every transaction confirmed by `block`.
    pub fn evict_confirmed(&self, block: &Block) {
        let hashes: Vec<H256> = block.transactions.iter().map(Transaction::hash).collect();
        self.remove_many(&hashes);
    }

    pub fn size(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }

    /// Structural admission check; stateful checks live in the validator.
    pub fn validate(&self, tx: &Transaction) -> Result<(), ValidationError> {
        tx.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Address;
    use ethereum_types::U256;

    fn tx(nonce: u64) -> Transaction {
        Transaction::transfer(
            nonce,
            U256::one(),
            21_000,
            Address::repeat_byte(0x02),
            U256::from(5u64),
            Vec::new(),
        )
    }

    #[test]
    fn duplicate_adds_collapse() {
        let pool = TxPool::new();
        pool.add(tx(1));
        pool.add(tx(1));
        assert_eq!(pool.size(), 1);
        pool.add(tx(2));
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn get_and_remove_by_hash() {
        let pool = TxPool::new();
        let hash = pool.add(tx(1));
        assert_eq!(pool.get(hash).expect("present").nonce, 1);
        pool.remove(hash);
        assert!(pool.get(hash).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn remove_many_clears_listed_hashes() {
        let pool = TxPool::new();
        let first = pool.add(tx(1));
        let second = pool.add(tx(2));
        pool.add(tx(3));
        pool.remove_many(&[first, second]);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn confirmed_transactions_are_evicted() {
        let pool = TxPool::new();
        pool.add(tx(1));
        pool.add(tx(2));
        let mut block = Block::genesis();
        block.transactions.push(tx(1));
        pool.evict_confirmed(&block);
        assert_eq!(pool.size(), 1);
        assert!(pool.get(tx(2).hash()).is_some());
    }

    #[test]
    fn zero_gas_transactions_fail_validation() {
        let pool = TxPool::new();
        let mut bad = tx(1);
        bad.gas = 0;
        assert!(pool.validate(&bad).is_err());
    }
}
