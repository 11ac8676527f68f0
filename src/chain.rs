//! The block store: hash- and number-indexed blocks with head tracking.
//!
//! Invariants:
//!
//! * Every stored block other than genesis has its parent stored, and its
//!   number is the parent's plus one.
//! * Each stored block carries its cumulative total difficulty; the head is
//!   the stored block with the greatest total difficulty reachable from
//!   genesis.
//!
//! Readers take the shared lock; `add_block` serialises writers, so readers
//! observe either the pre- or post-insert chain, never a torn view. Head
//! changes are announced on a watch channel consumed by the block
//! broadcaster and the mining-job refresher.

use std::collections::HashMap;

use ethereum_types::{H256, U256};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::errors::{ChainError, ChainResult};
use crate::types::Block;

struct StoredBlock {
    block: Block,
    total_difficulty: U256,
}

struct ChainInner {
    blocks: HashMap<H256, StoredBlock>,
    by_number: HashMap<u64, H256>,
    genesis_hash: H256,
    head_hash: H256,
}

pub struct Chain {
    inner: RwLock<ChainInner>,
    head_tx: watch::Sender<H256>,
}

impl Chain {
    /// Build a chain seeded with `genesis` (or the default genesis block).
    pub fn new(genesis: Option<Block>) -> Self {
        let genesis = genesis.unwrap_or_else(Block::genesis);
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(
            hash,
            StoredBlock {
                total_difficulty: genesis.difficulty(),
                block: genesis,
            },
        );
        let mut by_number = HashMap::new();
        by_number.insert(0, hash);
        let (head_tx, _) = watch::channel(hash);
        Self {
            inner: RwLock::new(ChainInner {
                blocks,
                by_number,
                genesis_hash: hash,
                head_hash: hash,
            }),
            head_tx,
        }
    }

    pub fn genesis(&self) -> Block {
        let inner = self.inner.read();
        inner.blocks[&inner.genesis_hash].block.clone()
    }

    pub fn current_head(&self) -> Block {
        let inner = self.inner.read();
        inner.blocks[&inner.head_hash].block.clone()
    }

    pub fn head_number(&self) -> u64 {
        let inner = self.inner.read();
        inner.blocks[&inner.head_hash].block.number()
    }

    pub fn get_by_hash(&self, hash: H256) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .get(&hash)
            .map(|stored| stored.block.clone())
    }

    pub fn get_by_number(&self, number: u64) -> Option<Block> {
        let inner = self.inner.read();
        inner
            .by_number
            .get(&number)
            .and_then(|hash| inner.blocks.get(hash))
            .map(|stored| stored.block.clone())
    }

    pub fn total_difficulty(&self, hash: H256) -> Option<U256> {
        self.inner
            .read()
            .blocks
            .get(&hash)
            .map(|stored| stored.total_difficulty)
    }

    pub fn head_total_difficulty(&self) -> U256 {
        let inner = self.inner.read();
        inner.blocks[&inner.head_hash].total_difficulty
    }

    /// Blocks on the canonical index, genesis included.
    pub fn length(&self) -> u64 {
        let inner = self.inner.read();
        inner.blocks[&inner.head_hash].block.number() + 1
    }

    pub fn contains(&self, hash: H256) -> bool {
        self.inner.read().blocks.contains_key(&hash)
    }

    /// Subscribe to head-hash announcements.
    pub fn watch_head(&self) -> watch::Receiver<H256> {
        self.head_tx.subscribe()
    }

    /// Insert `block`. Duplicates are accepted silently; a missing parent or
    /// a number that does not extend the parent rejects the block. The head
    /// moves when the inserted block's cumulative difficulty beats the
    /// current head's.
    pub fn add_block(&self, block: Block) -> ChainResult<()> {
        let hash = block.hash();
        let mut inner = self.inner.write();

        if inner.blocks.contains_key(&hash) {
            return Ok(());
        }
        let parent_td = match inner.blocks.get(&block.parent_hash()) {
            Some(parent) => {
                if block.number() != parent.block.number() + 1 {
                    return Err(ChainError::NumberMismatch {
                        got: block.number(),
                        parent: parent.block.number(),
                    });
                }
                parent.total_difficulty
            }
            None => {
                return Err(ChainError::UnknownParent {
                    number: block.number(),
                    parent: format!("{:#x}", block.parent_hash()),
                });
            }
        };

        let total_difficulty = parent_td + block.difficulty();
        let number = block.number();
        inner.by_number.insert(number, hash);
        inner.blocks.insert(
            hash,
            StoredBlock {
                block,
                total_difficulty,
            },
        );

        let head_td = inner.blocks[&inner.head_hash].total_difficulty;
        if total_difficulty > head_td {
            inner.head_hash = hash;
            drop(inner);
            info!(number, %hash, "chain head advanced");
            let _ = self.head_tx.send(hash);
        } else {
            debug!(number, %hash, "stored non-canonical block");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Address;
    use crate::params;

    fn child_of(parent: &Block, time_delta: u64) -> Block {
        Block::new(
            parent.hash(),
            Address::zero(),
            H256::zero(),
            U256::from(params::INITIAL_DIFFICULTY),
            parent.number() + 1,
            params::GENESIS_GAS_LIMIT,
            0,
            parent.header.time + time_delta,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn fresh_chain_holds_only_genesis() {
        let chain = Chain::new(None);
        assert_eq!(chain.genesis().number(), 0);
        assert_eq!(chain.current_head().hash(), chain.genesis().hash());
        assert_eq!(chain.length(), 1);
    }

    #[test]
    fn append_advances_head_and_indexes() {
        let chain = Chain::new(None);
        let genesis = chain.genesis();
        let mut block = child_of(&genesis, 10);
        block.header.nonce = 12_345;

        chain.add_block(block.clone()).expect("append");
        assert_eq!(chain.length(), 2);
        assert_eq!(
            chain.get_by_number(1).expect("block 1").hash(),
            block.hash()
        );
        assert_eq!(chain.current_head().hash(), block.hash());
        assert_eq!(
            chain.head_total_difficulty(),
            genesis.difficulty() + block.difficulty()
        );
    }

    #[test]
    fn orphans_are_rejected() {
        let chain = Chain::new(None);
        let mut orphan = child_of(&chain.genesis(), 10);
        orphan.header.parent_hash = H256::repeat_byte(0xff);

        assert!(matches!(
            chain.add_block(orphan),
            Err(ChainError::UnknownParent { .. })
        ));
        assert_eq!(chain.length(), 1);
    }

    #[test]
    fn number_must_extend_parent() {
        let chain = Chain::new(None);
        let mut skipped = child_of(&chain.genesis(), 10);
        skipped.header.number = 7;
        assert!(matches!(
            chain.add_block(skipped),
            Err(ChainError::NumberMismatch { got: 7, parent: 0 })
        ));
    }

    #[test]
    fn duplicates_are_silent_noops() {
        let chain = Chain::new(None);
        let block = child_of(&chain.genesis(), 10);
        chain.add_block(block.clone()).expect("first");
        chain.add_block(block).expect("duplicate");
        assert_eq!(chain.length(), 2);
    }

    #[test]
    fn head_follows_total_difficulty_not_height() {
        let chain = Chain::new(None);
        let genesis = chain.genesis();

        // A heavy competing branch: one block of difficulty 3e6.
        let mut heavy = child_of(&genesis, 10);
        heavy.header.difficulty = U256::from(3_000_000u64);
        chain.add_block(heavy.clone()).expect("heavy");

        // A longer but lighter branch: two blocks of difficulty 1e6.
        let mut light1 = child_of(&genesis, 20);
        light1.header.difficulty = U256::from(1_000_000u64);
        chain.add_block(light1.clone()).expect("light1");
        let mut light2 = child_of(&light1, 20);
        light2.header.difficulty = U256::from(1_000_000u64);
        chain.add_block(light2).expect("light2");

        // 3e6 beats 2e6 even though the light branch is taller.
        assert_eq!(chain.current_head().hash(), heavy.hash());
    }

    #[test]
    fn head_watch_announces_inserts() {
        let chain = Chain::new(None);
        let mut watcher = chain.watch_head();
        let block = child_of(&chain.genesis(), 10);
        chain.add_block(block.clone()).expect("append");
        assert!(watcher.has_changed().expect("channel alive"));
        assert_eq!(*watcher.borrow_and_update(), block.hash());
    }
}
