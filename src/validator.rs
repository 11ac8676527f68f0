//! Block and transaction validation.
//!
//! `validate_block` enforces, in order: the header rules against the parent,
//! the per-transaction rules and the state-root commitment, the difficulty
//! retarget, and finally the proof of work. Every rule violation surfaces as
//! a typed [`ValidationError`] naming the rule; nothing is silently dropped.
//!
//! State-root checking executes the block's transactions (and the coinbase
//! reward) inside a snapshot: on a root mismatch the snapshot is reverted
//! and the block leaves no trace, on success the state stays advanced.

use ethereum_types::U256;

use crate::consensus::{calculate_difficulty, to_target, PowCache};
use crate::crypto::Address;
use crate::errors::{ChainResult, ValidationError};
use crate::evm::{apply_block, BlockEnv};
use crate::params::{self, ForkSchedule};
use crate::state::WorldState;
use crate::types::{Block, Transaction};

pub struct Validator {
    forks: ForkSchedule,
    chain_id: u64,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ForkSchedule::default(), params::CHAIN_ID)
    }
}

impl Validator {
    pub fn new(forks: ForkSchedule, chain_id: u64) -> Self {
        Self { forks, chain_id }
    }

    /// Validate `block` against its `parent`, executing its transactions on
    /// `state`. On success the state reflects the block; on any error the
    /// state is untouched.
    pub fn validate_block(
        &self,
        block: &Block,
        parent: &Block,
        state: &mut WorldState,
        pow: &PowCache,
    ) -> ChainResult<()> {
        self.validate_header(block, parent)?;

        for tx in &block.transactions {
            self.validate_tx(tx, state)?;
        }
        let snapshot = state.snapshot();
        self.validate_state_root(block, state)?;

        // The root check advanced the state; undo it if a later rule fails.
        if let Err(error) = self
            .validate_difficulty(block, parent)
            .and_then(|_| self.validate_pow(block, pow))
        {
            state.revert_to_snapshot(snapshot);
            return Err(error.into());
        }
        Ok(())
    }

    fn validate_header(&self, block: &Block, parent: &Block) -> Result<(), ValidationError> {
        let header = &block.header;
        let expected = parent.number() + 1;
        if header.number != expected {
            return Err(ValidationError::BadNumber {
                got: header.number,
                expected,
            });
        }
        if header.parent_hash != parent.hash() {
            return Err(ValidationError::ParentMismatch);
        }
        if header.time <= parent.header.time {
            return Err(ValidationError::TimestampRegress {
                got: header.time,
                parent: parent.header.time,
            });
        }
        let bound = parent.header.gas_limit * params::GAS_LIMIT_BOUND_PERCENT / 100;
        if header.gas_limit > parent.header.gas_limit + bound
            || header.gas_limit < parent.header.gas_limit - bound
        {
            return Err(ValidationError::GasLimitBound {
                got: header.gas_limit,
                parent: parent.header.gas_limit,
            });
        }
        if header.gas_used > header.gas_limit {
            return Err(ValidationError::GasUsedOverflow {
                used: header.gas_used,
                limit: header.gas_limit,
            });
        }
        Ok(())
    }

    /// Stateful transaction admission: structural checks, signature
    /// recovery, nonce ordering, balance coverage and intrinsic gas.
    pub fn validate_tx(
        &self,
        tx: &Transaction,
        state: &WorldState,
    ) -> Result<Address, ValidationError> {
        tx.validate()?;
        let sender = tx
            .sender(self.chain_id)
            .map_err(|_| ValidationError::BadSignature)?;

        let account_nonce = state.get_nonce(sender);
        if tx.nonce < account_nonce {
            return Err(ValidationError::BadNonce {
                tx: tx.nonce,
                account: account_nonce,
            });
        }

        let balance = state.get_balance(sender);
        if balance < tx.value {
            return Err(ValidationError::InsufficientBalance);
        }
        let gas_cost = U256::from(tx.gas) * tx.gas_price;
        if balance < gas_cost {
            return Err(ValidationError::InsufficientBalance);
        }

        let intrinsic = tx.intrinsic_gas();
        if tx.gas < intrinsic {
            return Err(ValidationError::InsufficientGas {
                got: tx.gas,
                intrinsic,
            });
        }
        Ok(sender)
    }

    fn validate_state_root(&self, block: &Block, state: &mut WorldState) -> ChainResult<()> {
        let snapshot = state.snapshot();
        let env = BlockEnv::from_header(&block.header, self.forks);
        // On success the trial execution is kept; the caller owns the outer
        // snapshot and decides whether later rules roll it back.
        if let Err(error) = apply_block(state, &env, block, self.chain_id) {
            state.revert_to_snapshot(snapshot);
            return Err(error);
        }
        let computed = state.state_root();
        if computed != block.header.state_root {
            state.revert_to_snapshot(snapshot);
            return Err(ValidationError::InvalidStateRoot {
                header: format!("{:#x}", block.header.state_root),
                computed: format!("{computed:#x}"),
            }
            .into());
        }
        Ok(())
    }

    fn validate_difficulty(&self, block: &Block, parent: &Block) -> Result<(), ValidationError> {
        let expected = calculate_difficulty(
            parent.header.time,
            block.header.time,
            parent.difficulty(),
            block.number(),
        );
        if block.difficulty() != expected {
            return Err(ValidationError::BadDifficulty {
                got: block.difficulty().to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    fn validate_pow(&self, block: &Block, pow: &PowCache) -> Result<(), ValidationError> {
        let sealed = block.header.pow_bytes();
        let engine = pow.engine_for(&sealed);
        let target = to_target(block.difficulty());
        if !engine.verify(&sealed, block.header.nonce, target) {
            return Err(ValidationError::InvalidPow);
        }
        Ok(())
    }
}
