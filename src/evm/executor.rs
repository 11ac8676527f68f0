//! Transaction- and block-level execution on top of the interpreter.
//!
//! `apply_transaction` performs the full lifecycle: intrinsic gas, the
//! up-front gas purchase at the effective price, the root call or creation,
//! refund application, fee credit to the coinbase and suicide finalization.
//! `apply_block` folds every transaction of a block into the state and
//! credits the coinbase reward.

use ethereum_types::U256;

use super::vm::{BlockEnv, CallKind, Evm};
use crate::consensus::block_reward;
use crate::crypto::Address;
use crate::errors::{ChainResult, ValidationError};
use crate::params::Fork;
use crate::state::WorldState;
use crate::types::{Block, Transaction};

/// Outcome of one applied transaction.
#[derive(Clone, Debug)]
pub struct ExecutionReceipt {
    pub success: bool,
    pub gas_used: u64,
    pub output: Vec<u8>,
    pub contract_address: Option<Address>,
    pub effective_gas_price: U256,
}

/// Execute `tx` from `sender` against `state`. The caller has already
/// validated signatures and nonces; this enforces the gas-purchase rules and
/// performs the state transition.
pub fn apply_transaction(
    state: &mut WorldState,
    env: &BlockEnv,
    tx: &Transaction,
    sender: Address,
) -> ChainResult<ExecutionReceipt> {
    let intrinsic = tx.intrinsic_gas();
    if tx.gas < intrinsic {
        return Err(ValidationError::InsufficientGas {
            got: tx.gas,
            intrinsic,
        }
        .into());
    }
    if tx.is_eip1559() && !env.is_active(Fork::Eip1559) {
        return Err(ValidationError::Malformed("fee-market transaction before activation".into()).into());
    }

    let price = tx.effective_gas_price(env.base_fee);
    let upfront = price * U256::from(tx.gas);
    if state.get_balance(sender) < upfront + tx.value {
        return Err(ValidationError::InsufficientBalance.into());
    }

    state.sub_balance(sender, upfront);
    if tx.to.is_some() {
        // Creation bumps the nonce inside `create_contract`, after deriving
        // the contract address from the pre-increment value.
        state.increment_nonce(sender);
    }

    let mut root = Evm::transaction_frame(state, env.clone(), sender, price, tx.gas);
    root.gas
        .consume(intrinsic)
        .expect("intrinsic gas checked against the limit");
    let remaining = root.gas.left();

    let result = match tx.to {
        None => root.create_contract(tx.data.clone(), tx.value, remaining, None),
        Some(to) if root.state.get_code_size(to) > 0 => {
            root.gas.consume(remaining).expect("forwarding all remaining gas");
            let result = root.call_contract(CallKind::Call, to, tx.value, tx.data.clone(), remaining);
            root.gas.give_back(result.gas_left);
            root.gas.add_refund(result.refund);
            result
        }
        Some(to) => {
            // Plain value transfer; the recipient is created on first touch.
            let outcome = if root.state.get_balance(sender) >= tx.value {
                root.state.add_balance(to, tx.value);
                root.state.sub_balance(sender, tx.value);
                true
            } else {
                false
            };
            super::vm::CallResult {
                success: outcome,
                output: Vec::new(),
                gas_left: 0,
                refund: 0,
                address: None,
                error: None,
            }
        }
    };

    // Creation consumed gas inside create_contract's child frame only.
    if tx.to.is_none() {
        root.gas.consume(remaining).expect("forwarding all remaining gas");
        root.gas.give_back(result.gas_left);
        root.gas.add_refund(result.refund);
    }

    root.gas.apply_refund();
    let gas_used = root.gas.used();

    let contract_address = result.address;
    let success = result.success;
    let output = result.output.clone();

    state.add_balance(sender, price * U256::from(tx.gas - gas_used));
    state.add_balance(env.coinbase, price * U256::from(gas_used));
    state.finalize_suicides();

    Ok(ExecutionReceipt {
        success,
        gas_used,
        output,
        contract_address,
        effective_gas_price: price,
    })
}

/// Apply every transaction in `block` and credit the coinbase reward.
/// Returns the total gas used.
pub fn apply_block(
    state: &mut WorldState,
    env: &BlockEnv,
    block: &Block,
    chain_id: u64,
) -> ChainResult<u64> {
    let mut gas_used = 0u64;
    for tx in &block.transactions {
        let sender = tx
            .sender(chain_id)
            .map_err(|_| ValidationError::BadSignature)?;
        let receipt = apply_transaction(state, env, tx, sender)?;
        gas_used += receipt.gas_used;
    }
    state.add_balance(block.header.coinbase, block_reward(block.header.number));
    Ok(gas_used)
}
