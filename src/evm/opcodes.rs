//! The instruction set: a compile-time table of 256 entries, each a function
//! pointer plus its static base gas. The dispatcher charges the base cost
//! before executing; instructions charge their dynamic costs (memory
//! expansion, word counts, storage tiers) themselves.
//!
//! Stack convention follows the EVM: binary operations consume the top of
//! stack as the first operand.

use ethereum_types::{H256, U256};

use super::gas;
use super::vm::{CallKind, Evm, Flow};
use crate::crypto::keccak256;
use crate::errors::VmError;
use crate::params::{self, Fork};
use crate::state::Log;

type OpFn = fn(&mut Evm<'_>) -> Result<Flow, VmError>;

pub struct Instruction {
    pub name: &'static str,
    pub base_gas: u64,
    pub exec: OpFn,
}

/// Immediate bytes following the opcode (non-zero only for PUSH1..PUSH32).
pub fn push_bytes(opcode: u8) -> usize {
    if (0x60..=0x7f).contains(&opcode) {
        (opcode - 0x5f) as usize
    } else {
        0
    }
}

pub fn instruction(opcode: u8) -> Option<&'static Instruction> {
    TABLE[opcode as usize].as_ref()
}

fn word_to_h256(value: U256) -> H256 {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    H256::from_slice(&bytes)
}

fn word_to_address(value: U256) -> crate::crypto::Address {
    let word = word_to_h256(value);
    crate::crypto::Address::from_slice(&word[12..])
}

fn bool_word(value: bool) -> U256 {
    if value {
        U256::one()
    } else {
        U256::zero()
    }
}

// Two's-complement helpers over U256.

fn is_negative(value: U256) -> bool {
    value.bit(255)
}

fn negate(value: U256) -> U256 {
    (!value).overflowing_add(U256::one()).0
}

fn abs(value: U256) -> U256 {
    if is_negative(value) {
        negate(value)
    } else {
        value
    }
}

/// Copy out of `source` at `offset`, zero-filling past its end.
fn padded_slice(source: &[u8], offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    if offset < source.len() {
        let available = (source.len() - offset).min(len);
        out[..available].copy_from_slice(&source[offset..offset + available]);
    }
    out
}

// Arithmetic.

fn op_stop(_vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    Ok(Flow::Stop)
}

fn op_add(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(a.overflowing_add(b).0)?;
    Ok(Flow::Next)
}

fn op_mul(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(a.overflowing_mul(b).0)?;
    Ok(Flow::Next)
}

fn op_sub(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(a.overflowing_sub(b).0)?;
    Ok(Flow::Next)
}

fn op_div(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack
        .push(if b.is_zero() { U256::zero() } else { a / b })?;
    Ok(Flow::Next)
}

fn op_sdiv(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    let result = if b.is_zero() {
        U256::zero()
    } else {
        let quotient = abs(a) / abs(b);
        if is_negative(a) != is_negative(b) {
            negate(quotient)
        } else {
            quotient
        }
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

fn op_mod(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack
        .push(if b.is_zero() { U256::zero() } else { a % b })?;
    Ok(Flow::Next)
}

fn op_smod(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    let result = if b.is_zero() {
        U256::zero()
    } else {
        let remainder = abs(a) % abs(b);
        if is_negative(a) {
            negate(remainder)
        } else {
            remainder
        }
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

fn op_addmod(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    let n = vm.stack.pop()?;
    let result = if n.is_zero() {
        U256::zero()
    } else {
        let sum = a.full_mul(U256::one()) + b.full_mul(U256::one());
        let n512: ethereum_types::U512 = n.into();
        U256::try_from(sum % n512).expect("reduced below a 256-bit modulus")
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

fn op_mulmod(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    let n = vm.stack.pop()?;
    let result = if n.is_zero() {
        U256::zero()
    } else {
        let product = a.full_mul(b);
        let n512: ethereum_types::U512 = n.into();
        U256::try_from(product % n512).expect("reduced below a 256-bit modulus")
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

fn op_exp(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let base = vm.stack.pop()?;
    let exponent = vm.stack.pop()?;
    vm.gas.consume(gas::exp_gas(exponent))?;
    vm.stack.push(base.overflowing_pow(exponent).0)?;
    Ok(Flow::Next)
}

fn op_signextend(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let byte_index = vm.stack.pop()?;
    let value = vm.stack.pop()?;
    let result = if byte_index >= U256::from(31u64) {
        value
    } else {
        let bit = byte_index.as_usize() * 8 + 7;
        if value.bit(bit) {
            value | (U256::MAX << (bit + 1))
        } else {
            value & ((U256::one() << (bit + 1)) - 1)
        }
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

// Comparison and bitwise.

fn op_lt(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(bool_word(a < b))?;
    Ok(Flow::Next)
}

fn op_gt(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(bool_word(a > b))?;
    Ok(Flow::Next)
}

fn op_slt(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    let result = match (is_negative(a), is_negative(b)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    };
    vm.stack.push(bool_word(result))?;
    Ok(Flow::Next)
}

fn op_sgt(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    let result = match (is_negative(a), is_negative(b)) {
        (true, false) => false,
        (false, true) => true,
        _ => a > b,
    };
    vm.stack.push(bool_word(result))?;
    Ok(Flow::Next)
}

fn op_eq(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(bool_word(a == b))?;
    Ok(Flow::Next)
}

fn op_iszero(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    vm.stack.push(bool_word(a.is_zero()))?;
    Ok(Flow::Next)
}

fn op_and(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(a & b)?;
    Ok(Flow::Next)
}

fn op_or(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(a | b)?;
    Ok(Flow::Next)
}

fn op_xor(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    let b = vm.stack.pop()?;
    vm.stack.push(a ^ b)?;
    Ok(Flow::Next)
}

fn op_not(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let a = vm.stack.pop()?;
    vm.stack.push(!a)?;
    Ok(Flow::Next)
}

fn op_byte(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let index = vm.stack.pop()?;
    let value = vm.stack.pop()?;
    let result = if index >= U256::from(32u64) {
        U256::zero()
    } else {
        U256::from(word_to_h256(value)[index.as_usize()])
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

fn op_shl(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let shift = vm.stack.pop()?;
    let value = vm.stack.pop()?;
    let result = if shift >= U256::from(256u64) {
        U256::zero()
    } else {
        value << shift.as_usize()
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

fn op_shr(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let shift = vm.stack.pop()?;
    let value = vm.stack.pop()?;
    let result = if shift >= U256::from(256u64) {
        U256::zero()
    } else {
        value >> shift.as_usize()
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

fn op_sar(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let shift = vm.stack.pop()?;
    let value = vm.stack.pop()?;
    let negative = is_negative(value);
    let result = if shift >= U256::from(256u64) {
        if negative {
            U256::MAX
        } else {
            U256::zero()
        }
    } else if shift.is_zero() {
        value
    } else {
        let shift = shift.as_usize();
        let shifted = value >> shift;
        if negative {
            shifted | (U256::MAX << (256 - shift))
        } else {
            shifted
        }
    };
    vm.stack.push(result)?;
    Ok(Flow::Next)
}

// Hashing.

fn op_sha3(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    vm.gas.consume(gas::sha3_gas(len))?;
    vm.charge_memory(offset, len)?;
    let data = vm.memory.get(offset, len);
    let hash = keccak256(&data);
    vm.state.add_preimage(hash, data);
    vm.stack.push(U256::from_big_endian(hash.as_bytes()))?;
    Ok(Flow::Next)
}

// Environment.

fn op_address(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let word = U256::from_big_endian(vm.address.as_bytes());
    vm.stack.push(word)?;
    Ok(Flow::Next)
}

fn op_balance(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let address = word_to_address(vm.stack.pop()?);
    let balance = vm.state.get_balance(address);
    vm.stack.push(balance)?;
    Ok(Flow::Next)
}

fn op_origin(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let word = U256::from_big_endian(vm.origin.as_bytes());
    vm.stack.push(word)?;
    Ok(Flow::Next)
}

fn op_caller(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let word = U256::from_big_endian(vm.caller.as_bytes());
    vm.stack.push(word)?;
    Ok(Flow::Next)
}

fn op_callvalue(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let value = vm.value;
    vm.stack.push(value)?;
    Ok(Flow::Next)
}

fn op_calldataload(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    let word = padded_slice(&vm.input, offset, 32);
    vm.stack.push(U256::from_big_endian(&word))?;
    Ok(Flow::Next)
}

fn op_calldatasize(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let len = vm.input.len();
    vm.stack.push(U256::from(len))?;
    Ok(Flow::Next)
}

fn op_calldatacopy(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let dest = Evm::to_usize(vm.stack.pop()?)?;
    let src = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    vm.charge_memory(dest, len)?;
    let data = padded_slice(&vm.input, src, len);
    vm.memory.set(dest, &data);
    Ok(Flow::Next)
}

fn op_codesize(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let len = vm.code.len();
    vm.stack.push(U256::from(len))?;
    Ok(Flow::Next)
}

fn op_codecopy(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let dest = Evm::to_usize(vm.stack.pop()?)?;
    let src = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    vm.charge_memory(dest, len)?;
    let data = padded_slice(&vm.code, src, len);
    vm.memory.set(dest, &data);
    Ok(Flow::Next)
}

fn op_gasprice(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let price = vm.gas_price;
    vm.stack.push(price)?;
    Ok(Flow::Next)
}

fn op_extcodesize(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let address = word_to_address(vm.stack.pop()?);
    let size = vm.state.get_code_size(address);
    vm.stack.push(U256::from(size))?;
    Ok(Flow::Next)
}

fn op_extcodecopy(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let address = word_to_address(vm.stack.pop()?);
    let dest = Evm::to_usize(vm.stack.pop()?)?;
    let src = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    vm.charge_memory(dest, len)?;
    let code = vm.state.get_code(address);
    let data = padded_slice(&code, src, len);
    vm.memory.set(dest, &data);
    Ok(Flow::Next)
}

fn op_returndatasize(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let len = vm.return_data.len();
    vm.stack.push(U256::from(len))?;
    Ok(Flow::Next)
}

fn op_returndatacopy(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let dest = Evm::to_usize(vm.stack.pop()?)?;
    let src = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    vm.charge_memory(dest, len)?;
    let data = padded_slice(&vm.return_data, src, len);
    vm.memory.set(dest, &data);
    Ok(Flow::Next)
}

fn op_extcodehash(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let address = word_to_address(vm.stack.pop()?);
    let hash = vm.state.get_code_hash(address);
    vm.stack.push(U256::from_big_endian(hash.as_bytes()))?;
    Ok(Flow::Next)
}

// Block context.

fn op_blockhash(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    // Ancestor hashes are not threaded into the execution environment.
    let _number = vm.stack.pop()?;
    vm.stack.push(U256::zero())?;
    Ok(Flow::Next)
}

fn op_coinbase(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let word = U256::from_big_endian(vm.env.coinbase.as_bytes());
    vm.stack.push(word)?;
    Ok(Flow::Next)
}

fn op_timestamp(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let timestamp = vm.env.timestamp;
    vm.stack.push(U256::from(timestamp))?;
    Ok(Flow::Next)
}

fn op_number(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let number = vm.env.number;
    vm.stack.push(U256::from(number))?;
    Ok(Flow::Next)
}

fn op_difficulty(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let difficulty = vm.env.difficulty;
    vm.stack.push(difficulty)?;
    Ok(Flow::Next)
}

fn op_gaslimit(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let limit = vm.env.gas_limit;
    vm.stack.push(U256::from(limit))?;
    Ok(Flow::Next)
}

fn op_chainid(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let id = vm.env.chain_id;
    vm.stack.push(U256::from(id))?;
    Ok(Flow::Next)
}

fn op_selfbalance(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let balance = vm.state.get_balance(vm.address);
    vm.stack.push(balance)?;
    Ok(Flow::Next)
}

fn op_basefee(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let base_fee = if vm.env.is_active(Fork::Eip1559) {
        vm.env.base_fee
    } else {
        U256::zero()
    };
    vm.stack.push(base_fee)?;
    Ok(Flow::Next)
}

// Stack, memory, storage and flow.

fn op_pop(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    vm.stack.pop()?;
    Ok(Flow::Next)
}

fn op_mload(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    vm.charge_memory(offset, 32)?;
    let word = vm.memory.get(offset, 32);
    vm.stack.push(U256::from_big_endian(&word))?;
    Ok(Flow::Next)
}

fn op_mstore(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    let value = vm.stack.pop()?;
    vm.charge_memory(offset, 32)?;
    let word = word_to_h256(value);
    vm.memory.set(offset, word.as_bytes());
    Ok(Flow::Next)
}

fn op_mstore8(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    let value = vm.stack.pop()?;
    vm.charge_memory(offset, 1)?;
    vm.memory.set_byte(offset, value.low_u64() as u8);
    Ok(Flow::Next)
}

fn op_sload(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let key = word_to_h256(vm.stack.pop()?);
    let value = vm.state.get_state(vm.address, key);
    vm.stack.push(U256::from_big_endian(value.as_bytes()))?;
    Ok(Flow::Next)
}

fn op_sstore(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    if vm.read_only {
        return Err(VmError::StaticViolation);
    }
    let key = word_to_h256(vm.stack.pop()?);
    let value = word_to_h256(vm.stack.pop()?);
    let current = vm.state.get_state(vm.address, key);
    let (cost, refund) = gas::sstore_gas(current, value);
    vm.gas.consume(cost)?;
    if refund > 0 {
        vm.gas.add_refund(refund);
    }
    vm.state.set_state(vm.address, key, value);
    Ok(Flow::Next)
}

fn op_jump(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let dest = Evm::to_usize(vm.stack.pop()?).map_err(|_| VmError::InvalidJump(usize::MAX))?;
    Ok(Flow::Jump(dest))
}

fn op_jumpi(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let dest = vm.stack.pop()?;
    let condition = vm.stack.pop()?;
    if condition.is_zero() {
        Ok(Flow::Next)
    } else {
        let dest = Evm::to_usize(dest).map_err(|_| VmError::InvalidJump(usize::MAX))?;
        Ok(Flow::Jump(dest))
    }
}

fn op_pc(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let pc = vm.pc;
    vm.stack.push(U256::from(pc))?;
    Ok(Flow::Next)
}

fn op_msize(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let size = vm.memory.size();
    vm.stack.push(U256::from(size))?;
    Ok(Flow::Next)
}

fn op_gas(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let left = vm.gas.left();
    vm.stack.push(U256::from(left))?;
    Ok(Flow::Next)
}

fn op_jumpdest(_vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    Ok(Flow::Next)
}

fn op_push(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let size = push_bytes(vm.code[vm.pc]);
    let start = vm.pc + 1;
    let data = padded_slice(&vm.code, start, size);
    // Immediates are right-aligned: PUSH2 0x0102 pushes 0x0102.
    vm.stack.push(U256::from_big_endian(&data))?;
    Ok(Flow::Next)
}

fn op_dup(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let n = (vm.code[vm.pc] - 0x80 + 1) as usize;
    vm.stack.dup(n)?;
    Ok(Flow::Next)
}

fn op_swap(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let n = (vm.code[vm.pc] - 0x90 + 1) as usize;
    vm.stack.swap(n)?;
    Ok(Flow::Next)
}

// Logging.

fn op_log(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    if vm.read_only {
        return Err(VmError::StaticViolation);
    }
    let topic_count = (vm.code[vm.pc] - 0xa0) as usize;
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    let mut topics = Vec::with_capacity(topic_count);
    for _ in 0..topic_count {
        topics.push(word_to_h256(vm.stack.pop()?));
    }
    vm.gas.consume(gas::log_gas(topic_count, len))?;
    vm.charge_memory(offset, len)?;
    let data = vm.memory.get(offset, len);
    let address = vm.address;
    vm.state.add_log(Log {
        address,
        topics,
        data,
        ..Log::default()
    });
    Ok(Flow::Next)
}

// Contract lifecycle.

fn op_create(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    run_create(vm, false)
}

fn op_create2(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    run_create(vm, true)
}

fn run_create(vm: &mut Evm<'_>, with_salt: bool) -> Result<Flow, VmError> {
    if vm.read_only {
        return Err(VmError::StaticViolation);
    }
    let value = vm.stack.pop()?;
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    let salt = if with_salt {
        Some(word_to_h256(vm.stack.pop()?))
    } else {
        None
    };
    vm.charge_memory(offset, len)?;
    let initcode = vm.memory.get(offset, len);

    let child_gas = {
        let remaining = vm.gas.left();
        remaining - remaining / 64
    };
    vm.gas.consume(child_gas)?;

    let result = vm.create_contract(initcode, value, child_gas, salt);
    vm.gas.give_back(result.gas_left);
    vm.gas.add_refund(result.refund);
    vm.return_data = if result.success {
        Vec::new()
    } else {
        result.output.clone()
    };
    match result.address.filter(|_| result.success) {
        Some(address) => vm.stack.push(U256::from_big_endian(address.as_bytes()))?,
        None => vm.stack.push(U256::zero())?,
    }
    Ok(Flow::Next)
}

fn op_call(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    run_call(vm, CallKind::Call)
}

fn op_callcode(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    run_call(vm, CallKind::CallCode)
}

fn op_delegatecall(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    run_call(vm, CallKind::DelegateCall)
}

fn op_staticcall(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    run_call(vm, CallKind::StaticCall)
}

fn run_call(vm: &mut Evm<'_>, kind: CallKind) -> Result<Flow, VmError> {
    let requested = vm.stack.pop()?;
    let to = word_to_address(vm.stack.pop()?);
    let value = match kind {
        CallKind::Call | CallKind::CallCode => vm.stack.pop()?,
        CallKind::DelegateCall | CallKind::StaticCall => U256::zero(),
    };
    let in_offset = Evm::to_usize(vm.stack.pop()?)?;
    let in_len = Evm::to_usize(vm.stack.pop()?)?;
    let out_offset = Evm::to_usize(vm.stack.pop()?)?;
    let out_len = Evm::to_usize(vm.stack.pop()?)?;

    if vm.read_only && kind == CallKind::Call && !value.is_zero() {
        return Err(VmError::StaticViolation);
    }

    vm.charge_memory(in_offset, in_len)?;
    vm.charge_memory(out_offset, out_len)?;
    let input = vm.memory.get(in_offset, in_len);

    let transfers = kind == CallKind::Call && !value.is_zero();
    let new_account = transfers && !vm.state.exists(to);
    vm.gas.consume(gas::call_surcharge(transfers, new_account))?;

    let charged = gas::child_call_gas(requested, vm.gas.left());
    vm.gas.consume(charged)?;
    // The callee additionally receives the 2300 stipend on value transfer;
    // the stipend is not billed to the caller and never returns to it.
    let child_gas = if transfers { charged + 2_300 } else { charged };

    let result = vm.call_contract(kind, to, value, input, child_gas);
    vm.gas.give_back(result.gas_left.min(charged));
    vm.gas.add_refund(result.refund);

    if !result.output.is_empty() && out_len > 0 {
        let copy_len = out_len.min(result.output.len());
        vm.memory.set(out_offset, &result.output[..copy_len]);
    }
    vm.return_data = result.output;
    vm.stack.push(bool_word(result.success))?;
    Ok(Flow::Next)
}

fn op_return(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    vm.charge_memory(offset, len)?;
    vm.output = vm.memory.get(offset, len);
    Ok(Flow::Stop)
}

fn op_revert(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    let offset = Evm::to_usize(vm.stack.pop()?)?;
    let len = Evm::to_usize(vm.stack.pop()?)?;
    vm.charge_memory(offset, len)?;
    vm.output = vm.memory.get(offset, len);
    Ok(Flow::Revert)
}

fn op_invalid(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    Err(VmError::InvalidOpcode(vm.code[vm.pc]))
}

fn op_selfdestruct(vm: &mut Evm<'_>) -> Result<Flow, VmError> {
    if vm.read_only {
        return Err(VmError::StaticViolation);
    }
    let beneficiary = word_to_address(vm.stack.pop()?);
    let address = vm.address;
    let balance = vm.state.get_balance(address);
    vm.state.add_balance(beneficiary, balance);
    vm.state.sub_balance(address, balance);
    if !vm.state.has_suicided(address) {
        vm.gas.add_refund(params::SELFDESTRUCT_REFUND_GAS);
    }
    vm.state.suicide(address);
    Ok(Flow::Stop)
}

// The table itself.

const fn entry(name: &'static str, base_gas: u64, exec: OpFn) -> Option<Instruction> {
    Some(Instruction {
        name,
        base_gas,
        exec,
    })
}

static TABLE: [Option<Instruction>; 256] = build_table();

const fn build_table() -> [Option<Instruction>; 256] {
    const NONE: Option<Instruction> = None;
    let mut table = [NONE; 256];

    table[0x00] = entry("STOP", 0, op_stop);
    table[0x01] = entry("ADD", 3, op_add);
    table[0x02] = entry("MUL", 5, op_mul);
    table[0x03] = entry("SUB", 3, op_sub);
    table[0x04] = entry("DIV", 5, op_div);
    table[0x05] = entry("SDIV", 5, op_sdiv);
    table[0x06] = entry("MOD", 5, op_mod);
    table[0x07] = entry("SMOD", 5, op_smod);
    table[0x08] = entry("ADDMOD", 8, op_addmod);
    table[0x09] = entry("MULMOD", 8, op_mulmod);
    table[0x0a] = entry("EXP", 10, op_exp);
    table[0x0b] = entry("SIGNEXTEND", 5, op_signextend);

    table[0x10] = entry("LT", 3, op_lt);
    table[0x11] = entry("GT", 3, op_gt);
    table[0x12] = entry("SLT", 3, op_slt);
    table[0x13] = entry("SGT", 3, op_sgt);
    table[0x14] = entry("EQ", 3, op_eq);
    table[0x15] = entry("ISZERO", 3, op_iszero);
    table[0x16] = entry("AND", 3, op_and);
    table[0x17] = entry("OR", 3, op_or);
    table[0x18] = entry("XOR", 3, op_xor);
    table[0x19] = entry("NOT", 3, op_not);
    table[0x1a] = entry("BYTE", 3, op_byte);
    table[0x1b] = entry("SHL", 3, op_shl);
    table[0x1c] = entry("SHR", 3, op_shr);
    table[0x1d] = entry("SAR", 3, op_sar);

    table[0x20] = entry("SHA3", 30, op_sha3);

    table[0x30] = entry("ADDRESS", 2, op_address);
    table[0x31] = entry("BALANCE", 400, op_balance);
    table[0x32] = entry("ORIGIN", 2, op_origin);
    table[0x33] = entry("CALLER", 2, op_caller);
    table[0x34] = entry("CALLVALUE", 2, op_callvalue);
    table[0x35] = entry("CALLDATALOAD", 3, op_calldataload);
    table[0x36] = entry("CALLDATASIZE", 2, op_calldatasize);
    table[0x37] = entry("CALLDATACOPY", 3, op_calldatacopy);
    table[0x38] = entry("CODESIZE", 2, op_codesize);
    table[0x39] = entry("CODECOPY", 3, op_codecopy);
    table[0x3a] = entry("GASPRICE", 2, op_gasprice);
    table[0x3b] = entry("EXTCODESIZE", 700, op_extcodesize);
    table[0x3c] = entry("EXTCODECOPY", 700, op_extcodecopy);
    table[0x3d] = entry("RETURNDATASIZE", 2, op_returndatasize);
    table[0x3e] = entry("RETURNDATACOPY", 3, op_returndatacopy);
    table[0x3f] = entry("EXTCODEHASH", 700, op_extcodehash);

    table[0x40] = entry("BLOCKHASH", 20, op_blockhash);
    table[0x41] = entry("COINBASE", 2, op_coinbase);
    table[0x42] = entry("TIMESTAMP", 2, op_timestamp);
    table[0x43] = entry("NUMBER", 2, op_number);
    table[0x44] = entry("DIFFICULTY", 2, op_difficulty);
    table[0x45] = entry("GASLIMIT", 2, op_gaslimit);
    table[0x46] = entry("CHAINID", 2, op_chainid);
    table[0x47] = entry("SELFBALANCE", 5, op_selfbalance);
    table[0x48] = entry("BASEFEE", 2, op_basefee);

    table[0x50] = entry("POP", 2, op_pop);
    table[0x51] = entry("MLOAD", 3, op_mload);
    table[0x52] = entry("MSTORE", 3, op_mstore);
    table[0x53] = entry("MSTORE8", 3, op_mstore8);
    table[0x54] = entry("SLOAD", params::SLOAD_GAS, op_sload);
    table[0x55] = entry("SSTORE", 0, op_sstore);
    table[0x56] = entry("JUMP", 8, op_jump);
    table[0x57] = entry("JUMPI", 10, op_jumpi);
    table[0x58] = entry("PC", 2, op_pc);
    table[0x59] = entry("MSIZE", 2, op_msize);
    table[0x5a] = entry("GAS", 2, op_gas);
    table[0x5b] = entry("JUMPDEST", 1, op_jumpdest);

    let mut i = 0x60;
    while i <= 0x7f {
        table[i] = entry("PUSH", 3, op_push);
        i += 1;
    }
    let mut i = 0x80;
    while i <= 0x8f {
        table[i] = entry("DUP", 3, op_dup);
        i += 1;
    }
    let mut i = 0x90;
    while i <= 0x9f {
        table[i] = entry("SWAP", 3, op_swap);
        i += 1;
    }
    let mut i = 0xa0;
    while i <= 0xa4 {
        table[i] = entry("LOG", params::LOG_GAS, op_log);
        i += 1;
    }

    table[0xf0] = entry("CREATE", params::CREATE_GAS, op_create);
    table[0xf1] = entry("CALL", params::CALL_GAS, op_call);
    table[0xf2] = entry("CALLCODE", params::CALL_GAS, op_callcode);
    table[0xf3] = entry("RETURN", 0, op_return);
    table[0xf4] = entry("DELEGATECALL", params::CALL_GAS, op_delegatecall);
    table[0xf5] = entry("CREATE2", params::CREATE_GAS, op_create2);
    table[0xfa] = entry("STATICCALL", params::CALL_GAS, op_staticcall);
    table[0xfd] = entry("REVERT", 0, op_revert);
    table[0xfe] = entry("INVALID", 0, op_invalid);
    table[0xff] = entry("SELFDESTRUCT", params::SELFDESTRUCT_GAS, op_selfdestruct);

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_the_london_set() {
        for opcode in [
            0x00u8, 0x01, 0x20, 0x31, 0x3f, 0x48, 0x54, 0x55, 0x5b, 0x60, 0x7f, 0x80, 0x9f, 0xa0,
            0xa4, 0xf0, 0xf1, 0xf5, 0xfa, 0xfd, 0xff,
        ] {
            assert!(instruction(opcode).is_some(), "missing 0x{opcode:02x}");
        }
        assert!(instruction(0x0c).is_none());
        assert!(instruction(0xef).is_none());
    }

    #[test]
    fn base_gas_matches_the_schedule() {
        assert_eq!(instruction(0x01).unwrap().base_gas, 3); // ADD
        assert_eq!(instruction(0x02).unwrap().base_gas, 5); // MUL
        assert_eq!(instruction(0x31).unwrap().base_gas, 400); // BALANCE
        assert_eq!(instruction(0x54).unwrap().base_gas, 800); // SLOAD
        assert_eq!(instruction(0xf0).unwrap().base_gas, 32_000); // CREATE
        assert_eq!(instruction(0xf1).unwrap().base_gas, 700); // CALL
        assert_eq!(instruction(0xfd).unwrap().base_gas, 0); // REVERT
        assert_eq!(instruction(0xff).unwrap().base_gas, 5_000); // SELFDESTRUCT
    }

    #[test]
    fn push_widths() {
        assert_eq!(push_bytes(0x60), 1);
        assert_eq!(push_bytes(0x7f), 32);
        assert_eq!(push_bytes(0x01), 0);
    }
}
