//! The interpreter: a stack machine over 256-bit words executing one call
//! frame, plus the contract-lifecycle operations that spawn child frames.
//!
//! A frame runs until it halts (`STOP`/`RETURN`), reverts (`REVERT`) or
//! errors. The three outcomes differ in what happens to state and gas:
//! halting keeps state and returns unused gas; reverting restores the
//! snapshot taken at frame entry and still returns unused gas; any other
//! error restores the snapshot and consumes everything. Frames never
//! transition backwards.

use ethereum_types::{H256, U256};

use super::gas::GasMeter;
use super::memory::Memory;
use super::opcodes::{instruction, push_bytes};
use super::stack::Stack;
use crate::crypto::{create2_address, create_address, Address};
use crate::errors::VmError;
use crate::params::{self, Fork, ForkSchedule};
use crate::state::WorldState;
use crate::types::BlockHeader;

/// Block-level execution context shared by every frame of a transaction.
#[derive(Clone, Debug)]
pub struct BlockEnv {
    pub coinbase: Address,
    pub number: u64,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub difficulty: U256,
    pub base_fee: U256,
    pub chain_id: u64,
    pub forks: ForkSchedule,
}

impl BlockEnv {
    pub fn from_header(header: &BlockHeader, forks: ForkSchedule) -> Self {
        let base_fee = if forks.is_active(Fork::Eip1559, header.number) {
            U256::from(params::INITIAL_BASE_FEE)
        } else {
            U256::zero()
        };
        Self {
            coinbase: header.coinbase,
            number: header.number,
            timestamp: header.time,
            gas_limit: header.gas_limit,
            difficulty: header.difficulty,
            base_fee,
            chain_id: params::CHAIN_ID,
            forks,
        }
    }

    pub fn is_active(&self, fork: Fork) -> bool {
        self.forks.is_active(fork, self.number)
    }
}

/// Terminal condition of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Stopped,
    Reverted,
}

/// Control flow returned by each instruction.
pub enum Flow {
    /// Advance the program counter past this instruction.
    Next,
    /// Jump to a validated destination.
    Jump(usize),
    /// Halt the frame successfully.
    Stop,
    /// Halt the frame, reverting its state.
    Revert,
}

/// How a call-family opcode scopes storage, value and caller context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
}

/// Result of a child call or contract creation, surfaced to the calling
/// frame as a boolean plus returndata.
#[derive(Clone, Debug)]
pub struct CallResult {
    pub success: bool,
    pub output: Vec<u8>,
    pub gas_left: u64,
    pub refund: u64,
    pub address: Option<Address>,
    pub error: Option<VmError>,
}

impl CallResult {
    fn failure(error: Option<VmError>, gas_left: u64) -> Self {
        Self {
            success: false,
            output: Vec::new(),
            gas_left,
            refund: 0,
            address: None,
            error,
        }
    }
}

/// Parameters of one call frame.
pub struct FrameParams {
    pub caller: Address,
    pub origin: Address,
    pub address: Address,
    pub value: U256,
    pub gas_price: U256,
    pub input: Vec<u8>,
    pub code: Vec<u8>,
    pub gas_limit: u64,
    pub read_only: bool,
    pub depth: usize,
}

pub struct Evm<'s> {
    pub state: &'s mut WorldState,
    pub env: BlockEnv,
    pub caller: Address,
    pub origin: Address,
    /// The executing account: storage scope and LOG/SELFDESTRUCT subject.
    pub address: Address,
    pub value: U256,
    pub gas_price: U256,
    pub input: Vec<u8>,
    pub code: Vec<u8>,
    pub stack: Stack,
    pub memory: Memory,
    pub gas: GasMeter,
    pub pc: usize,
    /// RETURN/REVERT payload of this frame.
    pub output: Vec<u8>,
    /// Returndata buffer of the most recent child call.
    pub return_data: Vec<u8>,
    pub read_only: bool,
    pub depth: usize,
    jumpdests: Vec<bool>,
}

impl<'s> Evm<'s> {
    pub fn new(state: &'s mut WorldState, env: BlockEnv, frame: FrameParams) -> Self {
        let jumpdests = analyze_jumpdests(&frame.code);
        Self {
            state,
            env,
            caller: frame.caller,
            origin: frame.origin,
            address: frame.address,
            value: frame.value,
            gas_price: frame.gas_price,
            input: frame.input,
            code: frame.code,
            stack: Stack::new(),
            memory: Memory::new(),
            gas: GasMeter::new(frame.gas_limit),
            pc: 0,
            output: Vec::new(),
            return_data: Vec::new(),
            read_only: frame.read_only,
            depth: frame.depth,
            jumpdests,
        }
    }

    /// A root frame for driving a transaction; it executes no code itself
    /// and exists to host `call_contract`/`create_contract`.
    pub fn transaction_frame(
        state: &'s mut WorldState,
        env: BlockEnv,
        sender: Address,
        gas_price: U256,
        gas_limit: u64,
    ) -> Self {
        Self::new(
            state,
            env,
            FrameParams {
                caller: sender,
                origin: sender,
                address: sender,
                value: U256::zero(),
                gas_price,
                input: Vec::new(),
                code: Vec::new(),
                gas_limit,
                read_only: false,
                depth: 0,
            },
        )
    }

    /// Execute this frame's code to completion.
    pub fn run(&mut self) -> Result<FrameStatus, VmError> {
        loop {
            if self.pc >= self.code.len() {
                return Ok(FrameStatus::Stopped);
            }
            let opcode = self.code[self.pc];
            let instr = instruction(opcode).ok_or(VmError::InvalidOpcode(opcode))?;
            self.gas.consume(instr.base_gas)?;
            match (instr.exec)(self)? {
                Flow::Next => self.pc += 1 + push_bytes(opcode),
                Flow::Jump(dest) => {
                    if !self.is_valid_jumpdest(dest) {
                        return Err(VmError::InvalidJump(dest));
                    }
                    self.pc = dest;
                }
                Flow::Stop => return Ok(FrameStatus::Stopped),
                Flow::Revert => return Ok(FrameStatus::Reverted),
            }
        }
    }

    fn is_valid_jumpdest(&self, dest: usize) -> bool {
        self.jumpdests.get(dest).copied().unwrap_or(false)
    }

    /// Charge memory expansion for a `[offset, offset+len)` access.
    pub fn charge_memory(&mut self, offset: usize, len: usize) -> Result<(), VmError> {
        let cost = self.memory.expand(offset, len)?;
        self.gas.consume(cost)
    }

    /// Narrow a word to usize for offsets and sizes; anything past the
    /// memory limit cannot be paid for anyway.
    pub fn to_usize(value: U256) -> Result<usize, VmError> {
        if value > U256::from(u32::MAX) {
            return Err(VmError::OutOfGas);
        }
        Ok(value.as_usize())
    }

    /// Run a call-family operation against `to`, forwarding `gas`.
    pub fn call_contract(
        &mut self,
        kind: CallKind,
        to: Address,
        value: U256,
        input: Vec<u8>,
        gas: u64,
    ) -> CallResult {
        if self.depth >= params::CALL_DEPTH_LIMIT {
            return CallResult::failure(Some(VmError::DepthLimit), gas);
        }
        if !self.state.exists(to) {
            // The target must exist; the caller sees a plain failed call.
            return CallResult::failure(None, gas);
        }

        let transfers = kind == CallKind::Call && !value.is_zero();
        if (transfers || kind == CallKind::CallCode)
            && self.state.get_balance(self.address) < value
        {
            return CallResult::failure(Some(VmError::InsufficientBalance), gas);
        }

        let code = self.state.get_code(to);
        let snapshot = self.state.snapshot();
        if transfers {
            self.state.sub_balance(self.address, value);
            self.state.add_balance(to, value);
        }
        // CALLCODE keeps the value inside the caller's account: the debit
        // and credit cancel, so no balance moves.

        if code.is_empty() {
            return CallResult {
                success: true,
                output: Vec::new(),
                gas_left: gas,
                refund: 0,
                address: None,
                error: None,
            };
        }

        let (frame_caller, frame_address, frame_value) = match kind {
            CallKind::Call | CallKind::StaticCall => (self.address, to, value),
            CallKind::CallCode => (self.address, self.address, value),
            CallKind::DelegateCall => (self.caller, self.address, self.value),
        };
        let params = FrameParams {
            caller: frame_caller,
            origin: self.origin,
            address: frame_address,
            value: frame_value,
            gas_price: self.gas_price,
            input,
            code,
            gas_limit: gas,
            read_only: self.read_only || kind == CallKind::StaticCall,
            depth: self.depth + 1,
        };
        self.run_frame(params, snapshot, None)
    }

    /// Deploy a contract with CREATE or (when `salt` is given) CREATE2.
    pub fn create_contract(
        &mut self,
        code: Vec<u8>,
        value: U256,
        gas: u64,
        salt: Option<H256>,
    ) -> CallResult {
        if self.depth >= params::CALL_DEPTH_LIMIT {
            return CallResult::failure(Some(VmError::DepthLimit), gas);
        }
        if self.state.get_balance(self.address) < value {
            return CallResult::failure(Some(VmError::InsufficientBalance), gas);
        }

        let creator = self.address;
        let address = match salt {
            Some(salt) => create2_address(creator, salt, &code),
            None => create_address(creator, self.state.get_nonce(creator)),
        };
        if self.state.exists(address) {
            return CallResult::failure(Some(VmError::ContractExists), gas);
        }

        // The creator's nonce advances even if the init code fails.
        self.state.increment_nonce(creator);

        let snapshot = self.state.snapshot();
        self.state.create_account(address);
        if !value.is_zero() {
            self.state.sub_balance(creator, value);
            self.state.add_balance(address, value);
        }

        let params = FrameParams {
            caller: creator,
            origin: self.origin,
            address,
            value,
            gas_price: self.gas_price,
            input: Vec::new(),
            code,
            gas_limit: gas,
            read_only: self.read_only,
            depth: self.depth + 1,
        };
        self.run_frame(params, snapshot, Some(address))
    }

    fn run_frame(
        &mut self,
        params: FrameParams,
        snapshot: usize,
        deploy_to: Option<Address>,
    ) -> CallResult {
        let env = self.env.clone();
        let outcome = {
            let mut child = Evm::new(&mut *self.state, env, params);
            match child.run() {
                Ok(status) => Ok((status, child.output.clone(), child.gas.left(), child.gas.refund())),
                Err(error) => Err(error),
            }
        };

        match outcome {
            Ok((FrameStatus::Stopped, output, gas_left, refund)) => {
                if let Some(address) = deploy_to {
                    if output.len() > params::CODE_SIZE_LIMIT {
                        self.state.revert_to_snapshot(snapshot);
                        return CallResult::failure(Some(VmError::CodeTooLarge), 0);
                    }
                    if !output.is_empty() {
                        self.state.set_code(address, output.clone());
                    }
                }
                CallResult {
                    success: true,
                    output,
                    gas_left,
                    refund,
                    address: deploy_to,
                    error: None,
                }
            }
            Ok((FrameStatus::Reverted, output, gas_left, _)) => {
                self.state.revert_to_snapshot(snapshot);
                CallResult {
                    success: false,
                    output,
                    gas_left,
                    refund: 0,
                    address: None,
                    error: Some(VmError::Revert),
                }
            }
            Err(error) => {
                self.state.revert_to_snapshot(snapshot);
                CallResult::failure(Some(error), 0)
            }
        }
    }
}

/// Mark the positions of JUMPDEST opcodes, skipping bytes that are PUSH
/// immediates.
fn analyze_jumpdests(code: &[u8]) -> Vec<bool> {
    let mut valid = vec![false; code.len()];
    let mut i = 0;
    while i < code.len() {
        let op = code[i];
        if op == 0x5b {
            valid[i] = true;
        }
        i += 1 + push_bytes(op);
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jumpdest_analysis_skips_push_data() {
        // PUSH2 0x5b5b JUMPDEST
        let code = [0x61, 0x5b, 0x5b, 0x5b];
        let map = analyze_jumpdests(&code);
        assert_eq!(map, vec![false, false, false, true]);
    }
}
