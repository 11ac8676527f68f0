//! The EVM execution engine: stack, memory, gas metering, the opcode table,
//! the interpreter and the transaction executor.

mod executor;
mod gas;
mod memory;
mod opcodes;
mod stack;
mod vm;

pub use executor::{apply_block, apply_transaction, ExecutionReceipt};
pub use gas::GasMeter;
pub use memory::Memory;
pub use opcodes::{instruction, push_bytes, Instruction};
pub use stack::Stack;
pub use vm::{BlockEnv, CallKind, CallResult, Evm, Flow, FrameParams, FrameStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Address;
    use crate::errors::VmError;
    use crate::params::{self, ForkSchedule};
    use crate::state::WorldState;
    use ethereum_types::{H256, U256};

    fn env() -> BlockEnv {
        BlockEnv {
            coinbase: Address::repeat_byte(0xcc),
            number: 1,
            timestamp: params::GENESIS_TIME,
            gas_limit: params::GENESIS_GAS_LIMIT,
            difficulty: U256::from(params::INITIAL_DIFFICULTY),
            base_fee: U256::from(params::INITIAL_BASE_FEE),
            chain_id: params::CHAIN_ID,
            forks: ForkSchedule::default(),
        }
    }

    fn run_code(code: &[u8], gas: u64) -> (Result<FrameStatus, VmError>, Vec<u8>, u64) {
        let mut state = WorldState::new();
        let mut vm = Evm::new(
            &mut state,
            env(),
            FrameParams {
                caller: Address::repeat_byte(0x01),
                origin: Address::repeat_byte(0x01),
                address: Address::repeat_byte(0x02),
                value: U256::zero(),
                gas_price: U256::one(),
                input: Vec::new(),
                code: code.to_vec(),
                gas_limit: gas,
                read_only: false,
                depth: 0,
            },
        );
        let status = vm.run();
        let output = vm.output.clone();
        let used = vm.gas.used();
        (status, output, used)
    }

    #[test]
    fn add_program_returns_three() {
        // PUSH1 1, PUSH1 2, ADD, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, RETURN
        let code = [
            0x60, 0x01, 0x60, 0x02, 0x01, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
        ];
        let (status, output, used) = run_code(&code, 1_000_000);
        assert_eq!(status, Ok(FrameStatus::Stopped));
        assert_eq!(output.len(), 32);
        assert_eq!(output[31], 0x03);
        assert!(output[..31].iter().all(|byte| *byte == 0));
        // Five PUSH/ADD-class ops at 3 gas, MSTORE base 3, RETURN 0, plus
        // the 3-gas expansion for the first 32-byte word.
        assert_eq!(used, 6 * 3 + 3 + 3);
    }

    #[test]
    fn out_of_gas_aborts_without_overdraft() {
        let code = [0x60, 0x01, 0x60, 0x02, 0x01];
        let (status, _, used) = run_code(&code, 7);
        assert_eq!(status, Err(VmError::OutOfGas));
        assert!(used <= 7);
    }

    #[test]
    fn stack_underflow_is_detected() {
        let (status, _, _) = run_code(&[0x01], 1_000);
        assert_eq!(status, Err(VmError::StackUnderflow));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let (status, _, _) = run_code(&[0x0c], 1_000);
        assert_eq!(status, Err(VmError::InvalidOpcode(0x0c)));
    }

    #[test]
    fn jump_targets_must_be_jumpdest() {
        // PUSH1 3, JUMP — destination 3 is not a JUMPDEST.
        let (status, _, _) = run_code(&[0x60, 0x03, 0x56, 0x00], 1_000);
        assert_eq!(status, Err(VmError::InvalidJump(3)));

        // PUSH1 3, JUMP, JUMPDEST, STOP — valid loop-free jump.
        let (status, _, _) = run_code(&[0x60, 0x03, 0x56, 0x5b, 0x00], 1_000);
        assert_eq!(status, Ok(FrameStatus::Stopped));
    }

    #[test]
    fn revert_surfaces_returndata() {
        // PUSH1 42, PUSH1 0, MSTORE8, PUSH1 1, PUSH1 0, REVERT
        let code = [0x60, 0x2a, 0x60, 0x00, 0x53, 0x60, 0x01, 0x60, 0x00, 0xfd];
        let (status, output, _) = run_code(&code, 1_000);
        assert_eq!(status, Ok(FrameStatus::Reverted));
        assert_eq!(output, vec![42]);
    }

    #[test]
    fn sstore_persists_and_sload_reads_back() {
        let mut state = WorldState::new();
        let contract = Address::repeat_byte(0x0a);
        // PUSH1 7, PUSH1 1, SSTORE, PUSH1 1, SLOAD, PUSH1 0, MSTORE,
        // PUSH1 32, PUSH1 0, RETURN
        let code = vec![
            0x60, 0x07, 0x60, 0x01, 0x55, 0x60, 0x01, 0x54, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60,
            0x00, 0xf3,
        ];
        let mut vm = Evm::new(
            &mut state,
            env(),
            FrameParams {
                caller: Address::repeat_byte(0x01),
                origin: Address::repeat_byte(0x01),
                address: contract,
                value: U256::zero(),
                gas_price: U256::one(),
                input: Vec::new(),
                code,
                gas_limit: 100_000,
                read_only: false,
                depth: 0,
            },
        );
        assert_eq!(vm.run(), Ok(FrameStatus::Stopped));
        assert_eq!(vm.output[31], 7);
        assert_eq!(
            state.get_state(contract, H256::from_low_u64_be(1)),
            H256::from_low_u64_be(7)
        );
    }

    #[test]
    fn static_frames_reject_mutation() {
        let mut state = WorldState::new();
        // PUSH1 1, PUSH1 0, SSTORE
        let code = vec![0x60, 0x01, 0x60, 0x00, 0x55];
        let mut vm = Evm::new(
            &mut state,
            env(),
            FrameParams {
                caller: Address::repeat_byte(0x01),
                origin: Address::repeat_byte(0x01),
                address: Address::repeat_byte(0x02),
                value: U256::zero(),
                gas_price: U256::one(),
                input: Vec::new(),
                code,
                gas_limit: 100_000,
                read_only: true,
                depth: 0,
            },
        );
        assert_eq!(vm.run(), Err(VmError::StaticViolation));
    }

    #[test]
    fn inner_call_reverts_only_its_own_writes() {
        let mut state = WorldState::new();
        let callee = Address::repeat_byte(0x0b);
        // Callee: SSTORE(0, 1) then REVERT(0, 0).
        state.set_code(
            callee,
            vec![0x60, 0x01, 0x60, 0x00, 0x55, 0x60, 0x00, 0x60, 0x00, 0xfd],
        );
        let caller_contract = Address::repeat_byte(0x0a);
        state.create_account(caller_contract);

        let mut vm = Evm::new(
            &mut state,
            env(),
            FrameParams {
                caller: Address::repeat_byte(0x01),
                origin: Address::repeat_byte(0x01),
                address: caller_contract,
                value: U256::zero(),
                gas_price: U256::one(),
                input: Vec::new(),
                code: Vec::new(),
                gas_limit: 200_000,
                read_only: false,
                depth: 0,
            },
        );
        vm.state
            .set_state(caller_contract, H256::zero(), H256::from_low_u64_be(5));
        let result = vm.call_contract(CallKind::Call, callee, U256::zero(), Vec::new(), 100_000);
        assert!(!result.success);
        assert_eq!(result.error, Some(VmError::Revert));
        assert!(result.gas_left > 0, "revert returns remaining gas");

        // Callee's write is gone, caller's earlier write survives.
        assert_eq!(state.get_state(callee, H256::zero()), H256::zero());
        assert_eq!(
            state.get_state(caller_contract, H256::zero()),
            H256::from_low_u64_be(5)
        );
    }

    #[test]
    fn create_collision_is_detected() {
        let mut state = WorldState::new();
        let creator = Address::repeat_byte(0x01);
        state.add_balance(creator, U256::from(1_000_000u64));
        let expected = crate::crypto::create_address(creator, 0);
        state.create_account(expected);

        let mut vm = Evm::transaction_frame(
            &mut state,
            env(),
            creator,
            U256::one(),
            1_000_000,
        );
        let result = vm.create_contract(vec![0x00], U256::zero(), 100_000, None);
        assert!(!result.success);
        assert_eq!(result.error, Some(VmError::ContractExists));
    }

    #[test]
    fn oversized_deployments_are_rejected() {
        let mut state = WorldState::new();
        let creator = Address::repeat_byte(0x01);
        state.add_balance(creator, U256::from(u64::MAX));

        // Init code returning CODE_SIZE_LIMIT + 1 zero bytes:
        // PUSH3 len, PUSH1 0, RETURN (memory is zero-filled).
        let len = params::CODE_SIZE_LIMIT + 1;
        let code = vec![
            0x62,
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
            0x60,
            0x00,
            0xf3,
        ];
        let mut vm = Evm::transaction_frame(
            &mut state,
            env(),
            creator,
            U256::one(),
            10_000_000,
        );
        let result = vm.create_contract(code, U256::zero(), 9_000_000, None);
        assert!(!result.success);
        assert_eq!(result.error, Some(VmError::CodeTooLarge));
        assert_eq!(result.gas_left, 0, "failed deployment consumes all gas");
    }

    #[test]
    fn delegatecall_writes_into_caller_storage() {
        let mut state = WorldState::new();
        let library = Address::repeat_byte(0x0b);
        // SSTORE(0, 9)
        state.set_code(library, vec![0x60, 0x09, 0x60, 0x00, 0x55]);
        let proxy = Address::repeat_byte(0x0a);
        state.create_account(proxy);

        let mut vm = Evm::new(
            &mut state,
            env(),
            FrameParams {
                caller: Address::repeat_byte(0x01),
                origin: Address::repeat_byte(0x01),
                address: proxy,
                value: U256::zero(),
                gas_price: U256::one(),
                input: Vec::new(),
                code: Vec::new(),
                gas_limit: 200_000,
                read_only: false,
                depth: 0,
            },
        );
        let result =
            vm.call_contract(CallKind::DelegateCall, library, U256::zero(), Vec::new(), 100_000);
        assert!(result.success);
        assert_eq!(
            state.get_state(proxy, H256::zero()),
            H256::from_low_u64_be(9)
        );
        assert_eq!(state.get_state(library, H256::zero()), H256::zero());
    }

    #[test]
    fn callcode_moves_no_balance() {
        let mut state = WorldState::new();
        let target = Address::repeat_byte(0x0b);
        state.set_code(target, vec![0x00]);
        let caller_contract = Address::repeat_byte(0x0a);
        state.add_balance(caller_contract, U256::from(1_000u64));

        let mut vm = Evm::new(
            &mut state,
            env(),
            FrameParams {
                caller: Address::repeat_byte(0x01),
                origin: Address::repeat_byte(0x01),
                address: caller_contract,
                value: U256::zero(),
                gas_price: U256::one(),
                input: Vec::new(),
                code: Vec::new(),
                gas_limit: 200_000,
                read_only: false,
                depth: 0,
            },
        );
        let result = vm.call_contract(
            CallKind::CallCode,
            target,
            U256::from(400u64),
            Vec::new(),
            100_000,
        );
        assert!(result.success);
        assert_eq!(state.get_balance(caller_contract), U256::from(1_000u64));
        assert_eq!(state.get_balance(target), U256::zero());
    }
}
