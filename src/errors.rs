use std::io;

use thiserror::Error;

/// Top-level error domain for the node. Subsystem errors convert into this
/// via `#[from]` bridges so callers can work with a single `ChainResult`.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Stratum(#[from] StratumError),
    #[error("block {number} rejected: parent {parent} not found")]
    UnknownParent { number: u64, parent: String },
    #[error("block number {got} does not extend parent number {parent}")]
    NumberMismatch { got: u64, parent: u64 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Block and transaction validation failures. Each variant names the rule
/// that failed so rejections stay diagnosable at the sync and RPC layers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid header: parent hash mismatch")]
    ParentMismatch,
    #[error("invalid header: number {got}, expected {expected}")]
    BadNumber { got: u64, expected: u64 },
    #[error("invalid header: timestamp {got} does not advance parent {parent}")]
    TimestampRegress { got: u64, parent: u64 },
    #[error("invalid header: gas limit {got} outside bound of parent {parent}")]
    GasLimitBound { got: u64, parent: u64 },
    #[error("invalid header: gas used {used} exceeds gas limit {limit}")]
    GasUsedOverflow { used: u64, limit: u64 },
    #[error("invalid transaction: bad nonce (tx {tx}, account {account})")]
    BadNonce { tx: u64, account: u64 },
    #[error("invalid transaction: insufficient balance")]
    InsufficientBalance,
    #[error("invalid transaction: gas limit {got} below intrinsic gas {intrinsic}")]
    InsufficientGas { got: u64, intrinsic: u64 },
    #[error("invalid transaction: signature recovery failed")]
    BadSignature,
    #[error("invalid transaction: fee cap below tip cap")]
    BadGasParams1559,
    #[error("invalid transaction: {0}")]
    Malformed(String),
    #[error("proof of work does not meet difficulty target")]
    InvalidPow,
    #[error("state root mismatch (header {header}, computed {computed})")]
    InvalidStateRoot { header: String, computed: String },
    #[error("difficulty {got} does not match retarget {expected}")]
    BadDifficulty { got: String, expected: String },
}

/// EVM execution failures. These abort the current call frame; the parent
/// frame observes them as a failed call, not as a node error.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum VmError {
    #[error("out of gas")]
    OutOfGas,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    #[error("invalid jump destination {0}")]
    InvalidJump(usize),
    #[error("contract address collision")]
    ContractExists,
    #[error("contract code exceeds size limit")]
    CodeTooLarge,
    #[error("state mutation inside static call")]
    StaticViolation,
    #[error("execution reverted")]
    Revert,
    #[error("call depth limit reached")]
    DepthLimit,
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
}

/// Wire-level failures on a peer connection. Any of these terminates the
/// peer's reader and removes the peer from the peer map.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("decompression error: {0}")]
    Decompress(String),
    #[error("peer disconnected")]
    Disconnected,
}

/// Stratum protocol failure, reported to the offending client as a JSON
/// error object with the given code.
#[derive(Debug, Error)]
#[error("stratum error {code}: {message}")]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl StratumError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: -1,
            message: message.into(),
        }
    }
}
