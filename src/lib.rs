//! NogoChain: an EVM-compatible proof-of-work blockchain node.
//!
//! The crate composes the full node from one module per subsystem:
//! `consensus` implements NogoPow (cache-and-dataset hashimoto mixing),
//! difficulty retargeting and the reward schedule; `evm` executes contract
//! bytecode against the journaled world `state`; `validator`, `chain` and
//! `txpool` keep the local ledger consistent; `sync` and `p2p` move blocks
//! and transactions between peers; `stratum` distributes mining work; and
//! `rpc` exposes the Ethereum-compatible JSON-RPC surface plus the `nogo_*`
//! extension.
//!
//! Applications typically load a [`config::NodeConfig`], construct a
//! [`node::Node`] and drive it through the returned [`node::NodeHandle`].

pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod errors;
pub mod evm;
pub mod node;
pub mod p2p;
pub mod params;
pub mod rpc;
pub mod state;
pub mod stratum;
pub mod sync;
pub mod txpool;
pub mod types;
pub mod validator;
