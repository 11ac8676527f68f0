//! Chain-wide constants: identity, rewards, consensus timing, gas schedule
//! bounds and hard-fork activation heights.

use ethereum_types::U256;

/// Chain identifier for NogoChain.
pub const CHAIN_ID: u64 = 318;
/// Native token symbol.
pub const SYMBOL: &str = "NOGO";
/// Native token decimals.
pub const DECIMALS: u8 = 18;
/// Wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

// Block rewards.

/// Base block reward in whole NOGO.
pub const BLOCK_REWARD: u64 = 8;
/// Blocks between reward reductions.
pub const HALVING_INTERVAL: u64 = 5_000_000;
/// Minimum block reward, 0.1 NOGO in wei.
pub const MIN_REWARD_WEI: u128 = 100_000_000_000_000_000;

// Consensus timing.

/// Target block time in seconds.
pub const TARGET_BLOCK_TIME: u64 = 20;
/// Blocks between difficulty retargets.
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 10;
/// Fixed difficulty for the first retarget interval.
pub const INITIAL_DIFFICULTY: u64 = 1_000_000;

// Genesis.

pub const GENESIS_TIME: u64 = 1_700_000_000;
pub const GENESIS_GAS_LIMIT: u64 = 10_000_000;
pub const GENESIS_EXTRA: &[u8] = b"NogoChain Genesis Block";

// EVM limits.

pub const STACK_LIMIT: usize = 1024;
pub const MEMORY_LIMIT: usize = 1024 * 1024;
pub const CODE_SIZE_LIMIT: usize = 24_576;
pub const CALL_DEPTH_LIMIT: usize = 1024;

// Transaction gas.

pub const TX_GAS: u64 = 21_000;
pub const TX_DATA_ZERO_GAS: u64 = 4;
pub const TX_DATA_NON_ZERO_GAS: u64 = 16;

// Memory expansion gas.

pub const MEMORY_GAS: u64 = 3;
pub const QUAD_COEFF_DIV: u64 = 512;

// Storage gas.

pub const SLOAD_GAS: u64 = 800;
pub const SSTORE_SET_GAS: u64 = 20_000;
pub const SSTORE_RESET_GAS: u64 = 5_000;
pub const SSTORE_CLEAR_REFUND: u64 = 15_000;

// Call gas.

pub const CALL_GAS: u64 = 700;
pub const CALL_VALUE_TRANSFER_GAS: u64 = 9_000;
pub const CALL_NEW_ACCOUNT_GAS: u64 = 25_000;
pub const CREATE_GAS: u64 = 32_000;
pub const SELFDESTRUCT_GAS: u64 = 5_000;
pub const SELFDESTRUCT_REFUND_GAS: u64 = 24_000;

// Log gas.

pub const LOG_GAS: u64 = 375;
pub const LOG_TOPIC_GAS: u64 = 375;
pub const LOG_DATA_GAS: u64 = 8;

// Hashing gas.

pub const SHA3_GAS: u64 = 30;
pub const SHA3_WORD_GAS: u64 = 6;
pub const EXP_GAS: u64 = 10;
pub const EXP_BYTE_GAS: u64 = 10;

// Block gas bounds.

pub const GAS_LIMIT_BOUND_PERCENT: u64 = 5;
pub const MAX_GAS_LIMIT: u64 = 100_000_000;
pub const MIN_GAS_PRICE: u64 = 1;

// EIP-1559.

pub const INITIAL_BASE_FEE: u64 = 1_000_000_000;
pub const BASE_FEE_CHANGE_DENOMINATOR: u64 = 8;
pub const ELASTICITY_MULTIPLIER: u64 = 2;

/// Hard forks recognised by the execution layer, in activation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fork {
    Homestead,
    TangerineWhistle,
    SpuriousDragon,
    Byzantium,
    Constantinople,
    Petersburg,
    Istanbul,
    Berlin,
    London,
    Eip1559,
}

/// Activation heights per fork. The reference configuration activates every
/// fork from genesis.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForkSchedule {
    pub homestead: u64,
    pub tangerine_whistle: u64,
    pub spurious_dragon: u64,
    pub byzantium: u64,
    pub constantinople: u64,
    pub petersburg: u64,
    pub istanbul: u64,
    pub berlin: u64,
    pub london: u64,
    pub eip1559: u64,
}

impl ForkSchedule {
    pub fn is_active(&self, fork: Fork, number: u64) -> bool {
        let activation = match fork {
            Fork::Homestead => self.homestead,
            Fork::TangerineWhistle => self.tangerine_whistle,
            Fork::SpuriousDragon => self.spurious_dragon,
            Fork::Byzantium => self.byzantium,
            Fork::Constantinople => self.constantinople,
            Fork::Petersburg => self.petersburg,
            Fork::Istanbul => self.istanbul,
            Fork::Berlin => self.berlin,
            Fork::London => self.london,
            Fork::Eip1559 => self.eip1559,
        };
        number >= activation
    }
}

/// Base block reward in wei.
pub fn base_reward_wei() -> U256 {
    U256::from(BLOCK_REWARD) * U256::exp10(DECIMALS as usize)
}

/// Minimum block reward in wei.
pub fn min_reward_wei() -> U256 {
    U256::from(MIN_REWARD_WEI)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_constants_line_up() {
        assert_eq!(base_reward_wei(), U256::from(8u64) * U256::exp10(18));
        assert_eq!(min_reward_wei(), U256::exp10(17));
    }

    #[test]
    fn all_forks_active_from_genesis_by_default() {
        let schedule = ForkSchedule::default();
        assert!(schedule.is_active(Fork::London, 0));
        assert!(schedule.is_active(Fork::Eip1559, 0));
    }

    #[test]
    fn fork_activation_respects_height() {
        let schedule = ForkSchedule {
            london: 100,
            ..ForkSchedule::default()
        };
        assert!(!schedule.is_active(Fork::London, 99));
        assert!(schedule.is_active(Fork::London, 100));
    }
}
