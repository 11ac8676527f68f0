//! Block-reward schedule: 8 NOGO at genesis, cut by 20% every five million
//! blocks, never below 0.1 NOGO. Computed iteratively in wei so repeated
//! reductions accumulate no rounding drift.

use ethereum_types::U256;

use crate::params;

/// Reward in wei for the block at `number`.
pub fn block_reward(number: u64) -> U256 {
    let reductions = number / params::HALVING_INTERVAL;
    let mut reward = params::base_reward_wei();
    let floor = params::min_reward_wei();

    for _ in 0..reductions {
        reward = reward * U256::from(4u64) / U256::from(5u64);
        if reward <= floor {
            return floor;
        }
    }

    reward.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_reward_is_eight_nogo() {
        assert_eq!(block_reward(0), U256::from(8u64) * U256::exp10(18));
        assert_eq!(block_reward(4_999_999), block_reward(0));
    }

    #[test]
    fn first_reductions_match_schedule() {
        // 8 * 4/5 = 6.4 NOGO, then 5.12 NOGO.
        assert_eq!(block_reward(5_000_000), U256::from(64u64) * U256::exp10(17));
        assert_eq!(block_reward(10_000_000), U256::from(512u64) * U256::exp10(16));
    }

    #[test]
    fn reward_is_monotone_non_increasing() {
        let mut previous = block_reward(0);
        for step in 1..40u64 {
            let current = block_reward(step * params::HALVING_INTERVAL);
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn reward_floors_at_a_tenth_nogo() {
        // Far enough out that the 20% cuts would drop below the floor.
        let distant = block_reward(params::HALVING_INTERVAL * 200);
        assert_eq!(distant, U256::exp10(17));
        assert!(block_reward(u64::MAX) >= U256::exp10(17));
    }
}
