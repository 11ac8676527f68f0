//! Difficulty retargeting toward the 20-second block time.
//!
//! The first retarget interval runs at the fixed initial difficulty. After
//! that each block's difficulty is the parent's scaled by the inverse of the
//! observed block-time ratio, with the ratio clamped to [1, 2]: difficulty
//! only ever falls, and by at most half per step, so the result always lands
//! in [parent/2, parent]. The math is exact integer arithmetic; there is no
//! float drift.

use ethereum_types::U256;

use crate::params;

/// Expected difficulty for a block at `height` whose parent carries
/// `parent_difficulty`, given the two timestamps in unix seconds.
pub fn calculate_difficulty(
    parent_timestamp: u64,
    current_timestamp: u64,
    parent_difficulty: U256,
    height: u64,
) -> U256 {
    if height < params::DIFFICULTY_ADJUSTMENT_INTERVAL {
        return U256::from(params::INITIAL_DIFFICULTY);
    }

    let target_time = params::DIFFICULTY_ADJUSTMENT_INTERVAL * params::TARGET_BLOCK_TIME;
    let actual_time = current_timestamp.saturating_sub(parent_timestamp);
    // Clamp the ratio actual/target to [1, 2] by clamping the actual time.
    let clamped = actual_time.clamp(target_time, 2 * target_time);

    let adjusted = parent_difficulty * U256::from(target_time) / U256::from(clamped);
    if adjusted.is_zero() {
        U256::one()
    } else {
        adjusted
    }
}

/// Target value a proof hash must not exceed: `(2^256 − 1) / difficulty`.
/// Non-positive difficulty yields a zero target, which no hash satisfies.
pub fn to_target(difficulty: U256) -> U256 {
    if difficulty.is_zero() {
        return U256::zero();
    }
    U256::MAX / difficulty
}

/// Difficulty implied by a target value, the inverse of [`to_target`].
pub fn from_target(target: U256) -> U256 {
    if target.is_zero() {
        return U256::zero();
    }
    U256::MAX / target
}
