//! Gas accounting: the per-frame meter and the dynamic-cost helpers shared
//! by the instruction set.

use ethereum_types::{H256, U256};

use crate::errors::VmError;
use crate::params;

#[derive(Clone, Debug)]
pub struct GasMeter {
    limit: u64,
    used: u64,
    refund: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            refund: 0,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn left(&self) -> u64 {
        self.limit - self.used
    }

    pub fn refund(&self) -> u64 {
        self.refund
    }

    pub fn consume(&mut self, amount: u64) -> Result<(), VmError> {
        if self.used.checked_add(amount).map_or(true, |total| total > self.limit) {
            return Err(VmError::OutOfGas);
        }
        self.used += amount;
        Ok(())
    }

    /// Mark every remaining unit as spent; used when a frame errors.
    pub fn consume_all(&mut self) {
        self.used = self.limit;
    }

    /// Return unused gas from a finished child frame.
    pub fn give_back(&mut self, amount: u64) {
        self.used = self.used.saturating_sub(amount);
    }

    pub fn add_refund(&mut self, amount: u64) {
        self.refund += amount;
    }

    /// Cap the refund at half the gas used and credit it. Returns the
    /// credited amount.
    pub fn apply_refund(&mut self) -> u64 {
        let credited = self.refund.min(self.used / 2);
        self.used -= credited;
        self.refund = 0;
        credited
    }
}

/// Tiered SSTORE cost: `(gas, refund)` for writing `new` over `current`.
pub fn sstore_gas(current: H256, new: H256) -> (u64, u64) {
    let current_zero = current.is_zero();
    let new_zero = new.is_zero();
    match (current_zero, new_zero) {
        (true, false) => (params::SSTORE_SET_GAS, 0),
        (false, true) => (params::SSTORE_RESET_GAS, params::SSTORE_CLEAR_REFUND),
        (false, false) => (params::SSTORE_RESET_GAS, 0),
        (true, true) => (params::SSTORE_SET_GAS, 0),
    }
}

/// Word-count surcharge for SHA3.
pub fn sha3_gas(len: usize) -> u64 {
    params::SHA3_WORD_GAS * ((len as u64 + 31) / 32)
}

/// Byte-count surcharge for EXP.
pub fn exp_gas(exponent: U256) -> u64 {
    params::EXP_BYTE_GAS * (exponent.bits() as u64 / 8)
}

/// Topic and data surcharge for LOGn (the 375 base is in the opcode table).
pub fn log_gas(topics: usize, data_len: usize) -> u64 {
    params::LOG_TOPIC_GAS * topics as u64 + params::LOG_DATA_GAS * data_len as u64
}

/// Surcharges on the CALL family beyond the 700 base: value transfer and
/// new-account creation.
pub fn call_surcharge(transfers_value: bool, new_account: bool) -> u64 {
    let mut gas = 0;
    if transfers_value {
        gas += params::CALL_VALUE_TRANSFER_GAS;
    }
    if new_account {
        gas += params::CALL_NEW_ACCOUNT_GAS;
    }
    gas
}

/// Gas forwarded to a child call: the requested amount capped at all but one
/// 64th of what remains.
pub fn child_call_gas(requested: U256, remaining: u64) -> u64 {
    let cap = remaining - remaining / 64;
    if requested > U256::from(cap) {
        cap
    } else {
        requested.low_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_fails_past_the_limit() {
        let mut meter = GasMeter::new(100);
        meter.consume(60).unwrap();
        assert_eq!(meter.consume(50), Err(VmError::OutOfGas));
        assert_eq!(meter.used(), 60);
        assert_eq!(meter.left(), 40);
    }

    #[test]
    fn refund_is_capped_at_half_of_used() {
        let mut meter = GasMeter::new(1_000);
        meter.consume(100).unwrap();
        meter.add_refund(500);
        assert_eq!(meter.apply_refund(), 50);
        assert_eq!(meter.used(), 50);
        assert_eq!(meter.refund(), 0);
    }

    #[test]
    fn sstore_schedule() {
        let zero = H256::zero();
        let one = H256::from_low_u64_be(1);
        assert_eq!(sstore_gas(zero, one), (20_000, 0));
        assert_eq!(sstore_gas(one, zero), (5_000, 15_000));
        assert_eq!(sstore_gas(one, one), (5_000, 0));
    }

    #[test]
    fn child_call_gas_keeps_one_64th() {
        assert_eq!(child_call_gas(U256::from(u64::MAX), 6_400), 6_300);
        assert_eq!(child_call_gas(U256::from(100u64), 6_400), 100);
    }

    #[test]
    fn exp_gas_follows_exponent_width() {
        assert_eq!(exp_gas(U256::zero()), 0);
        assert_eq!(exp_gas(U256::from(255u64)), 10);
        assert_eq!(exp_gas(U256::from(256u64)), 10);
        assert_eq!(exp_gas(U256::from(1u64) << 64), 80);
    }
}
