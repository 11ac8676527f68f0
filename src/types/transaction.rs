//! Transactions: legacy and EIP-1559 fee-market variants in one struct.
//!
//! A transaction is the 1559 variant iff both `gas_fee_cap` and
//! `gas_tip_cap` are present. The signing digest covers every field except
//! the signature itself plus the chain id, so signatures do not replay across
//! chains.

use ethereum_types::{H256, U256};
use serde::{Deserialize, Serialize};

use super::{hex_bytes, Address};
use crate::crypto::{keccak256, recover_address};
use crate::errors::{ChainResult, ValidationError};
use crate::params;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: Option<Address>,
    pub value: U256,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_fee_cap: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_tip_cap: Option<U256>,
    pub v: U256,
    pub r: U256,
    pub s: U256,
}

/// Unsigned view hashed for signing; carries the chain id in place of the
/// signature fields.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    nonce: u64,
    gas_price: U256,
    gas: u64,
    to: Option<Address>,
    value: U256,
    #[serde(with = "hex_bytes")]
    data: &'a Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas_fee_cap: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas_tip_cap: Option<U256>,
    chain_id: u64,
}

impl Transaction {
    pub fn transfer(
        nonce: u64,
        gas_price: U256,
        gas: u64,
        to: Address,
        value: U256,
        data: Vec<u8>,
    ) -> Self {
        Self {
            nonce,
            gas_price,
            gas,
            to: Some(to),
            value,
            data,
            gas_fee_cap: None,
            gas_tip_cap: None,
            v: U256::zero(),
            r: U256::zero(),
            s: U256::zero(),
        }
    }

    pub fn contract_creation(
        nonce: u64,
        gas_price: U256,
        gas: u64,
        value: U256,
        data: Vec<u8>,
    ) -> Self {
        Self {
            to: None,
            ..Self::transfer(nonce, gas_price, gas, Address::zero(), value, data)
        }
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    pub fn is_eip1559(&self) -> bool {
        self.gas_fee_cap.is_some() && self.gas_tip_cap.is_some()
    }

    /// Price per gas actually paid: `min(fee_cap, base_fee + tip_cap)` for
    /// fee-market transactions, the declared gas price otherwise.
    pub fn effective_gas_price(&self, base_fee: U256) -> U256 {
        match (self.gas_fee_cap, self.gas_tip_cap) {
            (Some(fee_cap), Some(tip_cap)) => fee_cap.min(base_fee.saturating_add(tip_cap)),
            _ => self.gas_price,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transaction serialization is infallible")
    }

    pub fn hash(&self) -> H256 {
        keccak256(&self.canonical_bytes())
    }

    /// Digest the sender signed over.
    pub fn signing_digest(&self, chain_id: u64) -> H256 {
        let payload = SigningPayload {
            nonce: self.nonce,
            gas_price: self.gas_price,
            gas: self.gas,
            to: self.to,
            value: self.value,
            data: &self.data,
            gas_fee_cap: self.gas_fee_cap,
            gas_tip_cap: self.gas_tip_cap,
            chain_id,
        };
        let encoded = serde_json::to_vec(&payload).expect("payload serialization is infallible");
        keccak256(&encoded)
    }

    /// Recover the sender address from the signature.
    pub fn sender(&self, chain_id: u64) -> ChainResult<Address> {
        recover_address(self.signing_digest(chain_id), self.v, self.r, self.s)
    }

    /// Sign in place with a secp256k1 secret key, using the 27/28 recovery
    /// id convention.
    pub fn sign(&mut self, secret: &k256::ecdsa::SigningKey, chain_id: u64) -> ChainResult<()> {
        let digest = self.signing_digest(chain_id);
        let (signature, recovery) = secret
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|err| crate::errors::ChainError::Crypto(format!("signing failed: {err}")))?;
        let bytes = signature.to_bytes();
        self.r = U256::from_big_endian(&bytes[..32]);
        self.s = U256::from_big_endian(&bytes[32..]);
        self.v = U256::from(27u64 + recovery.to_byte() as u64);
        Ok(())
    }

    /// Structural checks independent of any state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.gas == 0 {
            return Err(ValidationError::Malformed("zero gas limit".into()));
        }
        if let (Some(fee_cap), Some(tip_cap)) = (self.gas_fee_cap, self.gas_tip_cap) {
            if fee_cap < tip_cap {
                return Err(ValidationError::BadGasParams1559);
            }
        }
        Ok(())
    }

    /// Gas consumed before the first opcode executes: the base transaction
    /// cost plus the calldata cost (4 per zero byte, 16 per non-zero byte).
    pub fn intrinsic_gas(&self) -> u64 {
        let data_gas: u64 = self
            .data
            .iter()
            .map(|byte| {
                if *byte == 0 {
                    params::TX_DATA_ZERO_GAS
                } else {
                    params::TX_DATA_NON_ZERO_GAS
                }
            })
            .sum();
        params::TX_GAS + data_gas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    fn signed_transfer() -> (Transaction, Address) {
        let key = SigningKey::from_slice(&[7u8; 32]).expect("key");
        let mut tx = Transaction::transfer(
            3,
            U256::from(2u64),
            60_000,
            Address::repeat_byte(0xbe),
            U256::from(1_000u64),
            vec![0, 0, 1, 0xff],
        );
        tx.sign(&key, params::CHAIN_ID).expect("sign");
        let sender = crate::crypto::public_key_to_address(key.verifying_key());
        (tx, sender)
    }

    #[test]
    fn sender_recovers_after_signing() {
        let (tx, sender) = signed_transfer();
        assert_eq!(tx.sender(params::CHAIN_ID).expect("recover"), sender);
    }

    #[test]
    fn sender_fails_on_wrong_chain_id() {
        let (tx, sender) = signed_transfer();
        match tx.sender(params::CHAIN_ID + 1) {
            Ok(other) => assert_ne!(other, sender),
            Err(_) => {}
        }
    }

    #[test]
    fn intrinsic_gas_counts_zero_and_nonzero_bytes() {
        let (tx, _) = signed_transfer();
        // 21000 + 3 zero bytes * 4 + 1 non-zero byte... data is [0,0,1,0xff]:
        // two zeros, two non-zeros.
        assert_eq!(tx.intrinsic_gas(), 21_000 + 2 * 4 + 2 * 16);
    }

    #[test]
    fn effective_gas_price_takes_minimum() {
        let mut tx = Transaction::transfer(
            0,
            U256::from(9u64),
            21_000,
            Address::zero(),
            U256::zero(),
            Vec::new(),
        );
        assert_eq!(tx.effective_gas_price(U256::from(5u64)), U256::from(9u64));

        tx.gas_fee_cap = Some(U256::from(10u64));
        tx.gas_tip_cap = Some(U256::from(2u64));
        // base fee 5: base + tip = 7 < fee cap 10.
        assert_eq!(tx.effective_gas_price(U256::from(5u64)), U256::from(7u64));
        // base fee 20: capped by fee cap.
        assert_eq!(tx.effective_gas_price(U256::from(20u64)), U256::from(10u64));
    }

    #[test]
    fn fee_cap_below_tip_cap_is_rejected() {
        let mut tx = Transaction::transfer(
            0,
            U256::zero(),
            21_000,
            Address::zero(),
            U256::zero(),
            Vec::new(),
        );
        tx.gas_fee_cap = Some(U256::from(1u64));
        tx.gas_tip_cap = Some(U256::from(2u64));
        assert_eq!(tx.validate(), Err(ValidationError::BadGasParams1559));
    }

    #[test]
    fn hash_is_stable_and_signature_sensitive() {
        let (tx, _) = signed_transfer();
        assert_eq!(tx.hash(), tx.clone().hash());
        let mut tampered = tx.clone();
        tampered.s = tampered.s.overflowing_add(U256::one()).0;
        assert_ne!(tampered.hash(), tx.hash());
    }
}
