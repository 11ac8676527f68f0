//! Digests, address derivation and signature recovery.
//!
//! Everything consensus-visible hashes with Keccak-256. SHA-256 appears only
//! as the key of the proof-of-work engine cache. The merkle helper commits to
//! an unordered leaf set by sorting before aggregation, so semantically equal
//! states digest equally regardless of iteration order.

use ethereum_types::{H160, H256, U256};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest, Keccak256};

use crate::errors::{ChainError, ChainResult};

pub type Address = H160;

/// Keccak-256 digest of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// SHA-256 digest, used to key the per-seed PoW engine cache.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Binary merkle root over the provided leaves. Leaves are sorted before the
/// tree is built so the root is stable across insertion orders; an odd node
/// pairs with itself. Empty input commits to a fixed domain tag.
pub fn merkle_root(mut leaves: Vec<H256>) -> H256 {
    if leaves.is_empty() {
        return keccak256(b"nogochain-empty");
    }
    leaves.sort();
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(left.as_bytes());
            data[32..].copy_from_slice(right.as_bytes());
            next.push(keccak256(&data));
        }
        leaves = next;
    }
    leaves[0]
}

/// Contract address for CREATE: `keccak(rlp([caller, nonce]))[12..]`.
pub fn create_address(caller: Address, nonce: u64) -> Address {
    let mut stream = rlp::RlpStream::new_list(2);
    stream.append(&caller);
    stream.append(&nonce);
    let hash = keccak256(&stream.out());
    Address::from_slice(&hash[12..])
}

/// Contract address for CREATE2:
/// `keccak(0xff ‖ caller ‖ salt ‖ keccak(initcode))[12..]`.
pub fn create2_address(caller: Address, salt: H256, initcode: &[u8]) -> Address {
    let code_hash = keccak256(initcode);
    let mut data = Vec::with_capacity(1 + 20 + 32 + 32);
    data.push(0xff);
    data.extend_from_slice(caller.as_bytes());
    data.extend_from_slice(salt.as_bytes());
    data.extend_from_slice(code_hash.as_bytes());
    let hash = keccak256(&data);
    Address::from_slice(&hash[12..])
}

/// Recover the signer address from a 32-byte message digest and an
/// `(v, r, s)` signature. Accepts the pre-EIP-155 recovery ids 27/28 and the
/// chain-id-folded form `chain_id * 2 + 35/36`.
pub fn recover_address(digest: H256, v: U256, r: U256, s: U256) -> ChainResult<Address> {
    let recovery = normalize_recovery_id(v)?;
    let mut sig_bytes = [0u8; 64];
    r.to_big_endian(&mut sig_bytes[..32]);
    s.to_big_endian(&mut sig_bytes[32..]);
    let signature = EcdsaSignature::from_slice(&sig_bytes)
        .map_err(|err| ChainError::Crypto(format!("malformed signature: {err}")))?;
    let recovery_id = RecoveryId::try_from(recovery)
        .map_err(|err| ChainError::Crypto(format!("invalid recovery id: {err}")))?;
    let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id)
        .map_err(|err| ChainError::Crypto(format!("signature recovery failed: {err}")))?;
    Ok(public_key_to_address(&key))
}

/// Ethereum address of a secp256k1 public key: last 20 bytes of the keccak
/// digest of the uncompressed point (without the 0x04 prefix).
pub fn public_key_to_address(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

fn normalize_recovery_id(v: U256) -> ChainResult<u8> {
    let v = v.low_u64();
    match v {
        0 | 1 => Ok(v as u8),
        27 | 28 => Ok((v - 27) as u8),
        _ if v >= 35 => Ok(((v - 35) % 2) as u8),
        _ => Err(ChainError::Crypto(format!("invalid signature v value {v}"))),
    }
}

pub mod jwt {
    //! Minimal HS256 bearer tokens for the RPC surface. Tokens carry `iat`
    //! and `exp` claims and travel as `Authorization: Bearer <token>`.

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use hmac::{Hmac, Mac};
    use serde::{Deserialize, Serialize};
    use sha2::Sha256;

    use crate::errors::{ChainError, ChainResult};

    #[derive(Debug, Serialize, Deserialize)]
    struct Header {
        alg: String,
        typ: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Claims {
        pub iat: u64,
        pub exp: u64,
    }

    fn sign_input(secret: &[u8], input: &str) -> ChainResult<Vec<u8>> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|err| ChainError::Crypto(format!("invalid hmac key: {err}")))?;
        mac.update(input.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Issue a token valid for `ttl_secs` starting at `now` (unix seconds).
    pub fn issue(secret: &[u8], now: u64, ttl_secs: u64) -> ChainResult<String> {
        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let claims = Claims {
            iat: now,
            exp: now + ttl_secs,
        };
        let encoded_header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let encoded_claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let input = format!("{encoded_header}.{encoded_claims}");
        let signature = URL_SAFE_NO_PAD.encode(sign_input(secret, &input)?);
        Ok(format!("{input}.{signature}"))
    }

    /// Verify a token's signature and expiry against `now` (unix seconds).
    pub fn verify(secret: &[u8], token: &str, now: u64) -> ChainResult<Claims> {
        let mut parts = token.split('.');
        let (header, claims, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s)) if parts.next().is_none() => (h, c, s),
            _ => return Err(ChainError::Crypto("malformed token".into())),
        };
        let input = format!("{header}.{claims}");
        let expected = sign_input(secret, &input)?;
        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ChainError::Crypto("malformed token signature".into()))?;
        if expected != presented {
            return Err(ChainError::Crypto("token signature mismatch".into()));
        }
        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims)
            .map_err(|_| ChainError::Crypto("malformed token claims".into()))?;
        let claims: Claims = serde_json::from_slice(&claims_bytes)?;
        if claims.exp <= now {
            return Err(ChainError::Crypto("token expired".into()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    #[test]
    fn keccak_matches_known_vector() {
        // keccak256 of the empty string.
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn merkle_root_is_order_independent() {
        let a = keccak256(b"a");
        let b = keccak256(b"b");
        let c = keccak256(b"c");
        assert_eq!(merkle_root(vec![a, b, c]), merkle_root(vec![c, a, b]));
        assert_ne!(merkle_root(vec![a, b]), merkle_root(vec![a, c]));
    }

    #[test]
    fn create_address_changes_with_nonce() {
        let caller = Address::repeat_byte(0x11);
        assert_ne!(create_address(caller, 0), create_address(caller, 1));
    }

    #[test]
    fn create2_address_commits_to_initcode() {
        let caller = Address::repeat_byte(0x22);
        let salt = H256::repeat_byte(0x01);
        assert_ne!(
            create2_address(caller, salt, b"code-a"),
            create2_address(caller, salt, b"code-b")
        );
    }

    #[test]
    fn recover_round_trips_a_signature() {
        let key = SigningKey::from_slice(&[0x42u8; 32]).expect("signing key");
        let digest = keccak256(b"payload");
        let (signature, recovery) = key
            .sign_prehash_recoverable(digest.as_bytes())
            .expect("sign");
        let r = U256::from_big_endian(&signature.to_bytes()[..32]);
        let s = U256::from_big_endian(&signature.to_bytes()[32..]);
        let v = U256::from(27u64 + recovery.to_byte() as u64);
        let recovered = recover_address(digest, v, r, s).expect("recover");
        assert_eq!(recovered, public_key_to_address(key.verifying_key()));
    }

    #[test]
    fn jwt_round_trip_and_expiry() {
        let token = jwt::issue(b"secret", 1_000, 60).expect("issue");
        let claims = jwt::verify(b"secret", &token, 1_030).expect("verify");
        assert_eq!(claims.iat, 1_000);
        assert!(jwt::verify(b"secret", &token, 2_000).is_err());
        assert!(jwt::verify(b"other", &token, 1_030).is_err());
    }
}
