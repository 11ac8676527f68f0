mod block;
mod transaction;

pub use block::{Block, BlockHeader};
pub use transaction::Transaction;

pub use crate::crypto::Address;

/// Serde adapter encoding byte buffers as `0x`-prefixed hex strings, used by
/// every wire- and hash-visible type so canonical encodings stay readable.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(
        bytes: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes.as_ref())))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let stripped = text.strip_prefix("0x").unwrap_or(&text);
        hex::decode(stripped).map_err(serde::de::Error::custom)
    }
}
