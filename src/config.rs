//! Node configuration, loaded from a JSON file. Every section carries
//! serde defaults matching the reference parameters, so a partial config
//! file (or none at all) yields a runnable node.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::Address;
use crate::errors::{ChainError, ChainResult};
use crate::sync::SyncMode;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct P2pConfig {
    pub listen_addr: String,
    pub max_peers: usize,
    pub bootnodes: Vec<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:30303".to_string(),
            max_peers: 50,
            bootnodes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub enabled: bool,
    pub mode: String,
    pub block_batch: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "full".to_string(),
            block_batch: 128,
        }
    }
}

impl SyncConfig {
    pub fn sync_mode(&self) -> SyncMode {
        match self.mode.as_str() {
            "fast" => SyncMode::Fast,
            "light" => SyncMode::Light,
            _ => SyncMode::Full,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcConfig {
    pub enabled: bool,
    pub listen_addr: String,
    /// HS256 secret; non-loopback clients must present a bearer token when
    /// this is set.
    pub jwt_secret: Option<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:8545".to_string(),
            jwt_secret: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StratumConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:3333".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MiningConfig {
    /// Hex address credited with block rewards on templates built here.
    pub coinbase: String,
    pub extra_data: String,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            coinbase: format!("{:#x}", Address::zero()),
            extra_data: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    pub p2p: P2pConfig,
    pub sync: SyncConfig,
    pub rpc: RpcConfig,
    pub stratum: StratumConfig,
    pub mining: MiningConfig,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            p2p: P2pConfig::default(),
            sync: SyncConfig::default(),
            rpc: RpcConfig::default(),
            stratum: StratumConfig::default(),
            mining: MiningConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn coinbase(&self) -> ChainResult<Address> {
        let stripped = self.mining.coinbase.trim_start_matches("0x");
        let bytes = hex::decode(stripped)
            .map_err(|err| ChainError::Config(format!("invalid coinbase: {err}")))?;
        if bytes.len() != 20 {
            return Err(ChainError::Config("coinbase must be 20 bytes".into()));
        }
        Ok(Address::from_slice(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = NodeConfig::default();
        assert!(config.rpc.enabled);
        assert!(!config.stratum.enabled);
        assert_eq!(config.sync.block_batch, 128);
        assert_eq!(config.sync.sync_mode(), SyncMode::Full);
        assert_eq!(config.coinbase().expect("parse"), Address::zero());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "rpc": { "listenAddr": "0.0.0.0:9999" } }"#).expect("parse");
        assert_eq!(config.rpc.listen_addr, "0.0.0.0:9999");
        assert_eq!(config.p2p.max_peers, 50);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn bad_coinbase_is_a_config_error() {
        let mut config = NodeConfig::default();
        config.mining.coinbase = "0x1234".to_string();
        assert!(config.coinbase().is_err());
    }

    #[test]
    fn sync_mode_parses_known_names() {
        let mut config = SyncConfig::default();
        config.mode = "fast".to_string();
        assert_eq!(config.sync_mode(), SyncMode::Fast);
        config.mode = "light".to_string();
        assert_eq!(config.sync_mode(), SyncMode::Light);
        config.mode = "anything".to_string();
        assert_eq!(config.sync_mode(), SyncMode::Full);
    }
}
