use crate::error::{BlockchainError, Result};
use crate::wallet::validate_address;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_NODE_ID: &str = "3000";
const DEFAULT_BOOTSTRAP_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

const NODE_ID_KEY: &str = "NODE_ID";
const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const BOOTSTRAP_NODE_KEY: &str = "BOOTSTRAP_NODE";
const DATA_DIR_KEY: &str = "DATA_DIR";

/// Settings for one node. Built by [`Config::load`] from defaults, an
/// optional TOML file and then the environment, later sources winning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub node_address: String,
    pub bootstrap_address: String,
    pub data_dir: PathBuf,
    pub mining_address: Option<String>,
    /// Pending transactions needed before a miner starts a block.
    pub mining_threshold: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_secs: u64,
}

// Every key is optional in the file; whatever is missing falls through.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    node_id: Option<String>,
    node_address: Option<String>,
    bootstrap_address: Option<String>,
    data_dir: Option<PathBuf>,
    mining_address: Option<String>,
    mining_threshold: Option<usize>,
    connect_timeout_ms: Option<u64>,
    read_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: DEFAULT_NODE_ID.to_string(),
            node_address: local_address(DEFAULT_NODE_ID),
            bootstrap_address: DEFAULT_BOOTSTRAP_ADDR.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            mining_address: None,
            mining_threshold: 1,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
        }
    }
}

fn local_address(node_id: &str) -> String {
    format!("127.0.0.1:{node_id}")
}

impl Config {
    /// Loads settings from `file` (if given) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Config> {
        Self::from_sources(file, |key| env::var(key).ok())
    }

    pub fn from_sources(
        file: Option<&Path>,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Config> {
        let file = match file {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    BlockchainError::Config(format!("Cannot read {}: {e}", path.display()))
                })?;
                toml::from_str::<ConfigFile>(&text).map_err(|e| {
                    BlockchainError::Config(format!("Cannot parse {}: {e}", path.display()))
                })?
            }
            None => ConfigFile::default(),
        };

        let defaults = Config::default();
        let node_id = env_lookup(NODE_ID_KEY)
            .or(file.node_id)
            .unwrap_or(defaults.node_id);
        let node_address = env_lookup(NODE_ADDRESS_KEY)
            .or(file.node_address)
            .unwrap_or_else(|| local_address(&node_id));

        let config = Config {
            bootstrap_address: env_lookup(BOOTSTRAP_NODE_KEY)
                .or(file.bootstrap_address)
                .unwrap_or(defaults.bootstrap_address),
            data_dir: env_lookup(DATA_DIR_KEY)
                .map(PathBuf::from)
                .or(file.data_dir)
                .unwrap_or(defaults.data_dir),
            mining_address: file.mining_address,
            mining_threshold: file.mining_threshold.unwrap_or(defaults.mining_threshold),
            connect_timeout_ms: file
                .connect_timeout_ms
                .unwrap_or(defaults.connect_timeout_ms),
            read_timeout_secs: file.read_timeout_secs.unwrap_or(defaults.read_timeout_secs),
            node_id,
            node_address,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(BlockchainError::Config("node_id must not be empty".to_string()));
        }
        if self.mining_threshold == 0 {
            return Err(BlockchainError::Config(
                "mining_threshold must be at least 1".to_string(),
            ));
        }
        if let Some(address) = &self.mining_address {
            if !validate_address(address) {
                return Err(BlockchainError::Config(format!(
                    "Invalid mining address: {address}"
                )));
            }
        }
        Ok(())
    }

    pub fn with_mining_address(mut self, address: Option<String>) -> Result<Config> {
        if address.is_some() {
            self.mining_address = address;
        }
        self.validate()?;
        Ok(self)
    }

    /// Directory of this node's sled database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("node_{}", self.node_id))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(format!("wallet_{}.dat", self.node_id))
    }

    pub fn is_bootstrap(&self) -> bool {
        self.node_address == self.bootstrap_address
    }

    pub fn is_miner(&self) -> bool {
        self.mining_address.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(None, env_of(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.is_bootstrap());
        assert!(!config.is_miner());
        assert_eq!(config.db_path(), PathBuf::from("data").join("node_3000"));
        assert_eq!(
            config.wallet_path(),
            PathBuf::from("data").join("wallet_3000.dat")
        );
    }

    #[test]
    fn test_node_id_drives_default_address() {
        let config = Config::from_sources(None, env_of(&[("NODE_ID", "3001")])).unwrap();
        assert_eq!(config.node_address, "127.0.0.1:3001");
        assert_eq!(config.bootstrap_address, "127.0.0.1:3000");
        assert!(!config.is_bootstrap());
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(
            &path,
            r#"
node_id = "4000"
data_dir = "/var/lib/chain"
bootstrap_address = "10.0.0.1:4000"
mining_threshold = 3
read_timeout_secs = 5
"#,
        )
        .unwrap();

        let config = Config::from_sources(
            Some(&path),
            env_of(&[("DATA_DIR", "/tmp/override"), ("NODE_ADDRESS", "10.0.0.2:4000")]),
        )
        .unwrap();

        assert_eq!(config.node_id, "4000");
        assert_eq!(config.node_address, "10.0.0.2:4000");
        assert_eq!(config.bootstrap_address, "10.0.0.1:4000");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/override"));
        assert_eq!(config.mining_threshold, 3);
        assert_eq!(config.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "difficulty = 4\n").unwrap();

        assert!(matches!(
            Config::from_sources(Some(&path), env_of(&[])),
            Err(BlockchainError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_mining_address_is_rejected() {
        let config = Config::default();
        assert!(matches!(
            config.with_mining_address(Some("nope".to_string())),
            Err(BlockchainError::Config(_))
        ));
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "mining_threshold = 0\n").unwrap();

        assert!(Config::from_sources(Some(&path), env_of(&[])).is_err());
    }
}
