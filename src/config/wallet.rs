//! Wallet Configuration
//!
//! Lists the networks a wallet tracks, where tracker state is persisted and
//! where the local status API listens. Stored as TOML.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::network::NetworkConfig;

/// Default local status API address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7171";

/// One network the wallet follows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkEntry {
    /// Display name, unique per wallet
    pub name: String,

    /// Seed miner urls; more are discovered from peek responses
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Directory holding the sled database
    pub data_dir: PathBuf,

    /// Address of the local status API
    pub listen: String,

    /// Consensus tracking knobs
    pub consensus: NetworkConfig,

    pub networks: Vec<NetworkEntry>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen: DEFAULT_LISTEN.to_string(),
            consensus: NetworkConfig::default(),
            networks: Vec::new(),
        }
    }
}

/// `~/.volition/wallet_data`, or `./wallet_data` when no home directory exists
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".volition").join("wallet_data"))
        .unwrap_or_else(|| PathBuf::from("./wallet_data"))
}

impl WalletConfig {
    /// Load wallet config from file, creating default if missing
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();

        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read wallet config: {}", e))?;
            let config: WalletConfig = toml::from_str(&content)
                .map_err(|e| format!("Failed to parse wallet config: {}", e))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save wallet config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize wallet config: {}", e))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create config directory: {}", e))?;
            }
        }
        fs::write(path, content).map_err(|e| format!("Failed to write wallet config: {}", e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        self.consensus.validate().map_err(|e| e.to_string())?;

        let mut seen = std::collections::HashSet::new();
        for network in &self.networks {
            if network.name.trim().is_empty() {
                return Err("network name must not be empty".to_string());
            }
            if !seen.insert(network.name.as_str()) {
                return Err(format!("duplicate network name: {}", network.name));
            }
        }
        Ok(())
    }

    /// Add or extend a network entry; urls are merged without duplicates
    pub fn upsert_network(&mut self, name: &str, urls: Vec<String>) {
        match self.networks.iter_mut().find(|n| n.name == name) {
            Some(entry) => {
                for url in urls {
                    if !entry.urls.contains(&url) {
                        entry.urls.push(url);
                    }
                }
            }
            None => self.networks.push(NetworkEntry {
                name: name.to_string(),
                urls,
            }),
        }
    }
}
