//! sled-backed persistence for tracker state.
//!
//! Layout (values are JSON):
//!   consensus:<network>  -> ConsensusState
//!   urls:<network>       -> [url, ...]

use std::path::Path;
use tracing::debug;

use crate::consensus::ConsensusState;
use crate::errors::Result;

const STATE_PREFIX: &str = "consensus:";
const URLS_PREFIX: &str = "urls:";

#[derive(Clone)]
pub struct ConsensusStore {
    db: sled::Db,
}

impl ConsensusStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(
            target: "volition::store",
            "[STORE] Opened consensus store at {}",
            path.as_ref().display()
        );
        Ok(Self { db })
    }

    /// In-memory store that disappears on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn save_state(&self, network: &str, state: &ConsensusState) -> Result<()> {
        let value = serde_json::to_vec(state)?;
        self.db.insert(state_key(network), value)?;
        Ok(())
    }

    pub fn load_state(&self, network: &str) -> Result<Option<ConsensusState>> {
        match self.db.get(state_key(network))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn save_urls(&self, network: &str, urls: &[String]) -> Result<()> {
        let value = serde_json::to_vec(urls)?;
        self.db.insert(urls_key(network), value)?;
        Ok(())
    }

    pub fn load_urls(&self, network: &str) -> Result<Vec<String>> {
        match self.db.get(urls_key(network))? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Names of every network with persisted state
    pub fn network_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.db.scan_prefix(STATE_PREFIX.as_bytes()) {
            let (key, _) = entry?;
            if let Some(name) = std::str::from_utf8(&key)
                .ok()
                .and_then(|k| k.strip_prefix(STATE_PREFIX))
            {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    pub fn delete_network(&self, network: &str) -> Result<()> {
        self.db.remove(state_key(network))?;
        self.db.remove(urls_key(network))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn state_key(network: &str) -> Vec<u8> {
    format!("{}{}", STATE_PREFIX, network).into_bytes()
}

fn urls_key(network: &str) -> Vec<u8> {
    format!("{}{}", URLS_PREFIX, network).into_bytes()
}
