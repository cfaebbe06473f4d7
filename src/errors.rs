//! Error types for the consensus tracker.
//!
//! Probe failures never escape a scan round: the loop logs them and treats the
//! miner as silent for that round. `ConsensusError` is what the public API of a
//! network returns to its callers (admin actions, URL building, persistence).

use thiserror::Error;

/// Failure of a single probe against one miner.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("transport error talking to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("probe to {url} timed out")]
    Timeout { url: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl ProbeError {
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout {
                url: url.to_string(),
            }
        } else if err.is_decode() {
            ProbeError::Malformed {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else {
            ProbeError::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Transport { .. } => "transport",
            ProbeError::Timeout { .. } => "timeout",
            ProbeError::Status { .. } => "status",
            ProbeError::Malformed { .. } => "malformed",
        }
    }
}

/// Errors surfaced by network-level operations.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no reachable miner url known for network {0}")]
    NoMinerUrl(String),

    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error("network already exists: {0}")]
    NetworkExists(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

pub type Result<T, E = ConsensusError> = std::result::Result<T, E>;
