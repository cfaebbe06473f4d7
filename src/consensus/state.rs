//! Agreed chain view for one network, plus the snapshot published to readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The tracker's agreed view of a network.
///
/// `digest` and `genesis` are `None` until measured. Every field is replaced
/// as a whole by the tracker's decision step; nothing else mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusState {
    /// Last height miners agreed on
    pub height: u64,

    /// Hash of the block at `height`
    #[serde(default)]
    pub digest: Option<String>,

    /// Hash of block 0, fixed once learned
    #[serde(default)]
    pub genesis: Option<String>,

    /// Look-ahead distance probed next round (`height + step`)
    pub step: u64,

    /// True once the tracker believes it caught up with the head
    pub is_current: bool,

    /// Minimum number of miners at the checkpoint before a round decides
    #[serde(default = "default_threshold")]
    pub threshold: u32,
}

fn default_threshold() -> u32 {
    1
}

impl Default for ConsensusState {
    fn default() -> Self {
        Self {
            height: 0,
            digest: None,
            genesis: None,
            step: 0,
            is_current: false,
            threshold: default_threshold(),
        }
    }
}

impl ConsensusState {
    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            ..Default::default()
        }
    }

    /// Height probed as "next" this round
    pub fn next_height(&self) -> u64 {
        self.height.saturating_add(self.step)
    }

    /// Zero state used after a user reset. The threshold is an operator
    /// setting and survives; a learned genesis is forgotten.
    pub fn reset(&self) -> Self {
        Self::with_threshold(self.threshold)
    }
}

/// Immutable view of a network after a round, handed to readers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSnapshot {
    pub network: String,
    pub state: ConsensusState,

    /// Urls of the miners that agreed in the last deciding round
    pub agreeing_urls: Vec<String>,

    pub known_urls: usize,
    pub miner_count: usize,

    /// Number of completed scans
    pub round: u64,

    pub updated_at: DateTime<Utc>,
}

/// Outward-facing subset of the state: `{height, digest, isCurrent, genesis}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusInfo {
    pub height: u64,
    pub digest: Option<String>,
    pub is_current: bool,
    pub genesis: Option<String>,
}

impl From<&ConsensusState> for ConsensusInfo {
    fn from(state: &ConsensusState) -> Self {
        Self {
            height: state.height,
            digest: state.digest.clone(),
            is_current: state.is_current,
            genesis: state.genesis.clone(),
        }
    }
}
