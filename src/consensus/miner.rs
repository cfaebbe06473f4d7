use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::prober::PeekResponse;

/// Opaque miner identity, stable across url changes
pub type MinerId = String;

/// One observed peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Miner {
    pub miner_id: MinerId,

    /// Best-known address; last successful probe wins
    pub url: String,

    /// Consensus checkpoint height in effect when this miner was probed.
    /// Not the miner's own chain height.
    pub height: u64,

    /// Digest at the checkpoint height, `None` if the miner lacks that block
    pub prev_digest: Option<String>,

    /// Digest at checkpoint + step, `None` if not mined yet on this miner
    pub peek_digest: Option<String>,

    #[serde(default)]
    pub is_busy: bool,

    pub last_seen: DateTime<Utc>,
}

impl Miner {
    pub fn new(miner_id: MinerId, url: String) -> Self {
        Self {
            miner_id,
            url,
            height: 0,
            prev_digest: None,
            peek_digest: None,
            is_busy: false,
            last_seen: Utc::now(),
        }
    }

    /// Record a successful probe issued at checkpoint `height`
    pub fn observe(&mut self, url: &str, height: u64, response: &PeekResponse) {
        self.url = url.to_string();
        self.height = height;
        self.prev_digest = response.prev_digest().map(str::to_string);
        self.peek_digest = response.peek_digest().map(str::to_string);
        self.is_busy = false;
        self.last_seen = Utc::now();
    }

    /// Whether this miner holds the checkpoint block
    pub fn has_checkpoint(&self) -> bool {
        self.prev_digest.is_some()
    }
}
