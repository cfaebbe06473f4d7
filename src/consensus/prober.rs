//! Single best-effort probes against one miner.
//!
//! `GET <miner>/consensus/peek?peek=<next>&prev=<current>&sampleMiners=<n>`
//! returns the miner's identity, the digests it holds at both heights and a
//! sample of peer urls. `GET <miner>/` returns just the identity.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use super::miner::MinerId;
use super::registry::format_service_url;
use crate::errors::ProbeError;

/// Block header reference inside a peek response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub digest: String,
}

/// Body of `/consensus/peek`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeekResponse {
    #[serde(rename = "minerID")]
    pub miner_id: MinerId,

    /// Header at the checkpoint height, null when the miner lacks it
    #[serde(default)]
    pub prev: Option<BlockRef>,

    /// Header at the look-ahead height, null when not mined yet
    #[serde(default)]
    pub peek: Option<BlockRef>,

    /// Sample of peer urls known to the miner
    #[serde(default)]
    pub miners: Vec<String>,
}

impl PeekResponse {
    pub fn prev_digest(&self) -> Option<&str> {
        self.prev.as_ref().map(|b| b.digest.as_str())
    }

    pub fn peek_digest(&self) -> Option<&str> {
        self.peek.as_ref().map(|b| b.digest.as_str())
    }

    /// Decode and sanity-check a raw response body
    pub fn parse(url: &str, body: &[u8]) -> Result<Self, ProbeError> {
        let response: PeekResponse =
            serde_json::from_slice(body).map_err(|e| ProbeError::Malformed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        response.validate(url)?;
        Ok(response)
    }

    fn validate(&self, url: &str) -> Result<(), ProbeError> {
        if self.miner_id.trim().is_empty() {
            return Err(ProbeError::Malformed {
                url: url.to_string(),
                reason: "empty minerID".to_string(),
            });
        }
        for digest in [self.prev_digest(), self.peek_digest()].into_iter().flatten() {
            if digest.is_empty() || hex::decode(digest).is_err() {
                return Err(ProbeError::Malformed {
                    url: url.to_string(),
                    reason: format!("digest is not hex: {:?}", digest),
                });
            }
        }
        Ok(())
    }
}

/// Body of `GET /`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerIdentity {
    #[serde(rename = "minerID")]
    pub miner_id: MinerId,
}

/// Transport used by the consensus loop to reach miners.
pub trait PeerProber: Send + Sync + 'static {
    /// One peek probe. Errors are per-round only; the caller never retries.
    fn probe(
        &self,
        miner_url: &str,
        current_height: u64,
        next_height: u64,
        sample_size: usize,
    ) -> impl Future<Output = Result<PeekResponse, ProbeError>> + Send;

    /// Ask a miner for its identity
    fn identify(&self, miner_url: &str)
        -> impl Future<Output = Result<MinerId, ProbeError>> + Send;
}

/// `reqwest`-backed prober; every request carries the configured timeout
#[derive(Debug, Clone)]
pub struct HttpProber {
    http: Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::from_reqwest("<client>", e))?;
        Ok(Self { http })
    }

    async fn get_body(&self, url: &str) -> Result<Vec<u8>, ProbeError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeError::from_reqwest(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProbeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ProbeError::from_reqwest(url, e))?;
        Ok(bytes.to_vec())
    }
}

/// Url of a peek probe
pub fn peek_url(
    miner_url: &str,
    current_height: u64,
    next_height: u64,
    sample_size: usize,
) -> Result<String, ProbeError> {
    let peek = next_height.to_string();
    let prev = current_height.to_string();
    let sample = sample_size.to_string();
    format_service_url(
        miner_url,
        "consensus/peek",
        &[
            ("peek", peek.as_str()),
            ("prev", prev.as_str()),
            ("sampleMiners", sample.as_str()),
        ],
        None,
    )
    .map_err(|e| ProbeError::Malformed {
        url: miner_url.to_string(),
        reason: e.to_string(),
    })
}

impl PeerProber for HttpProber {
    async fn probe(
        &self,
        miner_url: &str,
        current_height: u64,
        next_height: u64,
        sample_size: usize,
    ) -> Result<PeekResponse, ProbeError> {
        let url = peek_url(miner_url, current_height, next_height, sample_size)?;
        let body = self.get_body(&url).await?;
        PeekResponse::parse(miner_url, &body)
    }

    async fn identify(&self, miner_url: &str) -> Result<MinerId, ProbeError> {
        let url = format!("{}/", miner_url.trim_end_matches('/'));
        let body = self.get_body(&url).await?;
        let identity: MinerIdentity =
            serde_json::from_slice(&body).map_err(|e| ProbeError::Malformed {
                url: miner_url.to_string(),
                reason: e.to_string(),
            })?;
        if identity.miner_id.trim().is_empty() {
            return Err(ProbeError::Malformed {
                url: miner_url.to_string(),
                reason: "empty minerID".to_string(),
            });
        }
        Ok(identity.miner_id)
    }
}
