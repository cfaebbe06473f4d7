//! Known miner urls for one network.
//!
//! The set only ever grows: a failed probe never drops a url, and peek
//! responses feed new urls back in (extend-network). Urls are tracked
//! independently of whether a miner identity was confirmed behind them.

use std::collections::{BTreeSet, HashSet};
use tracing::debug;
use url::Url;

use crate::errors::ConsensusError;

#[derive(Debug, Default, Clone)]
pub struct PeerRegistry {
    known: BTreeSet<String>,
    in_flight: HashSet<String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        registry.add_urls(urls);
        registry
    }

    /// Merge candidate urls into the known set.
    ///
    /// Returns the number of urls that were not known before. Invalid
    /// entries are skipped.
    pub fn add_urls<I, S>(&mut self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for raw in urls {
            let Some(url) = normalize_url(raw.as_ref()) else {
                debug!(
                    target: "volition::registry",
                    "[REGISTRY] Ignoring invalid miner url: {:?}",
                    raw.as_ref()
                );
                continue;
            };
            if self.known.insert(url) {
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, url: &str) -> bool {
        normalize_url(url).is_some_and(|u| self.known.contains(&u))
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Known urls in sorted order
    pub fn urls(&self) -> Vec<String> {
        self.known.iter().cloned().collect()
    }

    /// Mark every idle url busy and return them; these are this round's probe targets
    pub fn begin_probes(&mut self) -> Vec<String> {
        let targets: Vec<String> = self
            .known
            .iter()
            .filter(|u| !self.in_flight.contains(*u))
            .cloned()
            .collect();
        self.in_flight.extend(targets.iter().cloned());
        targets
    }

    pub fn end_probe(&mut self, url: &str) {
        self.in_flight.remove(url);
    }

    pub fn busy_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Canonical form of a miner url: trimmed, absolute http(s), no trailing slash
pub fn normalize_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = Url::parse(trimmed).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    Some(parsed.as_str().trim_end_matches('/').to_string())
}

/// Build a request url against `base`.
///
/// When `pin_height` is set the query gets `at=<height>` so reads stay
/// consistent with the local consensus view even if the node has moved on.
pub fn format_service_url(
    base: &str,
    path: &str,
    query: &[(&str, &str)],
    pin_height: Option<u64>,
) -> Result<String, ConsensusError> {
    let joined = format!(
        "{}/{}",
        base.trim().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let mut url = Url::parse(&joined).map_err(|e| ConsensusError::InvalidUrl {
        url: joined.clone(),
        reason: e.to_string(),
    })?;

    if !query.is_empty() || pin_height.is_some() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
        if let Some(height) = pin_height {
            pairs.append_pair("at", &height.to_string());
        }
    }

    Ok(url.to_string())
}
