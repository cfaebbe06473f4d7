//! Per-network consensus service and the wallet's set of networks.
//!
//! `NetworkStateService` composes one tracker, its scan loop and the store for
//! a single network, and is what other subsystems (transaction submission,
//! UI) hold on to. `Networks` owns every service of a wallet and is passed
//! around explicitly instead of living in a global.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::consensus::registry::{format_service_url, normalize_url};
use crate::consensus::{
    ConsensusInfo, ConsensusLoop, ConsensusSnapshot, ConsensusState, ConsensusTracker,
    HttpProber, Miner, MinerId, PeerProber, PeerRegistry,
};
use crate::errors::{ConsensusError, Result};
use crate::store::ConsensusStore;

/// Read interface consumed by collaborators that must stay consistent with
/// the agreed chain view.
pub trait ConsensusView {
    /// `{height, digest, isCurrent, genesis}`
    fn consensus_state(&self) -> ConsensusInfo;

    /// Url for `path` on an agreeing miner. Unless `use_most_current_height`
    /// is set the query is pinned to the agreed height with `at=`.
    fn service_url(
        &self,
        path: &str,
        query: &[(&str, &str)],
        use_most_current_height: bool,
    ) -> Result<String>;
}

/// Urls and observed miners of a network
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerListing {
    pub urls: Vec<String>,
    pub miners: Vec<Miner>,
}

pub struct NetworkStateService<P = HttpProber> {
    scan_loop: ConsensusLoop<P>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PeerProber> NetworkStateService<P> {
    /// Build a service from persisted state (if any) plus seed urls. The scan
    /// loop is not started; call `start`.
    pub fn new(
        name: &str,
        seed_urls: &[String],
        prober: P,
        config: NetworkConfig,
        store: Option<ConsensusStore>,
    ) -> Result<Self> {
        let (state, mut registry) = match &store {
            Some(store) => {
                let state = store
                    .load_state(name)?
                    .unwrap_or_else(|| ConsensusState::with_threshold(config.threshold));
                (state, PeerRegistry::with_urls(store.load_urls(name)?))
            }
            None => (
                ConsensusState::with_threshold(config.threshold),
                PeerRegistry::new(),
            ),
        };
        registry.add_urls(seed_urls);

        let tracker = ConsensusTracker::new(name, state, registry);
        Ok(Self {
            scan_loop: ConsensusLoop::new(tracker, prober, config, store),
            handle: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.scan_loop.network()
    }

    pub fn scan_loop(&self) -> &ConsensusLoop<P> {
        &self.scan_loop
    }

    /// Start the background scan loop; no-op if already running
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_none() && !self.scan_loop.is_cancelled() {
            if self.scan_loop.inspect(|tracker| tracker.registry().is_empty()) {
                warn!(
                    target: "volition::consensus",
                    "[CONSENSUS] {} has no miner urls yet; waiting for some to be added",
                    self.name()
                );
            }
            *handle = Some(self.scan_loop.spawn());
        }
    }

    /// Stop scanning. Late probe results are discarded.
    pub fn shutdown(&self) {
        self.scan_loop.shutdown();
    }

    /// Stop scanning and wait for the loop task to exit
    pub async fn shutdown_and_wait(&self) {
        self.scan_loop.shutdown();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(
                    target: "volition::consensus",
                    "[CONSENSUS] {} loop task ended abnormally: {}",
                    self.name(),
                    e
                );
            }
        }
    }

    pub fn snapshot(&self) -> Arc<ConsensusSnapshot> {
        self.scan_loop.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConsensusSnapshot>> {
        self.scan_loop.subscribe()
    }

    pub fn get_consensus_state(&self) -> ConsensusInfo {
        ConsensusInfo::from(&self.snapshot().state)
    }

    /// Full agreed state, including step and threshold
    pub fn full_state(&self) -> ConsensusState {
        self.snapshot().state.clone()
    }

    pub fn reset_consensus(&self) {
        self.scan_loop.reset();
    }

    /// Manual step override; discards results of probes already in flight
    pub fn set_step(&self, step: u64) {
        self.scan_loop.set_step(step);
    }

    /// Manual quorum threshold override. Applies from the next decision on.
    pub fn set_threshold(&self, threshold: u32) -> Result<()> {
        self.scan_loop
            .update(|tracker| tracker.set_threshold(threshold))
    }

    /// Merge urls into the registry; returns how many were new
    pub fn add_urls(&self, urls: &[String]) -> usize {
        let added = self
            .scan_loop
            .update(|tracker| tracker.registry_mut().add_urls(urls));
        if added > 0 {
            self.scan_loop.wake();
        }
        added
    }

    /// Confirm a hand-entered url answers with a miner identity before adding it
    pub async fn add_confirmed_url(&self, url: &str) -> Result<MinerId> {
        let normalized = normalize_url(url).ok_or_else(|| ConsensusError::InvalidUrl {
            url: url.to_string(),
            reason: "expected an absolute http(s) url".to_string(),
        })?;
        let miner_id = self.scan_loop.prober().identify(&normalized).await?;
        info!(
            target: "volition::consensus",
            "[CONSENSUS] {} confirmed miner {} at {}",
            self.name(),
            miner_id,
            normalized
        );
        self.add_urls(&[normalized]);
        Ok(miner_id)
    }

    pub fn miners(&self) -> MinerListing {
        self.scan_loop.inspect(|tracker| MinerListing {
            urls: tracker.registry().urls(),
            miners: tracker.miners().cloned().collect(),
        })
    }

    /// Base url for service reads: an agreeing miner if any, else any known url
    fn pick_base_url(&self) -> Result<String> {
        let snapshot = self.snapshot();
        let mut rng = rand::thread_rng();
        if let Some(url) = snapshot.agreeing_urls.choose(&mut rng) {
            return Ok(url.clone());
        }
        let urls = self.scan_loop.inspect(|tracker| tracker.registry().urls());
        urls.choose(&mut rng)
            .cloned()
            .ok_or_else(|| ConsensusError::NoMinerUrl(self.name().to_string()))
    }
}

impl<P: PeerProber> ConsensusView for NetworkStateService<P> {
    fn consensus_state(&self) -> ConsensusInfo {
        self.get_consensus_state()
    }

    fn service_url(
        &self,
        path: &str,
        query: &[(&str, &str)],
        use_most_current_height: bool,
    ) -> Result<String> {
        let base = self.pick_base_url()?;
        let pin = (!use_most_current_height).then(|| self.snapshot().state.height);
        format_service_url(&base, path, query, pin)
    }
}

/// Every network a wallet tracks, by name
pub struct Networks<P = HttpProber> {
    prober: P,
    config: NetworkConfig,
    store: Option<ConsensusStore>,
    networks: DashMap<String, Arc<NetworkStateService<P>>>,
}

impl<P: PeerProber + Clone> Networks<P> {
    pub fn new(prober: P, config: NetworkConfig, store: Option<ConsensusStore>) -> Self {
        Self {
            prober,
            config,
            store,
            networks: DashMap::new(),
        }
    }

    /// Create a network and start tracking it
    pub fn add_network(&self, name: &str, seed_urls: &[String]) -> Result<Arc<NetworkStateService<P>>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConsensusError::Config(
                "network name must not be empty".to_string(),
            ));
        }

        let entry = match self.networks.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ConsensusError::NetworkExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let service = Arc::new(NetworkStateService::new(
            name,
            seed_urls,
            self.prober.clone(),
            self.config.clone(),
            self.store.clone(),
        )?);
        service.start();
        entry.insert(Arc::clone(&service));

        info!(
            target: "volition::consensus",
            "[NETWORKS] Tracking network {} ({} seed url(s))",
            name,
            seed_urls.len()
        );
        Ok(service)
    }

    /// Add a network, or extend an existing one with more seed urls
    pub fn ensure_network(&self, name: &str, seed_urls: &[String]) -> Result<Arc<NetworkStateService<P>>> {
        if let Some(existing) = self.get(name) {
            existing.add_urls(seed_urls);
            return Ok(existing);
        }
        self.add_network(name, seed_urls)
    }

    pub fn get(&self, name: &str) -> Option<Arc<NetworkStateService<P>>> {
        self.networks.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn require(&self, name: &str) -> Result<Arc<NetworkStateService<P>>> {
        self.get(name)
            .ok_or_else(|| ConsensusError::UnknownNetwork(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.networks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop tracking a network and forget its miners and persisted state
    pub async fn delete_network(&self, name: &str) -> Result<()> {
        let (_, service) = self
            .networks
            .remove(name)
            .ok_or_else(|| ConsensusError::UnknownNetwork(name.to_string()))?;
        service.shutdown_and_wait().await;
        if let Some(store) = &self.store {
            store.delete_network(name)?;
        }
        info!(
            target: "volition::consensus",
            "[NETWORKS] Deleted network {}",
            name
        );
        Ok(())
    }

    /// Restart tracking for every network with persisted state
    pub fn restore_persisted(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut restored = 0;
        for name in store.network_names()? {
            if self.get(&name).is_none() {
                self.add_network(&name, &[])?;
                restored += 1;
            }
        }
        Ok(restored)
    }

    pub async fn shutdown_all(&self) {
        let services: Vec<_> = self.networks.iter().map(|e| Arc::clone(e.value())).collect();
        for service in services {
            service.shutdown_and_wait().await;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.flush() {
                warn!(
                    target: "volition::store",
                    "[STORE] Flush on shutdown failed: {}",
                    e
                );
            }
        }
    }
}
