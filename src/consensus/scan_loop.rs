//! Scan scheduler for one network.
//!
//! A scan probes every idle known url concurrently, folds all results into the
//! tracker, then runs one decision step under a single lock so readers never
//! see half a round. The next scan follows after the tracker's delay: zero
//! while seeking, `current_delay_ms` once current.
//!
//! Results are tagged with the epoch they were issued in. `reset()` and
//! `shutdown()` bump the epoch, so probes that complete afterwards are dropped
//! instead of being applied to a state they were not measured against.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::prober::PeerProber;
use super::state::ConsensusSnapshot;
use super::tracker::{ConsensusTracker, Decision};
use crate::config::NetworkConfig;
use crate::store::ConsensusStore;

/// Rounds in a row nobody answered before the loop starts pausing between them
pub const EMPTY_ROUNDS_BEFORE_IDLE: u32 = 3;

/// Result of one scan
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// `None` when the round's results were discarded
    pub decision: Option<Decision>,
    pub probed: usize,
    pub responded: usize,
    /// Delay the tracker asks for before the next scan
    pub delay: Duration,
}

struct LoopShared<P> {
    network: String,
    tracker: Mutex<ConsensusTracker>,
    prober: P,
    config: NetworkConfig,
    store: Option<ConsensusStore>,
    epoch: AtomicU64,
    scanning: AtomicBool,
    cancelled: AtomicBool,
    wake: Notify,
    snapshots: watch::Sender<Arc<ConsensusSnapshot>>,
}

/// Cloneable handle; all clones drive the same tracker.
pub struct ConsensusLoop<P> {
    inner: Arc<LoopShared<P>>,
}

impl<P> Clone for ConsensusLoop<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Clears the scanning flag when a scan ends, including on cancellation
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<P: PeerProber> ConsensusLoop<P> {
    pub fn new(
        tracker: ConsensusTracker,
        prober: P,
        config: NetworkConfig,
        store: Option<ConsensusStore>,
    ) -> Self {
        let network = tracker.network().to_string();
        let (snapshots, _) = watch::channel(Arc::new(tracker.snapshot()));
        Self {
            inner: Arc::new(LoopShared {
                network,
                tracker: Mutex::new(tracker),
                prober,
                config,
                store,
                epoch: AtomicU64::new(0),
                scanning: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                wake: Notify::new(),
                snapshots,
            }),
        }
    }

    pub fn network(&self) -> &str {
        &self.inner.network
    }

    pub fn prober(&self) -> &P {
        &self.inner.prober
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<ConsensusSnapshot> {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConsensusSnapshot>> {
        self.inner.snapshots.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Run `f` against the tracker under the lock, then publish and persist
    pub fn update<R>(&self, f: impl FnOnce(&mut ConsensusTracker) -> R) -> R {
        let mut tracker = self.inner.tracker.lock();
        let out = f(&mut tracker);
        self.commit(&tracker);
        out
    }

    /// Read-only access to the tracker
    pub fn inspect<R>(&self, f: impl FnOnce(&ConsensusTracker) -> R) -> R {
        let tracker = self.inner.tracker.lock();
        f(&tracker)
    }

    /// Zero the state and discard probes issued before the reset
    pub fn reset(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.update(|tracker| tracker.reset());
        info!(
            target: "volition::consensus",
            "[CONSENSUS] {} reset to zero state",
            self.inner.network
        );
        self.inner.wake.notify_one();
    }

    /// Step override. Probes in flight were aimed at the old look-ahead
    /// height, so their results are discarded.
    pub fn set_step(&self, step: u64) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.update(|tracker| tracker.set_step(step));
        self.inner.wake.notify_one();
    }

    /// Cut the current sleep short
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Stop the loop. Probes still in flight finish but are not applied.
    pub fn shutdown(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.wake.notify_one();
        info!(
            target: "volition::consensus",
            "[CONSENSUS] {} tracker shut down",
            self.inner.network
        );
    }

    /// Run one scan unless another is already in progress
    pub async fn try_scan(&self) -> Option<ScanReport> {
        if self.is_cancelled() {
            return None;
        }
        if self
            .inner
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                target: "volition::consensus",
                "[CONSENSUS] {} scan already running, skipping",
                self.inner.network
            );
            return None;
        }
        let _guard = ScanGuard(&self.inner.scanning);
        Some(self.scan().await)
    }

    async fn scan(&self) -> ScanReport {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let plan = self.inner.tracker.lock().begin_round();

        if plan.targets.is_empty() {
            let is_current = self.inner.tracker.lock().state().is_current;
            return ScanReport {
                decision: None,
                probed: 0,
                responded: 0,
                delay: self.inner.config.next_delay(is_current),
            };
        }

        let sample = self.inner.config.sample_miners;
        let prober = &self.inner.prober;
        let height = plan.height;
        let next_height = plan.next_height;
        let results = join_all(plan.targets.iter().map(|url| async move {
            let result = prober.probe(url, height, next_height, sample).await;
            (url.as_str(), result)
        }))
        .await;

        let probed = results.len();
        let responded = results.iter().filter(|(_, r)| r.is_ok()).count();

        let mut tracker = self.inner.tracker.lock();
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            for (url, _) in &results {
                tracker.abandon_probe(url);
            }
            debug!(
                target: "volition::consensus",
                "[CONSENSUS] {} discarded {} stale probe result(s)",
                self.inner.network, probed
            );
            return ScanReport {
                decision: None,
                probed,
                responded,
                delay: self.inner.config.next_delay(tracker.state().is_current),
            };
        }

        for (url, result) in results {
            tracker.record_probe(url, height, result);
        }
        let (decision, tally) = tracker.finish_round(&plan);
        self.commit(&tracker);

        debug!(
            target: "volition::consensus",
            "[CONSENSUS] {} round {}: {} probed, {} answered, {} at checkpoint, decision={}",
            self.inner.network,
            tracker.round(),
            probed,
            responded,
            tally.miner_count,
            decision.as_str()
        );

        ScanReport {
            decision: Some(decision),
            probed,
            responded,
            delay: self.inner.config.next_delay(tracker.state().is_current),
        }
    }

    /// Publish the tracker's snapshot and persist it. Caller holds the lock.
    fn commit(&self, tracker: &ConsensusTracker) {
        let snapshot = Arc::new(tracker.snapshot());
        self.inner.snapshots.send_replace(snapshot);

        if let Some(store) = &self.inner.store {
            let network = &self.inner.network;
            if let Err(e) = store.save_state(network, tracker.state()) {
                warn!(
                    target: "volition::store",
                    "[STORE] Failed to persist consensus state for {}: {}",
                    network, e
                );
            }
            if let Err(e) = store.save_urls(network, &tracker.registry().urls()) {
                warn!(
                    target: "volition::store",
                    "[STORE] Failed to persist miner urls for {}: {}",
                    network, e
                );
            }
        }
    }

    /// Start the background scan loop
    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self) {
        info!(
            target: "volition::consensus",
            "[CONSENSUS] 🌐 Starting consensus loop for {} ({} known miner urls)",
            self.inner.network,
            self.inspect(|t| t.registry().len())
        );

        let mut empty_rounds = 0u32;
        while !self.is_cancelled() {
            let report = self.try_scan().await;
            match &report {
                Some(r) if r.responded == 0 => empty_rounds = empty_rounds.saturating_add(1),
                Some(_) => empty_rounds = 0,
                None => {}
            }
            let delay = pacing_delay(&self.inner.config, report.as_ref(), empty_rounds);

            if self.is_cancelled() {
                break;
            }
            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.wake.notified() => {}
            }
        }

        debug!(
            target: "volition::consensus",
            "[CONSENSUS] {} loop exited",
            self.inner.network
        );
    }
}

/// Delay before the next scan. An empty round is retried at once; only a run
/// of more than `EMPTY_ROUNDS_BEFORE_IDLE` of them waits `idle_delay_ms`.
fn pacing_delay(
    config: &NetworkConfig,
    report: Option<&ScanReport>,
    empty_rounds: u32,
) -> Duration {
    match report {
        Some(r) if r.responded == 0 && empty_rounds > EMPTY_ROUNDS_BEFORE_IDLE => {
            r.delay.max(config.idle_delay())
        }
        Some(r) => r.delay,
        None => config.idle_delay(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::prober::{BlockRef, PeekResponse};
    use crate::consensus::registry::PeerRegistry;
    use crate::consensus::state::ConsensusState;
    use crate::consensus::MinerId;
    use crate::errors::ProbeError;
    use std::collections::HashMap;

    /// Scripted chain: every miner holds blocks 0..=head with the same digests
    #[derive(Clone)]
    struct ChainProber {
        heads: HashMap<String, u64>,
        latency: Duration,
    }

    fn block_digest(height: u64) -> String {
        format!("{:064x}", height + 1)
    }

    impl PeerProber for ChainProber {
        async fn probe(
            &self,
            miner_url: &str,
            current_height: u64,
            next_height: u64,
            _sample_size: usize,
        ) -> Result<PeekResponse, ProbeError> {
            tokio::time::sleep(self.latency).await;
            let head = *self.heads.get(miner_url).ok_or_else(|| ProbeError::Timeout {
                url: miner_url.to_string(),
            })?;
            let at = |h: u64| (h <= head).then(|| BlockRef { digest: block_digest(h) });
            Ok(PeekResponse {
                miner_id: format!("id-{}", miner_url),
                prev: at(current_height),
                peek: at(next_height),
                miners: vec![],
            })
        }

        async fn identify(&self, miner_url: &str) -> Result<MinerId, ProbeError> {
            Ok(format!("id-{}", miner_url))
        }
    }

    fn make_loop(heads: &[(&str, u64)], latency: Duration) -> ConsensusLoop<ChainProber> {
        let seeds: Vec<&str> = heads.iter().map(|(u, _)| *u).collect();
        make_seeded_loop(heads, &seeds, latency)
    }

    /// Loop whose prober knows `heads` but whose registry only knows `seeds`
    fn make_seeded_loop(
        heads: &[(&str, u64)],
        seeds: &[&str],
        latency: Duration,
    ) -> ConsensusLoop<ChainProber> {
        let prober = ChainProber {
            heads: heads.iter().map(|(u, h)| (u.to_string(), *h)).collect(),
            latency,
        };
        let registry = PeerRegistry::with_urls(seeds.iter().copied());
        let tracker = ConsensusTracker::new("test", ConsensusState::default(), registry);
        let config = NetworkConfig {
            current_delay_ms: 20,
            idle_delay_ms: 5,
            ..Default::default()
        };
        ConsensusLoop::new(tracker, prober, config, None)
    }

    #[tokio::test]
    async fn test_scans_converge_to_head() {
        let cl = make_loop(
            &[("http://a:1", 20), ("http://b:1", 20), ("http://c:1", 20)],
            Duration::ZERO,
        );
        for _ in 0..64 {
            cl.try_scan().await;
            if cl.snapshot().state.is_current {
                break;
            }
        }
        let state = cl.snapshot().state.clone();
        assert!(state.is_current);
        assert_eq!(state.height, 20);
        assert_eq!(state.digest, Some(block_digest(20)));
        assert_eq!(state.genesis, Some(block_digest(0)));
    }

    #[tokio::test]
    async fn test_unreachable_network_makes_no_progress() {
        // the prober knows no chain for this url, so every probe fails
        let cl = make_loop(&[], Duration::ZERO);
        cl.update(|t| t.registry_mut().add_urls(["http://gone:1", "http://gone:2"]));

        let report = cl.try_scan().await.unwrap();
        assert_eq!(report.decision, Some(Decision::Idle));
        assert_eq!(report.probed, 2);
        assert_eq!(report.responded, 0);
        assert_eq!(report.delay, Duration::ZERO);
        assert_eq!(cl.snapshot().state, ConsensusState::default());
        assert_eq!(cl.snapshot().known_urls, 2);
    }

    #[tokio::test]
    async fn test_overlapping_scan_is_suppressed() {
        let cl = make_loop(&[("http://a:1", 3)], Duration::from_millis(100));
        let first = {
            let cl = cl.clone();
            tokio::spawn(async move { cl.try_scan().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cl.is_scanning());
        assert!(cl.try_scan().await.is_none());
        assert!(first.await.unwrap().is_some());
        assert!(!cl.is_scanning());
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_results() {
        let cl = make_loop(&[("http://a:1", 3)], Duration::from_millis(80));
        let scan = {
            let cl = cl.clone();
            tokio::spawn(async move { cl.try_scan().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cl.reset();
        let report = scan.await.unwrap().unwrap();
        assert_eq!(report.decision, None);
        assert_eq!(cl.snapshot().state, ConsensusState::default());
        assert_eq!(cl.inspect(|t| t.registry().busy_count()), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop_without_mutation() {
        let cl = make_loop(&[("http://a:1", 10)], Duration::from_millis(80));
        let handle = cl.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cl.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(cl.snapshot().state, ConsensusState::default());
        assert!(cl.try_scan().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_subscription_sees_progress() {
        let cl = make_loop(&[("http://a:1", 4), ("http://b:1", 4)], Duration::ZERO);
        let mut rx = cl.subscribe();
        let handle = cl.spawn();

        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().state.is_current {
                    break rx.borrow().state.height;
                }
                if rx.changed().await.is_err() {
                    break u64::MAX;
                }
            }
        })
        .await
        .expect("never became current");

        assert_eq!(result, 4);
        cl.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_step_override_mid_scan_discards_round() {
        let cl = make_loop(&[("http://a:1", 40), ("http://b:1", 40)], Duration::from_millis(80));
        cl.set_step(1);
        let scan = {
            let cl = cl.clone();
            tokio::spawn(async move { cl.try_scan().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cl.set_step(8);

        let report = scan.await.unwrap().unwrap();
        assert_eq!(report.decision, None);
        let state = cl.snapshot().state.clone();
        assert_eq!(state.height, 0);
        assert_eq!(state.step, 8);
        assert_eq!(state.digest, None);
        assert_eq!(cl.inspect(|t| t.registry().busy_count()), 0);

        // the next round measures the new look-ahead height
        let report = cl.try_scan().await.unwrap();
        assert_eq!(report.decision, Some(Decision::SpeedUp));
        let state = cl.snapshot().state.clone();
        assert_eq!(state.height, 8);
        assert_eq!(state.digest, Some(block_digest(8)));
        assert_eq!(state.step, 16);
    }

    #[tokio::test]
    async fn test_threshold_override_mid_scan_applies_to_decision() {
        let cl = make_loop(&[("http://a:1", 5), ("http://b:1", 5)], Duration::from_millis(80));
        let scan = {
            let cl = cl.clone();
            tokio::spawn(async move { cl.try_scan().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cl.update(|t| t.set_threshold(3)).unwrap();

        let report = scan.await.unwrap().unwrap();
        assert_eq!(report.decision, Some(Decision::Idle));
        assert_eq!(report.responded, 2);
        assert_eq!(cl.snapshot().state, ConsensusState::with_threshold(3));

        cl.update(|t| t.set_threshold(2)).unwrap();
        let report = cl.try_scan().await.unwrap();
        assert_eq!(report.decision, Some(Decision::SpeedUp));
        let state = cl.snapshot().state.clone();
        assert_eq!(state.height, 0);
        assert_eq!(state.digest, Some(block_digest(0)));
        assert_eq!(state.genesis, Some(block_digest(0)));
    }

    #[tokio::test]
    async fn test_urls_added_mid_scan_join_next_round() {
        let cl = make_seeded_loop(
            &[("http://a:1", 5), ("http://c:1", 5)],
            &["http://a:1"],
            Duration::from_millis(80),
        );
        let scan = {
            let cl = cl.clone();
            tokio::spawn(async move { cl.try_scan().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let added = cl.update(|t| t.registry_mut().add_urls(["http://c:1"]));
        assert_eq!(added, 1);

        let report = scan.await.unwrap().unwrap();
        assert_eq!(report.probed, 1);
        assert_eq!(report.decision, Some(Decision::SpeedUp));
        let state = cl.snapshot().state.clone();
        assert_eq!(state.height, 0);
        assert_eq!(state.digest, Some(block_digest(0)));
        assert_eq!(cl.inspect(|t| t.registry().busy_count()), 0);

        let report = cl.try_scan().await.unwrap();
        assert_eq!(report.probed, 2);
        assert_eq!(report.responded, 2);
        assert_eq!(report.decision, Some(Decision::SpeedUp));
        let state = cl.snapshot().state.clone();
        assert_eq!(state.height, 1);
        assert_eq!(state.digest, Some(block_digest(1)));
    }

    #[test]
    fn test_empty_rounds_retry_immediately_then_pause() {
        let config = NetworkConfig::default();
        let empty = ScanReport {
            decision: Some(Decision::Idle),
            probed: 2,
            responded: 0,
            delay: Duration::ZERO,
        };
        for run in 1..=EMPTY_ROUNDS_BEFORE_IDLE {
            assert_eq!(pacing_delay(&config, Some(&empty), run), Duration::ZERO);
        }
        assert_eq!(
            pacing_delay(&config, Some(&empty), EMPTY_ROUNDS_BEFORE_IDLE + 1),
            config.idle_delay()
        );

        let answered = ScanReport { responded: 1, ..empty.clone() };
        assert_eq!(pacing_delay(&config, Some(&answered), 0), Duration::ZERO);
        assert_eq!(pacing_delay(&config, None, 0), config.idle_delay());
    }
}
