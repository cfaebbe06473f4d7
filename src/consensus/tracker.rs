//! Adaptive height-stepping state machine.
//!
//! Each round probes `height` (the checkpoint) and `height + step` on every
//! reachable miner. Unanimous agreement on the look-ahead digest among miners
//! holding the checkpoint moves the checkpoint forward and doubles the step;
//! any disagreement halves the step. Disagreeing at step 1 means the look-ahead
//! block is the contested head, so the tracker is current. When every miner
//! that answered lacks the checkpoint block the view is rolled back to genesis.
//!
//! Agreement is inferred from whoever answers, so this is a liveness heuristic
//! for a read-mostly wallet, not a Byzantine-tolerant protocol: the first miner
//! with a look-ahead digest sets the reference the others are compared with.

use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use super::miner::{Miner, MinerId};
use super::prober::PeekResponse;
use super::registry::PeerRegistry;
use super::state::{ConsensusSnapshot, ConsensusState};
use crate::errors::{ConsensusError, ProbeError};

/// Classification of the miners probed at the current checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundTally {
    /// Miners whose recorded height equals the checkpoint
    pub miner_count: usize,
    /// ... of which lack the checkpoint block
    pub missing_count: usize,
    /// ... of which hold it
    pub current_count: usize,
    /// Current miners reporting the reference look-ahead digest
    pub match_count: usize,
    /// First look-ahead digest seen among current miners
    pub reference: Option<String>,
    /// Urls of the matching miners
    pub agreeing_urls: Vec<String>,
}

impl RoundTally {
    /// Classify `miners` against checkpoint `height`. Iteration order decides
    /// which digest becomes the reference.
    pub fn classify<'a, I>(height: u64, miners: I) -> Self
    where
        I: IntoIterator<Item = &'a Miner>,
    {
        let at_height: Vec<&Miner> = miners.into_iter().filter(|m| m.height == height).collect();

        let mut tally = RoundTally {
            miner_count: at_height.len(),
            ..Default::default()
        };

        for miner in &at_height {
            if !miner.has_checkpoint() {
                tally.missing_count += 1;
                continue;
            }
            if tally.reference.is_none() {
                tally.reference = miner.peek_digest.clone();
            }
        }
        tally.current_count = tally.miner_count - tally.missing_count;

        if let Some(reference) = tally.reference.as_deref() {
            for miner in at_height.iter().filter(|m| m.has_checkpoint()) {
                if miner.peek_digest.as_deref() == Some(reference) {
                    tally.match_count += 1;
                    tally.agreeing_urls.push(miner.url.clone());
                }
            }
        }

        tally
    }

    pub fn is_unanimous(&self) -> bool {
        self.current_count > 0 && self.match_count == self.current_count
    }
}

/// What one round did to the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not enough miners at the checkpoint; nothing changes
    Idle,
    /// Agreement: checkpoint advanced, step doubled
    SpeedUp,
    /// Disagreement: step halved
    SlowDown,
    /// Every miner lacks the checkpoint: back to genesis
    HardReset,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Idle => "idle",
            Decision::SpeedUp => "speed_up",
            Decision::SlowDown => "slow_down",
            Decision::HardReset => "hard_reset",
        }
    }
}

/// Pure transition: the state after a round with `tally`.
pub fn apply_round(state: &ConsensusState, tally: &RoundTally) -> (ConsensusState, Decision) {
    let threshold = state.threshold.max(1) as usize;
    if tally.miner_count == 0 || tally.miner_count < threshold {
        return (state.clone(), Decision::Idle);
    }

    if tally.current_count > 0 {
        let mut next = state.clone();
        if tally.is_unanimous() {
            next.height = state.height.saturating_add(state.step);
            next.digest = tally.reference.clone();
            next.step = state.step.saturating_mul(2).max(1);
            if state.step > 2 {
                next.is_current = false;
            }
            if next.height == 0 && next.genesis.is_none() {
                next.genesis = next.digest.clone();
            }
            (next, Decision::SpeedUp)
        } else {
            next.step = (state.step / 2).max(1);
            if state.step == 1 {
                next.is_current = true;
            }
            (next, Decision::SlowDown)
        }
    } else {
        let next = ConsensusState {
            height: 0,
            digest: state.genesis.clone(),
            genesis: state.genesis.clone(),
            step: 0,
            is_current: false,
            threshold: state.threshold,
        };
        (next, Decision::HardReset)
    }
}

/// Probe targets for one round
#[derive(Debug, Clone)]
pub struct RoundPlan {
    pub height: u64,
    pub next_height: u64,
    pub targets: Vec<String>,
}

impl RoundPlan {
    /// Whether results measured for this plan still describe `state`
    pub fn matches(&self, state: &ConsensusState) -> bool {
        self.height == state.height && self.next_height == state.next_height()
    }
}

/// Per-network tracker: agreed state, observed miners and known urls.
#[derive(Debug, Clone)]
pub struct ConsensusTracker {
    network: String,
    state: ConsensusState,
    miners: BTreeMap<MinerId, Miner>,
    registry: PeerRegistry,
    agreeing_urls: Vec<String>,
    round: u64,
}

impl ConsensusTracker {
    pub fn new(network: &str, state: ConsensusState, registry: PeerRegistry) -> Self {
        Self {
            network: network.to_string(),
            state,
            miners: BTreeMap::new(),
            registry,
            agreeing_urls: Vec::new(),
            round: 0,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn state(&self) -> &ConsensusState {
        &self.state
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PeerRegistry {
        &mut self.registry
    }

    pub fn miners(&self) -> impl Iterator<Item = &Miner> {
        self.miners.values()
    }

    pub fn agreeing_urls(&self) -> &[String] {
        &self.agreeing_urls
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Pick this round's targets and mark them busy
    pub fn begin_round(&mut self) -> RoundPlan {
        let targets = self.registry.begin_probes();
        let busy: HashSet<&str> = targets.iter().map(String::as_str).collect();
        for miner in self.miners.values_mut() {
            if busy.contains(miner.url.as_str()) {
                miner.is_busy = true;
            }
        }
        RoundPlan {
            height: self.state.height,
            next_height: self.state.next_height(),
            targets,
        }
    }

    /// Fold one probe result into miner state. `height` is the checkpoint the
    /// probe was issued at.
    pub fn record_probe(
        &mut self,
        url: &str,
        height: u64,
        result: Result<PeekResponse, ProbeError>,
    ) {
        self.registry.end_probe(url);
        match result {
            Ok(response) => {
                let added = self.registry.add_urls(&response.miners);
                if added > 0 {
                    info!(
                        target: "volition::consensus",
                        "[CONSENSUS] {} discovered {} new miner url(s) via {}",
                        self.network, added, url
                    );
                }
                self.miners
                    .entry(response.miner_id.clone())
                    .or_insert_with(|| Miner::new(response.miner_id.clone(), url.to_string()))
                    .observe(url, height, &response);
            }
            Err(err) => {
                debug!(
                    target: "volition::probe",
                    "[PROBE] {} miner {} silent this round ({}): {}",
                    self.network,
                    url,
                    err.kind(),
                    err
                );
                self.clear_busy(url);
            }
        }
    }

    /// Drop a probe whose result must not be applied
    pub fn abandon_probe(&mut self, url: &str) {
        self.registry.end_probe(url);
        self.clear_busy(url);
    }

    fn clear_busy(&mut self, url: &str) {
        for miner in self.miners.values_mut().filter(|m| m.url == url) {
            miner.is_busy = false;
        }
    }

    /// Classify the miners and run the decision step for `plan`. If the
    /// checkpoint or step moved since the plan was made, the look-ahead
    /// digests belong to another height and the round decides nothing.
    pub fn finish_round(&mut self, plan: &RoundPlan) -> (Decision, RoundTally) {
        self.round += 1;
        if !plan.matches(&self.state) {
            debug!(
                target: "volition::consensus",
                "[CONSENSUS] {} round planned for {}+{} but state is now {}+{}; not deciding",
                self.network,
                plan.height,
                plan.next_height.saturating_sub(plan.height),
                self.state.height,
                self.state.step
            );
            return (Decision::Idle, RoundTally::default());
        }
        let tally = RoundTally::classify(self.state.height, self.miners.values());
        let (next, decision) = apply_round(&self.state, &tally);

        match decision {
            Decision::Idle => {}
            Decision::SpeedUp => {
                self.agreeing_urls = tally.agreeing_urls.clone();
                debug!(
                    target: "volition::consensus",
                    "[CONSENSUS] {} agreed on height {} ({} miners), step {} -> {}",
                    self.network, next.height, tally.match_count, self.state.step, next.step
                );
            }
            Decision::SlowDown => {
                debug!(
                    target: "volition::consensus",
                    "[CONSENSUS] {} split at height {} ({}/{} match), step {} -> {}",
                    self.network,
                    self.state.next_height(),
                    tally.match_count,
                    tally.current_count,
                    self.state.step,
                    next.step
                );
            }
            Decision::HardReset => {
                self.agreeing_urls.clear();
                warn!(
                    target: "volition::consensus",
                    "[CONSENSUS] {} all {} miner(s) lack block {}; resetting to genesis",
                    self.network, tally.miner_count, self.state.height
                );
            }
        }

        if next.is_current && !self.state.is_current {
            info!(
                target: "volition::consensus",
                "[CONSENSUS] ✅ {} is current at height {}",
                self.network, next.height
            );
        } else if !next.is_current && self.state.is_current {
            info!(
                target: "volition::consensus",
                "[CONSENSUS] {} fell behind at height {}, seeking",
                self.network, next.height
            );
        }

        self.state = next;
        (decision, tally)
    }

    /// User-triggered reset to the zero state
    pub fn reset(&mut self) {
        self.state = self.state.reset();
        self.agreeing_urls.clear();
    }

    pub fn set_step(&mut self, step: u64) {
        self.state.step = step;
    }

    /// Quorum override; 0 is rejected
    pub fn set_threshold(&mut self, threshold: u32) -> Result<(), ConsensusError> {
        if threshold == 0 {
            return Err(ConsensusError::Config(
                "threshold must be at least 1".to_string(),
            ));
        }
        self.state.threshold = threshold;
        Ok(())
    }

    pub fn snapshot(&self) -> ConsensusSnapshot {
        ConsensusSnapshot {
            network: self.network.clone(),
            state: self.state.clone(),
            agreeing_urls: self.agreeing_urls.clone(),
            known_urls: self.registry.len(),
            miner_count: self.miners.len(),
            round: self.round,
            updated_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::prober::BlockRef;

    fn digest(tag: &str) -> String {
        format!("{:0>64}", hex::encode(tag))
    }

    fn response(id: &str, prev: Option<&str>, peek: Option<&str>) -> PeekResponse {
        PeekResponse {
            miner_id: id.to_string(),
            prev: prev.map(|d| BlockRef { digest: digest(d) }),
            peek: peek.map(|d| BlockRef { digest: digest(d) }),
            miners: vec![],
        }
    }

    fn tracker_at(height: u64, step: u64, is_current: bool) -> ConsensusTracker {
        let state = ConsensusState {
            height,
            digest: Some(digest("C")),
            genesis: Some(digest("G")),
            step,
            is_current,
            threshold: 1,
        };
        let registry = PeerRegistry::with_urls(["http://m1:1", "http://m2:1", "http://m3:1"]);
        ConsensusTracker::new("test", state, registry)
    }

    fn run_round(tracker: &mut ConsensusTracker, responses: Vec<(&str, Option<PeekResponse>)>) -> Decision {
        let plan = tracker.begin_round();
        for (url, resp) in responses {
            let result = resp.ok_or_else(|| ProbeError::Timeout {
                url: url.to_string(),
            });
            tracker.record_probe(url, plan.height, result);
        }
        tracker.finish_round(&plan).0
    }

    #[test]
    fn test_unanimous_round_advances_and_doubles() {
        // 3 miners at height 10, all see D1 at 11
        let mut tracker = tracker_at(10, 1, false);
        let decision = run_round(
            &mut tracker,
            vec![
                ("http://m1:1", Some(response("a", Some("C"), Some("D1")))),
                ("http://m2:1", Some(response("b", Some("C"), Some("D1")))),
                ("http://m3:1", Some(response("c", Some("C"), Some("D1")))),
            ],
        );
        assert_eq!(decision, Decision::SpeedUp);
        assert_eq!(tracker.state().height, 11);
        assert_eq!(tracker.state().digest, Some(digest("D1")));
        assert_eq!(tracker.state().step, 2);
        assert_eq!(tracker.agreeing_urls().len(), 3);
    }

    #[test]
    fn test_disagreement_at_step_one_becomes_current() {
        let mut tracker = tracker_at(10, 1, false);
        let decision = run_round(
            &mut tracker,
            vec![
                ("http://m1:1", Some(response("a", Some("C"), Some("D1")))),
                ("http://m2:1", Some(response("b", Some("C"), Some("D1")))),
                ("http://m3:1", Some(response("c", Some("C"), Some("D2")))),
            ],
        );
        assert_eq!(decision, Decision::SlowDown);
        assert_eq!(tracker.state().height, 10);
        assert_eq!(tracker.state().digest, Some(digest("C")));
        assert_eq!(tracker.state().step, 1);
        assert!(tracker.state().is_current);
    }

    #[test]
    fn test_all_missing_checkpoint_hard_resets() {
        let mut tracker = tracker_at(10, 4, true);
        let decision = run_round(
            &mut tracker,
            vec![
                ("http://m1:1", Some(response("a", None, None))),
                ("http://m2:1", Some(response("b", None, None))),
                ("http://m3:1", Some(response("c", None, None))),
            ],
        );
        assert_eq!(decision, Decision::HardReset);
        let state = tracker.state();
        assert_eq!(state.height, 0);
        assert_eq!(state.digest, Some(digest("G")));
        assert_eq!(state.step, 0);
        assert!(!state.is_current);
    }

    #[test]
    fn test_no_responses_leaves_state_untouched() {
        let mut tracker = tracker_at(10, 1, false);
        let before = tracker.state().clone();
        let decision = run_round(
            &mut tracker,
            vec![("http://m1:1", None), ("http://m2:1", None), ("http://m3:1", None)],
        );
        assert_eq!(decision, Decision::Idle);
        assert_eq!(tracker.state(), &before);
        assert_eq!(tracker.registry().len(), 3);
        assert_eq!(tracker.registry().busy_count(), 0);
    }

    #[test]
    fn test_hard_reset_is_idempotent() {
        let state = ConsensusState {
            height: 9,
            digest: Some(digest("X")),
            genesis: Some(digest("G")),
            step: 3,
            is_current: true,
            threshold: 1,
        };
        let tally = RoundTally {
            miner_count: 2,
            missing_count: 2,
            ..Default::default()
        };
        let (once, d1) = apply_round(&state, &tally);
        let (twice, d2) = apply_round(&once, &tally);
        assert_eq!(d1, Decision::HardReset);
        assert_eq!(d2, Decision::HardReset);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fast_agreement_clears_current() {
        let mut tracker = tracker_at(10, 4, true);
        run_round(
            &mut tracker,
            vec![
                ("http://m1:1", Some(response("a", Some("C"), Some("E")))),
                ("http://m2:1", Some(response("b", Some("C"), Some("E")))),
            ],
        );
        assert_eq!(tracker.state().height, 14);
        assert_eq!(tracker.state().step, 8);
        assert!(!tracker.state().is_current);
    }

    #[test]
    fn test_small_step_agreement_keeps_current() {
        let mut tracker = tracker_at(10, 2, true);
        run_round(
            &mut tracker,
            vec![("http://m1:1", Some(response("a", Some("C"), Some("E"))))],
        );
        assert_eq!(tracker.state().height, 12);
        assert_eq!(tracker.state().step, 4);
        assert!(tracker.state().is_current);
    }

    #[test]
    fn test_missing_lookahead_is_disagreement() {
        let mut tracker = tracker_at(10, 8, false);
        let decision = run_round(
            &mut tracker,
            vec![
                ("http://m1:1", Some(response("a", Some("C"), None))),
                ("http://m2:1", Some(response("b", Some("C"), None))),
            ],
        );
        assert_eq!(decision, Decision::SlowDown);
        assert_eq!(tracker.state().step, 4);
        assert!(!tracker.state().is_current);
    }

    #[test]
    fn test_partial_missing_still_decides_on_current_miners() {
        let mut tracker = tracker_at(10, 1, false);
        let decision = run_round(
            &mut tracker,
            vec![
                ("http://m1:1", Some(response("a", None, None))),
                ("http://m2:1", Some(response("b", Some("C"), Some("N")))),
            ],
        );
        assert_eq!(decision, Decision::SpeedUp);
        assert_eq!(tracker.state().height, 11);
    }

    #[test]
    fn test_genesis_learned_at_step_zero() {
        let registry = PeerRegistry::with_urls(["http://m1:1"]);
        let mut tracker = ConsensusTracker::new("test", ConsensusState::default(), registry);
        run_round(
            &mut tracker,
            vec![("http://m1:1", Some(response("a", Some("G"), Some("G"))))],
        );
        let state = tracker.state();
        assert_eq!(state.height, 0);
        assert_eq!(state.step, 1);
        assert_eq!(state.genesis, Some(digest("G")));
        assert_eq!(state.digest, Some(digest("G")));
    }

    #[test]
    fn test_threshold_blocks_small_quorum() {
        let mut tracker = tracker_at(10, 1, false);
        tracker.set_threshold(3).unwrap();
        let decision = run_round(
            &mut tracker,
            vec![
                ("http://m1:1", Some(response("a", Some("C"), Some("D1")))),
                ("http://m2:1", Some(response("b", Some("C"), Some("D1")))),
            ],
        );
        assert_eq!(decision, Decision::Idle);
        assert_eq!(tracker.state().height, 10);
    }

    #[test]
    fn test_stale_miners_are_not_classified() {
        let mut tracker = tracker_at(10, 1, false);
        run_round(
            &mut tracker,
            vec![("http://m1:1", Some(response("a", Some("C"), Some("D1"))))],
        );
        assert_eq!(tracker.state().height, 11);

        // m1 recorded at height 10; nothing answers at 11
        let tally = RoundTally::classify(11, tracker.miners());
        assert_eq!(tally.miner_count, 0);
    }

    #[test]
    fn test_reference_is_first_miner_not_majority() {
        let mut tracker = tracker_at(10, 2, false);
        // "a" sorts first and sets the reference, so the majority digest loses
        run_round(
            &mut tracker,
            vec![
                ("http://m1:1", Some(response("a", Some("C"), Some("X")))),
                ("http://m2:1", Some(response("b", Some("C"), Some("Y")))),
                ("http://m3:1", Some(response("c", Some("C"), Some("Y")))),
            ],
        );
        let tally = RoundTally::classify(10, tracker.miners());
        assert_eq!(tally.reference, Some(digest("X")));
        assert_eq!(tally.match_count, 1);
        assert_eq!(tracker.state().step, 1);
    }

    #[test]
    fn test_discovery_is_monotonic() {
        let mut tracker = tracker_at(10, 1, false);
        let mut resp = response("a", Some("C"), Some("D"));
        resp.miners = vec!["http://m4:1".to_string(), "http://m1:1".to_string()];
        run_round(
            &mut tracker,
            vec![("http://m1:1", Some(resp)), ("http://m2:1", None)],
        );
        assert_eq!(tracker.registry().len(), 4);
        assert!(tracker.registry().contains("http://m2:1"));
    }

    #[test]
    fn test_user_reset_keeps_threshold() {
        let mut tracker = tracker_at(10, 4, true);
        tracker.set_threshold(2).unwrap();
        tracker.reset();
        assert_eq!(tracker.state(), &ConsensusState::with_threshold(2));
    }

    #[test]
    fn test_step_override_between_plan_and_decision() {
        let mut tracker = tracker_at(10, 1, false);
        let plan = tracker.begin_round();
        assert_eq!(plan.next_height, 11);
        tracker.set_step(8);
        for url in ["http://m1:1", "http://m2:1"] {
            let resp = response(url, Some("C"), Some("D11"));
            tracker.record_probe(url, plan.height, Ok(resp));
        }

        let (decision, _) = tracker.finish_round(&plan);
        assert_eq!(decision, Decision::Idle);
        let state = tracker.state();
        assert_eq!(state.height, 10);
        assert_eq!(state.digest, Some(digest("C")));
        assert_eq!(state.step, 8);
        assert_eq!(tracker.registry().busy_count(), 0);
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let mut tracker = tracker_at(10, 1, false);
        assert!(matches!(
            tracker.set_threshold(0),
            Err(ConsensusError::Config(_))
        ));
        assert_eq!(tracker.state().threshold, 1);
    }
}
