//! Peer-consensus discovery and tracking.
//!
//! Leaves first: `registry` (known urls), `miner` (observed peers), `state`
//! (agreed view), `prober` (one peek against one miner), `tracker` (round
//! classification and the stepping state machine), `scan_loop` (scheduling,
//! overlap guard, cancellation).

pub mod miner;
pub mod prober;
pub mod registry;
pub mod scan_loop;
pub mod state;
pub mod tracker;

pub use miner::{Miner, MinerId};
pub use prober::{HttpProber, PeekResponse, PeerProber};
pub use registry::{format_service_url, PeerRegistry};
pub use scan_loop::{ConsensusLoop, ScanReport};
pub use state::{ConsensusInfo, ConsensusSnapshot, ConsensusState};
pub use tracker::{apply_round, ConsensusTracker, Decision, RoundTally};
