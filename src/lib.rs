//! Client-side consensus tracking for Volition wallet networks.
//!
//! A wallet follows one or more networks of independently operated miners.
//! For each network it keeps an agreed `(height, digest)` view by probing the
//! miners it knows about, learning new miners from their answers, and stepping
//! its checkpoint forward while they agree. Everything that reads chain state
//! for the wallet does so through `ConsensusView`, pinned to the agreed height.

pub mod api;
pub mod config;
pub mod consensus;
pub mod errors;
pub mod network_state;
pub mod store;

pub use config::{NetworkConfig, WalletConfig};
pub use consensus::{ConsensusInfo, ConsensusSnapshot, ConsensusState, HttpProber, PeerProber};
pub use errors::{ConsensusError, ProbeError};
pub use network_state::{ConsensusView, NetworkStateService, Networks};
pub use store::ConsensusStore;
