pub mod network;
pub mod wallet;

pub use network::NetworkConfig;
pub use wallet::{NetworkEntry, WalletConfig};
