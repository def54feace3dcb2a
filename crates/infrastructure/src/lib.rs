pub mod database;
pub mod metrics;
pub mod peer_client;

pub use database::*;
pub use peer_client::HttpPeerClient;
