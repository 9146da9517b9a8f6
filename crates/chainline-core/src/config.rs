//! Engine configuration.

use std::time::Duration;

/// Configuration for a [`crate::engine::SignalingEngine`].
///
/// The consuming application supplies this and the identity at
/// construction; the core has no CLI or environment surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ledger node endpoint handed to the client's handshake.
    pub endpoint: String,
    /// How long an outbound operation waits for its transaction to be
    /// included before failing with a timeout.
    pub tx_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9944".to_string(),
            tx_timeout: Duration::from_secs(30),
        }
    }
}
