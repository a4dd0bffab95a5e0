use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Network;

pub const DEFAULT_SERVER_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the timer a swap waits on while the server has not yet
/// published its HTLC. Injected so tests control when it fires.
pub type ExpiryTimer =
    Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub fn tokio_expiry_timer() -> ExpiryTimer {
    Arc::new(|d| Box::pin(tokio::time::sleep(d)))
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub network: Network,
    pub server_rpc_timeout: Duration,
    pub htlc_publish_timeout: Duration,
    pub min_expiry_delta: u32,
    pub max_expiry_delta: u32,
    pub htlc_confirmations: u32,
    pub sweep_confirmations: u32,
    pub payment_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            server_rpc_timeout: DEFAULT_SERVER_RPC_TIMEOUT,
            htlc_publish_timeout: Duration::from_secs(60 * 60),
            min_expiry_delta: 20,
            max_expiry_delta: 1000,
            htlc_confirmations: 1,
            sweep_confirmations: 1,
            payment_poll_interval: Duration::from_secs(1),
        }
    }
}
