use eyre::Result;
use tokio::sync::mpsc;
use tracing::{error, info};

pub mod chain_a;
pub mod chain_b;

pub use chain_a::ChainAWatcher;
pub use chain_b::ChainBWatcher;

/// Manages both chain watchers.
pub struct WatcherManager {
    chain_a: ChainAWatcher,
    chain_b: ChainBWatcher,
}

impl WatcherManager {
    pub fn new(chain_a: ChainAWatcher, chain_b: ChainBWatcher) -> Self {
        Self { chain_a, chain_b }
    }

    /// Run both watchers until one hits a fatal error or shutdown arrives.
    /// Watchers only return on persistence failure; RPC trouble is reported
    /// to the coordinator and retried on the next poll.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        tokio::select! {
            result = self.chain_a.run() => {
                error!("Chain A watcher stopped: {:?}", result);
                result
            }
            result = self.chain_b.run() => {
                error!("Chain B watcher stopped: {:?}", result);
                result
            }
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping watchers");
                Ok(())
            }
        }
    }
}
