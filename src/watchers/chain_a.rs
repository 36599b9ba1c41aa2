//! Chain A watcher: polls blocks, extracts bridge lock invokes past finality.

use eyre::{Result, WrapErr};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chain_a_client::{ABlock, ATransaction, ChainAClient};
use crate::config::ChainAConfig;
use crate::coordinator::Inbound;
use crate::db::Store;
use crate::metrics;
use crate::retry::{with_backoff, RetryPolicy};
use crate::signing::now_ms;
use crate::types::{ChainId, TokenKind, TransferEvent};

/// Blocks re-examined when no watermark is persisted yet.
const STARTUP_LOOKBACK: u64 = 20;
/// Reserved asset id for the chain's native coin (payments carry null).
const NATIVE_ASSET_ID: &str = "WAVES";

pub struct ChainAWatcher {
    client: ChainAClient,
    bridge_address: String,
    confirmations: u64,
    start_override: Option<u64>,
    batch_cap: u64,
    poll_interval: Duration,
    interblock_delay: Duration,
    retry: RetryPolicy,
    store: Store,
    inbox: mpsc::Sender<Inbound>,
}

impl ChainAWatcher {
    pub fn new(config: &ChainAConfig, store: Store, inbox: mpsc::Sender<Inbound>) -> Result<Self> {
        let client = ChainAClient::new(&config.node_url, config.network_tag)?;
        info!(
            node_url = %config.node_url,
            bridge_address = %config.bridge_address,
            confirmations = config.confirmations,
            "Chain A watcher initialized"
        );
        Ok(Self {
            client,
            bridge_address: config.bridge_address.clone(),
            confirmations: config.confirmations,
            start_override: config.start_block,
            batch_cap: 20,
            poll_interval: Duration::from_secs(5),
            interblock_delay: Duration::from_millis(200),
            retry: RetryPolicy::default(),
            store,
            inbox,
        })
    }

    /// Poll loop. Only persistence failures end it.
    pub async fn run(&self) -> Result<()> {
        loop {
            self.tick().await?;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn tick(&self) -> Result<()> {
        let head = match with_backoff(&self.retry, "chain A height", || self.client.get_height()).await
        {
            Ok(height) => height,
            Err(e) => return self.report_rpc_error(e).await,
        };
        let frontier = head.saturating_sub(self.confirmations);

        let mut watermark = match self.store.get_watermark(ChainId::A)? {
            Some(w) => w,
            None => self.seed_watermark(frontier)?,
        };

        while watermark < frontier {
            let batch_end = (watermark + self.batch_cap).min(frontier);
            for height in (watermark + 1)..=batch_end {
                let block = match with_backoff(&self.retry, "chain A block", || {
                    self.client.get_block_at(height)
                })
                .await
                {
                    Ok(block) => block,
                    Err(e) => return self.report_rpc_error(e).await,
                };
                self.process_block(&block).await?;
                metrics::BLOCKS_PROCESSED.with_label_values(&["A"]).inc();
            }
            self.store.advance_watermark(ChainId::A, batch_end)?;
            metrics::WATERMARK
                .with_label_values(&["A"])
                .set(batch_end as f64);
            watermark = batch_end;
            tokio::time::sleep(self.interblock_delay).await;
        }

        Ok(())
    }

    fn seed_watermark(&self, frontier: u64) -> Result<u64> {
        let seed = self
            .start_override
            .unwrap_or_else(|| frontier.saturating_sub(STARTUP_LOOKBACK));
        if seed > 0 {
            self.store.advance_watermark(ChainId::A, seed)?;
        }
        info!(seed = seed, "Chain A watermark seeded");
        Ok(seed)
    }

    async fn process_block(&self, block: &ABlock) -> Result<()> {
        for tx in &block.transactions {
            let Some(event) = self.parse_lock_invoke(tx, block.height) else {
                continue;
            };
            info!(
                transfer_id = %event.transfer_id,
                token = %event.token,
                amount = %event.amount,
                block = block.height,
                "New chain A lock event"
            );
            metrics::EVENTS_DETECTED.with_label_values(&["A"]).inc();
            self.inbox
                .send(Inbound::Event(event))
                .await
                .wrap_err("Coordinator inbox closed")?;
        }
        Ok(())
    }

    /// Extract a lock event from a bridge invoke, if the transaction is one.
    /// Malformed bridge calls are logged and discarded.
    fn parse_lock_invoke(&self, tx: &ATransaction, height: u64) -> Option<TransferEvent> {
        if !tx.is_invoke() || tx.dapp.as_deref() != Some(self.bridge_address.as_str()) {
            return None;
        }
        let call = tx.call.as_ref()?;
        let kind = match call.function.as_str() {
            "lockTokens" => TokenKind::FungibleExternal,
            "lockNFT" => TokenKind::NonFungibleExternal,
            _ => return None,
        };

        if tx.payment.len() != 1 {
            warn!(
                tx_id = %tx.id,
                payments = tx.payment.len(),
                "Bridge invoke without exactly one payment, discarding"
            );
            return None;
        }
        let payment = &tx.payment[0];

        let Some(recipient) = call.args.first().and_then(|a| a.value.as_str()) else {
            warn!(tx_id = %tx.id, "Bridge invoke missing recipient argument, discarding");
            return None;
        };
        if let Some(dest_chain) = call.args.get(1).and_then(|a| a.value.as_u64()) {
            debug!(tx_id = %tx.id, dest_chain = dest_chain, "Lock destination chain");
        }

        let token = payment
            .asset_id
            .clone()
            .unwrap_or_else(|| NATIVE_ASSET_ID.to_string());

        Some(TransferEvent {
            transfer_id: tx.id.clone(),
            source: ChainId::A,
            destination: ChainId::B,
            token,
            amount: payment.amount,
            sender: tx.sender.clone(),
            recipient: recipient.to_string(),
            kind,
            // An A-side NFT is identified by its asset id, not a numeric id:
            // the resolved token_ref carries its identity into the digest,
            // and the numeric token id slot stays zero.
            token_id: kind.is_non_fungible().then_some(0),
            src_block: height,
            src_tx: tx.id.clone(),
            observed_at: now_ms(),
        })
    }

    async fn report_rpc_error(&self, error: eyre::Report) -> Result<()> {
        metrics::ERRORS
            .with_label_values(&["watcher_a", "transient"])
            .inc();
        self.inbox
            .send(Inbound::TaskError {
                component: "watcher_a",
                error: error.to_string(),
            })
            .await
            .wrap_err("Coordinator inbox closed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainAConfig;

    fn watcher() -> (tempfile::TempDir, ChainAWatcher, mpsc::Receiver<Inbound>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let config = ChainAConfig {
            node_url: "http://localhost:6869".to_string(),
            network_tag: 'W',
            bridge_address: "3MvbB2cJbSkCvMMuWUdJTYsS1UdjELvQUiZ".to_string(),
            confirmations: 10,
            start_block: None,
        };
        (dir, ChainAWatcher::new(&config, store, tx).unwrap(), rx)
    }

    fn lock_tx(function: &str, dapp: &str) -> ATransaction {
        serde_json::from_value(serde_json::json!({
            "type": 16,
            "id": "5FooBarBaz",
            "sender": "3PSender",
            "dApp": dapp,
            "call": {
                "function": function,
                "args": [
                    { "type": "string", "value": "0x0000000000000000000000000000000000000001" },
                    { "type": "integer", "value": 88811 }
                ]
            },
            "payment": [ { "amount": "100000000", "assetId": null } ]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_lock_tokens() {
        let (_dir, watcher, _rx) = watcher();
        let tx = lock_tx("lockTokens", "3MvbB2cJbSkCvMMuWUdJTYsS1UdjELvQUiZ");
        let event = watcher.parse_lock_invoke(&tx, 77).unwrap();

        assert_eq!(event.transfer_id, "5FooBarBaz");
        assert_eq!(event.source, ChainId::A);
        assert_eq!(event.destination, ChainId::B);
        assert_eq!(event.token, "WAVES");
        assert_eq!(event.amount, 100_000_000);
        assert_eq!(event.kind, TokenKind::FungibleExternal);
        assert_eq!(event.token_id, None);
        assert_eq!(event.src_block, 77);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_parse_lock_nft_gets_zero_token_id() {
        let (_dir, watcher, _rx) = watcher();
        let mut tx = lock_tx("lockNFT", "3MvbB2cJbSkCvMMuWUdJTYsS1UdjELvQUiZ");
        tx.payment[0].amount = 1;
        tx.payment[0].asset_id = Some("NftAssetId111".to_string());

        let event = watcher.parse_lock_invoke(&tx, 77).unwrap();
        assert_eq!(event.kind, TokenKind::NonFungibleExternal);
        assert_eq!(event.token_id, Some(0));
        assert_eq!(event.token, "NftAssetId111");
    }

    #[test]
    fn test_ignores_other_dapps_and_functions() {
        let (_dir, watcher, _rx) = watcher();
        let other_dapp = lock_tx("lockTokens", "3PSomeOtherDapp");
        assert!(watcher.parse_lock_invoke(&other_dapp, 1).is_none());

        let other_fn = lock_tx("swap", "3MvbB2cJbSkCvMMuWUdJTYsS1UdjELvQUiZ");
        assert!(watcher.parse_lock_invoke(&other_fn, 1).is_none());
    }

    #[test]
    fn test_discards_invoke_without_single_payment() {
        let (_dir, watcher, _rx) = watcher();
        let mut tx = lock_tx("lockTokens", "3MvbB2cJbSkCvMMuWUdJTYsS1UdjELvQUiZ");
        tx.payment.clear();
        assert!(watcher.parse_lock_invoke(&tx, 1).is_none());
    }
}
