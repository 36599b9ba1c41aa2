//! Chain B watcher: range log queries for `TokensLocked` past finality.

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::{Client, Http};
use eyre::{eyre, Result, WrapErr};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ChainBConfig;
use crate::coordinator::Inbound;
use crate::db::Store;
use crate::metrics;
use crate::retry::{with_backoff, RetryPolicy};
use crate::signing::now_ms;
use crate::types::{ChainId, TokenKind, TransferEvent};

const STARTUP_LOOKBACK: u64 = 20;

/// Chain B event watcher for `TokensLocked`:
/// ```solidity
/// event TokensLocked(
///     bytes32 indexed lockId,
///     address indexed token,
///     uint256 amount,
///     address indexed sender,
///     string wavesDestination,
///     uint256 nonce,
///     uint8 tokenType,
///     uint256 tokenId
/// );
/// ```
pub struct ChainBWatcher {
    provider: RootProvider<Http<Client>>,
    bridge_address: Address,
    confirmations: u64,
    start_override: Option<u64>,
    batch_cap: u64,
    poll_interval: Duration,
    retry: RetryPolicy,
    store: Store,
    inbox: mpsc::Sender<Inbound>,
}

impl ChainBWatcher {
    pub fn new(config: &ChainBConfig, store: Store, inbox: mpsc::Sender<Inbound>) -> Result<Self> {
        let url = config.rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);
        let bridge_address =
            Address::from_str(&config.bridge_address).wrap_err("Invalid bridge address")?;

        info!(
            chain_id = config.chain_id,
            bridge_address = %bridge_address,
            confirmations = config.confirmations,
            "Chain B watcher initialized"
        );

        Ok(Self {
            provider,
            bridge_address,
            confirmations: config.confirmations,
            start_override: config.start_block,
            batch_cap: 500,
            poll_interval: Duration::from_secs(5),
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
        let head = match with_backoff(&self.retry, "chain B height", || async {
            self.provider
                .get_block_number()
                .await
                .wrap_err("Failed to get block number")
        })
        .await
        {
            Ok(height) => height,
            Err(e) => return self.report_rpc_error(e).await,
        };
        let frontier = head.saturating_sub(self.confirmations);

        let mut watermark = match self.store.get_watermark(ChainId::B)? {
            Some(w) => w,
            None => self.seed_watermark(frontier)?,
        };

        while watermark < frontier {
            let batch_end = (watermark + self.batch_cap).min(frontier);
            let from_block = watermark + 1;

            let logs = match with_backoff(&self.retry, "chain B logs", || async {
                let filter = Filter::new()
                    .address(self.bridge_address)
                    .from_block(from_block)
                    .to_block(batch_end);
                self.provider
                    .get_logs(&filter)
                    .await
                    .wrap_err("Failed to get logs")
            })
            .await
            {
                Ok(logs) => logs,
                Err(e) => return self.report_rpc_error(e).await,
            };

            self.process_logs(logs).await?;

            self.store.advance_watermark(ChainId::B, batch_end)?;
            metrics::WATERMARK
                .with_label_values(&["B"])
                .set(batch_end as f64);
            metrics::BLOCKS_PROCESSED
                .with_label_values(&["B"])
                .inc_by((batch_end - watermark) as f64);
            watermark = batch_end;
        }

        Ok(())
    }

    fn seed_watermark(&self, frontier: u64) -> Result<u64> {
        let seed = self
            .start_override
            .unwrap_or_else(|| frontier.saturating_sub(STARTUP_LOOKBACK));
        if seed > 0 {
            self.store.advance_watermark(ChainId::B, seed)?;
        }
        info!(seed = seed, "Chain B watermark seeded");
        Ok(seed)
    }

    async fn process_logs(&self, mut logs: Vec<Log>) -> Result<()> {
        let locked_topic = tokens_locked_signature();

        // Deliver in (block, log-index) order regardless of node ordering.
        logs.sort_by_key(|log| (log.block_number.unwrap_or(0), log.log_index.unwrap_or(0)));

        for log in logs {
            let topics = log.topics();
            if topics.is_empty() || topics[0] != locked_topic {
                continue;
            }
            match parse_tokens_locked(&log) {
                Ok(event) => {
                    info!(
                        transfer_id = %event.transfer_id,
                        token = %event.token,
                        amount = %event.amount,
                        block = event.src_block,
                        "New chain B lock event"
                    );
                    metrics::EVENTS_DETECTED.with_label_values(&["B"]).inc();
                    self.inbox
                        .send(Inbound::Event(event))
                        .await
                        .wrap_err("Coordinator inbox closed")?;
                }
                Err(e) => {
                    warn!(
                        tx_hash = ?log.transaction_hash,
                        error = %e,
                        "Failed to parse TokensLocked log, discarding"
                    );
                }
            }
        }
        Ok(())
    }

    async fn report_rpc_error(&self, error: eyre::Report) -> Result<()> {
        metrics::ERRORS
            .with_label_values(&["watcher_b", "transient"])
            .inc();
        self.inbox
            .send(Inbound::TaskError {
                component: "watcher_b",
                error: error.to_string(),
            })
            .await
            .wrap_err("Coordinator inbox closed")?;
        Ok(())
    }
}

/// keccak256 of the full event signature.
fn tokens_locked_signature() -> B256 {
    keccak256(b"TokensLocked(bytes32,address,uint256,address,string,uint256,uint8,uint256)")
}

/// Positional decode of a `TokensLocked` log into a transfer event.
///
/// Indexed: lockId (topic 1), token (topic 2), sender (topic 3).
/// Data words: amount, string offset, nonce, tokenType, tokenId, then the
/// destination string tail.
fn parse_tokens_locked(log: &Log) -> Result<TransferEvent> {
    let topics = log.topics();
    if topics.len() < 4 {
        return Err(eyre!("Not enough topics for TokensLocked"));
    }
    let lock_id = topics[1];
    let token = Address::from_slice(&topics[2].as_slice()[12..]);
    let sender = Address::from_slice(&topics[3].as_slice()[12..]);

    let data = log.data().data.as_ref();
    if data.len() < 160 {
        return Err(eyre!("Not enough data in TokensLocked"));
    }

    let amount = U256::from_be_slice(&data[0..32]);
    let string_offset = U256::from_be_slice(&data[32..64])
        .try_into()
        .map_err(|_| eyre!("Destination string offset out of range"))?;
    let _nonce = U256::from_be_slice(&data[64..96]);
    let token_type = data[127];
    let token_id = U256::from_be_slice(&data[128..160]);

    let recipient = decode_abi_string(data, string_offset)?;

    let amount: u128 = amount
        .try_into()
        .map_err(|_| eyre!("Lock amount exceeds u128"))?;
    let kind = TokenKind::from_wire(token_type)?;
    let token_id_u64: u64 = token_id
        .try_into()
        .map_err(|_| eyre!("Token id exceeds u64"))?;

    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| eyre!("Missing transaction hash"))?;
    let block_number = log
        .block_number
        .ok_or_else(|| eyre!("Missing block number"))?;

    Ok(TransferEvent {
        transfer_id: format!("0x{}", hex::encode(lock_id.as_slice())),
        source: ChainId::B,
        destination: ChainId::A,
        token: format!("0x{}", hex::encode(token.as_slice())),
        amount,
        sender: format!("0x{}", hex::encode(sender.as_slice())),
        recipient,
        kind,
        token_id: kind.is_non_fungible().then_some(token_id_u64),
        src_block: block_number,
        src_tx: format!("0x{}", hex::encode(tx_hash.as_slice())),
        observed_at: now_ms(),
    })
}

/// Decode an ABI-encoded dynamic string at the given data offset.
fn decode_abi_string(data: &[u8], offset: usize) -> Result<String> {
    if data.len() < offset + 32 {
        return Err(eyre!("Destination string offset past data end"));
    }
    let len: usize = U256::from_be_slice(&data[offset..offset + 32])
        .try_into()
        .map_err(|_| eyre!("Destination string length out of range"))?;
    let start = offset + 32;
    if data.len() < start + len {
        return Err(eyre!("Destination string truncated"));
    }
    String::from_utf8(data[start..start + len].to_vec()).wrap_err("Destination is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};

    fn locked_log(
        lock_id: [u8; 32],
        token: [u8; 20],
        sender: [u8; 20],
        amount: u128,
        destination: &str,
        token_type: u8,
        token_id: u64,
    ) -> Log {
        let mut token_topic = [0u8; 32];
        token_topic[12..].copy_from_slice(&token);
        let mut sender_topic = [0u8; 32];
        sender_topic[12..].copy_from_slice(&sender);

        let mut data = Vec::new();
        data.extend_from_slice(&U256::from(amount).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(160u64).to_be_bytes::<32>()); // string offset
        data.extend_from_slice(&U256::from(7u64).to_be_bytes::<32>()); // nonce
        data.extend_from_slice(&U256::from(token_type).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(token_id).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(destination.len()).to_be_bytes::<32>());
        let mut tail = destination.as_bytes().to_vec();
        while tail.len() % 32 != 0 {
            tail.push(0);
        }
        data.extend_from_slice(&tail);

        let inner = alloy::primitives::Log {
            address: Address::ZERO,
            data: LogData::new_unchecked(
                vec![
                    tokens_locked_signature(),
                    B256::from(lock_id),
                    B256::from(token_topic),
                    B256::from(sender_topic),
                ],
                Bytes::from(data),
            ),
        };

        Log {
            inner,
            block_hash: Some(B256::ZERO),
            block_number: Some(123),
            block_timestamp: None,
            transaction_hash: Some(B256::from([0xcc; 32])),
            transaction_index: Some(0),
            log_index: Some(1),
            removed: false,
        }
    }

    #[test]
    fn test_parse_tokens_locked_fungible() {
        let log = locked_log(
            [0x11; 32],
            [0x22; 20],
            [0x33; 20],
            5_000_000,
            "3PRecipientAddr",
            0,
            0,
        );
        let event = parse_tokens_locked(&log).unwrap();

        assert_eq!(event.transfer_id, format!("0x{}", hex::encode([0x11u8; 32])));
        assert_eq!(event.source, ChainId::B);
        assert_eq!(event.destination, ChainId::A);
        assert_eq!(event.token, format!("0x{}", hex::encode([0x22u8; 20])));
        assert_eq!(event.amount, 5_000_000);
        assert_eq!(event.recipient, "3PRecipientAddr");
        assert_eq!(event.kind, TokenKind::FungibleExternal);
        assert_eq!(event.token_id, None);
        assert_eq!(event.src_block, 123);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_parse_tokens_locked_nft_keeps_token_id() {
        let log = locked_log([0x44; 32], [0x22; 20], [0x33; 20], 1, "3PRec", 2, 99);
        let event = parse_tokens_locked(&log).unwrap();
        assert_eq!(event.kind, TokenKind::NonFungibleExternal);
        assert_eq!(event.token_id, Some(99));
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_parse_rejects_unknown_token_type() {
        let log = locked_log([0x55; 32], [0x22; 20], [0x33; 20], 1, "3PRec", 9, 0);
        assert!(parse_tokens_locked(&log).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_data() {
        let mut log = locked_log([0x66; 32], [0x22; 20], [0x33; 20], 1, "3PRec", 0, 0);
        let topics = log.inner.data.topics().to_vec();
        log.inner.data = LogData::new_unchecked(topics, Bytes::from(vec![0u8; 64]));
        assert!(parse_tokens_locked(&log).is_err());
    }
}
