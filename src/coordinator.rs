//! The coordinator owns the event loop and is the only component that
//! mutates a transfer record's status.
//!
//! Watchers and the gossip overlay feed one bounded inbox; relay submissions
//! run as independent tasks and report back through the same inbox. A 5 s
//! sweep drives pending records forward and launches relays once a quorum of
//! attestations is present; a 30 s heartbeat publishes liveness.

use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use eyre::{Result, WrapErr};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chain_a_client::ChainAClient;
use crate::contracts::BridgeB;
use crate::db::Store;
use crate::gossip::{Envelope, GossipPayload, GossipService};
use crate::metrics;
use crate::relay::{RelayEngine, RelayOutcome};
use crate::resolver::AssetResolver;
use crate::signing::{now_ms, SigningEngine};
use crate::types::{Attestation, ChainId, TransferEvent, TransferRecord, TransferStatus};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Quorum parameters are re-fetched from the destination bridge after this.
const QUORUM_CACHE_TTL: Duration = Duration::from_secs(30);
/// Relay attempts before a record is declared failed.
const MAX_RELAY_ATTEMPTS: u32 = 5;
/// Peer attestations arriving before their event are buffered up to this many.
const MAX_BUFFERED_ATTESTATIONS: usize = 10_000;
/// Consecutive relay failures that trip the breaker.
const RELAY_BREAKER_THRESHOLD: u32 = 10;
const RELAY_BREAKER_PAUSE: Duration = Duration::from_secs(300);

/// Messages arriving at the coordinator's inbox.
#[derive(Debug)]
pub enum Inbound {
    /// A lock event from either watcher.
    Event(TransferEvent),
    /// Outcome of a relay submission task.
    RelayOutcome {
        transfer_id: String,
        outcome: RelayOutcome,
    },
    /// Non-fatal error surfaced by a long-running task.
    TaskError {
        component: &'static str,
        error: String,
    },
}

pub struct Coordinator {
    store: Store,
    engine: Arc<SigningEngine>,
    resolver: Arc<AssetResolver>,
    relay: Arc<RelayEngine>,
    gossip: Arc<GossipService>,
    quorum: QuorumView,

    inbox_rx: mpsc::Receiver<Inbound>,
    inbox_tx: mpsc::Sender<Inbound>,
    gossip_rx: mpsc::Receiver<Envelope>,

    overlay_listen_port: u16,
    /// Attestations waiting for their transfer to be observed locally.
    buffered_attestations: HashMap<String, Vec<Attestation>>,
    /// Transfers whose own attestation was published by this process.
    published: std::collections::HashSet<String>,
    consecutive_relay_failures: u32,
    relay_paused_until: Option<Instant>,
    /// Last task error, surfaced on /status.
    pub last_error: Option<(String, u64)>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        engine: Arc<SigningEngine>,
        resolver: Arc<AssetResolver>,
        relay: Arc<RelayEngine>,
        gossip: Arc<GossipService>,
        quorum: QuorumView,
        inbox_rx: mpsc::Receiver<Inbound>,
        inbox_tx: mpsc::Sender<Inbound>,
        gossip_rx: mpsc::Receiver<Envelope>,
        overlay_listen_port: u16,
    ) -> Self {
        Self {
            store,
            engine,
            resolver,
            relay,
            gossip,
            quorum,
            inbox_rx,
            inbox_tx,
            gossip_rx,
            overlay_listen_port,
            buffered_attestations: HashMap::new(),
            published: std::collections::HashSet::new(),
            consecutive_relay_failures: 0,
            relay_paused_until: None,
            last_error: None,
        }
    }

    /// Run until shutdown. Returns an error only on persistence failure,
    /// which is fatal for the whole process.
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let open = self.store.list_open_transfers()?;
        info!(open_transfers = open.len(), "Coordinator resuming from store");

        self.gossip
            .publish(GossipPayload::Announce {
                validator_id: self.engine.evm_validator_id(),
                listen_port: self.overlay_listen_port,
            })
            .await
            .ok();

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = self.inbox_rx.recv() => {
                    match message {
                        Some(message) => self.handle_inbound(message).await?,
                        None => break,
                    }
                }
                envelope = self.gossip_rx.recv() => {
                    if let Some(envelope) = envelope {
                        self.handle_gossip(envelope).await?;
                    }
                }
                _ = sweep.tick() => {
                    self.sweep().await?;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping coordinator");
                    break;
                }
            }
        }

        self.gossip.shutdown().await;
        self.store.flush()?;
        Ok(())
    }

    async fn handle_inbound(&mut self, message: Inbound) -> Result<()> {
        match message {
            Inbound::Event(event) => self.handle_event(event, false).await,
            Inbound::RelayOutcome {
                transfer_id,
                outcome,
            } => self.handle_relay_outcome(&transfer_id, outcome),
            Inbound::TaskError { component, error } => {
                warn!(component = component, error = %error, "Task reported an error");
                self.last_error = Some((format!("{}: {}", component, error), now_ms()));
                Ok(())
            }
        }
    }

    async fn handle_gossip(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.payload {
            GossipPayload::Attestation(attestation) => self.handle_attestation(attestation).await,
            GossipPayload::Transfer(event) => self.handle_event(event, true).await,
            GossipPayload::Announce { validator_id, .. } => {
                debug!(validator = %validator_id, "Peer announce");
                Ok(())
            }
            GossipPayload::Heartbeat { validator_id, .. } => {
                debug!(validator = %validator_id, "Peer heartbeat");
                Ok(())
            }
        }
    }

    /// Ingest a transfer event from a watcher or the mesh. Insert-if-absent
    /// makes redelivery harmless.
    async fn handle_event(&mut self, event: TransferEvent, from_gossip: bool) -> Result<()> {
        if let Err(e) = event.validate() {
            warn!(error = %e, "Discarding malformed transfer event");
            metrics::ERRORS
                .with_label_values(&["coordinator", "malformed"])
                .inc();
            return Ok(());
        }

        let record = TransferRecord::new(event.clone(), now_ms());
        if !self.store.put_transfer_if_absent(&record)? {
            debug!(transfer_id = %event.transfer_id, "Transfer already known");
            return Ok(());
        }
        info!(
            transfer_id = %event.transfer_id,
            source = %event.source,
            amount = %event.amount,
            "Transfer recorded"
        );

        if !from_gossip {
            self.gossip
                .publish(GossipPayload::Transfer(event.clone()))
                .await
                .ok();
        }

        // Attach any attestations that arrived before the event did.
        if let Some(buffered) = self.buffered_attestations.remove(&event.transfer_id) {
            for attestation in buffered {
                self.handle_attestation(attestation).await?;
            }
        }

        self.advance_pending(&event.transfer_id).await
    }

    /// Drive a `Pending` record: resolve the destination reference, produce
    /// our attestation if we hold the key, publish, move to `Attesting`.
    /// A resolver miss fails the record; a resolver error leaves it pending
    /// for the next sweep.
    async fn advance_pending(&mut self, transfer_id: &str) -> Result<()> {
        let Some(mut record) = self.store.get_transfer(transfer_id)? else {
            return Ok(());
        };
        if record.status != TransferStatus::Pending {
            return Ok(());
        }

        let resolution = match self.resolver.resolve(&record.event).await {
            Ok(Some(resolution)) => resolution,
            Ok(None) => {
                return self.mark_failed(record, "destination token not registered");
            }
            Err(e) => {
                debug!(transfer_id = %transfer_id, error = %e, "Resolver unavailable, staying pending");
                metrics::ERRORS
                    .with_label_values(&["resolver", "transient"])
                    .inc();
                return Ok(());
            }
        };

        if self.engine.can_sign_for(record.event.destination) {
            // A signing failure here is a data problem (for example a
            // malformed recipient), not a process problem.
            let attestation = match self.engine.sign(&record.event, &resolution) {
                Ok(attestation) => attestation,
                Err(e) => {
                    return self.mark_failed(record, &format!("signing failed: {e}"));
                }
            };
            if self.store.append_attestation(&attestation)? {
                metrics::ATTESTATIONS_PRODUCED
                    .with_label_values(&[record.event.destination.as_str()])
                    .inc();
                record.attestations.push(attestation.clone());
            }
            self.publish_attestation(attestation).await;
        }

        self.advance_status(&mut record, TransferStatus::Attesting)?;
        Ok(())
    }

    /// Ingest a peer attestation: dedup, membership check against the
    /// on-chain set, cryptographic verification, persist.
    async fn handle_attestation(&mut self, attestation: Attestation) -> Result<()> {
        let Some(record) = self.store.get_transfer(&attestation.transfer_id)? else {
            self.buffer_attestation(attestation);
            return Ok(());
        };
        if record.has_attestation(&attestation.validator_id) {
            debug!(
                transfer_id = %attestation.transfer_id,
                validator = %attestation.validator_id,
                "Duplicate attestation dropped"
            );
            return Ok(());
        }

        match self
            .quorum
            .is_validator(attestation.destination, &attestation.validator_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    validator = %attestation.validator_id,
                    "Attestation from identity outside the active set, ignoring"
                );
                metrics::ATTESTATIONS_RECEIVED
                    .with_label_values(&["rejected"])
                    .inc();
                return Ok(());
            }
            Err(e) => {
                debug!(error = %e, "Validator set unavailable, buffering attestation");
                self.buffer_attestation(attestation);
                return Ok(());
            }
        }

        if !self.engine.verify(&attestation, &attestation.validator_id) {
            warn!(
                validator = %attestation.validator_id,
                transfer_id = %attestation.transfer_id,
                "Attestation failed verification, ignoring"
            );
            metrics::ATTESTATIONS_RECEIVED
                .with_label_values(&["invalid"])
                .inc();
            return Ok(());
        }

        if self.store.append_attestation(&attestation)? {
            metrics::ATTESTATIONS_RECEIVED
                .with_label_values(&["accepted"])
                .inc();
            info!(
                transfer_id = %attestation.transfer_id,
                validator = %attestation.validator_id,
                "Peer attestation attached"
            );
            // Re-read: the append just rewrote the stored record.
            if let Some(mut record) = self.store.get_transfer(&attestation.transfer_id)? {
                if record.status == TransferStatus::Pending {
                    self.advance_status(&mut record, TransferStatus::Attesting)?;
                }
            }
        }
        Ok(())
    }

    fn buffer_attestation(&mut self, attestation: Attestation) {
        let total: usize = self.buffered_attestations.values().map(Vec::len).sum();
        if total >= MAX_BUFFERED_ATTESTATIONS {
            warn!("Attestation buffer full, dropping");
            return;
        }
        debug!(
            transfer_id = %attestation.transfer_id,
            "Buffering attestation for unobserved transfer"
        );
        self.buffered_attestations
            .entry(attestation.transfer_id.clone())
            .or_default()
            .push(attestation);
    }

    /// Periodic sweep over open records.
    async fn sweep(&mut self) -> Result<()> {
        let open = self.store.list_open_transfers()?;
        metrics::OPEN_TRANSFERS.set(open.len() as f64);

        for record in open {
            match record.status {
                TransferStatus::Pending => {
                    let id = record.event.transfer_id.clone();
                    self.advance_pending(&id).await?;
                }
                TransferStatus::Attesting | TransferStatus::Relaying => {
                    self.maybe_relay(record).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Launch a relay for a record once its attestation count reaches the
    /// current on-chain threshold. Skips records with an outstanding
    /// submission and respects the failure breaker.
    async fn maybe_relay(&mut self, mut record: TransferRecord) -> Result<()> {
        let transfer_id = record.event.transfer_id.clone();

        if record.status == TransferStatus::Attesting {
            self.ensure_own_attestation(&mut record).await?;
        }

        if let Some(until) = self.relay_paused_until {
            if Instant::now() < until {
                return Ok(());
            }
            self.relay_paused_until = None;
        }

        let threshold = match self.quorum.threshold(record.event.destination).await {
            Ok(threshold) => threshold,
            Err(e) => {
                debug!(error = %e, "Threshold unavailable, skipping relay this sweep");
                return Ok(());
            }
        };
        if record.attestation_count() < threshold {
            return Ok(());
        }

        if !self.relay.try_begin(&transfer_id) {
            return Ok(());
        }

        let resolution = match self.resolver.resolve(&record.event).await {
            Ok(Some(resolution)) => resolution,
            Ok(None) => {
                self.relay.finish(&transfer_id);
                return self.mark_failed(record, "destination token not registered");
            }
            Err(e) => {
                self.relay.finish(&transfer_id);
                debug!(error = %e, "Resolver unavailable before relay, skipping");
                return Ok(());
            }
        };

        if record.status == TransferStatus::Attesting {
            self.advance_status(&mut record, TransferStatus::Relaying)?;
        }

        info!(
            transfer_id = %transfer_id,
            attestations = record.attestation_count(),
            threshold = threshold,
            "Quorum reached, submitting release"
        );

        let relay = self.relay.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let outcome = relay.relay(&record, &resolution).await;
            let transfer_id = record.event.transfer_id.clone();
            if inbox
                .send(Inbound::RelayOutcome {
                    transfer_id: transfer_id.clone(),
                    outcome,
                })
                .await
                .is_err()
            {
                // Coordinator is gone; the in-flight claim dies with it.
                warn!(transfer_id = %transfer_id, "Relay outcome undeliverable");
            }
        });
        Ok(())
    }

    /// Make sure our own attestation for an open record exists and has been
    /// published at least once by this process. Covers a crash between
    /// signing and publishing.
    async fn ensure_own_attestation(&mut self, record: &mut TransferRecord) -> Result<()> {
        if !self.engine.can_sign_for(record.event.destination) {
            return Ok(());
        }
        let our_id = self.engine.validator_id_for(record.event.destination)?;

        if !record.has_attestation(&our_id) {
            let resolution = match self.resolver.resolve(&record.event).await {
                Ok(Some(resolution)) => resolution,
                _ => return Ok(()),
            };
            let attestation = match self.engine.sign(&record.event, &resolution) {
                Ok(attestation) => attestation,
                Err(e) => {
                    warn!(
                        transfer_id = %record.event.transfer_id,
                        error = %e,
                        "Cannot sign for this transfer"
                    );
                    return Ok(());
                }
            };
            if self.store.append_attestation(&attestation)? {
                metrics::ATTESTATIONS_PRODUCED
                    .with_label_values(&[record.event.destination.as_str()])
                    .inc();
                record.attestations.push(attestation.clone());
            }
            self.publish_attestation(attestation).await;
        } else if !self.published.contains(&record.event.transfer_id) {
            if let Some(ours) = record
                .attestations
                .iter()
                .find(|a| a.validator_id.eq_ignore_ascii_case(&our_id))
                .cloned()
            {
                self.publish_attestation(ours).await;
            }
        }
        Ok(())
    }

    async fn publish_attestation(&mut self, attestation: Attestation) {
        let transfer_id = attestation.transfer_id.clone();
        self.gossip
            .publish(GossipPayload::Attestation(attestation))
            .await
            .ok();
        self.published.insert(transfer_id);
    }

    fn handle_relay_outcome(&mut self, transfer_id: &str, outcome: RelayOutcome) -> Result<()> {
        self.relay.finish(transfer_id);
        let Some(mut record) = self.store.get_transfer(transfer_id)? else {
            return Ok(());
        };

        match outcome {
            RelayOutcome::Completed { tx_id } => {
                self.consecutive_relay_failures = 0;
                record.relay_tx_id = Some(tx_id);
                record.last_error = None;
                self.advance_status(&mut record, TransferStatus::Completed)?;
                info!(transfer_id = %transfer_id, "Transfer completed");
            }
            RelayOutcome::AlreadyProcessed => {
                self.consecutive_relay_failures = 0;
                self.advance_status(&mut record, TransferStatus::Completed)?;
                info!(transfer_id = %transfer_id, "Transfer already processed, completing");
            }
            RelayOutcome::Transient { error } => {
                self.note_relay_failure();
                record.relay_attempts += 1;
                record.last_error = Some(error.clone());
                if record.relay_attempts >= MAX_RELAY_ATTEMPTS {
                    warn!(
                        transfer_id = %transfer_id,
                        attempts = record.relay_attempts,
                        "Relay attempts exhausted"
                    );
                    self.advance_status(&mut record, TransferStatus::Failed)?;
                } else {
                    warn!(
                        transfer_id = %transfer_id,
                        attempt = record.relay_attempts,
                        error = %error,
                        "Relay attempt failed, will retry next sweep"
                    );
                    record.updated_at = now_ms();
                    self.store.update_transfer(&record)?;
                }
            }
            RelayOutcome::Permanent { error } => {
                self.note_relay_failure();
                record.relay_attempts += 1;
                record.last_error = Some(error.clone());
                warn!(transfer_id = %transfer_id, error = %error, "Relay failed permanently");
                self.advance_status(&mut record, TransferStatus::Failed)?;
            }
        }
        Ok(())
    }

    fn note_relay_failure(&mut self) {
        self.consecutive_relay_failures += 1;
        if self.consecutive_relay_failures >= RELAY_BREAKER_THRESHOLD {
            warn!(
                failures = self.consecutive_relay_failures,
                pause_secs = RELAY_BREAKER_PAUSE.as_secs(),
                "Relay breaker tripped, pausing submissions"
            );
            self.relay_paused_until = Some(Instant::now() + RELAY_BREAKER_PAUSE);
            self.consecutive_relay_failures = 0;
        }
    }

    fn advance_status(&mut self, record: &mut TransferRecord, next: TransferStatus) -> Result<()> {
        if !record.status.can_advance_to(next) {
            debug!(
                transfer_id = %record.event.transfer_id,
                from = %record.status,
                to = %next,
                "Status transition refused"
            );
            return Ok(());
        }
        record.status = next;
        record.updated_at = now_ms();
        self.store.update_transfer(record)
    }

    fn mark_failed(&mut self, mut record: TransferRecord, reason: &str) -> Result<()> {
        warn!(
            transfer_id = %record.event.transfer_id,
            reason = reason,
            "Transfer failed"
        );
        metrics::ERRORS
            .with_label_values(&["coordinator", "resolver_miss"])
            .inc();
        record.last_error = Some(reason.to_string());
        self.advance_status(&mut record, TransferStatus::Failed)
    }

    async fn heartbeat(&mut self) {
        let open = self.store.get_stats().map(|s| s.pending + s.attesting + s.relaying);
        self.gossip
            .publish(GossipPayload::Heartbeat {
                validator_id: self.engine.evm_validator_id(),
                open_transfers: open.unwrap_or(0),
            })
            .await
            .ok();
    }
}

/// Quorum parameters read from the destination bridge, cached for a short
/// TTL. The node never trusts a locally configured constant for these.
pub struct QuorumView {
    b_rpc_url: String,
    b_bridge: Address,
    a_client: ChainAClient,
    a_bridge_address: String,
    threshold_cache: HashMap<ChainId, (usize, Instant)>,
    member_cache: HashMap<(ChainId, String), (bool, Instant)>,
}

impl QuorumView {
    pub fn new(
        b_rpc_url: &str,
        b_bridge: Address,
        a_client: ChainAClient,
        a_bridge_address: &str,
    ) -> Self {
        Self {
            b_rpc_url: b_rpc_url.to_string(),
            b_bridge,
            a_client,
            a_bridge_address: a_bridge_address.to_string(),
            threshold_cache: HashMap::new(),
            member_cache: HashMap::new(),
        }
    }

    pub async fn threshold(&mut self, destination: ChainId) -> Result<usize> {
        if let Some((value, at)) = self.threshold_cache.get(&destination) {
            if at.elapsed() < QUORUM_CACHE_TTL {
                return Ok(*value);
            }
        }
        let value = match destination {
            ChainId::B => {
                let provider = ProviderBuilder::new()
                    .on_http(self.b_rpc_url.parse().wrap_err("Invalid chain B RPC URL")?);
                let contract = BridgeB::new(self.b_bridge, &provider);
                let raw = contract
                    .validatorThreshold()
                    .call()
                    .await
                    .wrap_err("validatorThreshold query failed")?
                    ._0;
                usize::try_from(raw).wrap_err("Threshold out of range")?
            }
            ChainId::A => self
                .a_client
                .get_data_entry(&self.a_bridge_address, "validator_threshold")
                .await
                .wrap_err("validator_threshold lookup failed")?
                .and_then(|entry| entry.as_u64())
                .map(|v| v as usize)
                .ok_or_else(|| eyre::eyre!("Chain A bridge has no validator_threshold row"))?,
        };
        self.threshold_cache
            .insert(destination, (value, Instant::now()));
        Ok(value)
    }

    pub async fn is_validator(&mut self, destination: ChainId, validator_id: &str) -> Result<bool> {
        let cache_key = (destination, validator_id.to_lowercase());
        if let Some((value, at)) = self.member_cache.get(&cache_key) {
            if at.elapsed() < QUORUM_CACHE_TTL {
                return Ok(*value);
            }
        }
        let value = match destination {
            ChainId::B => {
                let address: Address = validator_id
                    .parse()
                    .wrap_err("Validator id is not a chain B address")?;
                let provider = ProviderBuilder::new()
                    .on_http(self.b_rpc_url.parse().wrap_err("Invalid chain B RPC URL")?);
                let contract = BridgeB::new(self.b_bridge, &provider);
                contract
                    .isValidator(address)
                    .call()
                    .await
                    .wrap_err("isValidator query failed")?
                    ._0
            }
            ChainId::A => {
                let key = format!("validator_{}", validator_id);
                self.a_client
                    .get_data_entry(&self.a_bridge_address, &key)
                    .await
                    .wrap_err("validator row lookup failed")?
                    .map(|entry| entry.is_truthy())
                    .unwrap_or(false)
            }
        };
        self.member_cache.insert(cache_key, (value, Instant::now()));
        Ok(value)
    }
}
