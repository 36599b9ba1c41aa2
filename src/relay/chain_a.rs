//! Release submission on chain A.

use eyre::{eyre, Result, WrapErr};
use std::time::Duration;
use tracing::{info, warn};

use super::{outcome_from_error, RelayOutcome};
use crate::chain_a_client::{ChainAClient, InvokeArg, RELEASE_INVOKE_FEE};
use crate::metrics;
use crate::types::{ChainId, TransferRecord};

/// Bounded wait for inclusion of the release invoke.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Data-row flag the bridge dApp writes once a transfer is released.
const PROCESSED_KEY_PREFIX: &str = "processed_";

pub struct ChainARelay {
    client: ChainAClient,
    bridge_address: String,
    key: ed25519_dalek::SigningKey,
}

impl ChainARelay {
    pub fn new(client: ChainAClient, bridge_address: &str, key: ed25519_dalek::SigningKey) -> Self {
        Self {
            client,
            bridge_address: bridge_address.to_string(),
            key,
        }
    }

    pub async fn relay(&self, record: &TransferRecord, asset_id: &str) -> RelayOutcome {
        match self.submit(record, asset_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::RELAYS_SUBMITTED
                    .with_label_values(&["A", "error"])
                    .inc();
                outcome_from_error(&e)
            }
        }
    }

    async fn submit(&self, record: &TransferRecord, asset_id: &str) -> Result<RelayOutcome> {
        let event = &record.event;

        let processed_key = format!("{}{}", PROCESSED_KEY_PREFIX, event.transfer_id);
        let flag = self
            .client
            .get_data_entry(&self.bridge_address, &processed_key)
            .await
            .wrap_err("Processed-flag lookup failed")?;
        if flag.map(|entry| entry.is_truthy()).unwrap_or(false) {
            info!(transfer_id = %event.transfer_id, "Transfer already processed on chain A");
            return Ok(RelayOutcome::AlreadyProcessed);
        }

        let (signatures, public_keys) = paired_proofs(record)?;

        let amount: i64 = event
            .amount
            .try_into()
            .map_err(|_| eyre!("Amount {} exceeds the chain A integer range", event.amount))?;

        let args = vec![
            InvokeArg::Str(event.transfer_id.clone()),
            InvokeArg::Str(event.recipient.clone()),
            InvokeArg::Str(asset_id.to_string()),
            InvokeArg::Int(amount),
            InvokeArg::List(signatures.into_iter().map(InvokeArg::Bin).collect()),
            InvokeArg::List(public_keys.into_iter().map(InvokeArg::Bin).collect()),
        ];

        let tx_id = self
            .client
            .broadcast_invoke(
                &self.key,
                &self.bridge_address,
                "releaseTokens",
                &args,
                RELEASE_INVOKE_FEE,
            )
            .await?;

        self.client
            .wait_for_confirmation(&tx_id, CONFIRMATION_TIMEOUT)
            .await?;

        metrics::RELAYS_SUBMITTED
            .with_label_values(&["A", "confirmed"])
            .inc();
        Ok(RelayOutcome::Completed { tx_id })
    }
}

/// Decode the record's A-destination attestations into positional signature
/// and public-key lists. Counts are equal and the order is identical for
/// both, since the on-chain verifier iterates them pair-wise. Attestations
/// that fail to decode are skipped with a warning.
fn paired_proofs(record: &TransferRecord) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let mut signatures = Vec::new();
    let mut public_keys = Vec::new();

    for attestation in &record.attestations {
        if attestation.destination != ChainId::A {
            continue;
        }
        let Some(pubkey_b58) = attestation.public_key.as_deref() else {
            warn!(
                validator = %attestation.validator_id,
                "A-destination attestation missing public key, skipping"
            );
            continue;
        };
        let (Ok(signature), Ok(public_key)) = (
            bs58::decode(&attestation.signature).into_vec(),
            bs58::decode(pubkey_b58).into_vec(),
        ) else {
            warn!(
                validator = %attestation.validator_id,
                "A-destination attestation with undecodable Base58, skipping"
            );
            continue;
        };
        signatures.push(signature);
        public_keys.push(public_key);
    }

    if signatures.is_empty() {
        return Err(eyre!("No chain A attestations to submit"));
    }
    Ok((signatures, public_keys))
}
