//! Release submission on chain B.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info, warn};

use super::{outcome_from_error, RelayOutcome};
use crate::contracts::BridgeB;
use crate::metrics;
use crate::signing::recover_b_signer;
use crate::types::{Attestation, ChainId, TransferRecord};

pub struct EvmRelay {
    rpc_url: String,
    bridge_address: Address,
    signer: PrivateKeySigner,
}

impl EvmRelay {
    pub fn new(rpc_url: &str, bridge_address: Address, signer: PrivateKeySigner) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            bridge_address,
            signer,
        }
    }

    pub async fn relay(&self, record: &TransferRecord, token: Address) -> RelayOutcome {
        match self.submit(record, token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::RELAYS_SUBMITTED
                    .with_label_values(&["B", "error"])
                    .inc();
                outcome_from_error(&e)
            }
        }
    }

    async fn submit(&self, record: &TransferRecord, token: Address) -> Result<RelayOutcome> {
        let event = &record.event;
        let id32: FixedBytes<32> = FixedBytes::from(event.id_as_bytes32()?);

        // Re-check the on-chain replay set right before submission.
        let read_provider = ProviderBuilder::new()
            .on_http(self.rpc_url.parse().wrap_err("Invalid chain B RPC URL")?);
        let read_contract = BridgeB::new(self.bridge_address, &read_provider);
        let processed = read_contract
            .processedTransfers(id32)
            .call()
            .await
            .wrap_err("processedTransfers query failed")?
            ._0;
        if processed {
            info!(transfer_id = %event.transfer_id, "Transfer already processed on chain B");
            return Ok(RelayOutcome::AlreadyProcessed);
        }

        let ordered = ordered_signatures(&record.attestations)?;
        let signers: Vec<String> = ordered.iter().map(|(a, _)| format!("{a}")).collect();
        let signatures: Vec<Bytes> = ordered.into_iter().map(|(_, sig)| Bytes::from(sig)).collect();

        let recipient: Address = event
            .recipient
            .parse()
            .wrap_err_with(|| format!("Invalid B-side recipient {}", event.recipient))?;

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_http(self.rpc_url.parse().wrap_err("Invalid chain B RPC URL")?);
        let contract = BridgeB::new(self.bridge_address, &provider);

        debug!(
            transfer_id = %event.transfer_id,
            signatures = signatures.len(),
            "Submitting chain B release"
        );

        let token_id = U256::from(event.token_id.unwrap_or(0));
        // Estimate, then apply 20% head-room before sending.
        let (tx_hash, receipt) = if event.kind.is_non_fungible() {
            let call = contract.releaseNFT(id32, token, recipient, token_id, signatures);
            let estimate = call.estimate_gas().await.wrap_err("Gas estimation failed")?;
            let call = call.gas(estimate + estimate / 5);
            let pending = call
                .send()
                .await
                .map_err(|e| eyre!("Failed to send releaseNFT: {}", e))?;
            let tx_hash = *pending.tx_hash();
            info!(tx_hash = %tx_hash, "Release sent, waiting for receipt");
            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| eyre!("Failed to get receipt: {}", e))?;
            (tx_hash, receipt)
        } else {
            let call = contract.releaseTokens(
                id32,
                token,
                U256::from(event.amount),
                recipient,
                event.kind.wire_byte(),
                token_id,
                signatures,
            );
            let estimate = call.estimate_gas().await.wrap_err("Gas estimation failed")?;
            let call = call.gas(estimate + estimate / 5);
            let pending = call
                .send()
                .await
                .map_err(|e| eyre!("Failed to send releaseTokens: {}", e))?;
            let tx_hash = *pending.tx_hash();
            info!(tx_hash = %tx_hash, "Release sent, waiting for receipt");
            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| eyre!("Failed to get receipt: {}", e))?;
            (tx_hash, receipt)
        };

        if !receipt.status() {
            // Log the recovered signer set so a verifier rejection can be
            // traced to the offending contribution.
            warn!(
                transfer_id = %event.transfer_id,
                signers = ?signers,
                tx_hash = %tx_hash,
                "Release transaction reverted"
            );
            return Err(eyre!("Release transaction reverted"));
        }

        metrics::RELAYS_SUBMITTED
            .with_label_values(&["B", "confirmed"])
            .inc();
        Ok(RelayOutcome::Completed {
            tx_id: format!("0x{:x}", tx_hash),
        })
    }
}

/// Recover each attestation's signer and produce the signature list the
/// on-chain verifier expects: strictly ascending by 20-byte signer address,
/// one contribution per address. Two attestations recovering to the same
/// address collapse into one.
pub fn ordered_signatures(attestations: &[Attestation]) -> Result<Vec<(Address, Vec<u8>)>> {
    let mut by_signer: Vec<(Address, Vec<u8>)> = Vec::new();

    for attestation in attestations {
        if attestation.destination != ChainId::B {
            continue;
        }
        let Some(signer) = recover_b_signer(attestation) else {
            return Err(eyre!(
                "Attestation from {} does not recover to a signer",
                attestation.validator_id
            ));
        };
        let sig_hex = attestation
            .signature
            .strip_prefix("0x")
            .unwrap_or(&attestation.signature);
        let sig_bytes = hex::decode(sig_hex).wrap_err("Invalid attestation signature hex")?;

        if !by_signer.iter().any(|(existing, _)| *existing == signer) {
            by_signer.push((signer, sig_bytes));
        }
    }

    if by_signer.is_empty() {
        return Err(eyre!("No chain B attestations to submit"));
    }

    by_signer.sort_by(|(a, _), (b, _)| a.as_slice().cmp(b.as_slice()));
    Ok(by_signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Resolution;
    use crate::signing::SigningEngine;
    use crate::types::{TokenKind, TransferEvent};

    fn event() -> TransferEvent {
        TransferEvent {
            transfer_id: "5FooBarBaz".to_string(),
            source: ChainId::A,
            destination: ChainId::B,
            token: "WAVES".to_string(),
            amount: 100_000_000,
            sender: "3PSender".to_string(),
            recipient: "0x0000000000000000000000000000000000000001".to_string(),
            kind: TokenKind::FungibleExternal,
            token_id: None,
            src_block: 10,
            src_tx: "5FooBarBaz".to_string(),
            observed_at: 1,
        }
    }

    fn engine(key_byte: u8) -> SigningEngine {
        let key = format!("0x{}", hex::encode([key_byte; 32]));
        SigningEngine::new(&key, None, 88811).unwrap()
    }

    fn resolution() -> Resolution {
        Resolution::B {
            token: "0x4025A8Ee89DAead315de690f0C250caB5309a115".parse().unwrap(),
        }
    }

    #[test]
    fn test_signatures_sorted_by_signer_address() {
        let event = event();
        let attestations: Vec<Attestation> = (1..=4)
            .map(|i| engine(i).sign(&event, &resolution()).unwrap())
            .collect();

        let ordered = ordered_signatures(&attestations).unwrap();
        assert_eq!(ordered.len(), 4);
        for pair in ordered.windows(2) {
            assert!(pair[0].0.as_slice() < pair[1].0.as_slice());
        }

        // Idempotent: sorting already sorted input yields the same order.
        let again = ordered_signatures(&attestations).unwrap();
        assert_eq!(ordered, again);
    }

    #[test]
    fn test_duplicate_signers_collapse() {
        let event = event();
        let engine = engine(1);
        let one = engine.sign(&event, &resolution()).unwrap();
        let mut two = one.clone();
        // Same signer under a differently-cased identity string.
        two.validator_id = two.validator_id.to_uppercase().replace("0X", "0x");

        let ordered = ordered_signatures(&[one, two]).unwrap();
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_unrecoverable_signature_rejected() {
        let mut attestation = engine(1).sign(&event(), &resolution()).unwrap();
        attestation.signature = "0x00".to_string();
        assert!(ordered_signatures(&[attestation]).is_err());
    }

    #[test]
    fn test_empty_list_rejected() {
        assert!(ordered_signatures(&[]).is_err());
    }
}
