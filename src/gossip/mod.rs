//! Authenticated pub/sub overlay for attestations and discovery.
//!
//! Peers connect over TCP and exchange length-prefixed JSON envelopes. Each
//! envelope is signed with the node's overlay key, a keypair generated at
//! startup and distinct from the attestation keys. There is no forwarding:
//! every peer link is direct, duplicates are expected, and ordering is not
//! guaranteed — downstream processing is idempotent.

use ed25519_dalek::{Signer as _, Verifier as _};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::signing::now_ms;
use crate::types::{Attestation, TransferEvent};

pub mod transport;

use transport::MeshTransport;

/// Envelopes older than this are dropped on receipt.
pub const DRIFT_HORIZON_MS: u64 = 10 * 60 * 1000;

pub const TOPIC_ATTESTATIONS: &str = "attestations";
pub const TOPIC_TRANSFERS: &str = "transfers";
pub const TOPIC_VALIDATOR_ANNOUNCE: &str = "validator-announce";

/// Message payload types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GossipPayload {
    Attestation(Attestation),
    Transfer(TransferEvent),
    Announce { validator_id: String, listen_port: u16 },
    Heartbeat { validator_id: String, open_transfers: u64 },
}

impl GossipPayload {
    pub fn topic(&self) -> &'static str {
        match self {
            GossipPayload::Attestation(_) => TOPIC_ATTESTATIONS,
            GossipPayload::Transfer(_) => TOPIC_TRANSFERS,
            GossipPayload::Announce { .. } | GossipPayload::Heartbeat { .. } => {
                TOPIC_VALIDATOR_ANNOUNCE
            }
        }
    }
}

/// Signed overlay message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: GossipPayload,
    pub sender_validator_id: String,
    /// Wall-clock ms at publication.
    pub sent_at: u64,
    /// Hex overlay public key of the sender node.
    pub node_pubkey: String,
    /// Hex ed25519 signature over [`Envelope::signing_bytes`].
    pub signature: String,
}

impl Envelope {
    /// The byte string the overlay signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(self.topic.as_bytes());
        data.extend_from_slice(self.sender_validator_id.as_bytes());
        data.extend_from_slice(&self.sent_at.to_be_bytes());
        if let Ok(payload) = serde_json::to_vec(&self.payload) {
            data.extend_from_slice(&payload);
        }
        data
    }

    pub fn verify_signature(&self) -> bool {
        let Ok(pubkey_raw) = hex::decode(&self.node_pubkey) else {
            return false;
        };
        let Ok(pubkey_bytes) = <[u8; 32]>::try_from(pubkey_raw.as_slice()) else {
            return false;
        };
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&pubkey_bytes) else {
            return false;
        };
        let Ok(sig_raw) = hex::decode(&self.signature) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_raw.as_slice()) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(&self.signing_bytes(), &signature).is_ok()
    }

    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.sent_at) > DRIFT_HORIZON_MS
    }
}

/// The overlay service handle owned by the node.
pub struct GossipService {
    node_key: ed25519_dalek::SigningKey,
    validator_id: String,
    transport: std::sync::Arc<MeshTransport>,
    standalone: bool,
}

impl GossipService {
    /// Build the overlay. Returns the service and the receiver of verified
    /// peer envelopes. An empty bootstrap list is a valid single-validator
    /// deployment; publishing then becomes a no-op.
    pub fn new(
        listen_port: u16,
        bootstrap_peers: Vec<String>,
        validator_id: String,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let node_key = ed25519_dalek::SigningKey::generate(&mut rand_core::OsRng);
        let standalone = bootstrap_peers.is_empty();

        let (raw_tx, mut raw_rx) = mpsc::channel::<Envelope>(1024);
        let (verified_tx, verified_rx) = mpsc::channel::<Envelope>(1024);

        let own_id = validator_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = raw_rx.recv().await {
                metrics::GOSSIP_MESSAGES
                    .with_label_values(&[&envelope.topic, "in"])
                    .inc();
                if envelope.sender_validator_id == own_id {
                    // Self-published messages must not round-trip back.
                    continue;
                }
                if envelope.is_stale(now_ms()) {
                    debug!(topic = %envelope.topic, "Dropping stale gossip envelope");
                    continue;
                }
                if !envelope.verify_signature() {
                    warn!(
                        sender = %envelope.sender_validator_id,
                        topic = %envelope.topic,
                        "Dropping gossip envelope with bad overlay signature"
                    );
                    continue;
                }
                if verified_tx.send(envelope).await.is_err() {
                    break;
                }
            }
        });

        let transport = std::sync::Arc::new(MeshTransport::new(listen_port, bootstrap_peers, raw_tx));

        (
            Self {
                node_key,
                validator_id,
                transport,
                standalone,
            },
            verified_rx,
        )
    }

    /// Bind the listener and dial bootstrap peers.
    pub async fn start(&self) -> Result<()> {
        if self.standalone {
            info!("No bootstrap peers configured, overlay runs standalone");
        }
        self.transport.start().await.wrap_err("Overlay start failed")?;
        info!(
            node_pubkey = %hex::encode(self.node_key.verifying_key().to_bytes()),
            "Gossip overlay started"
        );
        Ok(())
    }

    /// Sign and broadcast a payload to all connected peers.
    pub async fn publish(&self, payload: GossipPayload) -> Result<()> {
        let topic = payload.topic().to_string();
        let mut envelope = Envelope {
            topic: topic.clone(),
            payload,
            sender_validator_id: self.validator_id.clone(),
            sent_at: now_ms(),
            node_pubkey: hex::encode(self.node_key.verifying_key().to_bytes()),
            signature: String::new(),
        };
        let signature = self.node_key.sign(&envelope.signing_bytes());
        envelope.signature = hex::encode(signature.to_bytes());

        metrics::GOSSIP_MESSAGES
            .with_label_values(&[&topic, "out"])
            .inc();
        self.transport.broadcast(&envelope).await;
        Ok(())
    }

    pub async fn peer_count(&self) -> usize {
        self.transport.peer_count().await
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainId;

    fn signed_envelope(key: &ed25519_dalek::SigningKey, sent_at: u64) -> Envelope {
        let mut envelope = Envelope {
            topic: TOPIC_ATTESTATIONS.to_string(),
            payload: GossipPayload::Attestation(Attestation {
                transfer_id: "t1".to_string(),
                source: ChainId::A,
                destination: ChainId::B,
                validator_id: "0xaa00000000000000000000000000000000000001".to_string(),
                signature: "0x00".to_string(),
                public_key: None,
                message_digest: "00".to_string(),
                produced_at: sent_at,
            }),
            sender_validator_id: "0xaa00000000000000000000000000000000000001".to_string(),
            sent_at,
            node_pubkey: hex::encode(key.verifying_key().to_bytes()),
            signature: String::new(),
        };
        let sig = key.sign(&envelope.signing_bytes());
        envelope.signature = hex::encode(sig.to_bytes());
        envelope
    }

    #[test]
    fn test_envelope_signature_round_trip() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]);
        let envelope = signed_envelope(&key, 1000);
        assert!(envelope.verify_signature());

        let mut tampered = envelope.clone();
        tampered.sender_validator_id = "0xbb00000000000000000000000000000000000002".to_string();
        assert!(!tampered.verify_signature());
    }

    #[test]
    fn test_envelope_staleness() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]);
        let envelope = signed_envelope(&key, 1000);
        assert!(!envelope.is_stale(1000 + DRIFT_HORIZON_MS));
        assert!(envelope.is_stale(1001 + DRIFT_HORIZON_MS));
    }

    #[test]
    fn test_payload_topics() {
        let heartbeat = GossipPayload::Heartbeat {
            validator_id: "v".to_string(),
            open_transfers: 0,
        };
        assert_eq!(heartbeat.topic(), TOPIC_VALIDATOR_ANNOUNCE);
        let announce = GossipPayload::Announce {
            validator_id: "v".to_string(),
            listen_port: 9300,
        };
        assert_eq!(announce.topic(), TOPIC_VALIDATOR_ANNOUNCE);
    }

    #[test]
    fn test_envelope_serialization_round_trip() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]);
        let envelope = signed_envelope(&key, 5);
        let json = serde_json::to_string(&envelope).unwrap();
        let restored: Envelope = serde_json::from_str(&json).unwrap();
        assert!(restored.verify_signature());
        assert_eq!(restored.topic, TOPIC_ATTESTATIONS);
    }
}
