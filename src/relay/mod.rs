//! Release submission on the destination chain.
//!
//! The coordinator triggers a relay once a record holds a quorum of verified
//! attestations. Submissions are tracked in an in-flight set so a record is
//! never submitted twice concurrently; transient failures leave the record in
//! `Relaying` for the next sweep.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::resolver::Resolution;
use crate::retry::{classify_error, ErrorClass};
use crate::types::{ChainId, TransferRecord};

pub mod chain_a;
pub mod evm;

pub use chain_a::ChainARelay;
pub use evm::EvmRelay;

/// Result of one relay attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Submitted and confirmed on the destination chain.
    Completed { tx_id: String },
    /// The destination verifier already marked this transfer processed.
    AlreadyProcessed,
    /// Worth re-attempting on a later sweep.
    Transient { error: String },
    /// Never retried automatically.
    Permanent { error: String },
}

/// Map an attempt error to an outcome by its error class. Unknown errors are
/// treated as transient; the bounded attempt counter caps them.
pub fn outcome_from_error(error: &eyre::Report) -> RelayOutcome {
    let message = error.to_string();
    match classify_error(&message) {
        ErrorClass::Permanent => RelayOutcome::Permanent { error: message },
        ErrorClass::Transient | ErrorClass::Unknown => RelayOutcome::Transient { error: message },
    }
}

pub struct RelayEngine {
    evm: EvmRelay,
    chain_a: Option<ChainARelay>,
    inflight: Mutex<HashSet<String>>,
}

impl RelayEngine {
    pub fn new(evm: EvmRelay, chain_a: Option<ChainARelay>) -> Self {
        Self {
            evm,
            chain_a,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Claim a transfer for submission. Returns false while an earlier
    /// submission for the same transfer is still outstanding.
    pub fn try_begin(&self, transfer_id: &str) -> bool {
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .insert(transfer_id.to_string())
    }

    pub fn finish(&self, transfer_id: &str) {
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(transfer_id);
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().expect("inflight lock poisoned").len()
    }

    /// Submit the release for a quorum-complete record. The caller must hold
    /// the in-flight claim for the record.
    pub async fn relay(&self, record: &TransferRecord, resolution: &Resolution) -> RelayOutcome {
        match record.event.destination {
            ChainId::B => {
                let Resolution::B { token } = resolution else {
                    return RelayOutcome::Permanent {
                        error: "B-destination transfer resolved to an A-side asset".to_string(),
                    };
                };
                self.evm.relay(record, *token).await
            }
            ChainId::A => {
                let Resolution::A { asset_id } = resolution else {
                    return RelayOutcome::Permanent {
                        error: "A-destination transfer resolved to a B-side token".to_string(),
                    };
                };
                match &self.chain_a {
                    Some(relay) => relay.relay(record, asset_id).await,
                    None => RelayOutcome::Permanent {
                        error: "Chain A relay is disabled (no ed25519 seed)".to_string(),
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflight_tracking() {
        let engine = RelayEngine::new(
            EvmRelay::new(
                "http://localhost:8545",
                alloy::primitives::Address::ZERO,
                "0x0000000000000000000000000000000000000000000000000000000000000001"
                    .parse()
                    .unwrap(),
            ),
            None,
        );

        assert!(engine.try_begin("t1"));
        assert!(!engine.try_begin("t1"));
        assert!(engine.try_begin("t2"));
        assert_eq!(engine.inflight_count(), 2);

        engine.finish("t1");
        assert!(engine.try_begin("t1"));
    }

    #[test]
    fn test_outcome_classification() {
        let transient = outcome_from_error(&eyre::eyre!("request timeout"));
        assert!(matches!(transient, RelayOutcome::Transient { .. }));

        let permanent = outcome_from_error(&eyre::eyre!("execution reverted"));
        assert!(matches!(permanent, RelayOutcome::Permanent { .. }));

        let unknown = outcome_from_error(&eyre::eyre!("gremlins"));
        assert!(matches!(unknown, RelayOutcome::Transient { .. }));
    }
}
