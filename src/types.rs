use alloy::primitives::keccak256;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one of the two bridged chains.
///
/// Chain A is the account-based network with Base58 addresses and ed25519
/// signatures; chain B is the EVM network with 20-byte addresses and
/// secp256k1 signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainId {
    A,
    B,
}

impl ChainId {
    /// The opposite side of the bridge.
    pub fn other(self) -> Self {
        match self {
            ChainId::A => ChainId::B,
            ChainId::B => ChainId::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::A => "A",
            ChainId::B => "B",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of the locked asset.
///
/// `Wrapped` means the token's canonical home is the other chain. The
/// discriminants are the wire bytes consumed by the chain-B verifier's
/// packed digest and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TokenKind {
    FungibleExternal = 0,
    FungibleWrapped = 1,
    NonFungibleExternal = 2,
    NonFungibleWrapped = 3,
    Native = 4,
}

impl TokenKind {
    pub fn wire_byte(self) -> u8 {
        self as u8
    }

    pub fn from_wire(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => TokenKind::FungibleExternal,
            1 => TokenKind::FungibleWrapped,
            2 => TokenKind::NonFungibleExternal,
            3 => TokenKind::NonFungibleWrapped,
            4 => TokenKind::Native,
            other => return Err(eyre!("Unknown token kind byte: {}", other)),
        })
    }

    pub fn is_non_fungible(self) -> bool {
        matches!(self, TokenKind::NonFungibleExternal | TokenKind::NonFungibleWrapped)
    }
}

/// Serialize amounts as decimal strings so arbitrary-width integers survive
/// JSON round-trips; accept either strings or plain numbers on input.
pub mod amount_string {
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        struct StringOrU128;

        impl de::Visitor<'_> for StringOrU128 {
            type Value = u128;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a decimal string or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<u128, E> {
                Ok(value as u128)
            }

            fn visit_u128<E: de::Error>(self, value: u128) -> Result<u128, E> {
                Ok(value)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<u128, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(StringOrU128)
    }
}

/// A lock event observed on a source chain, immutable once recorded.
///
/// `(source, transfer_id)` is the primary key across the whole system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Chain-native identifier: Base58 tx id on A, 0x-hex 32-byte lock id on B.
    pub transfer_id: String,
    pub source: ChainId,
    pub destination: ChainId,
    /// Source-side token reference: asset id on A, hex address on B.
    pub token: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub sender: String,
    /// Recipient in the destination chain's address format.
    pub recipient: String,
    pub kind: TokenKind,
    pub token_id: Option<u64>,
    pub src_block: u64,
    pub src_tx: String,
    /// Wall-clock ms at observation.
    pub observed_at: u64,
}

impl TransferEvent {
    /// Reject events that can never produce a valid attestation.
    pub fn validate(&self) -> Result<()> {
        if self.source == self.destination {
            return Err(eyre!(
                "Transfer {} has identical source and destination {}",
                self.transfer_id,
                self.source
            ));
        }
        if self.amount == 0 {
            return Err(eyre!("Transfer {} has zero amount", self.transfer_id));
        }
        if self.kind.is_non_fungible() {
            if self.amount != 1 {
                return Err(eyre!(
                    "Non-fungible transfer {} must carry amount 1, got {}",
                    self.transfer_id,
                    self.amount
                ));
            }
            if self.token_id.is_none() {
                return Err(eyre!(
                    "Non-fungible transfer {} is missing a token id",
                    self.transfer_id
                ));
            }
        }
        Ok(())
    }

    /// The 32-byte form of the transfer id used in the chain-B digest.
    ///
    /// B-native lock ids are already 32 bytes; A-side text ids are hashed.
    pub fn id_as_bytes32(&self) -> Result<[u8; 32]> {
        match self.source {
            ChainId::B => {
                let stripped = self.transfer_id.strip_prefix("0x").unwrap_or(&self.transfer_id);
                let bytes = hex::decode(stripped)
                    .map_err(|e| eyre!("Invalid B-side transfer id {}: {}", self.transfer_id, e))?;
                if bytes.len() != 32 {
                    return Err(eyre!(
                        "B-side transfer id must be 32 bytes, got {}",
                        bytes.len()
                    ));
                }
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                Ok(out)
            }
            ChainId::A => Ok(keccak256(self.transfer_id.as_bytes()).0),
        }
    }
}

/// A validator's signed statement that a lock event should be released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub transfer_id: String,
    pub source: ChainId,
    pub destination: ChainId,
    /// Signer identity in the destination chain's address space:
    /// 0x-hex address for B, Base58 ed25519 public key for A.
    pub validator_id: String,
    /// Destination-specific bytes: 65-byte `r||s||v` as 0x-hex for B,
    /// 64-byte ed25519 signature as Base58 for A.
    pub signature: String,
    /// Required for A-destination; absent for B where recovery yields the id.
    pub public_key: Option<String>,
    /// The digest actually signed, hex, kept for audit.
    pub message_digest: String,
    pub produced_at: u64,
}

/// Lifecycle of a transfer record. Transitions are strictly monotonic; a
/// `Failed` record is only revived by an operator resetting it to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Attesting,
    Relaying,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Attesting => "attesting",
            TransferStatus::Relaying => "relaying",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TransferStatus::Pending | TransferStatus::Attesting | TransferStatus::Relaying
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::Attesting => 1,
            TransferStatus::Relaying => 2,
            TransferStatus::Completed => 3,
            TransferStatus::Failed => 3,
        }
    }

    /// Whether moving to `next` respects the monotonic status graph.
    pub fn can_advance_to(&self, next: TransferStatus) -> bool {
        if *self == next {
            return false;
        }
        match (*self, next) {
            // Terminal states never move.
            (TransferStatus::Completed, _) | (TransferStatus::Failed, _) => false,
            // Failure is reachable from every open state.
            (s, TransferStatus::Failed) => s.is_open(),
            (s, n) => n.rank() > s.rank(),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable record tracking a transfer from observation to release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub event: TransferEvent,
    pub attestations: Vec<Attestation>,
    pub status: TransferStatus,
    pub relay_tx_id: Option<String>,
    pub relay_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TransferRecord {
    pub fn new(event: TransferEvent, now_ms: u64) -> Self {
        Self {
            event,
            attestations: Vec::new(),
            status: TransferStatus::Pending,
            relay_tx_id: None,
            relay_attempts: 0,
            last_error: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn has_attestation(&self, validator_id: &str) -> bool {
        self.attestations
            .iter()
            .any(|a| a.validator_id.eq_ignore_ascii_case(validator_id))
    }

    /// Count of distinct attesting validators.
    pub fn attestation_count(&self) -> usize {
        self.attestations.len()
    }
}

/// The active validator set on the destination chain, plus the release
/// threshold. Always fetched on-chain, never trusted from local config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub chain: ChainId,
    pub validators: Vec<String>,
    pub threshold: usize,
}

impl ValidatorSet {
    pub fn contains(&self, validator_id: &str) -> bool {
        self.validators
            .iter()
            .any(|v| v.eq_ignore_ascii_case(validator_id))
    }
}

/// Aggregate per-validator counters persisted alongside the records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub validator_id: String,
    pub attestations: u64,
    pub last_seen_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: TokenKind, amount: u128) -> TransferEvent {
        TransferEvent {
            transfer_id: "5FooBarBaz".to_string(),
            source: ChainId::A,
            destination: ChainId::B,
            token: "WAVES".to_string(),
            amount,
            sender: "3PAbc".to_string(),
            recipient: "0x4025a8ee89daead315de690f0c250cab5309a115".to_string(),
            kind,
            token_id: None,
            src_block: 100,
            src_tx: "5FooBarBaz".to_string(),
            observed_at: 1,
        }
    }

    #[test]
    fn test_zero_amount_rejected() {
        let e = event(TokenKind::FungibleExternal, 0);
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_nft_amount_must_be_one() {
        let mut e = event(TokenKind::NonFungibleExternal, 2);
        e.token_id = Some(7);
        assert!(e.validate().is_err());
        e.amount = 1;
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_same_source_destination_rejected() {
        let mut e = event(TokenKind::FungibleExternal, 1);
        e.destination = ChainId::A;
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_a_side_id_is_hashed() {
        let e = event(TokenKind::FungibleExternal, 1);
        let expected = keccak256(b"5FooBarBaz").0;
        assert_eq!(e.id_as_bytes32().unwrap(), expected);
    }

    #[test]
    fn test_b_side_id_is_parsed() {
        let mut e = event(TokenKind::FungibleExternal, 1);
        e.source = ChainId::B;
        e.destination = ChainId::A;
        e.transfer_id = format!("0x{}", hex::encode([0xabu8; 32]));
        assert_eq!(e.id_as_bytes32().unwrap(), [0xabu8; 32]);

        e.transfer_id = "0xdead".to_string();
        assert!(e.id_as_bytes32().is_err());
    }

    #[test]
    fn test_status_monotonic_graph() {
        use TransferStatus::*;
        assert!(Pending.can_advance_to(Attesting));
        assert!(Attesting.can_advance_to(Relaying));
        assert!(Relaying.can_advance_to(Completed));
        assert!(Relaying.can_advance_to(Failed));
        assert!(Pending.can_advance_to(Failed));

        assert!(!Relaying.can_advance_to(Attesting));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Relaying));
        assert!(!Completed.can_advance_to(Pending));
    }

    #[test]
    fn test_amount_survives_json_round_trip() {
        let mut e = event(TokenKind::FungibleExternal, u128::MAX);
        e.amount = 340_282_366_920_938_463_463_374_607_431_768_211_455;
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"340282366920938463463374607431768211455\""));
        let back: TransferEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, e.amount);
    }

    #[test]
    fn test_amount_accepts_plain_numbers() {
        let json = serde_json::json!({
            "transfer_id": "t", "source": "B", "destination": "A",
            "token": "0x01", "amount": 12345, "sender": "s", "recipient": "r",
            "kind": "FungibleExternal", "token_id": null,
            "src_block": 1, "src_tx": "t", "observed_at": 0
        });
        let e: TransferEvent = serde_json::from_value(json).unwrap();
        assert_eq!(e.amount, 12345);
    }

    #[test]
    fn test_token_kind_wire_bytes() {
        assert_eq!(TokenKind::FungibleExternal.wire_byte(), 0);
        assert_eq!(TokenKind::Native.wire_byte(), 4);
        assert_eq!(TokenKind::from_wire(2).unwrap(), TokenKind::NonFungibleExternal);
        assert!(TokenKind::from_wire(9).is_err());
    }

    #[test]
    fn test_record_dedups_by_validator_id() {
        let e = event(TokenKind::FungibleExternal, 10);
        let mut record = TransferRecord::new(e, 0);
        record.attestations.push(Attestation {
            transfer_id: "5FooBarBaz".to_string(),
            source: ChainId::A,
            destination: ChainId::B,
            validator_id: "0xAbCd000000000000000000000000000000000001".to_string(),
            signature: "0x00".to_string(),
            public_key: None,
            message_digest: "00".to_string(),
            produced_at: 0,
        });
        assert!(record.has_attestation("0xabcd000000000000000000000000000000000001"));
        assert!(!record.has_attestation("0x0000000000000000000000000000000000000002"));
    }
}
