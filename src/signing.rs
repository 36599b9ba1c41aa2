//! Chain-specific attestation signing and verification.
//!
//! Two disciplines live here. Destination-B attestations are recoverable
//! secp256k1 signatures over a keccak256 packed digest wrapped in the
//! Ethereum personal-message banner. Destination-A attestations are ed25519
//! signatures over a sha256 digest of plain string concatenation. Both are
//! deterministic, so signing the same input twice yields identical bytes.
//!
//! The engine never touches persistence or the network.

use alloy::primitives::{keccak256, Address, Signature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use ed25519_dalek::{Signer as _, Verifier as _};
use eyre::{eyre, Result, WrapErr};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::resolver::Resolution;
use crate::types::{Attestation, ChainId, TransferEvent};

/// Ethereum personal-message prefix applied to the 32-byte packed digest.
const ETH_SIGNED_MESSAGE_BANNER: &[u8] = b"\x19Ethereum Signed Message:\n32";

pub struct SigningEngine {
    evm_signer: PrivateKeySigner,
    evm_address: Address,
    a_key: Option<ed25519_dalek::SigningKey>,
    chain_b_id: u64,
}

impl SigningEngine {
    /// Build the engine from hex key material. A missing ed25519 seed
    /// disables the A-destination path cleanly rather than failing later.
    pub fn new(secp256k1_key: &str, ed25519_seed: Option<&str>, chain_b_id: u64) -> Result<Self> {
        let evm_signer: PrivateKeySigner = secp256k1_key
            .parse()
            .wrap_err("Invalid secp256k1 validator key")?;
        let evm_address = evm_signer.address();

        let a_key = match ed25519_seed {
            Some(seed) => {
                let raw = hex::decode(seed.strip_prefix("0x").unwrap_or(seed))
                    .wrap_err("Invalid ed25519 seed hex")?;
                let bytes: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| eyre!("ed25519 seed must be 32 bytes"))?;
                Some(ed25519_dalek::SigningKey::from_bytes(&bytes))
            }
            None => None,
        };

        Ok(Self {
            evm_signer,
            evm_address,
            a_key,
            chain_b_id,
        })
    }

    /// Our identity in chain B's address space.
    pub fn evm_validator_id(&self) -> String {
        format!("0x{}", hex::encode(self.evm_address.as_slice()))
    }

    /// Our identity in chain A's address space (Base58 ed25519 public key),
    /// if the seed is configured.
    pub fn a_validator_id(&self) -> Option<String> {
        self.a_key
            .as_ref()
            .map(|k| bs58::encode(k.verifying_key().to_bytes()).into_string())
    }

    /// Our identity for a given destination chain.
    pub fn validator_id_for(&self, destination: ChainId) -> Result<String> {
        match destination {
            ChainId::B => Ok(self.evm_validator_id()),
            ChainId::A => self
                .a_validator_id()
                .ok_or_else(|| eyre!("Chain A signing is disabled (no ed25519 seed)")),
        }
    }

    pub fn can_sign_for(&self, destination: ChainId) -> bool {
        match destination {
            ChainId::B => true,
            ChainId::A => self.a_key.is_some(),
        }
    }

    /// Produce our attestation for a finalized lock event.
    pub fn sign(&self, event: &TransferEvent, resolution: &Resolution) -> Result<Attestation> {
        event.validate()?;
        match event.destination {
            ChainId::B => self.sign_for_b(event, resolution),
            ChainId::A => self.sign_for_a(event, resolution),
        }
    }

    fn sign_for_b(&self, event: &TransferEvent, resolution: &Resolution) -> Result<Attestation> {
        let token_ref = match resolution {
            Resolution::B { token } => *token,
            Resolution::A { .. } => {
                return Err(eyre!("B-destination transfer resolved to an A-side asset"))
            }
        };
        let recipient = Address::from_str(&event.recipient)
            .wrap_err_with(|| format!("Invalid B-side recipient {}", event.recipient))?;

        let digest = self.b_digest(event, token_ref, recipient)?;
        let signature = self.evm_signer.sign_hash_sync(&digest)?;
        let bytes: [u8; 65] = signature.as_bytes();

        Ok(Attestation {
            transfer_id: event.transfer_id.clone(),
            source: event.source,
            destination: event.destination,
            validator_id: self.evm_validator_id(),
            signature: format!("0x{}", hex::encode(bytes)),
            public_key: None,
            message_digest: hex::encode(digest.as_slice()),
            produced_at: now_ms(),
        })
    }

    /// Packed digest for the B-side verifier:
    /// `keccak256(banner || keccak256(id32 || token || amount || recipient || kind || tokenId || chainId))`
    /// with all integers as 32-byte big-endian and no length prefixes.
    fn b_digest(&self, event: &TransferEvent, token_ref: Address, recipient: Address) -> Result<B256> {
        let id32 = event.id_as_bytes32()?;
        let token_id = event.token_id.unwrap_or(0);

        let mut packed = Vec::with_capacity(32 + 20 + 32 + 20 + 1 + 32 + 32);
        packed.extend_from_slice(&id32);
        packed.extend_from_slice(token_ref.as_slice());
        packed.extend_from_slice(&U256::from(event.amount).to_be_bytes::<32>());
        packed.extend_from_slice(recipient.as_slice());
        packed.push(event.kind.wire_byte());
        packed.extend_from_slice(&U256::from(token_id).to_be_bytes::<32>());
        packed.extend_from_slice(&U256::from(self.chain_b_id).to_be_bytes::<32>());
        let outer = keccak256(&packed);

        let mut banner = Vec::with_capacity(ETH_SIGNED_MESSAGE_BANNER.len() + 32);
        banner.extend_from_slice(ETH_SIGNED_MESSAGE_BANNER);
        banner.extend_from_slice(outer.as_slice());
        Ok(keccak256(&banner))
    }

    fn sign_for_a(&self, event: &TransferEvent, resolution: &Resolution) -> Result<Attestation> {
        let asset_ref = match resolution {
            Resolution::A { asset_id } => asset_id.clone(),
            Resolution::B { .. } => {
                return Err(eyre!("A-destination transfer resolved to a B-side token"))
            }
        };
        let key = self
            .a_key
            .as_ref()
            .ok_or_else(|| eyre!("Chain A signing is disabled (no ed25519 seed)"))?;

        let digest = a_digest(&event.transfer_id, &event.recipient, &asset_ref, event.amount, self.chain_b_id);
        let signature = key.sign(&digest);

        Ok(Attestation {
            transfer_id: event.transfer_id.clone(),
            source: event.source,
            destination: event.destination,
            validator_id: bs58::encode(key.verifying_key().to_bytes()).into_string(),
            signature: bs58::encode(signature.to_bytes()).into_string(),
            public_key: Some(bs58::encode(key.verifying_key().to_bytes()).into_string()),
            message_digest: hex::encode(digest),
            produced_at: now_ms(),
        })
    }

    /// Verify a peer attestation against the identity it claims.
    pub fn verify(&self, attestation: &Attestation, expected_id: &str) -> bool {
        match attestation.destination {
            ChainId::B => self.verify_b(attestation, expected_id),
            ChainId::A => verify_a(attestation, expected_id),
        }
    }

    fn verify_b(&self, attestation: &Attestation, expected_id: &str) -> bool {
        let Some(signer) = recover_b_signer(attestation) else {
            return false;
        };
        let expected = match Address::from_str(expected_id) {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        signer == expected
    }
}

/// sha256 of the plain concatenation consumed by the chain-A verifier:
/// `transfer_id || recipient || asset_id || decimal(amount) || decimal(b_chain_id)`.
pub fn a_digest(
    transfer_id: &str,
    recipient: &str,
    asset_ref: &str,
    amount: u128,
    b_chain_id: u64,
) -> [u8; 32] {
    let message = format!("{}{}{}{}{}", transfer_id, recipient, asset_ref, amount, b_chain_id);
    Sha256::digest(message.as_bytes()).into()
}

/// Recover the signer address of a B-destination attestation from its stored
/// digest and 65-byte signature. Used both for verification and for the
/// relay engine's signer ordering.
pub fn recover_b_signer(attestation: &Attestation) -> Option<Address> {
    let sig_hex = attestation.signature.strip_prefix("0x")?;
    let sig_bytes = hex::decode(sig_hex).ok()?;
    let signature = Signature::try_from(sig_bytes.as_slice()).ok()?;

    let digest_bytes = hex::decode(&attestation.message_digest).ok()?;
    let digest = B256::try_from(digest_bytes.as_slice()).ok()?;

    signature.recover_address_from_prehash(&digest).ok()
}

fn verify_a(attestation: &Attestation, expected_id: &str) -> bool {
    let Some(pubkey_b58) = attestation.public_key.as_deref() else {
        return false;
    };
    if pubkey_b58 != expected_id || attestation.validator_id != expected_id {
        return false;
    }

    let Ok(pubkey_raw) = bs58::decode(pubkey_b58).into_vec() else {
        return false;
    };
    let Ok(pubkey_bytes) = <[u8; 32]>::try_from(pubkey_raw.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&pubkey_bytes) else {
        return false;
    };

    let Ok(sig_raw) = bs58::decode(&attestation.signature).into_vec() else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_raw.as_slice()) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    let Ok(digest) = hex::decode(&attestation.message_digest) else {
        return false;
    };

    verifying_key.verify(&digest, &signature).is_ok()
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenKind;

    const SECP_KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
    const ED_SEED: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    fn engine() -> SigningEngine {
        SigningEngine::new(SECP_KEY, Some(ED_SEED), 88811).unwrap()
    }

    fn a_to_b_event() -> TransferEvent {
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

    fn b_to_a_event() -> TransferEvent {
        TransferEvent {
            transfer_id: format!("0x{}", hex::encode([0x11u8; 32])),
            source: ChainId::B,
            destination: ChainId::A,
            token: "0x4025a8ee89daead315de690f0c250cab5309a115".to_string(),
            amount: 5_000_000,
            sender: "0x0000000000000000000000000000000000000009".to_string(),
            recipient: "3PRecipientAddr".to_string(),
            kind: TokenKind::FungibleWrapped,
            token_id: None,
            src_block: 20,
            src_tx: "0xaa".to_string(),
            observed_at: 1,
        }
    }

    fn b_resolution() -> Resolution {
        Resolution::B {
            token: Address::from_str("0x4025A8Ee89DAead315de690f0C250caB5309a115").unwrap(),
        }
    }

    #[test]
    fn test_b_digest_matches_manual_packing() {
        let engine = engine();
        let event = a_to_b_event();
        let token = Address::from_str("0x4025A8Ee89DAead315de690f0C250caB5309a115").unwrap();
        let recipient = Address::from_str(&event.recipient).unwrap();

        let mut packed = Vec::new();
        packed.extend_from_slice(keccak256(b"5FooBarBaz").as_slice());
        packed.extend_from_slice(token.as_slice());
        packed.extend_from_slice(&U256::from(100_000_000u64).to_be_bytes::<32>());
        packed.extend_from_slice(recipient.as_slice());
        packed.push(0x00);
        packed.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
        packed.extend_from_slice(&U256::from(88811u64).to_be_bytes::<32>());
        let outer = keccak256(&packed);

        let mut banner = b"\x19Ethereum Signed Message:\n32".to_vec();
        banner.extend_from_slice(outer.as_slice());
        let expected = keccak256(&banner);

        let digest = engine.b_digest(&event, token, recipient).unwrap();
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_b_signing_is_deterministic_and_recoverable() {
        let engine = engine();
        let event = a_to_b_event();

        let first = engine.sign(&event, &b_resolution()).unwrap();
        let second = engine.sign(&event, &b_resolution()).unwrap();
        assert_eq!(first.signature, second.signature);
        assert_eq!(first.message_digest, second.message_digest);

        let sig_bytes = hex::decode(first.signature.strip_prefix("0x").unwrap()).unwrap();
        assert_eq!(sig_bytes.len(), 65);

        assert!(engine.verify(&first, &engine.evm_validator_id()));
        assert!(!engine.verify(&first, "0x00000000000000000000000000000000000000ff"));
    }

    #[test]
    fn test_a_signing_round_trip() {
        let engine = engine();
        let event = b_to_a_event();
        let resolution = Resolution::A {
            asset_id: "WAVES".to_string(),
        };

        let attestation = engine.sign(&event, &resolution).unwrap();
        assert!(attestation.public_key.is_some());

        let sig_bytes = bs58::decode(&attestation.signature).into_vec().unwrap();
        assert_eq!(sig_bytes.len(), 64);

        let id = engine.a_validator_id().unwrap();
        assert!(engine.verify(&attestation, &id));

        // Deterministic ed25519: identical input, identical bytes.
        let again = engine.sign(&event, &resolution).unwrap();
        assert_eq!(again.signature, attestation.signature);

        // A tampered digest must not verify.
        let mut tampered = attestation.clone();
        tampered.message_digest = hex::encode([0u8; 32]);
        assert!(!engine.verify(&tampered, &id));
    }

    #[test]
    fn test_a_digest_is_plain_concatenation() {
        let digest = a_digest("tid", "3PRec", "WAVES", 42, 88811);
        let expected: [u8; 32] = Sha256::digest(b"tid3PRecWAVES4288811").into();
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_missing_seed_disables_a_destination() {
        let engine = SigningEngine::new(SECP_KEY, None, 88811).unwrap();
        assert!(!engine.can_sign_for(ChainId::A));
        assert!(engine.can_sign_for(ChainId::B));

        let err = engine
            .sign(&b_to_a_event(), &Resolution::A { asset_id: "WAVES".into() })
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_zero_amount_and_bad_nft_rejected() {
        let engine = engine();
        let mut event = a_to_b_event();
        event.amount = 0;
        assert!(engine.sign(&event, &b_resolution()).is_err());

        let mut nft = a_to_b_event();
        nft.kind = TokenKind::NonFungibleExternal;
        nft.amount = 3;
        nft.token_id = Some(1);
        assert!(engine.sign(&nft, &b_resolution()).is_err());
    }

    #[test]
    fn test_mismatched_resolution_rejected() {
        let engine = engine();
        let event = a_to_b_event();
        let wrong = Resolution::A {
            asset_id: "WAVES".to_string(),
        };
        assert!(engine.sign(&event, &wrong).is_err());
    }
}
