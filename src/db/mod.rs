//! Persistence for transfers, attestations, and watermarks.
//!
//! A single ordered key/value store under `data_dir`, with keys laid out so
//! prefix iteration is cheap:
//!
//! - `transfer:<transfer_id>` -> serialized [`TransferRecord`]
//! - `attest:<transfer_id>:<validator_id>` -> serialized [`Attestation`]
//! - `watermark:A` / `watermark:B` -> big-endian u64
//! - `validator:<validator_id>` -> aggregate counters
//!
//! Every handler writes here before acknowledging externally; on restart the
//! coordinator re-derives all pending work from this store alone. Any sled
//! I/O failure is treated as fatal by callers.

use eyre::{eyre, Result, WrapErr};
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;
use std::path::Path;

use crate::types::{
    Attestation, ChainId, TransferRecord, TransferStatus, ValidatorStats,
};

const TRANSFER_PREFIX: &str = "transfer:";
const ATTEST_PREFIX: &str = "attest:";
const WATERMARK_PREFIX: &str = "watermark:";
const VALIDATOR_PREFIX: &str = "validator:";

/// Counts per transfer status, served by `/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pending: u64,
    pub attesting: u64,
    pub relaying: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Embedded store handle. Cheap to clone; all clones share one sled instance.
#[derive(Debug, Clone)]
pub struct Store {
    db: sled::Db,
    tree: sled::Tree,
}

impl Store {
    /// Open or create the store under the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).wrap_err("Failed to open data directory store")?;
        let tree = db.open_tree("bridge").wrap_err("Failed to open bridge tree")?;
        Ok(Self { db, tree })
    }

    fn transfer_key(transfer_id: &str) -> String {
        format!("{}{}", TRANSFER_PREFIX, transfer_id)
    }

    fn attest_key(transfer_id: &str, validator_id: &str) -> String {
        format!("{}{}:{}", ATTEST_PREFIX, transfer_id, validator_id.to_lowercase())
    }

    fn watermark_key(chain: ChainId) -> String {
        format!("{}{}", WATERMARK_PREFIX, chain.as_str())
    }

    fn validator_key(validator_id: &str) -> String {
        format!("{}{}", VALIDATOR_PREFIX, validator_id.to_lowercase())
    }

    /// Insert a new transfer record unless one already exists for the id.
    /// Returns whether the record was inserted.
    pub fn put_transfer_if_absent(&self, record: &TransferRecord) -> Result<bool> {
        let key = Self::transfer_key(&record.event.transfer_id);
        let value = serde_json::to_vec(record).wrap_err("Failed to serialize transfer record")?;
        let previous = self
            .tree
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(value))
            .wrap_err("Failed to insert transfer record")?;
        Ok(previous.is_ok())
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Result<Option<TransferRecord>> {
        let key = Self::transfer_key(transfer_id);
        match self.tree.get(key.as_bytes()).wrap_err("Failed to read transfer record")? {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).wrap_err("Corrupt transfer record")?,
            )),
            None => Ok(None),
        }
    }

    /// Overwrite an existing record. The coordinator is the only caller.
    pub fn update_transfer(&self, record: &TransferRecord) -> Result<()> {
        let key = Self::transfer_key(&record.event.transfer_id);
        if self.tree.get(key.as_bytes())?.is_none() {
            return Err(eyre!(
                "Cannot update unknown transfer {}",
                record.event.transfer_id
            ));
        }
        let value = serde_json::to_vec(record).wrap_err("Failed to serialize transfer record")?;
        self.tree
            .insert(key.as_bytes(), value)
            .wrap_err("Failed to update transfer record")?;
        Ok(())
    }

    /// Append an attestation, idempotent on `(transfer_id, validator_id)`.
    ///
    /// The attestation row and the record's embedded list are written in one
    /// transaction so a crash between them cannot split the two views.
    /// Returns whether the attestation was new.
    pub fn append_attestation(&self, attestation: &Attestation) -> Result<bool> {
        let record_key = Self::transfer_key(&attestation.transfer_id);
        let attest_key = Self::attest_key(&attestation.transfer_id, &attestation.validator_id);
        let validator_key = Self::validator_key(&attestation.validator_id);

        let outcome = self.tree.transaction(|tx| {
            let raw = tx.get(record_key.as_bytes())?.ok_or_else(|| {
                ConflictableTransactionError::Abort(format!(
                    "unknown transfer {}",
                    attestation.transfer_id
                ))
            })?;
            let mut record: TransferRecord = serde_json::from_slice(&raw)
                .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;

            if tx.get(attest_key.as_bytes())?.is_some()
                || record.has_attestation(&attestation.validator_id)
            {
                return Ok(false);
            }

            record.attestations.push(attestation.clone());
            record.updated_at = record.updated_at.max(attestation.produced_at);

            let record_value = serde_json::to_vec(&record)
                .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
            let attest_value = serde_json::to_vec(attestation)
                .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;

            let mut stats: ValidatorStats = match tx.get(validator_key.as_bytes())? {
                Some(raw) => serde_json::from_slice(&raw)
                    .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?,
                None => ValidatorStats {
                    validator_id: attestation.validator_id.clone(),
                    ..Default::default()
                },
            };
            stats.attestations += 1;
            stats.last_seen_ms = stats.last_seen_ms.max(attestation.produced_at);
            let stats_value = serde_json::to_vec(&stats)
                .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;

            tx.insert(record_key.as_bytes(), record_value)?;
            tx.insert(attest_key.as_bytes(), attest_value)?;
            tx.insert(validator_key.as_bytes(), stats_value)?;
            Ok(true)
        });

        match outcome {
            Ok(inserted) => Ok(inserted),
            Err(sled::transaction::TransactionError::Abort(reason)) => {
                Err(eyre!("Attestation append aborted: {}", reason))
            }
            Err(sled::transaction::TransactionError::Storage(e)) => {
                Err(e).wrap_err("Failed to append attestation")
            }
        }
    }

    pub fn list_attestations(&self, transfer_id: &str) -> Result<Vec<Attestation>> {
        let prefix = format!("{}{}:", ATTEST_PREFIX, transfer_id);
        let mut attestations = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item.wrap_err("Failed to iterate attestations")?;
            attestations
                .push(serde_json::from_slice(&value).wrap_err("Corrupt attestation row")?);
        }
        Ok(attestations)
    }

    /// Advance a chain watermark. Rejects non-increasing heights.
    pub fn advance_watermark(&self, chain: ChainId, height: u64) -> Result<()> {
        let key = Self::watermark_key(chain);
        if let Some(current) = self.get_watermark(chain)? {
            if height <= current {
                return Err(eyre!(
                    "Watermark for chain {} must increase: {} -> {}",
                    chain,
                    current,
                    height
                ));
            }
        }
        self.tree
            .insert(key.as_bytes(), &height.to_be_bytes())
            .wrap_err("Failed to persist watermark")?;
        Ok(())
    }

    pub fn get_watermark(&self, chain: ChainId) -> Result<Option<u64>> {
        let key = Self::watermark_key(chain);
        match self.tree.get(key.as_bytes()).wrap_err("Failed to read watermark")? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_ref()
                    .try_into()
                    .map_err(|_| eyre!("Corrupt watermark for chain {}", chain))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// All records still in flight (`Pending | Attesting | Relaying`).
    pub fn list_open_transfers(&self) -> Result<Vec<TransferRecord>> {
        let mut open = Vec::new();
        for item in self.tree.scan_prefix(TRANSFER_PREFIX.as_bytes()) {
            let (_, value) = item.wrap_err("Failed to iterate transfers")?;
            let record: TransferRecord =
                serde_json::from_slice(&value).wrap_err("Corrupt transfer record")?;
            if record.status.is_open() {
                open.push(record);
            }
        }
        Ok(open)
    }

    pub fn get_stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for item in self.tree.scan_prefix(TRANSFER_PREFIX.as_bytes()) {
            let (_, value) = item.wrap_err("Failed to iterate transfers")?;
            let record: TransferRecord =
                serde_json::from_slice(&value).wrap_err("Corrupt transfer record")?;
            stats.total += 1;
            match record.status {
                TransferStatus::Pending => stats.pending += 1,
                TransferStatus::Attesting => stats.attesting += 1,
                TransferStatus::Relaying => stats.relaying += 1,
                TransferStatus::Completed => stats.completed += 1,
                TransferStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    pub fn list_validator_stats(&self) -> Result<Vec<ValidatorStats>> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(VALIDATOR_PREFIX.as_bytes()) {
            let (_, value) = item.wrap_err("Failed to iterate validator stats")?;
            out.push(serde_json::from_slice(&value).wrap_err("Corrupt validator stats row")?);
        }
        Ok(out)
    }

    /// Flush buffered writes to disk. Called on shutdown, store closed last.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().wrap_err("Failed to flush store")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TokenKind, TransferEvent};
    use tempfile::tempdir;

    fn event(id: &str) -> TransferEvent {
        TransferEvent {
            transfer_id: id.to_string(),
            source: ChainId::A,
            destination: ChainId::B,
            token: "WAVES".to_string(),
            amount: 100_000_000,
            sender: "3PSender".to_string(),
            recipient: "0x0000000000000000000000000000000000000001".to_string(),
            kind: TokenKind::FungibleExternal,
            token_id: None,
            src_block: 5,
            src_tx: id.to_string(),
            observed_at: 1,
        }
    }

    fn attestation(transfer_id: &str, validator_id: &str) -> Attestation {
        Attestation {
            transfer_id: transfer_id.to_string(),
            source: ChainId::A,
            destination: ChainId::B,
            validator_id: validator_id.to_string(),
            signature: "0x01".to_string(),
            public_key: None,
            message_digest: "ab".to_string(),
            produced_at: 42,
        }
    }

    #[test]
    fn test_put_transfer_if_absent_does_not_overwrite() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let record = TransferRecord::new(event("tx1"), 1);
        assert!(store.put_transfer_if_absent(&record).unwrap());

        let mut replay = record.clone();
        replay.status = TransferStatus::Failed;
        assert!(!store.put_transfer_if_absent(&replay).unwrap());

        let stored = store.get_transfer("tx1").unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Pending);
    }

    #[test]
    fn test_append_attestation_idempotent() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .put_transfer_if_absent(&TransferRecord::new(event("tx1"), 1))
            .unwrap();

        let a = attestation("tx1", "0xAA00000000000000000000000000000000000001");
        assert!(store.append_attestation(&a).unwrap());
        assert!(!store.append_attestation(&a).unwrap());

        // Case-insensitive identity: the same signer must not count twice.
        let mut same_signer = a.clone();
        same_signer.validator_id = a.validator_id.to_lowercase();
        assert!(!store.append_attestation(&same_signer).unwrap());

        let record = store.get_transfer("tx1").unwrap().unwrap();
        assert_eq!(record.attestation_count(), 1);
        assert_eq!(store.list_attestations("tx1").unwrap().len(), 1);
    }

    #[test]
    fn test_append_attestation_requires_record() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let a = attestation("ghost", "0xAA00000000000000000000000000000000000001");
        assert!(store.append_attestation(&a).is_err());
    }

    #[test]
    fn test_watermark_monotonic() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert_eq!(store.get_watermark(ChainId::A).unwrap(), None);
        store.advance_watermark(ChainId::A, 100).unwrap();
        store.advance_watermark(ChainId::A, 101).unwrap();
        assert!(store.advance_watermark(ChainId::A, 101).is_err());
        assert!(store.advance_watermark(ChainId::A, 50).is_err());
        assert_eq!(store.get_watermark(ChainId::A).unwrap(), Some(101));

        // Chains advance independently.
        store.advance_watermark(ChainId::B, 7).unwrap();
        assert_eq!(store.get_watermark(ChainId::B).unwrap(), Some(7));
    }

    #[test]
    fn test_watermark_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.advance_watermark(ChainId::B, 88).unwrap();
            store.flush().unwrap();
        }
        {
            let store = Store::open(dir.path()).unwrap();
            assert_eq!(store.get_watermark(ChainId::B).unwrap(), Some(88));
        }
    }

    #[test]
    fn test_list_open_transfers_filters_terminal() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .put_transfer_if_absent(&TransferRecord::new(event("open1"), 1))
            .unwrap();

        let mut done = TransferRecord::new(event("done1"), 1);
        done.status = TransferStatus::Completed;
        store.put_transfer_if_absent(&done).unwrap();

        let mut failed = TransferRecord::new(event("failed1"), 1);
        failed.status = TransferStatus::Failed;
        store.put_transfer_if_absent(&failed).unwrap();

        let open = store.list_open_transfers().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].event.transfer_id, "open1");
    }

    #[test]
    fn test_stats_counts_per_status() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .put_transfer_if_absent(&TransferRecord::new(event("p1"), 1))
            .unwrap();
        let mut attesting = TransferRecord::new(event("a1"), 1);
        attesting.status = TransferStatus::Attesting;
        store.put_transfer_if_absent(&attesting).unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.attesting, 1);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn test_validator_counters_accumulate() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .put_transfer_if_absent(&TransferRecord::new(event("tx1"), 1))
            .unwrap();
        store
            .put_transfer_if_absent(&TransferRecord::new(event("tx2"), 1))
            .unwrap();

        let v = "0xAA00000000000000000000000000000000000001";
        store.append_attestation(&attestation("tx1", v)).unwrap();
        store.append_attestation(&attestation("tx2", v)).unwrap();

        let stats = store.list_validator_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].attestations, 2);
    }
}
