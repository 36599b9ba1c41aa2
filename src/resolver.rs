//! Asset mapping between the two chains.
//!
//! A pure lookup surface: given the source-side token string of a transfer,
//! resolve the reference the destination verifier needs. A missing mapping is
//! not an error here; callers decide (the coordinator fails the record).

use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use eyre::{Result, WrapErr};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::chain_a_client::ChainAClient;
use crate::contracts::BridgeB;
use crate::types::{ChainId, TransferEvent};

/// Data-row namespace on the A-side bridge holding token registrations.
const TOKEN_MAP_PREFIX: &str = "token_map_";

const TOKEN_CACHE_MAX: usize = 10_000;
const TOKEN_CACHE_TTL_SECS: u64 = 3600;

/// Destination-side reference for a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 20-byte token address on chain B.
    B { token: Address },
    /// Asset id on chain A.
    A { asset_id: String },
}

/// Bounded token-mapping cache with TTL and capacity limits.
///
/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are purged before insertion and never
///   returned by `get`, so a stale registration is re-fetched after an hour.
struct BoundedTokenCache<V> {
    map: HashMap<String, (V, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<V> BoundedTokenCache<V> {
    fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.map
            .get(key)
            .filter(|(_, t)| t.elapsed() < self.ttl)
            .map(|(v, _)| v)
    }

    fn insert(&mut self, key: String, value: V) {
        let now = Instant::now();
        self.map
            .retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.is_empty() {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                self.map.remove(&k);
            } else {
                break;
            }
        }
        self.map.insert(key, (value, now));
    }

    /// Swap in a freshly scanned mapping set, still subject to the cap.
    fn replace_all(&mut self, entries: impl IntoIterator<Item = (String, V)>) {
        self.map.clear();
        for (key, value) in entries {
            self.insert(key, value);
        }
    }

    #[allow(dead_code)]
    fn len(&self) -> usize {
        self.map.len()
    }
}

pub struct AssetResolver {
    b_rpc_url: String,
    b_bridge: Address,
    a_client: ChainAClient,
    a_bridge_address: String,
    /// A-side asset id -> B-side token address.
    a_to_b: RwLock<BoundedTokenCache<Address>>,
    /// Lowercased B-side token address -> A-side asset id.
    b_to_a: RwLock<BoundedTokenCache<String>>,
}

impl AssetResolver {
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
            a_to_b: RwLock::new(BoundedTokenCache::new(TOKEN_CACHE_MAX, TOKEN_CACHE_TTL_SECS)),
            b_to_a: RwLock::new(BoundedTokenCache::new(TOKEN_CACHE_MAX, TOKEN_CACHE_TTL_SECS)),
        }
    }

    /// Resolve the destination reference for an event. `Ok(None)` means the
    /// token is not registered on the destination bridge.
    pub async fn resolve(&self, event: &TransferEvent) -> Result<Option<Resolution>> {
        match event.destination {
            ChainId::B => self.resolve_a_to_b(&event.token).await,
            ChainId::A => self.resolve_b_to_a(&event.token).await,
        }
    }

    /// A-side asset id -> B-side token address via the destination bridge's
    /// registry view. A zero address means "not registered".
    async fn resolve_a_to_b(&self, asset_id: &str) -> Result<Option<Resolution>> {
        if let Some(token) = self.a_to_b.read().await.get(asset_id).copied() {
            return Ok(Some(Resolution::B { token }));
        }

        let provider = ProviderBuilder::new()
            .on_http(self.b_rpc_url.parse().wrap_err("Invalid chain B RPC URL")?);
        let contract = BridgeB::new(self.b_bridge, &provider);
        let token = contract
            .wavesToUnit0Token(asset_id.to_string())
            .call()
            .await
            .wrap_err("wavesToUnit0Token query failed")?
            ._0;

        if token == Address::ZERO {
            warn!(asset_id = asset_id, "No chain B token registered for asset");
            return Ok(None);
        }

        debug!(asset_id = asset_id, token = %token, "Resolved A-side asset");
        self.a_to_b
            .write()
            .await
            .insert(asset_id.to_string(), token);
        Ok(Some(Resolution::B { token }))
    }

    /// B-side token address -> A-side asset id by scanning the A bridge's
    /// `token_map_*` rows. The full scan repopulates the cache, so misses pay
    /// for one re-scan and registered tokens are cheap afterwards.
    async fn resolve_b_to_a(&self, token: &str) -> Result<Option<Resolution>> {
        let needle = token.to_lowercase();
        if let Some(asset_id) = self.b_to_a.read().await.get(&needle).cloned() {
            return Ok(Some(Resolution::A { asset_id }));
        }

        let pattern = format!("{}.*", TOKEN_MAP_PREFIX);
        let rows = self
            .a_client
            .get_data_entries(&self.a_bridge_address, Some(&pattern))
            .await
            .wrap_err("token_map scan failed")?;

        let mut fresh = HashMap::new();
        for row in rows {
            let Some(asset_id) = row.key.strip_prefix(TOKEN_MAP_PREFIX) else {
                continue;
            };
            let Some(value) = row.as_string() else {
                continue;
            };
            let Some(address) = token_map_address(value) else {
                warn!(key = %row.key, "Malformed token_map row");
                continue;
            };
            fresh.insert(address.to_lowercase(), asset_id.to_string());
        }

        let found = fresh.get(&needle).cloned();
        self.b_to_a.write().await.replace_all(fresh);

        match found {
            Some(asset_id) => {
                debug!(token = token, asset_id = %asset_id, "Resolved B-side token");
                Ok(Some(Resolution::A { asset_id }))
            }
            None => {
                warn!(token = token, "No chain A asset registered for token");
                Ok(None)
            }
        }
    }
}

/// First field of a `token_map_*` row value: `<address>|decimals|name|symbol`.
/// Trailing fields beyond the address are ignored, so older row shapes with
/// extra columns still parse.
fn token_map_address(value: &str) -> Option<&str> {
    let address = value.split('|').next()?.trim();
    if address.len() == 42 && address.starts_with("0x") && Address::from_str(address).is_ok() {
        Some(address)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_map_address_parses_leading_field() {
        let value = "0x4025A8Ee89DAead315de690f0C250caB5309a115|8|Waves|WAVES";
        assert_eq!(
            token_map_address(value),
            Some("0x4025A8Ee89DAead315de690f0C250caB5309a115")
        );
    }

    #[test]
    fn test_token_map_address_tolerates_extra_columns() {
        // Alternate historical shape with an extra flag column.
        let value = "0x4025A8Ee89DAead315de690f0C250caB5309a115|true|8|Waves|WAVES";
        assert_eq!(
            token_map_address(value),
            Some("0x4025A8Ee89DAead315de690f0C250caB5309a115")
        );
    }

    #[test]
    fn test_token_map_address_rejects_garbage() {
        assert_eq!(token_map_address("not-an-address|8"), None);
        assert_eq!(token_map_address(""), None);
        assert_eq!(token_map_address("0x1234|8"), None);
    }

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = BoundedTokenCache::new(10, 3600);
        assert!(cache.get("WAVES").is_none());
        cache.insert("WAVES".to_string(), Address::ZERO);
        assert_eq!(cache.get("WAVES"), Some(&Address::ZERO));
    }

    #[test]
    fn test_cache_evicts_oldest_at_capacity() {
        let mut cache = BoundedTokenCache::new(2, 3600);
        cache.insert("a".to_string(), 1u8);
        cache.insert("b".to_string(), 2u8);
        cache.insert("c".to_string(), 3u8);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c"), Some(&3u8));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let mut cache = BoundedTokenCache::new(10, 0);
        cache.insert("a".to_string(), 1u8);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_cache_replace_all_respects_cap() {
        let mut cache = BoundedTokenCache::new(2, 3600);
        cache.insert("old".to_string(), 0u8);
        cache.replace_all((0..5u8).map(|i| (format!("k{}", i), i)));
        assert!(cache.get("old").is_none());
        assert_eq!(cache.len(), 2);
    }
}
