use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;

/// Main configuration for the validator node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain_a: ChainAConfig,
    pub chain_b: ChainBConfig,
    pub keys: KeyConfig,
    pub overlay: OverlayConfig,
    pub status_http: StatusHttpConfig,
    pub data_dir: String,
    pub log_level: String,
}

/// Chain A (account-based, Base58/ed25519) connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainAConfig {
    pub node_url: String,
    /// One-character network tag baked into addresses and transactions.
    pub network_tag: char,
    pub bridge_address: String,
    #[serde(default = "default_chain_a_confirmations")]
    pub confirmations: u64,
    /// Operator override forcing the initial watermark.
    #[serde(default)]
    pub start_block: Option<u64>,
}

/// Chain B (EVM, secp256k1) connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainBConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub bridge_address: String,
    #[serde(default = "default_chain_b_confirmations")]
    pub confirmations: u64,
    #[serde(default)]
    pub start_block: Option<u64>,
}

/// Signing key material. The ed25519 seed is optional; without it the node
/// cannot attest or relay toward chain A.
#[derive(Clone, Deserialize)]
pub struct KeyConfig {
    pub secp256k1_key: String,
    #[serde(default)]
    pub ed25519_seed: Option<String>,
}

/// Custom Debug that redacts key material to prevent accidental log leakage.
impl fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyConfig")
            .field("secp256k1_key", &"<redacted>")
            .field(
                "ed25519_seed",
                &self.ed25519_seed.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Gossip overlay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_overlay_port")]
    pub listen_port: u16,
    /// `host:port` entries. Empty means standalone single-validator mode.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

/// Read-only status HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusHttpConfig {
    #[serde(default = "default_status_port")]
    pub port: u16,
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
}

fn default_chain_a_confirmations() -> u64 {
    10
}

fn default_chain_b_confirmations() -> u64 {
    32
}

fn default_overlay_port() -> u16 {
    9300
}

fn default_status_port() -> u16 {
    8380
}

fn default_status_enabled() -> bool {
    true
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Config {
    /// Load configuration from the environment, reading `.env` first if one
    /// exists next to the process.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific `.env` file path, then the environment.
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let chain_a = ChainAConfig {
            node_url: require("CHAIN_A_NODE_URL")?,
            network_tag: parse_network_tag(&require("CHAIN_A_NETWORK_TAG")?)?,
            bridge_address: require("CHAIN_A_BRIDGE_ADDRESS")?,
            confirmations: optional_parsed("CHAIN_A_CONFIRMATIONS")?
                .unwrap_or_else(default_chain_a_confirmations),
            start_block: optional_parsed("START_BLOCK_A")?,
        };

        let chain_b = ChainBConfig {
            rpc_url: require("CHAIN_B_RPC_URL")?,
            chain_id: require("CHAIN_B_CHAIN_ID")?
                .parse()
                .wrap_err("CHAIN_B_CHAIN_ID must be a valid u64")?,
            bridge_address: require("CHAIN_B_BRIDGE_ADDRESS")?,
            confirmations: optional_parsed("CHAIN_B_CONFIRMATIONS")?
                .unwrap_or_else(default_chain_b_confirmations),
            start_block: optional_parsed("START_BLOCK_B")?,
        };

        let keys = KeyConfig {
            secp256k1_key: require("VALIDATOR_SECP256K1_KEY")?,
            ed25519_seed: env::var("VALIDATOR_ED25519_SEED").ok().filter(|s| !s.is_empty()),
        };

        let overlay = OverlayConfig {
            listen_port: optional_parsed("OVERLAY_LISTEN_PORT")?.unwrap_or_else(default_overlay_port),
            bootstrap_peers: env::var("OVERLAY_BOOTSTRAP_PEERS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let status_http = StatusHttpConfig {
            port: optional_parsed("STATUS_HTTP_PORT")?.unwrap_or_else(default_status_port),
            enabled: optional_parsed("STATUS_HTTP_ENABLED")?.unwrap_or_else(default_status_enabled),
        };

        let config = Config {
            chain_a,
            chain_b,
            keys,
            overlay,
            status_http,
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| default_data_dir()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration before any task is launched.
    pub fn validate(&self) -> Result<()> {
        if self.chain_a.node_url.is_empty() {
            return Err(eyre!("chain_a.node_url cannot be empty"));
        }
        if self.chain_a.bridge_address.is_empty() {
            return Err(eyre!("chain_a.bridge_address cannot be empty"));
        }
        if bs58::decode(&self.chain_a.bridge_address).into_vec().is_err() {
            return Err(eyre!(
                "chain_a.bridge_address must be a Base58 address: {}",
                self.chain_a.bridge_address
            ));
        }

        if self.chain_b.rpc_url.is_empty() {
            return Err(eyre!("chain_b.rpc_url cannot be empty"));
        }
        if self.chain_b.chain_id == 0 {
            return Err(eyre!("chain_b.chain_id cannot be zero"));
        }
        if self.chain_b.bridge_address.len() != 42 || !self.chain_b.bridge_address.starts_with("0x")
        {
            return Err(eyre!(
                "chain_b.bridge_address must be a hex address (42 chars with 0x prefix)"
            ));
        }

        let key = &self.keys.secp256k1_key;
        let key_hex = key.strip_prefix("0x").unwrap_or(key);
        if key_hex.len() != 64 || hex::decode(key_hex).is_err() {
            return Err(eyre!("keys.secp256k1_key must be 32 bytes of hex"));
        }
        if let Some(seed) = &self.keys.ed25519_seed {
            let seed_hex = seed.strip_prefix("0x").unwrap_or(seed);
            if seed_hex.len() != 64 || hex::decode(seed_hex).is_err() {
                return Err(eyre!("keys.ed25519_seed must be 32 bytes of hex"));
            }
        }

        if self.data_dir.is_empty() {
            return Err(eyre!("data_dir cannot be empty"));
        }

        for peer in &self.overlay.bootstrap_peers {
            if !peer.contains(':') {
                return Err(eyre!("overlay bootstrap peer must be host:port, got {}", peer));
            }
        }

        Ok(())
    }

    /// Whether attesting and relaying toward chain A is possible.
    pub fn chain_a_signing_enabled(&self) -> bool {
        self.keys.ed25519_seed.is_some()
    }
}

fn require(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|_| eyre!("{} has an invalid value: {}", name, raw)),
        _ => Ok(None),
    }
}

fn parse_network_tag(raw: &str) -> Result<char> {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(eyre!(
            "CHAIN_A_NETWORK_TAG must be a single character, got {:?}",
            raw
        )),
    }
}
