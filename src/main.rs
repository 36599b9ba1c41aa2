use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use clap::{Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use tokio::sync::mpsc;
use tracing::{error, info};

use bridge_validator::api::{self, AppState};
use bridge_validator::chain_a_client::ChainAClient;
use bridge_validator::config::Config;
use bridge_validator::coordinator::{Coordinator, QuorumView};
use bridge_validator::db::Store;
use bridge_validator::gossip::GossipService;
use bridge_validator::metrics;
use bridge_validator::relay::{ChainARelay, EvmRelay, RelayEngine};
use bridge_validator::resolver::AssetResolver;
use bridge_validator::signing::SigningEngine;
use bridge_validator::watchers::{ChainAWatcher, ChainBWatcher, WatcherManager};

/// Bound on graceful shutdown before the watchdog gives up.
const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "bridge-validator", version)]
#[command(about = "Validator node for the Waves <-> Unit0 asset bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the validator daemon
    Start,
    /// Generate fresh validator key material and print it
    GenerateKey,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Print a running node's /status
    Status,
    /// Print a running node's /stats
    Stats,
}

fn main() {
    color_eyre::install().ok();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::GenerateKey => generate_key(),
        Command::CheckConfig => check_config(),
        Command::Status => query_node("status"),
        Command::Stats => query_node("stats"),
        Command::Start => start(),
    };
    std::process::exit(code);
}

fn generate_key() -> i32 {
    let secp = PrivateKeySigner::random();
    let seed = ed25519_dalek::SigningKey::generate(&mut rand_core::OsRng);

    println!("VALIDATOR_SECP256K1_KEY=0x{}", hex::encode(secp.to_bytes()));
    println!("# chain B address: {}", secp.address());
    println!("VALIDATOR_ED25519_SEED={}", hex::encode(seed.to_bytes()));
    println!(
        "# chain A public key: {}",
        bs58::encode(seed.verifying_key().to_bytes()).into_string()
    );
    0
}

fn check_config() -> i32 {
    match Config::load() {
        Ok(config) => {
            println!("Configuration OK");
            println!("  chain A node: {}", config.chain_a.node_url);
            println!("  chain B rpc:  {}", config.chain_b.rpc_url);
            println!("  data dir:     {}", config.data_dir);
            println!(
                "  chain A signing: {}",
                if config.chain_a_signing_enabled() { "enabled" } else { "disabled" }
            );
            0
        }
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            1
        }
    }
}

fn query_node(path: &str) -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Runtime error: {e}");
            return 2;
        }
    };

    let url = format!("http://127.0.0.1:{}/{}", config.status_http.port, path);
    match runtime.block_on(async {
        reqwest::get(&url)
            .await
            .wrap_err("Is the node running?")?
            .text()
            .await
            .wrap_err("Failed to read response")
    }) {
        Ok(body) => {
            println!("{}", body);
            0
        }
        Err(e) => {
            eprintln!("Failed to query {url}: {e:#}");
            2
        }
    }
}

fn start() -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            return 1;
        }
    };

    init_logging(&config.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return 2;
        }
    };

    match runtime.block_on(run_node(config)) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Validator node failed");
            2
        }
    }
}

async fn run_node(config: Config) -> Result<()> {
    info!("Starting bridge validator node");

    let store = Store::open(&config.data_dir).wrap_err("Failed to open store")?;

    let engine = Arc::new(SigningEngine::new(
        &config.keys.secp256k1_key,
        config.keys.ed25519_seed.as_deref(),
        config.chain_b.chain_id,
    )?);
    info!(
        validator_b = %engine.evm_validator_id(),
        validator_a = ?engine.a_validator_id(),
        "Validator identities"
    );
    if !config.chain_a_signing_enabled() {
        info!("No ed25519 seed configured, chain A destination is disabled");
    }
    // The lock event carries the net amount after the on-chain fee; this node
    // relays it verbatim and never reproduces the fee calculation.
    info!("Amounts are relayed verbatim; decimal rescaling is a token-registration concern");

    let a_client = ChainAClient::new(&config.chain_a.node_url, config.chain_a.network_tag)?;
    let b_bridge: Address = config
        .chain_b
        .bridge_address
        .parse()
        .wrap_err("Invalid chain B bridge address")?;

    let resolver = Arc::new(AssetResolver::new(
        &config.chain_b.rpc_url,
        b_bridge,
        a_client.clone(),
        &config.chain_a.bridge_address,
    ));

    let evm_signer: PrivateKeySigner = config
        .keys
        .secp256k1_key
        .parse()
        .wrap_err("Invalid secp256k1 validator key")?;
    let evm_relay = EvmRelay::new(&config.chain_b.rpc_url, b_bridge, evm_signer);

    let chain_a_relay = match &config.keys.ed25519_seed {
        Some(seed) => {
            let raw = hex::decode(seed.strip_prefix("0x").unwrap_or(seed))
                .wrap_err("Invalid ed25519 seed hex")?;
            let bytes: [u8; 32] = raw
                .try_into()
                .map_err(|_| eyre!("ed25519 seed must be 32 bytes"))?;
            Some(ChainARelay::new(
                a_client.clone(),
                &config.chain_a.bridge_address,
                ed25519_dalek::SigningKey::from_bytes(&bytes),
            ))
        }
        None => None,
    };
    let relay = Arc::new(RelayEngine::new(evm_relay, chain_a_relay));

    let (inbox_tx, inbox_rx) = mpsc::channel(1024);

    let (gossip, gossip_rx) = GossipService::new(
        config.overlay.listen_port,
        config.overlay.bootstrap_peers.clone(),
        engine.evm_validator_id(),
    );
    let gossip = Arc::new(gossip);
    gossip.start().await?;

    let quorum = QuorumView::new(
        &config.chain_b.rpc_url,
        b_bridge,
        a_client.clone(),
        &config.chain_a.bridge_address,
    );

    let mut coordinator = Coordinator::new(
        store.clone(),
        engine.clone(),
        resolver,
        relay,
        gossip.clone(),
        quorum,
        inbox_rx,
        inbox_tx.clone(),
        gossip_rx,
        config.overlay.listen_port,
    );

    let watchers = WatcherManager::new(
        ChainAWatcher::new(&config.chain_a, store.clone(), inbox_tx.clone())?,
        ChainBWatcher::new(&config.chain_b, store.clone(), inbox_tx.clone())?,
    );

    if config.status_http.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.status_http.port));
        let state = AppState {
            store: store.clone(),
            gossip: gossip.clone(),
            validator_b: engine.evm_validator_id(),
            validator_a: engine.a_validator_id(),
            start_time: Instant::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = api::start_status_server(addr, state).await {
                error!(error = %e, "Status HTTP server error");
            }
        });
    }

    metrics::UP.set(1.0);

    let (shutdown_tx_watchers, shutdown_rx_watchers) = mpsc::channel::<()>(1);
    let (shutdown_tx_coordinator, shutdown_rx_coordinator) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx_watchers.send(()).await;
        let _ = shutdown_tx_coordinator.send(()).await;
        // Watchdog: a hung task must not keep the process alive forever.
        tokio::spawn(async {
            tokio::time::sleep(SHUTDOWN_WATCHDOG).await;
            error!("Graceful shutdown exceeded the watchdog, exiting");
            std::process::exit(2);
        });
    });

    tokio::select! {
        result = watchers.run(shutdown_rx_watchers) => {
            if let Err(e) = result {
                error!(error = %e, "Watcher manager error");
                return Err(e);
            }
        }
        result = coordinator.run(shutdown_rx_coordinator) => {
            if let Err(e) = result {
                error!(error = %e, "Coordinator error");
                return Err(e);
            }
        }
    }

    // Flush whatever the surviving side did not; the store closes last.
    store.flush()?;
    metrics::UP.set(0.0);
    info!("Bridge validator node stopped");
    Ok(())
}

/// Initialize tracing with structured output.
fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sled=warn,hyper=warn", log_level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM).
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
