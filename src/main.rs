use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use volition_wallet::{
    ConsensusState, ConsensusStore, HttpProber, NetworkConfig, Networks, PeerProber,
    WalletConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "volition-wallet",
    version,
    about = "Track agreed chain height across Volition miners"
)]
struct Cli {
    /// Wallet config file (TOML); created with defaults if missing
    #[arg(long, default_value = "volition.toml")]
    config: PathBuf,

    /// Override the data directory from the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run trackers for every configured network and serve the status API
    Watch {
        /// Extra network to follow (combined with --url)
        #[arg(long)]
        network: Option<String>,

        /// Seed miner url for --network (repeatable)
        #[arg(long = "url")]
        urls: Vec<String>,

        /// Status API address
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Do not start the status API
        #[arg(long)]
        no_api: bool,
    },

    /// Print persisted consensus state
    Status {
        /// Only this network
        network: Option<String>,
    },

    /// Reset a network's persisted consensus state to zero
    Reset { network: String },

    /// Ask a miner for its identity
    Identify { url: String },

    /// Add a network (or more seed urls) to the config file
    AddNetwork {
        name: String,

        #[arg(required = true)]
        urls: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // init tracing from env VOLITION_LOG or RUST_LOG
    let filter = std::env::var("VOLITION_LOG")
        .unwrap_or_else(|_| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let mut config = WalletConfig::load_or_create(&cli.config).map_err(|e| anyhow!(e))?;
    config.consensus = config.consensus.with_env_overrides();
    config.consensus.validate()?;
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = dir;
    }

    match cli.cmd {
        Commands::Watch {
            network,
            urls,
            listen,
            no_api,
        } => {
            if let Some(name) = network {
                config.upsert_network(&name, urls);
            } else if !urls.is_empty() {
                return Err(anyhow!("--url requires --network"));
            }
            let listen = match listen {
                Some(addr) => addr,
                None => config
                    .listen
                    .parse()
                    .with_context(|| format!("invalid listen address {}", config.listen))?,
            };
            watch(config, listen, !no_api).await
        }
        Commands::Status { network } => status(&config, network.as_deref()),
        Commands::Reset { network } => reset(&config, &network),
        Commands::Identify { url } => identify(&config.consensus, &url).await,
        Commands::AddNetwork { name, urls } => {
            config.upsert_network(&name, urls);
            config.validate().map_err(|e| anyhow!(e))?;
            config.save(&cli.config).map_err(|e| anyhow!(e))?;
            println!("network {} saved to {}", name, cli.config.display());
            Ok(())
        }
    }
}

fn open_store(config: &WalletConfig) -> Result<ConsensusStore> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    Ok(ConsensusStore::open(config.data_dir.join("consensus.db"))?)
}

async fn watch(config: WalletConfig, listen: SocketAddr, serve_api: bool) -> Result<()> {
    let store = open_store(&config)?;
    let prober = HttpProber::new(config.consensus.probe_timeout())?;
    let networks = Arc::new(Networks::new(prober, config.consensus.clone(), Some(store)));

    for entry in &config.networks {
        networks.ensure_network(&entry.name, &entry.urls)?;
    }
    let restored = networks.restore_persisted()?;
    if restored > 0 {
        info!("Restored {} persisted network(s)", restored);
    }
    if networks.names().is_empty() {
        warn!("No networks configured; add one with `volition-wallet add-network <name> <url>`");
    }

    for name in networks.names() {
        if let Some(svc) = networks.get(&name) {
            let mut rx = svc.subscribe();
            tokio::spawn(async move {
                let mut last: Option<(u64, bool)> = None;
                while rx.changed().await.is_ok() {
                    let (height, is_current, network) = {
                        let snap = rx.borrow_and_update();
                        (snap.state.height, snap.state.is_current, snap.network.clone())
                    };
                    if last != Some((height, is_current)) {
                        info!(
                            network = %network,
                            height,
                            is_current,
                            "consensus view changed"
                        );
                        last = Some((height, is_current));
                    }
                }
            });
        }
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let api = if serve_api {
        let networks = Arc::clone(&networks);
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.await;
            };
            if let Err(e) = volition_wallet::api::serve(listen, networks, shutdown).await {
                warn!("status API stopped: {:#}", e);
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = stop_tx.send(());
    networks.shutdown_all().await;
    if let Some(api) = api {
        let _ = api.await;
    }
    Ok(())
}

fn status(config: &WalletConfig, only: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let names = match only {
        Some(name) => vec![name.to_string()],
        None => store.network_names()?,
    };
    for name in names {
        let state = store.load_state(&name)?;
        let urls = store.load_urls(&name)?;
        let body = serde_json::json!({
            "network": name,
            "state": state,
            "knownUrls": urls,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}

fn reset(config: &WalletConfig, network: &str) -> Result<()> {
    let store = open_store(config)?;
    let current = store
        .load_state(network)?
        .ok_or_else(|| anyhow!("no persisted state for network {}", network))?;
    let zero: ConsensusState = current.reset();
    store.save_state(network, &zero)?;
    store.flush()?;
    println!("network {} reset to height 0", network);
    Ok(())
}

async fn identify(consensus: &NetworkConfig, url: &str) -> Result<()> {
    let prober = HttpProber::new(consensus.probe_timeout())?;
    let miner_id = prober.identify(url).await?;
    println!("{}", miner_id);
    Ok(())
}
