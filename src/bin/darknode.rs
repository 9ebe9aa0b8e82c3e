use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ark_std::rand::{rngs::StdRng, Rng, SeedableRng};
use clap::Parser;
use darknode::atom::{AtomContract, Ledger, MemoryAtomContract, SwapSecret, SwapTerms};
use darknode::cancel::done_channel;
use darknode::config::DarknodeConfig;
use darknode::epoch::Epoch;
use darknode::identity::{Address, NodeId};
use darknode::node::Darknode;
use darknode::order::{Order, Parity};
use darknode::p2p::LocalNetwork;
use darknode::pool::DarkOcean;
use darknode::registry::{unix_now, ClockRegistry};
use darknode::smpc::{Delta, ShamirComputers};
use darknode::switcher::{EpochSwitcher, SwitcherHandle};
use darknode::watcher::EpochWatcher;
use darknode::DarknodeError;
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Lifetime of a simulated swap
const SWAP_EXPIRY_SECS: u64 = 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(
    about = "In-process simulation of a network of darknodes",
    author,
    version
)]
struct Cli {
    /// JSON configuration file
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of registered darknodes
    #[arg(long = "nodes")]
    nodes: Option<usize>,

    /// Target number of darknodes per pool
    #[arg(long = "pool-size")]
    pool_size: Option<usize>,

    /// Minimum epoch interval in seconds
    #[arg(long = "epoch-interval")]
    epoch_interval: Option<u64>,

    /// Per-peer send timeout in seconds
    #[arg(long = "send-timeout")]
    send_timeout: Option<u64>,

    /// Crossing order pairs submitted to each pool per epoch
    #[arg(long = "orders-per-epoch")]
    orders_per_epoch: Option<usize>,

    /// Stop after this many epochs (runs until interrupted if absent)
    #[arg(long = "epochs")]
    epochs: Option<u64>,
}

impl Cli {
    fn load_config(&self) -> Result<DarknodeConfig, DarknodeError> {
        let mut config = match &self.config {
            Some(path) => DarknodeConfig::load(path)?,
            None => DarknodeConfig::default(),
        };
        if let Some(nodes) = self.nodes {
            config.nodes = nodes;
        }
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(interval) = self.epoch_interval {
            config.epoch_interval_secs = interval;
        }
        if let Some(timeout) = self.send_timeout {
            config.send_timeout_secs = timeout;
        }
        if let Some(orders) = self.orders_per_epoch {
            config.orders_per_epoch = orders;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, cli.epochs).await {
        error!("Darknode simulation failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: DarknodeConfig, max_epochs: Option<u64>) -> Result<(), DarknodeError> {
    let genesis = config.genesis.unwrap_or_else(unix_now);
    let registry = Arc::new(ClockRegistry::new(genesis, config.epoch_interval())?);
    let network = LocalNetwork::new(config.channel_capacity);
    let nodes = Arc::new(config.node_ids());
    let addresses: HashMap<Address, NodeId> = nodes.iter().map(|id| (id.address(), *id)).collect();

    let (canceller, done) = done_channel();
    let (routes_tx, routes_rx) = mpsc::channel(config.channel_capacity);
    let switcher = EpochSwitcher::spawn(done.clone(), routes_rx);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<DarknodeError>(nodes.len());

    for id in nodes.iter() {
        let node = Darknode::new(
            *id,
            nodes.clone(),
            config.pool_size,
            registry.clone(),
            Arc::new(network.router(id.address())),
            ShamirComputers::new(config.channel_capacity),
            routes_tx.clone(),
        )
        .with_process_config(config.process_config())
        .with_poll_interval(config.poll_interval());
        let (deltas, mut errs) = node.run(done.clone());

        tokio::spawn(settle(*id, deltas));
        let fatal = fatal_tx.clone();
        tokio::spawn(async move {
            while let Some(err) = errs.recv().await {
                let _ = fatal.send(err).await;
            }
        });
    }
    drop(routes_tx);
    drop(fatal_tx);

    info!(
        "Simulating {} darknodes in pools of {}, epochs every {}s",
        nodes.len(),
        config.pool_size,
        config.epoch_interval_secs
    );

    let (mut epochs, mut watch_errs) = EpochWatcher::new(registry.clone())
        .with_poll_interval(config.poll_interval())
        .run(done.clone());
    let mut rng = simulation_rng();
    let mut seen = 0u64;

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
            Some(err) = fatal_rx.recv() => break Err(err),
            Some(err) = watch_errs.recv() => break Err(err),
            epoch = epochs.recv() => {
                let Some(epoch) = epoch else { break Ok(()) };
                if max_epochs.is_some_and(|max| seen >= max) {
                    break Ok(());
                }
                seen += 1;
                network.retain_epoch(&epoch);
                // Give every node time to set up its epoch process.
                tokio::time::sleep(config.poll_interval() * 2).await;
                if let Err(e) = submit_orders(&switcher, &addresses, &nodes, &config, &epoch, &mut rng).await {
                    warn!("Order submission for epoch {} incomplete: {e}", epoch.ordinal);
                }
                log_routes(&switcher).await;
            }
        }
    };

    canceller.cancel();
    result
}

/// Splits random crossing orders across every pool of `epoch`.
async fn submit_orders(
    switcher: &SwitcherHandle,
    addresses: &HashMap<Address, NodeId>,
    nodes: &[NodeId],
    config: &DarknodeConfig,
    epoch: &Epoch,
    rng: &mut StdRng,
) -> Result<(), DarknodeError> {
    let ocean = DarkOcean::new(epoch.clone(), nodes, config.pool_size)?;
    for pool in ocean.pools() {
        let n = pool.size();
        let k = pool.threshold();
        for _ in 0..config.orders_per_epoch {
            let nonce = rng.gen::<u64>();
            let price = rng.gen_range(900..1_100u64);
            let buy = Order::new(Parity::Buy, price + rng.gen_range(0..100u64), 10, nonce);
            let sell = Order::new(Parity::Sell, price, rng.gen_range(1..20u64), nonce);
            let buys = buy.split(n, k, rng)?;
            let sells = sell.split(n, k, rng)?;

            for ((address, b), s) in pool.addresses().iter().zip(buys).zip(sells) {
                let id = addresses
                    .get(address)
                    .ok_or_else(|| DarknodeError::Pool(format!("unknown address {}", address)))?;
                switcher.route_order(*id, b).await?;
                switcher.route_order(*id, s).await?;
            }
        }
    }
    Ok(())
}

async fn log_routes(switcher: &SwitcherHandle) {
    match switcher.routes().await {
        Ok(routes) => info!("{} live epoch routes", routes.len()),
        Err(e) => warn!("Cannot list routes: {e}"),
    }
}

/// Settles every matched delta on a pair of in-memory swap contracts.
async fn settle(id: NodeId, mut deltas: mpsc::Receiver<Delta>) {
    while let Some(delta) = deltas.recv().await {
        if let Err(e) = settle_delta(id, &delta).await {
            warn!("Darknode {} cannot settle delta {}: {e}", id, delta.id);
        }
    }
}

async fn settle_delta(id: NodeId, delta: &Delta) -> Result<(), DarknodeError> {
    let secret = SwapSecret::for_delta(id.as_bytes(), delta);
    let expiry = unix_now() + SWAP_EXPIRY_SECS;
    let value = delta.volume_delta_signed().unwrap_or(0).unsigned_abs();
    let Some(terms) = SwapTerms::from_delta(delta, &secret, value, expiry) else {
        info!(
            "Darknode {}: orders {} / {} do not cross ({:?})",
            id,
            delta.buy_order_id,
            delta.sell_order_id,
            delta.price_delta_signed()
        );
        return Ok(());
    };

    let buyer = delta.buy_order_id.0;
    let seller = delta.sell_order_id.0;
    let bitcoin = MemoryAtomContract::new(Ledger::BitcoinTestnet);
    let ethereum = MemoryAtomContract::new(Ledger::EthereumRopsten);
    bitcoin
        .initiate(terms.hash, &seller, &buyer, terms.value, terms.expiry)
        .await?;
    ethereum
        .initiate(terms.hash, &buyer, &seller, terms.value, terms.expiry)
        .await?;
    ethereum.redeem(&secret).await?;
    let revealed = ethereum.read_secret().await?;
    bitcoin.redeem(&revealed).await?;

    let atom = bitcoin.atom(Vec::new()).await?;
    info!(
        "Darknode {}: settled delta {} (price delta {:?}) on {:?}, {} bytes of ledger data",
        id,
        delta.id,
        delta.price_delta_signed(),
        atom.ledger,
        atom.ledger_data.len()
    );
    Ok(())
}

fn simulation_rng() -> StdRng {
    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    StdRng::from_seed(seed)
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
