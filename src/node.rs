//! Darknode runner: one epoch process per epoch, for as long as the node runs.
//!
//! The runner watches the registry, and on every epoch change cancels the
//! process serving the previous epoch before starting a fresh one. Deltas of
//! every epoch are merged into a single receiver. Only watcher failures are
//! fatal to the node; epoch process failures are logged and the node waits
//! for the next epoch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cancel::{Canceller, Done};
use crate::epoch::{Epoch, EpochRegistry};
use crate::epoch_process::{EpochProcess, EpochProcessConfig, EpochRoute};
use crate::error::DarknodeError;
use crate::identity::NodeId;
use crate::p2p::router::Router;
use crate::pool::DarkOcean;
use crate::smpc::{ComputerFactory, Delta};
use crate::watcher::{EpochWatcher, DEFAULT_POLL_INTERVAL};

pub struct Darknode<G, R, C> {
    id: NodeId,
    registered: Arc<Vec<NodeId>>,
    pool_size: usize,
    registry: Arc<G>,
    router: Arc<R>,
    computers: C,
    epoch_routes: mpsc::Sender<EpochRoute>,
    process_config: EpochProcessConfig,
    poll_interval: Duration,
}

impl<G, R, C> Darknode<G, R, C>
where
    G: EpochRegistry + 'static,
    R: Router + 'static,
    C: ComputerFactory + Clone,
{
    pub fn new(
        id: NodeId,
        registered: Arc<Vec<NodeId>>,
        pool_size: usize,
        registry: Arc<G>,
        router: Arc<R>,
        computers: C,
        epoch_routes: mpsc::Sender<EpochRoute>,
    ) -> Self {
        Self {
            id,
            registered,
            pool_size,
            registry,
            router,
            computers,
            epoch_routes,
            process_config: EpochProcessConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_process_config(mut self, config: EpochProcessConfig) -> Self {
        self.process_config = config;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawns the node. The error receiver only carries fatal errors.
    pub fn run(self, done: Done) -> (mpsc::Receiver<Delta>, mpsc::Receiver<DarknodeError>) {
        let (deltas_tx, deltas_rx) = mpsc::channel(self.process_config.channel_capacity.max(1));
        let (errs_tx, errs_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let (mut epochs, mut watch_errs) = EpochWatcher::new(self.registry.clone())
                .with_poll_interval(self.poll_interval)
                .run(done.clone());
            let mut current: Option<Canceller> = None;
            let mut watch_errs_open = true;

            loop {
                tokio::select! {
                    biased;
                    _ = done.cancelled() => break,
                    err = watch_errs.recv(), if watch_errs_open => match err {
                        Some(err) => {
                            error!("darknode {} lost the registry: {}", self.id, err);
                            let _ = errs_tx.send(err).await;
                        }
                        None => watch_errs_open = false,
                    },
                    epoch = epochs.recv() => match epoch {
                        Some(epoch) => {
                            if let Some(previous) = current.take() {
                                previous.cancel();
                            }
                            current = self.start_epoch(&done, epoch, &deltas_tx);
                        }
                        None => break,
                    },
                }
            }
            drop(current);
            info!("darknode {} stopped", self.id);
        });

        (deltas_rx, errs_rx)
    }

    fn start_epoch(&self, done: &Done, epoch: Epoch, deltas: &mpsc::Sender<Delta>) -> Option<Canceller> {
        let ordinal = epoch.ordinal;
        let ocean = match DarkOcean::new(epoch, &self.registered, self.pool_size) {
            Ok(ocean) => Arc::new(ocean),
            Err(e) => {
                warn!("darknode {} skips epoch {}: {}", self.id, ordinal, e);
                return None;
            }
        };

        let (canceller, epoch_done) = done.child();
        let (mut process_deltas, mut process_errs) = EpochProcess::new(
            self.id,
            ocean,
            self.router.clone(),
            self.computers.clone(),
            self.epoch_routes.clone(),
        )
        .with_config(self.process_config.clone())
        .run(epoch_done.clone());

        let id = self.id;
        let deltas = deltas.clone();
        tokio::spawn(async move {
            let mut errs_open = true;
            loop {
                tokio::select! {
                    err = process_errs.recv(), if errs_open => match err {
                        Some(err) => warn!("darknode {} epoch {}: {}", id, ordinal, err),
                        None => errs_open = false,
                    },
                    delta = process_deltas.recv() => match delta {
                        Some(delta) => {
                            if !epoch_done.send(&deltas, delta).await {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Some(canceller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::done_channel;
    use crate::order::{Order, Parity};
    use crate::p2p::transport::LocalNetwork;
    use crate::pool::PoolResolver;
    use crate::registry::{unix_now, MemoryRegistry};
    use crate::smpc::ShamirComputers;
    use crate::switcher::{EpochSwitcher, SwitcherHandle};
    use ark_std::test_rng;

    const WAIT: Duration = Duration::from_secs(5);

    fn registered(count: usize) -> Arc<Vec<NodeId>> {
        Arc::new(
            (0..count)
                .map(|i| NodeId::from_seed(format!("runner-{}", i).as_bytes()))
                .collect(),
        )
    }

    async fn wait_for_routes(switcher: &SwitcherHandle, count: usize, ordinal: u64) {
        tokio::time::timeout(WAIT, async {
            loop {
                let routes = switcher.routes().await.unwrap();
                if routes.len() == count && routes.iter().all(|(_, e)| e.ordinal == ordinal) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn submit_crossing(
        switcher: &SwitcherHandle,
        nodes: &[NodeId],
        epoch: &Epoch,
        buy: u64,
        sell: u64,
        nonce: u64,
    ) {
        let ocean = DarkOcean::new(epoch.clone(), nodes, nodes.len()).unwrap();
        let pool = ocean.pool(&nodes[0]).unwrap();
        let mut rng = test_rng();
        let k = pool.threshold();
        let buys = Order::new(Parity::Buy, buy, 3, nonce).split(pool.size(), k, &mut rng).unwrap();
        let sells = Order::new(Parity::Sell, sell, 3, nonce).split(pool.size(), k, &mut rng).unwrap();
        for (i, address) in pool.addresses().iter().enumerate() {
            let id = nodes.iter().find(|id| id.address() == *address).unwrap();
            switcher.route_order(*id, buys[i].clone()).await.unwrap();
            switcher.route_order(*id, sells[i].clone()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_nodes_follow_epochs() {
        let nodes = registered(4);
        let registry = Arc::new(MemoryRegistry::new(
            Epoch::new([1u8; 32], unix_now(), 0),
            Duration::ZERO,
        ));
        let network = LocalNetwork::new(32);
        let (_canceller, done) = done_channel();
        let (routes_tx, routes_rx) = mpsc::channel(16);
        let switcher = EpochSwitcher::spawn(done.clone(), routes_rx);

        let mut outputs = Vec::new();
        for id in nodes.iter() {
            let node = Darknode::new(
                *id,
                nodes.clone(),
                4,
                registry.clone(),
                Arc::new(network.router(id.address())),
                ShamirComputers::default(),
                routes_tx.clone(),
            )
            .with_poll_interval(Duration::from_millis(5));
            outputs.push(node.run(done.clone()));
        }

        wait_for_routes(&switcher, 4, 0).await;
        let first = registry.current_epoch().await.unwrap();
        submit_crossing(&switcher, &nodes, &first, 700, 500, 0).await;
        for (deltas, _) in outputs.iter_mut() {
            let delta = tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().unwrap();
            assert_eq!(delta.price_delta_signed(), Some(200));
        }

        let second = registry.advance();
        wait_for_routes(&switcher, 4, 1).await;
        submit_crossing(&switcher, &nodes, &second, 400, 500, 1).await;
        for (deltas, _) in outputs.iter_mut() {
            let delta = tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().unwrap();
            assert!(!delta.is_match());
        }
    }

    #[tokio::test]
    async fn test_registry_failure_is_fatal() {
        let nodes = registered(1);
        let registry = Arc::new(MemoryRegistry::new(
            Epoch::new([1u8; 32], unix_now(), 0),
            Duration::ZERO,
        ));
        registry.fail_minimum_interval(true);
        let network = LocalNetwork::new(4);
        let (_canceller, done) = done_channel();
        let (routes_tx, _routes_rx) = mpsc::channel(4);

        let node = Darknode::new(
            nodes[0],
            nodes.clone(),
            1,
            registry,
            Arc::new(network.router(nodes[0].address())),
            ShamirComputers::default(),
            routes_tx,
        );
        let (mut deltas, mut errs) = node.run(done);

        let err = tokio::time::timeout(WAIT, errs.recv()).await.unwrap().unwrap();
        assert!(matches!(err, DarknodeError::Registry(_)));
        assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());
    }
}
