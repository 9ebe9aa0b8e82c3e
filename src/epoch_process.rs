//! Per-epoch orchestration of a darknode's SMPC work.
//!
//! One [`EpochProcess`] runs per node per epoch. Setup resolves the node's
//! pool, opens a duplex channel with every pool member, builds the SMPC
//! engine for `(n, k)` and publishes an [`EpochRoute`]. After setup three
//! duties run until cancellation or until their inputs are exhausted:
//!
//! ```text
//!   peers ──inbound──▶ ┌────────┐ ──outbound──▶ peers
//!   orders ──────────▶ │ engine │
//!                      └────────┘ ──relay─────▶ deltas
//! ```
//!
//! Outbound sends are bounded per peer by `send_timeout`: a peer that does
//! not accept a fragment in time is skipped for that fragment only.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::cancel::{Done, Scoped};
use crate::epoch::Epoch;
use crate::error::DarknodeError;
use crate::identity::{Address, NodeId};
use crate::order::OrderFragment;
use crate::p2p::messages::Computation;
use crate::p2p::router::{PeerChannel, Router};
use crate::pool::PoolResolver;
use crate::smpc::{ComputerFactory, Delta, DeltaFragment, SmpcEngine};
use crate::threshold::threshold;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EpochProcessConfig {
    /// Upper bound on delivering one fragment to one peer
    pub send_timeout: Duration,
    /// Buffer size of every channel the process creates
    pub channel_capacity: usize,
}

impl Default for EpochProcessConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Entry point for injecting order fragments into a running process.
///
/// The handle stops being live once the process has stopped.
#[derive(Debug, Clone)]
pub struct RouteHandle {
    orders: mpsc::Sender<OrderFragment>,
}

impl RouteHandle {
    pub fn new(orders: mpsc::Sender<OrderFragment>) -> Self {
        Self { orders }
    }

    pub fn is_live(&self) -> bool {
        !self.orders.is_closed()
    }

    pub async fn send_order(&self, fragment: OrderFragment) -> Result<(), DarknodeError> {
        self.orders
            .send(fragment)
            .await
            .map_err(|_| DarknodeError::NoRoute("epoch process stopped".to_string()))
    }
}

/// Published once by every process after a successful setup.
#[derive(Debug, Clone)]
pub struct EpochRoute {
    pub node_id: NodeId,
    pub epoch: Epoch,
    pub handle: RouteHandle,
}

pub struct EpochProcess<P, R, C> {
    id: NodeId,
    pool_resolver: Arc<P>,
    router: Arc<R>,
    computers: C,
    epoch_routes: mpsc::Sender<EpochRoute>,
    config: EpochProcessConfig,
}

impl<P, R, C> EpochProcess<P, R, C>
where
    P: PoolResolver + 'static,
    R: Router + 'static,
    C: ComputerFactory,
{
    pub fn new(
        id: NodeId,
        pool_resolver: Arc<P>,
        router: Arc<R>,
        computers: C,
        epoch_routes: mpsc::Sender<EpochRoute>,
    ) -> Self {
        Self {
            id,
            pool_resolver,
            router,
            computers,
            epoch_routes,
            config: EpochProcessConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EpochProcessConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawns the process and returns its delta and error receivers.
    ///
    /// Setup failures are reported once on the error receiver. Malformed
    /// fragments from peers are reported there too but do not stop the
    /// process. Both receivers close when the process stops.
    pub fn run(self, done: Done) -> (mpsc::Receiver<Delta>, mpsc::Receiver<DarknodeError>) {
        let capacity = self.config.channel_capacity.max(1);
        let (deltas_tx, deltas_rx) = mpsc::channel(capacity);
        let (errs_tx, errs_rx) = mpsc::channel(capacity);

        tokio::spawn(async move {
            let id = self.id;
            if let Err(err) = self.execute(done, deltas_tx, errs_tx.clone()).await {
                error!("epoch process for {} failed: {}", id, err);
                let _ = errs_tx.send(err).await;
            }
        });

        (deltas_rx, errs_rx)
    }

    async fn execute(
        self,
        done: Done,
        deltas: mpsc::Sender<Delta>,
        errs: mpsc::Sender<DarknodeError>,
    ) -> Result<(), DarknodeError> {
        let capacity = self.config.channel_capacity.max(1);
        let epoch = self.pool_resolver.epoch().clone();
        let pool = self.pool_resolver.pool(&self.id)?;
        if pool.is_empty() {
            return Err(DarknodeError::Pool(format!(
                "empty pool for {} in epoch {}",
                self.id, epoch.ordinal
            )));
        }

        let mut senders = Vec::with_capacity(pool.size());
        let mut channels = Vec::with_capacity(pool.size());
        for address in pool.addresses() {
            let (sender, outbound) = mpsc::channel(1);
            let channel = self
                .router
                .compute(&epoch, address, outbound)
                .await
                .map_err(|e| DarknodeError::Router(format!("cannot connect to {}: {}", address, e)))?;
            senders.push((address.clone(), sender));
            channels.push((address.clone(), channel));
        }

        let n = pool.size();
        let k = threshold(n);
        info!(
            "{} computing epoch {} with {} peers (threshold {})",
            self.id, epoch.ordinal, n, k
        );

        let engine = self.computers.new_computer(self.id, n, k);
        let (orders_tx, orders_rx) = mpsc::channel(capacity);
        let (fragments_tx, fragments_rx) = mpsc::channel(capacity);
        let (computed_fragments, computed_deltas) =
            engine.compute_order_matches(done.clone(), orders_rx, fragments_rx);

        let (route_tx, route_rx) = mpsc::channel(capacity);
        let route = EpochRoute {
            node_id: self.id,
            epoch: epoch.clone(),
            handle: RouteHandle::new(route_tx),
        };
        if !done.send(&self.epoch_routes, route).await {
            debug!("route for {} in epoch {} not published", self.id, epoch.ordinal);
        }

        let mut intake = JoinSet::new();
        intake.spawn(forward_orders(
            done.clone(),
            self.router.open_orders(&epoch),
            route_rx,
            orders_tx,
        ));
        for (peer, channel) in channels {
            intake.spawn(receive_fragments(
                done.clone(),
                peer,
                channel,
                fragments_tx.clone(),
                errs.clone(),
            ));
        }
        drop(fragments_tx);
        drop(errs);

        let inbound = async {
            while let Some(joined) = intake.join_next().await {
                if let Err(e) = joined {
                    error!("inbound task failed: {}", e);
                }
            }
        };
        let outbound = broadcast_fragments(done.clone(), computed_fragments, senders, self.config.send_timeout);
        let relay = relay_deltas(done.clone(), computed_deltas, deltas);
        tokio::join!(inbound, outbound, relay);

        info!("{} finished epoch {}", self.id, epoch.ordinal);
        Ok(())
    }
}

/// Runs an [`EpochProcess`] with the default configuration.
pub fn run_epoch_process<P, R, C>(
    done: Done,
    epoch_routes: mpsc::Sender<EpochRoute>,
    id: NodeId,
    pool_resolver: Arc<P>,
    router: Arc<R>,
    computers: C,
) -> (mpsc::Receiver<Delta>, mpsc::Receiver<DarknodeError>)
where
    P: PoolResolver + 'static,
    R: Router + 'static,
    C: ComputerFactory,
{
    EpochProcess::new(id, pool_resolver, router, computers, epoch_routes).run(done)
}

/// Feeds the engine from the router's order stream and from the route handle.
/// The engine's order input closes once both sources have closed.
async fn forward_orders(
    done: Done,
    mut routed: mpsc::Receiver<OrderFragment>,
    mut switched: mpsc::Receiver<OrderFragment>,
    orders: mpsc::Sender<OrderFragment>,
) {
    let mut routed_open = true;
    let mut switched_open = true;
    while routed_open || switched_open {
        let fragment = tokio::select! {
            biased;
            _ = done.cancelled() => return,
            fragment = routed.recv(), if routed_open => match fragment {
                Some(fragment) => fragment,
                None => {
                    routed_open = false;
                    continue;
                }
            },
            fragment = switched.recv(), if switched_open => match fragment {
                Some(fragment) => fragment,
                None => {
                    switched_open = false;
                    continue;
                }
            },
        };
        if !done.send(&orders, fragment).await {
            return;
        }
    }
}

async fn receive_fragments(
    done: Done,
    peer: Address,
    channel: PeerChannel,
    fragments: mpsc::Sender<DeltaFragment>,
    errs: mpsc::Sender<DarknodeError>,
) {
    let PeerChannel {
        mut inbound,
        mut errors,
    } = channel;
    let mut errors_open = true;

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => return,
            err = errors.recv(), if errors_open => match err {
                Some(err) => warn!("channel with {}: {}", peer, err),
                None => errors_open = false,
            },
            computation = inbound.recv() => {
                let Some(computation) = computation else {
                    debug!("{} closed its channel", peer);
                    return;
                };
                match computation {
                    Computation::DeltaFragment(bytes) => match DeltaFragment::from_bytes(&bytes) {
                        Ok(fragment) => {
                            if !done.send(&fragments, fragment).await {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("dropping malformed fragment from {}: {}", peer, e);
                            let _ = errs.try_send(DarknodeError::MalformedFragment {
                                peer: peer.to_string(),
                                reason: e.to_string(),
                            });
                        }
                    },
                    Computation::Unknown { tag, .. } => {
                        debug!("ignoring computation with tag {} from {}", tag, peer);
                    }
                }
            }
        }
    }
}

async fn broadcast_fragments(
    done: Done,
    mut computed: mpsc::Receiver<DeltaFragment>,
    senders: Vec<(Address, mpsc::Sender<Computation>)>,
    send_timeout: Duration,
) {
    loop {
        let fragment = tokio::select! {
            biased;
            _ = done.cancelled() => return,
            fragment = computed.recv() => match fragment {
                Some(fragment) => fragment,
                None => return,
            },
        };
        let computation = match Computation::from_delta_fragment(&fragment) {
            Ok(computation) => computation,
            Err(e) => {
                warn!("cannot encode delta fragment {}: {}", fragment.delta_id, e);
                continue;
            }
        };

        let mut round = JoinSet::new();
        for (peer, sender) in &senders {
            let peer = peer.clone();
            let sender = sender.clone();
            let computation = computation.clone();
            let done = done.clone();
            round.spawn(async move {
                let outcome = done.scoped(send_timeout, sender.send(computation)).await;
                (peer, outcome)
            });
        }
        while let Some(joined) = round.join_next().await {
            match joined {
                Ok((peer, Scoped::Completed(Ok(())))) => trace!("fragment sent to {}", peer),
                Ok((peer, Scoped::Completed(Err(_)))) => debug!("{} is no longer reading", peer),
                Ok((peer, Scoped::TimedOut)) => {
                    debug!("send to {} timed out, skipping fragment", peer)
                }
                Ok((_, Scoped::Cancelled)) => {}
                Err(e) => error!("send task failed: {}", e),
            }
        }
        if done.is_cancelled() {
            return;
        }
    }
}

async fn relay_deltas(done: Done, mut computed: mpsc::Receiver<Delta>, deltas: mpsc::Sender<Delta>) {
    loop {
        let delta = tokio::select! {
            biased;
            _ = done.cancelled() => return,
            delta = computed.recv() => match delta {
                Some(delta) => delta,
                None => return,
            },
        };
        if !done.send(&deltas, delta).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::done_channel;
    use crate::order::{Order, Parity};
    use crate::p2p::transport::LocalNetwork;
    use crate::pool::{DarkOcean, Pool};
    use crate::smpc::ShamirComputers;
    use ark_std::test_rng;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    fn test_epoch() -> Epoch {
        Epoch::new([9u8; 32], 0, 1)
    }

    fn ids(count: usize) -> Vec<NodeId> {
        (0..count)
            .map(|i| NodeId::from_seed(format!("process-{}", i).as_bytes()))
            .collect()
    }

    struct StaticResolver {
        epoch: Epoch,
        pool: Option<Pool>,
    }

    impl StaticResolver {
        fn new(pool: Option<Pool>) -> Arc<Self> {
            Arc::new(Self {
                epoch: test_epoch(),
                pool,
            })
        }
    }

    impl PoolResolver for StaticResolver {
        fn epoch(&self) -> &Epoch {
            &self.epoch
        }

        fn pool(&self, _id: &NodeId) -> Result<Pool, DarknodeError> {
            self.pool
                .clone()
                .ok_or_else(|| DarknodeError::Pool("unregistered".to_string()))
        }
    }

    /// Router that hands channel ends to the test instead of a network.
    #[derive(Default)]
    struct StubRouter {
        outbound: Mutex<HashMap<Address, mpsc::Receiver<Computation>>>,
        inbound: Mutex<HashMap<Address, mpsc::Sender<Computation>>>,
        fail_for: Option<Address>,
        orders: Mutex<Option<mpsc::Receiver<OrderFragment>>>,
    }

    impl StubRouter {
        fn take_outbound(&self, address: &Address) -> mpsc::Receiver<Computation> {
            self.outbound.lock().unwrap().remove(address).unwrap()
        }

        fn inbound(&self, address: &Address) -> mpsc::Sender<Computation> {
            self.inbound.lock().unwrap().get(address).unwrap().clone()
        }

        fn opened(&self) -> usize {
            self.outbound.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Router for StubRouter {
        async fn compute(
            &self,
            _epoch: &Epoch,
            address: &Address,
            outbound: mpsc::Receiver<Computation>,
        ) -> Result<PeerChannel, DarknodeError> {
            if self.fail_for.as_ref() == Some(address) {
                return Err(DarknodeError::Unavailable(address.to_string()));
            }
            let (inbound_tx, inbound) = mpsc::channel(16);
            let (_errors_tx, errors) = mpsc::channel(1);
            self.outbound.lock().unwrap().insert(address.clone(), outbound);
            self.inbound.lock().unwrap().insert(address.clone(), inbound_tx);
            Ok(PeerChannel { inbound, errors })
        }

        fn open_orders(&self, _epoch: &Epoch) -> mpsc::Receiver<OrderFragment> {
            match self.orders.lock().unwrap().take() {
                Some(rx) => rx,
                None => mpsc::channel(1).1,
            }
        }
    }

    /// Engine that emits a fixed list of fragments and never reconstructs.
    struct ScriptedComputers {
        script: Vec<DeltaFragment>,
    }

    struct ScriptedEngine {
        script: Vec<DeltaFragment>,
    }

    impl ComputerFactory for ScriptedComputers {
        type Engine = ScriptedEngine;

        fn new_computer(&self, _id: NodeId, _n: usize, _k: usize) -> ScriptedEngine {
            ScriptedEngine {
                script: self.script.clone(),
            }
        }
    }

    impl SmpcEngine for ScriptedEngine {
        fn compute_order_matches(
            self,
            done: Done,
            _orders: mpsc::Receiver<OrderFragment>,
            _fragments: mpsc::Receiver<DeltaFragment>,
        ) -> (mpsc::Receiver<DeltaFragment>, mpsc::Receiver<Delta>) {
            let (fragments_tx, fragments_rx) = mpsc::channel(16);
            let (deltas_tx, deltas_rx) = mpsc::channel(1);
            tokio::spawn(async move {
                for fragment in self.script {
                    let _ = fragments_tx.send(fragment).await;
                }
                done.cancelled().await;
                drop(deltas_tx);
            });
            (fragments_rx, deltas_rx)
        }
    }

    struct Crossing {
        buys: Vec<OrderFragment>,
        sells: Vec<OrderFragment>,
    }

    fn crossing(buy_price: u64, sell_price: u64, n: usize, k: usize) -> Crossing {
        let mut rng = test_rng();
        Crossing {
            buys: Order::new(Parity::Buy, buy_price, 8, 1).split(n, k, &mut rng).unwrap(),
            sells: Order::new(Parity::Sell, sell_price, 8, 2).split(n, k, &mut rng).unwrap(),
        }
    }

    fn delta_computation(c: &Crossing, i: usize) -> Computation {
        let fragment = DeltaFragment::from_orders(&c.buys[i], &c.sells[i]).unwrap();
        Computation::from_delta_fragment(&fragment).unwrap()
    }

    fn four_node_setup() -> (Vec<Address>, Arc<StaticResolver>, Arc<StubRouter>) {
        let addresses: Vec<Address> = ids(4).iter().map(NodeId::address).collect();
        let resolver = StaticResolver::new(Some(Pool::new(addresses.clone())));
        (addresses, resolver, Arc::new(StubRouter::default()))
    }

    #[tokio::test]
    async fn test_threshold_fragments_yield_one_delta() {
        let (addresses, resolver, router) = four_node_setup();
        let (routes_tx, mut routes) = mpsc::channel(4);
        let (_canceller, done) = done_channel();
        let (mut deltas, _errs) =
            run_epoch_process(done, routes_tx, ids(4)[0], resolver, router.clone(), ShamirComputers::default());

        let route = tokio::time::timeout(WAIT, routes.recv()).await.unwrap().unwrap();
        assert_eq!(route.epoch, test_epoch());
        assert!(route.handle.is_live());
        assert_eq!(router.opened(), 4);

        let c = crossing(1_300, 1_000, 4, 3);
        for i in 0..3 {
            router.inbound(&addresses[i]).send(delta_computation(&c, i)).await.unwrap();
        }

        let delta = tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().unwrap();
        assert!(delta.is_match());
        assert_eq!(delta.price_delta_signed(), Some(300));

        router.inbound(&addresses[3]).send(delta_computation(&c, 3)).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), deltas.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_below_threshold_yields_no_delta() {
        let (addresses, resolver, router) = four_node_setup();
        let (routes_tx, _routes) = mpsc::channel(4);
        let (canceller, done) = done_channel();
        let (mut deltas, _errs) =
            run_epoch_process(done, routes_tx, ids(4)[0], resolver, router.clone(), ShamirComputers::default());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let c = crossing(1_300, 1_000, 4, 3);
        for i in 0..2 {
            router.inbound(&addresses[i]).send(delta_computation(&c, i)).await.unwrap();
        }
        assert!(tokio::time::timeout(Duration::from_millis(200), deltas.recv())
            .await
            .is_err());

        canceller.cancel();
        assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_computations() {
        let (addresses, resolver, router) = four_node_setup();
        let (routes_tx, _routes) = mpsc::channel(4);
        let (_canceller, done) = done_channel();
        let (mut deltas, mut errs) =
            run_epoch_process(done, routes_tx, ids(4)[0], resolver, router.clone(), ShamirComputers::default());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let peer = router.inbound(&addresses[1]);
        peer.send(Computation::DeltaFragment(vec![1, 2, 3])).await.unwrap();
        peer.send(Computation::Unknown { tag: 99, payload: vec![0; 8] }).await.unwrap();

        let err = tokio::time::timeout(WAIT, errs.recv()).await.unwrap().unwrap();
        match err {
            DarknodeError::MalformedFragment { peer, .. } => assert_eq!(peer, addresses[1].to_string()),
            other => panic!("unexpected error {:?}", other),
        }

        let c = crossing(1_000, 1_000, 4, 3);
        for i in 0..3 {
            router.inbound(&addresses[i]).send(delta_computation(&c, i)).await.unwrap();
        }
        let delta = tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().unwrap();
        assert!(delta.is_match());
    }

    #[tokio::test]
    async fn test_pool_error_is_fatal() {
        let resolver = StaticResolver::new(None);
        let router = Arc::new(StubRouter::default());
        let (routes_tx, mut routes) = mpsc::channel(4);
        let (_canceller, done) = done_channel();
        let (mut deltas, mut errs) =
            run_epoch_process(done, routes_tx, ids(1)[0], resolver, router.clone(), ShamirComputers::default());

        let err = tokio::time::timeout(WAIT, errs.recv()).await.unwrap().unwrap();
        assert!(matches!(err, DarknodeError::Pool(_)));
        assert!(tokio::time::timeout(WAIT, errs.recv()).await.unwrap().is_none());
        assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());
        assert!(routes.recv().await.is_none());
        assert_eq!(router.opened(), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_is_fatal() {
        let resolver = StaticResolver::new(Some(Pool::new(Vec::new())));
        let router = Arc::new(StubRouter::default());
        let (routes_tx, _routes) = mpsc::channel(4);
        let (_canceller, done) = done_channel();
        let (_deltas, mut errs) =
            run_epoch_process(done, routes_tx, ids(1)[0], resolver, router, ShamirComputers::default());

        let err = tokio::time::timeout(WAIT, errs.recv()).await.unwrap().unwrap();
        assert!(matches!(err, DarknodeError::Pool(_)));
    }

    #[tokio::test]
    async fn test_router_error_releases_opened_channels() {
        let addresses: Vec<Address> = ids(4).iter().map(NodeId::address).collect();
        let resolver = StaticResolver::new(Some(Pool::new(addresses.clone())));
        let router = Arc::new(StubRouter {
            fail_for: Some(addresses[2].clone()),
            ..StubRouter::default()
        });
        let (routes_tx, _routes) = mpsc::channel(4);
        let (_canceller, done) = done_channel();
        let (mut deltas, mut errs) =
            run_epoch_process(done, routes_tx, ids(4)[0], resolver, router.clone(), ShamirComputers::default());

        let err = tokio::time::timeout(WAIT, errs.recv()).await.unwrap().unwrap();
        assert!(matches!(err, DarknodeError::Router(_)));
        assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());

        assert_eq!(router.opened(), 2);
        for address in &addresses[..2] {
            let mut outbound = router.take_outbound(address);
            assert!(tokio::time::timeout(WAIT, outbound.recv()).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_stuck_peer_does_not_stall_others() {
        let addresses: Vec<Address> = ids(3).iter().map(NodeId::address).collect();
        let resolver = StaticResolver::new(Some(Pool::new(addresses.clone())));
        let router = Arc::new(StubRouter::default());
        let c = crossing(10, 5, 3, 2);
        let script: Vec<DeltaFragment> = (0..3)
            .map(|i| DeltaFragment::from_orders(&c.buys[i], &c.sells[i]).unwrap())
            .collect();

        let send_timeout = Duration::from_millis(300);
        let (routes_tx, _routes) = mpsc::channel(4);
        let (canceller, done) = done_channel();
        let started = Instant::now();
        let (_deltas, _errs) = EpochProcess::new(
            ids(3)[0],
            resolver,
            router.clone(),
            ScriptedComputers { script: script.clone() },
            routes_tx,
        )
        .with_config(EpochProcessConfig {
            send_timeout,
            channel_capacity: 16,
        })
        .run(done);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // addresses[2] never reads its outbound channel.
        let mut healthy: Vec<mpsc::Receiver<Computation>> =
            addresses[..2].iter().map(|a| router.take_outbound(a)).collect();

        for (i, fragment) in script.iter().enumerate() {
            let expected = Computation::from_delta_fragment(fragment).unwrap();
            for outbound in healthy.iter_mut() {
                let got = tokio::time::timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
                assert_eq!(got, expected);
            }
            let elapsed = started.elapsed();
            match i {
                0 | 1 => assert!(elapsed < send_timeout, "fragment {} took {:?}", i, elapsed),
                _ => assert!(elapsed < send_timeout * 2, "fragment {} took {:?}", i, elapsed),
            }
        }
        canceller.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_releases_outbound_senders() {
        let (addresses, resolver, router) = four_node_setup();
        let (routes_tx, mut routes) = mpsc::channel(4);
        let (canceller, done) = done_channel();
        let (mut deltas, mut errs) =
            run_epoch_process(done, routes_tx, ids(4)[0], resolver, router.clone(), ShamirComputers::default());

        let route = tokio::time::timeout(WAIT, routes.recv()).await.unwrap().unwrap();
        canceller.cancel();

        assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());
        assert!(tokio::time::timeout(WAIT, errs.recv()).await.unwrap().is_none());
        for address in &addresses {
            let mut outbound = router.take_outbound(address);
            assert!(tokio::time::timeout(WAIT, outbound.recv()).await.unwrap().is_none());
        }
        assert!(!route.handle.is_live());
    }

    #[tokio::test]
    async fn test_cancel_during_blocked_broadcast() {
        let addresses: Vec<Address> = ids(3).iter().map(NodeId::address).collect();
        let resolver = StaticResolver::new(Some(Pool::new(addresses.clone())));
        let router = Arc::new(StubRouter::default());
        let c = crossing(10, 5, 3, 2);
        let script: Vec<DeltaFragment> = (0..3)
            .map(|i| DeltaFragment::from_orders(&c.buys[i], &c.sells[i]).unwrap())
            .collect();

        let (routes_tx, _routes) = mpsc::channel(4);
        let (canceller, done) = done_channel();
        let (mut deltas, mut errs) = EpochProcess::new(
            ids(3)[0],
            resolver,
            router.clone(),
            ScriptedComputers { script: script.clone() },
            routes_tx,
        )
        .with_config(EpochProcessConfig {
            send_timeout: Duration::from_secs(60),
            channel_capacity: 16,
        })
        .run(done);

        // Nobody reads: the first fragment fills every buffer and the
        // second round blocks on all peers.
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();

        assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());
        assert!(tokio::time::timeout(WAIT, errs.recv()).await.unwrap().is_none());
        let first = Computation::from_delta_fragment(&script[0]).unwrap();
        for address in &addresses {
            let mut outbound = router.take_outbound(address);
            let buffered = tokio::time::timeout(WAIT, outbound.recv()).await.unwrap();
            assert_eq!(buffered, Some(first.clone()));
            assert!(tokio::time::timeout(WAIT, outbound.recv()).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_route_handle_feeds_engine() {
        let (addresses, resolver, router) = four_node_setup();
        let (orders_tx, orders_rx) = mpsc::channel(8);
        *router.orders.lock().unwrap() = Some(orders_rx);
        let (routes_tx, mut routes) = mpsc::channel(4);
        let (_canceller, done) = done_channel();
        let (_deltas, _errs) =
            run_epoch_process(done, routes_tx, ids(4)[0], resolver, router.clone(), ShamirComputers::default());

        let route = tokio::time::timeout(WAIT, routes.recv()).await.unwrap().unwrap();
        let c = crossing(20, 10, 4, 3);
        orders_tx.send(c.buys[0].clone()).await.unwrap();
        route.handle.send_order(c.sells[0].clone()).await.unwrap();

        let expected = delta_computation(&c, 0);
        let mut outbound = router.take_outbound(&addresses[1]);
        let got = tokio::time::timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_pool_computes_over_local_network() {
        let nodes = ids(4);
        let epoch = test_epoch();
        let network = LocalNetwork::new(32);
        let ocean = Arc::new(DarkOcean::new(epoch.clone(), &nodes, 4).unwrap());
        let pool = ocean.pool(&nodes[0]).unwrap();
        let (routes_tx, _routes) = mpsc::channel(8);
        let (canceller, done) = done_channel();

        let mut outputs = Vec::new();
        for id in &nodes {
            let router = Arc::new(network.router(id.address()));
            outputs.push(run_epoch_process(
                done.clone(),
                routes_tx.clone(),
                *id,
                ocean.clone(),
                router,
                ShamirComputers::default(),
            ));
        }

        let c = crossing(2_000, 1_500, 4, 3);
        for (i, address) in pool.addresses().iter().enumerate() {
            network.submit_order(&epoch, address, c.buys[i].clone()).unwrap();
            network.submit_order(&epoch, address, c.sells[i].clone()).unwrap();
        }

        for (deltas, _) in outputs.iter_mut() {
            let delta = tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().unwrap();
            assert!(delta.is_match());
            assert_eq!(delta.price_delta_signed(), Some(500));
            assert_eq!(delta.volume_delta_signed(), Some(0));
        }
        canceller.cancel();
        for (deltas, _) in outputs.iter_mut() {
            assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());
        }
    }
}
