//! Reference SMPC engine.
//!
//! The engine pairs every buy order fragment it holds with every sell order
//! fragment of the same index, emits the resulting delta fragment for
//! broadcast, and collects delta fragments (its own and its peers') until `k`
//! distinct indices are present for a delta, at which point the delta is
//! reconstructed and emitted exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::cancel::Done;
use crate::identity::NodeId;
use crate::order::{OrderFragment, OrderId, Parity};
use crate::smpc::delta::{Delta, DeltaFragment, DeltaId};

/// An SMPC computation bound to one node and one pool.
pub trait SmpcEngine: Send + 'static {
    /// Consumes order fragments and peer delta fragments; produces delta
    /// fragments to broadcast and reconstructed deltas.
    ///
    /// Both outputs close once both inputs have closed or `done` fires.
    fn compute_order_matches(
        self,
        done: Done,
        orders: mpsc::Receiver<OrderFragment>,
        fragments: mpsc::Receiver<DeltaFragment>,
    ) -> (mpsc::Receiver<DeltaFragment>, mpsc::Receiver<Delta>);
}

/// Builds engines for `(node, n, k)`.
pub trait ComputerFactory: Send + Sync + 'static {
    type Engine: SmpcEngine;

    fn new_computer(&self, id: NodeId, n: usize, k: usize) -> Self::Engine;
}

#[derive(Debug, Clone)]
pub struct ShamirComputers {
    capacity: usize,
}

impl ShamirComputers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl Default for ShamirComputers {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ComputerFactory for ShamirComputers {
    type Engine = Computer;

    fn new_computer(&self, id: NodeId, n: usize, k: usize) -> Computer {
        Computer {
            id,
            n,
            k,
            capacity: self.capacity,
        }
    }
}

#[derive(Debug)]
pub struct Computer {
    id: NodeId,
    n: usize,
    k: usize,
    capacity: usize,
}

impl SmpcEngine for Computer {
    fn compute_order_matches(
        self,
        done: Done,
        mut orders: mpsc::Receiver<OrderFragment>,
        mut fragments: mpsc::Receiver<DeltaFragment>,
    ) -> (mpsc::Receiver<DeltaFragment>, mpsc::Receiver<Delta>) {
        let (fragments_tx, fragments_rx) = mpsc::channel(self.capacity);
        let (deltas_tx, deltas_rx) = mpsc::channel(self.capacity);

        tokio::spawn(async move {
            let mut state = MatchState::new(self.k);
            let mut orders_open = true;
            let mut fragments_open = true;
            debug!("computer {} started (n = {}, k = {})", self.id, self.n, self.k);

            'run: while orders_open || fragments_open {
                tokio::select! {
                    biased;
                    _ = done.cancelled() => break 'run,
                    order = orders.recv(), if orders_open => {
                        let Some(order) = order else {
                            orders_open = false;
                            continue;
                        };
                        for local in state.insert_order(order) {
                            if !done.send(&fragments_tx, local.clone()).await {
                                break 'run;
                            }
                            if let Some(delta) = state.insert_fragment(local) {
                                if !done.send(&deltas_tx, delta).await {
                                    break 'run;
                                }
                            }
                        }
                    }
                    fragment = fragments.recv(), if fragments_open => {
                        let Some(fragment) = fragment else {
                            fragments_open = false;
                            continue;
                        };
                        if let Some(delta) = state.insert_fragment(fragment) {
                            if !done.send(&deltas_tx, delta).await {
                                break 'run;
                            }
                        }
                    }
                }
            }
            debug!("computer {} stopped", self.id);
        });

        (fragments_rx, deltas_rx)
    }
}

struct MatchState {
    k: usize,
    buys: HashMap<OrderId, OrderFragment>,
    sells: HashMap<OrderId, OrderFragment>,
    collections: HashMap<DeltaId, BTreeMap<u64, DeltaFragment>>,
    finished: HashSet<DeltaId>,
}

impl MatchState {
    fn new(k: usize) -> Self {
        Self {
            k,
            buys: HashMap::new(),
            sells: HashMap::new(),
            collections: HashMap::new(),
            finished: HashSet::new(),
        }
    }

    /// Stores the fragment and returns the local delta fragments it completes.
    fn insert_order(&mut self, order: OrderFragment) -> Vec<DeltaFragment> {
        let (own, counterparts) = match order.parity {
            Parity::Buy => (&mut self.buys, &self.sells),
            Parity::Sell => (&mut self.sells, &self.buys),
        };
        if own.contains_key(&order.order_id) {
            trace!("duplicate order fragment {}", order.order_id);
            return Vec::new();
        }

        let locals = counterparts
            .values()
            .filter_map(|other| {
                let (buy, sell) = match order.parity {
                    Parity::Buy => (&order, other),
                    Parity::Sell => (other, &order),
                };
                match DeltaFragment::from_orders(buy, sell) {
                    Ok(fragment) => Some(fragment),
                    Err(err) => {
                        warn!("cannot pair {} with {}: {}", buy.order_id, sell.order_id, err);
                        None
                    }
                }
            })
            .collect();
        own.insert(order.order_id, order);
        locals
    }

    fn insert_fragment(&mut self, fragment: DeltaFragment) -> Option<Delta> {
        if self.finished.contains(&fragment.delta_id) {
            return None;
        }
        let id = fragment.delta_id;
        if id != DeltaId::for_orders(&fragment.buy_order_id, &fragment.sell_order_id) {
            warn!("dropping fragment whose delta id does not match its orders");
            return None;
        }
        let collection = self.collections.entry(id).or_default();
        if let Some(first) = collection.values().next() {
            if !first.is_compatible(&fragment) {
                warn!("dropping inconsistent fragment for delta {}", id);
                return None;
            }
        }
        collection.entry(fragment.index).or_insert(fragment);
        if collection.len() < self.k {
            return None;
        }

        let shares: Vec<DeltaFragment> = collection.values().take(self.k).cloned().collect();
        match Delta::reconstruct(&shares) {
            Ok(delta) => {
                self.collections.remove(&id);
                self.finished.insert(id);
                debug!("delta {} reconstructed (match: {})", id, delta.is_match());
                Some(delta)
            }
            Err(err) => {
                warn!("cannot reconstruct delta {}: {}", id, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::done_channel;
    use crate::order::Order;
    use ark_std::test_rng;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        buys: Vec<OrderFragment>,
        sells: Vec<OrderFragment>,
    }

    fn fixture(n: usize, k: usize) -> Fixture {
        let mut rng = test_rng();
        Fixture {
            buys: Order::new(Parity::Buy, 1_100, 5, 0).split(n, k, &mut rng).unwrap(),
            sells: Order::new(Parity::Sell, 1_000, 5, 0).split(n, k, &mut rng).unwrap(),
        }
    }

    fn peer_fragment(f: &Fixture, i: usize) -> DeltaFragment {
        DeltaFragment::from_orders(&f.buys[i], &f.sells[i]).unwrap()
    }

    #[tokio::test]
    async fn test_local_fragment_is_broadcast_and_counted() {
        let f = fixture(4, 3);
        let (_canceller, done) = done_channel();
        let (orders_tx, orders_rx) = mpsc::channel(8);
        let (peers_tx, peers_rx) = mpsc::channel(8);
        let engine = ShamirComputers::default().new_computer(NodeId::from_seed(b"a"), 4, 3);
        let (mut out, mut deltas) = engine.compute_order_matches(done, orders_rx, peers_rx);

        orders_tx.send(f.buys[0].clone()).await.unwrap();
        orders_tx.send(f.sells[0].clone()).await.unwrap();

        let local = tokio::time::timeout(WAIT, out.recv()).await.unwrap().unwrap();
        assert_eq!(local, peer_fragment(&f, 0));

        peers_tx.send(peer_fragment(&f, 1)).await.unwrap();
        peers_tx.send(peer_fragment(&f, 1)).await.unwrap();
        peers_tx.send(peer_fragment(&f, 2)).await.unwrap();

        let delta = tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().unwrap();
        assert!(delta.is_match());
        assert_eq!(delta.price_delta_signed(), Some(100));

        // A late fourth fragment does not produce a second delta.
        peers_tx.send(peer_fragment(&f, 3)).await.unwrap();
        drop(orders_tx);
        drop(peers_tx);
        assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());
        assert!(tokio::time::timeout(WAIT, out.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_below_threshold_yields_nothing() {
        let f = fixture(4, 3);
        let (canceller, done) = done_channel();
        let (_orders_tx, orders_rx) = mpsc::channel(8);
        let (peers_tx, peers_rx) = mpsc::channel(8);
        let engine = ShamirComputers::default().new_computer(NodeId::from_seed(b"a"), 4, 3);
        let (_out, mut deltas) = engine.compute_order_matches(done, orders_rx, peers_rx);

        peers_tx.send(peer_fragment(&f, 0)).await.unwrap();
        peers_tx.send(peer_fragment(&f, 3)).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), deltas.recv())
            .await
            .is_err());

        canceller.cancel();
        assert!(tokio::time::timeout(WAIT, deltas.recv()).await.unwrap().is_none());
    }

    #[test]
    fn test_forged_fragment_does_not_block_delta() {
        let f = fixture(4, 3);
        let mut state = MatchState::new(3);

        let mut forged = peer_fragment(&f, 0);
        forged.buy_order_id = OrderId([0xaa; 32]);
        assert!(state.insert_fragment(forged).is_none());

        assert!(state.insert_fragment(peer_fragment(&f, 1)).is_none());
        assert!(state.insert_fragment(peer_fragment(&f, 2)).is_none());
        let delta = state.insert_fragment(peer_fragment(&f, 3)).unwrap();
        assert_eq!(delta.price_delta_signed(), Some(100));
    }

    #[test]
    fn test_duplicate_order_fragments_are_ignored() {
        let f = fixture(3, 2);
        let mut state = MatchState::new(2);
        assert!(state.insert_order(f.buys[0].clone()).is_empty());
        assert_eq!(state.insert_order(f.sells[0].clone()).len(), 1);
        assert!(state.insert_order(f.sells[0].clone()).is_empty());
    }
}
