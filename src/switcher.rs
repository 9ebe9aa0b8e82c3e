//! Routing of order fragments to the epoch process currently serving a node.
//!
//! The switcher task owns the route map. Every other component talks to it
//! through a [`SwitcherHandle`], so the map is never shared. A newer route for
//! a node replaces the older one, and a route whose process has stopped is
//! evicted the first time it is used.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::cancel::Done;
use crate::epoch::Epoch;
use crate::epoch_process::{EpochRoute, RouteHandle};
use crate::error::DarknodeError;
use crate::identity::NodeId;
use crate::order::OrderFragment;

enum Command {
    RouteOrder {
        node_id: NodeId,
        fragment: OrderFragment,
        reply: oneshot::Sender<Result<(), DarknodeError>>,
    },
    Routes {
        reply: oneshot::Sender<Vec<(NodeId, Epoch)>>,
    },
}

pub struct EpochSwitcher {
    routes: HashMap<NodeId, (Epoch, RouteHandle)>,
}

impl EpochSwitcher {
    /// Spawns the switcher. It consumes `routes` until cancelled or until both
    /// `routes` and every handle are gone.
    pub fn spawn(done: Done, routes: mpsc::Receiver<EpochRoute>) -> SwitcherHandle {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let switcher = EpochSwitcher {
            routes: HashMap::new(),
        };
        tokio::spawn(switcher.run(done, routes, commands_rx));
        SwitcherHandle {
            commands: commands_tx,
        }
    }

    async fn run(
        mut self,
        done: Done,
        mut routes: mpsc::Receiver<EpochRoute>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut routes_open = true;
        let mut commands_open = true;
        while routes_open || commands_open {
            tokio::select! {
                biased;
                _ = done.cancelled() => break,
                route = routes.recv(), if routes_open => match route {
                    Some(route) => self.register(route),
                    None => routes_open = false,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle(command),
                    None => commands_open = false,
                },
            }
        }
        debug!("epoch switcher stopped");
    }

    fn register(&mut self, route: EpochRoute) {
        info!("node {} now routes to epoch {}", route.node_id, route.epoch.ordinal);
        self.routes.insert(route.node_id, (route.epoch, route.handle));
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RouteOrder {
                node_id,
                fragment,
                reply,
            } => {
                let handle = match self.routes.get(&node_id) {
                    Some((_, handle)) if handle.is_live() => handle.clone(),
                    Some(_) => {
                        debug!("evicting stopped route for {}", node_id);
                        self.routes.remove(&node_id);
                        let _ = reply.send(Err(DarknodeError::NoRoute(node_id.to_string())));
                        return;
                    }
                    None => {
                        let _ = reply.send(Err(DarknodeError::NoRoute(node_id.to_string())));
                        return;
                    }
                };
                // Delivery may wait on the process, the switcher must not.
                tokio::spawn(async move {
                    let _ = reply.send(handle.send_order(fragment).await);
                });
            }
            Command::Routes { reply } => {
                self.routes.retain(|_, (_, handle)| handle.is_live());
                let mut live: Vec<(NodeId, Epoch)> = self
                    .routes
                    .iter()
                    .map(|(id, (epoch, _))| (*id, epoch.clone()))
                    .collect();
                live.sort_by_key(|(id, _)| *id);
                let _ = reply.send(live);
            }
        }
    }
}

#[derive(Clone)]
pub struct SwitcherHandle {
    commands: mpsc::Sender<Command>,
}

impl SwitcherHandle {
    /// Delivers `fragment` to the live epoch process of `node_id`.
    pub async fn route_order(&self, node_id: NodeId, fragment: OrderFragment) -> Result<(), DarknodeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::RouteOrder {
                node_id,
                fragment,
                reply,
            })
            .await
            .map_err(|_| DarknodeError::NoRoute(format!("{} (switcher stopped)", node_id)))?;
        response
            .await
            .map_err(|_| DarknodeError::NoRoute(format!("{} (switcher stopped)", node_id)))?
    }

    /// Live routes, ordered by node id.
    pub async fn routes(&self) -> Result<Vec<(NodeId, Epoch)>, DarknodeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Routes { reply })
            .await
            .map_err(|_| DarknodeError::Unavailable("switcher stopped".to_string()))?;
        response
            .await
            .map_err(|_| DarknodeError::Unavailable("switcher stopped".to_string()))
    }
}
