// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::table::RoutingTable;

use gm_comms::Comm;
use gm_interface::{
    messaging::WireMsg,
    types::{Cache, NodeId},
};

use std::sync::Arc;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// What happened to a message handed to the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The message was addressed to us.
    DeliveredLocal,
    /// Forwarded towards its destination via the named next hop.
    Forwarded(NodeId),
    /// Fanned out to this many neighbors.
    Broadcast(usize),
    /// Dropped, with the reason.
    Dropped(DropReason),
}

/// Why the router dropped a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Seen this message id before.
    Duplicate,
    /// Hop budget exhausted.
    TtlExpired,
    /// No route to the destination.
    NoRoute,
    /// A route exists but its next hop has no connection.
    NoConnection,
}

/// Forwards non-local messages via the routing table and connection pool.
///
/// Loop suppression: every message id the router sees is cached; duplicates
/// are dropped. A background sweep evicts entries past their retention.
pub struct MeshRouter {
    node_id: NodeId,
    table: Arc<RoutingTable>,
    comm: Comm,
    seen: Mutex<Cache<String, ()>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MeshRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MeshRouter")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl MeshRouter {
    pub fn new(
        node_id: &str,
        table: Arc<RoutingTable>,
        comm: Comm,
        seen_msg_ttl: Duration,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            table,
            comm,
            seen: Mutex::new(Cache::with_expiry_duration(seen_msg_ttl)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Record a message id; returns `false` if it was already seen.
    async fn first_sighting(&self, msg_id: &str) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.contains_key(&msg_id.to_string()) {
            return false;
        }
        let _prev = seen.insert(msg_id.to_string(), (), None);
        true
    }

    /// Route one message: deliver, forward, broadcast, or drop.
    pub async fn route_message(&self, mut msg: WireMsg) -> RouteOutcome {
        if msg.recipient.as_deref() == Some(self.node_id.as_str()) {
            return RouteOutcome::DeliveredLocal;
        }

        if !self.first_sighting(&msg.msg_id).await {
            debug!("Dropping duplicate message {}", msg.msg_id);
            return RouteOutcome::Dropped(DropReason::Duplicate);
        }

        if !msg.decrement_ttl() {
            warn!("Dropping message {}: TTL expired", msg.msg_id);
            return RouteOutcome::Dropped(DropReason::TtlExpired);
        }

        if msg.is_broadcast() {
            return self.fan_out(msg).await;
        }

        let destination = msg.recipient.clone().unwrap_or_default();
        let route = match self.table.get_route(&destination).await {
            Some(route) => route,
            None => {
                warn!("No route to destination {destination}");
                return RouteOutcome::Dropped(DropReason::NoRoute);
            }
        };
        match self.comm.send_to(&route.next_hop, msg).await {
            Ok(()) => {
                debug!("Forwarded message to {destination} via {}", route.next_hop);
                RouteOutcome::Forwarded(route.next_hop)
            }
            Err(err) => {
                warn!("Failed to forward to {}: {err}", route.next_hop);
                RouteOutcome::Dropped(DropReason::NoConnection)
            }
        }
    }

    /// Forward a broadcast to every direct neighbor except the sender.
    async fn fan_out(&self, msg: WireMsg) -> RouteOutcome {
        let neighbors: Vec<NodeId> = self
            .table
            .neighbors()
            .await
            .into_iter()
            .filter(|peer| *peer != msg.sender)
            .collect();

        let mut sent = 0;
        for peer in neighbors {
            match self.comm.send_to(&peer, msg.clone()).await {
                Ok(()) => sent += 1,
                Err(err) => debug!("Failed to broadcast to {peer}: {err}"),
            }
        }
        trace!("Broadcast {} reached {sent} peers", msg.msg_id);
        RouteOutcome::Broadcast(sent)
    }

    /// Wrap bytes in a DATA message and route it.
    pub async fn send_to(&self, destination: &str, bytes: &[u8], ttl: u8) -> RouteOutcome {
        let msg = WireMsg::data(&self.node_id, destination, bytes, ttl);
        self.route_message(msg).await
    }

    /// Number of ids currently held for loop suppression.
    pub async fn seen_count(&self) -> usize {
        self.seen.lock().await.len()
    }

    /// Start the periodic seen-cache sweep.
    pub async fn start(self: &Arc<Self>, sweep_interval: Duration) {
        let router = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = router.cancel.cancelled() => break,
                    _ = tokio::time::sleep(sweep_interval) => {}
                }
                router.seen.lock().await.remove_expired();
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Cancel the sweep and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = { self.tasks.lock().await.drain(..).collect() };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gm_comms::{CommEvent, ConnectionConfig, MemoryTransport};
    use gm_interface::messaging::MsgType;
    use gm_interface::now_secs;
    use tokio::sync::mpsc;

    fn setup() -> (MeshRouter, Comm, mpsc::Receiver<CommEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let comm = Comm::new("self", 50, ConnectionConfig::default(), tx);
        let table = Arc::new(RoutingTable::new("self", 10));
        let router = MeshRouter::new("self", table, comm.clone(), Duration::from_secs(300));
        (router, comm, rx)
    }

    async fn link(comm: &Comm, peer: &str) {
        let (ours, _theirs) = MemoryTransport::pair(64);
        // keep the far end alive so sends do not observe a closed channel
        std::mem::forget(_theirs);
        comm.add_connection(peer, Box::new(ours))
            .await
            .expect("connection")
            .set_established()
            .await;
    }

    #[tokio::test]
    async fn local_messages_are_delivered() {
        let (router, _comm, _rx) = setup();
        let msg = WireMsg::data("peer", "self", b"hi", 10);
        assert_eq!(router.route_message(msg).await, RouteOutcome::DeliveredLocal);
    }

    #[tokio::test]
    async fn duplicate_broadcast_fans_out_once() {
        let (router, comm, _rx) = setup();
        router.table.add_neighbor("n1", 1, now_secs()).await;
        link(&comm, "n1").await;

        let msg = WireMsg::new(MsgType::PeerAnnounce, "peer", None, serde_json::json!({}));
        assert_eq!(
            router.route_message(msg.clone()).await,
            RouteOutcome::Broadcast(1)
        );
        assert_eq!(
            router.route_message(msg).await,
            RouteOutcome::Dropped(DropReason::Duplicate)
        );
    }

    #[tokio::test]
    async fn ttl_exhaustion_drops() {
        let (router, _comm, _rx) = setup();
        let mut msg = WireMsg::data("peer", "far", b"hi", 10);
        msg.ttl = 1;
        assert_eq!(
            router.route_message(msg).await,
            RouteOutcome::Dropped(DropReason::TtlExpired)
        );
    }

    #[tokio::test]
    async fn unicast_without_route_drops() {
        let (router, _comm, _rx) = setup();
        let msg = WireMsg::data("peer", "far", b"hi", 10);
        assert_eq!(
            router.route_message(msg).await,
            RouteOutcome::Dropped(DropReason::NoRoute)
        );
    }

    #[tokio::test]
    async fn unicast_follows_the_routing_table() {
        let (router, comm, _rx) = setup();
        let now = now_secs();
        router.table.add_neighbor("n1", 1, now).await;
        assert!(router.table.update_route("far", 1, 3, "n1", now).await);
        link(&comm, "n1").await;

        let msg = WireMsg::data("peer", "far", b"hi", 10);
        assert_eq!(
            router.route_message(msg).await,
            RouteOutcome::Forwarded("n1".to_string())
        );
    }

    #[tokio::test]
    async fn broadcast_excludes_the_sender() {
        let (router, comm, _rx) = setup();
        let now = now_secs();
        router.table.add_neighbor("n1", 1, now).await;
        router.table.add_neighbor("n2", 1, now).await;
        link(&comm, "n1").await;
        link(&comm, "n2").await;

        let msg = WireMsg::new(MsgType::PeerAnnounce, "n1", None, serde_json::json!({}));
        assert_eq!(router.route_message(msg).await, RouteOutcome::Broadcast(1));
    }
}
