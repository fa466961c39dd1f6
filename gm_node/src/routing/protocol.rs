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
    messaging::{RouteAnnouncePayload, RouteEntry, RouteWithdrawPayload, WireMsg},
    now_secs,
    types::NodeId,
};

use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;

/// Delay before the first announcement, so the handshake settles.
const INITIAL_ANNOUNCE_DELAY: Duration = Duration::from_secs(5);

/// The periodic side of the routing protocol.
///
/// Each cycle bumps our local sequence and sends every neighbor a
/// split-horizon view: our own entry plus every route not concerning that
/// neighbor. A separate maintenance task expires stale routes.
pub struct RoutingProtocol {
    node_id: NodeId,
    table: Arc<RoutingTable>,
    comm: Comm,
    route_timeout: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RoutingProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RoutingProtocol")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl RoutingProtocol {
    pub fn new(
        node_id: &str,
        table: Arc<RoutingTable>,
        comm: Comm,
        route_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            table,
            comm,
            route_timeout,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Advertise to every neighbor. One cycle of the announce loop.
    pub async fn announce_routes(&self) {
        let neighbors = self.table.neighbors().await;
        if neighbors.is_empty() {
            return;
        }
        let sequence = self.table.bump_local_sequence().await;
        let now = now_secs();

        for neighbor in neighbors {
            let mut entries = vec![RouteEntry {
                destination: self.node_id.clone(),
                next_hop: self.node_id.clone(),
                metric: 0,
                sequence,
                timestamp: now,
            }];
            entries.extend(
                self.table
                    .routes_to_announce(&neighbor)
                    .await
                    .into_iter()
                    .map(|route| RouteEntry {
                        destination: route.destination,
                        next_hop: self.node_id.clone(),
                        metric: route.metric,
                        sequence: route.sequence,
                        timestamp: route.timestamp,
                    }),
            );

            let msg = match WireMsg::route_announce(&self.node_id, entries) {
                Ok(mut msg) => {
                    msg.recipient = Some(neighbor.clone());
                    msg
                }
                Err(err) => {
                    error!("Failed to build route announce: {err}");
                    return;
                }
            };
            if let Err(err) = self.comm.send_to(&neighbor, msg).await {
                debug!("Failed to announce routes to {neighbor}: {err}");
            }
        }
    }

    /// Apply an inbound `route_announce` or `route_update`.
    pub async fn handle_route_announce(&self, msg: &WireMsg) -> usize {
        let payload: RouteAnnouncePayload = match msg.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Undecodable route announce from {}: {err}", msg.sender);
                return 0;
            }
        };
        trace!(
            "Received {} routes from {}",
            payload.routes.len(),
            msg.sender
        );

        let now = now_secs();
        let mut updated = 0;
        for entry in payload.routes {
            if entry.destination == self.node_id {
                continue;
            }
            // a route that already goes through us would loop
            if entry.next_hop == self.node_id {
                continue;
            }
            if self
                .table
                .update_route(
                    &entry.destination,
                    entry.metric,
                    entry.sequence,
                    &msg.sender,
                    now,
                )
                .await
            {
                updated += 1;
            }
        }
        if updated > 0 {
            debug!("Updated {updated} routes from {}", msg.sender);
        }
        updated
    }

    /// Apply an inbound `route_withdraw`. Advisory: we drop matching routes
    /// learned from the withdrawing peer rather than waiting out the age.
    pub async fn handle_route_withdraw(&self, msg: &WireMsg) -> usize {
        let payload: RouteWithdrawPayload = match msg.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Undecodable route withdraw from {}: {err}", msg.sender);
                return 0;
            }
        };
        let removed = self.table.withdraw(&payload.destinations, &msg.sender).await;
        if removed > 0 {
            info!("Withdrew {removed} routes on notice from {}", msg.sender);
        }
        removed
    }

    /// Broadcast a withdraw for destinations we can no longer reach.
    pub async fn send_withdraw(&self, destinations: Vec<NodeId>) {
        if destinations.is_empty() {
            return;
        }
        match WireMsg::route_withdraw(&self.node_id, destinations) {
            Ok(msg) => {
                let _sent = self.comm.broadcast(&msg, &Default::default()).await;
            }
            Err(err) => error!("Failed to build route withdraw: {err}"),
        }
    }

    /// Trigger an immediate announcement outside the periodic cycle.
    pub async fn trigger_update(&self) {
        self.announce_routes().await;
    }

    /// Start the announce and maintenance tasks.
    pub async fn start(self: &Arc<Self>, announce_interval: Duration, cleanup_interval: Duration) {
        let protocol = self.clone();
        let announce = tokio::spawn(async move {
            tokio::select! {
                _ = protocol.cancel.cancelled() => return,
                _ = tokio::time::sleep(INITIAL_ANNOUNCE_DELAY) => {}
            }
            loop {
                protocol.announce_routes().await;
                tokio::select! {
                    _ = protocol.cancel.cancelled() => break,
                    _ = tokio::time::sleep(announce_interval) => {}
                }
            }
        });

        let protocol = self.clone();
        let cleanup = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = protocol.cancel.cancelled() => break,
                    _ = tokio::time::sleep(cleanup_interval) => {}
                }
                let removed = protocol
                    .table
                    .cleanup_stale(protocol.route_timeout.as_secs(), now_secs())
                    .await;
                if removed > 0 {
                    info!("Cleaned up {removed} stale routes");
                }
            }
        });

        self.tasks.lock().await.extend([announce, cleanup]);
    }

    /// Cancel both tasks and wait for them to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = { self.tasks.lock().await.drain(..).collect() };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
