// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use gm_interface::types::NodeId;

use std::collections::HashMap;
use tokio::sync::{RwLock, RwLockWriteGuard};

/// Marker for routes created by neighbor admission rather than learned
/// from an advertisement.
pub const LEARNED_DIRECT: &str = "direct";

/// A route to one destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub destination: NodeId,
    /// Always a direct neighbor.
    pub next_hop: NodeId,
    /// Effective cost: advertised metric plus the neighbor link metric.
    pub metric: u32,
    /// Destination sequence number; newer strictly dominates.
    pub sequence: u64,
    /// When the route was installed, UNIX seconds.
    pub timestamp: u64,
    /// The peer that advertised it, or [`LEARNED_DIRECT`].
    pub learned_from: NodeId,
}

/// Aggregate view for health and metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RouteStats {
    pub total_routes: usize,
    pub direct_neighbors: usize,
    pub avg_metric: f64,
}

#[derive(Default)]
struct Inner {
    routes: HashMap<NodeId, Route>,
    /// Direct neighbors and their link metrics.
    neighbors: HashMap<NodeId, u32>,
    local_sequence: u64,
}

/// Distance-vector routing with per-destination sequence numbers.
///
/// Acceptance rule for an advertisement (destination D, sequence S, metric M,
/// from neighbor N): reject when D is us, N is not a neighbor, or
/// M + link(N) exceeds the metric ceiling; otherwise accept iff no route
/// exists, S is newer, or S ties with a strictly better effective metric.
/// The table lock is held per update only, never across an await.
pub struct RoutingTable {
    node_id: NodeId,
    max_metric: u32,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let (routes, neighbors) = self
            .inner
            .try_read()
            .map(|inner| (inner.routes.len(), inner.neighbors.len()))
            .unwrap_or_default();
        f.debug_struct("RoutingTable")
            .field("node_id", &self.node_id)
            .field("routes", &routes)
            .field("neighbors", &neighbors)
            .finish()
    }
}

impl RoutingTable {
    pub fn new(node_id: &str, max_metric: u32) -> Self {
        Self {
            node_id: node_id.to_string(),
            max_metric,
            inner: RwLock::new(Inner::default()),
        }
    }

    async fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().await
    }

    /// Admit a direct neighbor, installing its link route.
    ///
    /// The direct route carries sequence 0 so the neighbor's own first
    /// self-advertisement supersedes it with the real sequence.
    pub async fn add_neighbor(&self, peer_id: &str, link_metric: u32, now: u64) {
        let mut inner = self.write().await;
        let _prev = inner.neighbors.insert(peer_id.to_string(), link_metric);
        let _prev = inner.routes.insert(
            peer_id.to_string(),
            Route {
                destination: peer_id.to_string(),
                next_hop: peer_id.to_string(),
                metric: link_metric,
                sequence: 0,
                timestamp: now,
                learned_from: LEARNED_DIRECT.to_string(),
            },
        );
        info!("Added neighbor {peer_id} with metric {link_metric}");
    }

    /// Remove a neighbor and every route through it.
    ///
    /// Returns the destinations that just became unreachable, so the caller
    /// can emit a withdraw.
    pub async fn remove_neighbor(&self, peer_id: &str) -> Vec<NodeId> {
        let mut inner = self.write().await;
        let _prev = inner.neighbors.remove(peer_id);
        let invalidated: Vec<NodeId> = inner
            .routes
            .iter()
            .filter(|(_, route)| route.next_hop == peer_id)
            .map(|(dest, _)| dest.clone())
            .collect();
        for dest in &invalidated {
            let _prev = inner.routes.remove(dest);
        }
        info!(
            "Removed neighbor {peer_id}, invalidated {} routes",
            invalidated.len()
        );
        invalidated
    }

    /// Apply one inbound advertisement. Returns whether it was installed.
    pub async fn update_route(
        &self,
        destination: &str,
        advertised_metric: u32,
        sequence: u64,
        from_neighbor: &str,
        now: u64,
    ) -> bool {
        if destination == self.node_id {
            return false;
        }
        let mut inner = self.write().await;

        let link = match inner.neighbors.get(from_neighbor) {
            Some(link) => *link,
            None => {
                debug!("Ignoring route to {destination}: {from_neighbor} is not a neighbor");
                return false;
            }
        };
        let effective_metric = advertised_metric.saturating_add(link);
        if effective_metric > self.max_metric {
            return false;
        }

        if let Some(existing) = inner.routes.get(destination) {
            let newer = sequence > existing.sequence;
            let better = sequence == existing.sequence && effective_metric < existing.metric;
            if !(newer || better) {
                return false;
            }
        }

        debug!(
            "Updated route to {destination} via {from_neighbor} \
             (metric={effective_metric}, seq={sequence})"
        );
        let _prev = inner.routes.insert(
            destination.to_string(),
            Route {
                destination: destination.to_string(),
                next_hop: from_neighbor.to_string(),
                metric: effective_metric,
                sequence,
                timestamp: now,
                learned_from: from_neighbor.to_string(),
            },
        );
        true
    }

    pub async fn get_route(&self, destination: &str) -> Option<Route> {
        self.inner.read().await.routes.get(destination).cloned()
    }

    pub async fn next_hop(&self, destination: &str) -> Option<NodeId> {
        self.get_route(destination).await.map(|route| route.next_hop)
    }

    pub async fn all_routes(&self) -> Vec<Route> {
        self.inner.read().await.routes.values().cloned().collect()
    }

    /// The routes worth advertising to `neighbor`: everything except routes
    /// to or through that neighbor (split horizon).
    pub async fn routes_to_announce(&self, neighbor: &str) -> Vec<Route> {
        self.inner
            .read()
            .await
            .routes
            .values()
            .filter(|route| route.destination != neighbor && route.next_hop != neighbor)
            .cloned()
            .collect()
    }

    pub async fn neighbors(&self) -> Vec<NodeId> {
        self.inner.read().await.neighbors.keys().cloned().collect()
    }

    pub async fn is_neighbor(&self, peer_id: &str) -> bool {
        self.inner.read().await.neighbors.contains_key(peer_id)
    }

    /// Drop non-neighbor routes older than `timeout_secs`.
    ///
    /// Direct-neighbor routes never expire by age; only explicit neighbor
    /// removal invalidates them.
    pub async fn cleanup_stale(&self, timeout_secs: u64, now: u64) -> usize {
        let mut inner = self.write().await;
        let stale: Vec<NodeId> = inner
            .routes
            .iter()
            .filter(|(dest, route)| {
                now.saturating_sub(route.timestamp) > timeout_secs
                    && !inner.neighbors.contains_key(*dest)
            })
            .map(|(dest, _)| dest.clone())
            .collect();
        for dest in &stale {
            let _prev = inner.routes.remove(dest);
            debug!("Removed stale route to {dest}");
        }
        stale.len()
    }

    /// Accelerate expiry for withdrawn destinations learned from `peer`.
    pub async fn withdraw(&self, destinations: &[NodeId], from_peer: &str) -> usize {
        let mut inner = self.write().await;
        let mut removed = 0;
        for dest in destinations {
            let matches = inner
                .routes
                .get(dest)
                .map(|route| route.learned_from == from_peer)
                .unwrap_or(false);
            if matches {
                let _prev = inner.routes.remove(dest);
                removed += 1;
            }
        }
        removed
    }

    /// Our own sequence number.
    pub async fn local_sequence(&self) -> u64 {
        self.inner.read().await.local_sequence
    }

    /// Bump and return the local sequence, done whenever we publish an
    /// update about ourselves.
    pub async fn bump_local_sequence(&self) -> u64 {
        let mut inner = self.write().await;
        inner.local_sequence += 1;
        inner.local_sequence
    }

    pub async fn stats(&self) -> RouteStats {
        let inner = self.inner.read().await;
        let total = inner.routes.len();
        let avg = if total == 0 {
            0.0
        } else {
            inner.routes.values().map(|r| r.metric as f64).sum::<f64>() / total as f64
        };
        RouteStats {
            total_routes: total,
            direct_neighbors: inner.neighbors.len(),
            avg_metric: avg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_000_000;

    fn table() -> RoutingTable {
        RoutingTable::new("self", 10)
    }

    #[tokio::test]
    async fn advertisement_from_non_neighbor_is_rejected() {
        let table = table();
        assert!(!table.update_route("far", 1, 5, "stranger", NOW).await);
    }

    #[tokio::test]
    async fn newer_sequence_strictly_dominates() {
        let table = table();
        table.add_neighbor("n1", 1, NOW).await;
        table.add_neighbor("n2", 1, NOW).await;

        assert!(table.update_route("dest", 3, 5, "n1", NOW).await);
        // same sequence, worse metric: rejected
        assert!(!table.update_route("dest", 5, 5, "n2", NOW).await);
        // same sequence, strictly better metric: accepted
        assert!(table.update_route("dest", 1, 5, "n2", NOW).await);
        // older sequence, even with a great metric: rejected
        assert!(!table.update_route("dest", 0, 4, "n1", NOW).await);
        // newer sequence with a worse metric still wins
        assert!(table.update_route("dest", 6, 6, "n1", NOW).await);

        let route = table.get_route("dest").await.expect("route");
        assert_eq!(route.sequence, 6);
        assert_eq!(route.metric, 7);
        assert_eq!(route.next_hop, "n1");
    }

    #[tokio::test]
    async fn effective_metric_includes_link_and_caps() {
        let table = table();
        table.add_neighbor("n1", 2, NOW).await;
        // 9 advertised + 2 link > 10: rejected
        assert!(!table.update_route("dest", 9, 1, "n1", NOW).await);
        assert!(table.update_route("dest", 8, 1, "n1", NOW).await);
        assert_eq!(table.get_route("dest").await.expect("route").metric, 10);
    }

    #[tokio::test]
    async fn next_hops_are_always_neighbors() {
        let table = table();
        table.add_neighbor("n1", 1, NOW).await;
        assert!(table.update_route("dest", 2, 1, "n1", NOW).await);
        for route in table.all_routes().await {
            assert!(table.is_neighbor(&route.next_hop).await);
        }
    }

    #[tokio::test]
    async fn neighbor_removal_invalidates_routes_through_it() {
        let table = table();
        table.add_neighbor("n1", 1, NOW).await;
        assert!(table.update_route("dest", 2, 1, "n1", NOW).await);

        let invalidated = table.remove_neighbor("n1").await;
        assert_eq!(invalidated.len(), 2); // n1 itself and dest
        assert!(table.get_route("dest").await.is_none());
        assert!(table.get_route("n1").await.is_none());
    }

    #[tokio::test]
    async fn direct_routes_survive_age_cleanup() {
        let table = table();
        table.add_neighbor("n1", 1, NOW).await;
        assert!(table.update_route("dest", 2, 1, "n1", NOW).await);

        let removed = table.cleanup_stale(300, NOW + 301).await;
        assert_eq!(removed, 1);
        assert!(table.get_route("dest").await.is_none());
        assert!(table.get_route("n1").await.is_some());
    }

    #[tokio::test]
    async fn split_horizon_announcement_set() {
        let table = table();
        table.add_neighbor("n1", 1, NOW).await;
        table.add_neighbor("n2", 1, NOW).await;
        assert!(table.update_route("dest", 2, 1, "n2", NOW).await);

        let to_n1: Vec<_> = table
            .routes_to_announce("n1")
            .await
            .into_iter()
            .map(|r| r.destination)
            .collect();
        assert!(to_n1.contains(&"n2".to_string()));
        assert!(to_n1.contains(&"dest".to_string()));
        assert!(!to_n1.contains(&"n1".to_string()));

        // dest routes via n2, so it is not offered back to n2
        let to_n2: Vec<_> = table
            .routes_to_announce("n2")
            .await
            .into_iter()
            .map(|r| r.destination)
            .collect();
        assert!(!to_n2.contains(&"dest".to_string()));
    }

    #[tokio::test]
    async fn withdraw_only_affects_routes_from_the_withdrawer() {
        let table = table();
        table.add_neighbor("n1", 1, NOW).await;
        table.add_neighbor("n2", 1, NOW).await;
        assert!(table.update_route("d1", 2, 1, "n1", NOW).await);
        assert!(table.update_route("d2", 2, 1, "n2", NOW).await);

        let removed = table
            .withdraw(&["d1".to_string(), "d2".to_string()], "n1")
            .await;
        assert_eq!(removed, 1);
        assert!(table.get_route("d1").await.is_none());
        assert!(table.get_route("d2").await.is_some());
    }
}
