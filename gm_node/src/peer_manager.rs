// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The known-peer table: reputation, blacklisting and connection limits.

use super::error::{Error, Result};

use gm_comms::Comm;
use gm_interface::{messaging::PeerEntry, now_secs, types::NodeId};

use rand::seq::SliceRandom;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
    task::JoinHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Reputation below which a peer is blacklisted.
const REPUTATION_BLACKLIST_FLOOR: f64 = 0.1;
/// Consecutive connection failures that trigger a blacklist.
const MAX_FAILED_ATTEMPTS: u32 = 5;
/// Reputation lost per failed connection attempt.
const FAILURE_PENALTY: f64 = 0.1;

/// Everything we track about one peer.
#[derive(Clone, Debug)]
pub struct PeerState {
    /// The gossiped view of the peer.
    pub entry: PeerEntry,
    /// Whether this is a bootstrap/relay anchor.
    pub is_anchor: bool,
    /// Consecutive failed connection attempts.
    pub failed_attempts: u32,
    /// Total connection attempts.
    pub connection_attempts: u32,
    /// Last attempt, UNIX seconds.
    pub last_attempt: Option<u64>,
    /// Blacklist expiry, UNIX seconds.
    pub blacklisted_until: Option<u64>,
}

impl PeerState {
    fn new(entry: PeerEntry, is_anchor: bool) -> Self {
        Self {
            entry,
            is_anchor,
            failed_attempts: 0,
            connection_attempts: 0,
            last_attempt: None,
            blacklisted_until: None,
        }
    }

    /// Whether the peer is currently blacklisted.
    pub fn is_blacklisted(&self, now: u64) -> bool {
        matches!(self.blacklisted_until, Some(until) if now < until)
    }
}

/// Aggregate view for health and metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeerStats {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub anchor_peers: usize,
    pub blacklisted_peers: usize,
    pub avg_reputation: f64,
}

/// Manages peer lifecycle, reputation and connection limits.
///
/// Invariants: self is never stored; blacklisted peers cannot be readmitted
/// until their blacklist expires; the table never exceeds `max_peers` and
/// anchors never exceed `max_anchors`; reputation stays in [0, 1]. The
/// table lock is held per update only, never across an await on I/O.
pub struct PeerManager {
    node_id: NodeId,
    max_peers: usize,
    max_anchors: usize,
    blacklist_duration: Duration,
    comm: Comm,
    peers: RwLock<HashMap<NodeId, PeerState>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let peers = self.peers.try_read().map(|guard| guard.len()).ok();
        f.debug_struct("PeerManager")
            .field("node_id", &self.node_id)
            .field("peers", &peers)
            .finish()
    }
}

impl PeerManager {
    pub fn new(
        node_id: &str,
        max_peers: usize,
        max_anchors: usize,
        blacklist_duration: Duration,
        comm: Comm,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            max_peers,
            max_anchors,
            blacklist_duration,
            comm,
            peers: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, PeerState>> {
        self.peers.read().await
    }

    async fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, PeerState>> {
        self.peers.write().await
    }

    /// Add or refresh a peer.
    ///
    /// `Ok(false)` means the peer was skipped (ourselves, or currently
    /// blacklisted); a full table is a capacity error.
    pub async fn add_peer(&self, entry: PeerEntry, is_anchor: bool) -> Result<bool> {
        if entry.node_id == self.node_id {
            return Ok(false);
        }
        let now = now_secs();
        let mut peers = self.write().await;

        if let Some(existing) = peers.get_mut(&entry.node_id) {
            if existing.is_blacklisted(now) {
                warn!("Peer {} is blacklisted, not readmitting", entry.node_id);
                return Ok(false);
            }
            existing.entry = entry;
            existing.is_anchor = is_anchor || existing.is_anchor;
            return Ok(true);
        }

        if is_anchor {
            let anchors = peers.values().filter(|p| p.is_anchor).count();
            if anchors >= self.max_anchors {
                return Err(Error::Capacity(format!(
                    "anchor limit {} reached",
                    self.max_anchors
                )));
            }
        }
        if peers.len() >= self.max_peers {
            return Err(Error::Capacity(format!(
                "peer limit {} reached",
                self.max_peers
            )));
        }

        info!("Added peer {} (anchor={is_anchor})", entry.node_id);
        let _prev = peers.insert(entry.node_id.clone(), PeerState::new(entry, is_anchor));
        Ok(true)
    }

    /// Replace a bootstrap placeholder with the real identity learned in
    /// the handshake. Keeps the anchor flag and drops the placeholder row.
    pub async fn replace_placeholder(&self, placeholder_id: &str, entry: PeerEntry) -> Result<bool> {
        let was_anchor = {
            let mut peers = self.write().await;
            peers
                .remove(placeholder_id)
                .map(|state| state.is_anchor)
                .unwrap_or(false)
        };
        self.add_peer(entry, was_anchor).await
    }

    /// Drop a peer and close any connection to it.
    pub async fn remove_peer(&self, peer_id: &str) {
        let removed = self.write().await.remove(peer_id);
        if removed.is_some() {
            self.comm.remove(peer_id).await;
            info!("Removed peer {peer_id}");
        }
    }

    pub async fn get_peer(&self, peer_id: &str) -> Option<PeerState> {
        self.read().await.get(peer_id).cloned()
    }

    pub async fn known_peers(&self) -> Vec<PeerState> {
        self.read().await.values().cloned().collect()
    }

    /// Peers with an established connection right now.
    pub async fn connected_peers(&self) -> Vec<PeerState> {
        let established = self.comm.established_peers().await;
        let peers = self.read().await;
        established
            .iter()
            .filter_map(|id| peers.get(id).cloned())
            .collect()
    }

    pub async fn anchor_peers(&self) -> Vec<PeerState> {
        self.read()
            .await
            .values()
            .filter(|p| p.is_anchor)
            .cloned()
            .collect()
    }

    /// Refresh `last_seen` after hearing from a peer.
    pub async fn mark_seen(&self, peer_id: &str) {
        if let Some(state) = self.write().await.get_mut(peer_id) {
            state.entry.last_seen = now_secs();
        }
    }

    /// Nudge reputation by `delta`, clamped to [0, 1]. A peer dropping
    /// below the floor is blacklisted.
    pub async fn update_reputation(&self, peer_id: &str, delta: f64) {
        let fell_below_floor = {
            let mut peers = self.write().await;
            match peers.get_mut(peer_id) {
                Some(state) => {
                    state.entry.reputation = (state.entry.reputation + delta).clamp(0.0, 1.0);
                    state.entry.reputation < REPUTATION_BLACKLIST_FLOOR
                }
                None => false,
            }
        };
        if fell_below_floor {
            self.blacklist_peer(peer_id).await;
        }
    }

    /// Blacklist a peer for the configured duration and disconnect it.
    pub async fn blacklist_peer(&self, peer_id: &str) {
        {
            let mut peers = self.write().await;
            match peers.get_mut(peer_id) {
                Some(state) => {
                    state.blacklisted_until = Some(now_secs() + self.blacklist_duration.as_secs());
                }
                None => return,
            }
        }
        warn!(
            "Blacklisted peer {peer_id} for {}s",
            self.blacklist_duration.as_secs()
        );
        self.comm.remove(peer_id).await;
    }

    /// Whether a peer is currently blacklisted.
    pub async fn is_blacklisted(&self, peer_id: &str) -> bool {
        self.read()
            .await
            .get(peer_id)
            .map(|state| state.is_blacklisted(now_secs()))
            .unwrap_or(false)
    }

    /// Record the outcome of a connection attempt.
    ///
    /// Failures cost reputation; enough consecutive ones blacklist.
    pub async fn record_attempt(&self, peer_id: &str, success: bool) {
        let failures = {
            let mut peers = self.write().await;
            match peers.get_mut(peer_id) {
                Some(state) => {
                    state.connection_attempts += 1;
                    state.last_attempt = Some(now_secs());
                    if success {
                        state.failed_attempts = 0;
                        state.entry.last_seen = now_secs();
                        0
                    } else {
                        state.failed_attempts += 1;
                        state.failed_attempts
                    }
                }
                None => return,
            }
        };
        if !success {
            self.update_reputation(peer_id, -FAILURE_PENALTY).await;
            if failures >= MAX_FAILED_ATTEMPTS {
                self.blacklist_peer(peer_id).await;
            }
        }
    }

    /// A uniform sample of shareable peers: reputable and not blacklisted.
    pub async fn peers_for_discovery(&self, count: usize) -> Vec<PeerEntry> {
        let now = now_secs();
        let mut candidates: Vec<_> = self
            .read()
            .await
            .values()
            .filter(|p| p.entry.reputation > 0.5 && !p.is_blacklisted(now))
            .map(|p| p.entry.clone())
            .collect();
        if candidates.len() <= count {
            return candidates;
        }
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates.truncate(count);
        candidates
    }

    /// Connected peers ranked best-first: reputation descending, then
    /// live round-trip latency ascending.
    pub async fn best_peers(&self, count: usize, role_filter: Option<&str>) -> Vec<PeerState> {
        let mut candidates: Vec<_> = self
            .connected_peers()
            .await
            .into_iter()
            .filter(|p| match role_filter {
                Some(role) => p.entry.roles.iter().any(|r| r == role),
                None => true,
            })
            .map(|mut state| {
                if let Some(conn) = self.comm.get(&state.entry.node_id) {
                    state.entry.latency_ms = conn.stats().latency_ms;
                }
                state
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.entry
                .reputation
                .partial_cmp(&a.entry.reputation)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_latency = a.entry.latency_ms.unwrap_or(f64::MAX);
                    let b_latency = b.entry.latency_ms.unwrap_or(f64::MAX);
                    a_latency
                        .partial_cmp(&b_latency)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        candidates.truncate(count);
        candidates
    }

    /// Drop peers not seen within `max_age` and not currently connected.
    pub async fn prune_stale(&self, max_age: Duration) -> usize {
        let now = now_secs();
        let established = self.comm.established_peers().await;
        let stale: Vec<NodeId> = self
            .read()
            .await
            .iter()
            .filter(|(id, state)| {
                now.saturating_sub(state.entry.last_seen) > max_age.as_secs()
                    && !established.contains(id)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for peer_id in &stale {
            info!("Removing stale peer {peer_id}");
            self.remove_peer(peer_id).await;
        }
        stale.len()
    }

    pub async fn stats(&self) -> PeerStats {
        let now = now_secs();
        let connected = self.comm.established_peers().await.len();
        let peers = self.read().await;
        let total = peers.len();
        let avg = if total == 0 {
            1.0
        } else {
            peers.values().map(|p| p.entry.reputation).sum::<f64>() / total as f64
        };
        PeerStats {
            total_peers: total,
            connected_peers: connected,
            anchor_peers: peers.values().filter(|p| p.is_anchor).count(),
            blacklisted_peers: peers.values().filter(|p| p.is_blacklisted(now)).count(),
            avg_reputation: avg,
        }
    }

    /// Start the periodic stale-peer sweep.
    pub async fn start(self: &Arc<Self>, sweep_interval: Duration, stale_age: Duration) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = tokio::time::sleep(sweep_interval) => {}
                }
                let _pruned = manager.prune_stale(stale_age).await;
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
    use gm_comms::{CommEvent, ConnectionConfig};
    use tokio::sync::mpsc;

    fn entry(id: &str) -> PeerEntry {
        PeerEntry {
            node_id: id.to_string(),
            endpoint: format!("{id}.mesh:443"),
            roles: vec!["role:client".to_string()],
            last_seen: now_secs(),
            reputation: 1.0,
            latency_ms: None,
        }
    }

    fn manager(max_peers: usize, max_anchors: usize) -> PeerManager {
        let (tx, _rx): (mpsc::Sender<CommEvent>, _) = mpsc::channel(8);
        let comm = Comm::new("self", 50, ConnectionConfig::default(), tx);
        PeerManager::new(
            "self",
            max_peers,
            max_anchors,
            Duration::from_secs(300),
            comm,
        )
    }

    #[tokio::test]
    async fn never_stores_self() {
        let manager = manager(10, 2);
        assert!(!manager.add_peer(entry("self"), false).await.expect("add"));
        assert_eq!(manager.known_peers().await.len(), 0);
    }

    #[tokio::test]
    async fn enforces_peer_and_anchor_limits() {
        let manager = manager(2, 1);
        assert!(manager.add_peer(entry("a"), true).await.expect("add"));
        assert_matches::assert_matches!(
            manager.add_peer(entry("b"), true).await,
            Err(Error::Capacity(_))
        );
        assert!(manager.add_peer(entry("b"), false).await.expect("add"));
        assert_matches::assert_matches!(
            manager.add_peer(entry("c"), false).await,
            Err(Error::Capacity(_))
        );
    }

    #[tokio::test]
    async fn reputation_is_clamped_and_floor_blacklists() {
        let manager = manager(10, 2);
        assert!(manager.add_peer(entry("a"), false).await.expect("add"));

        manager.update_reputation("a", 0.5).await;
        assert_eq!(
            manager.get_peer("a").await.expect("peer").entry.reputation,
            1.0
        );

        manager.update_reputation("a", -0.95).await;
        let state = manager.get_peer("a").await.expect("peer");
        assert!(state.entry.reputation < REPUTATION_BLACKLIST_FLOOR);
        assert!(state.is_blacklisted(now_secs()));

        // blacklisted peers are not readmitted
        assert!(!manager.add_peer(entry("a"), false).await.expect("add"));
    }

    #[tokio::test]
    async fn five_failures_blacklist() {
        let manager = manager(10, 2);
        assert!(manager.add_peer(entry("a"), false).await.expect("add"));
        for _ in 0..4 {
            manager.record_attempt("a", false).await;
            assert!(!manager.is_blacklisted("a").await);
        }
        manager.record_attempt("a", false).await;
        assert!(manager.is_blacklisted("a").await);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let manager = manager(10, 2);
        assert!(manager.add_peer(entry("a"), false).await.expect("add"));
        for _ in 0..3 {
            manager.record_attempt("a", false).await;
        }
        manager.record_attempt("a", true).await;
        assert_eq!(
            manager.get_peer("a").await.expect("peer").failed_attempts,
            0
        );
    }

    #[tokio::test]
    async fn discovery_sample_excludes_disreputable() {
        let manager = manager(10, 2);
        assert!(manager.add_peer(entry("good"), false).await.expect("add"));
        assert!(manager.add_peer(entry("bad"), false).await.expect("add"));
        manager.update_reputation("bad", -0.6).await;

        let sample = manager.peers_for_discovery(10).await;
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].node_id, "good");
    }

    #[tokio::test]
    async fn placeholder_is_replaced_by_real_identity() {
        let manager = manager(10, 2);
        let mut placeholder = entry("anchor-a.mesh:443");
        placeholder.roles = vec!["role:anchor".to_string()];
        assert!(manager.add_peer(placeholder, true).await.expect("add"));

        assert!(manager
            .replace_placeholder("anchor-a.mesh:443", entry("real-node"))
            .await
            .expect("replace"));
        assert!(manager.get_peer("anchor-a.mesh:443").await.is_none());
        let state = manager.get_peer("real-node").await.expect("peer");
        assert!(state.is_anchor, "anchor flag survives the rewrite");
    }
}
