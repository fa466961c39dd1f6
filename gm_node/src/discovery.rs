// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Peer discovery: anchor bootstrap plus gossip-style peer exchange.

use super::error::Result;
use super::peer_manager::PeerManager;

use gm_comms::Comm;
use gm_interface::{
    messaging::{PeerEntry, PeerListPayload, WireMsg},
    now_secs,
    types::NodeId,
};

use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;

/// How many non-anchor peers get a peer-list request per gossip round.
const GOSSIP_REGULAR_TARGETS: usize = 3;
/// Sample size for outgoing peer lists.
const GOSSIP_SAMPLE_SIZE: usize = 10;

/// Establishes a connection to `endpoint` and runs the handshake.
/// Injected by the node, which owns the connect-and-handshake flow.
pub type ConnectFn =
    Arc<dyn Fn(String, PeerEntry) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Observer fired for every previously unknown peer.
pub type PeerObserver = Arc<dyn Fn(PeerEntry) + Send + Sync>;

/// Discovers peers through anchors and peer-list gossip.
pub struct Discovery {
    node_id: NodeId,
    peer_manager: Arc<PeerManager>,
    comm: Comm,
    anchors: Mutex<Vec<String>>,
    on_peer_discovered: Option<PeerObserver>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Discovery {
    pub fn new(
        node_id: &str,
        peer_manager: Arc<PeerManager>,
        comm: Comm,
        anchors: Vec<String>,
        on_peer_discovered: Option<PeerObserver>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            peer_manager,
            comm,
            anchors: Mutex::new(anchors),
            on_peer_discovered,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The current anchor endpoints.
    pub async fn anchors(&self) -> Vec<String> {
        self.anchors.lock().await.clone()
    }

    /// Replace the anchor list (UPDATE_BOOTSTRAP).
    pub async fn set_anchors(&self, anchors: Vec<String>) {
        info!("Updated bootstrap anchors: {} entries", anchors.len());
        *self.anchors.lock().await = anchors;
    }

    /// Connect to every configured anchor.
    ///
    /// Each anchor gets a placeholder peer entry under an
    /// `anchor-<endpoint>` id; the handshake rewrites it with the anchor's
    /// real identity.
    pub async fn bootstrap(&self, connect: ConnectFn) {
        let anchors = self.anchors().await;
        info!("Bootstrapping from {} anchors", anchors.len());

        for endpoint in anchors {
            let placeholder = PeerEntry {
                node_id: format!("anchor-{endpoint}"),
                endpoint: endpoint.clone(),
                roles: vec!["role:anchor".to_string()],
                last_seen: now_secs(),
                reputation: 1.0,
                latency_ms: None,
            };
            if let Err(err) = self.peer_manager.add_peer(placeholder.clone(), true).await {
                warn!("Not bootstrapping from {endpoint}: {err}");
                continue;
            }
            match connect(endpoint.clone(), placeholder).await {
                Ok(()) => info!("Connected to bootstrap anchor: {endpoint}"),
                Err(err) => warn!("Failed to connect to anchor {endpoint}: {err}"),
            }
        }
    }

    /// Ask anchors (always) and a few random regular peers for their lists.
    async fn request_peers(&self) {
        let connected = self.peer_manager.connected_peers().await;
        if connected.is_empty() {
            trace!("No connected peers to request from");
            return;
        }
        let (anchors, regular): (Vec<_>, Vec<_>) =
            connected.into_iter().partition(|p| p.is_anchor);

        let mut targets = anchors;
        let mut regular = regular;
        regular.shuffle(&mut rand::thread_rng());
        targets.extend(regular.into_iter().take(GOSSIP_REGULAR_TARGETS));

        for peer in targets {
            let peer_id = peer.entry.node_id;
            let msg = WireMsg::peer_request(&self.node_id, &peer_id);
            if let Err(err) = self.comm.send_to(&peer_id, msg).await {
                debug!("Failed to request peers from {peer_id}: {err}");
            }
        }
    }

    /// Push a sample of our known peers to every established neighbor.
    async fn announce_peers(&self) {
        let sample = self
            .peer_manager
            .peers_for_discovery(GOSSIP_SAMPLE_SIZE)
            .await;
        if sample.is_empty() {
            return;
        }
        let msg = match WireMsg::peer_announce(&self.node_id, sample) {
            Ok(msg) => msg,
            Err(err) => {
                error!("Failed to build peer announce: {err}");
                return;
            }
        };
        let _sent = self.comm.broadcast(&msg, &Default::default()).await;
    }

    /// Answer a `peer_request` with our shareable sample.
    pub async fn handle_peer_request(&self, msg: &WireMsg) {
        trace!("Received peer request from {}", msg.sender);
        let sample = self
            .peer_manager
            .peers_for_discovery(GOSSIP_SAMPLE_SIZE)
            .await;
        match WireMsg::peer_response(&self.node_id, &msg.sender, sample) {
            Ok(response) => {
                if let Err(err) = self.comm.send_to(&msg.sender, response).await {
                    debug!("Failed to send peer response: {err}");
                }
            }
            Err(err) => error!("Failed to build peer response: {err}"),
        }
    }

    /// Merge a `peer_response` or `peer_announce` into the peer table.
    pub async fn handle_peer_list(&self, msg: &WireMsg) -> usize {
        let payload: PeerListPayload = match msg.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Undecodable peer list from {}: {err}", msg.sender);
                return 0;
            }
        };
        debug!(
            "Received {} peers from {}",
            payload.peers.len(),
            msg.sender
        );

        let mut added = 0;
        for entry in payload.peers {
            if entry.node_id == self.node_id {
                continue;
            }
            if self.peer_manager.get_peer(&entry.node_id).await.is_some() {
                self.peer_manager.mark_seen(&entry.node_id).await;
                continue;
            }
            match self.peer_manager.add_peer(entry.clone(), false).await {
                Ok(true) => {
                    added += 1;
                    if let Some(observer) = &self.on_peer_discovered {
                        observer(entry);
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    debug!("Not adding discovered peer {}: {err}", entry.node_id);
                    break; // table is full; no point trying the rest
                }
            }
        }
        added
    }

    /// Start the periodic gossip round.
    pub async fn start(self: &Arc<Self>, interval: Duration) {
        let discovery = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = discovery.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                discovery.request_peers().await;
                discovery.announce_peers().await;
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Cancel the gossip round and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = { self.tasks.lock().await.drain(..).collect() };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
