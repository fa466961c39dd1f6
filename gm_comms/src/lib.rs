// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Comms for the Genesis Mesh.
//! All comms with other nodes are done through this.

#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    clippy::unicode_not_nfc,
    clippy::unwrap_used
)]

#[macro_use]
extern crate tracing;

mod connection;
mod error;
mod transport;

pub use self::connection::{Connection, ConnectionConfig, ConnectionState, ConnectionStats};
pub use self::error::{Error, Result};
pub use self::transport::{
    MemoryTransport, TcpAcceptor, TcpTransport, Transport, TransportRx, TransportTx,
    CONNECT_TIMEOUT,
};

use gm_interface::{messaging::WireMsg, types::NodeId};

use dashmap::DashMap;
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::mpsc::Sender;

/// Standard channel size, to allow for large swings in throughput.
pub const STANDARD_CHANNEL_SIZE: usize = 100_000;

/// A msg received on the wire.
#[derive(Debug)]
pub struct MsgFromPeer {
    /// The peer the connection is currently attributed to.
    pub sender: NodeId,
    /// The msg that we received.
    pub msg: WireMsg,
}

/// Everything the comms layer tells the node.
#[derive(Debug)]
pub enum CommEvent {
    /// A message arrived.
    Msg(MsgFromPeer),
    /// A connection ended, locally or remotely.
    Disconnected {
        /// The peer the connection was attributed to.
        peer: NodeId,
    },
}

/// Communication component of the node to interact with other nodes.
///
/// Keeps one [`Connection`] per peer id; enforces the connection limit and
/// fans broadcasts out to every established peer.
#[derive(Clone)]
pub struct Comm {
    local_id: NodeId,
    max_connections: usize,
    config: ConnectionConfig,
    connections: Arc<DashMap<NodeId, Arc<Connection>>>,
    event_tx: Sender<CommEvent>,
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("local_id", &self.local_id)
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl Comm {
    /// A new comm layer emitting its events into `event_tx`.
    pub fn new(
        local_id: &str,
        max_connections: usize,
        config: ConnectionConfig,
        event_tx: Sender<CommEvent>,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            max_connections,
            config,
            connections: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    /// Adopt an up transport as a connection attributed to `peer_id`.
    ///
    /// Inbound connections arrive before any handshake, so callers use a
    /// placeholder id and [`rename`](Self::rename) once the real one is known.
    pub async fn add_connection(
        &self,
        peer_id: &str,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Connection>> {
        if self.connections.len() >= self.max_connections {
            warn!("Connection pool full, rejecting connection from {peer_id}");
            return Err(Error::AtCapacity(self.max_connections));
        }
        let conn = Connection::spawn(
            &self.local_id,
            peer_id,
            transport,
            self.event_tx.clone(),
            self.config.clone(),
        )
        .await;
        if let Some(old) = self.connections.insert(peer_id.to_string(), conn.clone()) {
            // a stale connection to the same peer is superseded
            let _task = tokio::spawn(async move { old.close().await });
        }
        debug!(
            "Added connection to {peer_id} (total: {})",
            self.connections.len()
        );
        Ok(conn)
    }

    /// Dial `endpoint` over TCP and adopt the transport.
    pub async fn connect(&self, peer_id: &str, endpoint: &str) -> Result<Arc<Connection>> {
        let transport = TcpTransport::connect(endpoint).await?;
        self.add_connection(peer_id, Box::new(transport)).await
    }

    /// The connection currently attributed to `peer_id`.
    pub fn get(&self, peer_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(peer_id).map(|entry| entry.clone())
    }

    /// Re-attribute a connection, e.g. when the handshake reveals the
    /// peer's real node id. Returns whether an entry was moved.
    pub async fn rename(&self, old_id: &str, new_id: &str) -> bool {
        match self.connections.remove(old_id) {
            Some((_, conn)) => {
                conn.set_peer_id(new_id).await;
                if let Some(stale) = self.connections.insert(new_id.to_string(), conn) {
                    let _task = tokio::spawn(async move { stale.close().await });
                }
                true
            }
            None => false,
        }
    }

    /// Drop and close the connection to `peer_id`.
    pub async fn remove(&self, peer_id: &str) {
        if let Some((_, conn)) = self.connections.remove(peer_id) {
            conn.close().await;
            debug!(
                "Removed connection to {peer_id} (total: {})",
                self.connections.len()
            );
        }
    }

    /// Send to one peer over its established connection.
    pub async fn send_to(&self, peer_id: &str, msg: WireMsg) -> Result<()> {
        let conn = self
            .get(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        conn.send(msg).await
    }

    /// Fan a message out to every established connection except `exclude`.
    ///
    /// Fan-out is not atomic; the returned count is how many sends were
    /// queued successfully, and failures are not retried here.
    pub async fn broadcast(&self, msg: &WireMsg, exclude: &BTreeSet<NodeId>) -> usize {
        // clone the targets out first; map refs are never held across awaits
        let targets: Vec<(NodeId, Arc<Connection>)> = self
            .connections
            .iter()
            .filter(|entry| !exclude.contains(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut sent = 0;
        for (peer_id, conn) in targets {
            if !conn.is_established().await {
                continue;
            }
            match conn.send(msg.clone()).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    debug!("Broadcast to {peer_id} failed: {err}");
                }
            }
        }
        sent
    }

    /// Ids of all peers with an established connection.
    pub async fn established_peers(&self) -> Vec<NodeId> {
        let conns: Vec<(NodeId, Arc<Connection>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut established = Vec::new();
        for (peer_id, conn) in conns {
            if conn.is_established().await {
                established.push(peer_id);
            }
        }
        established
    }

    /// Number of live connections (any state).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        let conns: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();
        for conn in conns {
            conn.close().await;
        }
    }

    /// Aggregate statistics over all connections.
    pub fn stats(&self) -> Vec<(NodeId, ConnectionStats)> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use gm_interface::messaging::MsgType;
    use tokio::{
        sync::mpsc,
        time::{timeout, Duration},
    };

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn comm(local_id: &str) -> (Comm, mpsc::Receiver<CommEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let comm = Comm::new(local_id, 50, ConnectionConfig::default(), tx);
        (comm, rx)
    }

    /// Wire two comms together over an in-memory transport and mark both
    /// ends established.
    async fn link(a: &Comm, a_peer: &str, b: &Comm, b_peer: &str) -> Result<()> {
        let (t_a, t_b) = MemoryTransport::pair(64);
        a.add_connection(a_peer, Box::new(t_a))
            .await?
            .set_established()
            .await;
        b.add_connection(b_peer, Box::new(t_b))
            .await?
            .set_established()
            .await;
        Ok(())
    }

    #[tokio::test]
    async fn broadcast_reaches_established_peers_only() -> Result<()> {
        let (comm_a, _a_rx) = comm("node-a");
        let (comm_b, mut b_rx) = comm("node-b");
        let (comm_c, mut c_rx) = comm("node-c");

        link(&comm_a, "node-b", &comm_b, "node-a").await?;
        link(&comm_a, "node-c", &comm_c, "node-a").await?;

        // one more connection that never completes a handshake
        let (t_d, _other_end) = MemoryTransport::pair(4);
        let _conn = comm_a.add_connection("node-d", Box::new(t_d)).await?;

        let msg = WireMsg::new(
            MsgType::PeerRequest,
            "node-a",
            None,
            serde_json::json!({}),
        );
        let sent = comm_a.broadcast(&msg, &BTreeSet::new()).await;
        assert_eq!(sent, 2);

        for rx in [&mut b_rx, &mut c_rx] {
            let event = timeout(TIMEOUT, rx.recv()).await?.expect("event");
            match event {
                CommEvent::Msg(received) => assert_eq!(received.msg.msg_id, msg.msg_id),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn rename_reattributes_connection() -> Result<()> {
        let (comm_a, _a_rx) = comm("node-a");
        let (comm_b, _b_rx) = comm("node-b");
        link(&comm_a, "incoming-42", &comm_b, "node-a").await?;

        assert!(comm_a.rename("incoming-42", "node-b").await);
        assert!(comm_a.get("incoming-42").is_none());
        let conn = comm_a.get("node-b").expect("renamed connection");
        assert_eq!(conn.peer_id().await, "node-b");
        Ok(())
    }

    #[tokio::test]
    async fn connection_limit_is_enforced() -> Result<()> {
        let (tx, _rx) = mpsc::channel(8);
        let comm = Comm::new("node-a", 1, ConnectionConfig::default(), tx);

        let (t1, _keep1) = MemoryTransport::pair(4);
        let _conn = comm.add_connection("peer-1", Box::new(t1)).await?;

        let (t2, _keep2) = MemoryTransport::pair(4);
        let result = comm.add_connection("peer-2", Box::new(t2)).await;
        assert!(matches!(result, Err(Error::AtCapacity(1))));
        Ok(())
    }
}
