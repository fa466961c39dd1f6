// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::error::{Error, Result};
use super::transport::{Transport, TransportRx, TransportTx};
use super::{CommEvent, MsgFromPeer};

use gm_interface::{
    messaging::{MsgType, WireMsg},
    types::{Cache, NodeId},
};

use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::{sleep, Duration},
};
use tokio_util::sync::CancellationToken;

/// Per-peer connection lifecycle.
///
/// `Connecting` covers the dial phase before a transport exists; a
/// [`Connection`] itself is created on transport up and so starts at
/// `Handshaking`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    fn is_terminal_or_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Failed)
    }
}

/// Tunables for one connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Outbound queue capacity.
    pub max_queue_size: usize,
    /// Whether non-priority sends drop when the queue is full.
    pub drop_on_full: bool,
    /// Ping cadence while established.
    pub ping_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            drop_on_full: true,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// A point-in-time statistics snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub dropped_messages: u64,
    pub queue_size: usize,
    /// Measured round-trip latency in milliseconds, if any pong came back.
    pub latency_ms: Option<f64>,
    /// Last send or receive, UNIX seconds.
    pub last_activity: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    // zero means "not yet measured"
    latency_us: AtomicU64,
    last_activity: AtomicU64,
}

impl StatsInner {
    fn touch(&self) {
        self.last_activity
            .store(gm_interface::now_secs(), Ordering::Relaxed);
    }
}

struct Shared {
    local_id: NodeId,
    peer_id: RwLock<NodeId>,
    state: RwLock<ConnectionState>,
    stats: StatsInner,
    pending_pings: Mutex<Cache<String, Instant>>,
    queue_tx: mpsc::Sender<WireMsg>,
    events: mpsc::Sender<CommEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ping_interval: Duration,
    ping_started: AtomicBool,
    disconnect_emitted: AtomicBool,
}

impl Shared {
    async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, next: ConnectionState) {
        *self.state.write().await = next;
    }

    async fn peer_id(&self) -> NodeId {
        self.peer_id.read().await.clone()
    }

    /// Move to `Established` and start the ping loop, once.
    async fn establish(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Connecting | ConnectionState::Handshaking => {
                    *state = ConnectionState::Established;
                }
                _ => return,
            }
        }
        info!("Connection to {} established", self.peer_id().await);
        if !self.ping_started.swap(true, Ordering::SeqCst) {
            let shared = self.clone();
            let handle = tokio::spawn(async move { ping_loop(shared).await });
            self.tasks.lock().await.push(handle);
        }
    }

    async fn emit_disconnected(&self) {
        if !self.disconnect_emitted.swap(true, Ordering::SeqCst) {
            let _ = self.events.try_send(CommEvent::Disconnected {
                peer: self.peer_id().await,
            });
        }
    }

    async fn fail(&self) {
        if !self.state().await.is_terminal_or_closing() {
            self.set_state(ConnectionState::Failed).await;
        }
        self.cancel.cancel();
        self.emit_disconnected().await;
    }
}

/// A connection to one peer.
///
/// Owns a bounded outbound queue and three background activities: receive
/// (parse frame, dispatch into the comm event pipe), send (drain queue into
/// the transport) and, once established, periodic pings for latency.
pub struct Connection {
    shared: Arc<Shared>,
    drop_on_full: bool,
    max_queue_size: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let peer = self
            .shared
            .peer_id
            .try_read()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        let state = self.shared.state.try_read().map(|guard| *guard).ok();
        f.debug_struct("Connection")
            .field("peer", &peer)
            .field("state", &state)
            .finish()
    }
}

impl Connection {
    /// Take ownership of an up transport and start the connection tasks.
    pub async fn spawn(
        local_id: &str,
        peer_id: &str,
        transport: Box<dyn Transport>,
        events: mpsc::Sender<CommEvent>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.max_queue_size);
        let (transport_tx, transport_rx) = transport.split();

        let shared = Arc::new(Shared {
            local_id: local_id.to_string(),
            peer_id: RwLock::new(peer_id.to_string()),
            state: RwLock::new(ConnectionState::Handshaking),
            stats: StatsInner::default(),
            pending_pings: Mutex::new(Cache::with_expiry_duration_and_capacity(
                config.ping_interval * 4,
                64,
            )),
            queue_tx,
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            ping_interval: config.ping_interval,
            ping_started: AtomicBool::new(false),
            disconnect_emitted: AtomicBool::new(false),
        });

        let send_handle = tokio::spawn(send_loop(shared.clone(), queue_rx, transport_tx));
        let recv_handle = tokio::spawn(recv_loop(shared.clone(), transport_rx));
        shared.tasks.lock().await.extend([send_handle, recv_handle]);

        Arc::new(Self {
            drop_on_full: config.drop_on_full,
            max_queue_size: config.max_queue_size,
            shared,
        })
    }

    /// The remote's node id, as currently known.
    pub async fn peer_id(&self) -> NodeId {
        self.shared.peer_id().await
    }

    /// Rewrite the peer id once the handshake reveals the real one.
    pub async fn set_peer_id(&self, peer_id: &str) {
        *self.shared.peer_id.write().await = peer_id.to_string();
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.shared.state().await
    }

    /// Whether the handshake has completed.
    pub async fn is_established(&self) -> bool {
        self.state().await == ConnectionState::Established
    }

    /// Mark the handshake as complete and start pinging.
    ///
    /// Called by the node once a valid handshake (inbound side) has been
    /// processed; the outbound side transitions itself on `handshake_ack`.
    pub async fn set_established(&self) {
        self.shared.establish().await;
    }

    /// Queue a message, subject to the configured backpressure policy.
    ///
    /// In drop-on-full mode a full queue drops the message and returns
    /// [`Error::QueueFull`]; otherwise the send waits for space.
    pub async fn send(&self, msg: WireMsg) -> Result<()> {
        let peer = self.shared.peer_id().await;
        if self.shared.state().await.is_terminal_or_closing() {
            return Err(Error::ConnectionClosed(peer));
        }
        if self.drop_on_full {
            self.shared.queue_tx.try_send(msg).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    let _ = self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    let _ = self.shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Dropped message to {peer} due to full send queue (total dropped: {})",
                        self.shared.stats.dropped.load(Ordering::Relaxed)
                    );
                    Error::QueueFull(peer)
                }
                mpsc::error::TrySendError::Closed(_) => Error::ConnectionClosed(peer),
            })
        } else {
            self.shared
                .queue_tx
                .send(msg)
                .await
                .map_err(|_| Error::ConnectionClosed(peer))
        }
    }

    /// Queue a message, always waiting for space.
    pub async fn send_priority(&self, msg: WireMsg) -> Result<()> {
        let peer = self.shared.peer_id().await;
        if self.shared.state().await.is_terminal_or_closing() {
            return Err(Error::ConnectionClosed(peer));
        }
        self.shared
            .queue_tx
            .send(msg)
            .await
            .map_err(|_| Error::ConnectionClosed(peer))
    }

    /// A statistics snapshot.
    pub fn stats(&self) -> ConnectionStats {
        let stats = &self.shared.stats;
        let latency_us = stats.latency_us.load(Ordering::Relaxed);
        ConnectionStats {
            messages_sent: stats.messages_sent.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
            errors: stats.errors.load(Ordering::Relaxed),
            dropped_messages: stats.dropped.load(Ordering::Relaxed),
            queue_size: self
                .max_queue_size
                .saturating_sub(self.shared.queue_tx.capacity()),
            latency_ms: (latency_us > 0).then(|| latency_us as f64 / 1000.0),
            last_activity: stats.last_activity.load(Ordering::Relaxed),
        }
    }

    /// Close the connection gracefully. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.write().await;
            if state.is_terminal_or_closing() {
                return;
            }
            *state = ConnectionState::Closing;
        }
        debug!("Closing connection to {}", self.shared.peer_id().await);
        self.shared.cancel.cancel();
        let handles: Vec<_> = { self.shared.tasks.lock().await.drain(..).collect() };
        for handle in handles {
            let _ = handle.await;
        }
        self.shared.set_state(ConnectionState::Closed).await;
        self.shared.emit_disconnected().await;
    }
}

async fn send_loop(
    shared: Arc<Shared>,
    mut queue_rx: mpsc::Receiver<WireMsg>,
    mut transport_tx: Box<dyn TransportTx>,
) {
    loop {
        let msg = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            maybe = queue_rx.recv() => match maybe {
                Some(msg) => msg,
                None => break,
            },
        };

        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Failed to serialize outbound message: {err}");
                let _ = shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let sent = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            sent = transport_tx.send(bytes.clone()) => sent,
        };
        match sent {
            Ok(()) => {
                let _ = shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                let _ = shared
                    .stats
                    .bytes_sent
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                shared.stats.touch();
            }
            Err(err) => {
                error!("Error sending to {}: {err}", shared.peer_id().await);
                let _ = shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                shared.fail().await;
                break;
            }
        }
    }
    transport_tx.close().await;
}

async fn recv_loop(shared: Arc<Shared>, mut transport_rx: Box<dyn TransportRx>) {
    loop {
        let maybe_frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = transport_rx.recv() => frame,
        };

        let frame = match maybe_frame {
            Some(frame) => frame,
            None => {
                // remote closed the transport
                if !shared.state().await.is_terminal_or_closing() {
                    shared.set_state(ConnectionState::Closed).await;
                }
                shared.cancel.cancel();
                shared.emit_disconnected().await;
                break;
            }
        };

        let _ = shared
            .stats
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        shared.stats.touch();

        let msg = match WireMsg::from_bytes(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(
                    "Dropping unparseable frame from {}: {err}",
                    shared.peer_id().await
                );
                let _ = shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let _ = shared
            .stats
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        match msg.msg_type {
            MsgType::Ping => {
                let pong = WireMsg::pong(&shared.local_id, &msg.sender, &msg.msg_id);
                if shared.queue_tx.try_send(pong).is_err() {
                    let _ = shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            MsgType::Pong => handle_pong(&shared, &msg).await,
            MsgType::HandshakeAck => shared.establish().await,
            _ => {}
        }

        // everything is forwarded; the node's dispatch decides what matters
        let event = CommEvent::Msg(MsgFromPeer {
            sender: shared.peer_id().await,
            msg,
        });
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            sent = shared.events.send(event) => {
                if sent.is_err() {
                    // node side is gone, nothing left to receive for
                    break;
                }
            }
        }
    }
}

async fn handle_pong(shared: &Shared, msg: &WireMsg) {
    let ping_id = match msg.payload.get("ping_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => return,
    };
    let sent_at = shared.pending_pings.lock().await.remove(&ping_id);
    if let Some(sent_at) = sent_at {
        let latency = sent_at.elapsed();
        shared
            .stats
            .latency_us
            .store(latency.as_micros().max(1) as u64, Ordering::Relaxed);
        trace!(
            "Latency to {}: {:.2}ms",
            shared.peer_id().await,
            latency.as_secs_f64() * 1000.0
        );
    }
}

async fn ping_loop(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = sleep(shared.ping_interval) => {}
        }
        if shared.state().await != ConnectionState::Established {
            break;
        }
        let ping = WireMsg::ping(&shared.local_id, &shared.peer_id().await);
        {
            let mut pending = shared.pending_pings.lock().await;
            let _ = pending.insert(ping.msg_id.clone(), Instant::now(), None);
        }
        if shared.queue_tx.try_send(ping).is_err() {
            let _ = shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use assert_matches::assert_matches;
    use eyre::Result;
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn wired_pair(
        config: ConnectionConfig,
    ) -> (
        (Arc<Connection>, mpsc::Receiver<CommEvent>),
        (Arc<Connection>, mpsc::Receiver<CommEvent>),
    ) {
        let (a, b) = MemoryTransport::pair(64);
        let (a_events_tx, a_events_rx) = mpsc::channel(64);
        let (b_events_tx, b_events_rx) = mpsc::channel(64);
        let conn_a =
            Connection::spawn("node-a", "node-b", Box::new(a), a_events_tx, config.clone()).await;
        let conn_b = Connection::spawn("node-b", "node-a", Box::new(b), b_events_tx, config).await;
        ((conn_a, a_events_rx), (conn_b, b_events_rx))
    }

    async fn next_msg(rx: &mut mpsc::Receiver<CommEvent>) -> MsgFromPeer {
        loop {
            match timeout(TIMEOUT, rx.recv()).await.expect("event timeout") {
                Some(CommEvent::Msg(msg)) => return msg,
                Some(CommEvent::Disconnected { .. }) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn delivers_messages_and_counts_stats() -> Result<()> {
        let ((conn_a, _a_rx), (_conn_b, mut b_rx)) =
            wired_pair(ConnectionConfig::default()).await;

        conn_a
            .send(WireMsg::data("node-a", "node-b", b"first", 10))
            .await?;
        let received = next_msg(&mut b_rx).await;
        assert_eq!(received.msg.msg_type, MsgType::Data);
        assert_eq!(received.sender, "node-a");

        let stats = conn_a.stats();
        assert_eq!(stats.messages_sent, 1);
        assert!(stats.bytes_sent > 0);
        Ok(())
    }

    #[tokio::test]
    async fn handshake_ack_establishes_and_pings_measure_latency() -> Result<()> {
        let config = ConnectionConfig {
            ping_interval: Duration::from_millis(20),
            ..ConnectionConfig::default()
        };
        let ((conn_a, _a_rx), (conn_b, mut b_rx)) = wired_pair(config).await;
        assert_eq!(conn_a.state().await, ConnectionState::Handshaking);

        // the ack moves the receiving side to established
        conn_b.set_established().await;
        conn_a
            .send_priority(WireMsg::new(
                MsgType::HandshakeAck,
                "node-a",
                Some("node-b"),
                serde_json::json!({}),
            ))
            .await?;

        let received = next_msg(&mut b_rx).await;
        assert_eq!(received.msg.msg_type, MsgType::HandshakeAck);
        assert!(conn_b.is_established().await);

        // established side pings; the peer's recv loop answers with pongs
        timeout(TIMEOUT, async {
            loop {
                if conn_b.stats().latency_ms.is_some() {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn full_queue_drops_non_priority_sends() {
        let (a, _b_unread) = MemoryTransport::pair(1);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let conn = Connection::spawn(
            "node-a",
            "node-b",
            Box::new(a),
            events_tx,
            ConnectionConfig {
                max_queue_size: 1,
                ..ConnectionConfig::default()
            },
        )
        .await;

        // nobody reads the remote end, so queue + transport buffer saturate
        let mut dropped = false;
        for _ in 0..16 {
            if let Err(err) = conn.send(WireMsg::ping("node-a", "node-b")).await {
                assert_matches!(err, Error::QueueFull(_));
                dropped = true;
                break;
            }
        }
        assert!(dropped, "expected a queue-full drop");
        assert!(conn.stats().dropped_messages > 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_disconnect() {
        let ((conn_a, _a_rx), (_conn_b, mut b_rx)) =
            wired_pair(ConnectionConfig::default()).await;

        conn_a.close().await;
        conn_a.close().await;
        assert_eq!(conn_a.state().await, ConnectionState::Closed);
        assert_matches!(
            conn_a.send(WireMsg::ping("node-a", "node-b")).await,
            Err(Error::ConnectionClosed(_))
        );

        // the remote observes end-of-stream and reports the disconnect
        let event = timeout(TIMEOUT, b_rx.recv()).await.expect("event timeout");
        assert_matches!(event, Some(CommEvent::Disconnected { peer }) if peer == "node-a");
    }
}
