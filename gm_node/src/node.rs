// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The mesh node runtime: trust envelope, message dispatch and the
//! lifecycles of every component.

use super::audit::{AuditLog, EventType};
use super::cert_manager::{CertManager, CertStatus, RenewFn};
use super::config::NodeConfig;
use super::control::{ControlHandler, ControlObservers, KeyLookup, ReplayConfig};
use super::crl_gossip::{CrlConfig, CrlGossip};
use super::discovery::{ConnectFn, Discovery};
use super::error::{Error, Result};
use super::health::{self, HealthInputs, HealthReport};
use super::metrics::{Metrics, MetricsSnapshot};
use super::peer_manager::PeerManager;
use super::rbac::RbacEnforcer;
use super::routing::{MeshRouter, RouteOutcome, RoutingProtocol, RoutingTable};
use super::services::ServiceRegistry;

use gm_comms::{Comm, CommEvent, MsgFromPeer, TcpAcceptor, Transport};
use gm_interface::{
    messaging::{DataPayload, HandshakePayload, MsgType, PeerEntry, WireMsg},
    now_secs,
    trust::{ControlMessage, GenesisBlock, JoinCertificate, PolicyManifest},
    types::keys::{self, Keypair},
    types::NodeId,
};

use serde_json::Value;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Link metric assigned to every direct neighbor.
const NEIGHBOR_LINK_METRIC: u32 = 1;

/// Everything needed to construct a [`MeshNode`].
pub struct NodeContext {
    /// The verified-on-construction network constitution.
    pub genesis: GenesisBlock,
    /// This node's Ed25519 identity.
    pub keypair: Keypair,
    /// Roles this node operates under.
    pub roles: Vec<String>,
    /// The join certificate, if already obtained.
    pub certificate: Option<JoinCertificate>,
    /// The endpoint other nodes can dial us on, if we listen.
    pub listen_endpoint: Option<String>,
    /// Runtime tunables.
    pub config: NodeConfig,
    /// Audit log file; `None` keeps the chain in memory only.
    pub audit_path: Option<PathBuf>,
    /// Replay-cache snapshot file.
    pub replay_cache_path: Option<PathBuf>,
    /// How to obtain a fresh certificate; enables the cert manager.
    pub renew_certificate: Option<RenewFn>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("network", &self.genesis.network_name)
            .field("roles", &self.roles)
            .finish()
    }
}

impl NodeContext {
    /// A context with defaults for everything optional.
    pub fn new(genesis: GenesisBlock, keypair: Keypair, roles: Vec<String>) -> Self {
        Self {
            genesis,
            keypair,
            roles,
            certificate: None,
            listen_endpoint: None,
            config: NodeConfig::default(),
            audit_path: None,
            replay_cache_path: None,
            renew_certificate: None,
        }
    }
}

/// A Genesis Mesh node.
///
/// The node id is the base64 of the node public key. Construction verifies
/// the genesis block; a bad root signature is fatal and nothing starts.
pub struct MeshNode {
    id: NodeId,
    keypair: Keypair,
    genesis: GenesisBlock,
    roles: Vec<String>,
    listen_endpoint: Option<String>,
    config: NodeConfig,

    comm: Comm,
    peer_manager: Arc<PeerManager>,
    table: Arc<RoutingTable>,
    router: Arc<MeshRouter>,
    protocol: Arc<RoutingProtocol>,
    discovery: Arc<Discovery>,
    control: Arc<ControlHandler>,
    crl: Arc<CrlGossip>,
    cert_manager: Option<Arc<CertManager>>,
    services: Arc<ServiceRegistry>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,

    policy: Arc<RwLock<Option<PolicyManifest>>>,
    certificate: Arc<RwLock<Option<JoinCertificate>>>,
    trusted_keys: Arc<RwLock<HashMap<String, String>>>,

    events_rx: Mutex<Option<mpsc::Receiver<CommEvent>>>,
    data_tx: mpsc::Sender<(NodeId, Vec<u8>)>,
    data_rx: Mutex<Option<mpsc::Receiver<(NodeId, Vec<u8>)>>>,
    shutdown_tx: watch::Sender<Option<String>>,

    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("id", &self.id)
            .field("network", &self.genesis.network_name)
            .finish()
    }
}

impl MeshNode {
    /// Build a node. Fails fatally if the genesis block does not verify.
    pub fn new(ctx: NodeContext) -> Result<Arc<Self>> {
        ctx.genesis
            .verify()
            .map_err(|_| Error::Fatal("genesis block signature verification failed".to_string()))?;

        let id = keys::encode_public(&ctx.keypair.public);
        let config = ctx.config;
        info!(
            "Node initialized for network {} as {id}",
            ctx.genesis.network_name
        );

        let (event_tx, event_rx) = mpsc::channel(gm_comms::STANDARD_CHANNEL_SIZE);
        let (data_tx, data_rx) = mpsc::channel(1024);
        let (shutdown_tx, _shutdown_rx) = watch::channel(None);

        let comm = Comm::new(&id, config.max_peers, config.connection.clone(), event_tx);
        let audit = Arc::new(AuditLog::new(&id, ctx.audit_path));
        let metrics = Arc::new(Metrics::default());

        let peer_manager = Arc::new(PeerManager::new(
            &id,
            config.max_peers,
            config.max_anchors,
            config.blacklist_duration,
            comm.clone(),
        ));
        let table = Arc::new(RoutingTable::new(&id, config.max_metric));
        let router = Arc::new(MeshRouter::new(
            &id,
            table.clone(),
            comm.clone(),
            config.seen_msg_ttl,
        ));
        let protocol = Arc::new(RoutingProtocol::new(
            &id,
            table.clone(),
            comm.clone(),
            config.route_timeout,
        ));

        let anchors = ctx
            .genesis
            .bootstrap_anchors
            .iter()
            .map(|anchor| anchor.endpoint.clone())
            .collect();
        let discovery = Arc::new(Discovery::new(
            &id,
            peer_manager.clone(),
            comm.clone(),
            anchors,
            None,
        ));

        let na_public = ctx.genesis.network_authority.public_key.clone();
        let trusted_keys: Arc<RwLock<HashMap<String, String>>> =
            Arc::new(RwLock::new(HashMap::new()));

        // control-plane issuers resolve through the registered key set,
        // falling back to the NA key from the genesis block
        let control_keys = trusted_keys.clone();
        let control_na = na_public.clone();
        let control_lookup: KeyLookup = Arc::new(move |key_id: &str| {
            let keys = control_keys.clone();
            let na = control_na.clone();
            let key_id = key_id.to_string();
            Box::pin(async move { keys.read().await.get(&key_id).cloned().or(Some(na)) })
        });
        // CRLs and service manifests verify against the genesis NA key only
        let na_lookup: KeyLookup = {
            let na_public = na_public.clone();
            Arc::new(move |_key_id: &str| {
                let na_public = na_public.clone();
                Box::pin(async move { Some(na_public) })
            })
        };

        let crl = Arc::new(CrlGossip::new(
            &id,
            comm.clone(),
            na_lookup.clone(),
            audit.clone(),
            CrlConfig {
                cache_capacity: config.crl_cache_capacity,
                cache_retention: config.crl_cache_retention,
            },
        ));
        let services = Arc::new(ServiceRegistry::new(&id, comm.clone(), na_lookup));

        let policy: Arc<RwLock<Option<PolicyManifest>>> = Arc::new(RwLock::new(None));
        let certificate = Arc::new(RwLock::new(ctx.certificate));

        let observers = {
            let policy = policy.clone();
            let discovery = discovery.clone();
            let peer_manager = peer_manager.clone();
            let shutdown = shutdown_tx.clone();
            ControlObservers {
                on_policy_update: Some(Arc::new(move |value: Value| {
                    let policy = policy.clone();
                    Box::pin(async move {
                        match serde_json::from_value::<PolicyManifest>(value) {
                            Ok(manifest) => {
                                *policy.write().await = Some(manifest);
                            }
                            Err(err) => warn!("Policy data did not parse as a manifest: {err}"),
                        }
                    })
                })),
                on_cert_revoked: None,
                on_node_revoked: Some(Arc::new(move |node_id: String, _reason: String| {
                    let peer_manager = peer_manager.clone();
                    Box::pin(async move {
                        peer_manager.blacklist_peer(&node_id).await;
                    })
                })),
                on_bootstrap_update: Some(Arc::new(move |anchors: Vec<String>| {
                    let discovery = discovery.clone();
                    Box::pin(async move {
                        discovery.set_anchors(anchors).await;
                    })
                })),
                on_shutdown: Some(Arc::new(move |reason: String| {
                    let shutdown = shutdown.clone();
                    Box::pin(async move {
                        let _sent = shutdown.send(Some(reason));
                    })
                })),
            }
        };
        let control = Arc::new(ControlHandler::new(
            &id,
            RbacEnforcer::default(),
            control_lookup,
            observers,
            audit.clone(),
            ReplayConfig {
                ttl: config.replay_ttl,
                sweep_interval: config.replay_sweep_interval,
                hard_cap: config.replay_hard_cap,
                retain: config.replay_retain,
                persist_path: ctx.replay_cache_path,
            },
            config.shutdown_grace,
        ));

        let cert_manager = ctx.renew_certificate.map(|renew| {
            let source = certificate.clone();
            let installed = certificate.clone();
            let renewed_metrics = metrics.clone();
            Arc::new(CertManager::new(
                &id,
                Arc::new(move || {
                    let source = source.clone();
                    Box::pin(async move { source.read().await.clone() })
                }),
                renew,
                Some(Arc::new(move |cert: JoinCertificate| {
                    let installed = installed.clone();
                    let metrics = renewed_metrics.clone();
                    Box::pin(async move {
                        Metrics::incr(&metrics.cert_renewals);
                        *installed.write().await = Some(cert);
                    })
                })),
                None,
                audit.clone(),
                config.cert_renewal_threshold,
            ))
        });

        Ok(Arc::new(Self {
            id,
            keypair: ctx.keypair,
            genesis: ctx.genesis,
            roles: ctx.roles,
            listen_endpoint: ctx.listen_endpoint,
            config,
            comm,
            peer_manager,
            table,
            router,
            protocol,
            discovery,
            control,
            crl,
            cert_manager,
            services,
            audit,
            metrics,
            policy,
            certificate,
            trusted_keys,
            events_rx: Mutex::new(Some(event_rx)),
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            shutdown_tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    /// The node id (base64 public key).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The node public key, base64.
    pub fn public_key(&self) -> String {
        keys::encode_public(&self.keypair.public)
    }

    /// Sign arbitrary bytes with the node key, e.g. for a join request.
    pub fn sign(&self, msg: &[u8]) -> String {
        keys::sign_b64(msg, &self.keypair)
    }

    /// The embedded genesis block.
    pub fn genesis(&self) -> &GenesisBlock {
        &self.genesis
    }

    /// The current join certificate.
    pub async fn certificate(&self) -> Option<JoinCertificate> {
        self.certificate.read().await.clone()
    }

    /// The current policy manifest.
    pub async fn policy(&self) -> Option<PolicyManifest> {
        self.policy.read().await.clone()
    }

    /// Register a public key for a control-plane issuer id.
    pub async fn register_trusted_key(&self, key_id: &str, public_b64: &str) {
        let _prev = self
            .trusted_keys
            .write()
            .await
            .insert(key_id.to_string(), public_b64.to_string());
    }

    /// Verify and install a join certificate for this node.
    pub async fn install_certificate(&self, cert: JoinCertificate) -> Result<()> {
        self.verify_join_certificate(&cert, now_secs())?;
        *self.certificate.write().await = Some(cert);
        Ok(())
    }

    /// Validate a certificate against the genesis trust anchors.
    ///
    /// Checks: the network name matches, `now` is inside the validity
    /// window, and some signature verifies against the NA key embedded in
    /// the genesis block (compared by decoded key bytes, not encoding).
    pub fn verify_join_certificate(&self, cert: &JoinCertificate, now: u64) -> Result<()> {
        if cert.network_name != self.genesis.network_name {
            return Err(Error::Validation("certificate network mismatch".to_string()));
        }
        if !cert.is_valid(now) {
            return Err(Error::Stale(
                "certificate expired or not yet valid".to_string(),
            ));
        }
        let na_key = &self.genesis.network_authority.public_key;
        let verified = cert
            .signatures
            .iter()
            .any(|sig| gm_interface::trust::verify_object(cert, sig, na_key));
        if !verified {
            return Err(Error::Signature);
        }
        Ok(())
    }

    async fn build_handshake_payload(&self) -> Result<HandshakePayload> {
        let cert = self
            .certificate()
            .await
            .ok_or_else(|| Error::Validation("no join certificate to handshake with".to_string()))?;
        Ok(HandshakePayload {
            protocol_version: self.genesis.network_version.clone(),
            node_id: self.id.clone(),
            certificate: cert,
            capabilities: vec![],
            roles: self.roles.clone(),
            endpoint: self.listen_endpoint.clone(),
        })
    }

    /// Adopt an inbound transport; the peer introduces itself by handshake.
    pub async fn accept_transport(&self, transport: Box<dyn Transport>) -> Result<()> {
        let placeholder = format!("incoming-{}", Uuid::new_v4());
        let _conn = self.comm.add_connection(&placeholder, transport).await?;
        Ok(())
    }

    /// Adopt an outbound transport and start the handshake on it.
    pub async fn connect_transport(&self, transport: Box<dyn Transport>) -> Result<()> {
        let placeholder = format!("peer-{}", Uuid::new_v4());
        let conn = self.comm.add_connection(&placeholder, transport).await?;
        let payload = self.build_handshake_payload().await?;
        conn.send_priority(WireMsg::handshake(&self.id, &payload)?)
            .await
            .map_err(Error::Transport)
    }

    /// Dial an endpoint over TCP under the given placeholder id and start
    /// the handshake.
    pub async fn connect_to(&self, endpoint: &str, placeholder_id: &str) -> Result<()> {
        match self.comm.connect(placeholder_id, endpoint).await {
            Ok(conn) => {
                let payload = self.build_handshake_payload().await?;
                conn.send_priority(WireMsg::handshake(&self.id, &payload)?)
                    .await
                    .map_err(Error::Transport)
            }
            Err(err) => {
                Metrics::incr(&self.metrics.connections_failed);
                self.audit.connection_failed(placeholder_id, &err.to_string());
                self.peer_manager.record_attempt(placeholder_id, false).await;
                Err(Error::Transport(err))
            }
        }
    }

    /// Connect to every genesis (or control-plane supplied) anchor.
    pub async fn bootstrap(self: &Arc<Self>) {
        let node = self.clone();
        let connect: ConnectFn = Arc::new(move |endpoint: String, entry: PeerEntry| {
            let node = node.clone();
            Box::pin(async move { node.connect_to(&endpoint, &entry.node_id).await })
        });
        self.discovery.bootstrap(connect).await;
    }

    /// Send application bytes to a destination node.
    pub async fn send_data(&self, destination: &str, bytes: &[u8]) -> RouteOutcome {
        Metrics::incr(&self.metrics.messages_sent);
        let outcome = self
            .router
            .send_to(destination, bytes, gm_interface::messaging::DEFAULT_TTL)
            .await;
        if matches!(outcome, RouteOutcome::Dropped(_)) {
            Metrics::incr(&self.metrics.messages_dropped);
        }
        outcome
    }

    /// Take the receiver for locally delivered DATA payloads.
    pub async fn take_data_receiver(&self) -> Option<mpsc::Receiver<(NodeId, Vec<u8>)>> {
        self.data_rx.lock().await.take()
    }

    /// The installed route towards `destination`, if any.
    pub async fn route_to(&self, destination: &str) -> Option<super::routing::Route> {
        self.table.get_route(destination).await
    }

    /// Current direct neighbors.
    pub async fn neighbors(&self) -> Vec<NodeId> {
        self.table.neighbors().await
    }

    /// Run one route-announcement cycle outside the periodic schedule.
    pub async fn trigger_route_announce(&self) {
        self.protocol.trigger_update().await;
    }

    /// Broadcast a signed control message to every established neighbor.
    ///
    /// The local node does not execute it; messages act where they are
    /// received.
    pub async fn broadcast_control(&self, control: &ControlMessage) -> Result<usize> {
        let msg = WireMsg::control(&self.id, control)?;
        Ok(self.comm.broadcast(&msg, &Default::default()).await)
    }

    /// Observe shutdown requests issued via the control plane.
    pub fn shutdown_requests(&self) -> watch::Receiver<Option<String>> {
        self.shutdown_tx.subscribe()
    }

    /// Handle on the CRL gossip component (e.g. for emergency pushes).
    pub fn crl(&self) -> &Arc<CrlGossip> {
        &self.crl
    }

    /// Handle on the service registry.
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Current certificate status, when a cert manager is running.
    pub async fn cert_status(&self) -> Option<CertStatus> {
        match &self.cert_manager {
            Some(manager) => Some(manager.status().await),
            None => None,
        }
    }

    /// Aggregate health over every component.
    pub async fn health(&self) -> HealthReport {
        let crl_stale = match self.crl.current_sequence().await {
            Some(_) => Some(self.crl.is_stale(now_secs()).await),
            None => None,
        };
        health::evaluate(&HealthInputs {
            cert: self.cert_status().await,
            peers: self.peer_manager.stats().await,
            routes: self.table.stats().await,
            crl_stale,
            min_peers: 1,
        })
    }

    /// Counters plus live gauges.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        let peers = self.peer_manager.stats().await;
        snapshot.total_peers = peers.total_peers;
        snapshot.connected_peers = peers.connected_peers;
        snapshot.total_routes = self.table.stats().await.total_routes;
        snapshot.crl_sequence = self.crl.current_sequence().await;
        snapshot
    }

    /// Start the dispatch loop and every periodic task. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let _event = self.audit.log_event(
            EventType::NodeStarted,
            "Node started",
            "success",
            None,
            None,
            Value::Null,
        );

        let events_rx = self.events_rx.lock().await.take();
        if let Some(mut events_rx) = events_rx {
            let node = self.clone();
            let handle = tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = node.cancel.cancelled() => break,
                        event = events_rx.recv() => match event {
                            Some(event) => event,
                            None => break,
                        },
                    };
                    match event {
                        CommEvent::Msg(msg) => node.dispatch(msg).await,
                        CommEvent::Disconnected { peer } => node.handle_disconnect(&peer).await,
                    }
                }
            });
            self.tasks.lock().await.push(handle);
        }

        self.peer_manager
            .start(self.config.peer_sweep_interval, self.config.stale_peer_age)
            .await;
        self.router.start(self.config.seen_sweep_interval).await;
        self.protocol
            .start(
                self.config.route_announce_interval,
                self.config.route_cleanup_interval,
            )
            .await;
        self.discovery.start(self.config.discovery_interval).await;
        self.control.start().await;
        self.crl
            .start(
                self.config.crl_announce_interval,
                self.config.crl_sweep_interval,
            )
            .await;
        if let Some(manager) = &self.cert_manager {
            manager.start(self.config.cert_check_interval).await;
        }
    }

    /// Accept inbound TCP transports until stopped.
    pub async fn start_listener(self: &Arc<Self>, acceptor: TcpAcceptor) {
        let node = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    accepted = acceptor.accept() => accepted,
                };
                match accepted {
                    Ok((transport, addr)) => {
                        trace!("Inbound transport from {addr}");
                        if let Err(err) = node.accept_transport(Box::new(transport)).await {
                            warn!("Rejected inbound transport from {addr}: {err}");
                        }
                    }
                    Err(err) => {
                        warn!("Accept failed: {err}");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Stop every task, persist caches and close all connections.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handles: Vec<_> = { self.tasks.lock().await.drain(..).collect() };
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(manager) = &self.cert_manager {
            manager.stop().await;
        }
        self.crl.stop().await;
        self.control.stop().await;
        self.discovery.stop().await;
        self.protocol.stop().await;
        self.router.stop().await;
        self.peer_manager.stop().await;
        self.comm.close_all().await;

        let _event = self.audit.log_event(
            EventType::NodeStopped,
            "Node stopped",
            "success",
            None,
            None,
            Value::Null,
        );
    }

    async fn dispatch(&self, incoming: MsgFromPeer) {
        let MsgFromPeer { sender, msg } = incoming;
        Metrics::incr(&self.metrics.messages_received);

        // a revoked node gets no audience at all
        if self.control.is_node_revoked(&msg.sender).await {
            Metrics::incr(&self.metrics.messages_dropped);
            return;
        }

        match msg.msg_type {
            MsgType::Handshake => self.handle_handshake(&sender, &msg, false).await,
            MsgType::HandshakeAck => self.handle_handshake(&sender, &msg, true).await,
            // answered inside the connection
            MsgType::Ping | MsgType::Pong | MsgType::DataAck => {}
            MsgType::Disconnect => {
                debug!("Peer {} asked to disconnect", msg.sender);
                self.comm.remove(&sender).await;
            }
            MsgType::PeerRequest => self.discovery.handle_peer_request(&msg).await,
            MsgType::PeerResponse | MsgType::PeerAnnounce => {
                let _added = self.discovery.handle_peer_list(&msg).await;
            }
            MsgType::RouteAnnounce | MsgType::RouteUpdate => {
                let _updated = self.protocol.handle_route_announce(&msg).await;
            }
            MsgType::RouteWithdraw => {
                let _removed = self.protocol.handle_route_withdraw(&msg).await;
            }
            MsgType::Data => self.handle_data(msg).await,
            MsgType::ControlMessage => self.handle_control(&msg).await,
            MsgType::PolicyUpdate => self.handle_policy_manifest(&msg).await,
            MsgType::Revocation => self.crl.handle(&msg).await,
            MsgType::ServiceAnnounce | MsgType::ServiceResponse => {
                let _accepted = self.services.handle_service_list(&msg).await;
            }
            MsgType::ServiceRequest => self.services.handle_service_request(&msg).await,
        }
        self.peer_manager.mark_seen(&sender).await;
    }

    async fn handle_data(&self, msg: WireMsg) {
        let sender = msg.sender.clone();
        let payload: Option<DataPayload> = msg.payload_as().ok();
        match self.router.route_message(msg).await {
            RouteOutcome::DeliveredLocal => {
                let bytes = payload.and_then(|data| data.to_bytes());
                match bytes {
                    Some(bytes) => {
                        if self.data_tx.send((sender, bytes)).await.is_err() {
                            trace!("No local data consumer, payload discarded");
                        }
                    }
                    None => {
                        Metrics::incr(&self.metrics.messages_dropped);
                        warn!("DATA payload from {sender} undecodable");
                    }
                }
            }
            RouteOutcome::Forwarded(_) | RouteOutcome::Broadcast(_) => {
                Metrics::incr(&self.metrics.messages_forwarded);
            }
            RouteOutcome::Dropped(reason) => {
                Metrics::incr(&self.metrics.messages_dropped);
                trace!("Dropped DATA from {sender}: {reason:?}");
            }
        }
    }

    async fn handle_control(&self, msg: &WireMsg) {
        Metrics::incr(&self.metrics.control_received);
        let control_msg: ControlMessage = match msg.payload_as() {
            Ok(control_msg) => control_msg,
            Err(err) => {
                Metrics::incr(&self.metrics.control_rejected);
                warn!("Undecodable control message from {}: {err}", msg.sender);
                return;
            }
        };
        match self.control.handle(&control_msg).await {
            Ok(_) => Metrics::incr(&self.metrics.control_accepted),
            Err(err) => {
                Metrics::incr(&self.metrics.control_rejected);
                debug!("Control message rejected: {err}");
            }
        }
    }

    /// A `policy_update` wire message carries a full NA-signed manifest.
    async fn handle_policy_manifest(&self, msg: &WireMsg) {
        let manifest: PolicyManifest = match msg.payload_as() {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!("Undecodable policy manifest from {}: {err}", msg.sender);
                return;
            }
        };
        let na_key = &self.genesis.network_authority.public_key;
        let verified = manifest
            .signatures
            .iter()
            .any(|sig| gm_interface::trust::verify_object(&manifest, sig, na_key));
        if !verified {
            self.audit.signature_invalid(&msg.sender, "policy manifest");
            return;
        }
        info!("Installed policy manifest {}", manifest.policy_id);
        self.audit.policy_updated(&manifest.policy_id, &manifest.issued_by);
        *self.policy.write().await = Some(manifest);
    }

    async fn handle_handshake(&self, conn_id: &str, msg: &WireMsg, is_ack: bool) {
        let payload: HandshakePayload = match msg.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Undecodable handshake from {conn_id}: {err}");
                self.audit
                    .authentication_failure(conn_id, "undecodable handshake");
                self.comm.remove(conn_id).await;
                return;
            }
        };
        let peer_id = payload.node_id.clone();

        if let Err(err) = self.admit_peer(conn_id, &payload).await {
            Metrics::incr(&self.metrics.connections_failed);
            self.audit.authentication_failure(&peer_id, &err.to_string());
            self.peer_manager.record_attempt(conn_id, false).await;
            self.comm.remove(conn_id).await;
            return;
        }

        Metrics::incr(&self.metrics.connections_established);
        self.audit
            .node_joined(&peer_id, payload.endpoint.as_deref().unwrap_or("inbound"));

        if !is_ack {
            // complete the exchange so the peer establishes too
            match self.build_handshake_payload().await {
                Ok(ours) => match WireMsg::handshake_ack(&self.id, &peer_id, &ours) {
                    Ok(ack) => {
                        if let Some(conn) = self.comm.get(&peer_id) {
                            if let Err(err) = conn.send_priority(ack).await {
                                warn!("Failed to send handshake ack to {peer_id}: {err}");
                            }
                        }
                    }
                    Err(err) => error!("Failed to build handshake ack: {err}"),
                },
                Err(err) => warn!("Cannot ack handshake: {err}"),
            }
        }
    }

    /// The admission pipeline shared by handshake and handshake-ack.
    async fn admit_peer(&self, conn_id: &str, payload: &HandshakePayload) -> Result<()> {
        let cert = &payload.certificate;
        let peer_id = &payload.node_id;

        // identity must be the certified key
        if *peer_id != cert.node_public_key {
            return Err(Error::Validation(
                "handshake id does not match certified key".to_string(),
            ));
        }
        self.verify_join_certificate(cert, now_secs())?;
        if self.crl.is_certificate_revoked(&cert.cert_id).await
            || self.control.is_certificate_revoked(&cert.cert_id).await
        {
            return Err(Error::Authorization("certificate is revoked".to_string()));
        }
        if self.control.is_node_revoked(peer_id).await
            || self.peer_manager.is_blacklisted(peer_id).await
        {
            return Err(Error::Authorization("node is revoked".to_string()));
        }

        let known_endpoint = self
            .peer_manager
            .get_peer(conn_id)
            .await
            .map(|state| state.entry.endpoint);
        let entry = PeerEntry {
            node_id: peer_id.clone(),
            endpoint: payload
                .endpoint
                .clone()
                .or(known_endpoint)
                .unwrap_or_default(),
            roles: payload.roles.clone(),
            last_seen: now_secs(),
            reputation: self
                .peer_manager
                .get_peer(peer_id)
                .await
                .map(|state| state.entry.reputation)
                .unwrap_or(1.0),
            latency_ms: None,
        };

        let admitted = if conn_id != peer_id && self.peer_manager.get_peer(conn_id).await.is_some()
        {
            self.peer_manager.replace_placeholder(conn_id, entry).await?
        } else {
            self.peer_manager
                .add_peer(entry, payload.roles.iter().any(|r| r == "role:anchor"))
                .await?
        };
        if !admitted {
            return Err(Error::Authorization("peer not admitted".to_string()));
        }

        if conn_id != peer_id && !self.comm.rename(conn_id, peer_id).await {
            return Err(Error::Validation(
                "connection vanished mid-handshake".to_string(),
            ));
        }
        match self.comm.get(peer_id) {
            Some(conn) => conn.set_established().await,
            None => {
                return Err(Error::Validation(
                    "connection vanished mid-handshake".to_string(),
                ))
            }
        }

        self.table
            .add_neighbor(peer_id, NEIGHBOR_LINK_METRIC, now_secs())
            .await;
        self.peer_manager.record_attempt(peer_id, true).await;
        Ok(())
    }

    async fn handle_disconnect(&self, peer: &str) {
        debug!("Connection to {peer} ended");
        self.comm.remove(peer).await;
        let invalidated = self.table.remove_neighbor(peer).await;
        if !invalidated.is_empty() {
            self.protocol.send_withdraw(invalidated).await;
        }
        if self.peer_manager.get_peer(peer).await.is_some() {
            self.audit.node_left(peer, "disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gm_interface::trust::sign_object;
    use gm_interface::types::keys::{encode_public, gen_keypair};

    fn signed_genesis(root: &Keypair, na: &Keypair) -> GenesisBlock {
        let mut genesis = GenesisBlock {
            network_name: "TEST".to_string(),
            network_version: "1.0".to_string(),
            root_public_key: encode_public(&root.public),
            network_authority: gm_interface::trust::NetworkAuthority {
                public_key: encode_public(&na.public),
                valid_from: 0,
                valid_to: u64::MAX,
            },
            allowed_crypto_suites: vec!["ed25519".to_string()],
            allowed_transports: vec!["quic".to_string()],
            policy_manifest: gm_interface::trust::PolicyManifestRef {
                hash: "sha256:00".to_string(),
                url: None,
            },
            bootstrap_anchors: vec![],
            signatures: vec![],
        };
        genesis.sign(root, "root-1").expect("sign");
        genesis
    }

    fn certificate_for(na: &Keypair, holder: &Keypair, network: &str) -> JoinCertificate {
        let now = now_secs();
        let mut cert = JoinCertificate {
            cert_id: Uuid::new_v4().to_string(),
            node_public_key: encode_public(&holder.public),
            network_name: network.to_string(),
            roles: vec!["role:client".to_string()],
            issued_at: now - 60,
            expires_at: now + 86_400,
            issued_by: "na-1".to_string(),
            signatures: vec![],
        };
        let sig = sign_object(&cert, na, "na-1").expect("sign");
        cert.signatures.push(sig);
        cert
    }

    #[tokio::test]
    async fn tampered_genesis_is_fatal() {
        let root = gen_keypair();
        let na = gen_keypair();
        let mut genesis = signed_genesis(&root, &na);
        genesis.network_name = "TAMPERED".to_string();

        let result = MeshNode::new(NodeContext::new(genesis, gen_keypair(), vec![]));
        assert_matches::assert_matches!(result, Err(Error::Fatal(_)));
    }

    #[tokio::test]
    async fn certificate_checks_cover_name_window_and_signature() {
        let root = gen_keypair();
        let na = gen_keypair();
        let node_keys = gen_keypair();
        let cert = certificate_for(&na, &node_keys, "TEST");
        let node = MeshNode::new(NodeContext::new(
            signed_genesis(&root, &na),
            node_keys,
            vec!["role:client".to_string()],
        ))
        .expect("node");

        node.verify_join_certificate(&cert, now_secs()).expect("valid");

        let mut wrong_network = cert.clone();
        wrong_network.network_name = "OTHER".to_string();
        assert_matches::assert_matches!(
            node.verify_join_certificate(&wrong_network, now_secs()),
            Err(Error::Validation(_))
        );

        assert_matches::assert_matches!(
            node.verify_join_certificate(&cert, cert.expires_at + 1),
            Err(Error::Stale(_))
        );

        let mut tampered = cert;
        tampered.roles.push("role:admin".to_string());
        assert_matches::assert_matches!(
            node.verify_join_certificate(&tampered, now_secs()),
            Err(Error::Signature)
        );
    }

    #[tokio::test]
    async fn install_certificate_refuses_foreign_signer() {
        let root = gen_keypair();
        let na = gen_keypair();
        let node_keys = gen_keypair();
        let impostor = gen_keypair();

        let node = MeshNode::new(NodeContext::new(
            signed_genesis(&root, &na),
            node_keys,
            vec![],
        ))
        .expect("node");

        let holder = gen_keypair();
        let forged = certificate_for(&impostor, &holder, "TEST");
        assert_matches::assert_matches!(
            node.install_certificate(forged).await,
            Err(Error::Signature)
        );
    }
}
