// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Control-plane command execution: RBAC gating, replay protection and the
//! per-command handlers.

use super::audit::AuditLog;
use super::error::{Error, Result};
use super::rbac::RbacEnforcer;

use gm_interface::{
    now_secs,
    trust::{ControlCommand, ControlMessage},
    types::NodeId,
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;

/// Resolves an issuer key id into a base64 public key.
pub type KeyLookup = Arc<dyn Fn(&str) -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// New policy data was accepted.
pub type PolicyObserver = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;
/// A certificate or node was revoked (id, reason).
pub type RevokedObserver = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;
/// The bootstrap anchor list was replaced.
pub type BootstrapObserver = Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, ()> + Send + Sync>;
/// A shutdown was requested (reason); fired after the grace period.
pub type ShutdownObserver = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observers for the side effects of executed commands. Single
/// function-typed fields; composing several observers is the caller's
/// concern. Each invocation is a suspension point.
#[derive(Clone, Default)]
pub struct ControlObservers {
    pub on_policy_update: Option<PolicyObserver>,
    pub on_cert_revoked: Option<RevokedObserver>,
    pub on_node_revoked: Option<RevokedObserver>,
    pub on_bootstrap_update: Option<BootstrapObserver>,
    pub on_shutdown: Option<ShutdownObserver>,
}

impl std::fmt::Debug for ControlObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ControlObservers").finish_non_exhaustive()
    }
}

/// A locally cached revocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevocationRecord {
    pub reason: String,
    pub revoked_at: u64,
    pub revoked_by: String,
}

/// Replay-cache tunables.
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// Entry lifetime.
    pub ttl: Duration,
    /// Sweep cadence.
    pub sweep_interval: Duration,
    /// Hard cap; exceeding it trims to `retain` newest entries.
    pub hard_cap: usize,
    /// Entries surviving a cap trim.
    pub retain: usize,
    /// Snapshot file, loaded on start and saved on stop.
    pub persist_path: Option<PathBuf>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            hard_cap: 10_000,
            retain: 5_000,
            persist_path: None,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct ReplaySnapshot {
    processed: HashMap<String, u64>,
}

/// Validates and executes control messages, at most once each.
pub struct ControlHandler {
    node_id: NodeId,
    rbac: RbacEnforcer,
    key_lookup: KeyLookup,
    observers: ControlObservers,
    audit: Arc<AuditLog>,
    replay_config: ReplayConfig,
    default_grace: Duration,
    processed: Mutex<HashMap<String, u64>>,
    revoked_certs: Mutex<HashMap<String, RevocationRecord>>,
    revoked_nodes: Mutex<HashMap<String, RevocationRecord>>,
    bootstrap_anchors: Mutex<Vec<String>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ControlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ControlHandler")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl ControlHandler {
    pub fn new(
        node_id: &str,
        rbac: RbacEnforcer,
        key_lookup: KeyLookup,
        observers: ControlObservers,
        audit: Arc<AuditLog>,
        replay_config: ReplayConfig,
        default_grace: Duration,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            rbac,
            key_lookup,
            observers,
            audit,
            replay_config,
            default_grace,
            processed: Mutex::new(HashMap::new()),
            revoked_certs: Mutex::new(HashMap::new()),
            revoked_nodes: Mutex::new(HashMap::new()),
            bootstrap_anchors: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Validate and execute one control message.
    ///
    /// Preconditions, in order: RBAC passes (signatures always re-verify,
    /// even on a resent id), the id has not been processed, and the target
    /// (if any) is us. The id is recorded once every precondition holds,
    /// so the command runs at most once even if its handler fails midway.
    pub async fn handle(&self, msg: &ControlMessage) -> Result<String> {
        let keys = self.resolve_signer_keys(msg).await;
        if let Err(err) = self
            .rbac
            .validate(msg, &|key_id| keys.get(key_id).cloned(), now_secs())
        {
            match &err {
                Error::Signature => self.audit.signature_invalid(&msg.issuer, "control message"),
                other => self.audit.authorization_denied(
                    &msg.issuer,
                    &msg.command.to_string(),
                    &other.to_string(),
                ),
            }
            return Err(err);
        }

        let already = self.processed.lock().await.contains_key(&msg.message_id);
        if already {
            let err = Error::Authorization("control message already processed".to_string());
            self.audit
                .control_message(&msg.command.to_string(), &msg.issuer, false, Some("replay"));
            return Err(err);
        }

        if let Some(target) = &msg.target {
            if *target != self.node_id {
                trace!("Control message not for us (target={target})");
                return Err(Error::Authorization(
                    "message not targeted at this node".to_string(),
                ));
            }
        }

        {
            let mut processed = self.processed.lock().await;
            let _prev = processed.insert(msg.message_id.clone(), now_secs());
        }

        let outcome = self.execute(msg).await;
        match &outcome {
            Ok(_) => {
                info!("Executed control command {} from {}", msg.command, msg.issuer);
                self.audit
                    .control_message(&msg.command.to_string(), &msg.issuer, true, None);
            }
            Err(err) => {
                self.audit.control_message(
                    &msg.command.to_string(),
                    &msg.issuer,
                    false,
                    Some(&err.to_string()),
                );
            }
        }
        outcome
    }

    /// Resolve every signer key id up front; unknown ids simply resolve to
    /// nothing and count as invalid during validation.
    async fn resolve_signer_keys(&self, msg: &ControlMessage) -> HashMap<String, String> {
        let mut keys = HashMap::new();
        for sig in &msg.signatures {
            if keys.contains_key(&sig.key_id) {
                continue;
            }
            if let Some(public) = (self.key_lookup)(&sig.key_id).await {
                let _prev = keys.insert(sig.key_id.clone(), public);
            }
        }
        keys
    }

    async fn execute(&self, msg: &ControlMessage) -> Result<String> {
        match msg.command {
            ControlCommand::PolicyUpdate => self.apply_policy_update(msg).await,
            ControlCommand::RevokeCertificate => self.apply_revoke_certificate(msg).await,
            ControlCommand::RevokeNode => self.apply_revoke_node(msg).await,
            ControlCommand::UpdateBootstrap => self.apply_update_bootstrap(msg).await,
            ControlCommand::ShutdownNode => self.apply_shutdown(msg),
            ControlCommand::RotateKeys => {
                // reserved; acknowledged but deliberately without effect
                Ok("rotate_keys acknowledged".to_string())
            }
        }
    }

    async fn apply_policy_update(&self, msg: &ControlMessage) -> Result<String> {
        let policy = msg
            .data
            .get("policy")
            .cloned()
            .ok_or_else(|| Error::Validation("policy update without policy data".to_string()))?;
        let policy_id = policy
            .get("policy_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if let Some(observer) = &self.observers.on_policy_update {
            observer(policy).await;
        }
        self.audit.policy_updated(&policy_id, &msg.issuer);
        Ok(format!("policy {policy_id} applied"))
    }

    async fn apply_revoke_certificate(&self, msg: &ControlMessage) -> Result<String> {
        let cert_id = msg
            .data
            .get("cert_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("revocation without cert_id".to_string()))?;
        let reason = msg
            .data
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("no reason provided");
        warn!("Certificate {cert_id} revoked: {reason}");

        {
            let mut revoked = self.revoked_certs.lock().await;
            let _prev = revoked.insert(
                cert_id.to_string(),
                RevocationRecord {
                    reason: reason.to_string(),
                    revoked_at: now_secs(),
                    revoked_by: msg.issuer.clone(),
                },
            );
        }
        if let Some(observer) = &self.observers.on_cert_revoked {
            observer(cert_id.to_string(), reason.to_string()).await;
        }
        self.audit.certificate_revoked(cert_id, reason, &msg.issuer);
        Ok(format!("certificate {cert_id} revoked"))
    }

    async fn apply_revoke_node(&self, msg: &ControlMessage) -> Result<String> {
        let node_id = msg
            .data
            .get("node_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("revocation without node_id".to_string()))?;
        let reason = msg
            .data
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("no reason provided");
        warn!("Node {node_id} revoked: {reason}");

        {
            let mut revoked = self.revoked_nodes.lock().await;
            let _prev = revoked.insert(
                node_id.to_string(),
                RevocationRecord {
                    reason: reason.to_string(),
                    revoked_at: now_secs(),
                    revoked_by: msg.issuer.clone(),
                },
            );
        }
        if let Some(observer) = &self.observers.on_node_revoked {
            observer(node_id.to_string(), reason.to_string()).await;
        }
        self.audit.node_blacklisted(node_id, reason);
        Ok(format!("node {node_id} revoked"))
    }

    async fn apply_update_bootstrap(&self, msg: &ControlMessage) -> Result<String> {
        let anchors: Vec<String> = msg
            .data
            .get("anchors")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .ok_or_else(|| Error::Validation("bootstrap update without anchors".to_string()))?;

        *self.bootstrap_anchors.lock().await = anchors.clone();
        let count = anchors.len();
        if let Some(observer) = &self.observers.on_bootstrap_update {
            observer(anchors).await;
        }
        Ok(format!("updated {count} bootstrap anchors"))
    }

    fn apply_shutdown(&self, msg: &ControlMessage) -> Result<String> {
        let reason = msg
            .data
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("no reason provided")
            .to_string();
        let grace = msg
            .data
            .get("grace_period")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.default_grace);
        error!(
            "Received shutdown command: {reason} (grace period: {}s)",
            grace.as_secs()
        );

        if let Some(observer) = self.observers.on_shutdown.clone() {
            let cancel = self.cancel.clone();
            let _handle = tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(grace) => {}
                }
                observer(reason).await;
            });
        }
        Ok(format!("shutdown scheduled in {}s", grace.as_secs()))
    }

    /// Whether a certificate was revoked via the control plane.
    pub async fn is_certificate_revoked(&self, cert_id: &str) -> bool {
        self.revoked_certs.lock().await.contains_key(cert_id)
    }

    /// Whether a node was revoked via the control plane.
    pub async fn is_node_revoked(&self, node_id: &str) -> bool {
        self.revoked_nodes.lock().await.contains_key(node_id)
    }

    /// The current bootstrap anchor list.
    pub async fn bootstrap_anchors(&self) -> Vec<String> {
        self.bootstrap_anchors.lock().await.clone()
    }

    /// Replay-cache size, for tests and metrics.
    pub async fn replay_cache_len(&self) -> usize {
        self.processed.lock().await.len()
    }

    /// Remove replay entries older than the TTL; trim to the retain count
    /// if the cache exceeds its hard cap.
    pub async fn sweep_replay_cache(&self) {
        let now = now_secs();
        let ttl = self.replay_config.ttl.as_secs();
        let mut processed = self.processed.lock().await;

        let before = processed.len();
        processed.retain(|_, stamp| now.saturating_sub(*stamp) <= ttl);
        if before > processed.len() {
            debug!(
                "Cleaned up {} processed message ids",
                before - processed.len()
            );
        }

        if processed.len() > self.replay_config.hard_cap {
            let mut entries: Vec<(String, u64)> =
                processed.iter().map(|(k, v)| (k.clone(), *v)).collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            entries.truncate(self.replay_config.retain);
            *processed = entries.into_iter().collect();
            info!(
                "Trimmed replay cache to {} entries",
                self.replay_config.retain
            );
        }
    }

    async fn load_replay_cache(&self) {
        let path = match &self.replay_config.persist_path {
            Some(path) if path.exists() => path.clone(),
            _ => return,
        };
        match std::fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|text| {
                serde_json::from_str::<ReplaySnapshot>(&text).map_err(|err| err.to_string())
            }) {
            Ok(snapshot) => {
                let count = snapshot.processed.len();
                *self.processed.lock().await = snapshot.processed;
                info!("Loaded {count} replay cache entries");
            }
            Err(err) => error!("Error loading replay cache: {err}"),
        }
    }

    async fn save_replay_cache(&self) {
        let path = match &self.replay_config.persist_path {
            Some(path) => path.clone(),
            None => return,
        };
        let snapshot = ReplaySnapshot {
            processed: self.processed.lock().await.clone(),
        };
        let written = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| err.to_string())
            .and_then(|text| std::fs::write(&path, text).map_err(|err| err.to_string()));
        match written {
            Ok(()) => info!("Saved {} replay cache entries", snapshot.processed.len()),
            Err(err) => error!("Error saving replay cache: {err}"),
        }
    }

    /// Load any persisted replay cache and start the periodic sweep.
    pub async fn start(self: &Arc<Self>) {
        self.load_replay_cache().await;
        let handler = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handler.cancel.cancelled() => break,
                    _ = tokio::time::sleep(handler.replay_config.sweep_interval) => {}
                }
                handler.sweep_replay_cache().await;
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Stop the sweep and persist the replay cache.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = { self.tasks.lock().await.drain(..).collect() };
        for handle in handles {
            let _ = handle.await;
        }
        self.save_replay_cache().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use gm_interface::trust::sign_object;
    use gm_interface::types::keys::{encode_public, gen_keypair, Keypair};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key_lookup_for(keypair: &Keypair) -> KeyLookup {
        let public = encode_public(&keypair.public);
        Arc::new(move |_key_id: &str| {
            let public = public.clone();
            Box::pin(async move { Some(public) })
        })
    }

    fn handler_with_key(keypair: &Keypair, observers: ControlObservers) -> ControlHandler {
        ControlHandler::new(
            "node-1",
            RbacEnforcer::default(),
            key_lookup_for(keypair),
            observers,
            Arc::new(AuditLog::new("node-1", None)),
            ReplayConfig::default(),
            Duration::from_secs(30),
        )
    }

    fn signed(mut msg: ControlMessage, keypair: &Keypair) -> ControlMessage {
        let sig = sign_object(&msg, keypair, &msg.issuer).expect("sign");
        msg.signatures.push(sig);
        msg
    }

    #[tokio::test]
    async fn executes_at_most_once() {
        let keypair = gen_keypair();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let observers = ControlObservers {
            on_cert_revoked: Some(Arc::new(move |_id: String, _reason: String| {
                let seen = seen.clone();
                Box::pin(async move {
                    let _count = seen.fetch_add(1, Ordering::SeqCst);
                })
            })),
            ..Default::default()
        };
        let handler = handler_with_key(&keypair, observers);
        let roles = vec!["role:admin".to_string()];
        let msg = signed(
            ControlMessage::revoke_certificate("admin-1", &roles, "cert-9", "compromise", 1000),
            &keypair,
        );

        handler.handle(&msg).await.expect("first execution");
        assert_matches!(handler.handle(&msg).await, Err(Error::Authorization(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(handler.is_certificate_revoked("cert-9").await);
    }

    #[tokio::test]
    async fn client_issued_commands_are_denied_and_not_executed() {
        let keypair = gen_keypair();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let observers = ControlObservers {
            on_policy_update: Some(Arc::new(move |_policy: Value| {
                let seen = seen.clone();
                Box::pin(async move {
                    let _count = seen.fetch_add(1, Ordering::SeqCst);
                })
            })),
            ..Default::default()
        };
        let handler = handler_with_key(&keypair, observers);
        let roles = vec!["role:client".to_string()];
        let msg = signed(
            ControlMessage::policy_update("client-1", &roles, serde_json::json!({}), 1000, 3600),
            &keypair,
        );

        assert_matches!(handler.handle(&msg).await, Err(Error::Authorization(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        // a denied message is not burned into the replay cache
        assert_eq!(handler.replay_cache_len().await, 0);
    }

    #[tokio::test]
    async fn resent_id_with_forged_content_fails_on_signature_first() {
        let keypair = gen_keypair();
        let handler = handler_with_key(&keypair, ControlObservers::default());
        let roles = vec!["role:admin".to_string()];
        let msg = signed(
            ControlMessage::revoke_node("admin-1", &roles, "node-9", "compromise", 1000),
            &keypair,
        );
        handler.handle(&msg).await.expect("first execution");

        // same message id, tampered body: signature validation runs before
        // the replay cache is consulted
        let mut forged = msg;
        forged.data = serde_json::json!({ "node_id": "some-other-node" });
        assert_matches!(handler.handle(&forged).await, Err(Error::Signature));
    }

    #[tokio::test]
    async fn wrong_target_is_rejected() {
        let keypair = gen_keypair();
        let handler = handler_with_key(&keypair, ControlObservers::default());
        let roles = vec!["role:admin".to_string()];
        let msg = signed(
            ControlMessage::shutdown_node("admin-1", &roles, "some-other-node", "drain", 0, 1000),
            &keypair,
        );
        assert_matches!(handler.handle(&msg).await, Err(Error::Authorization(_)));
    }

    #[tokio::test]
    async fn bootstrap_update_replaces_list() {
        let keypair = gen_keypair();
        let handler = handler_with_key(&keypair, ControlObservers::default());
        let roles = vec!["role:operator".to_string()];
        let anchors = vec!["a.mesh:443".to_string(), "b.mesh:443".to_string()];
        let msg = signed(
            ControlMessage::update_bootstrap("op-1", &roles, &anchors, 1000),
            &keypair,
        );
        handler.handle(&msg).await.expect("execute");
        assert_eq!(handler.bootstrap_anchors().await, anchors);
    }

    #[tokio::test]
    async fn replay_cache_sweeps_by_age_and_cap() {
        let keypair = gen_keypair();
        let mut handler = handler_with_key(&keypair, ControlObservers::default());
        handler.replay_config.hard_cap = 10;
        handler.replay_config.retain = 5;

        {
            let mut processed = handler.processed.lock().await;
            let now = now_secs();
            // one ancient entry, eleven fresh ones
            let _prev = processed.insert("ancient".to_string(), now - 7200);
            for i in 0..11 {
                let _prev = processed.insert(format!("fresh-{i}"), now - i);
            }
        }
        handler.sweep_replay_cache().await;
        assert_eq!(handler.replay_cache_len().await, 5);
        assert!(!handler.processed.lock().await.contains_key("ancient"));
    }

    #[tokio::test]
    async fn replay_cache_persists_across_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replay.json");
        let keypair = gen_keypair();
        let roles = vec!["role:admin".to_string()];
        let msg = signed(
            ControlMessage::revoke_node("admin-1", &roles, "node-9", "compromise", 1000),
            &keypair,
        );

        let first = {
            let mut handler = handler_with_key(&keypair, ControlObservers::default());
            handler.replay_config.persist_path = Some(path.clone());
            let handler = Arc::new(handler);
            handler.start().await;
            handler.handle(&msg).await.expect("execute");
            handler.stop().await;
            handler.replay_cache_len().await
        };
        assert_eq!(first, 1);

        let mut handler = handler_with_key(&keypair, ControlObservers::default());
        handler.replay_config.persist_path = Some(path);
        let handler = Arc::new(handler);
        handler.start().await;
        // the restarted node still refuses the replay
        assert_matches!(handler.handle(&msg).await, Err(Error::Authorization(_)));
        handler.stop().await;
    }
}
