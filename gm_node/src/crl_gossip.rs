// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Gossip distribution of the certificate revocation list.
//!
//! Three exchanges share the `revocation` wire message: the periodic
//! sequence announce, the targeted pull (`request_crl` / `crl_data`) and
//! the unsolicited `emergency_crl` broadcast. Invalid signatures, unknown
//! issuers and non-progressing sequences are dropped silently.

use super::audit::AuditLog;
use super::control::KeyLookup;

use gm_comms::Comm;
use gm_interface::{
    messaging::{RevocationPayload, WireMsg},
    now_secs,
    trust::{verify_object, CertificateRevocationList},
    types::NodeId,
};

use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// CRL cache tunables.
#[derive(Clone, Debug)]
pub struct CrlConfig {
    /// Cached CRL versions beyond the current one.
    pub cache_capacity: usize,
    /// Age past which non-current versions are evicted.
    pub cache_retention: Duration,
}

impl Default for CrlConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 50,
            cache_retention: Duration::from_secs(86_400),
        }
    }
}

/// Cache view for tests and metrics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrlCacheStats {
    pub cache_size: usize,
    pub current_sequence: Option<u64>,
    pub cached_sequences: Vec<u64>,
}

/// Holds the node's current CRL and gossips it with neighbors.
pub struct CrlGossip {
    node_id: NodeId,
    comm: Comm,
    key_lookup: KeyLookup,
    audit: Arc<AuditLog>,
    config: CrlConfig,
    current: RwLock<Option<CertificateRevocationList>>,
    // sequence -> (inserted at, CRL)
    cache: Mutex<BTreeMap<u64, (u64, CertificateRevocationList)>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CrlGossip {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let sequence = self
            .current
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|crl| crl.sequence));
        f.debug_struct("CrlGossip")
            .field("node_id", &self.node_id)
            .field("current_sequence", &sequence)
            .finish()
    }
}

impl CrlGossip {
    pub fn new(
        node_id: &str,
        comm: Comm,
        key_lookup: KeyLookup,
        audit: Arc<AuditLog>,
        config: CrlConfig,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            comm,
            key_lookup,
            audit,
            config,
            current: RwLock::new(None),
            cache: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The sequence of the current CRL, if any.
    pub async fn current_sequence(&self) -> Option<u64> {
        self.current.read().await.as_ref().map(|crl| crl.sequence)
    }

    /// A clone of the current CRL.
    pub async fn current_crl(&self) -> Option<CertificateRevocationList> {
        self.current.read().await.clone()
    }

    /// Whether the current CRL revokes `cert_id`.
    pub async fn is_certificate_revoked(&self, cert_id: &str) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .map(|crl| crl.is_cert_revoked(cert_id))
            .unwrap_or(false)
    }

    /// Whether the current CRL is past its next-update time.
    pub async fn is_stale(&self, now: u64) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .map(|crl| crl.is_stale(now))
            .unwrap_or(false)
    }

    async fn store(&self, crl: CertificateRevocationList) {
        {
            let mut cache = self.cache.lock().await;
            let _prev = cache.insert(crl.sequence, (now_secs(), crl.clone()));
        }
        *self.current.write().await = Some(crl);
    }

    /// Install a CRL without gossip-side checks, e.g. from bootstrap.
    pub async fn set_crl(&self, crl: CertificateRevocationList) {
        info!("Set CRL (seq {})", crl.sequence);
        self.store(crl).await;
    }

    /// Announce our sequence to all neighbors. One cycle of the gossip loop.
    pub async fn announce_sequence(&self) {
        let (sequence, crl_id) = match self.current_crl().await {
            Some(crl) => (crl.sequence, crl.crl_id),
            None => return,
        };
        let payload = RevocationPayload::AnnounceSequence { sequence, crl_id };
        match WireMsg::revocation(&self.node_id, None, &payload) {
            Ok(msg) => {
                let sent = self.comm.broadcast(&msg, &Default::default()).await;
                trace!("Announced CRL sequence {sequence} to {sent} peers");
            }
            Err(err) => error!("Failed to announce CRL sequence: {err}"),
        }
    }

    /// Dispatch one inbound `revocation` message.
    pub async fn handle(&self, msg: &WireMsg) {
        let payload: RevocationPayload = match msg.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Undecodable revocation message from {}: {err}", msg.sender);
                return;
            }
        };
        match payload {
            RevocationPayload::AnnounceSequence { sequence, .. } => {
                self.handle_announce(&msg.sender, sequence).await;
            }
            RevocationPayload::RequestCrl => {
                trace!("Received CRL request from {}", msg.sender);
                self.send_crl(&msg.sender).await;
            }
            RevocationPayload::CrlData { crl } => {
                let _installed = self.install(crl).await;
            }
            RevocationPayload::EmergencyCrl { crl } => {
                warn!("Received emergency CRL push from {}", msg.sender);
                let _installed = self.install(crl).await;
            }
        }
    }

    async fn handle_announce(&self, sender: &str, peer_sequence: u64) {
        let ours = self.current_sequence().await;
        match ours {
            None => self.request_crl(sender).await,
            Some(current) if peer_sequence > current => {
                info!("Peer {sender} has newer CRL (seq {peer_sequence} > {current})");
                self.request_crl(sender).await;
            }
            Some(current) if peer_sequence < current => {
                info!("Sending newer CRL to {sender}");
                self.send_crl(sender).await;
            }
            Some(_) => {}
        }
    }

    async fn request_crl(&self, peer_id: &str) {
        match WireMsg::revocation(&self.node_id, Some(peer_id), &RevocationPayload::RequestCrl) {
            Ok(msg) => {
                if let Err(err) = self.comm.send_to(peer_id, msg).await {
                    debug!("Failed to request CRL from {peer_id}: {err}");
                }
            }
            Err(err) => error!("Failed to build CRL request: {err}"),
        }
    }

    async fn send_crl(&self, peer_id: &str) {
        let crl = match self.current_crl().await {
            Some(crl) => crl,
            None => return,
        };
        match WireMsg::revocation(
            &self.node_id,
            Some(peer_id),
            &RevocationPayload::CrlData { crl },
        ) {
            Ok(msg) => {
                if let Err(err) = self.comm.send_to(peer_id, msg).await {
                    debug!("Failed to send CRL to {peer_id}: {err}");
                }
            }
            Err(err) => error!("Failed to build CRL data message: {err}"),
        }
    }

    /// Validate and install a received CRL; re-announce on success.
    ///
    /// Returns whether it was installed. All rejections are silent: an
    /// unknown issuer, a bad signature and a stale sequence look identical
    /// from the outside.
    pub async fn install(&self, crl: CertificateRevocationList) -> bool {
        let issuer_key = match (self.key_lookup)(&crl.issuer).await {
            Some(key) => key,
            None => {
                debug!("Dropping CRL from unknown issuer {}", crl.issuer);
                return false;
            }
        };
        let signed = crl
            .signatures
            .iter()
            .any(|sig| verify_object(&crl, sig, &issuer_key));
        if !signed {
            debug!("Dropping CRL seq {}: signature invalid", crl.sequence);
            self.audit.signature_invalid(&crl.issuer, "CRL");
            return false;
        }
        if let Some(current) = self.current_sequence().await {
            if crl.sequence <= current {
                trace!("Received CRL is not newer (seq {})", crl.sequence);
                return false;
            }
        }

        info!(
            "Accepted new CRL (seq {}, {} revocations)",
            crl.sequence,
            crl.revoked_certificates.len()
        );
        self.audit
            .crl_updated(crl.sequence, crl.revoked_certificates.len());
        self.store(crl).await;
        self.announce_sequence().await;
        true
    }

    /// Install a freshly issued CRL locally and broadcast it immediately,
    /// short-circuiting the pull cycle.
    pub async fn push_emergency(&self, crl: CertificateRevocationList) {
        warn!("Emergency CRL push (seq {})", crl.sequence);
        self.store(crl.clone()).await;
        match WireMsg::revocation(&self.node_id, None, &RevocationPayload::EmergencyCrl { crl }) {
            Ok(msg) => {
                let _sent = self.comm.broadcast(&msg, &Default::default()).await;
            }
            Err(err) => error!("Failed to build emergency CRL broadcast: {err}"),
        }
    }

    /// Evict cached versions beyond capacity or retention age; the current
    /// version always survives.
    pub async fn sweep_cache(&self) {
        let current = self.current_sequence().await;
        let now = now_secs();
        let retention = self.config.cache_retention.as_secs();
        let mut cache = self.cache.lock().await;

        while cache.len() > self.config.cache_capacity {
            let oldest = match cache.keys().next().copied() {
                Some(seq) if Some(seq) != current => seq,
                // the lowest key is the current one; take the next lowest
                Some(_) => match cache.keys().nth(1).copied() {
                    Some(seq) => seq,
                    None => break,
                },
                None => break,
            };
            let _prev = cache.remove(&oldest);
        }

        let aged: Vec<u64> = cache
            .iter()
            .filter(|(seq, (inserted, _))| {
                Some(**seq) != current && now.saturating_sub(*inserted) > retention
            })
            .map(|(seq, _)| *seq)
            .collect();
        for seq in aged {
            let _prev = cache.remove(&seq);
        }
    }

    pub async fn cache_stats(&self) -> CrlCacheStats {
        let current_sequence = self.current_sequence().await;
        let cache = self.cache.lock().await;
        CrlCacheStats {
            cache_size: cache.len(),
            current_sequence,
            cached_sequences: cache.keys().copied().collect(),
        }
    }

    /// Start the announce and cache-sweep loops.
    pub async fn start(self: &Arc<Self>, announce_interval: Duration, sweep_interval: Duration) {
        let gossip = self.clone();
        let announce = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = gossip.cancel.cancelled() => break,
                    _ = tokio::time::sleep(announce_interval) => {}
                }
                gossip.announce_sequence().await;
            }
        });

        let gossip = self.clone();
        let sweep = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = gossip.cancel.cancelled() => break,
                    _ = tokio::time::sleep(sweep_interval) => {}
                }
                gossip.sweep_cache().await;
            }
        });

        self.tasks.lock().await.extend([announce, sweep]);
    }

    /// Cancel both loops and wait for them to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = { self.tasks.lock().await.drain(..).collect() };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
