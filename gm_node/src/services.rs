// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The service-mesh registry: NA-signed service manifests learned from
//! `service_announce` exchanges.

use super::control::KeyLookup;

use gm_comms::Comm;
use gm_interface::{
    messaging::{MsgType, ServiceListPayload, WireMsg},
    now_secs,
    trust::{verify_object, ServiceManifest},
    types::NodeId,
};

use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Known services and their verified manifests.
pub struct ServiceRegistry {
    node_id: NodeId,
    comm: Comm,
    key_lookup: KeyLookup,
    services: Mutex<HashMap<String, ServiceManifest>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new(node_id: &str, comm: Comm, key_lookup: KeyLookup) -> Self {
        Self {
            node_id: node_id.to_string(),
            comm,
            key_lookup,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Merge a `service_announce` or `service_response`.
    ///
    /// Manifests with unknown issuers, bad signatures or lapsed validity
    /// are dropped silently, like any other trust failure on the gossip
    /// plane.
    pub async fn handle_service_list(&self, msg: &WireMsg) -> usize {
        let payload: ServiceListPayload = match msg.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Undecodable service list from {}: {err}", msg.sender);
                return 0;
            }
        };
        let now = now_secs();
        let mut accepted = 0;
        for manifest in payload.services {
            if !manifest.is_valid(now) {
                continue;
            }
            let issuer_key = match (self.key_lookup)(&manifest.issued_by).await {
                Some(key) => key,
                None => continue,
            };
            let signed = manifest
                .signatures
                .iter()
                .any(|sig| verify_object(&manifest, sig, &issuer_key));
            if !signed {
                continue;
            }
            let mut services = self.services.lock().await;
            let _prev = services.insert(manifest.service_name.clone(), manifest);
            accepted += 1;
        }
        if accepted > 0 {
            debug!("Accepted {accepted} service manifests from {}", msg.sender);
        }
        accepted
    }

    /// Answer a `service_request` with everything we know.
    pub async fn handle_service_request(&self, msg: &WireMsg) {
        let services: Vec<ServiceManifest> =
            self.services.lock().await.values().cloned().collect();
        let response = match WireMsg::service_list(
            MsgType::ServiceResponse,
            &self.node_id,
            Some(&msg.sender),
            &ServiceListPayload { services },
        ) {
            Ok(response) => response,
            Err(err) => {
                error!("Failed to build service response: {err}");
                return;
            }
        };
        if let Err(err) = self.comm.send_to(&msg.sender, response).await {
            debug!("Failed to send service response: {err}");
        }
    }

    /// A known service manifest by name.
    pub async fn get(&self, service_name: &str) -> Option<ServiceManifest> {
        self.services.lock().await.get(service_name).cloned()
    }

    /// All known service names.
    pub async fn service_names(&self) -> Vec<String> {
        self.services.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gm_comms::{CommEvent, ConnectionConfig};
    use gm_interface::trust::sign_object;
    use gm_interface::types::keys::{encode_public, gen_keypair};
    use tokio::sync::mpsc;

    fn manifest(name: &str, now: u64) -> ServiceManifest {
        ServiceManifest {
            service_name: name.to_string(),
            service_key: "svc-key".to_string(),
            endpoints: vec![format!("https://{name}.mesh")],
            issued_at: now - 10,
            valid_to: now + 3600,
            issued_by: "na-1".to_string(),
            signatures: vec![],
        }
    }

    #[tokio::test]
    async fn only_verified_manifests_are_registered() {
        let keypair = gen_keypair();
        let public = encode_public(&keypair.public);
        let (tx, _rx): (mpsc::Sender<CommEvent>, _) = mpsc::channel(8);
        let lookup: KeyLookup = Arc::new(move |key_id: &str| {
            let public = (key_id == "na-1").then(|| public.clone());
            Box::pin(async move { public })
        });
        let registry = ServiceRegistry::new(
            "self",
            Comm::new("self", 50, ConnectionConfig::default(), tx),
            lookup,
        );

        let now = now_secs();
        let mut good = manifest("dns", now);
        let sig = sign_object(&good, &keypair, "na-1").expect("sign");
        good.signatures.push(sig);

        let unsigned = manifest("unsigned", now);
        let mut lapsed = manifest("lapsed", now - 7200);
        lapsed.valid_to = now - 3600;
        let lapsed_sig = sign_object(&lapsed, &keypair, "na-1").expect("sign");
        lapsed.signatures.push(lapsed_sig);

        let msg = WireMsg::service_list(
            MsgType::ServiceAnnounce,
            "peer",
            None,
            &ServiceListPayload {
                services: vec![good, unsigned, lapsed],
            },
        )
        .expect("msg");

        assert_eq!(registry.handle_service_list(&msg).await, 1);
        assert!(registry.get("dns").await.is_some());
        assert!(registry.get("unsigned").await.is_none());
        assert!(registry.get("lapsed").await.is_none());
    }
}
