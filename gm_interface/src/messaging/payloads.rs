// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::trust::{CertificateRevocationList, JoinCertificate, ServiceManifest};
use crate::types::NodeId;

use serde::{Deserialize, Serialize};

fn default_protocol_version() -> String {
    "1.0".to_string()
}

/// Payload of `handshake` and `handshake_ack`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Protocol version.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// The sender's node id.
    pub node_id: NodeId,
    /// The sender's join certificate.
    pub certificate: JoinCertificate,
    /// Capabilities advertised by the sender.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Roles the sender operates under.
    pub roles: Vec<String>,
    /// The endpoint the sender accepts connections on, if it listens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// One known peer, as exchanged during discovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Node identifier.
    pub node_id: NodeId,
    /// Connection endpoint, `host:port`.
    pub endpoint: String,
    /// Node roles.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Last contact, UNIX seconds.
    pub last_seen: u64,
    /// Reputation score in [0, 1].
    pub reputation: f64,
    /// Round-trip latency in milliseconds, if measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

/// Payload of `peer_announce` and `peer_response`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerListPayload {
    /// The shared peers.
    pub peers: Vec<PeerEntry>,
}

/// One advertised route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination node id.
    pub destination: NodeId,
    /// Next hop from the receiver's perspective (the announcer itself).
    pub next_hop: NodeId,
    /// Route metric as seen by the announcer.
    pub metric: u32,
    /// Destination sequence number.
    pub sequence: u64,
    /// When the announcer learned the route, UNIX seconds.
    pub timestamp: u64,
}

/// Payload of `route_announce` and `route_update`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAnnouncePayload {
    /// The advertised routes.
    pub routes: Vec<RouteEntry>,
}

/// Payload of `route_withdraw`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteWithdrawPayload {
    /// Destinations no longer reachable through the sender.
    pub destinations: Vec<NodeId>,
}

/// Payload of `data`: application bytes in base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    /// Base64 of the carried bytes.
    pub data: String,
}

impl DataPayload {
    /// Wrap raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: base64::encode(bytes),
        }
    }

    /// Unwrap to raw bytes.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        base64::decode(&self.data).ok()
    }
}

/// Payload of `revocation`, discriminated by its `action` tag.
///
/// Three protocols share the one message type: the periodic sequence
/// announce, the targeted pull (`request_crl`/`crl_data`) and the
/// unsolicited emergency broadcast.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RevocationPayload {
    /// Advertises the sender's current CRL sequence.
    AnnounceSequence {
        /// Current sequence number.
        sequence: u64,
        /// Current CRL id.
        crl_id: String,
    },
    /// Asks the recipient for its current CRL.
    RequestCrl,
    /// Carries a full CRL in response to a request.
    CrlData {
        /// The CRL.
        crl: CertificateRevocationList,
    },
    /// Unsolicited broadcast of a newly issued CRL.
    EmergencyCrl {
        /// The CRL.
        crl: CertificateRevocationList,
    },
}

/// Payload of `service_announce` and `service_response`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceListPayload {
    /// The shared service manifests.
    pub services: Vec<ServiceManifest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revocation_payload_uses_action_tag() {
        let payload = RevocationPayload::AnnounceSequence {
            sequence: 7,
            crl_id: "crl-1".to_string(),
        };
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["action"], "announce_sequence");
        assert_eq!(value["sequence"], 7);

        let value = serde_json::to_value(&RevocationPayload::RequestCrl).expect("serialize");
        assert_eq!(value["action"], "request_crl");
    }

    #[test]
    fn data_payload_roundtrips_bytes() {
        let payload = DataPayload::from_bytes(b"hello mesh");
        assert_eq!(payload.to_bytes().expect("decode"), b"hello mesh");
    }
}
