// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Genesis Mesh messaging interface.
//!
//! Everything that travels between two nodes is a [`WireMsg`]: a small JSON
//! envelope whose `msg_type` tag selects the payload shape. Handlers
//! dispatch on the tag and deserialize the payload into one of the typed
//! structs in [`payloads`].

mod payloads;
mod wire_msg;

pub use self::{
    payloads::{
        DataPayload, HandshakePayload, PeerEntry, PeerListPayload, RevocationPayload,
        RouteAnnouncePayload, RouteEntry, RouteWithdrawPayload, ServiceListPayload,
    },
    wire_msg::{WireMsg, DEFAULT_TTL},
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every message type in the mesh, tagged on the wire by its snake_case name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    // Connection management
    Handshake,
    HandshakeAck,
    Ping,
    Pong,
    Disconnect,

    // Peer discovery
    PeerAnnounce,
    PeerRequest,
    PeerResponse,

    // Routing
    RouteAnnounce,
    RouteUpdate,
    RouteWithdraw,

    // Data forwarding
    Data,
    DataAck,

    // Control plane
    ControlMessage,
    PolicyUpdate,
    Revocation,

    // Service mesh
    ServiceAnnounce,
    ServiceRequest,
    ServiceResponse,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // the Display form matches the wire tag
        let tag = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", tag.trim_matches('"'))
    }
}

#[cfg(test)]
mod tests {
    use super::MsgType;

    #[test]
    fn wire_tags_are_normative() {
        for (msg_type, tag) in [
            (MsgType::Handshake, "handshake"),
            (MsgType::HandshakeAck, "handshake_ack"),
            (MsgType::Ping, "ping"),
            (MsgType::Pong, "pong"),
            (MsgType::Disconnect, "disconnect"),
            (MsgType::PeerAnnounce, "peer_announce"),
            (MsgType::PeerRequest, "peer_request"),
            (MsgType::PeerResponse, "peer_response"),
            (MsgType::RouteAnnounce, "route_announce"),
            (MsgType::RouteUpdate, "route_update"),
            (MsgType::RouteWithdraw, "route_withdraw"),
            (MsgType::Data, "data"),
            (MsgType::DataAck, "data_ack"),
            (MsgType::ControlMessage, "control_message"),
            (MsgType::PolicyUpdate, "policy_update"),
            (MsgType::Revocation, "revocation"),
            (MsgType::ServiceAnnounce, "service_announce"),
            (MsgType::ServiceRequest, "service_request"),
            (MsgType::ServiceResponse, "service_response"),
        ] {
            assert_eq!(
                serde_json::to_string(&msg_type).expect("serialize"),
                format!("\"{tag}\"")
            );
            assert_eq!(msg_type.to_string(), tag);
        }
    }
}
