// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::payloads::{
    DataPayload, HandshakePayload, PeerEntry, PeerListPayload, RevocationPayload,
    RouteAnnouncePayload, RouteEntry, RouteWithdrawPayload, ServiceListPayload,
};
use super::MsgType;
use crate::trust::ControlMessage;
use crate::types::errors::{Error, Result};
use crate::types::NodeId;
use crate::now_secs;

use bytes::Bytes;
use custom_debug::Debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default hop budget for a freshly created message.
pub const DEFAULT_TTL: u8 = 10;

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

/// The envelope every mesh message travels in.
///
/// A message with no recipient is a broadcast. The payload is free-form
/// JSON whose shape is implied by `msg_type`; see
/// [`payload_as`](WireMsg::payload_as) for typed access.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMsg {
    /// Unique message identifier.
    pub msg_id: String,
    /// Message type tag.
    pub msg_type: MsgType,
    /// Creation time, UNIX seconds.
    pub timestamp: u64,
    /// Sender node id.
    pub sender: NodeId,
    /// Recipient node id; `None` means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<NodeId>,
    /// Remaining hop budget.
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    /// Message payload.
    #[debug(skip)]
    #[serde(default)]
    pub payload: Value,
    /// Optional Ed25519 signature (control-plane messages sign their own
    /// body instead; this field covers transports without integrity).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl WireMsg {
    /// A new message with a fresh id and the default TTL.
    pub fn new(
        msg_type: MsgType,
        sender: &str,
        recipient: Option<&str>,
        payload: Value,
    ) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type,
            timestamp: now_secs(),
            sender: sender.to_string(),
            recipient: recipient.map(str::to_string),
            ttl: DEFAULT_TTL,
            payload,
            signature: None,
        }
    }

    fn with_payload<T: Serialize>(
        msg_type: MsgType,
        sender: &str,
        recipient: Option<&str>,
        payload: &T,
    ) -> Result<Self> {
        let value = serde_json::to_value(payload)
            .map_err(|err| Error::Serialisation(format!("{msg_type} payload: {err}")))?;
        Ok(Self::new(msg_type, sender, recipient, value))
    }

    /// Serialize for the transport.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let vec = serde_json::to_vec(self)
            .map_err(|err| Error::Serialisation(format!("wire msg: {err}")))?;
        Ok(Bytes::from(vec))
    }

    /// Parse a received frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| Error::FailedToParse(format!("wire msg: {err}")))
    }

    /// Deserialize the payload into its typed shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|err| {
            Error::FailedToParse(format!("{} payload: {err}", self.msg_type))
        })
    }

    /// Whether this message addresses every neighbor.
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Burn one hop. Returns whether the message may still be forwarded.
    pub fn decrement_ttl(&mut self) -> bool {
        self.ttl = self.ttl.saturating_sub(1);
        self.ttl > 0
    }

    // -- constructors for each protocol --

    /// A `handshake` introducing ourselves to a freshly connected peer.
    pub fn handshake(sender: &str, payload: &HandshakePayload) -> Result<Self> {
        Self::with_payload(MsgType::Handshake, sender, None, payload)
    }

    /// A `handshake_ack` completing the exchange.
    pub fn handshake_ack(sender: &str, recipient: &str, payload: &HandshakePayload) -> Result<Self> {
        Self::with_payload(MsgType::HandshakeAck, sender, Some(recipient), payload)
    }

    /// A `ping`; the matching pong echoes this message's id.
    pub fn ping(sender: &str, recipient: &str) -> Self {
        Self::new(
            MsgType::Ping,
            sender,
            Some(recipient),
            serde_json::json!({}),
        )
    }

    /// A `pong` answering the ping with the given id.
    pub fn pong(sender: &str, recipient: &str, ping_id: &str) -> Self {
        Self::new(
            MsgType::Pong,
            sender,
            Some(recipient),
            serde_json::json!({ "ping_id": ping_id }),
        )
    }

    /// A `disconnect` notice.
    pub fn disconnect(sender: &str, recipient: &str, reason: &str) -> Self {
        Self::new(
            MsgType::Disconnect,
            sender,
            Some(recipient),
            serde_json::json!({ "reason": reason }),
        )
    }

    /// A `peer_request` asking for the recipient's peer list.
    pub fn peer_request(sender: &str, recipient: &str) -> Self {
        Self::new(
            MsgType::PeerRequest,
            sender,
            Some(recipient),
            serde_json::json!({}),
        )
    }

    /// A `peer_response` carrying our peer sample.
    pub fn peer_response(sender: &str, recipient: &str, peers: Vec<PeerEntry>) -> Result<Self> {
        Self::with_payload(
            MsgType::PeerResponse,
            sender,
            Some(recipient),
            &PeerListPayload { peers },
        )
    }

    /// A `peer_announce` pushed to neighbors.
    pub fn peer_announce(sender: &str, peers: Vec<PeerEntry>) -> Result<Self> {
        Self::with_payload(MsgType::PeerAnnounce, sender, None, &PeerListPayload { peers })
    }

    /// A `route_announce` broadcast.
    pub fn route_announce(sender: &str, routes: Vec<RouteEntry>) -> Result<Self> {
        Self::with_payload(
            MsgType::RouteAnnounce,
            sender,
            None,
            &RouteAnnouncePayload { routes },
        )
    }

    /// A `route_withdraw` advisory.
    pub fn route_withdraw(sender: &str, destinations: Vec<NodeId>) -> Result<Self> {
        Self::with_payload(
            MsgType::RouteWithdraw,
            sender,
            None,
            &RouteWithdrawPayload { destinations },
        )
    }

    /// A unicast `data` message.
    pub fn data(sender: &str, recipient: &str, bytes: &[u8], ttl: u8) -> Self {
        let mut msg = Self::new(
            MsgType::Data,
            sender,
            Some(recipient),
            serde_json::json!(DataPayload::from_bytes(bytes)),
        );
        msg.ttl = ttl;
        msg
    }

    /// A `control_message` carrying a signed administrative command.
    pub fn control(sender: &str, control: &ControlMessage) -> Result<Self> {
        Self::with_payload(MsgType::ControlMessage, sender, None, control)
    }

    /// A `revocation` protocol message.
    pub fn revocation(
        sender: &str,
        recipient: Option<&str>,
        payload: &RevocationPayload,
    ) -> Result<Self> {
        Self::with_payload(MsgType::Revocation, sender, recipient, payload)
    }

    /// A `service_request` asking for known service manifests.
    pub fn service_request(sender: &str, recipient: &str) -> Self {
        Self::new(
            MsgType::ServiceRequest,
            sender,
            Some(recipient),
            serde_json::json!({}),
        )
    }

    /// A `service_response` or `service_announce` carrying manifests.
    pub fn service_list(
        msg_type: MsgType,
        sender: &str,
        recipient: Option<&str>,
        payload: &ServiceListPayload,
    ) -> Result<Self> {
        Self::with_payload(msg_type, sender, recipient, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::RevocationPayload;

    #[test]
    fn wire_roundtrip_preserves_every_field() {
        let mut msg = WireMsg::data("node-a", "node-z", b"payload bytes", 7);
        msg.signature = Some("c2ln".to_string());

        let bytes = msg.to_bytes().expect("serialize");
        let parsed = WireMsg::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, msg);

        let payload: DataPayload = parsed.payload_as().expect("payload");
        assert_eq!(payload.to_bytes().expect("decode"), b"payload bytes");
    }

    #[test]
    fn ttl_decrements_to_exhaustion() {
        let mut msg = WireMsg::ping("node-a", "node-b");
        msg.ttl = 2;
        assert!(msg.decrement_ttl());
        assert!(!msg.decrement_ttl());
        assert_eq!(msg.ttl, 0);
        // saturates rather than wrapping
        assert!(!msg.decrement_ttl());
    }

    #[test]
    fn missing_ttl_defaults_on_parse() {
        let parsed = WireMsg::from_bytes(
            br#"{"msg_id":"m1","msg_type":"ping","timestamp":1,"sender":"a","payload":{}}"#,
        )
        .expect("parse");
        assert_eq!(parsed.ttl, DEFAULT_TTL);
        assert!(parsed.is_broadcast());
    }

    #[test]
    fn typed_payload_dispatch() {
        let msg = WireMsg::revocation("node-a", None, &RevocationPayload::RequestCrl)
            .expect("construct");
        let payload: RevocationPayload = msg.payload_as().expect("payload");
        assert_eq!(payload, RevocationPayload::RequestCrl);

        // wrong shape fails as a parse error
        let err = msg.payload_as::<RouteAnnouncePayload>();
        assert!(err.is_err());
    }
}
