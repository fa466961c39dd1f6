// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Hash-chained, tamper-evident audit logging.
//!
//! One JSON record per line. Each record's `event_hash` is SHA-256 over its
//! canonical JSON (keys sorted, `event_hash` removed) and `previous_hash`
//! links it to its predecessor, so any edit breaks the chain from that
//! record onward.

use super::error::{Error, Result};

use gm_interface::now_secs;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    fs::OpenOptions,
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    sync::Mutex,
};
use uuid::Uuid;

/// Every security-relevant event class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventType {
    // certificates
    CertificateIssued,
    CertificateRenewed,
    CertificateRevoked,
    CertificateExpired,
    // nodes
    NodeStarted,
    NodeStopped,
    NodeJoined,
    NodeLeft,
    NodeBlacklisted,
    // connections
    ConnectionEstablished,
    ConnectionFailed,
    ConnectionClosed,
    // control plane
    ControlMessageAccepted,
    ControlMessageRejected,
    PolicyUpdated,
    // security
    AuthenticationFailure,
    AuthorizationDenied,
    SignatureInvalid,
    // CRL
    CrlUpdated,
}

/// One tamper-evident record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: u64,
    pub node_id: String,
    pub actor: Option<String>,
    pub target: Option<String>,
    pub action: String,
    /// `success`, `failure` or `denied`.
    pub result: String,
    #[serde(default)]
    pub details: Value,
    pub previous_hash: Option<String>,
    pub event_hash: Option<String>,
}

impl AuditEvent {
    /// SHA-256 of the canonical record, excluding `event_hash` itself.
    pub fn compute_hash(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)
            .map_err(|err| Error::Validation(format!("audit record: {err}")))?;
        if let Some(map) = value.as_object_mut() {
            let _hash = map.remove("event_hash");
        }
        let canonical = serde_json::to_string(&value)
            .map_err(|err| Error::Validation(format!("audit record: {err}")))?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }
}

struct ChainState {
    last_hash: Option<String>,
    count: u64,
}

/// Appender for the audit log.
pub struct AuditLog {
    node_id: String,
    path: Option<PathBuf>,
    chain: Mutex<ChainState>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("node_id", &self.node_id)
            .field("path", &self.path)
            .finish()
    }
}

impl AuditLog {
    /// A logger writing to `path`, or memory-only when `None`.
    pub fn new(node_id: &str, path: Option<PathBuf>) -> Self {
        Self {
            node_id: node_id.to_string(),
            path,
            chain: Mutex::new(ChainState {
                last_hash: None,
                count: 0,
            }),
        }
    }

    /// Append one event, chaining it to the previous one.
    pub fn log_event(
        &self,
        event_type: EventType,
        action: &str,
        result: &str,
        actor: Option<&str>,
        target: Option<&str>,
        details: Value,
    ) -> AuditEvent {
        let mut chain = self.chain.lock().unwrap_or_else(|e| e.into_inner());
        let mut event = AuditEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: now_secs(),
            node_id: self.node_id.clone(),
            actor: actor.map(str::to_string),
            target: target.map(str::to_string),
            action: action.to_string(),
            result: result.to_string(),
            details,
            previous_hash: chain.last_hash.clone(),
            event_hash: None,
        };
        match event.compute_hash() {
            Ok(hash) => {
                chain.last_hash = Some(hash.clone());
                event.event_hash = Some(hash);
            }
            Err(err) => error!("Failed to hash audit event: {err}"),
        }
        chain.count += 1;

        self.append(&event);
        info!(
            "AUDIT: {:?} | {} | {} | actor={:?} target={:?}",
            event.event_type, event.action, event.result, event.actor, event.target
        );
        event
    }

    fn append(&self, event: &AuditEvent) {
        let path = match &self.path {
            Some(path) => path,
            None => return,
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                error!("Failed to serialize audit event: {err}");
                return;
            }
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = written {
            error!("Failed to write audit event: {err}");
        }
    }

    /// Events appended by this instance.
    pub fn event_count(&self) -> u64 {
        self.chain.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    /// Hash of the most recent event.
    pub fn last_hash(&self) -> Option<String> {
        self.chain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_hash
            .clone()
    }

    // convenience wrappers for the common events

    pub fn node_joined(&self, peer_id: &str, endpoint: &str) {
        let _event = self.log_event(
            EventType::NodeJoined,
            &format!("Node joined from {endpoint}"),
            "success",
            None,
            Some(peer_id),
            serde_json::json!({ "endpoint": endpoint }),
        );
    }

    pub fn node_left(&self, peer_id: &str, reason: &str) {
        let _event = self.log_event(
            EventType::NodeLeft,
            &format!("Node left: {reason}"),
            "success",
            None,
            Some(peer_id),
            Value::Null,
        );
    }

    pub fn node_blacklisted(&self, peer_id: &str, reason: &str) {
        let _event = self.log_event(
            EventType::NodeBlacklisted,
            &format!("Node blacklisted: {reason}"),
            "success",
            None,
            Some(peer_id),
            Value::Null,
        );
    }

    pub fn connection_failed(&self, peer_id: &str, error: &str) {
        let _event = self.log_event(
            EventType::ConnectionFailed,
            "Connection attempt failed",
            "failure",
            None,
            Some(peer_id),
            serde_json::json!({ "error": error }),
        );
    }

    pub fn authentication_failure(&self, peer_id: &str, reason: &str) {
        let _event = self.log_event(
            EventType::AuthenticationFailure,
            "Authentication failed",
            "failure",
            None,
            Some(peer_id),
            serde_json::json!({ "reason": reason }),
        );
    }

    pub fn authorization_denied(&self, actor: &str, action: &str, reason: &str) {
        let _event = self.log_event(
            EventType::AuthorizationDenied,
            &format!("Authorization denied for: {action}"),
            "denied",
            Some(actor),
            None,
            serde_json::json!({ "reason": reason }),
        );
    }

    pub fn signature_invalid(&self, actor: &str, context: &str) {
        let _event = self.log_event(
            EventType::SignatureInvalid,
            &format!("Invalid signature on {context}"),
            "failure",
            Some(actor),
            None,
            Value::Null,
        );
    }

    pub fn control_message(&self, command: &str, issuer: &str, accepted: bool, reason: Option<&str>) {
        let event_type = if accepted {
            EventType::ControlMessageAccepted
        } else {
            EventType::ControlMessageRejected
        };
        let _event = self.log_event(
            event_type,
            &format!("Control command: {command}"),
            if accepted { "accepted" } else { "rejected" },
            Some(issuer),
            None,
            serde_json::json!({ "reason": reason }),
        );
    }

    pub fn policy_updated(&self, policy_id: &str, issuer: &str) {
        let _event = self.log_event(
            EventType::PolicyUpdated,
            "Policy updated",
            "success",
            Some(issuer),
            Some(policy_id),
            Value::Null,
        );
    }

    pub fn certificate_renewed(&self, cert_id: &str) {
        let _event = self.log_event(
            EventType::CertificateRenewed,
            "Renewed certificate",
            "success",
            Some(self.node_id.as_str()),
            Some(cert_id),
            Value::Null,
        );
    }

    pub fn certificate_revoked(&self, cert_id: &str, reason: &str, issuer: &str) {
        let _event = self.log_event(
            EventType::CertificateRevoked,
            &format!("Revoked certificate: {reason}"),
            "success",
            Some(issuer),
            Some(cert_id),
            serde_json::json!({ "reason": reason }),
        );
    }

    pub fn crl_updated(&self, sequence: u64, revoked_count: usize) {
        let _event = self.log_event(
            EventType::CrlUpdated,
            &format!("CRL updated to sequence {sequence}"),
            "success",
            None,
            None,
            serde_json::json!({ "sequence": sequence, "revoked_count": revoked_count }),
        );
    }
}

/// Walk a log file and fail on the first record whose hash or chain link
/// does not hold. Returns the number of verified records.
pub fn verify_chain(path: &PathBuf) -> Result<usize> {
    let file = std::fs::File::open(path)
        .map_err(|err| Error::Validation(format!("audit log: {err}")))?;
    let reader = BufReader::new(file);

    let mut previous_hash: Option<String> = None;
    let mut verified = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| Error::Validation(format!("audit log: {err}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent = serde_json::from_str(&line)
            .map_err(|err| Error::Validation(format!("audit record {index}: {err}")))?;

        if event.previous_hash != previous_hash {
            return Err(Error::Validation(format!(
                "audit chain break at record {index}"
            )));
        }
        let expected = event.compute_hash()?;
        if event.event_hash.as_deref() != Some(expected.as_str()) {
            return Err(Error::Validation(format!(
                "audit record {index} hash mismatch"
            )));
        }
        previous_hash = event.event_hash.clone();
        verified += 1;
    }
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn chain_verifies_and_detects_tampering() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.log");
        let log = AuditLog::new("node-1", Some(path.clone()));

        log.node_joined("peer-1", "peer-1.mesh:443");
        log.control_message("policy_update", "admin-1", true, None);
        log.crl_updated(7, 2);
        assert_eq!(log.event_count(), 3);

        assert_eq!(verify_chain(&path)?, 3);

        // flip a detail in the middle record
        let text = std::fs::read_to_string(&path)?;
        let tampered = text.replace("policy_update", "policy_upgrade");
        assert_ne!(text, tampered);
        std::fs::write(&path, tampered)?;

        assert!(verify_chain(&path).is_err());
        Ok(())
    }

    #[test]
    fn each_event_links_to_its_predecessor() {
        let log = AuditLog::new("node-1", None);
        let first = log.log_event(
            EventType::NodeStarted,
            "Node started",
            "success",
            None,
            None,
            Value::Null,
        );
        let second = log.log_event(
            EventType::NodeStopped,
            "Node stopped",
            "success",
            None,
            None,
            Value::Null,
        );
        assert_eq!(first.previous_hash, None);
        assert_eq!(second.previous_hash, first.event_hash);
    }
}
