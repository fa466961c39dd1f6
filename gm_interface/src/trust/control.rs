// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::canonical::KeySig;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

/// Administrative commands carried by control messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    PolicyUpdate,
    RevokeCertificate,
    RevokeNode,
    UpdateBootstrap,
    ShutdownNode,
    /// Reserved; accepted but its effect is implementation-defined.
    RotateKeys,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ControlCommand::PolicyUpdate => "policy_update",
            ControlCommand::RevokeCertificate => "revoke_certificate",
            ControlCommand::RevokeNode => "revoke_node",
            ControlCommand::UpdateBootstrap => "update_bootstrap",
            ControlCommand::ShutdownNode => "shutdown_node",
            ControlCommand::RotateKeys => "rotate_keys",
        };
        write!(f, "{name}")
    }
}

/// The blast radius a control command claims.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlScope {
    Network,
    Region,
    Node,
    Service,
}

impl fmt::Display for ControlScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ControlScope::Network => "network",
            ControlScope::Region => "region",
            ControlScope::Node => "node",
            ControlScope::Service => "service",
        };
        write!(f, "{name}")
    }
}

/// A signed, role-gated administrative command.
///
/// Delivered over the mesh inside a `control_message` wire message; validated
/// by the RBAC enforcer and executed at most once per node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Unique message id; each node accepts a given id at most once.
    pub message_id: String,
    /// The command to execute.
    pub command: ControlCommand,
    /// Claimed scope.
    pub scope: ControlScope,
    /// Issuer key id.
    pub issuer: String,
    /// Roles the issuer claims; at least one must admit (command, scope).
    pub issuer_roles: Vec<String>,
    /// Issue time, UNIX seconds.
    pub issued_at: u64,
    /// Optional expiry, UNIX seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Optional target node/service id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Free-form command data.
    #[serde(default)]
    pub data: Value,
    /// One or more signatures.
    #[serde(default)]
    pub signatures: Vec<KeySig>,
}

impl ControlMessage {
    fn new(
        command: ControlCommand,
        scope: ControlScope,
        issuer: &str,
        issuer_roles: &[String],
        issued_at: u64,
        data: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            command,
            scope,
            issuer: issuer.to_string(),
            issuer_roles: issuer_roles.to_vec(),
            issued_at,
            expires_at: None,
            target: None,
            data,
            signatures: vec![],
        }
    }

    /// Whether the message's expiry (if any) has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(expiry) if now > expiry)
    }

    /// A network-scoped policy update, expiring after `validity_secs`.
    pub fn policy_update(
        issuer: &str,
        issuer_roles: &[String],
        policy: Value,
        now: u64,
        validity_secs: u64,
    ) -> Self {
        let mut msg = Self::new(
            ControlCommand::PolicyUpdate,
            ControlScope::Network,
            issuer,
            issuer_roles,
            now,
            json!({ "policy": policy }),
        );
        msg.expires_at = Some(now + validity_secs);
        msg
    }

    /// A network-scoped certificate revocation.
    pub fn revoke_certificate(
        issuer: &str,
        issuer_roles: &[String],
        cert_id: &str,
        reason: &str,
        now: u64,
    ) -> Self {
        Self::new(
            ControlCommand::RevokeCertificate,
            ControlScope::Network,
            issuer,
            issuer_roles,
            now,
            json!({ "cert_id": cert_id, "reason": reason }),
        )
    }

    /// A network-scoped node revocation.
    pub fn revoke_node(
        issuer: &str,
        issuer_roles: &[String],
        node_id: &str,
        reason: &str,
        now: u64,
    ) -> Self {
        Self::new(
            ControlCommand::RevokeNode,
            ControlScope::Network,
            issuer,
            issuer_roles,
            now,
            json!({ "node_id": node_id, "reason": reason }),
        )
    }

    /// A network-scoped bootstrap anchor replacement.
    pub fn update_bootstrap(
        issuer: &str,
        issuer_roles: &[String],
        anchors: &[String],
        now: u64,
    ) -> Self {
        Self::new(
            ControlCommand::UpdateBootstrap,
            ControlScope::Network,
            issuer,
            issuer_roles,
            now,
            json!({ "anchors": anchors }),
        )
    }

    /// A node-scoped shutdown command for `target_node`.
    pub fn shutdown_node(
        issuer: &str,
        issuer_roles: &[String],
        target_node: &str,
        reason: &str,
        grace_period_secs: u64,
        now: u64,
    ) -> Self {
        let mut msg = Self::new(
            ControlCommand::ShutdownNode,
            ControlScope::Node,
            issuer,
            issuer_roles,
            now,
            json!({ "reason": reason, "grace_period": grace_period_secs }),
        );
        msg.target = Some(target_node.to_string());
        msg
    }
}

/// What one role may do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermissions {
    /// Role name, e.g. `role:admin`.
    pub role: String,
    /// Commands the role may issue.
    pub allowed_commands: Vec<ControlCommand>,
    /// Scopes the role may claim.
    pub allowed_scopes: Vec<ControlScope>,
}

/// The default permission matrix.
///
/// Admins may issue any command at any scope; operators are limited to
/// policy and bootstrap updates at network/region scope; anchors and
/// clients issue nothing.
pub fn default_role_permissions() -> Vec<RolePermissions> {
    vec![
        RolePermissions {
            role: "role:admin".to_string(),
            allowed_commands: vec![
                ControlCommand::PolicyUpdate,
                ControlCommand::RevokeCertificate,
                ControlCommand::RevokeNode,
                ControlCommand::UpdateBootstrap,
                ControlCommand::ShutdownNode,
                ControlCommand::RotateKeys,
            ],
            allowed_scopes: vec![
                ControlScope::Network,
                ControlScope::Region,
                ControlScope::Node,
                ControlScope::Service,
            ],
        },
        RolePermissions {
            role: "role:operator".to_string(),
            allowed_commands: vec![
                ControlCommand::PolicyUpdate,
                ControlCommand::UpdateBootstrap,
            ],
            allowed_scopes: vec![ControlScope::Network, ControlScope::Region],
        },
        RolePermissions {
            role: "role:anchor".to_string(),
            allowed_commands: vec![],
            allowed_scopes: vec![],
        },
        RolePermissions {
            role: "role:client".to_string(),
            allowed_commands: vec![],
            allowed_scopes: vec![],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_serialize_to_normative_strings() {
        let json = serde_json::to_string(&ControlCommand::RevokeCertificate).expect("serialize");
        assert_eq!(json, r#""revoke_certificate""#);
        let json = serde_json::to_string(&ControlScope::Network).expect("serialize");
        assert_eq!(json, r#""network""#);
    }

    #[test]
    fn expiry_is_optional() {
        let roles = vec!["role:admin".to_string()];
        let msg = ControlMessage::revoke_node("admin-1", &roles, "node-9", "compromised", 1000);
        assert!(!msg.is_expired(u64::MAX));

        let msg = ControlMessage::policy_update("admin-1", &roles, serde_json::json!({}), 1000, 60);
        assert!(!msg.is_expired(1060));
        assert!(msg.is_expired(1061));
    }

    #[test]
    fn shutdown_targets_a_node() {
        let roles = vec!["role:admin".to_string()];
        let msg = ControlMessage::shutdown_node("admin-1", &roles, "node-3", "drain", 30, 1000);
        assert_eq!(msg.target.as_deref(), Some("node-3"));
        assert_eq!(msg.scope, ControlScope::Node);
        assert_eq!(msg.data["grace_period"], 30);
    }
}
