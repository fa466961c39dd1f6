// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Role-based authorization for control-plane messages.

use super::error::{Error, Result};

use gm_interface::trust::{
    default_role_permissions, verify_object, ControlCommand, ControlMessage, ControlScope,
    RolePermissions,
};

use std::collections::HashMap;

/// How many of a message's signatures must verify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// At least this many signatures must be valid.
    Threshold(usize),
    /// Every listed signature must be valid.
    All,
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self::Threshold(1)
    }
}

/// Validates that a control message is fresh, properly signed, and that at
/// least one of the issuer's roles admits the (command, scope) pair.
#[derive(Debug)]
pub struct RbacEnforcer {
    permissions: HashMap<String, RolePermissions>,
    policy: SignaturePolicy,
}

impl Default for RbacEnforcer {
    fn default() -> Self {
        Self::new(default_role_permissions(), SignaturePolicy::default())
    }
}

impl RbacEnforcer {
    pub fn new(permissions: Vec<RolePermissions>, policy: SignaturePolicy) -> Self {
        Self {
            permissions: permissions
                .into_iter()
                .map(|rp| (rp.role.clone(), rp))
                .collect(),
            policy,
        }
    }

    /// Full validation of a control message.
    ///
    /// `key_lookup` resolves a key id into a base64 public key; unknown
    /// ids count as invalid signatures, with no distinction surfaced.
    pub fn validate(
        &self,
        msg: &ControlMessage,
        key_lookup: &dyn Fn(&str) -> Option<String>,
        now: u64,
    ) -> Result<()> {
        if msg.is_expired(now) {
            return Err(Error::Authorization(
                "control message has expired".to_string(),
            ));
        }
        if msg.signatures.is_empty() {
            return Err(Error::Signature);
        }

        let mut valid = 0;
        let mut invalid = 0;
        for sig in &msg.signatures {
            let verified = key_lookup(&sig.key_id)
                .map(|public| verify_object(msg, sig, &public))
                .unwrap_or(false);
            if verified {
                valid += 1;
            } else {
                invalid += 1;
            }
        }
        match self.policy {
            SignaturePolicy::Threshold(required) if valid < required => {
                return Err(Error::Signature);
            }
            SignaturePolicy::All if invalid > 0 => {
                return Err(Error::Signature);
            }
            _ => {}
        }
        trace!(
            "Signature validation passed: {valid} valid of {}",
            msg.signatures.len()
        );

        if !self.has_permission(&msg.issuer_roles, msg.command, msg.scope) {
            return Err(Error::Authorization(format!(
                "roles {:?} not authorized for {} at {} scope",
                msg.issuer_roles, msg.command, msg.scope
            )));
        }
        Ok(())
    }

    /// Whether any of `roles` admits the (command, scope) pair.
    pub fn has_permission(
        &self,
        roles: &[String],
        command: ControlCommand,
        scope: ControlScope,
    ) -> bool {
        roles.iter().any(|role| {
            self.permissions
                .get(role)
                .map(|rp| {
                    rp.allowed_commands.contains(&command) && rp.allowed_scopes.contains(&scope)
                })
                .unwrap_or(false)
        })
    }

    /// Union of commands the given roles may issue.
    pub fn allowed_commands(&self, roles: &[String]) -> Vec<ControlCommand> {
        let mut commands: Vec<ControlCommand> = roles
            .iter()
            .filter_map(|role| self.permissions.get(role))
            .flat_map(|rp| rp.allowed_commands.iter().copied())
            .collect();
        commands.sort_by_key(|c| c.to_string());
        commands.dedup();
        commands
    }
}
