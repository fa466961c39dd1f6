// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Request/response contracts for the Network Authority's bootstrap HTTP
//! endpoints. The NA service itself lives outside this workspace; these are
//! the shapes both sides must agree on.

use crate::types::errors::{Error, Result};

use serde::{Deserialize, Serialize};

/// Role prefixes a join request may claim.
const ALLOWED_ROLE_PREFIXES: &[&str] = &[
    "role:anchor",
    "role:bridge",
    "role:client",
    "role:operator",
    "role:service:",
];

/// Body of `POST /join`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// The joining node's public key, base64.
    pub node_public_key: String,
    /// Requested roles.
    pub roles: Vec<String>,
    /// Requested certificate validity, in hours.
    pub validity_hours: u64,
}

/// Body of `GET /health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status, e.g. `ok`.
    pub status: String,
    /// Network name served.
    pub network: String,
    /// Service version.
    pub version: String,
}

/// Check every requested role against the allowed prefixes.
///
/// Returns the first offending role as the error.
pub fn validate_roles(roles: &[String]) -> Result<()> {
    for role in roles {
        let permitted = ALLOWED_ROLE_PREFIXES
            .iter()
            .any(|prefix| role.starts_with(prefix));
        if !permitted {
            return Err(Error::RoleNotPermitted(role.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn known_roles_pass() {
        let roles = vec![
            "role:anchor".to_string(),
            "role:client".to_string(),
            "role:service:dns".to_string(),
        ];
        assert!(validate_roles(&roles).is_ok());
    }

    #[test]
    fn unknown_roles_are_rejected() {
        let roles = vec!["role:admin".to_string()];
        assert_matches!(
            validate_roles(&roles),
            Err(Error::RoleNotPermitted(role)) if role == "role:admin"
        );

        // a bare "role:service" is not a service role
        let roles = vec!["role:service".to_string()];
        assert!(validate_roles(&roles).is_err());
    }
}
