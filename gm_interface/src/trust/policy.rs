// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::canonical::{canonical_json, KeySig};
use crate::types::errors::Result;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

fn default_preferred_transports() -> Vec<String> {
    vec!["quic".to_string(), "wireguard".to_string()]
}

fn default_max_hops() -> u32 {
    6
}

/// Routing preferences distributed via policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPrefs {
    /// Preferred transport protocols, in order.
    #[serde(default = "default_preferred_transports")]
    pub preferred_transports: Vec<String>,
    /// Maximum routing hops.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

impl Default for RoutingPrefs {
    fn default() -> Self {
        Self {
            preferred_transports: default_preferred_transports(),
            max_hops: default_max_hops(),
        }
    }
}

fn default_allowed_ports() -> Vec<u16> {
    vec![443, 8443]
}

/// Network-wide policy, signed by the Network Authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyManifest {
    /// Unique policy identifier.
    pub policy_id: String,
    /// Issue time, UNIX seconds.
    pub issued_at: u64,
    /// Issuing authority key id.
    pub issued_by: String,
    /// Minimum required client version.
    pub min_client_version: String,
    /// Allowed network ports.
    #[serde(default = "default_allowed_ports")]
    pub allowed_ports: Vec<u16>,
    /// Permitted service identifiers.
    #[serde(default)]
    pub allowed_services: Vec<String>,
    /// Routing configuration.
    #[serde(default)]
    pub routing: RoutingPrefs,
    /// Network Authority signature(s).
    #[serde(default)]
    pub signatures: Vec<KeySig>,
}

impl PolicyManifest {
    /// The `sha256:<hex>` content hash the genesis block's
    /// `policy_manifest.hash` field refers to, taken over the canonical form.
    pub fn content_hash(&self) -> Result<String> {
        let canonical = canonical_json(self)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(format!("sha256:{}", hex::encode(digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::canonical_json;

    #[test]
    fn parse_applies_defaults() {
        let manifest: PolicyManifest = serde_json::from_str(
            r#"{"policy_id":"p1","issued_at":1,"issued_by":"na-1","min_client_version":"0.1.0"}"#,
        )
        .expect("parse");
        assert_eq!(manifest.allowed_ports, vec![443, 8443]);
        assert_eq!(manifest.routing.max_hops, 6);
    }

    #[test]
    fn content_hash_ignores_signatures() {
        let mut manifest: PolicyManifest = serde_json::from_str(
            r#"{"policy_id":"p1","issued_at":1,"issued_by":"na-1","min_client_version":"0.1.0"}"#,
        )
        .expect("parse");
        let before = manifest.content_hash().expect("hash");
        manifest.signatures.push(KeySig {
            key_id: "na-1".to_string(),
            sig: "sig".to_string(),
        });
        assert_eq!(manifest.content_hash().expect("hash"), before);
        assert!(before.starts_with("sha256:"));
    }

    #[test]
    fn canonical_roundtrip() {
        let manifest: PolicyManifest = serde_json::from_str(
            r#"{"policy_id":"p1","issued_at":1,"issued_by":"na-1","min_client_version":"0.1.0"}"#,
        )
        .expect("parse");
        let serialized = serde_json::to_string(&manifest).expect("serialize");
        let reparsed: PolicyManifest = serde_json::from_str(&serialized).expect("reparse");
        assert_eq!(
            canonical_json(&reparsed).expect("canonical"),
            canonical_json(&manifest).expect("canonical")
        );
    }
}
