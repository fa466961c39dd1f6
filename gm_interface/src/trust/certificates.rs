// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::canonical::KeySig;

use serde::{Deserialize, Serialize};

/// A short-lived credential permitting a node to participate in the mesh.
///
/// Issued by the Network Authority; typical validity runs from 24 hours for
/// mobile devices up to 7 days for servers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinCertificate {
    /// Unique certificate identifier.
    pub cert_id: String,
    /// The holder's public key, base64.
    pub node_public_key: String,
    /// Target network identifier.
    pub network_name: String,
    /// Assigned roles, e.g. `role:anchor`, `role:client`.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Issue time, UNIX seconds.
    pub issued_at: u64,
    /// Expiry time, UNIX seconds.
    pub expires_at: u64,
    /// Issuing authority key id.
    pub issued_by: String,
    /// Network Authority signature(s).
    #[serde(default)]
    pub signatures: Vec<KeySig>,
}

impl JoinCertificate {
    /// Whether `now` lies within the certificate's validity window
    /// (both endpoints inclusive).
    pub fn is_valid(&self, now: u64) -> bool {
        self.issued_at <= now && now <= self.expires_at
    }

    /// Whether the certificate's expiry time has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    /// Fraction of the validity window still remaining at `now`, in [0, 1].
    pub fn remaining_fraction(&self, now: u64) -> f64 {
        let total = self.expires_at.saturating_sub(self.issued_at);
        if total == 0 {
            return 0.0;
        }
        let remaining = self.expires_at.saturating_sub(now);
        (remaining as f64 / total as f64).min(1.0)
    }
}

/// Authenticates a service identity and its endpoints.
///
/// Used for service-to-service authentication within the mesh; backs the
/// `service_announce` family of wire messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceManifest {
    /// Unique service identifier.
    pub service_name: String,
    /// Service public key, base64.
    pub service_key: String,
    /// Service endpoints (URLs).
    pub endpoints: Vec<String>,
    /// Issue time, UNIX seconds.
    pub issued_at: u64,
    /// Expiry time, UNIX seconds.
    pub valid_to: u64,
    /// Issuing authority key id.
    pub issued_by: String,
    /// Network Authority signature(s).
    #[serde(default)]
    pub signatures: Vec<KeySig>,
}

impl ServiceManifest {
    /// Whether `now` lies within the manifest's validity window.
    pub fn is_valid(&self, now: u64) -> bool {
        self.issued_at <= now && now <= self.valid_to
    }
}
