// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::canonical::KeySig;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One revoked certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedCertificate {
    /// The revoked certificate's id.
    pub cert_id: String,
    /// Revocation time, UNIX seconds.
    pub revoked_at: u64,
    /// Revocation reason.
    pub reason: String,
    /// Who issued the revocation.
    pub issuer: String,
}

/// A sequence-versioned certificate revocation list.
///
/// Issued and signed by the Network Authority and distributed via gossip.
/// A node holds at most one current CRL; a list whose sequence does not
/// strictly exceed the current one is never installed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertificateRevocationList {
    /// Unique CRL identifier.
    pub crl_id: String,
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// Issue time, UNIX seconds.
    pub issued_at: u64,
    /// When the next CRL is expected, UNIX seconds.
    pub next_update: u64,
    /// Issuer key id (typically the NA).
    pub issuer: String,
    /// The revoked certificates.
    #[serde(default)]
    pub revoked_certificates: Vec<RevokedCertificate>,
    /// Network Authority signature(s).
    #[serde(default)]
    pub signatures: Vec<KeySig>,
}

impl CertificateRevocationList {
    /// An empty CRL at the given sequence, valid for `validity_secs`.
    pub fn empty(issuer: &str, sequence: u64, now: u64, validity_secs: u64) -> Self {
        Self {
            crl_id: Uuid::new_v4().to_string(),
            sequence,
            issued_at: now,
            next_update: now + validity_secs,
            issuer: issuer.to_string(),
            revoked_certificates: vec![],
            signatures: vec![],
        }
    }

    /// A successor CRL carrying one more revocation.
    ///
    /// Bumps the sequence, stamps a fresh id and clears the signatures: the
    /// result must be re-signed by the NA before distribution.
    pub fn with_revocation(&self, cert_id: &str, reason: &str, issuer: &str, now: u64) -> Self {
        let mut revoked = self.revoked_certificates.clone();
        revoked.push(RevokedCertificate {
            cert_id: cert_id.to_string(),
            revoked_at: now,
            reason: reason.to_string(),
            issuer: issuer.to_string(),
        });
        Self {
            crl_id: Uuid::new_v4().to_string(),
            sequence: self.sequence + 1,
            issued_at: now,
            next_update: self.next_update,
            issuer: self.issuer.clone(),
            revoked_certificates: revoked,
            signatures: vec![],
        }
    }

    /// Whether the given certificate id appears on the list.
    pub fn is_cert_revoked(&self, cert_id: &str) -> bool {
        self.revoked_certificates
            .iter()
            .any(|rc| rc.cert_id == cert_id)
    }

    /// Whether the list is past its advertised next-update time.
    pub fn is_stale(&self, now: u64) -> bool {
        now > self.next_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_revocation_bumps_sequence_and_clears_signatures() {
        let mut crl = CertificateRevocationList::empty("na-1", 5, 1000, 86400);
        crl.signatures.push(KeySig {
            key_id: "na-1".to_string(),
            sig: "sig".to_string(),
        });

        let next = crl.with_revocation("cert-9", "key compromise", "na-1", 2000);
        assert_eq!(next.sequence, 6);
        assert!(next.signatures.is_empty());
        assert_ne!(next.crl_id, crl.crl_id);
        assert!(next.is_cert_revoked("cert-9"));
        assert!(!crl.is_cert_revoked("cert-9"));
    }

    #[test]
    fn staleness_tracks_next_update() {
        let crl = CertificateRevocationList::empty("na-1", 1, 1000, 100);
        assert!(!crl.is_stale(1100));
        assert!(crl.is_stale(1101));
    }
}
