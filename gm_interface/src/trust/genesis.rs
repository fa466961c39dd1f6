// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::canonical::{sign_object, verify_object, KeySig};
use crate::types::errors::{Error, Result};
use crate::types::keys::Keypair;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// The Network Authority record embedded in the genesis block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAuthority {
    /// Base64-encoded NA public key.
    pub public_key: String,
    /// Validity window start, UNIX seconds.
    pub valid_from: u64,
    /// Validity window end, UNIX seconds.
    pub valid_to: u64,
}

/// Content-addressed reference to the policy manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyManifestRef {
    /// Content hash, e.g. `sha256:<hex>`.
    pub hash: String,
    /// Optional URL for out-of-band retrieval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A bootstrap anchor entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapAnchor {
    /// Unique anchor identifier.
    pub id: String,
    /// Network endpoint, `host:port`.
    pub endpoint: String,
}

fn default_crypto_suites() -> Vec<String> {
    vec!["ed25519".to_string(), "x25519".to_string()]
}

fn default_transports() -> Vec<String> {
    vec!["quic".to_string(), "wireguard".to_string()]
}

/// The network constitution.
///
/// Signed once by the Root Sovereign and immutable thereafter; every node
/// embeds or imports it at initialisation and refuses to start if any root
/// signature fails to verify.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenesisBlock {
    /// Unique network identifier.
    pub network_name: String,
    /// Network protocol version.
    pub network_version: String,
    /// Root Sovereign public key, base64.
    pub root_public_key: String,
    /// The current Network Authority.
    pub network_authority: NetworkAuthority,
    /// Permitted cryptographic algorithms.
    #[serde(default = "default_crypto_suites")]
    pub allowed_crypto_suites: Vec<String>,
    /// Permitted transport protocols.
    #[serde(default = "default_transports")]
    pub allowed_transports: Vec<String>,
    /// Reference to the policy manifest.
    pub policy_manifest: PolicyManifestRef,
    /// Initial anchors for network entry.
    #[serde(default)]
    pub bootstrap_anchors: Vec<BootstrapAnchor>,
    /// Root Sovereign signatures.
    #[serde(default)]
    pub signatures: Vec<KeySig>,
}

impl GenesisBlock {
    /// Append a Root Sovereign signature over the canonical form.
    pub fn sign(&mut self, keypair: &Keypair, key_id: &str) -> Result<()> {
        let sig = sign_object(self, keypair, key_id)?;
        self.signatures.push(sig);
        Ok(())
    }

    /// Verify every root signature against the embedded root key.
    ///
    /// An unsigned block is invalid; so is a block where any one of its
    /// signatures fails. This is the fatal startup check.
    pub fn verify(&self) -> Result<()> {
        if self.signatures.is_empty() {
            error!("Genesis block has no signatures");
            return Err(Error::InvalidSignature);
        }
        for sig in &self.signatures {
            if !verify_object(self, sig, &self.root_public_key) {
                error!("Invalid genesis signature from key {}", sig.key_id);
                return Err(Error::InvalidSignature);
            }
        }
        debug!("Genesis block signatures verified");
        Ok(())
    }

    /// Read a genesis block from a JSON file. Key order is not significant;
    /// verification always uses the canonical form.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|err| Error::FailedToParse(format!("genesis: {err}")))
    }

    /// Write the genesis block as pretty JSON.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| Error::Serialisation(format!("genesis: {err}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::keys::{encode_public, gen_keypair};
    use assert_matches::assert_matches;
    use eyre::Result;

    pub(crate) fn test_genesis(root: &Keypair, na_public: &str) -> GenesisBlock {
        GenesisBlock {
            network_name: "TEST".to_string(),
            network_version: "1.0".to_string(),
            root_public_key: encode_public(&root.public),
            network_authority: NetworkAuthority {
                public_key: na_public.to_string(),
                valid_from: 0,
                valid_to: u64::MAX,
            },
            allowed_crypto_suites: default_crypto_suites(),
            allowed_transports: default_transports(),
            policy_manifest: PolicyManifestRef {
                hash: "sha256:0000".to_string(),
                url: None,
            },
            bootstrap_anchors: vec![],
            signatures: vec![],
        }
    }

    #[test]
    fn tampered_genesis_fails_verification() -> Result<()> {
        let root = gen_keypair();
        let na = gen_keypair();
        let mut genesis = test_genesis(&root, &encode_public(&na.public));
        genesis.sign(&root, "root-1")?;
        genesis.verify()?;

        // flip the network name, verification must fail
        let original = genesis.network_name.clone();
        genesis.network_name = "TESU".to_string();
        assert_matches!(genesis.verify(), Err(crate::Error::InvalidSignature));

        // restore, valid again
        genesis.network_name = original;
        genesis.verify()?;
        Ok(())
    }

    #[test]
    fn unsigned_genesis_is_invalid() {
        let root = gen_keypair();
        let genesis = test_genesis(&root, "na-key");
        assert_matches!(genesis.verify(), Err(crate::Error::InvalidSignature));
    }

    #[test]
    fn genesis_file_roundtrip_preserves_canonical_form() -> Result<()> {
        let root = gen_keypair();
        let na = gen_keypair();
        let mut genesis = test_genesis(&root, &encode_public(&na.public));
        genesis.sign(&root, "root-1")?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("genesis.json");
        genesis.to_file(&path)?;

        let loaded = GenesisBlock::from_file(&path)?;
        loaded.verify()?;
        assert_eq!(
            super::super::canonical_json(&loaded)?,
            super::super::canonical_json(&genesis)?
        );
        Ok(())
    }
}
