// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::errors::{Error, Result};
use crate::types::keys::{self, Keypair};

use serde::{Deserialize, Serialize};

/// A signature together with the id of the key that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySig {
    /// Identifier of the signing key.
    pub key_id: String,
    /// Base64-encoded Ed25519 signature.
    pub sig: String,
}

/// The canonical JSON form of a trust object.
///
/// Keys are sorted lexicographically at every level, there is no whitespace,
/// and the object's own top-level `signatures` field is removed. This is the
/// exact byte sequence that signatures are produced over and verified
/// against; on-disk and on-wire encodings may use any key order.
pub fn canonical_json<T: Serialize>(object: &T) -> Result<String> {
    let mut value = serde_json::to_value(object)
        .map_err(|err| Error::Serialisation(format!("canonical form: {err}")))?;
    if let Some(map) = value.as_object_mut() {
        let _sigs = map.remove("signatures");
    }
    // serde_json maps are BTree-backed, so nested keys come out sorted
    serde_json::to_string(&value)
        .map_err(|err| Error::Serialisation(format!("canonical form: {err}")))
}

/// Sign a trust object's canonical form.
pub fn sign_object<T: Serialize>(object: &T, keypair: &Keypair, key_id: &str) -> Result<KeySig> {
    let canonical = canonical_json(object)?;
    Ok(KeySig {
        key_id: key_id.to_string(),
        sig: keys::sign_b64(canonical.as_bytes(), keypair),
    })
}

/// Verify one signature on a trust object against a base64 public key.
///
/// Serialization failure verifies as `false` like any other failure; the
/// boolean is the only signal surfaced.
pub fn verify_object<T: Serialize>(object: &T, sig: &KeySig, public_b64: &str) -> bool {
    match canonical_json(object) {
        Ok(canonical) => keys::verify_b64(canonical.as_bytes(), &sig.sig, public_b64),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::keys::{encode_public, gen_keypair};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Doc {
        // deliberately unsorted field order
        zebra: u32,
        alpha: String,
        nested: Nested,
        signatures: Vec<KeySig>,
    }

    #[derive(Serialize)]
    struct Nested {
        beta: bool,
        aleph: u8,
    }

    #[test]
    fn canonical_form_sorts_keys_and_drops_signatures() {
        let doc = Doc {
            zebra: 1,
            alpha: "a".into(),
            nested: Nested {
                beta: true,
                aleph: 7,
            },
            signatures: vec![KeySig {
                key_id: "k".into(),
                sig: "s".into(),
            }],
        };
        let canonical = canonical_json(&doc).expect("canonical form");
        assert_eq!(
            canonical,
            r#"{"alpha":"a","nested":{"aleph":7,"beta":true},"zebra":1}"#
        );
    }

    #[test]
    fn signature_covers_canonical_form() {
        let keypair = gen_keypair();
        let pk = encode_public(&keypair.public);
        let mut doc = Doc {
            zebra: 1,
            alpha: "a".into(),
            nested: Nested {
                beta: false,
                aleph: 0,
            },
            signatures: vec![],
        };

        let sig = sign_object(&doc, &keypair, "root-1").expect("sign");
        assert!(verify_object(&doc, &sig, &pk));

        // appending the signature to the object must not invalidate it
        doc.signatures.push(sig.clone());
        assert!(verify_object(&doc, &sig, &pk));

        // any field change must
        doc.zebra = 2;
        assert!(!verify_object(&doc, &sig, &pk));
    }
}
