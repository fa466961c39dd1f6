// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Ed25519 key primitives.
//!
//! Keys cross process boundaries as standard base64 of their 32-byte form.
//! Key files are plain text: `#`-prefixed comment lines are skipped and the
//! concatenation of the remaining lines is the base64 value.

pub use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Verifier};

use super::errors::{Error, Result};

use ed25519_dalek::{ExpandedSecretKey, SECRET_KEY_LENGTH};
use std::{
    convert::TryFrom,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Generate a fresh Ed25519 keypair.
pub fn gen_keypair() -> Keypair {
    let mut rng = rand::thread_rng();
    Keypair::generate(&mut rng)
}

/// Sign a message with the given keypair.
pub fn sign(msg: &[u8], keypair: &Keypair) -> Signature {
    let expanded_secret_key = ExpandedSecretKey::from(&keypair.secret);
    expanded_secret_key.sign(msg, &keypair.public)
}

/// Base64 of a public key.
pub fn encode_public(public: &PublicKey) -> String {
    base64::encode(public.as_bytes())
}

/// Decode a base64 public key.
pub fn decode_public(encoded: &str) -> Result<PublicKey> {
    let bytes =
        base64::decode(encoded).map_err(|err| Error::MalformedKey(format!("base64: {err}")))?;
    PublicKey::from_bytes(&bytes).map_err(|err| Error::MalformedKey(format!("{err}")))
}

/// Base64 of the secret seed.
pub fn encode_secret(keypair: &Keypair) -> String {
    base64::encode(keypair.secret.as_bytes())
}

/// Rebuild a keypair from a base64 secret seed.
pub fn decode_secret(encoded: &str) -> Result<Keypair> {
    let bytes =
        base64::decode(encoded).map_err(|err| Error::MalformedKey(format!("base64: {err}")))?;
    keypair_from_seed(&bytes)
}

fn keypair_from_seed(seed: &[u8]) -> Result<Keypair> {
    if seed.len() != SECRET_KEY_LENGTH {
        return Err(Error::MalformedKey(format!(
            "expected {SECRET_KEY_LENGTH} byte seed, got {}",
            seed.len()
        )));
    }
    let secret =
        SecretKey::from_bytes(seed).map_err(|err| Error::MalformedKey(format!("{err}")))?;
    let public = PublicKey::from(&secret);
    Ok(Keypair { secret, public })
}

/// Sign a message, returning the signature as base64.
pub fn sign_b64(msg: &[u8], keypair: &Keypair) -> String {
    base64::encode(sign(msg, keypair).to_bytes())
}

/// Verify a base64 signature against a base64 public key.
///
/// Any failure (bad base64, malformed key, wrong signature) is just `false`;
/// callers never learn which, so verification exposes no oracle.
pub fn verify_b64(msg: &[u8], signature_b64: &str, public_b64: &str) -> bool {
    let public = match decode_public(public_b64) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig_bytes = match base64::decode(signature_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = match Signature::try_from(sig_bytes.as_slice()) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    public.verify(msg, &signature).is_ok()
}

fn read_key_file(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)?;
    let joined: String = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .map(str::trim)
        .collect();
    base64::decode(&joined).map_err(|err| Error::MalformedKey(format!("base64: {err}")))
}

/// Load a secret key file, returning the full keypair.
pub fn load_keypair(path: &Path) -> Result<Keypair> {
    let seed = read_key_file(path)?;
    keypair_from_seed(&seed)
}

/// Load a public key file.
pub fn load_public(path: &Path) -> Result<PublicKey> {
    let bytes = read_key_file(path)?;
    PublicKey::from_bytes(&bytes).map_err(|err| Error::MalformedKey(format!("{err}")))
}

/// Write `<base>.key` (owner-only permissions) and `<base>.pub`.
///
/// Returns the two paths written.
pub fn save_keypair(
    keypair: &Keypair,
    base: &Path,
    key_id: Option<&str>,
) -> Result<(PathBuf, PathBuf)> {
    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent)?;
    }
    let secret_path = base.with_extension("key");
    let public_path = base.with_extension("pub");

    write_key_file(
        &secret_path,
        "Ed25519 Private Key",
        key_id,
        &encode_secret(keypair),
    )?;
    write_key_file(
        &public_path,
        "Ed25519 Public Key",
        key_id,
        &encode_public(&keypair.public),
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))?;
    }

    Ok((secret_path, public_path))
}

fn write_key_file(path: &Path, title: &str, key_id: Option<&str>, value: &str) -> Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "# {title}")?;
    if let Some(id) = key_id {
        writeln!(file, "# Key ID: {id}")?;
    }
    writeln!(file, "{value}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn sign_and_verify_roundtrip() {
        let keypair = gen_keypair();
        let msg = b"the network constitution";
        let sig = sign_b64(msg, &keypair);
        let pk = encode_public(&keypair.public);

        assert!(verify_b64(msg, &sig, &pk));
        assert!(!verify_b64(b"something else", &sig, &pk));
    }

    #[test]
    fn verify_rejects_garbage_without_detail() {
        let keypair = gen_keypair();
        let pk = encode_public(&keypair.public);

        // bad base64 signature, truncated signature, bad key: all just false
        assert!(!verify_b64(b"msg", "!!not-base64!!", &pk));
        assert!(!verify_b64(b"msg", &base64::encode([0u8; 12]), &pk));
        assert!(!verify_b64(
            b"msg",
            &sign_b64(b"msg", &keypair),
            "!!not-base64!!"
        ));
    }

    #[test]
    fn key_files_roundtrip_and_skip_comments() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("node");
        let keypair = gen_keypair();

        let (secret_path, public_path) = save_keypair(&keypair, &base, Some("node-1"))?;

        let loaded = load_keypair(&secret_path)?;
        assert_eq!(loaded.public.as_bytes(), keypair.public.as_bytes());

        let public = load_public(&public_path)?;
        assert_eq!(public.as_bytes(), keypair.public.as_bytes());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn secret_key_file_is_owner_only() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let (secret_path, _) = save_keypair(&gen_keypair(), &dir.path().join("node"), None)?;
        let mode = std::fs::metadata(&secret_path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }
}
