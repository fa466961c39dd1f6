// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use thiserror::Error;

/// The type returned by node operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Node-level error, one variant per failure disposition.
///
/// Raw lower-layer errors never cross this boundary untranslated; each
/// handler maps failure into one of these kinds and acts on the kind.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input: undecodable message, schema mismatch, bad base64.
    #[error("Validation failure: {0}")]
    Validation(String),
    /// A signature did not verify or the issuer is unknown. Carries no
    /// further detail by design.
    #[error("Signature rejected")]
    Signature,
    /// RBAC denial, replay, or a message for a different target.
    #[error("Authorization denied: {0}")]
    Authorization(String),
    /// The transport failed; the connection is torn down.
    #[error("Transport failure: {0}")]
    Transport(#[from] gm_comms::Error),
    /// An expired or superseded object was ignored.
    #[error("Stale: {0}")]
    Stale(String),
    /// A limit was hit; the newcomer is refused.
    #[error("Capacity: {0}")]
    Capacity(String),
    /// The node cannot continue.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl From<gm_interface::Error> for Error {
    fn from(err: gm_interface::Error) -> Self {
        match err {
            gm_interface::Error::InvalidSignature => Error::Signature,
            other => Error::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn interface_errors_translate_by_kind() {
        assert_matches!(
            Error::from(gm_interface::Error::InvalidSignature),
            Error::Signature
        );
        assert_matches!(
            Error::from(gm_interface::Error::FailedToParse("nope".to_string())),
            Error::Validation(_)
        );
    }
}
