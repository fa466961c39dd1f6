// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::result;
use thiserror::Error;

/// A specialised `Result` type for the interfaces crate.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Main error type for the crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Serialization error.
    #[error("Serialisation error: {0}")]
    Serialisation(String),
    /// Could not parse bytes or JSON into the expected schema.
    #[error("Failed to parse: {0}")]
    FailedToParse(String),
    /// A signature did not verify.
    ///
    /// Deliberately carries no detail: a malformed key, undecodable base64
    /// and a genuinely wrong signature are indistinguishable to callers.
    #[error("Invalid signature")]
    InvalidSignature,
    /// A key could not be decoded from its textual representation.
    #[error("Malformed key material: {0}")]
    MalformedKey(String),
    /// A key or genesis file could not be read or written.
    #[error("Key file I/O: {0}")]
    Io(#[from] std::io::Error),
    /// A role string did not match any allowed role prefix.
    #[error("Role not permitted: {0}")]
    RoleNotPermitted(String),
}
