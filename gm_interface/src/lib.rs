// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Interfaces for the Genesis Mesh.
//!
//! This crate defines everything two mesh nodes must agree on before they can
//! talk: the trust schemas (genesis block, certificates, policy, CRL, control
//! messages), the canonical signing form, the wire message envelope, and the
//! shared utility types used by the comms and node crates.

// Forbid some very bad patterns. Forbid is stronger than `deny`, preventing us from suppressing the
// lint with `#[allow(...)]` et-all.
#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    clippy::unicode_not_nfc,
    clippy::unwrap_used
)]

#[macro_use]
extern crate tracing;

/// The wire message envelope and typed payloads.
pub mod messaging;
/// Trust-bearing schemas and canonical signing.
pub mod trust;
/// Shared utility types: keys, caches, errors, time.
pub mod types;

pub use self::types::errors::{Error, Result};

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the UNIX epoch.
///
/// Every timestamp carried on the wire or inside a trust object is a `u64`
/// of UNIX seconds; validity predicates take the time as a parameter so that
/// callers (and tests) control the clock.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
