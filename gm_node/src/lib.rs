// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Genesis Mesh node implementation.
//!
//! A node's right to participate derives from the signed genesis block and
//! a short-lived join certificate. This crate assembles the runtime: peer
//! management, distance-vector routing, the signed control plane, CRL
//! gossip, certificate renewal, tamper-evident auditing, and health.

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

pub mod audit;
pub mod cert_manager;
pub mod config;
pub mod control;
pub mod crl_gossip;
pub mod discovery;
mod error;
pub mod health;
pub mod metrics;
mod node;
pub mod peer_manager;
pub mod rbac;
pub mod routing;
pub mod services;

pub use self::config::NodeConfig;
pub use self::error::{Error, Result};
pub use self::node::{MeshNode, NodeContext};
