// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Shared utility types.

pub mod cache;
pub mod errors;
pub mod keys;

pub use self::cache::Cache;
pub use self::errors::{Error, Result};

/// A node is identified by an opaque string id.
///
/// Ids are stable keys into the flat peer/route tables; for joined nodes the
/// id is derived from the node public key, bootstrap placeholders use an
/// `anchor-<endpoint>` form until the handshake rewrites them.
pub type NodeId = String;
