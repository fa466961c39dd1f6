// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use gm_interface::types::NodeId;
use thiserror::Error;

/// The type returned by the comms crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("Transport I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Send queue full towards {0}, message dropped")]
    QueueFull(NodeId),
    #[error("Connection to {0} is closed")]
    ConnectionClosed(NodeId),
    #[error("Connection limit reached ({0})")]
    AtCapacity(usize),
    #[error("No connection to peer {0}")]
    UnknownPeer(NodeId),
    #[error("Message serialisation failed: {0}")]
    Serialisation(#[from] gm_interface::Error),
}
