// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Multi-hop routing: the distance-vector table, the forwarding router and
//! the periodic announcement protocol.

mod protocol;
mod router;
mod table;

pub use self::{
    protocol::RoutingProtocol,
    router::{DropReason, MeshRouter, RouteOutcome},
    table::{Route, RouteStats, RoutingTable, LEARNED_DIRECT},
};
