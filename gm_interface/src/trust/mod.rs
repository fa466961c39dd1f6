// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The trust envelope: every object whose authenticity the mesh depends on.
//!
//! All of these schemas share the same signing convention, implemented in
//! [`canonical`]: signatures are Ed25519 over the canonical JSON form of the
//! object with its own `signatures` field removed.

mod canonical;
mod certificates;
mod control;
mod genesis;
mod na;
mod policy;
mod revocation;

pub use self::{
    canonical::{canonical_json, sign_object, verify_object, KeySig},
    certificates::{JoinCertificate, ServiceManifest},
    control::{
        default_role_permissions, ControlCommand, ControlMessage, ControlScope, RolePermissions,
    },
    genesis::{BootstrapAnchor, GenesisBlock, NetworkAuthority, PolicyManifestRef},
    na::{validate_roles, HealthResponse, JoinRequest},
    policy::{PolicyManifest, RoutingPrefs},
    revocation::{CertificateRevocationList, RevokedCertificate},
};
