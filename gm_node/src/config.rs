// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use gm_comms::ConnectionConfig;
use tokio::time::Duration;

/// Every tunable of the node runtime, with the standard defaults.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    // peers
    /// Maximum peer table size.
    pub max_peers: usize,
    /// Maximum anchor entries.
    pub max_anchors: usize,
    /// How long a blacklisted peer stays out.
    pub blacklist_duration: Duration,
    /// Age past which a disconnected peer is pruned.
    pub stale_peer_age: Duration,
    /// Cadence of the stale-peer sweep.
    pub peer_sweep_interval: Duration,

    // routing
    /// Routes costlier than this are rejected.
    pub max_metric: u32,
    /// Age past which a non-neighbor route expires.
    pub route_timeout: Duration,
    /// Cadence of route announcements.
    pub route_announce_interval: Duration,
    /// Cadence of the stale-route sweep.
    pub route_cleanup_interval: Duration,

    // router
    /// Retention of seen message ids for loop suppression.
    pub seen_msg_ttl: Duration,
    /// Cadence of the seen-cache sweep.
    pub seen_sweep_interval: Duration,

    // discovery
    /// Cadence of peer-list gossip.
    pub discovery_interval: Duration,

    // control plane
    /// Replay-cache entry lifetime.
    pub replay_ttl: Duration,
    /// Cadence of the replay-cache sweep.
    pub replay_sweep_interval: Duration,
    /// Hard cap on replay-cache entries.
    pub replay_hard_cap: usize,
    /// How many newest entries survive a cap trim.
    pub replay_retain: usize,
    /// Default shutdown grace period when the command names none.
    pub shutdown_grace: Duration,

    // CRL gossip
    /// Cadence of CRL sequence announcements.
    pub crl_announce_interval: Duration,
    /// Cadence of the CRL cache sweep.
    pub crl_sweep_interval: Duration,
    /// CRL versions kept in the cache.
    pub crl_cache_capacity: usize,
    /// Age past which non-current cached CRLs are evicted.
    pub crl_cache_retention: Duration,

    // certificates
    /// Cadence of the certificate monitor.
    pub cert_check_interval: Duration,
    /// Remaining-validity fraction at which renewal triggers.
    pub cert_renewal_threshold: f64,

    // connections
    /// Per-connection settings (queue size, drop policy, ping cadence).
    pub connection: ConnectionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            max_anchors: 10,
            blacklist_duration: Duration::from_secs(300),
            stale_peer_age: Duration::from_secs(3600),
            peer_sweep_interval: Duration::from_secs(60),

            max_metric: 10,
            route_timeout: Duration::from_secs(300),
            route_announce_interval: Duration::from_secs(30),
            route_cleanup_interval: Duration::from_secs(60),

            seen_msg_ttl: Duration::from_secs(300),
            seen_sweep_interval: Duration::from_secs(60),

            discovery_interval: Duration::from_secs(60),

            replay_ttl: Duration::from_secs(3600),
            replay_sweep_interval: Duration::from_secs(300),
            replay_hard_cap: 10_000,
            replay_retain: 5_000,
            shutdown_grace: Duration::from_secs(30),

            crl_announce_interval: Duration::from_secs(60),
            crl_sweep_interval: Duration::from_secs(3600),
            crl_cache_capacity: 50,
            crl_cache_retention: Duration::from_secs(86_400),

            cert_check_interval: Duration::from_secs(60),
            cert_renewal_threshold: 0.5,

            connection: ConnectionConfig::default(),
        }
    }
}
