// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Health evaluation over component status snapshots.

use super::cert_manager::CertStatus;
use super::peer_manager::PeerStats;
use super::routing::RouteStats;

use serde::Serialize;

/// Worst-first health levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// One component's verdict.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: HealthStatus,
    pub message: String,
}

/// The aggregated report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

/// Everything the evaluation looks at, gathered by the node.
#[derive(Clone, Debug, Default)]
pub struct HealthInputs {
    /// Certificate status, if a cert manager runs.
    pub cert: Option<CertStatus>,
    pub peers: PeerStats,
    pub routes: RouteStats,
    /// Whether the current CRL is past its next-update time; `None` when
    /// no CRL is held yet.
    pub crl_stale: Option<bool>,
    /// Fewest established peers considered healthy.
    pub min_peers: usize,
}

/// Evaluate all component checks and aggregate worst-first.
pub fn evaluate(inputs: &HealthInputs) -> HealthReport {
    let mut checks = Vec::new();

    if let Some(cert) = &inputs.cert {
        let (status, message) = if !cert.present {
            (HealthStatus::Unhealthy, "no certificate".to_string())
        } else if cert.expired {
            (HealthStatus::Unhealthy, "certificate expired".to_string())
        } else if cert.should_renew {
            (
                HealthStatus::Degraded,
                format!(
                    "certificate below renewal threshold ({:.0}% left)",
                    cert.remaining_fraction * 100.0
                ),
            )
        } else {
            (HealthStatus::Healthy, "certificate valid".to_string())
        };
        checks.push(HealthCheck {
            name: "certificate",
            status,
            message,
        });
    }

    let (status, message) = if inputs.peers.connected_peers == 0 {
        (HealthStatus::Unhealthy, "no established peers".to_string())
    } else if inputs.peers.connected_peers < inputs.min_peers {
        (
            HealthStatus::Degraded,
            format!(
                "only {} of {} wanted peers",
                inputs.peers.connected_peers, inputs.min_peers
            ),
        )
    } else {
        (
            HealthStatus::Healthy,
            format!("{} peers established", inputs.peers.connected_peers),
        )
    };
    checks.push(HealthCheck {
        name: "peers",
        status,
        message,
    });

    let (status, message) = if inputs.routes.total_routes <= inputs.routes.direct_neighbors {
        (
            HealthStatus::Degraded,
            "no multi-hop routes learned".to_string(),
        )
    } else {
        (
            HealthStatus::Healthy,
            format!("{} routes", inputs.routes.total_routes),
        )
    };
    checks.push(HealthCheck {
        name: "routing",
        status,
        message,
    });

    if let Some(stale) = inputs.crl_stale {
        checks.push(if stale {
            HealthCheck {
                name: "crl",
                status: HealthStatus::Degraded,
                message: "CRL past its next-update time".to_string(),
            }
        } else {
            HealthCheck {
                name: "crl",
                status: HealthStatus::Healthy,
                message: "CRL fresh".to_string(),
            }
        });
    }

    let status = checks
        .iter()
        .map(|check| check.status)
        .max()
        .unwrap_or(HealthStatus::Unknown);
    HealthReport { status, checks }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> HealthInputs {
        HealthInputs {
            cert: Some(CertStatus {
                present: true,
                remaining_fraction: 0.9,
                ..CertStatus::default()
            }),
            peers: PeerStats {
                total_peers: 3,
                connected_peers: 2,
                ..PeerStats::default()
            },
            routes: RouteStats {
                total_routes: 3,
                direct_neighbors: 2,
                avg_metric: 1.5,
            },
            crl_stale: Some(false),
            min_peers: 1,
        }
    }

    #[test]
    fn all_green_is_healthy() {
        assert_eq!(evaluate(&baseline()).status, HealthStatus::Healthy);
    }

    #[test]
    fn expired_certificate_is_unhealthy() {
        let mut inputs = baseline();
        inputs.cert = Some(CertStatus {
            present: true,
            expired: true,
            ..CertStatus::default()
        });
        assert_eq!(evaluate(&inputs).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn renewal_due_degrades_only() {
        let mut inputs = baseline();
        inputs.cert = Some(CertStatus {
            present: true,
            should_renew: true,
            remaining_fraction: 0.3,
            ..CertStatus::default()
        });
        assert_eq!(evaluate(&inputs).status, HealthStatus::Degraded);
    }

    #[test]
    fn no_peers_is_unhealthy() {
        let mut inputs = baseline();
        inputs.peers.connected_peers = 0;
        assert_eq!(evaluate(&inputs).status, HealthStatus::Unhealthy);
    }
}
