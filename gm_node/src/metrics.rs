// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Node counters and gauges. Rendering (Prometheus text or otherwise) is a
//! host concern; this module only keeps the numbers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, updated from the hot paths.
#[derive(Debug, Default)]
pub struct Metrics {
    // connections
    pub connections_established: AtomicU64,
    pub connections_failed: AtomicU64,
    // messages
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_forwarded: AtomicU64,
    pub messages_dropped: AtomicU64,
    // control plane
    pub control_received: AtomicU64,
    pub control_accepted: AtomicU64,
    pub control_rejected: AtomicU64,
    // trust lifecycle
    pub crl_updates: AtomicU64,
    pub cert_renewals: AtomicU64,
    pub cert_renewal_failures: AtomicU64,
}

/// A point-in-time copy of every counter, plus the live gauges the node
/// fills in when snapshotting.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_established: u64,
    pub connections_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_forwarded: u64,
    pub messages_dropped: u64,
    pub control_received: u64,
    pub control_accepted: u64,
    pub control_rejected: u64,
    pub crl_updates: u64,
    pub cert_renewals: u64,
    pub cert_renewal_failures: u64,
    // gauges
    pub total_peers: usize,
    pub connected_peers: usize,
    pub total_routes: usize,
    pub crl_sequence: Option<u64>,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        let _prev = counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters; gauges are zeroed for the caller to fill.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            control_received: self.control_received.load(Ordering::Relaxed),
            control_accepted: self.control_accepted.load(Ordering::Relaxed),
            control_rejected: self.control_rejected.load(Ordering::Relaxed),
            crl_updates: self.crl_updates.load(Ordering::Relaxed),
            cert_renewals: self.cert_renewals.load(Ordering::Relaxed),
            cert_renewal_failures: self.cert_renewal_failures.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = Metrics::default();
        Metrics::incr(&metrics.messages_received);
        Metrics::incr(&metrics.messages_received);
        Metrics::incr(&metrics.control_rejected);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.control_rejected, 1);
        assert_eq!(snapshot.messages_sent, 0);
    }
}
