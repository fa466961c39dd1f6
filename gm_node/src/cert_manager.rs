// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Certificate lifecycle: expiry monitoring and threshold-triggered renewal
//! with bounded backoff.

use super::audit::AuditLog;

use gm_interface::{now_secs, trust::JoinCertificate, types::NodeId};

use futures::future::BoxFuture;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tokio::{sync::Mutex, task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;

/// Renewal backoff schedule; the last entry repeats.
const BACKOFF: [Duration; 5] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
    Duration::from_secs(600),
];
/// Consecutive failures before the fatal callback fires.
const MAX_FAILURES: u32 = 5;

/// Reads the node's current certificate.
pub type CertSource = Arc<dyn Fn() -> BoxFuture<'static, Option<JoinCertificate>> + Send + Sync>;
/// Requests a fresh certificate from the Network Authority.
pub type RenewFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<JoinCertificate, String>> + Send + Sync>;
/// Fired with each successfully installed certificate.
pub type RenewedObserver = Arc<dyn Fn(JoinCertificate) -> BoxFuture<'static, ()> + Send + Sync>;
/// Fired when renewal is exhausted; the host is expected to shut down.
pub type FatalObserver = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Certificate status for health checks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CertStatus {
    pub present: bool,
    pub cert_id: Option<String>,
    pub expires_at: Option<u64>,
    pub expired: bool,
    pub remaining_fraction: f64,
    pub should_renew: bool,
    pub renewal_failures: u32,
}

/// Watches the certificate and renews it before it runs out.
pub struct CertManager {
    node_id: NodeId,
    get_certificate: CertSource,
    renew: RenewFn,
    on_renewed: Option<RenewedObserver>,
    on_fatal: Option<FatalObserver>,
    audit: Arc<AuditLog>,
    renewal_threshold: f64,
    failures: AtomicU32,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("node_id", &self.node_id)
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish()
    }
}

impl CertManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: &str,
        get_certificate: CertSource,
        renew: RenewFn,
        on_renewed: Option<RenewedObserver>,
        on_fatal: Option<FatalObserver>,
        audit: Arc<AuditLog>,
        renewal_threshold: f64,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            get_certificate,
            renew,
            on_renewed,
            on_fatal,
            audit,
            renewal_threshold,
            failures: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn should_renew(&self, cert: &JoinCertificate, now: u64) -> bool {
        if cert.is_expired(now) {
            error!("Certificate has already expired");
            return true;
        }
        let remaining = cert.remaining_fraction(now);
        if remaining <= self.renewal_threshold {
            info!(
                "Certificate renewal needed: {:.1}% validity remaining",
                remaining * 100.0
            );
            return true;
        }
        false
    }

    /// Try to renew until success or the failure budget is spent.
    ///
    /// Backs off between attempts; after [`MAX_FAILURES`] consecutive
    /// failures the fatal observer fires and the loop gives up.
    pub async fn attempt_renewal(&self) {
        loop {
            let attempt = self.failures.load(Ordering::Relaxed) + 1;
            info!("Attempting certificate renewal (attempt {attempt})");

            match (self.renew)().await {
                Ok(cert) if cert.is_valid(now_secs()) => {
                    self.failures.store(0, Ordering::Relaxed);
                    info!(
                        "Certificate renewed successfully (valid until {})",
                        cert.expires_at
                    );
                    self.audit.certificate_renewed(&cert.cert_id);
                    if let Some(observer) = &self.on_renewed {
                        observer(cert).await;
                    }
                    return;
                }
                Ok(_) => {
                    error!("Renewal returned a certificate that is not currently valid");
                }
                Err(err) => {
                    error!("Certificate renewal failed (attempt {attempt}): {err}");
                }
            }

            let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= MAX_FAILURES {
                error!("Maximum renewal failures reached, requesting shutdown");
                if let Some(observer) = &self.on_fatal {
                    observer().await;
                }
                return;
            }
            let delay = BACKOFF[((failures - 1) as usize).min(BACKOFF.len() - 1)];
            info!("Retrying renewal in {}s", delay.as_secs());
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Certificate status for health reporting.
    pub async fn status(&self) -> CertStatus {
        let now = now_secs();
        match (self.get_certificate)().await {
            Some(cert) => CertStatus {
                present: true,
                cert_id: Some(cert.cert_id.clone()),
                expires_at: Some(cert.expires_at),
                expired: cert.is_expired(now),
                remaining_fraction: cert.remaining_fraction(now),
                should_renew: self.should_renew(&cert, now),
                renewal_failures: self.failures.load(Ordering::Relaxed),
            },
            None => CertStatus {
                renewal_failures: self.failures.load(Ordering::Relaxed),
                ..CertStatus::default()
            },
        }
    }

    /// Start the periodic expiry monitor.
    pub async fn start(self: &Arc<Self>, check_interval: Duration) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = tokio::time::sleep(check_interval) => {}
                }
                let due = match (manager.get_certificate)().await {
                    Some(cert) => manager.should_renew(&cert, now_secs()),
                    None => false,
                };
                if due {
                    manager.attempt_renewal().await;
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Cancel the monitor and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = { self.tasks.lock().await.drain(..).collect() };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
