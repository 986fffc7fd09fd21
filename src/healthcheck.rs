//! Health monitoring for backend replicas
//!
//! Periodically probes every known backend and drives each one across the
//! healthy/ill/dead state machine. New backends are probed immediately via
//! a lossy trigger channel so they become dispatch-eligible without waiting
//! for the next sweep.

use crate::backend::Backend;
use crate::client::ProxyClient;
use crate::cluster::Cluster;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Worker that owns backend health classification.
///
/// Probes never hold the pool mutex; the sweep snapshots the pool, probes
/// over the network, then re-acquires the mutex per backend to apply the
/// transition.
pub struct HealthMonitor {
    cluster: Arc<Cluster>,
    client: Arc<ProxyClient>,
    trigger_rx: mpsc::Receiver<Arc<Backend>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        cluster: Arc<Cluster>,
        client: Arc<ProxyClient>,
        trigger_rx: mpsc::Receiver<Arc<Backend>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cluster,
            client,
            trigger_rx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let interval = self.cluster.config().scaling.scale_interval();
        info!(interval_secs = interval.as_secs(), "Health monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep().await;
                }
                triggered = self.trigger_rx.recv() => {
                    match triggered {
                        Some(backend) => self.probe_one(&backend).await,
                        // All senders gone; keep sweeping on the ticker.
                        None => tokio::time::sleep(interval).await,
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every known backend once and apply the resulting transitions.
    ///
    /// The recovery worklist is cleared up front; each backend is re-filed
    /// into the heap or back onto the worklist as its probe lands.
    async fn sweep(&self) {
        let batch = self.cluster.pool().drain_for_review();
        debug!(backends = batch.len(), "health sweep");

        for backend in batch {
            self.probe_one(&backend).await;
        }
    }

    async fn probe_one(&self, backend: &Arc<Backend>) {
        // A backend being torn down is out of scope for classification.
        if backend.shutting_down() {
            return;
        }

        let health = self.cluster.config().health.clone();
        let ok = self
            .client
            .probe(backend, &health.probe_path, health.probe_timeout())
            .await;

        self.cluster
            .pool()
            .apply_probe(backend, ok, health.startup_grace());
    }
}
