//! Shared balancer state and replica lifecycle
//!
//! `Cluster` owns everything the workers share: the backend pool, the
//! scaling mutex that serializes growth and shrinkage, the request window
//! counter, and the immediate-probe trigger channel. It also provisions the
//! stack at startup (networks, singleton database, initial replicas) and
//! tears every known container down on shutdown.

use crate::backend::Backend;
use crate::config::Config;
use crate::docker::{ContainerRuntime, ContainerSpec};
use crate::pool::BackendPool;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// How long to poll inspect for the host-mapped port of a new container.
const PORT_DISCOVERY_TRIES: usize = 10;
const PORT_DISCOVERY_DELAY: Duration = Duration::from_millis(100);

/// Owner of all state shared between the dispatcher, the health monitor and
/// the two autoscalers.
pub struct Cluster {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    pool: Arc<BackendPool>,
    /// Serializes every scale-up/scale-down across both autoscalers. Always
    /// acquired before (and released after) any pool-mutex section inside a
    /// scale operation.
    scaling: Mutex<()>,
    /// Requests observed in the current window; swapped to zero each tick
    /// by the request-rate scaler.
    request_window: AtomicI64,
    /// Lossy channel nudging the health monitor to probe a new backend now.
    probe_tx: mpsc::Sender<Arc<Backend>>,
}

impl Cluster {
    /// Build the cluster and hand back the receiving end of the
    /// immediate-probe channel for the health monitor.
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Backend>>) {
        let (probe_tx, probe_rx) = mpsc::channel(config.health.trigger_capacity);
        let cluster = Arc::new(Self {
            config,
            runtime,
            pool: Arc::new(BackendPool::new()),
            scaling: Mutex::new(()),
            request_window: AtomicI64::new(0),
            probe_tx,
        });
        (cluster, probe_rx)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Count one incoming request against the current window.
    pub fn note_request(&self) {
        self.request_window.fetch_add(1, Ordering::SeqCst);
    }

    /// Read and reset the request window counter.
    pub fn take_request_window(&self) -> i64 {
        self.request_window.swap(0, Ordering::SeqCst)
    }

    /// Launch one more replica container and admit it to the pool as
    /// pending. A no-op (with teardown of the fresh container) when the
    /// pool is already at its ceiling.
    pub async fn scale_up(&self) -> anyhow::Result<()> {
        let _guard = self.scaling.lock().await;
        self.add_replica().await?;
        info!(replicas = self.pool.total_len(), "scaled up");
        Ok(())
    }

    /// Retire the least-loaded backend and remove its container, never
    /// dropping below the minimum and never interrupting in-flight
    /// requests; a busy backend is restored and retried on a later tick.
    pub async fn scale_down(&self) -> anyhow::Result<()> {
        let _guard = self.scaling.lock().await;

        let Some(backend) = self.pool.begin_retirement(self.config.scaling.min_replicas) else {
            return Ok(());
        };

        match self.remove_replica_container(backend.container_id()).await {
            Ok(()) => {
                info!(
                    container_id = backend.container_id(),
                    replicas = self.pool.total_len(),
                    "scaled down"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    container_id = backend.container_id(),
                    error = %e,
                    "teardown failed, restoring backend"
                );
                self.pool.reinstate(backend);
                Err(e)
            }
        }
    }

    /// Create, start and admit one replica. Callers must hold the scaling
    /// mutex (or run before the workers start).
    async fn add_replica(&self) -> anyhow::Result<Arc<Backend>> {
        let backend = self.launch_replica().await?;

        if !self
            .pool
            .admit(Arc::clone(&backend), self.config.scaling.max_replicas)
        {
            warn!(
                container_id = backend.container_id(),
                max = self.config.scaling.max_replicas,
                "pool at capacity, tearing fresh replica down"
            );
            self.remove_replica_container(backend.container_id()).await?;
            anyhow::bail!(
                "pool already holds {} replicas",
                self.config.scaling.max_replicas
            );
        }

        // Lossy by design: the periodic sweep will pick the backend up if
        // the trigger channel is full.
        if let Err(e) = self.probe_tx.try_send(Arc::clone(&backend)) {
            debug!(error = %e, "immediate-probe trigger dropped");
        }

        Ok(backend)
    }

    /// Spin up one container of the replica service and return a pending
    /// backend pointing at its published port.
    async fn launch_replica(&self) -> anyhow::Result<Arc<Backend>> {
        let service_name = &self.config.stack.replica_service;
        let svc = self.config.replica_service();
        let container_port = svc
            .container_port()
            .context("replica service declares no ports")?;

        self.runtime.ensure_image(&svc.image).await?;

        let existing = self.runtime.list_service_containers(service_name).await?;
        let suffix = next_replica_suffix(&existing, service_name);
        let name = format!("{}-{}", service_name, suffix);

        let spec = ContainerSpec {
            name: name.clone(),
            image: svc.image.clone(),
            cmd: svc.command.clone(),
            env: svc
                .environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            labels: self.service_labels(service_name),
            container_port,
            published_port: None,
            network: self.primary_network(),
        };

        let id = self.runtime.create_container(&spec).await?;
        self.runtime.start_container(&id).await?;

        let mut host_port = None;
        for _ in 0..PORT_DISCOVERY_TRIES {
            match self.runtime.mapped_host_port(&id, container_port).await? {
                Some(port) => {
                    host_port = Some(port);
                    break;
                }
                None => tokio::time::sleep(PORT_DISCOVERY_DELAY).await,
            }
        }

        let Some(host_port) = host_port else {
            warn!(container_id = id, container_name = name, "no host port mapping appeared");
            self.remove_replica_container(&id).await?;
            anyhow::bail!("container '{}' never published port {}", name, container_port);
        };

        let url = url::Url::parse(&format!("http://localhost:{}", host_port))
            .with_context(|| format!("invalid backend address for port {}", host_port))?;

        info!(
            container_id = id,
            container_name = name,
            url = %url,
            "launched replica"
        );
        Ok(Arc::new(Backend::pending(url, id)))
    }

    /// Stop and remove one container; both steps are idempotent on
    /// "not found".
    async fn remove_replica_container(&self, id: &str) -> anyhow::Result<()> {
        self.runtime.stop_container(id).await?;
        self.runtime.remove_container(id).await?;
        Ok(())
    }

    /// Provision the declared stack: networks, the singleton database, and
    /// the initial replicas. Runs once at startup, before any worker; any
    /// error here is fatal.
    pub async fn provision(&self) -> anyhow::Result<()> {
        for (name, net) in &self.config.stack.networks {
            self.runtime
                .ensure_network(name, net, &self.config.stack.project)
                .await?;
        }

        if let Some(db) = self.config.database_service() {
            self.ensure_database(db).await?;
        }

        for _ in 0..self.config.scaling.initial_replicas {
            self.add_replica().await?;
        }

        info!(
            replicas = self.pool.total_len(),
            "stack provisioned, replicas await first probe"
        );
        Ok(())
    }

    /// Make sure exactly one database container is running.
    async fn ensure_database(&self, svc: &crate::config::ServiceConfig) -> anyhow::Result<()> {
        let service_name = &self.config.stack.database_service;

        let running = self.runtime.running_service_count(service_name).await?;
        if running > 0 {
            debug!(service = service_name.as_str(), running, "database already running");
            return Ok(());
        }

        let container_port = svc
            .container_port()
            .context("database service declares no ports")?;

        self.runtime.ensure_image(&svc.image).await?;

        let name = svc
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.config.stack.project, service_name));

        let spec = ContainerSpec {
            name,
            image: svc.image.clone(),
            cmd: svc.command.clone(),
            env: svc
                .environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            labels: self.service_labels(service_name),
            container_port,
            published_port: svc.ports.first().and_then(|p| p.published),
            network: self.primary_network(),
        };

        let id = self.runtime.create_container(&spec).await?;
        self.runtime.start_container(&id).await?;
        info!(container_id = id, service = service_name.as_str(), "database started");
        Ok(())
    }

    /// Best-effort teardown of every known replica container at shutdown.
    pub async fn teardown_all(&self) {
        let backends = self.pool.drain_all();
        info!(count = backends.len(), "tearing down backend containers");

        for backend in backends {
            if let Err(e) = self.remove_replica_container(backend.container_id()).await {
                warn!(
                    container_id = backend.container_id(),
                    error = %e,
                    "failed to tear down container"
                );
            }
        }
    }

    fn service_labels(&self, service: &str) -> HashMap<String, String> {
        HashMap::from([
            (
                "com.docker.compose.project".to_string(),
                self.config.stack.project.clone(),
            ),
            (
                "com.docker.compose.service".to_string(),
                service.to_string(),
            ),
        ])
    }

    /// The network replicas attach to: first declared name in sorted order,
    /// skipping the engine-managed `default`.
    fn primary_network(&self) -> Option<String> {
        let mut names: Vec<_> = self
            .config
            .stack
            .networks
            .keys()
            .filter(|n| n.as_str() != "default")
            .collect();
        names.sort();
        names.first().map(|n| n.to_string())
    }
}

/// Next numeric suffix for a replica container name of the form
/// `<service>-<N>`: one past the highest existing suffix, or 1.
fn next_replica_suffix(existing: &[String], service: &str) -> u32 {
    let prefix = format!("{}-", service);
    existing
        .iter()
        .filter_map(|name| name.strip_prefix(&prefix))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}
