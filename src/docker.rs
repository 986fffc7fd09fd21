//! Container runtime driver: the capability contract the balancer needs
//! from a container engine, and its Docker implementation.

use crate::config::NetworkConfig;
use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Container-side port to expose
    pub container_port: u16,
    /// Host-side port; `None` lets the engine pick an ephemeral one
    pub published_port: Option<u16>,
    /// Network to attach the container to
    pub network: Option<String>,
}

/// Single-sample resource usage for one container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicaStats {
    /// CPU usage %
    pub cpu_percent: f64,
    /// Memory used in bytes, cache excluded
    pub memory_usage: u64,
    /// Memory limit in bytes
    pub memory_limit: u64,
    /// Memory usage %
    pub memory_percent: f64,
}

/// Abstract container engine operations the balancer depends on.
///
/// Production code wraps the Docker daemon; tests supply a scripted fake
/// that records calls.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull the image if it is not present locally.
    async fn ensure_image(&self, image: &str) -> anyhow::Result<()>;

    /// Names of all containers (running or not) labelled with the given
    /// compose service, leading slashes stripped.
    async fn list_service_containers(&self, service: &str) -> anyhow::Result<Vec<String>>;

    /// Number of *running* containers labelled with the given service.
    async fn running_service_count(&self, service: &str) -> anyhow::Result<usize>;

    /// Create a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    async fn start_container(&self, id: &str) -> anyhow::Result<()>;

    /// The host port the given container port is published on, if the
    /// mapping is visible yet.
    async fn mapped_host_port(&self, id: &str, container_port: u16)
        -> anyhow::Result<Option<u16>>;

    /// Stop a container. Succeeds when the container is already stopped or
    /// already gone.
    async fn stop_container(&self, id: &str) -> anyhow::Result<()>;

    /// Remove a container. Succeeds when the container is already gone.
    async fn remove_container(&self, id: &str) -> anyhow::Result<()>;

    /// One-shot CPU/memory sample for a container.
    async fn container_stats(&self, id: &str) -> anyhow::Result<ReplicaStats>;

    /// Create the network if it does not exist. The conventional `default`
    /// name is skipped.
    async fn ensure_network(
        &self,
        name: &str,
        config: &NetworkConfig,
        project: &str,
    ) -> anyhow::Result<()>;
}

/// `ContainerRuntime` backed by the local Docker daemon.
pub struct DockerRuntime {
    client: Docker,
}

/// Client timeout for daemon requests, in seconds.
const ENGINE_TIMEOUT_SECS: u64 = 120;

impl DockerRuntime {
    /// Connect to the container engine and verify it answers.
    ///
    /// `DOCKER_HOST` takes precedence when set; otherwise the platform's
    /// default socket is used. A ping round-trip runs before the handle is
    /// returned so an absent daemon fails provisioning immediately rather
    /// than on the first scale operation.
    pub async fn connect() -> anyhow::Result<Self> {
        let client = match std::env::var("DOCKER_HOST") {
            Ok(host) => Self::client_for(&host)
                .with_context(|| format!("connecting to container engine at {}", host))?,
            Err(_) => Docker::connect_with_socket_defaults()
                .context("connecting to the default container engine socket")?,
        };

        if let Err(e) = client.ping().await {
            anyhow::bail!("container engine did not answer a ping: {}", e);
        }

        debug!("container engine reachable");
        Ok(Self { client })
    }

    /// Build a client for one `DOCKER_HOST` value.
    fn client_for(host: &str) -> anyhow::Result<Docker> {
        let client = match host.split_once("://") {
            Some(("unix", path)) => {
                Docker::connect_with_socket(path, ENGINE_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            Some(("tcp", _)) | Some(("http", _)) => {
                Docker::connect_with_http(host, ENGINE_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            _ => anyhow::bail!(
                "unsupported DOCKER_HOST {:?}, expected a unix:// socket or tcp:// endpoint",
                host
            ),
        };
        Ok(client)
    }

    fn service_filter(service: &str) -> HashMap<String, Vec<String>> {
        HashMap::from([(
            "label".to_string(),
            vec![format!("com.docker.compose.service={}", service)],
        )])
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> anyhow::Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result.map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", image, e))?;
            if let Some(status) = progress.status {
                debug!(image, status, "Pull progress");
            }
            if let Some(error) = progress.error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn list_service_containers(&self, service: &str) -> anyhow::Result<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: Self::service_filter(service),
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list containers for service '{}': {}", service, e))?;

        // The engine reports names with a leading slash.
        let names = containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .collect();
        Ok(names)
    }

    async fn running_service_count(&self, service: &str) -> anyhow::Result<usize> {
        let mut filters = Self::service_filter(service);
        filters.insert("status".to_string(), vec!["running".to_string()]);
        let options = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list running containers for '{}': {}", service, e))?;
        Ok(containers.len())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let port_key = format!("{}/tcp", spec.container_port);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: spec.published_port.map(|p| p.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let cmd = if spec.cmd.is_empty() {
            None
        } else {
            Some(spec.cmd.clone())
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd,
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create container '{}' from image '{}': {}",
                    spec.name,
                    spec.image,
                    e
                )
            })?;

        info!(
            container_id = response.id,
            container_name = spec.name,
            image = spec.image,
            "Created container"
        );
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> anyhow::Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start container '{}': {}", id, e))?;
        info!(container_id = id, "Started container");
        Ok(())
    }

    async fn mapped_host_port(
        &self,
        id: &str,
        container_port: u16,
    ) -> anyhow::Result<Option<u16>> {
        let inspect = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container '{}': {}", id, e))?;

        let port_key = format!("{}/tcp", container_port);
        let host_port = inspect
            .network_settings
            .and_then(|s| s.ports)
            .and_then(|ports| ports.get(&port_key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|p| p.parse::<u16>().ok());

        Ok(host_port)
    }

    async fn stop_container(&self, id: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions { t: 10 };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container '{}': {}", id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => {
                debug!(container_id = id, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove container '{}': {}", id, e)),
        }
    }

    async fn container_stats(&self, id: &str) -> anyhow::Result<ReplicaStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = self.client.stats(id, Some(options));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("No stats sample for container '{}'", id))?
            .map_err(|e| anyhow::anyhow!("Failed to read stats for container '{}': {}", id, e))?;

        Ok(replica_stats_from(&stats))
    }

    async fn ensure_network(
        &self,
        name: &str,
        config: &NetworkConfig,
        project: &str,
    ) -> anyhow::Result<()> {
        if name == "default" {
            debug!(network = name, "Skipping predefined network");
            return Ok(());
        }

        let options = ListNetworksOptions {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        };
        let existing = self
            .client
            .list_networks(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list networks: {}", e))?;
        if !existing.is_empty() {
            debug!(network = name, "Network already exists");
            return Ok(());
        }

        let create = CreateNetworkOptions {
            name: name.to_string(),
            driver: config.driver.clone().unwrap_or_else(|| "bridge".to_string()),
            options: config.driver_opts.clone(),
            labels: HashMap::from([
                ("com.docker.compose.project".to_string(), project.to_string()),
                ("com.docker.compose.network".to_string(), name.to_string()),
            ]),
            ..Default::default()
        };

        let response = self
            .client
            .create_network(create)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create network '{}': {}", name, e))?;
        info!(network = name, id = ?response.id, "Created network");
        Ok(())
    }
}

/// Derive the percentage sample the scalers consume from one raw stats read.
fn replica_stats_from(stats: &Stats) -> ReplicaStats {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;

    let cpu_count = stats
        .cpu_stats
        .cpu_usage
        .percpu_usage
        .as_ref()
        .map(|v| v.len() as f64)
        .filter(|&n| n > 0.0)
        .or(stats.cpu_stats.online_cpus.map(|n| n as f64))
        .unwrap_or(1.0);

    compute_replica_stats(
        cpu_delta,
        system_delta,
        cpu_count,
        stats.memory_stats.usage.unwrap_or(0),
        memory_cache_bytes(&stats.memory_stats),
        stats.memory_stats.limit.unwrap_or(0),
    )
}

fn compute_replica_stats(
    cpu_delta: f64,
    system_delta: f64,
    cpu_count: f64,
    usage: u64,
    cache: u64,
    limit: u64,
) -> ReplicaStats {
    let cpu_percent = if cpu_delta > 0.0 && system_delta > 0.0 {
        (cpu_delta / system_delta) * cpu_count * 100.0
    } else {
        0.0
    };

    let memory_usage = usage.saturating_sub(cache);
    let memory_percent = if limit > 0 {
        (memory_usage as f64 / limit as f64) * 100.0
    } else {
        0.0
    };

    ReplicaStats {
        cpu_percent,
        memory_usage,
        memory_limit: limit,
        memory_percent,
    }
}

/// The page-cache share of reported memory usage. cgroup v1 exposes it as
/// `cache`; v2 as `inactive_file`.
fn memory_cache_bytes(memory: &bollard::container::MemoryStats) -> u64 {
    use bollard::container::MemoryStatsStats;
    match memory.stats {
        Some(MemoryStatsStats::V1(ref v1)) => v1.cache,
        Some(MemoryStatsStats::V2(ref v2)) => v2.inactive_file,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent_scales_by_core_count() {
        // (200 / 1000) * 4 cores * 100 = 80%
        let sample = compute_replica_stats(200.0, 1000.0, 4.0, 0, 0, 0);
        assert!((sample.cpu_percent - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cpu_percent_zero_without_positive_deltas() {
        let sample = compute_replica_stats(0.0, 0.0, 4.0, 0, 0, 0);
        assert_eq!(sample.cpu_percent, 0.0);

        // A counter reset must not produce a negative percentage.
        let sample = compute_replica_stats(-50.0, -100.0, 4.0, 0, 0, 0);
        assert_eq!(sample.cpu_percent, 0.0);
    }

    #[test]
    fn test_memory_percent_zero_without_limit() {
        let sample = compute_replica_stats(0.0, 0.0, 1.0, 512, 0, 0);
        assert_eq!(sample.memory_percent, 0.0);
        assert_eq!(sample.memory_usage, 512);
    }

    #[test]
    fn test_memory_percent_excludes_cache() {
        let sample = compute_replica_stats(0.0, 0.0, 1.0, 512, 256, 1024);
        assert!((sample.memory_percent - 25.0).abs() < f64::EPSILON);
        assert_eq!(sample.memory_usage, 256);
        assert_eq!(sample.memory_limit, 1024);
    }

    #[test]
    fn test_memory_cache_larger_than_usage_saturates() {
        let sample = compute_replica_stats(0.0, 0.0, 1.0, 100, 200, 1024);
        assert_eq!(sample.memory_usage, 0);
        assert_eq!(sample.memory_percent, 0.0);
    }
}
