use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the balancer
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Front listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Replica-count limits and autoscaler thresholds
    #[serde(default)]
    pub scaling: ScalingConfig,

    /// CPU/memory pressure thresholds for the monitoring scaler
    #[serde(default)]
    pub pressure: PressureConfig,

    /// Health probing settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Deployment stack: services and networks to provision
    pub stack: StackConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScalingConfig {
    /// Number of replicas created at startup (default: 2)
    #[serde(default = "default_initial_replicas")]
    pub initial_replicas: usize,

    /// Hard floor on dispatch-listed replicas (default: 1)
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,

    /// Hard ceiling on total replicas, pending included (default: 5)
    #[serde(default = "default_max_replicas")]
    pub max_replicas: usize,

    /// Requests per window above which the pool grows (default: 20)
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: i64,

    /// Requests per window below which the pool shrinks (default: 5)
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: i64,

    /// Window length for the request-rate scaler and the health sweep,
    /// in seconds (default: 15)
    #[serde(default = "default_scale_interval")]
    pub scale_interval_secs: u64,

    /// Sampling interval for the pressure scaler, in seconds (default: 33)
    #[serde(default = "default_pressure_interval")]
    pub pressure_interval_secs: u64,
}

impl ScalingConfig {
    pub fn scale_interval(&self) -> Duration {
        Duration::from_secs(self.scale_interval_secs)
    }

    pub fn pressure_interval(&self) -> Duration {
        Duration::from_secs(self.pressure_interval_secs)
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            initial_replicas: default_initial_replicas(),
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            scale_interval_secs: default_scale_interval(),
            pressure_interval_secs: default_pressure_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PressureConfig {
    /// CPU% above which a replica counts as over-pressured (default: 75)
    #[serde(default = "default_cpu_high")]
    pub cpu_high: f64,

    /// Memory% above which a replica counts as over-pressured (default: 80)
    #[serde(default = "default_mem_high")]
    pub mem_high: f64,

    /// CPU% below which a replica counts as under-pressured (default: 40)
    #[serde(default = "default_cpu_low")]
    pub cpu_low: f64,

    /// Memory% below which a replica counts as under-pressured (default: 50)
    #[serde(default = "default_mem_low")]
    pub mem_low: f64,

    /// Fraction of valid samples that must be over-pressured to grow
    /// (default: 0.6, strict)
    #[serde(default = "default_up_ratio")]
    pub up_ratio: f64,

    /// Fraction of valid samples that must be under-pressured to shrink
    /// (default: 0.8, strict)
    #[serde(default = "default_down_ratio")]
    pub down_ratio: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            cpu_high: default_cpu_high(),
            mem_high: default_mem_high(),
            cpu_low: default_cpu_low(),
            mem_low: default_mem_low(),
            up_ratio: default_up_ratio(),
            down_ratio: default_down_ratio(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Path appended to each backend URL for probing (default: /healthz)
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Per-probe deadline in milliseconds (default: 5000)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Seconds after creation during which a failing replica is not
    /// pronounced dead (default: 10)
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,

    /// Capacity of the immediate-probe channel; sends are dropped when it
    /// is full (default: 10)
    #[serde(default = "default_trigger_capacity")]
    pub trigger_capacity: usize,
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_path: default_probe_path(),
            probe_timeout_ms: default_probe_timeout(),
            startup_grace_secs: default_startup_grace(),
            trigger_capacity: default_trigger_capacity(),
        }
    }
}

/// Compose-style deployment descriptor: the services this balancer manages
/// and the networks they attach to.
#[derive(Debug, Deserialize, Clone)]
pub struct StackConfig {
    /// Project label stamped on every created container and network
    #[serde(default = "default_project")]
    pub project: String,

    /// Name of the service scaled as replicas (default: api)
    #[serde(default = "default_replica_service")]
    pub replica_service: String,

    /// Name of the service kept as a singleton (default: database)
    #[serde(default = "default_database_service")]
    pub database_service: String,

    /// Service definitions keyed by service name
    pub services: HashMap<String, ServiceConfig>,

    /// Network definitions keyed by network name
    #[serde(default)]
    pub networks: HashMap<String, NetworkConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Image reference, e.g. `api_load_test:latest`
    pub image: String,

    /// Port mappings; the first entry's target is the service's main port
    #[serde(default)]
    pub ports: Vec<PortConfig>,

    /// Environment variables passed to created containers
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Fixed container name (singleton services only)
    pub container_name: Option<String>,

    /// Command override for created containers
    #[serde(default)]
    pub command: Vec<String>,
}

impl ServiceConfig {
    /// The container-side port this service listens on.
    pub fn container_port(&self) -> Option<u16> {
        self.ports.first().map(|p| p.target)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortConfig {
    /// Container-side port
    pub target: u16,

    /// Host-side port; leave unset to let the runtime pick one
    pub published: Option<u16>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NetworkConfig {
    /// Network driver (default: bridge)
    pub driver: Option<String>,

    /// Driver-specific options
    #[serde(default)]
    pub driver_opts: HashMap<String, String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_initial_replicas() -> usize {
    2
}

fn default_min_replicas() -> usize {
    1
}

fn default_max_replicas() -> usize {
    5
}

fn default_scale_up_threshold() -> i64 {
    20
}

fn default_scale_down_threshold() -> i64 {
    5
}

fn default_scale_interval() -> u64 {
    15
}

fn default_pressure_interval() -> u64 {
    33
}

fn default_cpu_high() -> f64 {
    75.0
}

fn default_mem_high() -> f64 {
    80.0
}

fn default_cpu_low() -> f64 {
    40.0
}

fn default_mem_low() -> f64 {
    50.0
}

fn default_up_ratio() -> f64 {
    0.6
}

fn default_down_ratio() -> f64 {
    0.8
}

fn default_probe_path() -> String {
    "/healthz".to_string()
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_startup_grace() -> u64 {
    10
}

fn default_trigger_capacity() -> usize {
    10
}

fn default_project() -> String {
    "api".to_string()
}

fn default_replica_service() -> String {
    "api".to_string()
}

fn default_database_service() -> String {
    "database".to_string()
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration. Called at startup; any error here
    /// is fatal.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.scaling.min_replicas == 0 {
            errors.push("scaling.min_replicas must be at least 1".to_string());
        }
        if self.scaling.max_replicas < self.scaling.min_replicas {
            errors.push(format!(
                "scaling.max_replicas ({}) is below scaling.min_replicas ({})",
                self.scaling.max_replicas, self.scaling.min_replicas
            ));
        }
        if self.scaling.initial_replicas < self.scaling.min_replicas
            || self.scaling.initial_replicas > self.scaling.max_replicas
        {
            errors.push(format!(
                "scaling.initial_replicas ({}) must lie within [{}, {}]",
                self.scaling.initial_replicas,
                self.scaling.min_replicas,
                self.scaling.max_replicas
            ));
        }
        if self.scaling.scale_interval_secs == 0 {
            errors.push("scaling.scale_interval_secs must be positive".to_string());
        }
        if self.scaling.pressure_interval_secs == 0 {
            errors.push("scaling.pressure_interval_secs must be positive".to_string());
        }

        for ratio in [self.pressure.up_ratio, self.pressure.down_ratio] {
            if !(0.0..=1.0).contains(&ratio) {
                errors.push(format!("pressure ratio {} is outside [0, 1]", ratio));
            }
        }

        if !self.health.probe_path.starts_with('/') {
            errors.push(format!(
                "health.probe_path {:?} must start with '/'",
                self.health.probe_path
            ));
        }
        if self.health.probe_timeout_ms == 0 {
            errors.push("health.probe_timeout_ms must be positive".to_string());
        }

        match self.stack.services.get(&self.stack.replica_service) {
            None => errors.push(format!(
                "stack.services has no entry for replica service {:?}",
                self.stack.replica_service
            )),
            Some(svc) => {
                if svc.container_port().is_none() {
                    errors.push(format!(
                        "replica service {:?} declares no ports",
                        self.stack.replica_service
                    ));
                }
            }
        }
        if let Some(db) = self.stack.services.get(&self.stack.database_service) {
            if db.container_port().is_none() {
                errors.push(format!(
                    "database service {:?} declares no ports",
                    self.stack.database_service
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration validation failed:\n  - {}", errors.join("\n  - "))
        }
    }

    /// The service definition replicas are created from.
    pub fn replica_service(&self) -> &ServiceConfig {
        // validate() guarantees presence
        &self.stack.services[&self.stack.replica_service]
    }

    /// The singleton database service definition, when declared.
    pub fn database_service(&self) -> Option<&ServiceConfig> {
        self.stack.services.get(&self.stack.database_service)
    }
}
