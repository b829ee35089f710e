use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::Duration,
};

use anyhow::{anyhow, Result};
use data_model::{NodeId, PhysicalBackupTool};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fleet::{job_plan::CommandStep, node::NodeSpec};

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory holding cookie marker files. Cookies are memory only when
    /// unset.
    #[serde(default)]
    pub cookie_dir: Option<String>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub acl: Option<AclConfig>,
}

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:10001".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: default_env(),
            listen_addr: default_listen_addr(),
            cookie_dir: None,
            telemetry: Default::default(),
            clusters: Vec::new(),
            jobs: Default::default(),
            acl: None,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(anyhow!("duplicate cluster name: {}", cluster.name));
            }
            for spec in cluster.servers.iter().chain(cluster.proxies.iter()) {
                NodeId::parse(&spec.url)
                    .map_err(|e| anyhow!("cluster {}: {}", cluster.name, e))?;
            }
            for url in &cluster.preferred_masters {
                if !cluster.servers.iter().any(|s| &s.url == url) {
                    return Err(anyhow!(
                        "cluster {}: preferred master {} is not one of its servers",
                        cluster.name,
                        url
                    ));
                }
            }
        }
        if self.jobs.log_buffer_lines == 0 {
            return Err(anyhow!("jobs.log_buffer_lines must be positive"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub preferred_masters: Vec<String>,
    #[serde(default)]
    pub servers: Vec<NodeSpec>,
    #[serde(default)]
    pub proxies: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub physical_backup_tool: PhysicalBackupTool,
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
    /// Command steps per task name, e.g. `optimize` or `reseedmariabackup`.
    #[serde(default)]
    pub plans: HashMap<String, Vec<CommandStep>>,
}

fn default_log_buffer_lines() -> usize {
    1000
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            physical_backup_tool: Default::default(),
            log_buffer_lines: default_log_buffer_lines(),
            plans: HashMap::new(),
        }
    }
}

/// Static bearer token table. Each token is allowed the listed path
/// prefixes, optionally restricted to one method (`GET /api/clusters`).
#[derive(Debug, Clone, Deserialize)]
pub struct AclConfig {
    pub tokens: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Stdout,
    Otlp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Enable metrics.
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 when empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    // Exporter used for traces. Only otlp exports spans; stdout keeps them
    // in the log output.
    #[serde(default)]
    pub tracing_exporter: Option<TracingExporter>,
    // Metrics export interval, seconds.
    #[serde(with = "duration_serde", default = "default_metrics_interval")]
    pub metrics_interval: Duration,
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: default_metrics_interval(),
            instance_id: None,
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
