use anyhow::Result;
use base64::prelude::*;
use data_model::{
    test_objects::tests::{TEST_CLUSTER, TEST_MASTER, TEST_PROXY, TEST_SECRET, TEST_SLAVE},
    NodeRole,
};
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{ClusterConfig, ServerConfig},
    fleet::{
        log_relay::{seal, KeyDerivation, Sha256KeyDerivation},
        node::{NodeSecret, NodeSpec},
    },
    routes::RouteState,
    service::Service,
};

pub struct TestService {
    pub service: Service,
    // Keeps the cookie directory alive for the lifetime of the test.
    pub cookie_dir: TempDir,
}

fn node_spec(url: &str, role: NodeRole) -> NodeSpec {
    NodeSpec {
        url: url.to_string(),
        name: None,
        role,
        secret: NodeSecret::new(TEST_SECRET),
    }
}

pub fn test_cluster_config() -> ClusterConfig {
    ClusterConfig {
        name: TEST_CLUSTER.to_string(),
        preferred_masters: vec![TEST_SLAVE.to_string()],
        servers: vec![
            node_spec(TEST_MASTER, NodeRole::Master),
            node_spec(TEST_SLAVE, NodeRole::Slave),
        ],
        proxies: vec![node_spec(TEST_PROXY, NodeRole::Standalone)],
    }
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(ServerConfig::default()).await
    }

    /// Starts a service for the test cluster on top of `cfg`.
    pub async fn with_config(cfg: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let cookie_dir = tempfile::tempdir()?;
        let cfg = ServerConfig {
            cookie_dir: Some(cookie_dir.path().to_string_lossy().to_string()),
            clusters: vec![test_cluster_config()],
            ..cfg
        };
        cfg.validate()?;
        let service = Service::new(cfg).await?;

        Ok(Self {
            service,
            cookie_dir,
        })
    }

    pub fn route_state(&self) -> RouteState {
        self.service.route_state()
    }
}

/// Encrypts `text` the way a node agent does.
pub fn agent_log_fragment(text: &str) -> Vec<u8> {
    let key = Sha256KeyDerivation.derive_key(&NodeSecret::new(TEST_SECRET));
    seal(&key, rand::random(), text.as_bytes()).unwrap()
}

/// Body of a `write-log` request carrying `text`.
pub fn agent_log_payload(text: &str) -> String {
    BASE64_STANDARD.encode(agent_log_fragment(text))
}
