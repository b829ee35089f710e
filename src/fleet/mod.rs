//! The reconciliation core: one [`Fleet`] owning the configured clusters,
//! each [`Cluster`] owning its nodes.

pub mod cookies;
pub mod error;
pub mod job_plan;
pub mod jobs;
pub mod log_relay;
pub mod node;
pub mod reconcile;
pub mod switchover;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use dashmap::{mapref::entry::Entry, DashMap};
use data_model::{
    CookieKind,
    EdgeCookie,
    JobCategory,
    LevelCookie,
    NodeId,
    NodeKind,
};
use tracing::{info, warn};

use self::{
    error::{FleetError, Result},
    job_plan::JobPlans,
    log_relay::LogRelay,
    node::{LogLine, Node, NodeRegistry, NodeSpec},
    switchover::{FailoverInterlock, InterlockState, StaticTopology, TopologyMonitor},
};
use crate::{config::ServerConfig, metrics::FleetMetrics};

/// Settings shared by every node of a cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterSettings {
    pub cookie_dir: Option<PathBuf>,
    pub log_capacity: usize,
    pub plans: Arc<JobPlans>,
}

pub struct Cluster {
    pub name: String,
    pub nodes: Arc<NodeRegistry>,
    topology: Arc<dyn TopologyMonitor>,
    interlock: FailoverInterlock,
    cookie_dir: Option<PathBuf>,
    log_capacity: usize,
    plans: Arc<JobPlans>,
    metrics: Arc<FleetMetrics>,
}

impl Cluster {
    /// Creates an empty cluster driven by a [`StaticTopology`].
    pub fn new(
        name: &str,
        preferred_masters: Vec<NodeId>,
        settings: ClusterSettings,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        let nodes = Arc::new(NodeRegistry::default());
        let topology = Arc::new(StaticTopology::new(nodes.clone(), preferred_masters));
        Self {
            name: name.to_string(),
            nodes,
            topology,
            interlock: FailoverInterlock::default(),
            cookie_dir: settings.cookie_dir.map(|dir| dir.join(name)),
            log_capacity: settings.log_capacity,
            plans: settings.plans,
            metrics,
        }
    }

    /// Replaces the topology collaborator.
    pub fn with_topology(mut self, topology: Arc<dyn TopologyMonitor>) -> Self {
        self.topology = topology;
        self
    }

    pub fn add_node(&self, kind: NodeKind, spec: &NodeSpec) -> anyhow::Result<Arc<Node>> {
        let node = self
            .nodes
            .add(kind, spec, self.cookie_dir.as_deref(), self.log_capacity)
            .with_context(|| format!("adding node to cluster {}", self.name))?;
        info!(
            cluster = %self.name,
            node = %node.id,
            kind = node.kind.as_ref(),
            "node registered"
        );
        Ok(node)
    }

    /// Removes a node; its running jobs are asked to stop.
    pub fn remove_node(&self, name: &str) -> Result<Arc<Node>> {
        let node = self
            .nodes
            .remove(name)
            .ok_or_else(|| FleetError::node_not_found(&self.name, name))?;
        let running: Vec<String> = node
            .jobs
            .list()
            .into_iter()
            .filter(|job| job.is_running())
            .map(|job| job.name)
            .collect();
        let running: Vec<&str> = running.iter().map(String::as_str).collect();
        if let Err(err) = node.cancel_jobs(&running, false) {
            warn!(cluster = %self.name, node = %node.id, "unable to cancel jobs: {}", err);
        }
        info!(cluster = %self.name, node = %node.id, "node removed");
        Ok(node)
    }

    pub fn node(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes
            .find(name)
            .ok_or_else(|| FleetError::node_not_found(&self.name, name))
    }

    /// Like [`Cluster::node`], restricted to database servers.
    pub fn server(&self, name: &str) -> Result<Arc<Node>> {
        let node = self.node(name)?;
        switchover::ensure_server(&self.name, node.kind, name)?;
        Ok(node)
    }

    pub fn set_cookie(&self, node: &str, kind: impl Into<CookieKind>) -> Result<bool> {
        let kind = kind.into();
        let target = self.node(node)?;
        let newly_set = target.cookies.set(kind);
        info!(
            cluster = %self.name,
            node = %target.id,
            cookie = kind.name(),
            newly_set = newly_set,
            "cookie set"
        );
        self.metrics.cookie_set(kind);
        Ok(newly_set)
    }

    pub fn has_cookie(&self, node: &str, kind: LevelCookie) -> Result<bool> {
        Ok(self.node(node)?.cookies.has(kind))
    }

    pub fn consume_edge_cookie(&self, node: &str, kind: EdgeCookie) -> Result<bool> {
        let target = self.node(node)?;
        let consumed = target.cookies.consume(kind);
        if consumed {
            info!(
                cluster = %self.name,
                node = %target.id,
                cookie = kind.as_ref(),
                "edge cookie consumed"
            );
            self.metrics.edge_cookie_consumed(kind.into());
        }
        Ok(consumed)
    }

    /// Completion detector entry point: the level action was applied.
    pub fn clear_level_cookie(&self, node: &str, kind: LevelCookie) -> Result<bool> {
        let target = self.node(node)?;
        let cleared = target.cookies.clear(kind);
        if cleared {
            info!(
                cluster = %self.name,
                node = %target.id,
                cookie = kind.as_ref(),
                "level cookie cleared"
            );
        }
        Ok(cleared)
    }

    /// Sets `kind` on every node of the cluster. Returns how many nodes did
    /// not have it yet.
    pub fn set_cookie_on_all(&self, kind: impl Into<CookieKind>) -> usize {
        let kind = kind.into();
        let newly_set = self
            .nodes
            .all()
            .iter()
            .filter(|node| node.cookies.set(kind))
            .count();
        info!(
            cluster = %self.name,
            cookie = kind.name(),
            newly_set = newly_set,
            "cookie set on all nodes"
        );
        self.metrics.cookie_set(kind);
        newly_set
    }

    pub fn clear_cookie_on_all(&self, kind: LevelCookie) -> usize {
        self.nodes
            .all()
            .iter()
            .filter(|node| node.cookies.clear(kind))
            .count()
    }

    /// True while any node still carries `kind`. Computed on every call.
    pub fn rolling_requested(&self, kind: LevelCookie) -> bool {
        self.nodes.all().iter().any(|node| node.cookies.has(kind))
    }

    pub fn read_log(&self, node: &str, category: JobCategory, limit: usize) -> Result<Vec<LogLine>> {
        Ok(self.node(node)?.logs.tail(category, limit))
    }

    /// Manual switchover, optionally to a given server.
    pub async fn switchover(&self, target: Option<&str>) -> Result<NodeId> {
        let target = match target {
            Some(name) => Some(self.server(name)?.id.clone()),
            None => None,
        };
        self.interlock
            .switchover(&self.name, self.topology.as_ref(), target, &self.metrics)
            .await
    }

    pub async fn failover(&self) -> Result<NodeId> {
        self.interlock
            .failover(&self.name, self.topology.as_ref(), &self.metrics)
            .await
    }

    pub async fn set_preferred(&self, node: &str) -> Result<()> {
        let id = self.server(node)?.id.clone();
        info!(cluster = %self.name, node = %id, "preferred master set");
        self.interlock
            .set_preferred(self.topology.as_ref(), vec![id])
            .await;
        Ok(())
    }

    pub fn interlock_state(&self) -> InterlockState {
        self.interlock.state()
    }

    pub fn master(&self) -> Option<NodeId> {
        self.topology.master()
    }

    pub fn preferred_masters(&self) -> Vec<NodeId> {
        self.topology.preferred_masters()
    }
}

/// Supervisor owning every cluster of this control plane.
pub struct Fleet {
    clusters: DashMap<String, Arc<Cluster>>,
    pub log_relay: LogRelay,
}

impl Fleet {
    pub fn new(log_relay: LogRelay) -> Self {
        Self {
            clusters: DashMap::new(),
            log_relay,
        }
    }

    /// Builds clusters and nodes from the configuration. Persisted cookies
    /// are reloaded from the cookie directory.
    pub fn from_config(
        config: &ServerConfig,
        log_relay: LogRelay,
        metrics: Arc<FleetMetrics>,
    ) -> anyhow::Result<Self> {
        let fleet = Self::new(log_relay);
        let settings = ClusterSettings {
            cookie_dir: config.cookie_dir.as_ref().map(PathBuf::from),
            log_capacity: config.jobs.log_buffer_lines,
            plans: Arc::new(JobPlans::new(
                config.jobs.physical_backup_tool,
                config.jobs.plans.clone(),
            )),
        };
        for cluster_config in &config.clusters {
            let preferred = cluster_config
                .preferred_masters
                .iter()
                .map(|url| NodeId::parse(url))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let cluster = Cluster::new(
                &cluster_config.name,
                preferred,
                settings.clone(),
                metrics.clone(),
            );
            for spec in &cluster_config.servers {
                cluster.add_node(NodeKind::Server, spec)?;
            }
            for spec in &cluster_config.proxies {
                cluster.add_node(NodeKind::Proxy, spec)?;
            }
            fleet.add_cluster(cluster)?;
        }
        Ok(fleet)
    }

    pub fn add_cluster(&self, cluster: Cluster) -> anyhow::Result<Arc<Cluster>> {
        match self.clusters.entry(cluster.name.clone()) {
            Entry::Occupied(_) => Err(anyhow::anyhow!(
                "cluster {} is already registered",
                cluster.name
            )),
            Entry::Vacant(slot) => {
                let cluster = Arc::new(cluster);
                slot.insert(cluster.clone());
                Ok(cluster)
            }
        }
    }

    pub fn cluster(&self, name: &str) -> Result<Arc<Cluster>> {
        self.clusters
            .get(name)
            .map(|c| c.clone())
            .ok_or_else(|| FleetError::ClusterNotFound(name.to_string()))
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        let mut clusters: Vec<_> = self.clusters.iter().map(|c| c.value().clone()).collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        clusters
    }

    /// Relays an agent log fragment for a server of `cluster`.
    pub fn submit_log(&self, cluster: &str, node: &str, task: &str, fragment: &[u8]) -> Result<usize> {
        let target = self.cluster(cluster)?.server(node)?;
        self.log_relay.submit(&target, task, fragment)
    }
}
