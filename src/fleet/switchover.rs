//! Serialization of manual switchover against automatic failover.
//!
//! Both run under one per-cluster async lock. A switchover temporarily
//! narrows the preferred-master list to its target, runs a non-forced
//! failover and puts the saved list back whatever the outcome. The restore
//! lives in a drop guard so it also runs when the caller goes away while the
//! failover is in flight.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use data_model::{NodeId, NodeKind, NodeRole};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use super::{
    error::{FleetError, Result},
    node::NodeRegistry,
};
use crate::metrics::{FleetMetrics, Timer};

/// Replication topology of one cluster, as seen by the monitoring loop.
///
/// Role detection and candidate election belong to the implementation; the
/// interlock only sequences calls into it.
#[async_trait]
pub trait TopologyMonitor: Send + Sync {
    fn is_master_failed(&self) -> bool;

    fn master(&self) -> Option<NodeId>;

    fn preferred_masters(&self) -> Vec<NodeId>;

    fn set_preferred_masters(&self, nodes: Vec<NodeId>);

    /// Promotes a new master and returns it. A non-forced failover is a
    /// switchover away from a live master; a forced one replaces a failed
    /// master.
    async fn master_failover(&self, forced: bool) -> anyhow::Result<NodeId>;
}

/// In-process topology driven by the roles and health reports held in the
/// node registry. Candidates are the live, non-maintenance servers; the
/// preferred list is tried first, in order.
pub struct StaticTopology {
    nodes: Arc<NodeRegistry>,
    preferred: RwLock<Vec<NodeId>>,
}

impl StaticTopology {
    pub fn new(nodes: Arc<NodeRegistry>, preferred: Vec<NodeId>) -> Self {
        Self {
            nodes,
            preferred: RwLock::new(preferred),
        }
    }

    fn elect(&self, old_master: Option<&NodeId>) -> Option<NodeId> {
        let candidates: Vec<_> = self
            .nodes
            .servers()
            .into_iter()
            .filter(|n| Some(&n.id) != old_master)
            .filter(|n| !n.is_down() && !n.is_maintenance() && n.role() != NodeRole::Failed)
            .map(|n| n.id.clone())
            .collect();
        self.preferred_masters()
            .into_iter()
            .find(|id| candidates.contains(id))
            .or_else(|| candidates.into_iter().next())
    }
}

#[async_trait]
impl TopologyMonitor for StaticTopology {
    fn is_master_failed(&self) -> bool {
        match self.nodes.servers().into_iter().find(|n| n.role() == NodeRole::Master) {
            Some(master) => master.is_down(),
            None => true,
        }
    }

    fn master(&self) -> Option<NodeId> {
        self.nodes
            .servers()
            .into_iter()
            .find(|n| n.role() == NodeRole::Master)
            .map(|n| n.id.clone())
    }

    fn preferred_masters(&self) -> Vec<NodeId> {
        self.preferred
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_preferred_masters(&self, nodes: Vec<NodeId>) {
        *self.preferred.write().unwrap_or_else(|e| e.into_inner()) = nodes;
    }

    async fn master_failover(&self, forced: bool) -> anyhow::Result<NodeId> {
        let failed = self.is_master_failed();
        if forced && !failed {
            return Err(anyhow!("master is alive, failover is not needed"));
        }
        if !forced && failed {
            return Err(anyhow!("master is failed, switchover is not possible"));
        }
        let old_master = self.master();
        let candidate = self
            .elect(old_master.as_ref())
            .ok_or_else(|| anyhow!("no candidate master available"))?;

        if let Some(old) = old_master.as_ref().and_then(|id| self.nodes.find(id.get())) {
            old.set_role(if forced {
                NodeRole::Failed
            } else {
                NodeRole::Slave
            });
        }
        let new_master = self
            .nodes
            .find(candidate.get())
            .ok_or_else(|| anyhow!("candidate {} left the cluster", candidate))?;
        new_master.set_role(NodeRole::Master);
        Ok(candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InterlockState {
    Stable,
    FailoverInProgress,
}

/// Per-cluster failover lock.
pub struct FailoverInterlock {
    lock: tokio::sync::Mutex<()>,
    state: Mutex<InterlockState>,
}

impl Default for FailoverInterlock {
    fn default() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(InterlockState::Stable),
        }
    }
}

/// Puts the saved preferred list back and marks the cluster stable.
struct RestoreGuard<'a> {
    interlock: &'a FailoverInterlock,
    topology: &'a dyn TopologyMonitor,
    saved: Option<Vec<NodeId>>,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.topology.set_preferred_masters(saved);
        }
        self.interlock.set_state(InterlockState::Stable);
    }
}

impl FailoverInterlock {
    pub fn state(&self) -> InterlockState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: InterlockState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub async fn switchover(
        &self,
        cluster: &str,
        topology: &dyn TopologyMonitor,
        target: Option<NodeId>,
        metrics: &FleetMetrics,
    ) -> Result<NodeId> {
        if topology.is_master_failed() {
            error!(cluster = cluster, "master failed, cannot initiate switchover");
            return Err(FleetError::MasterAlreadyFailed(cluster.to_string()));
        }

        let _lock = self.lock.lock().await;
        let _timer = Timer::start_with_labels(
            &metrics.switchover_duration,
            vec![KeyValue::new("kind", "switchover")],
        );
        self.set_state(InterlockState::FailoverInProgress);
        let guard = RestoreGuard {
            interlock: self,
            topology,
            saved: Some(topology.preferred_masters()),
        };
        if let Some(target) = target {
            info!(cluster = cluster, target = %target, "switchover to preferred master");
            topology.set_preferred_masters(vec![target]);
        }

        let res = topology.master_failover(false).await;
        drop(guard);

        match res {
            Ok(master) => {
                info!(cluster = cluster, master = %master, "switchover completed");
                metrics.switchover("switchover", true);
                Ok(master)
            }
            Err(err) => {
                warn!(cluster = cluster, "switchover failed: {:#}", err);
                metrics.switchover("switchover", false);
                Err(FleetError::Failover(err))
            }
        }
    }

    /// Automatic failover entry point, forced mode.
    pub async fn failover(
        &self,
        cluster: &str,
        topology: &dyn TopologyMonitor,
        metrics: &FleetMetrics,
    ) -> Result<NodeId> {
        let _lock = self.lock.lock().await;
        let _timer = Timer::start_with_labels(
            &metrics.switchover_duration,
            vec![KeyValue::new("kind", "failover")],
        );
        self.set_state(InterlockState::FailoverInProgress);
        let guard = RestoreGuard {
            interlock: self,
            topology,
            saved: None,
        };
        let res = topology.master_failover(true).await;
        drop(guard);

        metrics.switchover("failover", res.is_ok());
        res.inspect(|master| info!(cluster = cluster, master = %master, "failover completed"))
            .map_err(|err| {
                error!(cluster = cluster, "failover failed: {:#}", err);
                FleetError::Failover(err)
            })
    }

    /// Replaces the preferred-master list, waiting for any failover in
    /// flight so the change is not undone by its restore.
    pub async fn set_preferred(&self, topology: &dyn TopologyMonitor, nodes: Vec<NodeId>) {
        let _lock = self.lock.lock().await;
        topology.set_preferred_masters(nodes);
    }
}

/// Switchover targets must be database servers.
pub fn ensure_server(cluster: &str, kind: NodeKind, name: &str) -> Result<()> {
    if kind != NodeKind::Server {
        return Err(FleetError::node_not_found(cluster, name));
    }
    Ok(())
}
