use std::{
    collections::VecDeque,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        RwLock,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use data_model::{get_epoch_time_in_ms, JobCategory, NodeId, NodeKind, NodeRole};
use serde::{Deserialize, Serialize};

use super::{
    cookies::{CookieJournal, CookieSet},
    jobs::JobRegistry,
};

/// Credential shared between the control plane and a node agent. Never
/// printed.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct NodeSecret(String);

impl NodeSecret {
    #[cfg(test)]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for NodeSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodeSecret(***)")
    }
}

/// Declaration of a node, as found in the cluster configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: NodeRole,
    #[serde(default)]
    pub secret: NodeSecret,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogLine {
    pub at: u64,
    pub task: String,
    pub line: String,
}

/// Bounded per-category log of the jobs and agent tasks of one node.
#[derive(Debug)]
pub struct JobLogs {
    capacity: usize,
    backup_stream: Mutex<VecDeque<LogLine>>,
    task: Mutex<VecDeque<LogLine>>,
}

impl JobLogs {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            backup_stream: Mutex::new(VecDeque::new()),
            task: Mutex::new(VecDeque::new()),
        }
    }

    fn buffer(&self, category: JobCategory) -> &Mutex<VecDeque<LogLine>> {
        match category {
            JobCategory::BackupStream => &self.backup_stream,
            JobCategory::Task => &self.task,
        }
    }

    /// Appends every non-empty line of `text`. Returns the number of lines
    /// appended.
    pub fn append(&self, category: JobCategory, task: &str, text: &str) -> usize {
        let at = get_epoch_time_in_ms();
        let mut buffer = self
            .buffer(category)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut appended = 0;
        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(LogLine {
                at,
                task: task.to_string(),
                line: line.to_string(),
            });
            appended += 1;
        }
        appended
    }

    pub fn tail(&self, category: JobCategory, limit: usize) -> Vec<LogLine> {
        let buffer = self
            .buffer(category)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let skip = buffer.len().saturating_sub(limit);
        buffer.iter().skip(skip).cloned().collect()
    }
}

/// A managed database server or proxy.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub kind: NodeKind,
    role: RwLock<NodeRole>,
    down: AtomicBool,
    maintenance: AtomicBool,
    secret: NodeSecret,
    pub cookies: CookieSet,
    pub jobs: JobRegistry,
    pub logs: JobLogs,
}

impl Node {
    pub fn new(
        id: NodeId,
        kind: NodeKind,
        spec: &NodeSpec,
        cookies: CookieSet,
        log_capacity: usize,
    ) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            kind,
            role: RwLock::new(spec.role),
            down: AtomicBool::new(false),
            maintenance: AtomicBool::new(false),
            secret: spec.secret.clone(),
            cookies,
            jobs: JobRegistry::default(),
            logs: JobLogs::new(log_capacity),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.id.get() == name || self.name.as_deref() == Some(name)
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_role(&self, role: NodeRole) {
        *self.role.write().unwrap_or_else(|e| e.into_inner()) = role;
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Fed by the health-check collaborator.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Release);
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::Release);
    }

    /// Flips the maintenance flag and returns the new value.
    pub fn toggle_maintenance(&self) -> bool {
        !self.maintenance.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn secret(&self) -> &NodeSecret {
        &self.secret
    }
}

/// Nodes of one cluster, keyed by `host:port`.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<NodeId, Arc<Node>>,
}

impl NodeRegistry {
    /// Registers a node. Cookies persisted under `cookie_dir` are restored.
    pub fn add(
        &self,
        kind: NodeKind,
        spec: &NodeSpec,
        cookie_dir: Option<&Path>,
        log_capacity: usize,
    ) -> anyhow::Result<Arc<Node>> {
        let id = NodeId::parse(&spec.url)?;
        match self.nodes.entry(id.clone()) {
            Entry::Occupied(_) => Err(anyhow::anyhow!("node {} is already registered", id)),
            Entry::Vacant(slot) => {
                let journal = cookie_dir.map(|dir| CookieJournal::new(dir.join(id.dir_name())));
                let node = Arc::new(Node::new(
                    id,
                    kind,
                    spec,
                    CookieSet::new(journal),
                    log_capacity,
                ));
                slot.insert(node.clone());
                Ok(node)
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Node>> {
        let node = self.find(name)?;
        self.nodes.remove(&node.id).map(|(_, node)| node)
    }

    /// Looks a node up by `host:port` or by its alias.
    pub fn find(&self, name: &str) -> Option<Arc<Node>> {
        if let Ok(id) = NodeId::parse(name) {
            if let Some(node) = self.nodes.get(&id) {
                return Some(node.clone());
            }
        }
        self.nodes
            .iter()
            .find(|entry| entry.value().matches(name))
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of all nodes, sorted by identity.
    pub fn all(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn servers(&self) -> Vec<Arc<Node>> {
        self.all()
            .into_iter()
            .filter(|n| n.kind == NodeKind::Server)
            .collect()
    }
}
