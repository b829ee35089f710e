use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FleetError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("node not found: {node} in cluster {cluster}")]
    NodeNotFound { cluster: String, node: String },

    #[error("not a valid server: {0} is down")]
    NodeUnavailable(String),

    #[error("job {task} is already running on {node}")]
    DuplicateJob { node: String, task: String },

    #[error("task is not registered: {0}")]
    UnregisteredTask(String),

    #[error("unable to decrypt log fragment for {node}: {reason}")]
    DecryptionFailed { node: String, reason: String },

    #[error("master {0} is failed, switchover is not possible")]
    MasterAlreadyFailed(String),

    #[error("unable to cancel job {task} on {node}: {source}")]
    JobCancelFailed {
        node: String,
        task: String,
        source: std::io::Error,
    },

    #[error("{identity} is not authorized for {path}")]
    NotAuthorized { identity: String, path: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failover failed: {0:#}")]
    Failover(anyhow::Error),
}

impl FleetError {
    pub fn node_not_found(cluster: &str, node: &str) -> Self {
        Self::NodeNotFound {
            cluster: cluster.to_string(),
            node: node.to_string(),
        }
    }

    /// Lookup failures are caller or configuration errors and are never
    /// retried.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, Self::ClusterNotFound(_) | Self::NodeNotFound { .. })
    }
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;
