use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::{Job, NodeRole, PointInTimeRequest};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::{IntoParams, ToSchema};

use crate::fleet::{
    error::FleetError,
    node::{LogLine, Node},
    switchover::InterlockState,
    Cluster,
};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct FleetAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl FleetAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    #[cfg(test)]
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for FleetAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<FleetError> for FleetAPIError {
    fn from(err: FleetError) -> Self {
        let status_code = match &err {
            err if err.is_lookup_failure() => StatusCode::NOT_FOUND,
            FleetError::DuplicateJob { .. } => StatusCode::CONFLICT,
            FleetError::UnregisteredTask(_) |
            FleetError::MasterAlreadyFailed(_) |
            FleetError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            FleetError::NotAuthorized { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status_code, &err.to_string())
    }
}

/// Envelope returned to node agents.
#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct ApiResponse {
    pub data: String,
    pub success: bool,
}

/// Log fragment pushed by a node agent: base64 of `nonce || ciphertext`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EncryptedLog {
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub down: bool,
    /// Role as detected by the monitoring loop, one of master, slave,
    /// standalone or failed.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub role: Option<NodeRole>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct SwitchoverRequest {
    /// Server to promote. The preferred-master list is used when absent.
    #[serde(default)]
    pub prefmaster: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SwitchoverResult {
    pub master: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PitrRequest {
    #[serde(default)]
    pub backup: Option<String>,
    #[serde(default)]
    pub backup_tool: Option<String>,
    /// Target time, unix seconds.
    pub restore_time: i64,
    #[serde(default)]
    pub use_binlog: bool,
}

impl From<PitrRequest> for PointInTimeRequest {
    fn from(request: PitrRequest) -> Self {
        PointInTimeRequest {
            backup: request.backup,
            backup_tool: request.backup_tool,
            restore_time: request.restore_time,
            use_binlog: request.use_binlog,
            is_in_pitr: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, IntoParams)]
pub struct TailParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobView {
    pub id: String,
    pub node: String,
    pub name: String,
    pub category: String,
    pub state: String,
    pub cancel_requested: bool,
    pub reseed_method: Option<String>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub message: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.to_string(),
            node: job.node.to_string(),
            name: job.name,
            category: job.category.as_ref().to_string(),
            state: job.state.as_ref().to_string(),
            cancel_requested: job.cancel_requested,
            reseed_method: job.reseed_method.map(|m| m.as_ref().to_string()),
            started_at: job.started_at,
            finished_at: job.finished_at,
            message: job.message,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobList {
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogLineView {
    pub at: u64,
    pub task: String,
    pub line: String,
}

impl From<LogLine> for LogLineView {
    fn from(line: LogLine) -> Self {
        Self {
            at: line.at,
            task: line.task,
            line: line.line,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogTail {
    pub lines: Vec<LogLineView>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NodeView {
    pub id: String,
    pub name: Option<String>,
    pub kind: String,
    pub role: String,
    pub down: bool,
    pub maintenance: bool,
    pub cookies: Vec<String>,
    pub running_jobs: usize,
}

impl From<&Node> for NodeView {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.to_string(),
            name: node.name.clone(),
            kind: node.kind.as_ref().to_string(),
            role: node.role().as_ref().to_string(),
            down: node.is_down(),
            maintenance: node.is_maintenance(),
            cookies: node
                .cookies
                .snapshot()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            running_jobs: node.jobs.running(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NodeList {
    pub nodes: Vec<NodeView>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClusterView {
    pub name: String,
    pub master: Option<String>,
    pub preferred_masters: Vec<String>,
    pub interlock_state: InterlockState,
    pub rolling_restart: bool,
    pub rolling_reprov: bool,
    pub nodes: Vec<NodeView>,
}

impl From<&Cluster> for ClusterView {
    fn from(cluster: &Cluster) -> Self {
        Self {
            name: cluster.name.clone(),
            master: cluster.master().map(|m| m.to_string()),
            preferred_masters: cluster
                .preferred_masters()
                .iter()
                .map(|m| m.to_string())
                .collect(),
            interlock_state: cluster.interlock_state(),
            rolling_restart: cluster.rolling_requested(data_model::LevelCookie::Restart),
            rolling_reprov: cluster.rolling_requested(data_model::LevelCookie::Reprovision),
            nodes: cluster
                .nodes
                .all()
                .iter()
                .map(|n| NodeView::from(n.as_ref()))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClusterList {
    pub clusters: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MaintenanceState {
    pub maintenance: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (FleetError::ClusterNotFound("c".into()), StatusCode::NOT_FOUND),
            (FleetError::node_not_found("c", "n"), StatusCode::NOT_FOUND),
            (
                FleetError::DuplicateJob {
                    node: "n".into(),
                    task: "t".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                FleetError::UnregisteredTask("sqlinjection".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                FleetError::DecryptionFailed {
                    node: "n".into(),
                    reason: "r".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                FleetError::MasterAlreadyFailed("c".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                FleetError::NotAuthorized {
                    identity: "i".into(),
                    path: "/".into(),
                },
                StatusCode::FORBIDDEN,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(FleetAPIError::from(err).status_code(), status);
        }
    }
}
