pub mod test_objects;

use std::{
    fmt::{self, Display},
    str::FromStr,
    time::SystemTime,
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString, IntoEnumIterator};

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Identity of a managed node, always in `host:port` form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn parse(url: &str) -> Result<Self> {
        let (host, port) = url
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("node address must be host:port, got {}", url))?;
        if host.is_empty() {
            return Err(anyhow!("node address has an empty host: {}", url));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow!("node address has an invalid port: {}", url))?;
        Ok(Self::new(host, port))
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.0)
    }

    pub fn port(&self) -> &str {
        self.0.rsplit_once(':').map(|(_, p)| p).unwrap_or_default()
    }

    /// File-system safe rendering, used for cookie marker directories.
    pub fn dir_name(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Server,
    Proxy,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeRole {
    Master,
    Slave,
    #[default]
    Standalone,
    Failed,
}

/// How a cookie behaves when it is observed by a poller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CookieSemantics {
    /// Stays set across reads until a completion detector clears it.
    Level,
    /// Consumed by the first reader that observes it.
    Edge,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumString,
    EnumIter,
)]
pub enum LevelCookie {
    #[serde(rename = "restart")]
    #[strum(serialize = "restart")]
    Restart,
    #[serde(rename = "reprov")]
    #[strum(serialize = "reprov")]
    Reprovision,
    #[serde(rename = "prov")]
    #[strum(serialize = "prov")]
    Provision,
    #[serde(rename = "unprov")]
    #[strum(serialize = "unprov")]
    Unprovision,
}

impl LevelCookie {
    /// Action word used in reconciliation replies, e.g. "Need restart!".
    pub fn action(&self) -> &'static str {
        match self {
            LevelCookie::Restart => "restart",
            LevelCookie::Reprovision => "reprov",
            LevelCookie::Provision => "provisioning",
            LevelCookie::Unprovision => "unprov",
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumString,
    EnumIter,
)]
pub enum EdgeCookie {
    #[serde(rename = "waitstart")]
    #[strum(serialize = "waitstart")]
    WaitStart,
    #[serde(rename = "waitstop")]
    #[strum(serialize = "waitstop")]
    WaitStop,
    #[serde(rename = "config")]
    #[strum(serialize = "config")]
    ConfigChange,
}

impl EdgeCookie {
    pub fn action(&self) -> &'static str {
        match self {
            EdgeCookie::WaitStart => "start",
            EdgeCookie::WaitStop => "stop",
            EdgeCookie::ConfigChange => "config change",
        }
    }
}

/// A pending-action flag on a node.
///
/// Level and edge cookies are kept as distinct inner types so that callers
/// can only ask for a pure read of a level cookie and can only consume an
/// edge cookie.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum CookieKind {
    Level(LevelCookie),
    Edge(EdgeCookie),
}

impl CookieKind {
    pub fn semantics(&self) -> CookieSemantics {
        match self {
            CookieKind::Level(_) => CookieSemantics::Level,
            CookieKind::Edge(_) => CookieSemantics::Edge,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CookieKind::Level(c) => c.as_ref(),
            CookieKind::Edge(c) => c.as_ref(),
        }
    }

    /// Bit used for this cookie in a node's cookie mask.
    pub fn mask(&self) -> u16 {
        match self {
            CookieKind::Level(LevelCookie::Restart) => 1 << 0,
            CookieKind::Level(LevelCookie::Reprovision) => 1 << 1,
            CookieKind::Level(LevelCookie::Provision) => 1 << 2,
            CookieKind::Level(LevelCookie::Unprovision) => 1 << 3,
            CookieKind::Edge(EdgeCookie::WaitStart) => 1 << 4,
            CookieKind::Edge(EdgeCookie::WaitStop) => 1 << 5,
            CookieKind::Edge(EdgeCookie::ConfigChange) => 1 << 6,
        }
    }

    pub fn all() -> impl Iterator<Item = CookieKind> {
        LevelCookie::iter()
            .map(CookieKind::Level)
            .chain(EdgeCookie::iter().map(CookieKind::Edge))
    }
}

impl From<LevelCookie> for CookieKind {
    fn from(value: LevelCookie) -> Self {
        CookieKind::Level(value)
    }
}

impl From<EdgeCookie> for CookieKind {
    fn from(value: EdgeCookie) -> Self {
        CookieKind::Edge(value)
    }
}

impl FromStr for CookieKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(level) = LevelCookie::from_str(s) {
            return Ok(level.into());
        }
        EdgeCookie::from_str(s)
            .map(CookieKind::Edge)
            .map_err(|_| anyhow!("unknown cookie: {}", s))
    }
}

impl Display for CookieKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Log sink a job or an agent task writes to.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobCategory {
    BackupStream,
    Task,
}

/// Tasks an agent may stream logs for, and the sink each one goes to.
const REGISTERED_TASKS: &[(&str, JobCategory)] = &[
    ("mariabackup", JobCategory::BackupStream),
    ("xtrabackup", JobCategory::BackupStream),
    ("reseedxtrabackup", JobCategory::BackupStream),
    ("reseedmariabackup", JobCategory::BackupStream),
    ("flashbackxtrabackup", JobCategory::BackupStream),
    ("flashbackmariabackup", JobCategory::BackupStream),
    ("error", JobCategory::Task),
    ("slowquery", JobCategory::Task),
    ("zfssnapback", JobCategory::Task),
    ("optimize", JobCategory::Task),
    ("reseedmysqldump", JobCategory::Task),
    ("flashbackmysqldump", JobCategory::Task),
    ("stop", JobCategory::Task),
    ("restart", JobCategory::Task),
    ("start", JobCategory::Task),
];

/// Returns the log category of a registered agent task, `None` otherwise.
pub fn classify_task(task: &str) -> Option<JobCategory> {
    REGISTERED_TASKS
        .iter()
        .find(|(name, _)| *name == task)
        .map(|(_, category)| *category)
}

/// Category used for a job's own log lines. Jobs outside the agent task
/// table log as plain tasks.
pub fn job_category(task: &str) -> JobCategory {
    classify_task(task).unwrap_or(JobCategory::Task)
}

/// Reseed and flashback jobs rewrite the node's data directory: they hold
/// the node in maintenance and at most one of them may run per node.
pub fn is_restore_task(task: &str) -> bool {
    task.starts_with("reseed") || task.starts_with("flashback")
}

/// Jobs cancelled by a reseed-cancel request.
pub const RESEED_CANCEL_TASKS: [&str; 4] = [
    "reseedmariabackup",
    "reseedxtrabackup",
    "flashbackmariabackup",
    "flashbackxtrabackup",
];

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PhysicalBackupTool {
    #[default]
    Mariabackup,
    Xtrabackup,
}

/// Restore strategy requested by `reseed/{method}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReseedMethod {
    LogicalBackup,
    LogicalMaster,
    PhysicalBackup,
}

impl ReseedMethod {
    pub fn task_name(&self, tool: PhysicalBackupTool) -> String {
        match self {
            ReseedMethod::LogicalBackup => "reseedmysqldump".to_string(),
            ReseedMethod::LogicalMaster => "reseedlogicalmaster".to_string(),
            ReseedMethod::PhysicalBackup => format!("reseed{}", tool.as_ref()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self(nanoid::nanoid!())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time snapshot of a job's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq)]
#[builder(setter(into))]
pub struct Job {
    #[builder(default)]
    pub id: JobId,
    pub node: NodeId,
    pub name: String,
    pub category: JobCategory,
    #[builder(default = "JobState::Running")]
    pub state: JobState,
    #[builder(default)]
    pub cancel_requested: bool,
    #[builder(default)]
    pub reseed_method: Option<ReseedMethod>,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub started_at: u64,
    #[builder(default)]
    pub finished_at: Option<u64>,
    #[builder(default)]
    pub message: Option<String>,
}

impl Job {
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}

/// Recovery target for a point-in-time restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PointInTimeRequest {
    /// Backup to restore from, as known by the node agent.
    #[serde(default)]
    pub backup: Option<String>,
    /// Tool the backup was taken with; defaults to the physical backup tool.
    #[serde(default)]
    pub backup_tool: Option<String>,
    /// Target time, unix seconds.
    pub restore_time: i64,
    /// Replay binary logs up to `restore_time` after the restore.
    #[serde(default)]
    pub use_binlog: bool,
    #[serde(default)]
    pub is_in_pitr: bool,
}

impl PointInTimeRequest {
    /// Job name for this restore: `flashback<tool>`.
    pub fn task_name(&self, default_tool: PhysicalBackupTool) -> Result<String> {
        let tool = match self.backup_tool.as_deref() {
            None => default_tool.as_ref().to_string(),
            Some(t @ ("mariabackup" | "xtrabackup" | "mysqldump")) => t.to_string(),
            Some(other) => return Err(anyhow!("unsupported backup tool: {}", other)),
        };
        Ok(format!("flashback{}", tool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse() {
        let id = NodeId::parse("db1:3306").unwrap();
        assert_eq!(id.host(), "db1");
        assert_eq!(id.port(), "3306");
        assert_eq!(id.dir_name(), "db1_3306");

        assert!(NodeId::parse("db1").is_err());
        assert!(NodeId::parse(":3306").is_err());
        assert!(NodeId::parse("db1:notaport").is_err());
    }

    #[test]
    fn test_cookie_masks_are_distinct() {
        let mut seen = 0u16;
        for kind in CookieKind::all() {
            assert_eq!(seen & kind.mask(), 0, "{} overlaps", kind);
            seen |= kind.mask();
        }
        assert_eq!(CookieKind::all().count(), 7);
    }

    #[test]
    fn test_cookie_names() {
        assert_eq!(
            "waitstart".parse::<CookieKind>().unwrap(),
            CookieKind::Edge(EdgeCookie::WaitStart)
        );
        assert_eq!(
            "reprov".parse::<CookieKind>().unwrap().semantics(),
            CookieSemantics::Level
        );
        assert!("nope".parse::<CookieKind>().is_err());
    }

    #[test]
    fn test_task_table() {
        assert_eq!(
            classify_task("reseedmariabackup"),
            Some(JobCategory::BackupStream)
        );
        assert_eq!(classify_task("optimize"), Some(JobCategory::Task));
        assert_eq!(classify_task("sqlinjection"), None);
        assert!(is_restore_task("flashbackmysqldump"));
        assert!(!is_restore_task("mariabackup"));
    }

    #[test]
    fn test_reseed_and_pitr_task_names() {
        assert_eq!(
            ReseedMethod::PhysicalBackup.task_name(PhysicalBackupTool::Xtrabackup),
            "reseedxtrabackup"
        );
        assert_eq!(
            "logicalmaster".parse::<ReseedMethod>().unwrap(),
            ReseedMethod::LogicalMaster
        );

        let pitr = PointInTimeRequest {
            backup_tool: Some("mysqldump".to_string()),
            ..Default::default()
        };
        assert_eq!(
            pitr.task_name(PhysicalBackupTool::Mariabackup).unwrap(),
            "flashbackmysqldump"
        );
        let bad = PointInTimeRequest {
            backup_tool: Some("tar".to_string()),
            ..Default::default()
        };
        assert!(bad.task_name(PhysicalBackupTool::Mariabackup).is_err());
    }
}
