use std::collections::HashMap;

use data_model::{Job, PhysicalBackupTool, PointInTimeRequest, ReseedMethod, RESEED_CANCEL_TASKS};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;

use super::{
    error::{FleetError, Result},
    jobs::JobContext,
    Cluster,
};

/// One external command of a job. Arguments may carry `{host}`, `{port}`,
/// `{node}`, `{task}`, `{master}`, `{backup}` and `{restore_time}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandStep {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandStep {
    fn command(&self, vars: &HashMap<&'static str, String>) -> Command {
        let mut command = Command::new(substitute(&self.program, vars));
        command.args(self.args.iter().map(|arg| substitute(arg, vars)));
        command
    }
}

fn substitute(template: &str, vars: &HashMap<&'static str, String>) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Command plans per task name, plus the physical backup tool used to name
/// backup and restore jobs.
#[derive(Debug, Clone, Default)]
pub struct JobPlans {
    pub physical_backup_tool: PhysicalBackupTool,
    plans: HashMap<String, Vec<CommandStep>>,
}

impl JobPlans {
    pub fn new(
        physical_backup_tool: PhysicalBackupTool,
        plans: HashMap<String, Vec<CommandStep>>,
    ) -> Self {
        Self {
            physical_backup_tool,
            plans,
        }
    }

    pub fn steps(&self, task: &str) -> Vec<CommandStep> {
        self.plans.get(task).cloned().unwrap_or_default()
    }
}

/// Job requests an operator can make on a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    BackupPhysical,
    BackupLogical,
    BackupErrorLog,
    BackupSlowQueryLog,
    Optimize,
    Reseed(ReseedMethod),
    PointInTime(PointInTimeRequest),
}

impl JobAction {
    /// Actions addressed by a single path segment.
    pub fn from_path(action: &str) -> Result<Self> {
        match action {
            "backup-physical" => Ok(JobAction::BackupPhysical),
            "backup-logical" => Ok(JobAction::BackupLogical),
            "backup-error-log" => Ok(JobAction::BackupErrorLog),
            "backup-slowquery-log" => Ok(JobAction::BackupSlowQueryLog),
            "optimize" => Ok(JobAction::Optimize),
            _ => Err(FleetError::InvalidRequest(format!(
                "unknown job action: {}",
                action
            ))),
        }
    }

    pub fn task_name(&self, tool: PhysicalBackupTool) -> Result<String> {
        let task = match self {
            JobAction::BackupPhysical => tool.as_ref().to_string(),
            JobAction::BackupLogical => "mysqldump".to_string(),
            JobAction::BackupErrorLog => "error".to_string(),
            JobAction::BackupSlowQueryLog => "slowquery".to_string(),
            JobAction::Optimize => "optimize".to_string(),
            JobAction::Reseed(method) => method.task_name(tool),
            JobAction::PointInTime(request) => request
                .task_name(tool)
                .map_err(|e| FleetError::InvalidRequest(e.to_string()))?,
        };
        Ok(task)
    }

    fn reseed_method(&self) -> Option<ReseedMethod> {
        match self {
            JobAction::Reseed(method) => Some(*method),
            _ => None,
        }
    }
}

async fn run_plan(
    ctx: JobContext,
    steps: Vec<CommandStep>,
    vars: HashMap<&'static str, String>,
) -> anyhow::Result<()> {
    if steps.is_empty() {
        ctx.log("no local plan, work delegated to the node agent");
        return Ok(());
    }
    for (i, step) in steps.iter().enumerate() {
        ctx.checkpoint()?;
        ctx.log(&format!("step {}/{}: {}", i + 1, steps.len(), step.program));
        ctx.run_command(step.command(&vars)).await?;
    }
    Ok(())
}

impl Cluster {
    /// Dispatches the job behind `action` on a server.
    pub fn start_job(&self, node: &str, action: JobAction) -> Result<Job> {
        let target = self.server(node)?;
        let task = action.task_name(self.plans.physical_backup_tool)?;

        let mut vars = HashMap::from([
            ("host", target.id.host().to_string()),
            ("port", target.id.port().to_string()),
            ("node", target.id.to_string()),
            ("task", task.clone()),
        ]);
        if let JobAction::Reseed(ReseedMethod::LogicalMaster) = action {
            let master = self.topology.master().ok_or_else(|| {
                FleetError::InvalidRequest(format!("cluster {} has no master", self.name))
            })?;
            vars.insert("master", master.to_string());
        }
        if let JobAction::PointInTime(request) = &action {
            vars.insert("restore_time", request.restore_time.to_string());
            vars.insert("backup", request.backup.clone().unwrap_or_default());
        }

        let steps = self.plans.steps(&task);
        info!(
            cluster = %self.name,
            node = %target.id,
            task = task,
            steps = steps.len(),
            "starting job"
        );
        target.dispatch(
            &task,
            action.reseed_method(),
            self.metrics.clone(),
            move |ctx| run_plan(ctx, steps, vars),
        )
    }

    /// Cooperatively cancels any running reseed or flashback.
    pub fn cancel_reseed(&self, node: &str) -> Result<()> {
        self.server(node)?.cancel_jobs(&RESEED_CANCEL_TASKS, false)
    }

    /// Force-cancels one job, killing its running step.
    pub fn kill_job(&self, node: &str, task: &str) -> Result<()> {
        self.server(node)?.cancel_jobs(&[task], true)
    }
}
