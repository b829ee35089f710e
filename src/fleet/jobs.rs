//! Per-node registry of named asynchronous jobs.
//!
//! A job is dispatched as its own tokio task and the caller gets a snapshot
//! back immediately. The registry keeps a [`JobControl`] for every job so it
//! can be cancelled either cooperatively, at the next
//! [`JobContext::checkpoint`], or by force, which kills the external process
//! the job is currently running.

use std::{
    collections::HashMap,
    future::Future,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use data_model::{
    get_epoch_time_in_ms,
    is_restore_task,
    job_category,
    Job,
    JobBuilder,
    JobCategory,
    JobId,
    JobState,
    ReseedMethod,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    error::{FleetError, Result},
    node::Node,
};
use crate::metrics::FleetMetrics;

const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Returned by [`JobContext::checkpoint`] once cancellation was requested.
#[derive(Debug, thiserror::Error)]
#[error("job cancelled")]
pub struct JobCancelled;

#[derive(Debug, Clone, Default)]
struct JobControl {
    cancel: CancellationToken,
    kill: CancellationToken,
    forced: Arc<AtomicBool>,
    process: Arc<Mutex<Option<Child>>>,
}

impl JobControl {
    fn kill_process(&self) -> std::io::Result<()> {
        let mut process = self.process.lock().unwrap_or_else(|e| e.into_inner());
        match process.as_mut() {
            Some(child) => child.start_kill(),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct JobEntry {
    job: Job,
    control: JobControl,
    // set when this job turned maintenance on and must turn it off again
    holds_maintenance: bool,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl JobRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self, task: &str) -> Option<Job> {
        self.lock().get(task).map(|entry| entry.job.clone())
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<_> = self.lock().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.name.cmp(&b.name)));
        jobs
    }

    /// Removes a job that reached a terminal state and returns it.
    pub fn drain(&self, task: &str) -> Option<Job> {
        let mut jobs = self.lock();
        if jobs.get(task).is_some_and(|e| e.job.state.is_terminal()) {
            return jobs.remove(task).map(|e| e.job);
        }
        None
    }

    pub fn running(&self) -> usize {
        self.lock().values().filter(|e| e.job.is_running()).count()
    }

}

impl Node {
    /// Records the outcome of job `id`. Maintenance is released only if this
    /// job took it and no other restore job is still running on the node.
    fn finish_job(&self, task: &str, id: &JobId, state: JobState, message: Option<String>) {
        let mut jobs = self.jobs.lock();
        let Some(entry) = jobs.get_mut(task).filter(|e| &e.job.id == id) else {
            return;
        };
        entry.job.state = state;
        entry.job.finished_at = Some(get_epoch_time_in_ms());
        entry.job.message = message;
        entry
            .control
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let holds_maintenance = std::mem::take(&mut entry.holds_maintenance);
        let restore_running = jobs
            .values()
            .any(|e| e.job.is_running() && is_restore_task(&e.job.name));
        if holds_maintenance && !restore_running {
            debug!(node = %self.id, task = task, "releasing maintenance");
            self.set_maintenance(false);
        }
    }
}

/// Handle given to a job runner.
pub struct JobContext {
    pub node: Arc<Node>,
    pub task: String,
    pub category: JobCategory,
    control: JobControl,
}

impl JobContext {
    /// Safe stopping point: fails with [`JobCancelled`] once a cancellation
    /// was requested.
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        if self.control.cancel.is_cancelled() {
            return Err(JobCancelled.into());
        }
        Ok(())
    }

    pub fn log(&self, text: &str) {
        self.node.logs.append(self.category, &self.task, text);
    }

    /// Runs one external step of the job and waits for it. Output lines are
    /// appended to the node's job log. A forced cancel kills the process,
    /// which makes this step fail.
    pub async fn run_command(&self, mut command: Command) -> anyhow::Result<()> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| anyhow!("unable to start {:?}: {}", command.as_std().get_program(), e))?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.forward_output(stderr));
        }

        {
            let mut process = self.control.process.lock().unwrap_or_else(|e| e.into_inner());
            *process = Some(child);
        }
        // the kill may have raced the spawn
        if self.control.forced.load(Ordering::Acquire) {
            let _ = self.control.kill_process();
        }

        let status = loop {
            let exited = {
                let mut process = self.control.process.lock().unwrap_or_else(|e| e.into_inner());
                match process.as_mut() {
                    Some(child) => child.try_wait()?,
                    None => return Err(anyhow!("process handle lost")),
                }
            };
            if let Some(status) = exited {
                break status;
            }
            tokio::time::sleep(PROCESS_POLL_INTERVAL).await;
        };
        self.control
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        for reader in readers {
            let _ = reader.await;
        }

        if self.control.forced.load(Ordering::Acquire) {
            return Err(anyhow!("process terminated by forced cancel ({})", status));
        }
        if !status.success() {
            return Err(anyhow!("step exited with {}", status));
        }
        Ok(())
    }

    fn forward_output<R>(&self, output: R) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let node = self.node.clone();
        let category = self.category;
        let task = self.task.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(output).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                node.logs.append(category, &task, &line);
            }
        })
    }
}

impl Node {
    /// Starts `runner` as job `task` on this node.
    ///
    /// Fails with `DuplicateJob` when a job with the same name is running,
    /// or when `task` is a reseed/flashback and another one is running. The
    /// returned snapshot is taken right after registration; the job keeps
    /// running in the background.
    pub fn dispatch<F, Fut>(
        self: &Arc<Self>,
        task: &str,
        reseed_method: Option<ReseedMethod>,
        metrics: Arc<FleetMetrics>,
        runner: F,
    ) -> Result<Job>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let restore = is_restore_task(task);
        let control = JobControl::default();
        let job = {
            let mut jobs = self.jobs.lock();
            let conflict = jobs.values().find(|e| {
                e.job.is_running() && (e.job.name == task || (restore && is_restore_task(&e.job.name)))
            });
            if let Some(existing) = conflict {
                return Err(FleetError::DuplicateJob {
                    node: self.id.to_string(),
                    task: existing.job.name.clone(),
                });
            }
            let job = JobBuilder::default()
                .node(self.id.clone())
                .name(task)
                .category(job_category(task))
                .reseed_method(reseed_method)
                .build()
                .map_err(|e| FleetError::InvalidRequest(e.to_string()))?;
            // an operator-set maintenance flag is left to the operator
            let holds_maintenance = restore && !self.is_maintenance();
            if holds_maintenance {
                self.set_maintenance(true);
            }
            jobs.insert(
                task.to_string(),
                JobEntry {
                    job: job.clone(),
                    control: control.clone(),
                    holds_maintenance,
                },
            );
            job
        };
        info!(
            node = %self.id,
            task = task,
            job_id = %job.id,
            "job dispatched"
        );
        metrics.job_dispatched(task);

        let ctx = JobContext {
            node: self.clone(),
            task: task.to_string(),
            category: job.category,
            control: control.clone(),
        };
        let node = self.clone();
        let task = task.to_string();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let (state, message) = tokio::select! {
                res = runner(ctx) => match res {
                    Ok(()) => (JobState::Completed, None),
                    Err(err) if control.forced.load(Ordering::Acquire) => {
                        (JobState::Failed, Some(format!("{:#}", err)))
                    }
                    Err(err) if err.is::<JobCancelled>() => (JobState::Cancelled, None),
                    Err(err) => (JobState::Failed, Some(format!("{:#}", err))),
                },
                _ = control.kill.cancelled() => {
                    (JobState::Failed, Some("terminated by forced cancel".to_string()))
                }
            };
            // dropping the runner above drops its child, kill_on_drop reaps it
            let _ = control.kill_process();
            node.finish_job(&task, &job_id, state, message.clone());
            match state {
                JobState::Failed => error!(
                    node = %node.id,
                    task = task,
                    job_id = %job_id,
                    "job failed: {}",
                    message.unwrap_or_default()
                ),
                _ => info!(
                    node = %node.id,
                    task = task,
                    job_id = %job_id,
                    state = state.as_ref(),
                    "job finished"
                ),
            }
            metrics.job_finished(&task, state);
        });

        Ok(job)
    }

    /// Cancels the named jobs. Unknown or finished jobs are skipped. Every
    /// name is attempted; the first failure to kill a process is returned.
    pub fn cancel_jobs(&self, tasks: &[&str], force: bool) -> Result<()> {
        let mut first_err = None;
        let jobs = self.jobs.lock();
        for task in tasks {
            let Some(entry) = jobs.get(*task).filter(|e| e.job.is_running()) else {
                debug!(node = %self.id, task = task, "no running job to cancel");
                continue;
            };
            info!(node = %self.id, task = task, force = force, "cancelling job");
            if force {
                entry.control.forced.store(true, Ordering::Release);
                if let Err(err) = entry.control.kill_process() {
                    warn!(node = %self.id, task = task, "unable to kill job process: {:?}", err);
                    first_err.get_or_insert(FleetError::JobCancelFailed {
                        node: self.id.to_string(),
                        task: task.to_string(),
                        source: err,
                    });
                }
                entry.control.kill.cancel();
            }
            entry.control.cancel.cancel();
        }
        drop(jobs);
        // cancel_requested is only informative, update it after signalling
        let mut jobs = self.jobs.lock();
        for task in tasks {
            if let Some(entry) = jobs.get_mut(*task).filter(|e| e.job.is_running()) {
                entry.job.cancel_requested = true;
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::{
        test_objects::tests::{TEST_MASTER, TEST_SLAVE},
        NodeKind,
    };
    use tokio::sync::oneshot;

    use super::*;
    use crate::fleet::node::{NodeRegistry, NodeSecret, NodeSpec};

    fn test_node(url: &str) -> Arc<Node> {
        let spec = NodeSpec {
            url: url.to_string(),
            name: None,
            role: Default::default(),
            secret: NodeSecret::new("pw"),
        };
        NodeRegistry::default()
            .add(NodeKind::Server, &spec, None, 100)
            .unwrap()
    }

    fn metrics() -> Arc<FleetMetrics> {
        Arc::new(FleetMetrics::new())
    }

    async fn wait_terminal(node: &Node, task: &str) -> Job {
        for _ in 0..200 {
            if let Some(job) = node.jobs.status(task).filter(|j| j.state.is_terminal()) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", task);
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected_until_terminal() {
        let node = test_node(TEST_MASTER);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let job = node
            .dispatch("backup-physical", None, metrics(), |_ctx| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        assert_eq!(job.state, JobState::Running);

        let err = node
            .dispatch("backup-physical", None, metrics(), |_| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, FleetError::DuplicateJob { .. }));

        // other names run concurrently
        node.dispatch("optimize", None, metrics(), |_| async { Ok(()) })
            .unwrap();

        release_tx.send(()).unwrap();
        let done = wait_terminal(&node, "backup-physical").await;
        assert_eq!(done.state, JobState::Completed);
        assert!(done.finished_at.is_some());

        let again = node
            .dispatch("backup-physical", None, metrics(), |_| async { Ok(()) })
            .unwrap();
        assert_ne!(again.id, job.id);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_noop() {
        let node = test_node(TEST_MASTER);
        node.cancel_jobs(&["nonexistent-job"], false).unwrap();
        node.cancel_jobs(&["nonexistent-job"], true).unwrap();
    }

    #[tokio::test]
    async fn test_cooperative_cancel_releases_maintenance() {
        let node = test_node(TEST_SLAVE);
        node.dispatch(
            "reseedmariabackup",
            Some(ReseedMethod::PhysicalBackup),
            metrics(),
            |ctx| async move {
                loop {
                    ctx.checkpoint()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            },
        )
        .unwrap();
        assert!(node.is_maintenance());

        node.cancel_jobs(&data_model::RESEED_CANCEL_TASKS, false)
            .unwrap();
        let job = wait_terminal(&node, "reseedmariabackup").await;
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.cancel_requested);
        assert!(!node.is_maintenance());
    }

    #[tokio::test]
    async fn test_restore_keeps_operator_maintenance() {
        let node = test_node(TEST_SLAVE);
        node.set_maintenance(true);
        node.dispatch("reseedmysqldump", None, metrics(), |_| async { Ok(()) })
            .unwrap();
        let job = wait_terminal(&node, "reseedmysqldump").await;
        assert_eq!(job.state, JobState::Completed);
        assert!(node.is_maintenance());
    }

    #[tokio::test]
    async fn test_back_to_back_restores_keep_maintenance() {
        let node = test_node(TEST_SLAVE);
        node.dispatch("reseedmysqldump", None, metrics(), |_| async { Ok(()) })
            .unwrap();
        wait_terminal(&node, "reseedmysqldump").await;
        assert!(!node.is_maintenance());

        let (release_tx, release_rx) = oneshot::channel::<()>();
        node.dispatch("flashbackmysqldump", None, metrics(), |_| async move {
            let _ = release_rx.await;
            Ok(())
        })
        .unwrap();
        assert!(node.is_maintenance());

        // a stale finish of the first job must not release the second one's hold
        let first = node.jobs.status("reseedmysqldump").unwrap();
        node.finish_job("reseedmysqldump", &first.id, JobState::Completed, None);
        assert!(node.is_maintenance());

        release_tx.send(()).unwrap();
        wait_terminal(&node, "flashbackmysqldump").await;
        assert!(!node.is_maintenance());
    }

    /// Replaces the process handle of `task` with a child that was already
    /// reaped, so killing it fails.
    async fn park_reaped_child(node: &Node, task: &str) {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        let jobs = node.jobs.lock();
        *jobs[task].control.process.lock().unwrap() = Some(child);
    }

    #[tokio::test]
    async fn test_cancel_batch_reports_first_kill_failure() {
        let node = test_node(TEST_MASTER);
        for task in ["optimize", "backup-physical"] {
            node.dispatch(task, None, metrics(), |ctx| async move {
                loop {
                    ctx.checkpoint()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .unwrap();
            park_reaped_child(&node, task).await;
        }

        let err = node
            .cancel_jobs(&["optimize", "nonexistent-job", "backup-physical"], true)
            .unwrap_err();
        match err {
            FleetError::JobCancelFailed { task, .. } => assert_eq!(task, "optimize"),
            other => panic!("unexpected error {:?}", other),
        }

        // the failure did not stop the rest of the batch
        for task in ["optimize", "backup-physical"] {
            let job = wait_terminal(&node, task).await;
            assert_eq!(job.state, JobState::Failed);
            assert!(job.cancel_requested);
        }
    }

    #[tokio::test]
    async fn test_restore_jobs_are_exclusive() {
        let node = test_node(TEST_SLAVE);
        let (_hold_tx, hold_rx) = oneshot::channel::<()>();
        node.dispatch("reseedmysqldump", None, metrics(), |_| async move {
            let _ = hold_rx.await;
            Ok(())
        })
        .unwrap();

        let err = node
            .dispatch("flashbackmariabackup", None, metrics(), |_| async { Ok(()) })
            .unwrap_err();
        match err {
            FleetError::DuplicateJob { task, .. } => assert_eq!(task, "reseedmysqldump"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forced_cancel_fails_job() {
        let node = test_node(TEST_SLAVE);
        node.dispatch("reseedxtrabackup", None, metrics(), |ctx| async move {
            ctx.checkpoint()?;
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            ctx.run_command(cmd).await
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        node.cancel_jobs(&["reseedxtrabackup"], true).unwrap();
        let job = wait_terminal(&node, "reseedxtrabackup").await;
        assert_eq!(job.state, JobState::Failed);
        assert!(job.message.is_some());
        assert!(!node.is_maintenance());
    }

    #[tokio::test]
    async fn test_runner_error_and_drain() {
        let node = test_node(TEST_MASTER);
        node.dispatch("optimize", None, metrics(), |ctx| async move {
            ctx.log("analyzing tables");
            Err(anyhow!("table is crashed"))
        })
        .unwrap();
        let job = wait_terminal(&node, "optimize").await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.message.as_deref(), Some("table is crashed"));
        assert_eq!(node.logs.tail(JobCategory::Task, 10)[0].line, "analyzing tables");

        assert!(node.jobs.drain("optimize").is_some());
        assert!(node.jobs.status("optimize").is_none());
        assert!(node.jobs.drain("optimize").is_none());
    }

    #[tokio::test]
    async fn test_command_output_is_logged() {
        let node = test_node(TEST_MASTER);
        node.dispatch("mariabackup", None, metrics(), |ctx| async move {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("echo streaming; echo done");
            ctx.run_command(cmd).await
        })
        .unwrap();
        let job = wait_terminal(&node, "mariabackup").await;
        assert_eq!(job.state, JobState::Completed);
        let lines: Vec<_> = node
            .logs
            .tail(JobCategory::BackupStream, 10)
            .into_iter()
            .map(|l| l.line)
            .collect();
        assert_eq!(lines, vec!["streaming", "done"]);
    }
}
