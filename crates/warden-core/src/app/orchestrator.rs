//! Orchestrator - タスク集合を wave ごとに実行する
//!
//! # フロー（ラウンドごと）
//! 1. まだ pending のタスクで wave を計画する。終わったタスクは満たされた
//!    依存として数える
//! 2. 最初の wave だけを [`WorkerPool`] で実行
//! 3. 各 worker は登録し、タスクのファイルの排他ロックを取り、
//!    [`IterationLoop`] の実行中は heartbeat を送り、成功したら commit を
//!    投入して登録を解除する
//! 4. ロックを取れなかった worker はタスクを差し戻す。次のラウンドで
//!    最大 `schedule.max_deferrals` 回までリトライする
//!
//! wave ごとに計画し直すので、BLOCKED や ABORTED のタスクに依存するタスクは
//! 未完了の作業の上で実行されずに脱落する

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::iteration_loop::IterationLoop;
use super::reaper_loop::ReaperLoop;
use super::status::{RunReport, Unscheduled};
use crate::config::WardenConfig;
use crate::domain::{Result, Task, TaskId, TaskStatus, TerminalResult, WorkerId};
use crate::locks::{FileLockRegistry, LockMode};
use crate::ports::{CommitPayload, Finalizer, IdGenerator};
use crate::queue::CommitQueue;
use crate::schedule::{DependencyGraph, WorkerPool, plan_waves_with_completed};

/// worker がロックを解放する前に commit を待つ時間
const COMMIT_WAIT: Duration = Duration::from_secs(60);

pub struct Orchestrator {
    config: WardenConfig,
    iteration: Arc<IterationLoop>,
    locks: Arc<FileLockRegistry>,
    finalizer: Arc<dyn Finalizer>,
    ids: Arc<dyn IdGenerator>,
    pool: WorkerPool,
}

impl Orchestrator {
    pub(crate) fn new(
        config: WardenConfig,
        iteration: IterationLoop,
        locks: FileLockRegistry,
        finalizer: Arc<dyn Finalizer>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let pool = WorkerPool::new(config.schedule.max_parallel);
        Self {
            config,
            iteration: Arc::new(iteration),
            locks: Arc::new(locks),
            finalizer,
            ids,
            pool,
        }
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.iteration.config().session_id
    }

    pub fn locks(&self) -> &Arc<FileLockRegistry> {
        &self.locks
    }

    pub fn iteration_loop(&self) -> &IterationLoop {
        &self.iteration
    }

    /// 全タスクを終端状態まで（または `cancel` が発火するまで）実行する
    pub async fn run(&self, tasks: Vec<Task>, cancel: CancellationToken) -> Result<RunReport> {
        let commits = Arc::new(CommitQueue::start(self.finalizer.clone(), self.ids.clone()));
        let reaper_cancel = cancel.child_token();
        let reaper = ReaperLoop::new(
            self.locks.clone(),
            self.config.locks.heartbeat_timeout(),
            self.config.locks.sweep_interval(),
        )
        .spawn(reaper_cancel.clone());

        let order: HashMap<TaskId, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let mut pending = tasks;
        let mut satisfied: HashSet<TaskId> = HashSet::new();
        let mut finished: HashMap<TaskId, TaskStatus> = HashMap::new();
        let mut deferrals: HashMap<TaskId, u32> = HashMap::new();
        let mut results = Vec::new();
        let mut waves = 0;

        tracing::info!(session = %self.session_id(), tasks = pending.len(), "run started");

        while !pending.is_empty() && !cancel.is_cancelled() {
            let plan = plan_waves_with_completed(&pending, &satisfied, self.pool.max_parallel());
            let Some(first) = plan.first_wave() else {
                break;
            };
            let chosen: HashSet<&TaskId> = first.iter().collect();
            let (wave, rest): (Vec<Task>, Vec<Task>) =
                pending.into_iter().partition(|t| chosen.contains(&t.id));
            pending = rest;
            waves += 1;
            tracing::info!(wave = waves, tasks = wave.len(), waiting = pending.len(), "wave started");

            let mut by_id: HashMap<TaskId, Task> =
                wave.iter().map(|t| (t.id.clone(), t.clone())).collect();
            let worker = WaveWorker {
                iteration: self.iteration.clone(),
                locks: self.locks.clone(),
                commits: commits.clone(),
                ids: self.ids.clone(),
                heartbeat_every: (self.config.locks.heartbeat_timeout() / 3)
                    .max(Duration::from_millis(10)),
                cancel: cancel.clone(),
            };
            let outcomes = self
                .pool
                .run_wave(wave, &cancel, |task| worker.clone().run(task))
                .await;

            let mut progressed = false;
            let mut longest_wait = 0;
            for result in outcomes {
                if result.status == TaskStatus::Pending {
                    let count = deferrals.entry(result.task_id.clone()).or_default();
                    *count += 1;
                    longest_wait = longest_wait.max(*count);
                    if *count > self.config.schedule.max_deferrals {
                        tracing::warn!(task_id = %result.task_id, deferrals = *count, "giving up on file locks");
                        let blocked = TerminalResult::new(result.task_id, TaskStatus::Blocked, 0)
                            .with_reason(format!("file locks unavailable after {count} attempts"));
                        finished.insert(blocked.task_id.clone(), blocked.status);
                        results.push(blocked);
                        progressed = true;
                    } else if let Some(task) = by_id.remove(&result.task_id) {
                        pending.push(task);
                    }
                    continue;
                }

                progressed = true;
                if result.status.satisfies_dependents() {
                    satisfied.insert(result.task_id.clone());
                }
                finished.insert(result.task_id.clone(), result.status);
                results.push(result);
            }
            pending.sort_by_key(|t| order.get(&t.id).copied().unwrap_or(usize::MAX));

            if !progressed {
                let delay = self.config.iteration.backoff.next_delay(longest_wait);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let unscheduled = if cancel.is_cancelled() {
            for task in pending.drain(..) {
                results.push(
                    TerminalResult::new(task.id, TaskStatus::Aborted, 0)
                        .with_reason("cancelled before start"),
                );
            }
            Vec::new()
        } else {
            explain_unscheduled(&pending, &order, &finished)
        };
        for entry in &unscheduled {
            tracing::warn!(task_id = %entry.task_id, reason = %entry.reason, "task not scheduled");
        }

        reaper_cancel.cancel();
        let swept_workers = match reaper.await {
            Ok(swept) => swept,
            Err(e) => {
                tracing::error!(error = %e, "reaper task failed");
                0
            }
        };
        let applied = commits.shutdown().await?;
        let commits: BTreeMap<TaskId, _> = commits.outcomes().into_iter().collect();

        let ctx = self.iteration.context();
        if let Err(e) = ctx.resources.flush().await {
            tracing::warn!(error = %e, "failed to flush resource usage");
        }
        let report = RunReport {
            session_id: self.session_id().to_string(),
            waves,
            results,
            unscheduled,
            commits,
            swept_workers,
            breakers: ctx.breakers.states(),
            usage: ctx.resources.usage(),
        };
        let counts = report.counts();
        tracing::info!(
            session = %report.session_id,
            waves,
            commits = applied,
            completed = counts.completed,
            blocked = counts.blocked,
            aborted = counts.aborted,
            unscheduled = counts.unscheduled,
            "run finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session_id", &self.session_id())
            .field("max_parallel", &self.pool.max_parallel())
            .finish_non_exhaustive()
    }
}

fn explain_unscheduled(
    pending: &[Task],
    order: &HashMap<TaskId, usize>,
    finished: &HashMap<TaskId, TaskStatus>,
) -> Vec<Unscheduled> {
    let cycle = DependencyGraph::from_tasks(pending).cycle_members();
    if !cycle.is_empty() {
        tracing::warn!(tasks = ?cycle, "dependency cycle detected");
    }

    pending
        .iter()
        .map(|task| {
            let reason = if cycle.contains(&task.id) {
                "dependency cycle".to_string()
            } else {
                task.depends_on
                    .iter()
                    .find_map(|dep| match finished.get(dep) {
                        Some(status) if !status.satisfies_dependents() => {
                            Some(format!("dependency {dep} ended {status:?}"))
                        }
                        Some(_) => None,
                        None if !order.contains_key(dep) => Some(format!("unknown dependency {dep}")),
                        None => Some(format!("dependency {dep} was not scheduled")),
                    })
                    .unwrap_or_else(|| "not schedulable".to_string())
            };
            Unscheduled {
                task_id: task.id.clone(),
                reason,
            }
        })
        .collect()
}

/// pool の worker 1 つに必要なもの。タスクごとに clone する
#[derive(Clone)]
struct WaveWorker {
    iteration: Arc<IterationLoop>,
    locks: Arc<FileLockRegistry>,
    commits: Arc<CommitQueue>,
    ids: Arc<dyn IdGenerator>,
    heartbeat_every: Duration,
    cancel: CancellationToken,
}

impl WaveWorker {
    async fn run(self, mut task: Task) -> TerminalResult {
        let worker = self.ids.generate_worker_id();
        self.locks.register(worker, &task.id, task.repo.clone());

        if !self
            .locks
            .acquire_all(worker, &task.id, &task.files, LockMode::Exclusive)
        {
            self.locks.unregister(worker);
            tracing::info!(task_id = %task.id, %worker, "file locks busy, task handed back");
            return TerminalResult::new(task.id, TaskStatus::Pending, 0)
                .with_reason("file locks busy");
        }

        task.transition_to(TaskStatus::InProgress);
        let heartbeat = self.spawn_heartbeat(worker).drop_guard();
        let result = self.iteration.run(&task, Some(worker), &self.cancel).await;
        drop(heartbeat);

        if result.status.satisfies_dependents() {
            self.commit(&task, &result).await;
        }
        task.transition_to(result.status);
        self.locks.unregister(worker);
        result
    }

    fn spawn_heartbeat(&self, worker: WorkerId) -> CancellationToken {
        let stop = self.cancel.child_token();
        let token = stop.clone();
        let locks = self.locks.clone();
        let every = self.heartbeat_every;
        locks.heartbeat(worker);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !locks.heartbeat(worker) {
                            tracing::warn!(%worker, "worker was swept; heartbeat stopped");
                            break;
                        }
                    }
                }
            }
        });
        stop
    }

    async fn commit(&self, task: &Task, result: &TerminalResult) {
        let changed_files = if result.reverted {
            Vec::new()
        } else {
            result.changed_files.clone()
        };
        let payload = CommitPayload {
            status: result.status,
            changed_files,
            message: format!("{}: {}", task.id, task.description),
        };

        match self.commits.submit(task.id.clone(), payload) {
            Ok(ticket) => {
                if !self.commits.wait_for(&task.id, COMMIT_WAIT).await {
                    tracing::warn!(task_id = %task.id, index = ticket.index, "commit not applied in time");
                }
            }
            Err(e) => tracing::warn!(task_id = %task.id, error = %e, "commit submit failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::OrchestratorBuilder;
    use crate::domain::{Verdict, WardenError};
    use crate::ports::{AgentInvoker, AgentOutput, AgentRequest, CommitOutcome, KillSwitchMode};
    use crate::impls::AtomicKillSwitch;
    use crate::queue::RetryPolicy;
    use crate::testing::{RecordingFinalizer, ScriptedVerifier};
    use async_trait::async_trait;

    /// 最初の iteration で全タスクを完了させる。ただし `stuck` で始まる ID は
    /// 進捗しない
    struct PerTaskAgent;

    #[async_trait]
    impl AgentInvoker for PerTaskAgent {
        fn name(&self) -> &str {
            "per-task"
        }

        async fn invoke(&self, request: &AgentRequest) -> crate::domain::Result<AgentOutput> {
            if request.task_id.as_str().starts_with("stuck") {
                return Ok(AgentOutput::new("still thinking"));
            }
            if request.task_id.as_str().starts_with("crash") {
                return Err(WardenError::Agent("adapter crashed".into()));
            }
            Ok(AgentOutput::new(format!("<promise>{}</promise>", request.completion_token))
                .with_files([format!("src/{}.rs", request.task_id)]))
        }
    }

    fn config() -> WardenConfig {
        let mut cfg = WardenConfig::default();
        cfg.iteration.backoff = RetryPolicy::immediate();
        cfg.schedule.max_parallel = 2;
        cfg
    }

    fn build(cfg: WardenConfig, finalizer: Arc<RecordingFinalizer>) -> Orchestrator {
        OrchestratorBuilder::new(cfg)
            .in_memory()
            .agent(Arc::new(PerTaskAgent))
            .verifier(Arc::new(ScriptedVerifier::new(vec![Verdict::pass()])))
            .finalizer(finalizer)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn runs_waves_and_commits_in_order() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let orch = build(config(), finalizer.clone());
        let tasks = vec![
            Task::new("a", "first").with_file("x"),
            Task::new("b", "after a").with_file("y").with_dependency("a"),
            Task::new("c", "same file as a").with_file("x"),
        ];

        let report = orch.run(tasks, CancellationToken::new()).await.unwrap();

        assert_eq!(report.waves, 2);
        assert!(report.all_succeeded());
        assert_eq!(report.counts().completed, 3);
        let applied: Vec<String> = finalizer
            .applied()
            .await
            .iter()
            .map(|r| r.task_id.to_string())
            .collect();
        assert_eq!(applied[0], "a");
        assert_eq!(applied.len(), 3);
        assert_eq!(report.commits.get(&TaskId::new("b")), Some(&CommitOutcome::Applied));
        // worker はいなくなり、全ロックが解放されている
        assert_eq!(orch.locks().worker_count(), 0);
        assert!(!orch.locks().is_locked("x"));
    }

    #[tokio::test]
    async fn dependents_of_blocked_tasks_are_unscheduled() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let mut cfg = config();
        cfg.iteration.max_iterations = 2;
        let orch = build(cfg.clone(), finalizer.clone());
        let tasks = vec![
            cfg.task("stuck-1", "never finishes"),
            cfg.task("child", "needs stuck-1").with_dependency("stuck-1"),
            cfg.task("loop-a", "").with_dependency("loop-b"),
            cfg.task("loop-b", "").with_dependency("loop-a"),
            cfg.task("orphan", "").with_dependency("ghost"),
        ];

        let report = orch.run(tasks, CancellationToken::new()).await.unwrap();

        let stuck = report.result(&TaskId::new("stuck-1")).unwrap();
        assert_eq!(stuck.status, TaskStatus::Blocked);
        assert_eq!(stuck.iterations, 2);
        assert!(finalizer.applied().await.is_empty());

        let reasons: HashMap<&str, &str> = report
            .unscheduled
            .iter()
            .map(|u| (u.task_id.as_str(), u.reason.as_str()))
            .collect();
        assert_eq!(reasons["loop-a"], "dependency cycle");
        assert_eq!(reasons["loop-b"], "dependency cycle");
        assert!(reasons["child"].contains("Blocked"));
        assert_eq!(reasons["orphan"], "unknown dependency ghost");
    }

    #[tokio::test]
    async fn busy_locks_defer_then_block() {
        let orch = build(config(), Arc::new(RecordingFinalizer::default()));
        let outsider = WorkerId::from_ulid(ulid::Ulid::new());
        let other_task = TaskId::new("outside");
        orch.locks().register(outsider, &other_task, None);
        assert!(orch.locks().acquire(outsider, &other_task, "shared.rs", LockMode::Exclusive));

        let tasks = vec![Task::new("wants-lock", "").with_file("shared.rs"), Task::new("free", "").with_file("other.rs")];
        let report = orch.run(tasks, CancellationToken::new()).await.unwrap();

        let blocked = report.result(&TaskId::new("wants-lock")).unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert!(blocked.reason.as_deref().unwrap().contains("file locks unavailable"));
        assert_eq!(
            report.result(&TaskId::new("free")).unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(report.waves, 1 + orch.config().schedule.max_deferrals as usize);
    }

    #[tokio::test]
    async fn cancelled_run_aborts_everything() {
        let orch = build(config(), Arc::new(RecordingFinalizer::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orch
            .run(vec![Task::new("a", ""), Task::new("b", "")], cancel)
            .await
            .unwrap();
        assert_eq!(report.waves, 0);
        assert_eq!(report.counts().aborted, 2);
    }

    #[tokio::test]
    async fn kill_switch_aborts_running_loops() {
        let switch = AtomicKillSwitch::new(KillSwitchMode::Off);
        let orch = OrchestratorBuilder::new(config())
            .in_memory()
            .agent(Arc::new(PerTaskAgent))
            .verifier(Arc::new(ScriptedVerifier::passing()))
            .kill_switch(Arc::new(switch))
            .build()
            .unwrap();

        let report = orch
            .run(vec![Task::new("a", "").with_file("a")], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.results[0].status, TaskStatus::Aborted);
        assert!(report.commits.is_empty());
    }

    #[tokio::test]
    async fn agent_failures_trip_the_breaker_for_later_tasks() {
        let mut cfg = config();
        cfg.breaker.failure_threshold = 2;
        cfg.iteration.max_iterations = 2;
        cfg.schedule.max_parallel = 1;
        let orch = build(cfg.clone(), Arc::new(RecordingFinalizer::default()));
        let tasks = vec![cfg.task("crash-1", "").with_file("a"), cfg.task("crash-2", "").with_file("b")];

        let report = orch.run(tasks, CancellationToken::new()).await.unwrap();

        let second = report.result(&TaskId::new("crash-2")).unwrap();
        assert_eq!(second.status, TaskStatus::Blocked);
        assert_eq!(second.iterations, 0);
        assert!(second.reason.as_deref().unwrap().contains("circuit breaker open"));
        assert!(report.breakers.iter().any(|b| b.key == "per-task@default"));
    }
}
