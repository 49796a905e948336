//! WorkerPool - 1 つの wave を並行数を制限して実行する
//!
//! - `Semaphore` で同時実行 worker 数を `max_parallel` に制限
//! - 結果は `JoinSet` で集める。panic した worker は wave を壊さず、
//!   そのタスクの BLOCKED として報告する
//! - token がキャンセルされた時点で未開始の worker は実行せずに
//!   ABORTED として報告する

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::domain::{Task, TaskId, TaskStatus, TerminalResult};

#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_parallel: usize,
}

impl WorkerPool {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// wave の全タスクに `work` を実行し、すべて終わるまで待つ
    ///
    /// 結果は入力順で返す
    pub async fn run_wave<F, Fut>(
        &self,
        tasks: Vec<Task>,
        cancel: &CancellationToken,
        work: F,
    ) -> Vec<TerminalResult>
    where
        F: Fn(Task) -> Fut,
        Fut: Future<Output = TerminalResult> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut set = JoinSet::new();
        let mut owners = HashMap::new();
        let order: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();

        for task in tasks {
            let task_id = task.id.clone();
            let fut = work(task);
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let spawned_id = task_id.clone();

            let handle = set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return TerminalResult::new(spawned_id, TaskStatus::Aborted, 0)
                        .with_reason("cancelled before start");
                };
                fut.await
            });
            owners.insert(handle.id(), task_id);
        }

        let mut results: HashMap<TaskId, TerminalResult> = HashMap::new();
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, result)) => {
                    results.insert(result.task_id.clone(), result);
                }
                Err(e) => {
                    let Some(task_id) = owners.get(&e.id()).cloned() else {
                        tracing::error!(error = %e, "unknown worker failed");
                        continue;
                    };
                    tracing::error!(task_id = %task_id, error = %e, "worker panicked");
                    let reason = if e.is_panic() {
                        "worker panicked"
                    } else {
                        "worker cancelled"
                    };
                    results.insert(
                        task_id.clone(),
                        TerminalResult::new(task_id, TaskStatus::Blocked, 0).with_reason(reason),
                    );
                }
            }
        }

        order
            .into_iter()
            .filter_map(|id| results.remove(&id))
            .collect()
    }
}
