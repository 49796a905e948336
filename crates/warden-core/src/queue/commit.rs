//! CommitQueue - finalize 操作の直列化
//!
//! 多数の worker が並行に完了しますが、永続ストアへの書き込み手は 1 つです。
//! worker は `submit`（ブロックしない）し、単一の consumer タスクが
//! [`Finalizer`] を通して到着順にリクエストを適用します。
//!
//! # 設計
//! - 到着インデックスの採番とチャネル送信は同じ mutex の下で行うので、
//!   インデックス順 = チャネル順
//! - 結果は `watch` のマップで公開する。`wait_for` は適用前に呼んでも
//!   適用後に呼んでも動く
//! - finalize の失敗はログと結果で報告し、タスク状態は巻き戻さない

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::{CommitId, Result, TaskId, WardenError};
use crate::ports::{CommitOutcome, CommitPayload, CommitRequest, Finalizer, IdGenerator};

/// 投入したリクエストの受領証
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitTicket {
    pub id: CommitId,
    pub task_id: TaskId,
    pub index: u64,
}

struct Sender {
    tx: mpsc::UnboundedSender<CommitRequest>,
    next_index: u64,
}

/// タスクごとの最新の適用結果と、その適用インデックス
type Applied = HashMap<TaskId, (u64, CommitOutcome)>;

pub struct CommitQueue {
    sender: Mutex<Option<Sender>>,
    /// タスクごとに最後に投入したインデックス
    submitted: Mutex<HashMap<TaskId, u64>>,
    outcomes: watch::Receiver<Applied>,
    consumer: Mutex<Option<JoinHandle<u64>>>,
    ids: Arc<dyn IdGenerator>,
}

impl CommitQueue {
    /// 現在の tokio ランタイム上で consumer を起動
    pub fn start(finalizer: Arc<dyn Finalizer>, ids: Arc<dyn IdGenerator>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(HashMap::new());
        let consumer = tokio::spawn(consume(rx, finalizer, outcome_tx));

        Self {
            sender: Mutex::new(Some(Sender { tx, next_index: 0 })),
            submitted: Mutex::new(HashMap::new()),
            outcomes: outcome_rx,
            consumer: Mutex::new(Some(consumer)),
            ids,
        }
    }

    pub fn submit(&self, task_id: TaskId, payload: CommitPayload) -> Result<CommitTicket> {
        let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_mut() else {
            return Err(WardenError::Commit("commit queue is shut down".into()));
        };

        let request = CommitRequest {
            id: self.ids.generate_commit_id(),
            task_id,
            index: sender.next_index,
            payload,
        };
        let ticket = CommitTicket {
            id: request.id,
            task_id: request.task_id.clone(),
            index: request.index,
        };
        sender
            .tx
            .send(request)
            .map_err(|_| WardenError::Commit("commit consumer has stopped".into()))?;
        sender.next_index += 1;
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ticket.task_id.clone(), ticket.index);

        tracing::debug!(task_id = %ticket.task_id, index = ticket.index, "commit submitted");
        Ok(ticket)
    }

    /// `task_id` について最後に投入したリクエストが適用されるまで待つ
    ///
    /// それより前のリクエストの結果だけでは戻らない。タイムアウト、
    /// 一度も投入されていない、または適用前に queue が停止した場合は `false`
    pub async fn wait_for(&self, task_id: &TaskId, timeout: Duration) -> bool {
        let target = self
            .submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .copied();
        let Some(target) = target else {
            return false;
        };

        let applied = |map: &Applied| map.get(task_id).is_some_and(|(index, _)| *index >= target);
        let mut rx = self.outcomes.clone();
        let waited = tokio::time::timeout(timeout, async move {
            loop {
                if applied(&rx.borrow_and_update()) {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return applied(&rx.borrow());
                }
            }
        })
        .await;
        waited.unwrap_or(false)
    }

    /// `task_id` の最新の適用結果
    pub fn outcome(&self, task_id: &TaskId) -> Option<CommitOutcome> {
        self.outcomes
            .borrow()
            .get(task_id)
            .map(|(_, outcome)| outcome.clone())
    }

    pub fn outcomes(&self) -> HashMap<TaskId, CommitOutcome> {
        self.outcomes
            .borrow()
            .iter()
            .map(|(id, (_, outcome))| (id.clone(), outcome.clone()))
            .collect()
    }

    /// 受付を止め、投入済みを処理し終えるまで consumer を待つ
    ///
    /// 処理したリクエスト数を返す
    pub async fn shutdown(&self) -> Result<u64> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| WardenError::Commit(format!("commit consumer failed: {e}"))),
            None => Ok(0),
        }
    }
}

impl std::fmt::Debug for CommitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitQueue").finish_non_exhaustive()
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<CommitRequest>,
    finalizer: Arc<dyn Finalizer>,
    outcomes: watch::Sender<Applied>,
) -> u64 {
    let mut expected: u64 = 0;

    while let Some(request) = rx.recv().await {
        if request.index != expected {
            tracing::error!(
                expected,
                got = request.index,
                "commit request out of order"
            );
        }
        expected = request.index + 1;

        let outcome = match finalizer.apply(&request).await {
            Ok(outcome) => outcome,
            Err(e) => CommitOutcome::Failed(e.to_string()),
        };
        match &outcome {
            CommitOutcome::Failed(reason) => tracing::warn!(
                task_id = %request.task_id,
                index = request.index,
                reason = %reason,
                "commit failed; task status kept"
            ),
            other => tracing::info!(
                task_id = %request.task_id,
                index = request.index,
                outcome = ?other,
                "commit applied"
            ),
        }

        outcomes.send_modify(|map| {
            map.insert(request.task_id.clone(), (request.index, outcome));
        });
    }

    tracing::debug!(processed = expected, "commit consumer drained");
    expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::ports::{SystemClock, UlidGenerator};
    use crate::testing::RecordingFinalizer;

    fn payload(files: &[&str]) -> CommitPayload {
        CommitPayload {
            status: TaskStatus::Completed,
            changed_files: files.iter().map(|f| f.to_string()).collect(),
            message: "done".into(),
        }
    }

    fn ids() -> Arc<dyn IdGenerator> {
        Arc::new(UlidGenerator::new(SystemClock))
    }

    #[tokio::test]
    async fn five_concurrent_submits_apply_in_submission_order() {
        let finalizer = Arc::new(RecordingFinalizer::with_delay(Duration::from_millis(5)));
        let queue = Arc::new(CommitQueue::start(finalizer.clone(), ids()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.submit(TaskId::new(format!("t{i}")), payload(&["f"])).unwrap()
            }));
        }
        let mut tickets = Vec::new();
        for h in handles {
            tickets.push(h.await.unwrap());
        }
        tickets.sort_by_key(|t| t.index);

        for t in &tickets {
            assert!(queue.wait_for(&t.task_id, Duration::from_secs(5)).await);
        }

        let applied = finalizer.applied().await;
        assert_eq!(applied.len(), 5);
        let submitted: Vec<TaskId> = tickets.iter().map(|t| t.task_id.clone()).collect();
        let indices: Vec<u64> = applied.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(
            applied.iter().map(|r| r.task_id.clone()).collect::<Vec<_>>(),
            submitted
        );
    }

    #[tokio::test]
    async fn wait_for_after_completion_and_nothing_to_apply() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let queue = CommitQueue::start(finalizer, ids());

        queue.submit(TaskId::new("empty"), payload(&[])).unwrap();
        assert_eq!(queue.shutdown().await.unwrap(), 1);

        assert!(queue.wait_for(&TaskId::new("empty"), Duration::from_millis(10)).await);
        assert_eq!(
            queue.outcome(&TaskId::new("empty")),
            Some(CommitOutcome::NothingToApply)
        );
        assert!(!queue.wait_for(&TaskId::new("never"), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_for_ignores_outcomes_of_earlier_requests() {
        let finalizer = Arc::new(RecordingFinalizer::with_delay(Duration::from_millis(50)));
        let queue = CommitQueue::start(finalizer.clone(), ids());
        let id = TaskId::new("t");

        queue.submit(id.clone(), payload(&[])).unwrap();
        assert!(queue.wait_for(&id, Duration::from_secs(5)).await);

        let second = queue.submit(id.clone(), payload(&["a"])).unwrap();
        assert_eq!(queue.outcome(&id), Some(CommitOutcome::NothingToApply));
        assert!(!queue.wait_for(&id, Duration::from_millis(5)).await);

        assert!(queue.wait_for(&id, Duration::from_secs(5)).await);
        let applied = finalizer.applied().await;
        assert_eq!(applied.last().map(|r| r.index), Some(second.index));
    }

    #[tokio::test]
    async fn failures_are_reported_not_raised() {
        let finalizer = Arc::new(RecordingFinalizer::failing("disk full"));
        let queue = CommitQueue::start(finalizer, ids());
        queue.submit(TaskId::new("t"), payload(&["a"])).unwrap();
        queue.shutdown().await.unwrap();

        match queue.outcome(&TaskId::new("t")) {
            Some(CommitOutcome::Failed(reason)) => assert!(reason.contains("disk full")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_after_shutdown_errors() {
        let queue = CommitQueue::start(Arc::new(RecordingFinalizer::default()), ids());
        queue.shutdown().await.unwrap();
        assert!(queue.submit(TaskId::new("late"), payload(&["a"])).is_err());
        assert_eq!(queue.shutdown().await.unwrap(), 0);
    }
}
