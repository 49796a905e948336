//! State - タスクごとのループのチェックポイントと最終結果

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkerId;
use super::task::{Task, TaskId, TaskStatus};
use super::verdict::Verdict;

/// 実行中の iteration loop のチェックポイント
///
/// 実行中のタスクごとに 1 レコードだけ存在する。iteration ごとに上書きし、
/// ALLOW / ABORTED で削除、ASK_HUMAN では残すので、次回の実行は 0 ではなく
/// `iteration` から再開する
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationState {
    pub task_id: TaskId,
    pub iteration: u32,
    pub max_iterations: u32,
    pub completion_token: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
}

impl IterationState {
    pub fn fresh(task: &Task, worker: Option<WorkerId>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            iteration: 0,
            max_iterations: task.max_iterations,
            completion_token: task.completion_token.clone(),
            started_at: now,
            worker,
        }
    }

    pub fn budget_left(&self) -> u32 {
        self.max_iterations.saturating_sub(self.iteration)
    }
}

/// 1 つの iteration loop の最終結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub reverted: bool,
    /// 全 iteration で触ったファイル（commit リクエスト用）
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl TerminalResult {
    pub fn new(task_id: TaskId, status: TaskStatus, iterations: u32) -> Self {
        Self {
            task_id,
            status,
            iterations,
            verdict: None,
            reason: None,
            reverted: false,
            changed_files: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_verdict(mut self, verdict: Option<Verdict>) -> Self {
        self.verdict = verdict;
        self
    }
}
