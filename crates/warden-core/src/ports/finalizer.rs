//! Finalizer port - commit queue が適用する単一書き込みの操作

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CommitId, Result, TaskId, TaskStatus};

/// 1 タスク分の finalize 内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitPayload {
    pub status: TaskStatus,
    #[serde(default)]
    pub changed_files: Vec<String>,
    pub message: String,
}

/// 到着順を刻印した payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub id: CommitId,
    pub task_id: TaskId,
    /// 投入順の位置（0 始まり）
    pub index: u64,
    pub payload: CommitPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitOutcome {
    Applied,
    /// 変更なし。成功として扱う
    NothingToApply,
    Failed(String),
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CommitOutcome::Failed(_))
    }
}

/// 1 つの commit リクエストをひとまとまりで適用する
///
/// commit queue の consumer からのみ、1 件ずつ呼ばれる
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn apply(&self, request: &CommitRequest) -> Result<CommitOutcome>;
}
