//! Verifier port - 外部の検証 oracle と変更の revert

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Result, TaskId, Verdict};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub project: String,
    pub task_id: TaskId,
    pub changed_files: Vec<String>,
    pub session_id: String,
    /// oracle が比較に使うベースライン（commit、スナップショットなど）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
}

/// 検証 oracle
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, request: &VerifyRequest) -> Result<Verdict>;
}

/// auto-revert ポリシーで guardrail 違反の後にファイルを巻き戻す
#[async_trait]
pub trait Reverter: Send + Sync {
    async fn revert(&self, task_id: &TaskId, files: &[String]) -> Result<()>;
}
