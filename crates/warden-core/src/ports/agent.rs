//! AgentInvoker port - 実作業を行う外部エージェント

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Result, TaskId};

/// エージェントの 1 回の呼び出し
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub description: String,
    pub iteration: u32,
    pub max_iterations: u32,
    /// 完了時に `<promise>..</promise>` で囲むべきトークン
    pub completion_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

/// エージェントの出力
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub output: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl AgentOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            changed_files: Vec::new(),
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_files.extend(files.into_iter().map(Into::into));
        self
    }
}

/// 実作業を行うエージェント
///
/// エラーは iteration loop で失敗した試行として扱う。各呼び出しには
/// loop 側でタイムアウトをかける
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// breaker のキー（"<name>@<repo>"）に使う名前
    fn name(&self) -> &str;

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput>;
}
