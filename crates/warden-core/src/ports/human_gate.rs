//! HumanGate port - ASK_HUMAN 時の対話的な判断

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::TaskId;

/// ループが人間に問い合わせる理由
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalContext {
    pub task_id: TaskId,
    pub iteration: u32,
    pub max_iterations: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanDecision {
    /// `extend_by` だけ iteration を追加して続行
    Approve { extend_by: u32 },
    /// ここで停止。チェックポイントは破棄する
    Abort,
    /// 後回し。チェックポイントは残す
    Defer,
}

#[async_trait]
pub trait HumanGate: Send + Sync {
    async fn decide(&self, context: &TerminalContext) -> HumanDecision;
}
