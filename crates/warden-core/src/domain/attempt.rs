//! AuditEntry - stop hook 判断の監査ログ

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::StopDecision;
use super::task::TaskId;
use super::verdict::VerdictKind;

/// stop hook が下した 1 回分の判断
///
/// 記録する内容:
/// - 何 iteration 目か
/// - oracle の判定（問い合わせた場合）
/// - エージェントが触ったファイル
/// - 何をなぜ決めたか
///
/// 追記のみ。タスクの「なぜそうなったか」を説明する記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub task_id: TaskId,
    pub iteration: u32,
    /// ALLOW / BLOCK / ASK_HUMAN / ABORTED
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<VerdictKind>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        task_id: TaskId,
        iteration: u32,
        decision: &StopDecision,
        verdict: Option<VerdictKind>,
        changed_files: Vec<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let reason = match decision {
            StopDecision::Allow { reverted: true } => Some("guardrail violation reverted".to_string()),
            other => other.reason().map(str::to_string),
        };
        Self {
            task_id,
            iteration,
            decision: decision.label().to_string(),
            verdict,
            changed_files,
            reason,
            recorded_at,
        }
    }
}
