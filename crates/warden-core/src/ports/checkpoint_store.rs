//! CheckpointStore port - タスクごとの iteration 状態の永続化

use async_trait::async_trait;

use crate::domain::{IterationState, Result, TaskId};

/// [`IterationState`] の永続化先。実行中タスクごとに 1 レコード
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, task_id: &TaskId) -> Result<Option<IterationState>>;

    /// `state.task_id` のレコードを上書き
    async fn save(&self, state: &IterationState) -> Result<()>;

    /// レコードを削除する。存在しないレコードの削除はエラーにしない
    async fn delete(&self, task_id: &TaskId) -> Result<()>;
}
