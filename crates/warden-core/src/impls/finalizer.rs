//! NoopFinalizer - 何もせずに commit リクエストを受け入れる

use async_trait::async_trait;

use crate::domain::Result;
use crate::ports::{CommitOutcome, CommitRequest, Finalizer};

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFinalizer;

#[async_trait]
impl Finalizer for NoopFinalizer {
    async fn apply(&self, request: &CommitRequest) -> Result<CommitOutcome> {
        tracing::debug!(task_id = %request.task_id, index = request.index, "noop finalize");
        Ok(CommitOutcome::NothingToApply)
    }
}
