//! インメモリのチェックポイントストアと監査シンク
//!
//! # 注意
//! - port のメソッドはどのみち async なので tokio Mutex を使う
//! - テストやクラッシュリカバリ不要な実行向け

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{AuditEntry, IterationState, Result, TaskId};
use crate::ports::{AuditSink, CheckpointStore};

/// HashMap で持つチェックポイント
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    states: Arc<Mutex<HashMap<TaskId, IterationState>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.lock().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, task_id: &TaskId) -> Result<Option<IterationState>> {
        Ok(self.states.lock().await.get(task_id).cloned())
    }

    async fn save(&self, state: &IterationState) -> Result<()> {
        self.states
            .lock()
            .await
            .insert(state.task_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, task_id: &TaskId) -> Result<()> {
        self.states.lock().await.remove(task_id);
        Ok(())
    }
}

/// 追記順の Vec で持つ監査ログ
#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn entries_for(&self, task_id: &TaskId) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| &e.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}
