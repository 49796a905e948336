//! 追記専用の JSON-lines ファイル - commit ジャーナルと監査ログ

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::json::append_json_line;
use crate::domain::{AuditEntry, Result, TaskId, TaskStatus, WardenError};
use crate::ports::{AuditSink, CommitOutcome, CommitRequest, Finalizer};

/// ジャーナルに書く、適用済みの commit 1 件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub index: u64,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub changed_files: Vec<String>,
    pub message: String,
    pub applied_at: DateTime<Utc>,
}

/// リクエストごとに `<path>` へ JSON 1 行を追記する Finalizer
///
/// 変更ファイルのないリクエストは適用なしとして報告し、書き込まない
#[derive(Debug, Clone)]
pub struct JournalFinalizer {
    path: PathBuf,
}

impl JournalFinalizer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Finalizer for JournalFinalizer {
    async fn apply(&self, request: &CommitRequest) -> Result<CommitOutcome> {
        if request.payload.changed_files.is_empty() {
            return Ok(CommitOutcome::NothingToApply);
        }
        let record = JournalRecord {
            index: request.index,
            task_id: request.task_id.clone(),
            status: request.payload.status,
            changed_files: request.payload.changed_files.clone(),
            message: request.payload.message.clone(),
            applied_at: Utc::now(),
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_json_line(&path, &record))
            .await
            .map_err(|e| WardenError::Commit(format!("journal writer panicked: {e}")))??;
        Ok(CommitOutcome::Applied)
    }
}

/// エントリごとに JSON 1 行を書く監査シンク
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_json_line(&path, &entry))
            .await
            .map_err(|e| WardenError::io(self.path.clone(), std::io::Error::other(e)))?
    }
}
