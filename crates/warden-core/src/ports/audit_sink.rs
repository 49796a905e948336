//! AuditSink port - stop hook 判断の追記専用ログ

use async_trait::async_trait;

use crate::domain::{AuditEntry, Result};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<()>;
}
