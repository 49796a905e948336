//! FileCheckpointStore - タスクごとに 1 つの JSON ファイルで持つ iteration チェックポイント

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::json::{read_json, remove_if_exists, write_json};
use crate::domain::{IterationState, Result, TaskId, WardenError};
use crate::ports::CheckpointStore;

/// チェックポイントを `<dir>/<task_id>.json` に保存する
///
/// ファイル名に向かないタスク ID はサニタイズし、短いハッシュを付けるので
/// 異なる ID が同じファイルを共有することはない
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(file_name(task_id))
    }
}

fn file_name(task_id: &TaskId) -> String {
    let raw = task_id.as_str();
    let clean: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if clean == raw && !raw.is_empty() && !raw.starts_with('.') {
        format!("{clean}.json")
    } else {
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        format!("{clean}-{}.json", &digest[..8])
    }
}

async fn blocking<T, F>(path: PathBuf, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Path) -> Result<T> + Send + 'static,
{
    let join_path = path.clone();
    tokio::task::spawn_blocking(move || f(&path))
        .await
        .map_err(|e| WardenError::io(join_path, std::io::Error::other(e)))?
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, task_id: &TaskId) -> Result<Option<IterationState>> {
        blocking(self.path_for(task_id), |p| read_json(p)).await
    }

    async fn save(&self, state: &IterationState) -> Result<()> {
        let state = state.clone();
        blocking(self.path_for(&state.task_id), move |p| write_json(p, &state)).await
    }

    async fn delete(&self, task_id: &TaskId) -> Result<()> {
        blocking(self.path_for(task_id), |p| remove_if_exists(p).map(|_| ())).await
    }
}
