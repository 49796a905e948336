//! ロックレコードのミラー - 外部から観察できるよう、ロック中のパスごとに JSON 1 ファイル
//!
//! ファイル名: sha256(path) の先頭 16 桁の hex + ".json"

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::registry::LockMode;
use crate::domain::{Result, TaskId, WorkerId};
use crate::store::{remove_if_exists, write_json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub path: String,
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    /// そのパスを保持している worker 数（共有ロックのときだけ 2 以上）
    pub holders: usize,
}

#[derive(Debug, Clone)]
pub struct LockMirror {
    dir: PathBuf,
}

impl LockMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, path: &str) -> PathBuf {
        self.dir.join(record_file_name(path))
    }

    pub fn write(&self, record: &LockRecord) -> Result<()> {
        write_json(&self.record_path(&record.path), record)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        remove_if_exists(&self.record_path(path)).map(|_| ())
    }
}

pub fn record_file_name(path: &str) -> String {
    let digest = hex::encode(Sha256::digest(path.as_bytes()));
    format!("{}.json", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_sixteen_hex_chars() {
        let name = record_file_name("src/main.rs");
        assert_eq!(name.len(), 16 + ".json".len());
        assert!(name[..16].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, record_file_name("src/lib.rs"));
        // sha256("") = e3b0c442 98fc1c14 ...
        assert_eq!(record_file_name(""), "e3b0c44298fc1c14.json");
    }
}
