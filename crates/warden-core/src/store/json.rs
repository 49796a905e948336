//! アトミックな JSON ファイル
//!
//! 永続化するもの（チェックポイント、使用量、カウンタ、ロックレコード）はすべて
//! ここを通る。`<file>.tmp` に書いてから対象に rename する

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Result, WardenError};

pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        WardenError::io(path, std::io::Error::other("path has no parent directory"))
    })?;
    fs::create_dir_all(parent).map_err(|e| WardenError::io(parent, e))?;

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let mut file = fs::File::create(tmp_path).map_err(|e| WardenError::io(tmp_path, e))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| WardenError::io(tmp_path, e))?;
    fs::rename(tmp_path, path).map_err(|e| WardenError::io(path, e))?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// `path` を読んでパースする。ファイルがなければ `Ok(None)`
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WardenError::io(path, e)),
    }
}

/// `path` を削除する。削除したかどうかを返す
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(WardenError::io(path, e)),
    }
}

/// `path` に JSON 1 行を追記する。なければ作成する
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| WardenError::io(parent, e))?;
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| WardenError::io(path, e))?;
    file.write_all(&line).map_err(|e| WardenError::io(path, e))
}
