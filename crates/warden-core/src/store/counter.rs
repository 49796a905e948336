//! DurableCounter - 再起動をまたいで単調増加する ID

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::json::{read_json, write_json};
use crate::domain::Result;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterFile {
    value: u64,
}

/// プロセス内 mutex の下で JSON ファイルを read-modify-write する
///
/// run / session の採番に使う。1 つの state ディレクトリを持つプロセスは
/// 同時に 1 つだけの想定
#[derive(Debug)]
pub struct DurableCounter {
    path: PathBuf,
    guard: Mutex<()>,
}

impl DurableCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// 次の値を予約する（最初の呼び出しは 1）
    pub fn next(&self) -> Result<u64> {
        let _held = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut file: CounterFile = read_json(&self.path)?.unwrap_or_default();
        file.value += 1;
        write_json(&self.path, &file)?;
        Ok(file.value)
    }

    pub fn current(&self) -> Result<u64> {
        let _held = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        Ok(read_json::<CounterFile>(&self.path)?.unwrap_or_default().value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("counters/run.json");

        let counter = DurableCounter::new(&path);
        assert_eq!(counter.next().unwrap(), 1);
        assert_eq!(counter.next().unwrap(), 2);

        let reopened = DurableCounter::new(&path);
        assert_eq!(reopened.current().unwrap(), 2);
        assert_eq!(reopened.next().unwrap(), 3);
    }

    #[test]
    fn concurrent_reservations_are_unique() {
        let temp = tempfile::tempdir().expect("tempdir");
        let counter = Arc::new(DurableCounter::new(temp.path().join("c.json")));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || counter.next().unwrap())
            })
            .collect();
        let mut values: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        values.sort_unstable();
        assert_eq!(values, (1..=8).collect::<Vec<_>>());
    }
}
