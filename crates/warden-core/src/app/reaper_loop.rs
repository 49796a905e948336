//! ReaperLoop - heartbeat が途絶えた worker を掃除する
//!
//! # フロー
//! 1. `interval` だけ待つ
//! 2. `FileLockRegistry::sweep_stale(timeout)` で沈黙した worker を破棄し、
//!    ロックを解放する
//! 3. キャンセル token が発火するまで繰り返す

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::locks::FileLockRegistry;

pub struct ReaperLoop {
    locks: Arc<FileLockRegistry>,
    timeout: Duration,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(locks: Arc<FileLockRegistry>, timeout: Duration, interval: Duration) -> Self {
        Self {
            locks,
            timeout,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// 現在のランタイム上で実行する。ハンドルは掃除した worker 数を返す
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<usize> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        // 最初の tick は即座に完了する
        ticker.tick().await;
        let mut swept = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stale = self.locks.sweep_stale(self.timeout);
                    if !stale.is_empty() {
                        tracing::warn!(count = stale.len(), "reaped stale workers");
                    }
                    swept += stale.len();
                }
            }
        }

        tracing::debug!(swept, "reaper stopped");
        swept
    }
}
