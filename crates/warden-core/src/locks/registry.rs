//! FileLockRegistry - ファイル所有権と worker の登録
//!
//! # ルール
//! - 1 つのパスの排他ロック保持者は高々 1
//! - 共有ロックの保持者は他の共有ロック保持者とだけ共存できる
//! - すでに保持しているパスの再取得は成功する（冪等）
//! - 唯一の共有ロック保持者は排他ロックに昇格できる
//! - ここでは何もブロックしない。取得に失敗したら `false` を返し、呼び出し側が
//!   タスクをスケジューラに差し戻す
//!
//! ロックと登録は同じ mutex を共有するので、worker の登録解除とロックの解放は
//! 同時に起きる

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mirror::{LockMirror, LockRecord};
use crate::domain::{TaskId, WorkerId, normalize_path};
use crate::ports::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub mode: LockMode,
    pub holders: BTreeMap<WorkerId, TaskId>,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// 登録済み、heartbeat はまだ
    Starting,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub locked_paths: BTreeSet<String>,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// registry の全情報（レポート用）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub locks: Vec<FileLock>,
    pub workers: Vec<WorkerRegistration>,
}

#[derive(Default)]
struct Inner {
    locks: HashMap<String, FileLock>,
    workers: HashMap<WorkerId, WorkerRegistration>,
}

pub struct FileLockRegistry {
    clock: Arc<dyn Clock>,
    mirror: Option<LockMirror>,
    inner: Mutex<Inner>,
}

impl FileLockRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            mirror: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_mirror(mut self, mirror: LockMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    // ----------------------------------------
    // ロック
    // ----------------------------------------

    pub fn acquire(&self, worker: WorkerId, task: &TaskId, path: &str, mode: LockMode) -> bool {
        let path = normalize_path(path);
        let now = self.clock.now();
        let mut inner = self.lock();
        if !can_acquire(&inner, worker, &path, mode) {
            tracing::debug!(%worker, path = %path, ?mode, "lock conflict");
            return false;
        }
        self.grant(&mut inner, worker, task, path, mode, now);
        true
    }

    /// すべてのパスを取得するか、1 つも取得しない
    pub fn acquire_all<I, S>(&self, worker: WorkerId, task: &TaskId, paths: I, mode: LockMode) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths: BTreeSet<String> = paths.into_iter().map(|p| normalize_path(p.as_ref())).collect();
        let now = self.clock.now();
        let mut inner = self.lock();

        if let Some(blocked) = paths.iter().find(|p| !can_acquire(&inner, worker, p, mode)) {
            tracing::debug!(%worker, task_id = %task, path = %blocked, "lock set conflict");
            return false;
        }
        for path in paths {
            self.grant(&mut inner, worker, task, path, mode, now);
        }
        true
    }

    /// `worker` が保持していれば `path` を解放する
    pub fn release(&self, worker: WorkerId, path: &str) -> bool {
        let path = normalize_path(path);
        let mut inner = self.lock();
        self.release_locked(&mut inner, worker, &path)
    }

    /// `worker` が保持するロックをすべて解放し、解放した数を返す
    pub fn release_all(&self, worker: WorkerId) -> usize {
        let mut inner = self.lock();
        self.release_all_locked(&mut inner, worker)
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.lock().locks.contains_key(&normalize_path(path))
    }

    pub fn holders(&self, path: &str) -> Vec<(WorkerId, TaskId)> {
        self.lock()
            .locks
            .get(&normalize_path(path))
            .map(|l| l.holders.iter().map(|(w, t)| (*w, t.clone())).collect())
            .unwrap_or_default()
    }

    // ----------------------------------------
    // Worker
    // ----------------------------------------

    pub fn register(&self, worker: WorkerId, task: &TaskId, repo: Option<String>) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let locked_paths = inner
            .locks
            .values()
            .filter(|l| l.holders.contains_key(&worker))
            .map(|l| l.path.clone())
            .collect();
        inner.workers.insert(
            worker,
            WorkerRegistration {
                worker_id: worker,
                task_id: task.clone(),
                repo,
                locked_paths,
                status: WorkerStatus::Starting,
                registered_at: now,
                last_heartbeat: now,
            },
        );
        tracing::debug!(%worker, task_id = %task, "worker registered");
    }

    /// 登録を削除し、そのロックをすべて解放する
    pub fn unregister(&self, worker: WorkerId) -> Option<WorkerRegistration> {
        let mut inner = self.lock();
        let released = self.release_all_locked(&mut inner, worker);
        let registration = inner.workers.remove(&worker);
        if registration.is_some() {
            tracing::debug!(%worker, released, "worker unregistered");
        }
        registration
    }

    pub fn heartbeat(&self, worker: WorkerId) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.workers.get_mut(&worker) {
            Some(reg) => {
                reg.last_heartbeat = now;
                reg.status = WorkerStatus::Running;
                true
            }
            None => false,
        }
    }

    /// `timeout` より長く沈黙している worker を破棄し、ロックを解放する
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<WorkerId> {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.lock();

        let mut stale: Vec<WorkerId> = inner
            .workers
            .values()
            .filter(|r| now - r.last_heartbeat > timeout)
            .map(|r| r.worker_id)
            .collect();
        stale.sort();

        for worker in &stale {
            let released = self.release_all_locked(&mut inner, *worker);
            if let Some(reg) = inner.workers.remove(worker) {
                tracing::warn!(
                    worker = %worker,
                    task_id = %reg.task_id,
                    released,
                    "swept stale worker"
                );
            }
        }
        stale
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let inner = self.lock();
        let mut locks: Vec<FileLock> = inner.locks.values().cloned().collect();
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        let mut workers: Vec<WorkerRegistration> = inner.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.worker_id);
        LockSnapshot { locks, workers }
    }

    // ----------------------------------------
    // 内部処理（mutex 保持中）
    // ----------------------------------------

    fn grant(
        &self,
        inner: &mut Inner,
        worker: WorkerId,
        task: &TaskId,
        path: String,
        mode: LockMode,
        now: DateTime<Utc>,
    ) {
        let lock = inner.locks.entry(path.clone()).or_insert_with(|| FileLock {
            path: path.clone(),
            mode,
            holders: BTreeMap::new(),
            acquired_at: now,
        });
        if mode == LockMode::Exclusive {
            lock.mode = LockMode::Exclusive;
        }
        lock.holders.insert(worker, task.clone());
        let lock = lock.clone();

        if let Some(reg) = inner.workers.get_mut(&worker) {
            reg.locked_paths.insert(path);
        }
        self.mirror_write(&lock);
    }

    fn release_locked(&self, inner: &mut Inner, worker: WorkerId, path: &str) -> bool {
        let Some(lock) = inner.locks.get_mut(path) else {
            return false;
        };
        if lock.holders.remove(&worker).is_none() {
            return false;
        }
        if lock.holders.is_empty() {
            inner.locks.remove(path);
            self.mirror_remove(path);
        } else {
            let lock = lock.clone();
            self.mirror_write(&lock);
        }
        if let Some(reg) = inner.workers.get_mut(&worker) {
            reg.locked_paths.remove(path);
        }
        true
    }

    fn release_all_locked(&self, inner: &mut Inner, worker: WorkerId) -> usize {
        let held: Vec<String> = inner
            .locks
            .values()
            .filter(|l| l.holders.contains_key(&worker))
            .map(|l| l.path.clone())
            .collect();
        held.iter()
            .filter(|p| self.release_locked(inner, worker, p))
            .count()
    }

    fn mirror_write(&self, lock: &FileLock) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        let Some((worker_id, task_id)) = lock.holders.iter().next() else {
            return;
        };
        let record = LockRecord {
            path: lock.path.clone(),
            worker_id: *worker_id,
            task_id: task_id.clone(),
            mode: lock.mode,
            acquired_at: lock.acquired_at,
            holders: lock.holders.len(),
        };
        if let Err(e) = mirror.write(&record) {
            tracing::warn!(path = %lock.path, error = %e, "failed to mirror lock record");
        }
    }

    fn mirror_remove(&self, path: &str) {
        if let Some(mirror) = &self.mirror
            && let Err(e) = mirror.remove(path)
        {
            tracing::warn!(path = %path, error = %e, "failed to remove lock record");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn can_acquire(inner: &Inner, worker: WorkerId, path: &str, mode: LockMode) -> bool {
    let Some(lock) = inner.locks.get(path) else {
        return true;
    };
    if lock.holders.contains_key(&worker) {
        // 共有から排他への昇格には他の全員がいないこと
        return mode == LockMode::Shared
            || lock.mode == LockMode::Exclusive
            || lock.holders.len() == 1;
    }
    lock.mode == LockMode::Shared && mode == LockMode::Shared
}

impl fmt::Debug for FileLockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLockRegistry")
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn setup() -> (FileLockRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 2, 8, 0, 0).unwrap()));
        (FileLockRegistry::new(clock.clone()), clock)
    }

    fn worker() -> WorkerId {
        WorkerId::from_ulid(Ulid::new())
    }

    #[test]
    fn exclusive_lock_excludes_other_workers() {
        let (reg, _) = setup();
        let (w1, w2) = (worker(), worker());
        let t = TaskId::new("t");

        assert!(reg.acquire(w1, &t, "x.ts", LockMode::Exclusive));
        assert!(!reg.acquire(w2, &t, "x.ts", LockMode::Exclusive));
        assert!(reg.acquire(w1, &t, "x.ts", LockMode::Exclusive));
        assert!(!reg.release(w2, "x.ts"));
        assert!(reg.release(w1, "x.ts"));
        assert!(!reg.is_locked("x.ts"));
    }

    #[test]
    fn shared_locks_coexist_but_block_exclusive() {
        let (reg, _) = setup();
        let (w1, w2, w3) = (worker(), worker(), worker());
        let t = TaskId::new("t");

        assert!(reg.acquire(w1, &t, "a", LockMode::Shared));
        assert!(reg.acquire(w2, &t, "./a", LockMode::Shared));
        assert!(!reg.acquire(w3, &t, "a", LockMode::Exclusive));
        // 他に共有している worker がいる間は昇格を拒否
        assert!(!reg.acquire(w1, &t, "a", LockMode::Exclusive));

        assert!(reg.release(w2, "a"));
        assert!(reg.acquire(w1, &t, "a", LockMode::Exclusive));
        assert!(!reg.acquire(w2, &t, "a", LockMode::Shared));
        assert_eq!(reg.holders("a").len(), 1);
    }

    #[test]
    fn acquire_all_is_all_or_nothing() {
        let (reg, _) = setup();
        let (w1, w2) = (worker(), worker());

        assert!(reg.acquire(w1, &TaskId::new("a"), "b.rs", LockMode::Exclusive));
        assert!(!reg.acquire_all(w2, &TaskId::new("b"), ["a.rs", "b.rs", "c.rs"], LockMode::Exclusive));
        assert!(!reg.is_locked("a.rs"));
        assert!(!reg.is_locked("c.rs"));

        reg.release_all(w1);
        assert!(reg.acquire_all(w2, &TaskId::new("b"), ["a.rs", "b.rs", "c.rs"], LockMode::Exclusive));
        assert_eq!(reg.snapshot().locks.len(), 3);
    }

    #[test]
    fn unregister_releases_every_lock() {
        let (reg, _) = setup();
        let w = worker();
        let t = TaskId::new("t");
        reg.register(w, &t, Some("repo".into()));
        reg.acquire_all(w, &t, ["a", "b"], LockMode::Exclusive);
        assert_eq!(reg.snapshot().workers[0].locked_paths.len(), 2);

        let removed = reg.unregister(w).expect("registered");
        assert_eq!(removed.task_id, t);
        assert!(reg.snapshot().locks.is_empty());
        assert!(reg.unregister(w).is_none());
    }

    #[test]
    fn sweep_releases_locks_of_silent_workers() {
        let (reg, clock) = setup();
        let (quiet, chatty) = (worker(), worker());
        reg.register(quiet, &TaskId::new("q"), None);
        reg.register(chatty, &TaskId::new("c"), None);
        reg.acquire(quiet, &TaskId::new("q"), "q.rs", LockMode::Exclusive);
        reg.acquire(chatty, &TaskId::new("c"), "c.rs", LockMode::Exclusive);

        clock.advance(chrono::Duration::seconds(40));
        assert!(reg.heartbeat(chatty));
        clock.advance(chrono::Duration::seconds(30));

        let swept = reg.sweep_stale(Duration::from_secs(60));
        assert_eq!(swept, vec![quiet]);
        assert!(!reg.is_locked("q.rs"));
        assert!(reg.is_locked("c.rs"));
        assert_eq!(reg.worker_count(), 1);
        assert!(!reg.heartbeat(quiet));
    }

    #[test]
    fn mirror_follows_acquire_and_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mirror = LockMirror::new(temp.path().join("locks"));
        let (reg, _) = setup();
        let reg = reg.with_mirror(mirror.clone());
        let w = worker();

        assert!(reg.acquire(w, &TaskId::new("t"), "src/x.rs", LockMode::Exclusive));
        let record_path = mirror.record_path("src/x.rs");
        let record: LockRecord = crate::store::read_json(&record_path).unwrap().unwrap();
        assert_eq!(record.worker_id, w);
        assert_eq!(record.mode, LockMode::Exclusive);

        assert!(reg.release(w, "src/x.rs"));
        assert!(!record_path.exists());
    }

    #[test]
    fn mirror_failure_does_not_fail_acquire() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let (reg, _) = setup();
        let reg = reg.with_mirror(LockMirror::new(&blocker));

        assert!(reg.acquire(worker(), &TaskId::new("t"), "a", LockMode::Exclusive));
    }
}
