//! ResourceTracker - 永続化する使用量カウンタとクォータチェック
//!
//! # 期間
//! - **session**: iteration とエージェント呼び出し。tracker を開いたとき
//!   （`max_session_hours` より古くなければ永続化されたセッションを再開）か
//!   `restart_session` で始まる。`max_session_hours` を超えた生きている
//!   セッションは上限超過として扱う
//! - **daily**: 書き込み、デプロイ、コスト。UTC の日付境界でロールオーバー
//!
//! 上限 `0` はそのチェックを無効にする

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Result, WardenError};
use crate::ports::Clock;
use crate::store::{read_json, write_json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_iterations_per_session: u64,
    pub max_api_calls_per_session: u64,
    pub max_writes_daily: u64,
    pub max_deploys_daily: u64,
    pub max_cost_daily_usd: f64,
    pub max_session_hours: f64,
    /// 警告を出す上限に対する割合
    pub warning_pct: f64,
    /// 1 タスクの試行回数がこれを超えたら黙ったリトライをやめる
    pub retry_escalation_threshold: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_iterations_per_session: 200,
            max_api_calls_per_session: 500,
            max_writes_daily: 1000,
            max_deploys_daily: 10,
            max_cost_daily_usd: 50.0,
            max_session_hours: 8.0,
            warning_pct: 0.8,
            retry_escalation_threshold: 10,
        }
    }
}

/// 永続化するカウンタ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub session_started_at: DateTime<Utc>,
    pub session_iterations: u64,
    pub session_api_calls: u64,
    pub day: NaiveDate,
    pub daily_writes: u64,
    pub daily_deploys: u64,
    pub daily_cost_usd: f64,
}

impl ResourceUsage {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            session_started_at: now,
            session_iterations: 0,
            session_api_calls: 0,
            day: now.date_naive(),
            daily_writes: 0,
            daily_deploys: 0,
            daily_cost_usd: 0.0,
        }
    }

    fn restart_session(&mut self, now: DateTime<Utc>) {
        self.session_started_at = now;
        self.session_iterations = 0;
        self.session_api_calls = 0;
    }

    fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.day == today {
            return false;
        }
        self.day = today;
        self.daily_writes = 0;
        self.daily_deploys = 0;
        self.daily_cost_usd = 0.0;
        true
    }

    fn session_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.session_started_at).num_seconds().max(0) as f64 / 3600.0
    }
}

/// 上限チェックの結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub exceeded: bool,
    /// 超過した上限ごとに 1 エントリ
    pub reasons: Vec<String>,
    /// `warning_pct` を超えたがまだ超過していない上限ごとに 1 エントリ
    pub warnings: Vec<String>,
}

impl LimitCheck {
    fn consider(&mut self, label: &str, value: f64, limit: f64, warning_pct: f64) {
        if limit <= 0.0 {
            return;
        }
        if value >= limit {
            self.exceeded = true;
            self.reasons.push(format!("{label} {} reached limit {}", fmt_num(value), fmt_num(limit)));
        } else if value >= limit * warning_pct {
            self.warnings.push(format!(
                "{label} at {:.0}% of limit ({} of {})",
                value / limit * 100.0,
                fmt_num(value),
                fmt_num(limit)
            ));
        }
    }
}

fn fmt_num(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.0}")
    } else {
        format!("{v:.2}")
    }
}

/// 使用量と、変更のたびに増えるバージョン
#[derive(Debug)]
struct Counters {
    usage: ResourceUsage,
    version: u64,
}

/// カウンタの永続化先
#[derive(Debug)]
struct UsageFile {
    path: PathBuf,
    /// ディスク上の最新バージョン
    written: Mutex<u64>,
}

impl UsageFile {
    fn write(&self, version: u64, usage: &ResourceUsage) -> Result<()> {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if version <= *written {
            return Ok(());
        }
        write_json(&self.path, usage)?;
        *written = version;
        Ok(())
    }
}

pub struct ResourceTracker {
    project: String,
    limits: ResourceLimits,
    clock: Arc<dyn Clock>,
    file: Option<Arc<UsageFile>>,
    counters: Mutex<Counters>,
}

impl ResourceTracker {
    /// ディスクに触れない tracker
    pub fn in_memory(project: impl Into<String>, limits: ResourceLimits, clock: Arc<dyn Clock>) -> Self {
        let usage = ResourceUsage::fresh(clock.now());
        Self {
            project: project.into(),
            limits,
            clock,
            file: None,
            counters: Mutex::new(Counters { usage, version: 0 }),
        }
    }

    /// `<state_dir>/usage/<project>.json` を読み込み、日付をロールし、
    /// 期限切れのセッションを破棄する
    pub fn open(
        project: impl Into<String>,
        limits: ResourceLimits,
        clock: Arc<dyn Clock>,
        state_dir: &Path,
    ) -> Result<Self> {
        let project = project.into();
        let path = usage_path(state_dir, &project);
        let now = clock.now();

        let usage = match read_json::<ResourceUsage>(&path)? {
            Some(mut usage) => {
                if usage.roll_day(now) {
                    tracing::info!(project = %project, "daily usage rolled over");
                }
                if limits.max_session_hours > 0.0
                    && usage.session_hours(now) >= limits.max_session_hours
                {
                    tracing::info!(project = %project, "persisted session expired, starting a new one");
                    usage.restart_session(now);
                }
                usage
            }
            None => ResourceUsage::fresh(now),
        };

        let file = UsageFile {
            path,
            written: Mutex::new(0),
        };
        file.write(1, &usage)?;
        Ok(Self {
            project,
            limits,
            clock,
            file: Some(Arc::new(file)),
            counters: Mutex::new(Counters { usage, version: 1 }),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn usage(&self) -> ResourceUsage {
        self.lock().usage.clone()
    }

    pub fn record_iteration(&self) -> LimitCheck {
        self.update(|u| u.session_iterations += 1)
    }

    pub fn record_api_call(&self) -> LimitCheck {
        self.update(|u| u.session_api_calls += 1)
    }

    pub fn record_write(&self, count: u64) -> LimitCheck {
        self.update(|u| u.daily_writes += count)
    }

    pub fn record_deploy(&self) -> LimitCheck {
        self.update(|u| u.daily_deploys += 1)
    }

    pub fn record_cost(&self, amount_usd: f64) -> LimitCheck {
        self.update(|u| u.daily_cost_usd += amount_usd.max(0.0))
    }

    /// 現在の上限状況。何も記録しない
    pub fn check_limits(&self) -> LimitCheck {
        let now = self.clock.now();
        let mut counters = self.lock();
        let rolled = counters.usage.roll_day(now);
        let check = self.evaluate(&counters.usage, now);
        let snapshot = rolled.then(|| Self::bump(&mut counters));
        drop(counters);
        if let Some((version, usage)) = snapshot {
            self.store(version, usage);
        }
        check
    }

    /// エージェントの iteration 1 回分（iteration と api 呼び出し）を予約する
    ///
    /// チェックと記録を同じロックの下で行う。上限に達していればカウンタに
    /// 触れずに `Err` を返すので、N 個の並行呼び出しでも上限を超えない
    pub fn try_begin_iteration(&self) -> Result<LimitCheck, LimitCheck> {
        let now = self.clock.now();
        let mut counters = self.lock();
        let rolled = counters.usage.roll_day(now);
        let before = self.evaluate(&counters.usage, now);
        if before.exceeded {
            let snapshot = rolled.then(|| Self::bump(&mut counters));
            drop(counters);
            if let Some((version, usage)) = snapshot {
                self.store(version, usage);
            }
            return Err(before);
        }
        counters.usage.session_iterations += 1;
        counters.usage.session_api_calls += 1;
        let after = self.evaluate(&counters.usage, now);
        let (version, usage) = Self::bump(&mut counters);
        drop(counters);
        self.store(version, usage);
        Ok(after)
    }

    /// 人間が見るべきほどタスクがリトライされたか
    pub fn check_retry_escalation(&self, task_attempts: u32) -> bool {
        let threshold = self.limits.retry_escalation_threshold;
        threshold > 0 && task_attempts >= threshold
    }

    pub fn restart_session(&self) {
        let now = self.clock.now();
        let mut counters = self.lock();
        counters.usage.restart_session(now);
        let (version, usage) = Self::bump(&mut counters);
        drop(counters);
        self.store(version, usage);
    }

    /// 最新のカウンタを書き込み、書き込み完了を待つ
    pub async fn flush(&self) -> Result<()> {
        let Some(file) = self.file.clone() else {
            return Ok(());
        };
        let (version, usage) = {
            let counters = self.lock();
            (counters.version, counters.usage.clone())
        };
        let path = file.path.clone();
        tokio::task::spawn_blocking(move || file.write(version, &usage))
            .await
            .map_err(|e| WardenError::io(path, std::io::Error::other(e)))?
    }

    fn update(&self, f: impl FnOnce(&mut ResourceUsage)) -> LimitCheck {
        let now = self.clock.now();
        let mut counters = self.lock();
        counters.usage.roll_day(now);
        f(&mut counters.usage);
        let check = self.evaluate(&counters.usage, now);
        let (version, usage) = Self::bump(&mut counters);
        drop(counters);
        self.store(version, usage);
        if !check.warnings.is_empty() {
            tracing::debug!(project = %self.project, warnings = ?check.warnings, "usage warning");
        }
        check
    }

    fn evaluate(&self, usage: &ResourceUsage, now: DateTime<Utc>) -> LimitCheck {
        let l = &self.limits;
        let pct = l.warning_pct;
        let mut check = LimitCheck::default();
        check.consider(
            "session iterations",
            usage.session_iterations as f64,
            l.max_iterations_per_session as f64,
            pct,
        );
        check.consider(
            "session api calls",
            usage.session_api_calls as f64,
            l.max_api_calls_per_session as f64,
            pct,
        );
        check.consider("daily writes", usage.daily_writes as f64, l.max_writes_daily as f64, pct);
        check.consider("daily deploys", usage.daily_deploys as f64, l.max_deploys_daily as f64, pct);
        check.consider("daily cost usd", usage.daily_cost_usd, l.max_cost_daily_usd, pct);
        check.consider("session duration hours", usage.session_hours(now), l.max_session_hours, pct);
        check
    }

    fn bump(counters: &mut Counters) -> (u64, ResourceUsage) {
        counters.version += 1;
        (counters.version, counters.usage.clone())
    }

    /// ランタイムがあれば async の worker スレッド外でスナップショットを永続化する。
    /// 古いスナップショットが新しいものを上書きすることはない
    fn store(&self, version: u64, usage: ResourceUsage) {
        let Some(file) = self.file.clone() else {
            return;
        };
        let project = self.project.clone();
        let write = move || {
            if let Err(e) = file.write(version, &usage) {
                tracing::warn!(project = %project, error = %e, "failed to persist resource usage");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(write)),
            Err(_) => write(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("project", &self.project)
            .field("limits", &self.limits)
            .field("path", &self.file.as_ref().map(|f| &f.path))
            .finish_non_exhaustive()
    }
}

pub fn usage_path(state_dir: &Path, project: &str) -> PathBuf {
    state_dir.join("usage").join(format!("{project}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::{Duration, TimeZone};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 10, 9, 0, 0).unwrap()))
    }

    #[test]
    fn cost_at_ceiling_is_exceeded() {
        let limits = ResourceLimits {
            max_cost_daily_usd: 10.0,
            ..ResourceLimits::default()
        };
        let tracker = ResourceTracker::in_memory("p", limits, clock());
        let check = tracker.record_cost(10.00);
        assert!(check.exceeded);
        assert_eq!(check.reasons.len(), 1);
        assert!(check.reasons[0].contains("cost"));
    }

    #[test]
    fn eighty_percent_warns_without_exceeding() {
        let limits = ResourceLimits {
            max_iterations_per_session: 10,
            ..ResourceLimits::default()
        };
        let tracker = ResourceTracker::in_memory("p", limits, clock());
        let mut check = LimitCheck::default();
        for _ in 0..8 {
            check = tracker.record_iteration();
        }
        assert!(!check.exceeded);
        assert!(!check.warnings.is_empty());
        assert!(check.warnings[0].contains("session iterations"));
    }

    #[test]
    fn zero_disables_a_ceiling() {
        let limits = ResourceLimits {
            max_deploys_daily: 0,
            ..ResourceLimits::default()
        };
        let tracker = ResourceTracker::in_memory("p", limits, clock());
        for _ in 0..50 {
            assert!(!tracker.record_deploy().exceeded);
        }
    }

    #[test]
    fn daily_counters_roll_at_utc_midnight() {
        let clock = clock();
        let tracker = ResourceTracker::in_memory("p", ResourceLimits::default(), clock.clone());
        tracker.record_write(5);
        tracker.record_iteration();

        clock.advance(Duration::hours(15));
        tracker.record_write(1);
        let usage = tracker.usage();
        assert_eq!(usage.daily_writes, 1);
        assert_eq!(usage.session_iterations, 1);
    }

    #[test]
    fn long_session_reports_duration() {
        let clock = clock();
        let tracker = ResourceTracker::in_memory("p", ResourceLimits::default(), clock.clone());
        clock.advance(Duration::hours(9));
        let check = tracker.check_limits();
        assert!(check.exceeded);
        assert!(check.reasons.iter().any(|r| r.contains("session duration")));

        tracker.restart_session();
        assert!(!tracker.check_limits().exceeded);
    }

    #[test]
    fn retry_escalation_threshold() {
        let tracker = ResourceTracker::in_memory("p", ResourceLimits::default(), clock());
        assert!(!tracker.check_retry_escalation(9));
        assert!(tracker.check_retry_escalation(10));
    }

    #[test]
    fn begin_iteration_refuses_at_the_ceiling_without_counting() {
        let limits = ResourceLimits {
            max_iterations_per_session: 3,
            ..ResourceLimits::default()
        };
        let tracker = ResourceTracker::in_memory("p", limits, clock());

        assert!(tracker.try_begin_iteration().is_ok());
        assert!(tracker.try_begin_iteration().is_ok());
        let last = tracker.try_begin_iteration().unwrap();
        assert!(last.exceeded);

        let refused = tracker.try_begin_iteration().unwrap_err();
        assert!(refused.reasons[0].contains("session iterations 3 reached limit 3"));
        let usage = tracker.usage();
        assert_eq!(usage.session_iterations, 3);
        assert_eq!(usage.session_api_calls, 3);
    }

    #[test]
    fn check_limits_records_nothing() {
        let tracker = ResourceTracker::in_memory("p", ResourceLimits::default(), clock());
        tracker.check_limits();
        tracker.check_limits();
        assert_eq!(tracker.usage().session_iterations, 0);
    }

    #[test]
    fn stale_snapshot_never_overwrites_a_newer_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = UsageFile {
            path: temp.path().join("usage.json"),
            written: Mutex::new(0),
        };
        let mut newer = ResourceUsage::fresh(clock().now());
        newer.session_iterations = 2;
        let mut older = newer.clone();
        older.session_iterations = 1;

        file.write(5, &newer).unwrap();
        file.write(4, &older).unwrap();

        let on_disk: ResourceUsage = read_json(&file.path).unwrap().unwrap();
        assert_eq!(on_disk.session_iterations, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_lands_writes_made_on_the_runtime() {
        let temp = tempfile::tempdir().expect("tempdir");
        let clock = clock();
        let tracker =
            ResourceTracker::open("proj", ResourceLimits::default(), clock.clone(), temp.path())
                .unwrap();
        for _ in 0..20 {
            tracker.record_iteration();
        }
        tracker.record_write(3);
        tracker.flush().await.unwrap();

        let on_disk: ResourceUsage = read_json(&usage_path(temp.path(), "proj")).unwrap().unwrap();
        assert_eq!(on_disk.session_iterations, 20);
        assert_eq!(on_disk.daily_writes, 3);
    }

    #[test]
    fn reload_keeps_daily_counters_and_drops_expired_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let clock = clock();

        {
            let tracker =
                ResourceTracker::open("proj", ResourceLimits::default(), clock.clone(), temp.path())
                    .unwrap();
            tracker.record_write(7);
            tracker.record_iteration();
            tracker.record_api_call();
        }
        assert!(usage_path(temp.path(), "proj").exists());

        // 同じ日、セッション期間内
        clock.advance(Duration::hours(1));
        {
            let tracker =
                ResourceTracker::open("proj", ResourceLimits::default(), clock.clone(), temp.path())
                    .unwrap();
            let usage = tracker.usage();
            assert_eq!(usage.daily_writes, 7);
            assert_eq!(usage.session_iterations, 1);
        }

        // 同じ日、max_session_hours より古いセッション
        clock.advance(Duration::hours(8));
        let tracker =
            ResourceTracker::open("proj", ResourceLimits::default(), clock.clone(), temp.path())
                .unwrap();
        let usage = tracker.usage();
        assert_eq!(usage.daily_writes, 7);
        assert_eq!(usage.session_iterations, 0);
        assert_eq!(usage.session_api_calls, 0);
        assert_eq!(usage.session_started_at, clock.now());
    }
}
