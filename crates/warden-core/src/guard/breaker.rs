//! CircuitBreaker - (agent, target) ごとの失敗回数ベースの breaker
//!
//! # 状態遷移
//! ```text
//! CLOSED --(failure_threshold 回連続で失敗)--> OPEN
//! OPEN --(reset_timeout 経過、can_proceed で確認)--> HALF_OPEN
//! HALF_OPEN --(success_threshold 回連続で成功)--> CLOSED
//! HALF_OPEN --(1 回でも失敗)--> OPEN
//! ```
//!
//! breaker はただのデータ。時刻の出所は registry が決めるので、呼び出し側が
//! `now` を渡す

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// registry 内の全 breaker で共有する閾値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout_secs: 300,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.reset_timeout_secs).unwrap_or(i64::MAX))
    }
}

/// レポート用の breaker のスナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_failures: u64,
    total_successes: u64,
    opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_failures: 0,
            total_successes: 0,
            opened_at: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// 今すぐ呼び出してよいか
    ///
    /// reset timeout が経過した OPEN の breaker は HALF_OPEN に移り、
    /// 試行を 1 回通す
    pub fn can_proceed(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now - at >= self.config.reset_timeout())
                    .unwrap_or(true);
                if elapsed {
                    self.transition(BreakerState::HalfOpen, now);
                }
                elapsed
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.total_successes += 1;
        self.consecutive_failures = 0;
        match self.state {
            BreakerState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold.max(1) {
                    self.transition(BreakerState::Closed, now);
                }
            }
            BreakerState::Closed => self.consecutive_successes += 1,
            // timeout が経過して試行を通すまで OPEN のまま
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.total_failures += 1;
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        match self.state {
            BreakerState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.transition(BreakerState::Open, now);
                }
            }
            BreakerState::HalfOpen => self.transition(BreakerState::Open, now),
            BreakerState::Open => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            key: self.key.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            opened_at: self.opened_at,
        }
    }

    fn transition(&mut self, to: BreakerState, now: DateTime<Utc>) {
        let from = self.state;
        self.state = to;
        match to {
            BreakerState::Open => {
                self.opened_at = Some(now);
                tracing::warn!(
                    key = %self.key,
                    failures = self.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                self.consecutive_successes = 0;
                tracing::info!(key = %self.key, "circuit breaker half-open, probing");
            }
            BreakerState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                tracing::info!(key = %self.key, ?from, "circuit breaker closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn config(failures: u32, successes: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            reset_timeout_secs: 60,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn opens_after_threshold_and_half_opens_after_timeout() {
        let mut b = CircuitBreaker::new("agent@repo", config(3, 1));
        let now = t0();

        b.record_failure(now);
        b.record_failure(now);
        assert!(b.can_proceed(now));
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_proceed(now + Duration::seconds(59)));

        let later = now + Duration::seconds(60);
        assert!(b.can_proceed(later));
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success(later);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.snapshot().opened_at.is_none());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut b = CircuitBreaker::new("k", config(3, 1));
        let now = t0();
        b.record_failure(now);
        b.record_failure(now);
        b.record_success(now);
        b.record_failure(now);
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut b = CircuitBreaker::new("k", config(1, 2));
        let now = t0();
        b.record_failure(now);
        let later = now + Duration::seconds(61);
        assert!(b.can_proceed(later));
        b.record_success(later);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure(later);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.snapshot().opened_at, Some(later));
        assert!(!b.can_proceed(later + Duration::seconds(1)));
    }

    #[test]
    fn half_open_needs_success_threshold() {
        let mut b = CircuitBreaker::new("k", config(1, 2));
        let now = t0();
        b.record_failure(now);
        let later = now + Duration::seconds(60);
        b.can_proceed(later);
        b.record_success(later);
        b.record_success(later);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().total_successes, 2);
    }
}
