//! リトライポリシー - 1 タスクの BLOCK 間のバックオフ

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 上限付きの指数バックオフ
///
/// delay = base_delay * multiplier^(attempts - 1)、max_delay で頭打ち
/// base_delay が 0 なら待たない
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "millis")]
    pub base_delay: Duration,

    pub multiplier: f64,

    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// iteration 間で待たない
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// 次の試行までの待ち時間
    ///
    /// `attempts` はすでに行った試行回数（1 始まり）。0 は 1 として扱う
    ///
    /// base_delay=2s, multiplier=2.0, max_delay=60s の例:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    /// - attempt 6: 60s（頭打ち）
    pub fn next_delay(&self, attempts: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let cap = self.max_delay.max(self.base_delay).as_secs_f64();
        Duration::from_secs_f64(secs.min(cap))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn exponential_backoff_increases_up_to_the_cap() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(6), Duration::from_secs(60));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn immediate_never_waits() {
        assert_eq!(RetryPolicy::immediate().next_delay(7), Duration::ZERO);
    }
}
