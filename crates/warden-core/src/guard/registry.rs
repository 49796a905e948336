//! BreakerRegistry - (agent, target) をキーに遅延生成する breaker

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::domain::{Result, WardenError};
use crate::ports::{Clock, KillSwitch};

/// breaker の識別子。`agent@target` と表示する
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakerKey(String);

impl BreakerKey {
    pub fn new(agent: &str, target: &str) -> Self {
        Self(format!("{agent}@{target}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 1 つのオーケストレータの全 breaker を 1 つの mutex で持つ
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    kill_switch: Option<Arc<dyn KillSwitch>>,
    breakers: Mutex<HashMap<BreakerKey, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            kill_switch: None,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_kill_switch(mut self, kill_switch: Arc<dyn KillSwitch>) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn can_proceed(&self, key: &BreakerKey) -> bool {
        let now = self.clock.now();
        self.with_breaker(key, |b| b.can_proceed(now))
    }

    /// kill switch を先に見て、次に breaker
    pub fn check(&self, key: &BreakerKey) -> Result<()> {
        if let Some(switch) = &self.kill_switch {
            let mode = switch.mode();
            if mode.halts() {
                return Err(WardenError::KillSwitchActive {
                    mode: mode.to_string(),
                });
            }
        }
        if self.can_proceed(key) {
            Ok(())
        } else {
            Err(WardenError::CircuitBreakerTripped {
                key: key.to_string(),
            })
        }
    }

    pub fn record_success(&self, key: &BreakerKey) {
        let now = self.clock.now();
        self.with_breaker(key, |b| b.record_success(now));
    }

    pub fn record_failure(&self, key: &BreakerKey) {
        let now = self.clock.now();
        self.with_breaker(key, |b| b.record_failure(now));
    }

    /// キー順のスナップショット
    pub fn states(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = breakers.values().map(CircuitBreaker::snapshot).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn with_breaker<T>(&self, key: &BreakerKey, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers
            .entry(key.clone())
            .or_insert_with(|| CircuitBreaker::new(key.as_str(), self.config.clone()));
        f(breaker)
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
