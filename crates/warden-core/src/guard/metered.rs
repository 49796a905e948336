//! MeteredBreaker - セッションあたりの呼び出し回数の上限

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::{Result, WardenError};
use crate::ports::KillSwitch;

/// エージェントの呼び出しを数え、上限に達したら以降を拒否する
///
/// 上限に達した呼び出しで `record_call` が失敗し、`reset` までは
/// `check` も失敗し続ける
pub struct MeteredBreaker {
    max_calls: u64,
    calls: AtomicU64,
    kill_switch: Option<Arc<dyn KillSwitch>>,
}

impl MeteredBreaker {
    pub fn new(max_calls: u64) -> Self {
        Self {
            max_calls,
            calls: AtomicU64::new(0),
            kill_switch: None,
        }
    }

    pub fn with_kill_switch(mut self, kill_switch: Arc<dyn KillSwitch>) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn check(&self) -> Result<()> {
        if let Some(switch) = &self.kill_switch {
            let mode = switch.mode();
            if mode.halts() {
                return Err(WardenError::KillSwitchActive {
                    mode: mode.to_string(),
                });
            }
        }
        let calls = self.calls();
        if calls >= self.max_calls {
            return Err(WardenError::CallLimitReached {
                calls,
                max: self.max_calls,
            });
        }
        Ok(())
    }

    pub fn record_call(&self) -> Result<()> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls >= self.max_calls {
            tracing::warn!(calls, max = self.max_calls, "session call limit reached");
            return Err(WardenError::CallLimitReached {
                calls,
                max: self.max_calls,
            });
        }
        Ok(())
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for MeteredBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredBreaker")
            .field("max_calls", &self.max_calls)
            .field("calls", &self.calls())
            .finish()
    }
}
