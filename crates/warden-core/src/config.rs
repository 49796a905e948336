//! オーケストレータの設定（`warden.toml`）
//!
//! セクションもフィールドもすべて省略可能。省略した値は以下の
//! デフォルトになる

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_MAX_ITERATIONS, GuardrailPolicy, Result, Task, TaskId, WardenError};
use crate::guard::{BreakerConfig, ResourceLimits};
use crate::queue::RetryPolicy;
use crate::store::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// チェックポイント、使用量、カウンタ、ジャーナルのルート
    pub state_dir: PathBuf,

    /// リソース使用量と verifier の breaker のスコープ
    pub project: String,

    #[serde(rename = "loop")]
    pub iteration: LoopSection,
    pub schedule: ScheduleSection,
    pub breaker: BreakerConfig,
    pub metered: MeteredSection,
    pub limits: ResourceLimits,
    pub locks: LocksSection,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".warden"),
            project: "default".to_string(),
            iteration: LoopSection::default(),
            schedule: ScheduleSection::default(),
            breaker: BreakerConfig::default(),
            metered: MeteredSection::default(),
            limits: ResourceLimits::default(),
            locks: LocksSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    /// [`WardenConfig::task`] で作るタスクの予算
    pub max_iterations: u32,
    pub agent_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub guardrail_policy: GuardrailPolicy,
    /// BLOCK の iteration 間の待ち時間
    pub backoff: RetryPolicy,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            agent_timeout_secs: 600,
            verify_timeout_secs: 300,
            guardrail_policy: GuardrailPolicy::default(),
            backoff: RetryPolicy::default(),
        }
    }
}

impl LoopSection {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub max_parallel: usize,
    /// ロック競合で差し戻されたタスクが BLOCKED と報告されるまでに
    /// 見送れるスケジューリングのラウンド数
    pub max_deferrals: u32,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_deferrals: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteredSection {
    pub max_calls_per_session: u64,
}

impl Default for MeteredSection {
    fn default() -> Self {
        Self {
            max_calls_per_session: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksSection {
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// ロックレコードのミラー。相対パスは `state_dir` 基準で解決する
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_dir: Option<PathBuf>,
}

impl Default for LocksSection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 300,
            sweep_interval_secs: 30,
            mirror_dir: None,
        }
    }
}

impl LocksSection {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl WardenConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> { Err(WardenError::Config(msg.to_string())) };
        if self.project.trim().is_empty() {
            return invalid("project must not be empty");
        }
        if self.iteration.max_iterations == 0 {
            return invalid("loop.max_iterations must be > 0");
        }
        if self.iteration.agent_timeout_secs == 0 {
            return invalid("loop.agent_timeout_secs must be > 0");
        }
        if self.iteration.verify_timeout_secs == 0 {
            return invalid("loop.verify_timeout_secs must be > 0");
        }
        if self.iteration.backoff.multiplier < 1.0 {
            return invalid("loop.backoff.multiplier must be >= 1.0");
        }
        if self.schedule.max_parallel == 0 {
            return invalid("schedule.max_parallel must be > 0");
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return invalid("breaker thresholds must be > 0");
        }
        if self.metered.max_calls_per_session == 0 {
            return invalid("metered.max_calls_per_session must be > 0");
        }
        if !(0.0..=1.0).contains(&self.limits.warning_pct) {
            return invalid("limits.warning_pct must be within 0.0..=1.0");
        }
        if self.locks.sweep_interval_secs == 0 {
            return invalid("locks.sweep_interval_secs must be > 0");
        }
        Ok(())
    }

    /// 設定された iteration 予算を持つ新しいタスク
    pub fn task(&self, id: impl Into<TaskId>, description: impl Into<String>) -> Task {
        Task::new(id, description).with_max_iterations(self.iteration.max_iterations)
    }

    /// `state_dir` 基準で解決した `locks.mirror_dir`
    pub fn mirror_dir(&self) -> Option<PathBuf> {
        self.locks.mirror_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.state_dir.join(dir)
            }
        })
    }
}

/// TOML ファイルから設定を読み込む
///
/// ファイルがなければ `WardenConfig::default()`
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    let cfg = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<WardenConfig>(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => WardenConfig::default(),
        Err(e) => return Err(WardenError::io(path, e)),
    };
    cfg.validate()?;
    Ok(cfg)
}

pub fn write_config(path: &Path, cfg: &WardenConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg)?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let cfg = load_config(&temp.path().join("missing.toml")).unwrap();
        assert_eq!(cfg, WardenConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("warden.toml");
        let mut cfg = WardenConfig::default();
        cfg.project = "billing".into();
        cfg.schedule.max_parallel = 8;
        cfg.iteration.guardrail_policy = GuardrailPolicy::AutoRevert;
        cfg.locks.mirror_dir = Some(PathBuf::from("locks"));

        write_config(&path, &cfg).unwrap();
        assert_eq!(load_config(&path).unwrap(), cfg);
    }

    #[test]
    fn partial_file_fills_the_rest() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("warden.toml");
        std::fs::write(
            &path,
            "project = \"web\"\n\n[loop]\nmax_iterations = 9\nguardrail_policy = \"auto_revert\"\n\n[limits]\nmax_cost_daily_usd = 2.5\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.project, "web");
        assert_eq!(cfg.iteration.max_iterations, 9);
        assert_eq!(cfg.iteration.guardrail_policy, GuardrailPolicy::AutoRevert);
        assert_eq!(cfg.iteration.agent_timeout_secs, 600);
        assert_eq!(cfg.limits.max_cost_daily_usd, 2.5);
        assert_eq!(cfg.limits.max_writes_daily, ResourceLimits::default().max_writes_daily);
        assert_eq!(cfg.schedule, ScheduleSection::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("warden.toml");
        std::fs::write(&path, "[schedule]\nmax_parallel = 0\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_parallel"));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("warden.toml");
        std::fs::write(&path, "project = [").unwrap();
        assert!(matches!(load_config(&path), Err(WardenError::Toml(_))));
    }

    #[test]
    fn tasks_get_the_configured_budget() {
        let mut cfg = WardenConfig::default();
        cfg.iteration.max_iterations = 12;
        assert_eq!(cfg.task("t", "do it").max_iterations, 12);
    }

    #[test]
    fn relative_mirror_dir_resolves_under_state_dir() {
        let mut cfg = WardenConfig::default();
        assert_eq!(cfg.mirror_dir(), None);
        cfg.locks.mirror_dir = Some(PathBuf::from("locks"));
        assert_eq!(cfg.mirror_dir(), Some(PathBuf::from(".warden/locks")));
    }
}
