//! OrchestratorBuilder - 配線と起動時の検証
//!
//! fail fast: エージェントや verifier の欠落、不正な設定、使えない state
//! ディレクトリはタスクを実行する前に `build()` が報告する

use std::sync::Arc;

use super::iteration_loop::{IterationLoop, LoopConfig, LoopContext};
use super::orchestrator::Orchestrator;
use crate::config::WardenConfig;
use crate::domain::{Decider, WardenError};
use crate::guard::{BreakerRegistry, MeteredBreaker, ResourceTracker};
use crate::impls::{AtomicKillSwitch, NoopFinalizer};
use crate::locks::{FileLockRegistry, LockMirror};
use crate::ports::{
    AgentInvoker, Clock, Finalizer, GovernanceContract, HumanGate, IdGenerator, KillSwitch,
    Reverter, SystemClock, UlidGenerator, Verifier,
};
use crate::store::{DurableCounter, FileCheckpointStore, JournalFinalizer, JsonlAuditSink};

/// [`Orchestrator`] を組み立てる
///
/// # 例
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new(load_config(path)?)
///     .agent(Arc::new(my_agent))
///     .verifier(Arc::new(my_verifier))
///     .build()?;
/// ```
///
/// デフォルトでは全状態を `config.state_dir` 配下に置く。`in_memory()` なら
/// プロセス内に保持する
pub struct OrchestratorBuilder {
    config: WardenConfig,
    persistent: bool,
    clock: Arc<dyn Clock>,
    agent: Option<Arc<dyn AgentInvoker>>,
    verifier: Option<Arc<dyn Verifier>>,
    finalizer: Option<Arc<dyn Finalizer>>,
    kill_switch: Option<Arc<dyn KillSwitch>>,
    governance: Option<Arc<dyn GovernanceContract>>,
    decider: Option<Arc<dyn Decider>>,
    reverter: Option<Arc<dyn Reverter>>,
    human_gate: Option<Arc<dyn HumanGate>>,
    baseline: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no agent configured; call .agent(...) before build()")]
    MissingAgent,

    #[error("no verifier configured; call .verifier(...) before build()")]
    MissingVerifier,

    #[error(transparent)]
    InvalidConfig(WardenError),

    #[error("state directory unusable: {0}")]
    Storage(#[source] WardenError),
}

impl OrchestratorBuilder {
    pub fn new(config: WardenConfig) -> Self {
        Self {
            config,
            persistent: true,
            clock: Arc::new(SystemClock),
            agent: None,
            verifier: None,
            finalizer: None,
            kill_switch: None,
            governance: None,
            decider: None,
            reverter: None,
            human_gate: None,
            baseline: None,
        }
    }

    /// チェックポイント、監査、使用量をメモリに保持し、何も書き込まない
    pub fn in_memory(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn agent(mut self, agent: Arc<dyn AgentInvoker>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// デフォルトは JSONL ジャーナル（インメモリでは何もしない finalizer）
    pub fn finalizer(mut self, finalizer: Arc<dyn Finalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn kill_switch(mut self, kill_switch: Arc<dyn KillSwitch>) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn governance(mut self, governance: Arc<dyn GovernanceContract>) -> Self {
        self.governance = Some(governance);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn reverter(mut self, reverter: Arc<dyn Reverter>) -> Self {
        self.reverter = Some(reverter);
        self
    }

    pub fn human_gate(mut self, gate: Arc<dyn HumanGate>) -> Self {
        self.human_gate = Some(gate);
        self
    }

    /// verifier に渡すベースライン
    pub fn baseline(mut self, baseline: impl Into<String>) -> Self {
        self.baseline = Some(baseline.into());
        self
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        let config = self.config;
        config.validate().map_err(BuildError::InvalidConfig)?;
        let agent = self.agent.ok_or(BuildError::MissingAgent)?;
        let verifier = self.verifier.ok_or(BuildError::MissingVerifier)?;

        let clock = self.clock;
        let kill_switch: Arc<dyn KillSwitch> = match self.kill_switch {
            Some(kill_switch) => kill_switch,
            None => Arc::new(AtomicKillSwitch::default()),
        };
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));

        let mut ctx = LoopContext::in_memory(clock.clone(), kill_switch.clone());
        ctx.breakers = Arc::new(
            BreakerRegistry::new(config.breaker.clone(), clock.clone())
                .with_kill_switch(kill_switch.clone()),
        );
        ctx.metered = Arc::new(
            MeteredBreaker::new(config.metered.max_calls_per_session)
                .with_kill_switch(kill_switch.clone()),
        );
        if let Some(governance) = self.governance {
            ctx.governance = governance;
        }
        if let Some(decider) = self.decider {
            ctx.decider = decider;
        }
        ctx.reverter = self.reverter;
        ctx.human_gate = self.human_gate;

        let mut locks = FileLockRegistry::new(clock.clone());
        let (session_id, finalizer) = if self.persistent {
            let dir = &config.state_dir;
            let resources =
                ResourceTracker::open(&config.project, config.limits.clone(), clock.clone(), dir)
                    .map_err(BuildError::Storage)?;
            resources.restart_session();
            ctx.resources = Arc::new(resources);
            ctx.checkpoints = Arc::new(FileCheckpointStore::new(dir.join("iterations")));
            ctx.audit = Arc::new(JsonlAuditSink::new(dir.join("audit.jsonl")));
            if let Some(mirror) = config.mirror_dir() {
                locks = locks.with_mirror(LockMirror::new(mirror));
            }

            let run = DurableCounter::new(dir.join("counters").join("runs.json"))
                .next()
                .map_err(BuildError::Storage)?;
            let finalizer: Arc<dyn Finalizer> = match self.finalizer {
                Some(finalizer) => finalizer,
                None => Arc::new(JournalFinalizer::new(dir.join("commits.jsonl"))),
            };
            (format!("run-{run}"), finalizer)
        } else {
            ctx.resources = Arc::new(ResourceTracker::in_memory(
                &config.project,
                config.limits.clone(),
                clock.clone(),
            ));
            let finalizer: Arc<dyn Finalizer> = match self.finalizer {
                Some(finalizer) => finalizer,
                None => Arc::new(NoopFinalizer),
            };
            ("run-memory".to_string(), finalizer)
        };

        let loop_config = LoopConfig {
            agent_timeout: config.iteration.agent_timeout(),
            verify_timeout: config.iteration.verify_timeout(),
            policy: config.iteration.guardrail_policy,
            backoff: config.iteration.backoff.clone(),
            project: config.project.clone(),
            session_id,
            baseline: self.baseline,
        };
        tracing::info!(
            session = %loop_config.session_id,
            project = %config.project,
            persistent = self.persistent,
            "orchestrator built"
        );

        let iteration = IterationLoop::new(loop_config, ctx, agent, verifier);
        Ok(Orchestrator::new(config, iteration, locks, finalizer, ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedAgent, ScriptedVerifier, Step};
    use crate::ports::AgentOutput;

    fn agent() -> Arc<dyn AgentInvoker> {
        Arc::new(ScriptedAgent::repeating(Step::output(AgentOutput::new(""))))
    }

    #[test]
    fn test_build_success() {
        let orch = OrchestratorBuilder::new(WardenConfig::default())
            .in_memory()
            .agent(agent())
            .verifier(Arc::new(ScriptedVerifier::passing()))
            .build()
            .unwrap();
        assert_eq!(orch.session_id(), "run-memory");
    }

    #[test]
    fn test_build_missing_agent() {
        let built = OrchestratorBuilder::new(WardenConfig::default())
            .in_memory()
            .verifier(Arc::new(ScriptedVerifier::passing()))
            .build();
        assert!(matches!(built, Err(BuildError::MissingAgent)));
    }

    #[test]
    fn test_build_missing_verifier() {
        let built = OrchestratorBuilder::new(WardenConfig::default())
            .in_memory()
            .agent(agent())
            .build();
        assert!(matches!(built, Err(BuildError::MissingVerifier)));
    }

    #[test]
    fn test_build_invalid_config() {
        let mut cfg = WardenConfig::default();
        cfg.schedule.max_parallel = 0;
        let built = OrchestratorBuilder::new(cfg)
            .in_memory()
            .agent(agent())
            .verifier(Arc::new(ScriptedVerifier::passing()))
            .build();
        assert!(matches!(built, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_persistent_build_numbers_sessions() {
        let temp = tempfile::tempdir().unwrap();
        let mut cfg = WardenConfig::default();
        cfg.state_dir = temp.path().to_path_buf();

        let build = || {
            OrchestratorBuilder::new(cfg.clone())
                .agent(agent())
                .verifier(Arc::new(ScriptedVerifier::passing()))
                .build()
                .unwrap()
        };
        assert_eq!(build().session_id(), "run-1");
        assert_eq!(build().session_id(), "run-2");
        assert!(temp.path().join("usage").join("default.json").exists());
    }
}
