//! IterationLoop - 1 タスクの stop hook リトライループ
//!
//! # フロー（iteration ごと）
//! 1. キャンセル token、kill switch、iteration 予算、circuit breaker、
//!    呼び出しメーター、使用量の上限
//! 2. エージェント呼び出し（`agent_timeout` で制限、キャンセル可能）
//! 3. [`Decider`] に問い合わせ、verdict が必要なら取得して再度問い合わせ
//! 4. チェックポイントを保存し、監査エントリを追記
//! 5. 実行: ALLOW で終了、BLOCK はバックオフしてループ、ASK_HUMAN は
//!    human gate へ、ABORTED で終了
//!
//! 再開したタスクはチェックポイントの iteration 数から続ける

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::{
    AuditEntry, Decider, DefaultDecider, Evaluation, GuardrailPolicy, IterationState, LoopState,
    StopDecision, Task, TaskStatus, TerminalResult, Transition, Verdict, VerifyStatus, WardenError,
    WorkerId, contains_promise, normalize_path,
};
use crate::guard::{
    BreakerConfig, BreakerKey, BreakerRegistry, LimitCheck, MeteredBreaker, ResourceLimits,
    ResourceTracker,
};
use crate::impls::{InMemoryAuditSink, InMemoryCheckpointStore, PermissiveGovernance};
use crate::ports::{
    AgentInvoker, AgentRequest, AuditSink, CheckpointStore, Clock, GovernanceContract,
    HumanDecision, HumanGate, KillSwitch, KillSwitchMode, Reverter, TerminalContext, Verifier,
    VerifyRequest,
};
use crate::queue::RetryPolicy;

/// 実行ごとのループ設定
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub agent_timeout: Duration,
    pub verify_timeout: Duration,
    pub policy: GuardrailPolicy,
    pub backoff: RetryPolicy,
    pub project: String,
    pub session_id: String,
    pub baseline: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(600),
            verify_timeout: Duration::from_secs(300),
            policy: GuardrailPolicy::AskHuman,
            backoff: RetryPolicy::default(),
            project: "default".to_string(),
            session_id: "session".to_string(),
            baseline: None,
        }
    }
}

/// 実行中の全ループで共有する協調オブジェクト
#[derive(Clone)]
pub struct LoopContext {
    pub clock: Arc<dyn Clock>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub audit: Arc<dyn AuditSink>,
    pub kill_switch: Arc<dyn KillSwitch>,
    pub breakers: Arc<BreakerRegistry>,
    pub metered: Arc<MeteredBreaker>,
    pub resources: Arc<ResourceTracker>,
    pub governance: Arc<dyn GovernanceContract>,
    pub decider: Arc<dyn Decider>,
    pub reverter: Option<Arc<dyn Reverter>>,
    pub human_gate: Option<Arc<dyn HumanGate>>,
}

impl LoopContext {
    /// ディスクに何も永続化しないデフォルト
    pub fn in_memory(clock: Arc<dyn Clock>, kill_switch: Arc<dyn KillSwitch>) -> Self {
        Self {
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            breakers: Arc::new(
                BreakerRegistry::new(BreakerConfig::default(), clock.clone())
                    .with_kill_switch(kill_switch.clone()),
            ),
            metered: Arc::new(MeteredBreaker::new(500).with_kill_switch(kill_switch.clone())),
            resources: Arc::new(ResourceTracker::in_memory(
                "default",
                ResourceLimits::default(),
                clock.clone(),
            )),
            governance: Arc::new(PermissiveGovernance),
            decider: Arc::new(DefaultDecider),
            reverter: None,
            human_gate: None,
            kill_switch,
            clock,
        }
    }
}

/// ASK_HUMAN の解決結果
enum Escalation {
    Continue,
    Stop(TerminalResult),
}

pub struct IterationLoop {
    config: LoopConfig,
    ctx: LoopContext,
    agent: Arc<dyn AgentInvoker>,
    verifier: Arc<dyn Verifier>,
}

/// Running totals of one `run` call.
struct Progress {
    state: IterationState,
    loop_state: LoopState,
    last_verdict: Option<Verdict>,
    touched: BTreeSet<String>,
}

impl Progress {
    fn result(&self, status: TaskStatus) -> TerminalResult {
        let mut result = TerminalResult::new(self.state.task_id.clone(), status, self.state.iteration)
            .with_verdict(self.last_verdict.clone());
        result.changed_files = self.touched.iter().cloned().collect();
        result
    }
}

impl IterationLoop {
    pub fn new(
        config: LoopConfig,
        ctx: LoopContext,
        agent: Arc<dyn AgentInvoker>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            config,
            ctx,
            agent,
            verifier,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn context(&self) -> &LoopContext {
        &self.ctx
    }

    /// stop hook が終わらせるまで `task` を回す
    pub async fn run(
        &self,
        task: &Task,
        worker: Option<WorkerId>,
        cancel: &CancellationToken,
    ) -> TerminalResult {
        let mut p = Progress {
            state: self.load_or_start(task, worker).await,
            loop_state: LoopState::Running,
            last_verdict: None,
            touched: BTreeSet::new(),
        };
        let target = task.repo.as_deref().unwrap_or(&self.config.project);
        let agent_key = BreakerKey::new(self.agent.name(), target);
        let verifier_key = BreakerKey::new("verifier", &self.config.project);

        loop {
            // ---- iteration 前のチェック ----
            if cancel.is_cancelled() {
                return self.abort(&mut p, "cancelled").await;
            }
            let mode = self.ctx.kill_switch.mode();
            if mode.halts() {
                return self.abort(&mut p, &format!("kill switch {mode}")).await;
            }
            let policy = if mode == KillSwitchMode::Safe {
                GuardrailPolicy::AskHuman
            } else {
                self.config.policy
            };

            // 再開した ASK_HUMAN のチェックポイントは、課金される試行の前に人間の判断が必要
            if p.state.iteration >= p.state.max_iterations {
                let decision = StopDecision::ask_human(format!(
                    "budget exhausted: {}/{} iterations",
                    p.state.iteration, p.state.max_iterations
                ));
                self.record(&p.state, &decision, None, Vec::new()).await;
                p.loop_state = p.loop_state.on_decision(&decision);
                match self.escalate(&mut p, decision).await {
                    Escalation::Continue => continue,
                    Escalation::Stop(result) => return result,
                }
            }

            if let Err(e) = self.ctx.breakers.check(&agent_key) {
                return self.refuse(&mut p, e).await;
            }
            if let Err(e) = self.ctx.metered.check() {
                return self.refuse(&mut p, e).await;
            }
            let limits = self.ctx.resources.check_limits();
            if limits.exceeded {
                return self.hold(&mut p, resource_hold(&limits)).await;
            }
            if let Err(e) = self.ctx.metered.record_call() {
                return self.refuse(&mut p, e).await;
            }
            let usage = match self.ctx.resources.try_begin_iteration() {
                Ok(usage) => usage,
                // `check_limits` の後に別の worker が最後の枠を取った
                Err(limits) => return self.hold(&mut p, resource_hold(&limits)).await,
            };
            for warning in &usage.warnings {
                tracing::warn!(task_id = %task.id, warning = %warning, "approaching resource limit");
            }
            if usage.exceeded {
                tracing::warn!(
                    task_id = %task.id,
                    reasons = ?usage.reasons,
                    "resource ceiling reached; later iterations will be held"
                );
            }

            // ---- iteration 本体 ----
            p.state.iteration += 1;
            let iteration = p.state.iteration;
            tracing::info!(task_id = %task.id, iteration, max = p.state.max_iterations, "iteration started");

            let request = AgentRequest {
                task_id: task.id.clone(),
                description: task.description.clone(),
                iteration,
                max_iterations: p.state.max_iterations,
                completion_token: p.state.completion_token.clone(),
                repo: task.repo.clone(),
            };
            let invoked = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(self.config.agent_timeout, self.agent.invoke(&request)) => Some(r),
            };
            let Some(invoked) = invoked else {
                return self.abort(&mut p, "cancelled during agent call").await;
            };

            let (output, files, agent_failure, failure_kind) = match invoked {
                Ok(Ok(out)) => {
                    self.ctx.breakers.record_success(&agent_key);
                    let files: Vec<String> = out
                        .changed_files
                        .iter()
                        .map(|f| normalize_path(f))
                        .filter(|f| !f.is_empty())
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    (out.output, files, None, None)
                }
                Ok(Err(e)) => {
                    self.ctx.breakers.record_failure(&agent_key);
                    (String::new(), Vec::new(), Some(e.to_string()), Some(e.kind()))
                }
                Err(_) => {
                    self.ctx.breakers.record_failure(&agent_key);
                    let e = WardenError::AgentTimeout {
                        after: self.config.agent_timeout,
                    };
                    (String::new(), Vec::new(), Some(e.to_string()), Some(e.kind()))
                }
            };
            if let Some(err) = &agent_failure {
                tracing::warn!(task_id = %task.id, iteration, error = %err, "agent attempt failed");
            }
            if !files.is_empty() {
                let writes = self.ctx.resources.record_write(files.len() as u64);
                if writes.exceeded {
                    tracing::warn!(task_id = %task.id, reasons = ?writes.reasons, "daily write ceiling reached; later iterations will be held");
                }
                p.touched.extend(files.iter().cloned());
            }

            // ---- stop hook ----
            let mut eval = Evaluation {
                iteration,
                max_iterations: p.state.max_iterations,
                signal_seen: contains_promise(&output, &p.state.completion_token),
                changed_files: files.len(),
                agent_failure,
                failure_kind,
                verify: VerifyStatus::NotRun,
                policy,
            };
            let mut transition = self.ctx.decider.decide(&eval);
            if transition == Transition::NeedsVerdict {
                eval.verify = self.verify(task, &files, &verifier_key, cancel).await;
                if let VerifyStatus::Verdict(v) = &eval.verify {
                    p.last_verdict = Some(v.clone());
                }
                transition = self.ctx.decider.decide(&eval);
            }
            let mut decision = match transition {
                Transition::Decided(d) => d,
                Transition::NeedsVerdict => StopDecision::block("decider asked for a verdict twice"),
            };
            if matches!(decision, StopDecision::Block { .. })
                && self.ctx.resources.check_retry_escalation(iteration)
            {
                decision = StopDecision::ask_human(format!("retry escalation after {iteration} attempts"));
            }

            self.save(&p.state).await;
            let verdict_kind = match &eval.verify {
                VerifyStatus::Verdict(v) => Some(v.kind),
                _ => None,
            };
            self.record(&p.state, &decision, verdict_kind, files.clone()).await;
            p.loop_state = p.loop_state.on_decision(&decision);
            tracing::info!(
                task_id = %task.id,
                iteration,
                decision = decision.label(),
                reason = decision.reason().unwrap_or(""),
                state = ?p.loop_state,
                "stop hook decided"
            );

            // ---- 実行 ----
            match decision {
                StopDecision::Allow { reverted: false } => {
                    self.delete(&p.state).await;
                    return p.result(TaskStatus::Completed);
                }
                StopDecision::Allow { reverted: true } => {
                    match self.revert(task, &files).await {
                        Ok(()) => {
                            tracing::warn!(task_id = %task.id, iteration, files = ?files, "guardrail violation reverted");
                            self.delete(&p.state).await;
                            let mut result = p.result(TaskStatus::Reverted).with_reason("guardrail violation reverted");
                            result.reverted = true;
                            return result;
                        }
                        Err(e) => {
                            let escalate = StopDecision::ask_human(format!("auto-revert failed: {e}"));
                            self.record(&p.state, &escalate, verdict_kind, files).await;
                            p.loop_state = LoopState::AskHuman;
                            match self.escalate(&mut p, escalate).await {
                                Escalation::Continue => continue,
                                Escalation::Stop(result) => return result,
                            }
                        }
                    }
                }
                StopDecision::Block { .. } => {
                    let delay = self.config.backoff.next_delay(iteration);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    p.loop_state = p.loop_state.resume();
                }
                StopDecision::AskHuman { .. } => match self.escalate(&mut p, decision).await {
                    Escalation::Continue => continue,
                    Escalation::Stop(result) => return result,
                },
                StopDecision::Aborted { reason } => {
                    self.delete(&p.state).await;
                    return p.result(TaskStatus::Aborted).with_reason(reason);
                }
            }
        }
    }

    async fn load_or_start(&self, task: &Task, worker: Option<WorkerId>) -> IterationState {
        match self.ctx.checkpoints.load(&task.id).await {
            Ok(Some(mut state)) => {
                state.max_iterations = state.max_iterations.max(task.max_iterations);
                state.worker = worker;
                tracing::info!(task_id = %task.id, iteration = state.iteration, "resuming from checkpoint");
                state
            }
            Ok(None) => IterationState::fresh(task, worker, self.ctx.clock.now()),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "unreadable checkpoint, starting over");
                IterationState::fresh(task, worker, self.ctx.clock.now())
            }
        }
    }

    async fn verify(
        &self,
        task: &Task,
        files: &[String],
        key: &BreakerKey,
        cancel: &CancellationToken,
    ) -> VerifyStatus {
        let governance = &self.ctx.governance;
        let max_files = governance.max_files_per_iteration();
        if files.len() > max_files {
            return VerifyStatus::Verdict(Verdict::blocked(format!(
                "governance: too many files ({} > {max_files})",
                files.len()
            )));
        }
        if !governance.is_action_allowed("verify") {
            return VerifyStatus::Verdict(
                Verdict::fail().with_summary("governance: verification not allowed"),
            );
        }
        if let Err(e) = self.ctx.breakers.check(key) {
            return VerifyStatus::Failed(e.to_string());
        }

        let request = VerifyRequest {
            project: self.config.project.clone(),
            task_id: task.id.clone(),
            changed_files: files.to_vec(),
            session_id: self.config.session_id.clone(),
            baseline: self.config.baseline.clone(),
        };
        let verified = tokio::select! {
            biased;
            _ = cancel.cancelled() => return VerifyStatus::Failed("cancelled".into()),
            r = tokio::time::timeout(self.config.verify_timeout, self.verifier.verify(&request)) => r,
        };
        match verified {
            Ok(Ok(verdict)) => {
                self.ctx.breakers.record_success(key);
                VerifyStatus::Verdict(verdict)
            }
            Ok(Err(e)) => {
                self.ctx.breakers.record_failure(key);
                VerifyStatus::Failed(e.to_string())
            }
            Err(_) => {
                self.ctx.breakers.record_failure(key);
                VerifyStatus::Failed(format!("timed out after {:?}", self.config.verify_timeout))
            }
        }
    }

    async fn revert(&self, task: &Task, files: &[String]) -> crate::domain::Result<()> {
        match &self.ctx.reverter {
            Some(reverter) => reverter.revert(&task.id, files).await,
            None => Err(WardenError::Config("no reverter configured".into())),
        }
    }

    /// ASK_HUMAN を gate で解決する
    async fn escalate(&self, p: &mut Progress, decision: StopDecision) -> Escalation {
        let reason = decision.reason().unwrap_or("human review requested").to_string();
        let Some(gate) = &self.ctx.human_gate else {
            return Escalation::Stop(p.result(TaskStatus::Blocked).with_reason(reason));
        };

        let context = TerminalContext {
            task_id: p.state.task_id.clone(),
            iteration: p.state.iteration,
            max_iterations: p.state.max_iterations,
            reason: reason.clone(),
        };
        match gate.decide(&context).await {
            HumanDecision::Approve { extend_by } => {
                let base = p.state.max_iterations.max(p.state.iteration);
                p.state.max_iterations = base + extend_by.max(1);
                tracing::info!(
                    task_id = %p.state.task_id,
                    max = p.state.max_iterations,
                    "human approved more iterations"
                );
                self.save(&p.state).await;
                p.loop_state = p.loop_state.resume();
                Escalation::Continue
            }
            HumanDecision::Abort => {
                let aborted = StopDecision::aborted(format!("human aborted: {reason}"));
                self.record(&p.state, &aborted, None, Vec::new()).await;
                self.delete(&p.state).await;
                p.loop_state = LoopState::Aborted;
                Escalation::Stop(p.result(TaskStatus::Aborted).with_reason(aborted.reason().unwrap_or_default()))
            }
            HumanDecision::Defer => {
                Escalation::Stop(p.result(TaskStatus::Blocked).with_reason(reason))
            }
        }
    }

    /// breaker か呼び出しメーターによる事前チェックの失敗
    async fn refuse(&self, p: &mut Progress, error: WardenError) -> TerminalResult {
        match error {
            WardenError::KillSwitchActive { mode } => {
                self.abort(p, &format!("kill switch {mode}")).await
            }
            other => self.hold(p, StopDecision::ask_human(other.to_string())).await,
        }
    }

    /// iteration を実行せずに BLOCKED で停止し、チェックポイントは残す
    async fn hold(&self, p: &mut Progress, decision: StopDecision) -> TerminalResult {
        tracing::warn!(
            task_id = %p.state.task_id,
            iteration = p.state.iteration,
            reason = decision.reason().unwrap_or(""),
            "loop held before iteration"
        );
        self.save(&p.state).await;
        self.record(&p.state, &decision, None, Vec::new()).await;
        p.loop_state = p.loop_state.on_decision(&decision);
        let reason = decision.reason().unwrap_or_default().to_string();
        p.result(TaskStatus::Blocked).with_reason(reason)
    }

    async fn abort(&self, p: &mut Progress, reason: &str) -> TerminalResult {
        let decision = StopDecision::aborted(reason);
        tracing::warn!(task_id = %p.state.task_id, iteration = p.state.iteration, reason, "loop aborted");
        self.record(&p.state, &decision, None, Vec::new()).await;
        self.delete(&p.state).await;
        p.loop_state = p.loop_state.on_decision(&decision);
        p.result(TaskStatus::Aborted).with_reason(reason)
    }

    async fn save(&self, state: &IterationState) {
        if let Err(e) = self.ctx.checkpoints.save(state).await {
            tracing::warn!(task_id = %state.task_id, error = %e, "failed to save checkpoint");
        }
    }

    async fn delete(&self, state: &IterationState) {
        if let Err(e) = self.ctx.checkpoints.delete(&state.task_id).await {
            tracing::warn!(task_id = %state.task_id, error = %e, "failed to delete checkpoint");
        }
    }

    async fn record(
        &self,
        state: &IterationState,
        decision: &StopDecision,
        verdict: Option<crate::domain::VerdictKind>,
        files: Vec<String>,
    ) {
        let entry = AuditEntry::new(
            state.task_id.clone(),
            state.iteration,
            decision,
            verdict,
            files,
            self.ctx.clock.now(),
        );
        if let Err(e) = self.ctx.audit.append(entry).await {
            tracing::warn!(task_id = %state.task_id, error = %e, "failed to append audit entry");
        }
    }
}

fn resource_hold(limits: &LimitCheck) -> StopDecision {
    StopDecision::ask_human(format!("resource limit exceeded: {}", limits.reasons.join("; ")))
}
