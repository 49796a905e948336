//! ユニットテストで共有するテストダブル

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::app::LoopContext;
use crate::domain::{Result, TaskId, Verdict, WardenError};
use crate::impls::{AtomicKillSwitch, InMemoryAuditSink, InMemoryCheckpointStore};
use crate::ports::{
    AgentInvoker, AgentOutput, AgentRequest, CommitOutcome, CommitRequest, Finalizer,
    HumanDecision, HumanGate, Reverter, SystemClock, TerminalContext, Verifier, VerifyRequest,
};

/// スクリプト化したエージェントの応答 1 件
#[derive(Debug, Clone)]
pub enum Step {
    Output(AgentOutput),
    Fail(String),
    /// リトライしても回復しないエージェントのエラー
    Reject(String),
    Slow(Duration, AgentOutput),
}

impl Step {
    pub fn output(out: AgentOutput) -> Self {
        Step::Output(out)
    }

    pub fn fail(reason: &str) -> Self {
        Step::Fail(reason.to_string())
    }

    pub fn reject(reason: &str) -> Self {
        Step::Reject(reason.to_string())
    }

    pub fn slow(delay: Duration, out: AgentOutput) -> Self {
        Step::Slow(delay, out)
    }
}

type CallHook = Box<dyn Fn(u32) + Send + Sync>;

/// ステップを順に再生し、最後のものを繰り返すエージェント
pub struct ScriptedAgent {
    steps: StdMutex<VecDeque<Step>>,
    last: StdMutex<Option<Step>>,
    requests: StdMutex<Vec<AgentRequest>>,
    calls: AtomicU32,
    hook: Option<CallHook>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: StdMutex::new(steps.into()),
            last: StdMutex::new(None),
            requests: StdMutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            hook: None,
        }
    }

    pub fn repeating(step: Step) -> Self {
        Self::new(vec![step])
    }

    /// 毎回の呼び出しの最初に `hook(call_number)` を実行する
    pub fn on_call(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        let next = self.steps.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(step) = next {
            *last = Some(step);
        }
        last.clone().unwrap_or(Step::Output(AgentOutput::default()))
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        if let Some(hook) = &self.hook {
            hook(n);
        }
        match self.next_step() {
            Step::Output(out) => Ok(out),
            Step::Fail(reason) => Err(WardenError::Agent(reason)),
            Step::Reject(reason) => Err(WardenError::AgentRejected(reason)),
            Step::Slow(delay, out) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
        }
    }
}

/// verdict を順に再生し、最後のものを繰り返す verifier
pub struct ScriptedVerifier {
    verdicts: StdMutex<VecDeque<Verdict>>,
    last: StdMutex<Verdict>,
    calls: AtomicU32,
}

impl ScriptedVerifier {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts: StdMutex::new(verdicts.into()),
            last: StdMutex::new(Verdict::pass()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn passing() -> Self {
        Self::new(vec![Verdict::pass()])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, _request: &VerifyRequest) -> Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.verdicts.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(verdict) = next {
            *last = verdict;
        }
        Ok(last.clone())
    }
}

/// 受け取ったリクエストをすべて記録する finalizer
#[derive(Default)]
pub struct RecordingFinalizer {
    applied: Mutex<Vec<CommitRequest>>,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl RecordingFinalizer {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub async fn applied(&self) -> Vec<CommitRequest> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl Finalizer for RecordingFinalizer {
    async fn apply(&self, request: &CommitRequest) -> Result<CommitOutcome> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(WardenError::Commit(reason.clone()));
        }
        self.applied.lock().await.push(request.clone());
        if request.payload.changed_files.is_empty() {
            Ok(CommitOutcome::NothingToApply)
        } else {
            Ok(CommitOutcome::Applied)
        }
    }
}

#[derive(Default)]
pub struct RecordingReverter {
    reverted: Mutex<Vec<String>>,
}

impl RecordingReverter {
    pub async fn reverted(&self) -> Vec<String> {
        self.reverted.lock().await.clone()
    }
}

#[async_trait]
impl Reverter for RecordingReverter {
    async fn revert(&self, _task_id: &TaskId, files: &[String]) -> Result<()> {
        self.reverted.lock().await.extend(files.iter().cloned());
        Ok(())
    }
}

/// 常に同じ回答を返す human gate
pub struct FixedGate {
    answer: HumanDecision,
    calls: AtomicU32,
}

impl FixedGate {
    pub fn new(answer: HumanDecision) -> Self {
        Self {
            answer,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HumanGate for FixedGate {
    async fn decide(&self, _context: &TerminalContext) -> HumanDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

/// ストアへのハンドル付きのインメモリなループのコンテキスト
pub struct TestHarness {
    pub ctx: LoopContext,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub audit: Arc<InMemoryAuditSink>,
    pub switch: AtomicKillSwitch,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_switch(AtomicKillSwitch::default())
    }

    pub fn with_switch(switch: AtomicKillSwitch) -> Self {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let mut ctx = LoopContext::in_memory(Arc::new(SystemClock), Arc::new(switch.clone()));
        ctx.checkpoints = checkpoints.clone();
        ctx.audit = audit.clone();
        Self {
            ctx,
            checkpoints,
            audit,
            switch,
        }
    }
}
