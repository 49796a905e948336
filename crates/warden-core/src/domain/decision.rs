//! Decision モデル - iteration 後に stop hook が何をするか
//!
//! 次の行動を表す StopDecision、hook が参照する Evaluation、
//! 前者から後者を導く Decider trait を定義します。
//!
//! # 設計
//!
//! 判断は純粋関数です。iteration loop が事実（シグナル、予算、変更ファイル、
//! verdict）を集めて Decider に渡します。未取得の verdict が必要なら
//! Decider は [`Transition::NeedsVerdict`] を返し、loop が oracle を呼んで
//! もう一度問い合わせます。ここでは I/O を行いません。

use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::verdict::{Verdict, VerdictKind};

/// 1 iteration に対する stop hook の回答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopDecision {
    /// タスクを正常に停止させる
    ///
    /// non-interactive ポリシーで guardrail 違反を revert した場合は
    /// `reverted` が立つ
    Allow { reverted: bool },

    /// iteration を続ける
    Block { reason: String },

    /// 停止して人間を待つ
    AskHuman { reason: String },

    /// 即時停止（kill switch / 明示的な中断）
    Aborted { reason: String },
}

impl StopDecision {
    pub fn allow() -> Self {
        StopDecision::Allow { reverted: false }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        StopDecision::Block {
            reason: reason.into(),
        }
    }

    pub fn ask_human(reason: impl Into<String>) -> Self {
        StopDecision::AskHuman {
            reason: reason.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        StopDecision::Aborted {
            reason: reason.into(),
        }
    }

    /// 監査ログとログ出力で使う名前
    pub fn label(&self) -> &'static str {
        match self {
            StopDecision::Allow { .. } => "ALLOW",
            StopDecision::Block { .. } => "BLOCK",
            StopDecision::AskHuman { .. } => "ASK_HUMAN",
            StopDecision::Aborted { .. } => "ABORTED",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            StopDecision::Allow { .. } => None,
            StopDecision::Block { reason }
            | StopDecision::AskHuman { reason }
            | StopDecision::Aborted { reason } => Some(reason),
        }
    }
}

/// 誰も見ていないときに BLOCKED verdict をどう扱うか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailPolicy {
    /// 人間にエスカレーション
    #[default]
    AskHuman,
    /// 変更を revert し、違反をログに残してタスクを停止させる
    AutoRevert,
}

/// 今回の iteration の検証状況
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyStatus {
    NotRun,
    Verdict(Verdict),
    /// oracle がエラーまたはタイムアウト
    Failed(String),
}

/// stop hook が判断に使う事実
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub iteration: u32,
    pub max_iterations: u32,
    pub signal_seen: bool,
    pub changed_files: usize,
    /// 今回の iteration のエージェントのエラー / タイムアウト
    pub agent_failure: Option<String>,
    /// `agent_failure` の分類
    pub failure_kind: Option<ErrorKind>,
    pub verify: VerifyStatus,
    pub policy: GuardrailPolicy,
}

impl Evaluation {
    pub fn new(iteration: u32, max_iterations: u32) -> Self {
        Self {
            iteration,
            max_iterations,
            signal_seen: false,
            changed_files: 0,
            agent_failure: None,
            failure_kind: None,
            verify: VerifyStatus::NotRun,
            policy: GuardrailPolicy::AskHuman,
        }
    }
}

/// Decider への問い合わせ結果
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Decided(StopDecision),
    /// 変更ファイルの verdict を取得してから再判断する
    NeedsVerdict,
}

/// stop hook の判断を行う trait
///
/// Decider は副作用を持たない。evaluation を受け取り次の行動を返すだけ
pub trait Decider: Send + Sync {
    fn decide(&self, eval: &Evaluation) -> Transition;
}

/// デフォルトの stop hook
///
/// ルール（先に一致したものを採用）:
/// 1. promise トークンあり -> ALLOW
/// 2. 予算切れ -> ASK_HUMAN
/// 3. エージェント失敗 -> BLOCK（リトライで直らない場合は ASK_HUMAN）
/// 4. 変更なし -> BLOCK
/// 5. verdict: PASS -> ALLOW, BLOCKED -> ASK_HUMAN（AutoRevert では
///    ALLOW reverted）, FAIL で safe_to_merge -> ALLOW, それ以外の FAIL -> BLOCK
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(&self, eval: &Evaluation) -> Transition {
        if eval.signal_seen && eval.agent_failure.is_none() {
            return Transition::Decided(StopDecision::allow());
        }

        if eval.iteration >= eval.max_iterations {
            return Transition::Decided(StopDecision::ask_human(format!(
                "budget exhausted: {}/{} iterations",
                eval.iteration, eval.max_iterations
            )));
        }

        if let Some(err) = &eval.agent_failure {
            let decision = match eval.failure_kind {
                Some(ErrorKind::Permanent) => {
                    StopDecision::ask_human(format!("agent failed permanently: {err}"))
                }
                _ => StopDecision::block(format!("agent failed: {err}")),
            };
            return Transition::Decided(decision);
        }

        if eval.changed_files == 0 {
            return Transition::Decided(StopDecision::block("no observable progress"));
        }

        let verdict = match &eval.verify {
            VerifyStatus::NotRun => return Transition::NeedsVerdict,
            VerifyStatus::Failed(err) => {
                return Transition::Decided(StopDecision::block(format!(
                    "verification unavailable: {err}"
                )));
            }
            VerifyStatus::Verdict(v) => v,
        };

        let decision = match verdict.kind {
            VerdictKind::Pass => StopDecision::allow(),
            VerdictKind::Blocked => match eval.policy {
                GuardrailPolicy::AskHuman => {
                    StopDecision::ask_human(format!("guardrail violation: {}", verdict.describe()))
                }
                GuardrailPolicy::AutoRevert => StopDecision::Allow { reverted: true },
            },
            VerdictKind::Fail if verdict.safe_to_merge => StopDecision::allow(),
            VerdictKind::Fail => StopDecision::block(format!(
                "verification failed: {}",
                verdict.describe()
            )),
        };
        Transition::Decided(decision)
    }
}

/// 1 つの iteration loop の明示的な状態
///
/// Running -> BlockedRetry -> Running ... -> {Allowed, AskHuman, Aborted}.
/// 3 つの終端状態は固定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Running,
    BlockedRetry,
    AskHuman,
    Allowed,
    Aborted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::AskHuman | LoopState::Allowed | LoopState::Aborted)
    }

    /// stop decision を適用する
    pub fn on_decision(self, decision: &StopDecision) -> LoopState {
        if self.is_terminal() {
            return self;
        }
        match decision {
            StopDecision::Allow { .. } => LoopState::Allowed,
            StopDecision::Block { .. } => LoopState::BlockedRetry,
            StopDecision::AskHuman { .. } => LoopState::AskHuman,
            StopDecision::Aborted { .. } => LoopState::Aborted,
        }
    }

    /// BLOCK の後、または人間が予算を追加した後に次の iteration を始める
    pub fn resume(self) -> LoopState {
        match self {
            LoopState::BlockedRetry | LoopState::AskHuman => LoopState::Running,
            other => other,
        }
    }
}
