//! Ports - 抽象化レイヤー
//!
//! 各 trait はオーケストレータの外部（エージェント、検証 oracle、オペレータ、
//! 永続ストレージ）との境目。core はこれらの trait だけを使い、
//! `impls` にプロセス内のデフォルト実装を置く

pub mod agent;
pub mod audit_sink;
pub mod checkpoint_store;
pub mod clock;
pub mod finalizer;
pub mod governance;
pub mod human_gate;
pub mod id_generator;
pub mod kill_switch;
pub mod verifier;

pub use self::agent::{AgentInvoker, AgentOutput, AgentRequest};
pub use self::audit_sink::AuditSink;
pub use self::checkpoint_store::CheckpointStore;
pub use self::clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use self::finalizer::{CommitOutcome, CommitPayload, CommitRequest, Finalizer};
pub use self::governance::GovernanceContract;
pub use self::human_gate::{HumanDecision, HumanGate, TerminalContext};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::kill_switch::{KillSwitch, KillSwitchMode};
pub use self::verifier::{Reverter, Verifier, VerifyRequest};
