//! ドメインモデル（ID、タスク、verdict、stop decision、チェックポイント、監査）

pub mod attempt;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod signal;
pub mod state;
pub mod task;
pub mod verdict;

pub use attempt::AuditEntry;
pub use decision::{
    Decider, DefaultDecider, Evaluation, GuardrailPolicy, LoopState, StopDecision, Transition,
    VerifyStatus,
};
pub use errors::{ErrorKind, Result, WardenError};
pub use ids::{CommitId, Id, IdMarker, WorkerId};
pub use signal::{contains_promise, extract_promises};
pub use state::{IterationState, TerminalResult};
pub use task::{DEFAULT_COMPLETION_TOKEN, DEFAULT_MAX_ITERATIONS, Task, TaskId, TaskStatus, normalize_path};
pub use verdict::{Verdict, VerdictKind};
