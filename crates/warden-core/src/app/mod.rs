//! App - port を組み合わせて動くシステムにする
//!
//! # コンポーネント
//! - **IterationLoop**: 1 タスクの stop hook リトライループ
//! - **OrchestratorBuilder**: 配線と起動時の検証
//! - **Orchestrator**: タスク集合を wave ごとに実行
//! - **ReaperLoop**: heartbeat が途絶えた worker の掃除
//! - **RunReport**: 実行結果

pub mod builder;
pub mod iteration_loop;
pub mod orchestrator;
pub mod reaper_loop;
pub mod status;

pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::iteration_loop::{IterationLoop, LoopConfig, LoopContext};
pub use self::orchestrator::Orchestrator;
pub use self::reaper_loop::ReaperLoop;
pub use self::status::{RunReport, StatusCounts, Unscheduled};
