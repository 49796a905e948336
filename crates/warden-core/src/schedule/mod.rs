//! Schedule - wave の計画と並行数を制限した実行

pub mod dependency;
pub mod pool;
pub mod wave;

pub use dependency::DependencyGraph;
pub use pool::WorkerPool;
pub use wave::{WavePlan, plan_waves, plan_waves_with_completed};
