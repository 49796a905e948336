//! Guard - リソースの guardrail
//!
//! - [`CircuitBreaker`] / [`BreakerRegistry`]: (agent, target) ごとの連続失敗 breaker
//! - [`MeteredBreaker`]: セッションあたりのエージェント呼び出しの上限
//! - [`ResourceTracker`]: 警告付きのセッション / 日次使用量（永続化）

pub mod breaker;
pub mod metered;
pub mod registry;
pub mod resources;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use metered::MeteredBreaker;
pub use registry::{BreakerKey, BreakerRegistry};
pub use resources::{LimitCheck, ResourceLimits, ResourceTracker, ResourceUsage};
