//! Errors - エラー型と運用上の分類

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// エラーの運用上の分類
///
/// - Transient: リトライで直る可能性がある（エージェントのタイムアウト、oracle の一時障害）
/// - Permanent: リトライしても無駄（kill switch、呼び出し上限、エージェントの拒否、不正な設定）
/// - Infrastructure: ローカルディスク / シリアライズの問題
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// warden-core が返すエラー
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("kill switch active (mode: {mode})")]
    KillSwitchActive { mode: String },

    #[error("circuit breaker open for {key}")]
    CircuitBreakerTripped { key: String },

    #[error("call limit reached: {calls}/{max} calls this session")]
    CallLimitReached { calls: u64, max: u64 },

    #[error("agent timed out after {after:?}")]
    AgentTimeout { after: Duration },

    #[error("agent error: {0}")]
    Agent(String),

    #[error("agent rejected the request: {0}")]
    AgentRejected(String),

    #[error("verifier error: {0}")]
    Verifier(String),

    #[error("commit error: {0}")]
    Commit(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

impl WardenError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WardenError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenError::AgentTimeout { .. }
            | WardenError::Agent(_)
            | WardenError::Verifier(_)
            | WardenError::CircuitBreakerTripped { .. } => ErrorKind::Transient,
            WardenError::KillSwitchActive { .. }
            | WardenError::AgentRejected(_)
            | WardenError::CallLimitReached { .. }
            | WardenError::Config(_) => ErrorKind::Permanent,
            WardenError::Commit(_)
            | WardenError::Io { .. }
            | WardenError::Serde(_)
            | WardenError::Toml(_)
            | WardenError::TomlSer(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T, E = WardenError> = std::result::Result<T, E>;
