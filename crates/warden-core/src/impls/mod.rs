//! Impls - port のプロセス内実装
//!
//! # 含まれるもの
//! - **InMemoryCheckpointStore / InMemoryAuditSink**: テスト、使い捨ての実行向け
//! - **AtomicKillSwitch**: 全ループで共有するオペレータのハンドル
//! - **PermissiveGovernance / StaticGovernance**: governance 契約
//! - **NoopFinalizer**: 何もしない finalizer
//!
//! ファイルベースの実装は `store` にある

pub mod finalizer;
pub mod governance;
pub mod kill_switch;
pub mod memory;

pub use self::finalizer::NoopFinalizer;
pub use self::governance::{PermissiveGovernance, StaticGovernance};
pub use self::kill_switch::AtomicKillSwitch;
pub use self::memory::{InMemoryAuditSink, InMemoryCheckpointStore};
