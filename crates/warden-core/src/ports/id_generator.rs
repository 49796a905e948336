//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース。タイムスタンプは [`Clock`] から取る

use crate::domain::ids::{CommitId, WorkerId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は worker と commit リクエストの ID を生成する
///
/// # ULID の特性
/// - 生成時刻でソート可能
/// - 調整不要
/// 128 ビット
pub trait IdGenerator: Send + Sync {
    fn generate_worker_id(&self) -> WorkerId;

    fn generate_commit_id(&self) -> CommitId;
}

/// Clock で駆動する ULID 生成器
///
/// FixedClock を使うとタイムスタンプ部分が決定的になり、ID でソートする
/// テストが安定する
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_worker_id(&self) -> WorkerId {
        WorkerId::from(self.next_ulid())
    }

    fn generate_commit_id(&self) -> CommitId {
        CommitId::from(self.next_ulid())
    }
}
