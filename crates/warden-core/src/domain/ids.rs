//! ドメイン識別子（型付き ID）
//!
//! プロセス内で採番する ID（worker、commit リクエスト）は ULID を
//! phantom 型付きの `Id<T>` で包む。実行時コストなしで `WorkerId` を
//! `CommitId` の位置に渡すミスを防ぐ。
//!
//! タスク ID は外部のタスクキューが決めるので、ただの文字列
//! （[`TaskId`](super::task::TaskId) を参照）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// ID の種類ごとのマーカー trait
///
/// `Display` で使うプレフィックス（"worker-", "commit-"）を提供する
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ULID ベースの汎用 ID
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー
// ========================================

/// worker スロットのマーカー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// commit リクエストのマーカー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Commit {}

impl IdMarker for Commit {
    fn prefix() -> &'static str {
        "commit-"
    }
}

/// worker（実行中の iteration loop 1 つ）の識別子
pub type WorkerId = Id<Worker>;

/// commit queue に投入したリクエストの識別子
pub type CommitId = Id<Commit>;
