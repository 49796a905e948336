//! warden-core
//!
//! Warden オーケストレータのコア部品。1 つの共有ワークスペース上で、
//! エージェントが駆動する多数のタスクループを安全予算の範囲で動かす
//!
//! # モジュール
//! - **domain**: タスク、verdict、stop decision、チェックポイント、監査エントリ、エラー
//! - **ports**: 境目の async trait（エージェント、verifier、kill switch、ストア、時計）
//! - **impls**: インメモリとデフォルトの port 実装
//! - **store**: アトミックな JSON ファイル、チェックポイントストア、ジャーナル、永続カウンタ
//! - **guard**: circuit breaker とリソーストラッカー
//! - **locks**: ファイルロックと worker の登録
//! - **queue**: 直列化した commit queue とリトライのバックオフ
//! - **schedule**: wave の計画と並行数を制限した worker pool
//! - **app**: iteration loop、オーケストレータ、builder、reaper
//! - **config** / **logging**: `warden.toml` と tracing の設定

pub mod app;
pub mod config;
pub mod domain;
pub mod guard;
pub mod impls;
pub mod locks;
pub mod logging;
pub mod ports;
pub mod queue;
pub mod schedule;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
