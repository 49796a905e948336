//! Store - ローカルの永続状態
//!
//! 設定された state ディレクトリ配下のレイアウト:
//! - `iterations/<task_id>.json`: iteration チェックポイント
//! - `usage/<project>.json`: リソース使用量
//! - `counters/<name>.json`: 永続カウンタ
//! - `locks/<sha256(path)[..16]>.json`: ロックレコードのミラー
//! - `commits.jsonl`, `audit.jsonl`: 追記専用ジャーナル

pub mod checkpoint;
pub mod counter;
pub mod journal;
pub mod json;

pub use checkpoint::FileCheckpointStore;
pub use counter::DurableCounter;
pub use journal::{JournalFinalizer, JournalRecord, JsonlAuditSink};
pub use json::{read_json, remove_if_exists, write_atomic, write_json};
