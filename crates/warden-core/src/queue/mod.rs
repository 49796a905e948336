//! Queue モジュール - 直列化した commit queue と iteration のバックオフ

mod commit;
mod retry;

pub use commit::{CommitQueue, CommitTicket};
pub use retry::RetryPolicy;
