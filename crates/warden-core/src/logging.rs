//! warden-core を組み込むバイナリ向けの診断トレース
//!
//! 判断の永続的な記録は監査ジャーナル。こちらはオペレータ向けの stderr 出力で、
//! `RUST_LOG` でフィルタする

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// グローバルな subscriber を設定する
///
/// `RUST_LOG` を読み、デフォルトは `warn`。stderr に compact 形式で出力する。
/// 2 回目以降の呼び出しは何もしない
///
/// ```bash
/// RUST_LOG=warden_core=info warden-cli warden.toml
/// ```
pub fn init() {
    init_with_default("warn");
}

/// [`init`] と同じだが、フォールバックのフィルタを指定する
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
