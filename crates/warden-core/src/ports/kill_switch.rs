//! KillSwitch port - 実行中の全ループに対するオペレータの制御

use serde::{Deserialize, Serialize};
use std::fmt;

/// オペレータが設定する動作モード
///
/// - `Normal`: すべて実行
/// - `Safe`: 実行するが、guardrail 違反は必ず人間に回す
/// - `Paused` / `Off`: 次のチェックで ABORTED に巻き戻す
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchMode {
    Off,
    Safe,
    #[default]
    Normal,
    Paused,
}

impl KillSwitchMode {
    pub fn halts(self) -> bool {
        matches!(self, KillSwitchMode::Off | KillSwitchMode::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KillSwitchMode::Off => "off",
            KillSwitchMode::Safe => "safe",
            KillSwitchMode::Normal => "normal",
            KillSwitchMode::Paused => "paused",
        }
    }
}

impl fmt::Display for KillSwitchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 各 iteration の先頭と各 breaker チェックの中で読まれるので、
/// 軽量かつノンブロッキングであること
pub trait KillSwitch: Send + Sync {
    fn mode(&self) -> KillSwitchMode;
}
