//! AtomicKillSwitch - オペレータのハンドルで切り替えるプロセス内 kill switch

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::ports::{KillSwitch, KillSwitchMode};

/// 1 バイトの atomic で持つ kill switch。clone は状態を共有する
#[derive(Debug, Clone)]
pub struct AtomicKillSwitch {
    mode: Arc<AtomicU8>,
}

impl AtomicKillSwitch {
    pub fn new(mode: KillSwitchMode) -> Self {
        Self {
            mode: Arc::new(AtomicU8::new(encode(mode))),
        }
    }

    pub fn set(&self, mode: KillSwitchMode) {
        tracing::warn!(mode = %mode, "kill switch mode changed");
        self.mode.store(encode(mode), Ordering::SeqCst);
    }
}

impl Default for AtomicKillSwitch {
    fn default() -> Self {
        Self::new(KillSwitchMode::Normal)
    }
}

impl KillSwitch for AtomicKillSwitch {
    fn mode(&self) -> KillSwitchMode {
        decode(self.mode.load(Ordering::SeqCst))
    }
}

fn encode(mode: KillSwitchMode) -> u8 {
    match mode {
        KillSwitchMode::Off => 0,
        KillSwitchMode::Safe => 1,
        KillSwitchMode::Normal => 2,
        KillSwitchMode::Paused => 3,
    }
}

fn decode(raw: u8) -> KillSwitchMode {
    match raw {
        0 => KillSwitchMode::Off,
        1 => KillSwitchMode::Safe,
        2 => KillSwitchMode::Normal,
        _ => KillSwitchMode::Paused,
    }
}
