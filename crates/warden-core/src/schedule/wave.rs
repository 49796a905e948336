//! Wave 計画 - タスクを衝突のないバッチに分ける
//!
//! # アルゴリズム
//! 新しい wave を開き、残りのタスクを入力順に走査して、次の条件を満たす
//! タスクを受け入れる。これを繰り返す
//! - ファイルが wave 内で確保済みのどのファイルとも重ならない
//! - 各依存が前の（閉じた）wave か、呼び出し側の `completed` に含まれる
//!
//! 1 つの wave は最大 `max_parallel` タスク。あふれた分は入力順のまま後の
//! wave に回る。新しい wave が何も受け入れなくなったら計画を終え、残りは
//! `unscheduled`（循環、未知の依存）になる

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::{Task, TaskId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WavePlan {
    pub waves: Vec<Vec<TaskId>>,
    pub unscheduled: Vec<TaskId>,
}

impl WavePlan {
    pub fn scheduled_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn first_wave(&self) -> Option<&[TaskId]> {
        self.waves.first().map(Vec::as_slice)
    }
}

pub fn plan_waves(tasks: &[Task], max_parallel: usize) -> WavePlan {
    plan_waves_with_completed(tasks, &HashSet::new(), max_parallel)
}

/// [`plan_waves`] と同じだが、`completed` の ID を満たされた依存として数える
pub fn plan_waves_with_completed(
    tasks: &[Task],
    completed: &HashSet<TaskId>,
    max_parallel: usize,
) -> WavePlan {
    let cap = max_parallel.max(1);
    let mut satisfied: HashSet<TaskId> = completed.clone();
    let mut remaining: Vec<&Task> = tasks.iter().collect();
    let mut waves = Vec::new();

    loop {
        let mut wave: Vec<TaskId> = Vec::new();
        let mut claimed: BTreeSet<&str> = BTreeSet::new();
        let mut deferred: Vec<&Task> = Vec::with_capacity(remaining.len());

        for task in remaining {
            let fits = wave.len() < cap
                && task.files.iter().all(|f| !claimed.contains(f.as_str()))
                && task.depends_on.iter().all(|d| satisfied.contains(d));
            if fits {
                claimed.extend(task.files.iter().map(String::as_str));
                wave.push(task.id.clone());
            } else {
                deferred.push(task);
            }
        }
        remaining = deferred;

        if wave.is_empty() {
            break;
        }
        satisfied.extend(wave.iter().cloned());
        waves.push(wave);
    }

    WavePlan {
        waves,
        unscheduled: remaining.into_iter().map(|t| t.id.clone()).collect(),
    }
}
