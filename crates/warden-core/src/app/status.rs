//! Status - タスクごとと全体の実行結果

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskStatus, TerminalResult};
use crate::guard::{BreakerSnapshot, ResourceUsage};
use crate::ports::CommitOutcome;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub completed: usize,
    pub reverted: usize,
    pub blocked: usize,
    pub aborted: usize,
    pub unscheduled: usize,
}

/// スケジューラが実行しなかったタスクとその理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unscheduled {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub session_id: String,
    pub waves: usize,
    /// タスクが wave を終えた順の終端結果
    pub results: Vec<TerminalResult>,
    pub unscheduled: Vec<Unscheduled>,
    pub commits: BTreeMap<TaskId, CommitOutcome>,
    pub swept_workers: usize,
    pub breakers: Vec<BreakerSnapshot>,
    pub usage: ResourceUsage,
}

impl RunReport {
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts {
            unscheduled: self.unscheduled.len(),
            ..StatusCounts::default()
        };
        for result in &self.results {
            match result.status {
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Reverted => counts.reverted += 1,
                TaskStatus::Aborted => counts.aborted += 1,
                TaskStatus::Blocked | TaskStatus::Pending | TaskStatus::InProgress => {
                    counts.blocked += 1
                }
            }
        }
        counts
    }

    pub fn result(&self, task_id: &TaskId) -> Option<&TerminalResult> {
        self.results.iter().find(|r| &r.task_id == task_id)
    }

    /// 全タスクが成功し、何も残っていない
    pub fn all_succeeded(&self) -> bool {
        self.unscheduled.is_empty()
            && self
                .results
                .iter()
                .all(|r| r.status.satisfies_dependents())
    }
}
