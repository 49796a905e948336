//! DependencyGraph - タスク ID 間の依存グラフ
//!
//! Wave プランナーは依存関係を自前で追跡します。このグラフは unscheduled に
//! なったタスクの理由（循環依存など）を説明するためだけに使います。

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Task, TaskId};

/// 依存グラフ（task -> 待っているタスク）
///
/// BTree を使うので走査順は常に決定的です。
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// 現在の DFS パス上
    Gray,
    /// 探索済み
    Black,
}

impl DependencyGraph {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut graph = Self::default();
        for task in tasks {
            for dep in &task.depends_on {
                graph.add_dependency(task.id.clone(), dep.clone());
            }
        }
        graph
    }

    /// `task` は `depends_on` を待つ
    fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
    }

    fn remove_dependency(&mut self, task: &TaskId, depends_on: &TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task.clone()) {
            e.get_mut().remove(depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// 最初に見つかった循環を、同じタスクで始まり終わるパスとして返す
    ///
    /// 彩色 DFS、O(V + E)
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: BTreeMap<TaskId, Color> = BTreeMap::new();
        let mut path: Vec<TaskId> = Vec::new();

        for start in self.edges.keys() {
            if colors.contains_key(start) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// いずれかの循環に含まれるタスクすべて
    pub fn cycle_members(&self) -> BTreeSet<TaskId> {
        let mut graph = self.clone();
        let mut members = BTreeSet::new();
        while let Some(cycle) = graph.detect_cycle() {
            let [.., from, to] = cycle.as_slice() else {
                break;
            };
            let (from, to) = (from.clone(), to.clone());
            members.extend(cycle);
            graph.remove_dependency(&from, &to);
        }
        members
    }

    fn dfs_cycle(
        &self,
        node: &TaskId,
        colors: &mut BTreeMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node.clone(), Color::Gray);
        path.push(node.clone());

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                match colors.get(dep) {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|t| t == dep).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        colors.insert(node.clone(), Color::Black);
        path.pop();
        None
    }
}
