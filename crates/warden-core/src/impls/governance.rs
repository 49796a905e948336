//! Governance 契約 - 何でも許すデフォルトと設定可能なもの

use std::collections::HashSet;

use crate::ports::GovernanceContract;

/// すべて許可、サイズ制限なし
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveGovernance;

impl GovernanceContract for PermissiveGovernance {
    fn is_action_allowed(&self, _action: &str) -> bool {
        true
    }

    fn max_files_per_iteration(&self) -> usize {
        usize::MAX
    }

    fn max_lines_per_iteration(&self) -> usize {
        usize::MAX
    }
}

/// 固定の上限と禁止アクションのリスト
#[derive(Debug, Clone)]
pub struct StaticGovernance {
    denied: HashSet<String>,
    max_files: usize,
    max_lines: usize,
}

impl StaticGovernance {
    pub fn new(max_files: usize, max_lines: usize) -> Self {
        Self {
            denied: HashSet::new(),
            max_files,
            max_lines,
        }
    }

    pub fn deny(mut self, action: impl Into<String>) -> Self {
        self.denied.insert(action.into());
        self
    }
}

impl GovernanceContract for StaticGovernance {
    fn is_action_allowed(&self, action: &str) -> bool {
        !self.denied.contains(action)
    }

    fn max_files_per_iteration(&self) -> usize {
        self.max_files
    }

    fn max_lines_per_iteration(&self) -> usize {
        self.max_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_governance_denies_listed_actions() {
        let g = StaticGovernance::new(3, 500).deny("verify");
        assert!(!g.is_action_allowed("verify"));
        assert!(g.is_action_allowed("commit"));
        assert_eq!(g.max_files_per_iteration(), 3);
        assert!(PermissiveGovernance.is_action_allowed("deploy"));
    }
}
