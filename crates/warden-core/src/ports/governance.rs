//! GovernanceContract port - ループに許す操作のプロジェクト単位の制限

/// 検証の前に参照するプロジェクトのルール
pub trait GovernanceContract: Send + Sync {
    /// 例: "verify", "commit", "deploy"
    fn is_action_allowed(&self, action: &str) -> bool;

    fn max_files_per_iteration(&self) -> usize;

    fn max_lines_per_iteration(&self) -> usize;
}
