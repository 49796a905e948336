use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// エージェントに出力させるデフォルトの完了トークン
pub const DEFAULT_COMPLETION_TOKEN: &str = "COMPLETE";

/// タスクごとのデフォルトの iteration 予算
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// タスク ID（外部のタスクキューが採番する）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// タスクのライフサイクル
///
/// 状態遷移:
/// - Pending -> InProgress -> Completed
/// - Pending -> InProgress -> Blocked（人間のレビュー待ち）
/// - Pending -> InProgress -> Aborted（kill switch / 明示的な中断）
/// - Pending -> InProgress -> Reverted（guardrail 違反を自動 revert）
/// - InProgress -> Pending（ロック競合、スケジューラに差し戻し）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Aborted,
    Reverted,
}

impl TaskStatus {
    /// 終端状態か（以降の遷移なし）
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Blocked | TaskStatus::Aborted | TaskStatus::Reverted
        )
    }

    /// 依存タスクを先に進めてよい終端状態
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Reverted)
    }
}

/// 1 つの iteration loop に渡す作業単位
///
/// `files` は宣言された書き込み対象で、wave スケジューラとファイルロックが
/// 使います。`./src/a.rs` と `src/a.rs` が衝突するよう、builder でも
/// デシリアライズでもパスを正規化します。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,

    #[serde(default, deserialize_with = "normalized_files")]
    pub files: BTreeSet<String>,

    #[serde(default)]
    pub depends_on: Vec<TaskId>,

    #[serde(default = "default_token")]
    pub completion_token: String,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// 対象リポジトリ。(agent, repo) ごとの circuit breaker のキーになる
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    #[serde(default = "default_status")]
    pub status: TaskStatus,
}

fn default_token() -> String {
    DEFAULT_COMPLETION_TOKEN.to_string()
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

fn normalized_files<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(raw
        .iter()
        .map(|path| normalize_path(path))
        .filter(|path| !path.is_empty())
        .collect())
}

impl Task {
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            files: BTreeSet::new(),
            depends_on: Vec::new(),
            completion_token: default_token(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            repo: None,
            status: TaskStatus::Pending,
        }
    }

    pub fn with_file(mut self, path: impl AsRef<str>) -> Self {
        self.files.insert(normalize_path(path.as_ref()));
        self
    }

    pub fn with_files<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            self.files.insert(normalize_path(path.as_ref()));
        }
        self
    }

    pub fn with_dependency(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.completion_token = token.into();
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    /// `next` に遷移する
    ///
    /// すでに終端状態なら何もせず `false` を返す
    pub fn transition_to(&mut self, next: TaskStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        true
    }

    /// 書き込み対象が `other` と重なるか
    pub fn conflicts_with(&self, other: &Task) -> bool {
        !self.files.is_disjoint(&other.files)
    }
}

/// ロックキーと衝突判定のためにワークスペース相対パスを正規化
///
/// 前後の空白を除き、`\` を `/` に揃え、`./` を落とし、連続する区切りを
/// まとめる
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        segments.push(segment);
    }
    let joined = segments.join("/");
    if unified.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}
