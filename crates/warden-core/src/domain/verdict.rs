//! Verdict モデル - 検証 oracle が変更セットをどう判定したか
//!
//! oracle 本体は外部にある。このモジュールは stop hook が判断に写像できるよう
//! 回答の形だけを定義する。

use serde::{Deserialize, Serialize};

/// oracle が返す分類
///
/// SCREAMING_SNAKE_CASE でシリアライズ: PASS / FAIL / BLOCKED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Pass,
    Fail,
    /// guardrail 違反。人間か設定済みポリシーの判断が必要
    Blocked,
}

/// 変更ファイル集合に対する oracle の回答
///
/// - `PASS`: チェック通過
/// - `FAIL`: チェック失敗。`safe_to_merge` は許容できる失敗か
///   （既存の失敗で、退行していない）を示す
/// - `BLOCKED`: 譲れないポリシー違反
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,

    #[serde(default)]
    pub safe_to_merge: bool,

    #[serde(default)]
    pub regression_detected: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            kind: VerdictKind::Pass,
            safe_to_merge: true,
            regression_detected: false,
            summary: None,
        }
    }

    pub fn fail() -> Self {
        Self {
            kind: VerdictKind::Fail,
            safe_to_merge: false,
            regression_detected: false,
            summary: None,
        }
    }

    pub fn blocked(summary: impl Into<String>) -> Self {
        Self {
            kind: VerdictKind::Blocked,
            safe_to_merge: false,
            regression_detected: false,
            summary: Some(summary.into()),
        }
    }

    pub fn with_safe_to_merge(mut self, safe: bool) -> Self {
        self.safe_to_merge = safe;
        self
    }

    pub fn with_regression(mut self, regression: bool) -> Self {
        self.regression_detected = regression;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// 監査の理由に使う短い説明
    pub fn describe(&self) -> String {
        let kind = match self.kind {
            VerdictKind::Pass => "PASS",
            VerdictKind::Fail => "FAIL",
            VerdictKind::Blocked => "BLOCKED",
        };
        match &self.summary {
            Some(summary) => format!("{kind}: {summary}"),
            None if self.regression_detected => format!("{kind}: regression detected"),
            None => kind.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_kind_serializes_as_required_names() {
        assert_eq!(serde_json::to_string(&VerdictKind::Pass).unwrap(), "\"PASS\"");
        assert_eq!(serde_json::to_string(&VerdictKind::Fail).unwrap(), "\"FAIL\"");
        assert_eq!(
            serde_json::to_string(&VerdictKind::Blocked).unwrap(),
            "\"BLOCKED\""
        );
    }

    #[test]
    fn verdict_from_oracle_json_uses_defaults() {
        let v: Verdict = serde_json::from_str(r#"{ "kind": "FAIL" }"#).unwrap();
        assert_eq!(v.kind, VerdictKind::Fail);
        assert!(!v.safe_to_merge);
        assert!(!v.regression_detected);
    }

    #[test]
    fn describe_mentions_regression() {
        let v = Verdict::fail().with_regression(true);
        assert_eq!(v.describe(), "FAIL: regression detected");
        assert_eq!(Verdict::blocked("secret in diff").describe(), "BLOCKED: secret in diff");
    }
}
