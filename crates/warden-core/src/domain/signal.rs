//! 完了シグナルの検出
//!
//! エージェントは出力のどこかに `<promise>TOKEN</promise>` を書いてタスク完了を
//! 宣言する。比較の前に中身の前後の空白を除き、連続する空白を 1 つにまとめる。
//! 比較自体は大文字小文字を区別する。

const OPEN: &str = "<promise>";
const CLOSE: &str = "</promise>";

/// 連続する空白を 1 つにまとめ、前後を trim する
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `output` 中の promise の中身をすべて、正規化して出現順に返す
///
/// 閉じられていない `<promise>` でスキャンを終える
pub fn extract_promises(output: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = output;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        found.push(normalize_whitespace(&after_open[..end]));
        rest = &after_open[end + CLOSE.len()..];
    }

    found
}

/// `output` に `token` と一致する promise があるか
pub fn contains_promise(output: &str, token: &str) -> bool {
    let wanted = normalize_whitespace(token);
    if wanted.is_empty() {
        return false;
    }
    extract_promises(output).iter().any(|p| *p == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("all good <promise>DONE</promise>", "DONE", true)]
    #[case("<promise>  DONE \n</promise>", "DONE", true)]
    #[case("<promise>ALL\t\tTESTS   PASS</promise>", "ALL TESTS PASS", true)]
    #[case("<promise>done</promise>", "DONE", false)]
    #[case("DONE", "DONE", false)]
    #[case("<promise>DONE", "DONE", false)]
    #[case("<promise>NOPE</promise> then <promise>DONE</promise>", "DONE", true)]
    #[case("<promise></promise>", "", false)]
    fn promise_detection(#[case] output: &str, #[case] token: &str, #[case] expected: bool) {
        assert_eq!(contains_promise(output, token), expected);
    }

    #[test]
    fn extract_returns_every_payload_in_order() {
        let out = "a <promise>ONE</promise> b <promise> TWO  words </promise> <promise>dangling";
        assert_eq!(extract_promises(out), vec!["ONE", "TWO words"]);
    }
}
