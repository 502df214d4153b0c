//! Fixed destructive-command pattern set, ported 1:1 from the reference
//! `anteroom.tools._DESTRUCTIVE_PATTERNS` (SPEC_FULL §4.2).

use regex::Regex;
use std::sync::OnceLock;

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\brm\s+",
            r"\brmdir\b",
            r"\bgit\s+push\s+(-f|--force)\b",
            r"\bgit\s+reset\s+--hard\b",
            r"\bgit\s+clean\b",
            r"\bgit\s+checkout\s+\.\b",
            r"\bdrop\s+table\b",
            r"\bdrop\s+database\b",
            r"\btruncate\s+",
            r">\s*/dev/",
            r"\bchmod\s+777\b",
            r"\bkill\s+-9\b",
        ]
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("static destructive pattern is valid"))
        .collect()
    })
}

/// Shell metacharacters rejected from remote-tool string arguments.
static SHELL_META: OnceLock<Regex> = OnceLock::new();

fn shell_meta_re() -> &'static Regex {
    SHELL_META.get_or_init(|| Regex::new(r"[;&|`$(){}!<>\n\r]").expect("static regex"))
}

/// Collapses whitespace runs to a single space and lowercases.
pub fn normalize_command(command: &str) -> String {
    let collapsed = command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.to_lowercase()
}

pub fn is_destructive_command(command: &str) -> bool {
    let normalized = normalize_command(command);
    patterns().iter().any(|p| p.is_match(&normalized))
}

/// Returns true if any string value (recursively) in a JSON argument map
/// contains a shell metacharacter.
pub fn contains_shell_metacharacters(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => shell_meta_re().is_match(s),
        serde_json::Value::Array(items) => items.iter().any(contains_shell_metacharacters),
        serde_json::Value::Object(map) => map.values().any(contains_shell_metacharacters),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_command_collapses_whitespace() {
        assert_eq!(normalize_command("rm\t -rf\n/"), "rm -rf /");
    }

    #[test]
    fn is_destructive_command_word_boundary() {
        assert!(!is_destructive_command("myrmdir /tmp"));
    }

    #[test]
    fn destructive_pattern_table() {
        let cases: &[(&str, bool)] = &[
            ("rm -rf /", true),
            ("rm\t-rf /", true),
            ("  rm\n -rf /", true),
            ("rmdir /tmp/x", true),
            ("git reset --hard HEAD~1", true),
            ("git push --force", true),
            ("git push   -f", true),
            ("echo hi", false),
            ("/bin/rm -rf /", true),
            ("drop table users", true),
            ("drop database prod", true),
            ("truncate logs", true),
            ("echo hi > /dev/null", true),
            ("chmod 777 /etc/passwd", true),
            ("kill -9 1234", true),
            ("git checkout .", true),
            ("git clean -fd", true),
        ];
        for (command, expected) in cases {
            assert_eq!(
                is_destructive_command(command),
                *expected,
                "command: {command:?}"
            );
        }
    }

    #[test]
    fn shell_metacharacter_detection() {
        assert!(contains_shell_metacharacters(&serde_json::json!({"x": "a; rm -rf /"})));
        assert!(!contains_shell_metacharacters(&serde_json::json!({"x": "plain text"})));
        assert!(contains_shell_metacharacters(&serde_json::json!(["ok", "$(whoami)"])));
    }
}
