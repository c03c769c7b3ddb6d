//! Line diff between two rendered configurations.
//!
//! LCS alignment over lines, rendered in unified style without hunks
//! (` ` unchanged, `-` only in the old text, `+` only in the new).

use serde::{Deserialize, Serialize};

/// One line of a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "line", rename_all = "snake_case")]
pub enum LineChange {
    Same(String),
    Added(String),
    Removed(String),
}

/// Diff of two revisions' configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDiff {
    pub from: String,
    pub to: String,
    pub changes: Vec<LineChange>,
}

impl ConfigDiff {
    pub fn identical(&self) -> bool {
        self.changes
            .iter()
            .all(|c| matches!(c, LineChange::Same(_)))
    }

    pub fn added(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, LineChange::Added(_)))
            .count()
    }

    pub fn removed(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, LineChange::Removed(_)))
            .count()
    }

    pub fn render(&self) -> String {
        let mut out = format!("--- {}\n+++ {}\n", self.from, self.to);
        out.push_str(&render(&self.changes));
        out
    }
}

/// LCS table alignment of `old` and `new` lines.
pub fn diff_lines(old: &str, new: &str) -> Vec<LineChange> {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let m = a.len();
    let n = b.len();

    let mut dp = vec![vec![0usize; n + 1]; m + 1];
    for i in (0..m).rev() {
        for j in (0..n).rev() {
            dp[i][j] = if a[i] == b[j] {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let mut changes = Vec::with_capacity(m.max(n));
    let (mut i, mut j) = (0, 0);
    while i < m && j < n {
        if a[i] == b[j] {
            changes.push(LineChange::Same(a[i].to_string()));
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            changes.push(LineChange::Removed(a[i].to_string()));
            i += 1;
        } else {
            changes.push(LineChange::Added(b[j].to_string()));
            j += 1;
        }
    }
    changes.extend(a[i..].iter().map(|l| LineChange::Removed(l.to_string())));
    changes.extend(b[j..].iter().map(|l| LineChange::Added(l.to_string())));
    changes
}

pub fn render(changes: &[LineChange]) -> String {
    let mut out = String::new();
    for change in changes {
        let (prefix, line) = match change {
            LineChange::Same(l) => (' ', l),
            LineChange::Added(l) => ('+', l),
            LineChange::Removed(l) => ('-', l),
        };
        out.push(prefix);
        out.push_str(line);
        out.push('\n');
    }
    out
}
