//! Line-level change measurement for the destructive-change gate.

use std::collections::BTreeMap;

use crate::core::types::ValidationError;

/// Default fraction of changed lines above which a staged file is rejected.
pub const DEFAULT_DESTRUCTIVE_RATIO: f64 = 0.6;

/// Fraction of a committed file's lines changed by its staged replacement.
///
/// The changed-line count is the larger of (committed lines removed) and
/// (staged lines added) relative to the longest common subsequence, divided
/// by the committed line count. Callers must exempt zero-line committed files
/// before calling.
pub fn change_ratio(committed: &str, staged: &str) -> f64 {
    let old: Vec<&str> = committed.lines().collect();
    let new: Vec<&str> = staged.lines().collect();
    if old.is_empty() {
        return 0.0;
    }
    let common = lcs_len(&old, &new);
    let removed = old.len() - common;
    let added = new.len() - common;
    removed.max(added) as f64 / old.len() as f64
}

/// Reject any staged file whose change ratio against its committed
/// counterpart exceeds `threshold`.
///
/// New files (no committed counterpart) and empty committed files are exempt.
/// Checks files in deterministic name order and stops at the first offender.
pub fn check_destructive(
    committed: &BTreeMap<String, String>,
    staged: &BTreeMap<String, String>,
    threshold: f64,
) -> Result<(), ValidationError> {
    for (name, staged_content) in staged {
        let Some(committed_content) = committed.get(name) else {
            continue;
        };
        if committed_content.lines().next().is_none() {
            continue;
        }
        let ratio = change_ratio(committed_content, staged_content);
        if ratio > threshold {
            return Err(ValidationError::ExcessiveChange {
                file: name.clone(),
                ratio,
            });
        }
    }
    Ok(())
}

/// Longest common subsequence length over lines, two-row DP.
///
/// Quadratic time but linear space; generated projects stay small enough
/// that this is never the bottleneck next to model latency.
fn lcs_len(old: &[&str], new: &[&str]) -> usize {
    if old.is_empty() || new.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; new.len() + 1];
    let mut cur = vec![0usize; new.len() + 1];
    for o in old {
        for (j, n) in new.iter().enumerate() {
            cur[j + 1] = if o == n {
                prev[j] + 1
            } else {
                prev[j + 1].max(cur[j])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[new.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(count: usize, changed: &[usize]) -> String {
        (0..count)
            .map(|i| {
                if changed.contains(&i) {
                    format!("changed line {i}")
                } else {
                    format!("line {i}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn one(name: &str, content: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(name.to_string(), content.to_string())])
    }

    #[test]
    fn rejects_61_of_100_changed_lines() {
        let committed = one("main.py", &numbered(100, &[]));
        let changed: Vec<usize> = (0..61).collect();
        let staged = one("main.py", &numbered(100, &changed));

        let err = check_destructive(&committed, &staged, DEFAULT_DESTRUCTIVE_RATIO)
            .expect_err("should reject");
        match err {
            ValidationError::ExcessiveChange { file, ratio } => {
                assert_eq!(file, "main.py");
                assert!((ratio - 0.61).abs() < 1e-9);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn accepts_59_of_100_changed_lines() {
        let committed = one("main.py", &numbered(100, &[]));
        let changed: Vec<usize> = (0..59).collect();
        let staged = one("main.py", &numbered(100, &changed));

        check_destructive(&committed, &staged, DEFAULT_DESTRUCTIVE_RATIO).expect("should accept");
    }

    #[test]
    fn new_files_are_never_destructive() {
        let committed = one("main.py", "x = 1");
        let staged = one("brand_new.py", &numbered(500, &[]));

        check_destructive(&committed, &staged, DEFAULT_DESTRUCTIVE_RATIO).expect("new file ok");
    }

    #[test]
    fn empty_committed_files_are_exempt() {
        let committed = one("main.py", "");
        let staged = one("main.py", &numbered(50, &[]));

        check_destructive(&committed, &staged, DEFAULT_DESTRUCTIVE_RATIO).expect("empty exempt");
    }

    #[test]
    fn identical_files_have_zero_ratio() {
        let text = numbered(10, &[]);
        assert_eq!(change_ratio(&text, &text), 0.0);
    }

    #[test]
    fn full_rewrite_has_ratio_one() {
        let committed = numbered(10, &[]);
        let changed: Vec<usize> = (0..10).collect();
        let staged = numbered(10, &changed);
        assert!((change_ratio(&committed, &staged) - 1.0).abs() < 1e-9);
    }
}
