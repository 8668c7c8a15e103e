//! Deterministic classification of run output.

use crate::core::types::FailureKind;

/// Interpreter markers that identify a parse failure rather than a crash.
const SYNTAX_MARKERS: [&str; 3] = ["SyntaxError", "IndentationError", "TabError"];

/// Classify a finished run from its exit code and combined output.
///
/// Exit 0 is success regardless of output. A killed child (`exit_code` of
/// `None`) is a runtime failure.
pub fn classify_run(exit_code: Option<i32>, output: &str) -> FailureKind {
    if exit_code == Some(0) {
        return FailureKind::None;
    }
    if SYNTAX_MARKERS.iter().any(|marker| output.contains(marker)) {
        FailureKind::Syntax
    } else {
        FailureKind::Runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_is_success() {
        assert_eq!(classify_run(Some(0), "SyntaxError: ignored"), FailureKind::None);
    }

    #[test]
    fn syntax_marker_in_output_is_syntax() {
        let output = "  File \"main.py\", line 3\nSyntaxError: invalid syntax";
        assert_eq!(classify_run(Some(1), output), FailureKind::Syntax);
    }

    #[test]
    fn indentation_error_counts_as_syntax() {
        let output = "IndentationError: unexpected indent";
        assert_eq!(classify_run(Some(1), output), FailureKind::Syntax);
    }

    #[test]
    fn nonzero_exit_without_marker_is_runtime() {
        let output = "Traceback (most recent call last):\nNameError: name 'x' is not defined";
        assert_eq!(classify_run(Some(1), output), FailureKind::Runtime);
    }

    #[test]
    fn killed_child_is_runtime() {
        assert_eq!(classify_run(None, ""), FailureKind::Runtime);
    }
}
