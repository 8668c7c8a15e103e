//! Staged-change validators: syntax first, then the destructive-change guard.
//!
//! Validators only ever read; rejection leaves staging intact for the caller
//! to discard. Rejections are [`ValidationError`] inside `anyhow::Error` so
//! the orchestrator can downcast and keep the sequence going.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::bundle::ENTRY_FILE;
use crate::core::diff::check_destructive;
use crate::core::types::ValidationError;
use crate::io::process::run_command_with_timeout;

/// Parse source passed as argv[1] with the runtime's own parser.
const AST_CHECK_SRC: &str = "import ast, sys
with open(sys.argv[1], encoding='utf-8') as f:
    ast.parse(f.read(), filename=sys.argv[1])
";

/// Syntax check boundary for one on-disk source file.
///
/// `Ok(None)` means the file parses; `Ok(Some(message))` carries the parser's
/// diagnostic. `Err` is reserved for checker failures (e.g. missing runtime).
pub trait SyntaxChecker {
    fn check(&self, file: &Path) -> Result<Option<String>>;
}

/// Checks files by invoking the configured runtime's parser.
pub struct PythonSyntaxChecker {
    runtime_cmd: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl PythonSyntaxChecker {
    pub fn new(runtime_cmd: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            runtime_cmd,
            timeout,
            output_limit_bytes,
        }
    }
}

impl SyntaxChecker for PythonSyntaxChecker {
    #[instrument(skip_all, fields(file = %file.display()))]
    fn check(&self, file: &Path) -> Result<Option<String>> {
        let mut cmd = Command::new(&self.runtime_cmd[0]);
        cmd.args(&self.runtime_cmd[1..])
            .arg("-c")
            .arg(AST_CHECK_SRC)
            .arg(file);
        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)?;
        if output.exit_code == Some(0) {
            return Ok(None);
        }
        let text = output.combined_text();
        let message = text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("parse failed")
            .trim()
            .to_string();
        debug!(message, "syntax check rejected file");
        Ok(Some(message))
    }
}

/// Validate a staged change set: entry file present, every staged source file
/// parses. Files are checked in deterministic order; the first failure wins.
pub fn validate_syntax<C: SyntaxChecker + ?Sized>(
    checker: &C,
    staged: &BTreeMap<String, String>,
    staging_dir: &Path,
) -> Result<()> {
    if !staged.contains_key(ENTRY_FILE) {
        return Err(anyhow::Error::new(ValidationError::MissingEntryFile));
    }
    for name in staged.keys().filter(|n| n.ends_with(".py")) {
        if let Some(message) = checker.check(&staging_dir.join(name))? {
            return Err(anyhow::Error::new(ValidationError::InvalidSyntax {
                file: name.clone(),
                message,
            }));
        }
    }
    Ok(())
}

/// Reject staged files that rewrite too much of their committed counterpart.
pub fn validate_destructive(
    committed: &BTreeMap<String, String>,
    staged: &BTreeMap<String, String>,
    threshold: f64,
) -> Result<()> {
    check_destructive(committed, staged, threshold).map_err(anyhow::Error::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{PassingChecker, ScriptedChecker};

    fn staged(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_entry_file_is_rejected_before_any_check() {
        let checker = PassingChecker;
        let files = staged(&[("util.py", "pass")]);
        let err = validate_syntax(&checker, &files, Path::new("/tmp")).expect_err("rejected");
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::MissingEntryFile)
        ));
    }

    #[test]
    fn first_failing_file_short_circuits_in_sorted_order() {
        let checker = ScriptedChecker::new(vec![
            Some("invalid syntax".to_string()),
            None,
        ]);
        let files = staged(&[("a.py", "("), ("main.py", "pass")]);
        let err = validate_syntax(&checker, &files, Path::new("/tmp")).expect_err("rejected");
        match err.downcast_ref::<ValidationError>() {
            Some(ValidationError::InvalidSyntax { file, message }) => {
                assert_eq!(file, "a.py");
                assert!(message.contains("invalid syntax"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(checker.checked().len(), 1);
    }

    #[test]
    fn non_python_staged_files_are_not_syntax_checked() {
        let checker = ScriptedChecker::new(vec![None]);
        let files = staged(&[("main.py", "pass"), ("requirements.txt", "requests")]);
        validate_syntax(&checker, &files, Path::new("/tmp")).expect("valid");
        assert_eq!(checker.checked(), vec!["/tmp/main.py".to_string()]);
    }
}
