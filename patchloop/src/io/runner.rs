//! Runs a project's entry file and classifies the outcome.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::bundle::ENTRY_FILE;
use crate::core::classify::classify_run;
use crate::core::types::RunResult;
use crate::io::process::run_command_with_timeout;

/// Everything needed to run a project once.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workdir: PathBuf,
    pub runtime_cmd: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Project execution boundary.
pub trait AppRunner {
    fn run(&self, request: &RunRequest) -> Result<RunResult>;
}

/// Runs the entry file with the configured runtime.
///
/// A `deps/` directory under the project root, when present, is prepended to
/// `PYTHONPATH` so vendored packages resolve without an environment.
pub struct PythonRunner;

impl AppRunner for PythonRunner {
    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    fn run(&self, request: &RunRequest) -> Result<RunResult> {
        let entry = request.workdir.join(ENTRY_FILE);
        if !entry.exists() {
            return Err(anyhow!(
                "no {ENTRY_FILE} in {}",
                request.workdir.display()
            ));
        }

        let mut cmd = Command::new(&request.runtime_cmd[0]);
        cmd.args(&request.runtime_cmd[1..])
            .arg(ENTRY_FILE)
            .current_dir(&request.workdir);

        let deps = request.workdir.join("deps");
        if deps.is_dir() {
            let mut python_path = deps.as_os_str().to_os_string();
            if let Some(existing) = std::env::var_os("PYTHONPATH") {
                python_path.push(":");
                python_path.push(existing);
            }
            cmd.env("PYTHONPATH", python_path);
        }

        let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)?;
        let text = output.combined_text();
        let kind = classify_run(output.exit_code, &text);
        debug!(exit_code = ?output.exit_code, ?kind, "run finished");
        Ok(RunResult {
            exit_code: output.exit_code,
            output: text,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entry_file_is_a_hard_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = RunRequest {
            workdir: temp.path().to_path_buf(),
            runtime_cmd: vec!["python3".to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        };
        let err = PythonRunner.run(&request).expect_err("no entry file");
        assert!(err.to_string().contains("main.py"));
    }
}
