//! Scripted doubles and fixtures for orchestration tests.
//!
//! Only compiled for tests or with the `test-support` feature.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::Result;

use crate::core::types::{ProviderError, ProviderId, RunResult};
use crate::io::provider::{Gateway, GenerateRequest};
use crate::io::runner::{AppRunner, RunRequest};
use crate::io::store::{ProjectPaths, ProjectStore};
use crate::io::validate::SyntaxChecker;
use crate::orchestrate::EscalationGate;

/// Gateway that replays a scripted sequence of responses and records which
/// provider each call went to.
pub struct ScriptedGateway {
    responses: RefCell<VecDeque<Result<String, ProviderError>>>,
    calls: RefCell<Vec<ProviderId>>,
}

impl ScriptedGateway {
    pub fn new(responses: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Providers hit so far, in call order.
    pub fn calls(&self) -> Vec<ProviderId> {
        self.calls.borrow().clone()
    }
}

impl Gateway for ScriptedGateway {
    fn generate(&self, provider: ProviderId, _request: &GenerateRequest) -> Result<String> {
        self.calls.borrow_mut().push(provider);
        let next = self
            .responses
            .borrow_mut()
            .pop_front()
            .expect("scripted gateway ran out of responses");
        next.map_err(anyhow::Error::new)
    }
}

/// Runner that replays scripted run results without spawning anything.
pub struct ScriptedRunner {
    results: RefCell<VecDeque<RunResult>>,
}

impl ScriptedRunner {
    pub fn new(results: Vec<RunResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
        }
    }
}

impl AppRunner for ScriptedRunner {
    fn run(&self, _request: &RunRequest) -> Result<RunResult> {
        Ok(self
            .results
            .borrow_mut()
            .pop_front()
            .expect("scripted runner ran out of results"))
    }
}

/// Checker that accepts every file.
pub struct PassingChecker;

impl SyntaxChecker for PassingChecker {
    fn check(&self, _file: &Path) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Checker that replays scripted verdicts and records the files it saw.
pub struct ScriptedChecker {
    verdicts: RefCell<VecDeque<Option<String>>>,
    checked: RefCell<Vec<String>>,
}

impl ScriptedChecker {
    pub fn new(verdicts: Vec<Option<String>>) -> Self {
        Self {
            verdicts: RefCell::new(verdicts.into()),
            checked: RefCell::new(Vec::new()),
        }
    }

    pub fn checked(&self) -> Vec<String> {
        self.checked.borrow().clone()
    }
}

impl SyntaxChecker for ScriptedChecker {
    fn check(&self, file: &Path) -> Result<Option<String>> {
        self.checked
            .borrow_mut()
            .push(file.display().to_string());
        Ok(self
            .verdicts
            .borrow_mut()
            .pop_front()
            .expect("scripted checker ran out of verdicts"))
    }
}

/// Gate with a fixed answer, recording the reasons it was asked about.
pub struct ScriptedGate {
    pub allow: bool,
    pub interactive: bool,
    asked: RefCell<Vec<String>>,
}

impl ScriptedGate {
    pub fn new(allow: bool, interactive: bool) -> Self {
        Self {
            allow,
            interactive,
            asked: RefCell::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }
}

impl EscalationGate for ScriptedGate {
    fn authorize_rescue(&self, reason: &str) -> bool {
        self.asked.borrow_mut().push(reason.to_string());
        self.allow
    }

    fn interactive(&self) -> bool {
        self.interactive
    }
}

/// A temporary on-disk project with an initialized store.
pub struct TestProject {
    _temp: tempfile::TempDir,
    pub store: ProjectStore,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ProjectStore::new(ProjectPaths::new(temp.path().join("demo")));
        store.init().expect("init project");
        Self { _temp: temp, store }
    }

    /// Write files directly into the committed set.
    pub fn write_committed(&self, files: &[(&str, &str)]) {
        for (name, content) in files {
            let dest = self.store.paths().root.join(name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(dest, content).expect("write committed file");
        }
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
