//! Prompt rendering for generation, repair, and expansion calls.

use std::collections::BTreeMap;

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::ProviderId;

const EXPAND_IDEA_TEMPLATE: &str = include_str!("prompts/expand_idea.md");
const EXPAND_FEEDBACK_TEMPLATE: &str = include_str!("prompts/expand_feedback.md");
const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const RESCUE_TEMPLATE: &str = include_str!("prompts/rescue.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("expand_idea", EXPAND_IDEA_TEMPLATE)
            .expect("expand_idea template should be valid");
        env.add_template("expand_feedback", EXPAND_FEEDBACK_TEMPLATE)
            .expect("expand_feedback template should be valid");
        env.add_template("generate", GENERATE_TEMPLATE)
            .expect("generate template should be valid");
        env.add_template("repair", REPAIR_TEMPLATE)
            .expect("repair template should be valid");
        env.add_template("rescue", RESCUE_TEMPLATE)
            .expect("rescue template should be valid");
        Self { env }
    }

    pub fn expand_idea(&self, idea: &str) -> Result<String> {
        let rendered = self
            .env
            .get_template("expand_idea")?
            .render(context! { idea => idea.trim() })?;
        Ok(rendered)
    }

    pub fn expand_feedback(&self, code_summary: &str, feedback: &str) -> Result<String> {
        let rendered = self.env.get_template("expand_feedback")?.render(context! {
            code_summary => code_summary,
            feedback => feedback.trim(),
        })?;
        Ok(rendered)
    }

    pub fn generate(&self, description: &str) -> Result<String> {
        let rendered = self
            .env
            .get_template("generate")?
            .render(context! { description => description.trim() })?;
        Ok(rendered)
    }

    pub fn repair(
        &self,
        code_summary: &str,
        error_log: &str,
        feedback: Option<&str>,
    ) -> Result<String> {
        let rendered = self.env.get_template("repair")?.render(context! {
            code_summary => code_summary,
            error_log => error_log.trim(),
            feedback => feedback.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    pub fn rescue(&self, code_summary: &str, error_log: &str) -> Result<String> {
        let rendered = self.env.get_template("rescue")?.render(context! {
            code_summary => code_summary,
            error_log => error_log.trim(),
        })?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Summarize project files for prompt context, truncating each file body.
///
/// Uses the same `=== filename ===` framing the model is asked to emit, so
/// the context and the requested output format line up.
pub fn summarize_files(files: &BTreeMap<String, String>, per_file_bytes: usize) -> String {
    let mut buf = String::new();
    for (name, content) in files {
        buf.push_str(&format!("=== {name} ===\n"));
        if content.len() > per_file_bytes {
            let mut end = per_file_bytes;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            buf.push_str(&content[..end]);
            buf.push_str("\n[truncated]\n");
        } else {
            buf.push_str(content);
            if !content.ends_with('\n') {
                buf.push('\n');
            }
        }
        buf.push('\n');
    }
    buf
}

/// System prompt for a provider.
pub fn system_prompt(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::Xai => {
            "You are Grok, a senior Python developer built by xAI. \
             You write small, correct, runnable command-line programs."
        }
        _ => {
            "You are a senior Python developer. You write small, correct, \
             runnable command-line programs."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_prompt_includes_feedback_only_when_present() {
        let engine = PromptEngine::new();
        let with = engine
            .repair("=== main.py ===\npass\n", "Traceback", Some("add colors"))
            .expect("render");
        assert!(with.contains("add colors"));
        assert!(with.contains("Traceback"));

        let without = engine
            .repair("=== main.py ===\npass\n", "Traceback", None)
            .expect("render");
        assert!(!without.contains("Additional instructions"));
    }

    #[test]
    fn summary_truncates_long_files() {
        let files = BTreeMap::from([
            ("main.py".to_string(), "x".repeat(50)),
            ("util.py".to_string(), "short".to_string()),
        ]);
        let summary = summarize_files(&files, 10);
        assert!(summary.contains("=== main.py ==="));
        assert!(summary.contains("[truncated]"));
        assert!(summary.contains("short"));
    }

    #[test]
    fn generate_prompt_names_the_bundle_format() {
        let engine = PromptEngine::new();
        let prompt = engine.generate("a todo list").expect("render");
        assert!(prompt.contains("=== filename ==="));
        assert!(prompt.contains("main.py"));
        assert!(prompt.contains("a todo list"));
    }
}
