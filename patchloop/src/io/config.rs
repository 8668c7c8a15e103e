//! Patchloop configuration stored as `patchloop.toml` at the projects root.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{ProviderId, ProviderSelection};

/// Tunable policy for the generate/run/repair loop (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatchloopConfig {
    /// Provider selection: a provider name or `"hybrid"`.
    pub provider: String,

    /// Model served by the local runtime.
    pub local_model: String,

    /// Small local model used for idea/feedback expansion.
    pub expand_model: String,

    pub xai_model: String,
    pub openai_model: String,
    pub anthropic_model: String,

    /// Repair attempts per escalation tier (local, then remote).
    pub attempts_per_tier: u32,

    /// Reject a staged file whose change ratio against the committed
    /// counterpart exceeds this fraction.
    pub destructive_change_ratio: f64,

    /// Consecutive syntax failures before a rescue pass in unattended mode.
    pub syntax_rescue_threshold: u32,

    /// Same threshold when an interactive gate can confirm earlier.
    pub syntax_rescue_threshold_interactive: u32,

    /// Wall-clock budget for one project run in seconds.
    pub run_timeout_secs: u64,

    /// Wall-clock budget for one provider call in seconds.
    pub provider_timeout_secs: u64,

    /// Retries per provider call on top of the first try.
    pub provider_retries: u32,

    /// Truncate captured run output beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// Per-file truncation when summarizing project source for prompts.
    pub file_summary_bytes: usize,

    /// Command prefix that runs a project (e.g. `["python3"]`).
    pub runtime_cmd: Vec<String>,

    /// API keys by provider name; falls back to environment variables.
    pub credentials: BTreeMap<String, String>,
}

impl Default for PatchloopConfig {
    fn default() -> Self {
        Self {
            provider: "hybrid".to_string(),
            local_model: "qwen2.5-coder:14b".to_string(),
            expand_model: "llama3.2".to_string(),
            xai_model: "grok-4".to_string(),
            openai_model: "gpt-4o".to_string(),
            anthropic_model: "claude-sonnet-4-0".to_string(),
            attempts_per_tier: 2,
            destructive_change_ratio: 0.6,
            syntax_rescue_threshold: 5,
            syntax_rescue_threshold_interactive: 3,
            run_timeout_secs: 5 * 60,
            provider_timeout_secs: 120,
            provider_retries: 2,
            output_limit_bytes: 100_000,
            file_summary_bytes: 1000,
            runtime_cmd: vec!["python3".to_string()],
            credentials: BTreeMap::new(),
        }
    }
}

impl PatchloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.selection().is_none() {
            return Err(anyhow!(
                "provider must be a provider name or \"hybrid\", got {:?}",
                self.provider
            ));
        }
        if self.attempts_per_tier == 0 {
            return Err(anyhow!("attempts_per_tier must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.destructive_change_ratio) {
            return Err(anyhow!("destructive_change_ratio must be within 0.0..=1.0"));
        }
        if self.syntax_rescue_threshold == 0 || self.syntax_rescue_threshold_interactive == 0 {
            return Err(anyhow!("syntax rescue thresholds must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.provider_timeout_secs == 0 {
            return Err(anyhow!("provider_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.file_summary_bytes == 0 {
            return Err(anyhow!("file_summary_bytes must be > 0"));
        }
        if self.runtime_cmd.is_empty() || self.runtime_cmd[0].trim().is_empty() {
            return Err(anyhow!("runtime_cmd must be a non-empty array"));
        }
        Ok(())
    }

    /// Parsed provider selection. `None` only for unknown names.
    pub fn selection(&self) -> Option<ProviderSelection> {
        ProviderSelection::parse(&self.provider)
    }

    /// Configured model for a provider.
    pub fn model_for(&self, provider: ProviderId) -> &str {
        match provider {
            ProviderId::Ollama => &self.local_model,
            ProviderId::Xai => &self.xai_model,
            ProviderId::OpenAi => &self.openai_model,
            ProviderId::Anthropic => &self.anthropic_model,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PatchloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<PatchloopConfig> {
    if !path.exists() {
        let cfg = PatchloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PatchloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PatchloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PatchloopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("patchloop.toml");
        let mut cfg = PatchloopConfig::default();
        cfg.provider = "xai".to_string();
        cfg.credentials
            .insert("xai".to_string(), "key-123".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn unknown_provider_fails_validation() {
        let cfg = PatchloopConfig {
            provider: "grok".to_string(),
            ..PatchloopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_ratio_fails_validation() {
        let cfg = PatchloopConfig {
            destructive_change_ratio: 1.5,
            ..PatchloopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
