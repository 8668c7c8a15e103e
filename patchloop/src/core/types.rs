//! Shared deterministic types for the repair loop core.
//!
//! These types define stable contracts between core components. They must not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of model providers the gateway can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Ollama,
    Xai,
    OpenAi,
    Anthropic,
}

impl ProviderId {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Ollama => "ollama",
            ProviderId::Xai => "xai",
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
        }
    }

    /// Local providers run on-machine inference; remote providers need credentials.
    pub fn is_local(self) -> bool {
        matches!(self, ProviderId::Ollama)
    }

    pub fn parse(s: &str) -> Option<ProviderId> {
        match s {
            "ollama" => Some(ProviderId::Ollama),
            "xai" => Some(ProviderId::Xai),
            "openai" => Some(ProviderId::OpenAi),
            "anthropic" => Some(ProviderId::Anthropic),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed preference order used when resolving the `hybrid` selection.
pub const REMOTE_PREFERENCE: [ProviderId; 3] =
    [ProviderId::Xai, ProviderId::OpenAi, ProviderId::Anthropic];

/// Provider selection policy input (config `provider` key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderSelection {
    /// Use this provider verbatim.
    Provider(ProviderId),
    /// First available remote provider in preference order, else local.
    Hybrid,
}

impl ProviderSelection {
    pub fn parse(s: &str) -> Option<ProviderSelection> {
        if s == "hybrid" {
            return Some(ProviderSelection::Hybrid);
        }
        ProviderId::parse(s).map(ProviderSelection::Provider)
    }
}

/// Resolve a selection to a concrete provider id.
///
/// A concrete selection is honored verbatim even without credentials; whether
/// to downgrade in that case is the caller's decision, not policy.
pub fn resolve_provider<F>(selection: ProviderSelection, has_credential: F) -> ProviderId
where
    F: Fn(ProviderId) -> bool,
{
    match selection {
        ProviderSelection::Provider(id) => id,
        ProviderSelection::Hybrid => REMOTE_PREFERENCE
            .into_iter()
            .find(|id| has_credential(*id))
            .unwrap_or(ProviderId::Ollama),
    }
}

/// Classified failure kind from one project run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Exit code 0.
    None,
    /// Non-zero exit with a recognized interpreter syntax marker in output.
    Syntax,
    /// Non-zero exit without a syntax marker.
    Runtime,
}

/// Result of one project run, consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// Exit code; `None` when the child was killed (e.g. timeout).
    pub exit_code: Option<i32>,
    /// Combined stdout + stderr text, bounded by the output limit.
    pub output: String,
    pub kind: FailureKind,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.kind == FailureKind::None
    }
}

/// Why an attempt ended the way it did (append-only history records).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Accepted,
    RejectedInvalid,
    RejectedDestructive,
    ProviderError,
}

/// What an attempt was asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptPurpose {
    Generate,
    Repair,
    Rescue,
}

/// Validator rejection reasons. Advisory: validators never mutate staging.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A staged source file failed the target runtime's parser.
    InvalidSyntax { file: String, message: String },
    /// Staging has no primary entry file.
    MissingEntryFile,
    /// A staged file differs from its committed counterpart beyond the threshold.
    ExcessiveChange { file: String, ratio: f64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidSyntax { file, message } => {
                write!(f, "invalid syntax in {file}: {message}")
            }
            ValidationError::MissingEntryFile => write!(f, "no entry file in staged changes"),
            ValidationError::ExcessiveChange { file, ratio } => {
                write!(f, "{file}: {:.0}% changed (too destructive)", ratio * 100.0)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Provider boundary failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No credentials or no connection.
    Unavailable { provider: ProviderId, message: String },
    /// The remote rejected the call.
    Remote { provider: ProviderId, message: String },
    /// The provider answered with no usable text.
    EmptyResponse { provider: ProviderId },
}

impl ProviderError {
    pub fn provider(&self) -> ProviderId {
        match self {
            ProviderError::Unavailable { provider, .. }
            | ProviderError::Remote { provider, .. }
            | ProviderError::EmptyResponse { provider } => *provider,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unavailable { provider, message } => {
                write!(f, "{provider} unavailable: {message}")
            }
            ProviderError::Remote { provider, message } => {
                write!(f, "{provider} rejected the call: {message}")
            }
            ProviderError::EmptyResponse { provider } => {
                write!(f, "{provider} returned an empty response")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

/// Rollback requested with no snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoSnapshotError {
    pub project: String,
}

impl fmt::Display for NoSnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no snapshot to restore for {}", self.project)
    }
}

impl std::error::Error for NoSnapshotError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_prefers_first_remote_with_credentials() {
        let resolved = resolve_provider(ProviderSelection::Hybrid, |id| id == ProviderId::OpenAi);
        assert_eq!(resolved, ProviderId::OpenAi);
    }

    #[test]
    fn hybrid_falls_back_to_local_without_credentials() {
        let resolved = resolve_provider(ProviderSelection::Hybrid, |_| false);
        assert_eq!(resolved, ProviderId::Ollama);
    }

    #[test]
    fn concrete_selection_is_verbatim_even_without_credentials() {
        let resolved = resolve_provider(
            ProviderSelection::Provider(ProviderId::Anthropic),
            |_| false,
        );
        assert_eq!(resolved, ProviderId::Anthropic);
    }

    #[test]
    fn provider_ids_are_usable_as_ordered_map_keys() {
        let models: std::collections::BTreeMap<ProviderId, &str> = [
            (ProviderId::Anthropic, "claude"),
            (ProviderId::Ollama, "qwen"),
            (ProviderId::Xai, "grok"),
        ]
        .into_iter()
        .collect();
        assert_eq!(models[&ProviderId::Ollama], "qwen");
        assert_eq!(models[&ProviderId::Xai], "grok");
    }

    #[test]
    fn selection_parses_known_names() {
        assert_eq!(
            ProviderSelection::parse("hybrid"),
            Some(ProviderSelection::Hybrid)
        );
        assert_eq!(
            ProviderSelection::parse("xai"),
            Some(ProviderSelection::Provider(ProviderId::Xai))
        );
        assert_eq!(ProviderSelection::parse("grok"), None);
    }
}
