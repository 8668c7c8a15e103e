//! New-project creation: idea → expanded description → generated bundle.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::bundle;
use crate::core::state::Phase;
use crate::core::types::{AttemptOutcome, AttemptPurpose, ProviderId};
use crate::io::attempt_log::{AttemptRecord, next_attempt_seq, write_attempt};
use crate::io::config::PatchloopConfig;
use crate::io::prompt::{PromptEngine, system_prompt};
use crate::io::provider::{Gateway, GenerateRequest, generate_with_retry};
use crate::io::store::{ProjectPaths, ProjectStore};
use crate::io::validate::{SyntaxChecker, validate_syntax};
use crate::orchestrate::ProgressEvent;

const MAX_SLUG_LEN: usize = 60;
const FALLBACK_SLUG: &str = "my-app";

/// Directory-safe project name derived from the idea text.
pub fn slugify_idea(idea: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in idea.chars() {
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug
    }
}

/// Pick a project directory under the projects root that does not exist yet.
fn unique_project_root(projects_root: &Path, slug: &str) -> std::path::PathBuf {
    let candidate = projects_root.join(slug);
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 2;
    loop {
        let candidate = projects_root.join(format!("{slug}-{n}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Create a new project from a terse idea.
///
/// The idea is expanded by the local model (best effort), the project is
/// generated by the resolved provider, and the decoded bundle is committed
/// after a syntax-only validation (there is no committed baseline to diff
/// against yet).
#[instrument(skip_all, fields(idea_bytes = idea.len()))]
pub fn create_project<G, C, F>(
    projects_root: &Path,
    idea: &str,
    gateway: &G,
    checker: &C,
    cfg: &PatchloopConfig,
    provider: ProviderId,
    on_event: &mut F,
) -> Result<ProjectPaths>
where
    G: Gateway + ?Sized,
    C: SyntaxChecker + ?Sized,
    F: FnMut(&ProgressEvent),
{
    let idea = idea.trim();
    if idea.is_empty() {
        return Err(anyhow!("idea must not be empty"));
    }

    let engine = PromptEngine::new();
    let root = unique_project_root(projects_root, &slugify_idea(idea));
    let store = ProjectStore::new(ProjectPaths::new(root));
    store.init()?;

    on_event(&ProgressEvent::PhaseStarted { phase: Phase::Generating });
    let description = expand_idea(gateway, &engine, idea, &cfg.expand_model);

    let prompt = engine.generate(&description)?;
    let request = GenerateRequest {
        prompt,
        system: Some(system_prompt(provider).to_string()),
        model: None,
    };
    let attempts_dir = &store.paths().attempts_dir;
    let seq = next_attempt_seq(attempts_dir)?;
    on_event(&ProgressEvent::AttemptStarted {
        seq,
        provider,
        purpose: AttemptPurpose::Generate,
    });
    let response = generate_with_retry(gateway, provider, &request, cfg.provider_retries)
        .context("generate project")?;

    let decoded = bundle::decode(&response);
    store.begin_staging()?;
    store.write_staged(&decoded)?;
    let staged = store.staged_files()?;

    on_event(&ProgressEvent::PhaseStarted { phase: Phase::Validating });
    if let Err(err) = validate_syntax(checker, &staged, &store.paths().staging_dir) {
        store.discard_staging()?;
        write_attempt(
            attempts_dir,
            &AttemptRecord {
                seq,
                provider,
                purpose: AttemptPurpose::Generate,
                outcome: AttemptOutcome::RejectedInvalid,
                reason: Some(format!("{err:#}")),
                response_bytes: response.len(),
            },
            &request.prompt,
            &response,
        )?;
        return Err(err.context("generated project failed validation"));
    }

    on_event(&ProgressEvent::PhaseStarted { phase: Phase::Committing });
    let files = store.commit()?;
    write_attempt(
        attempts_dir,
        &AttemptRecord {
            seq,
            provider,
            purpose: AttemptPurpose::Generate,
            outcome: AttemptOutcome::Accepted,
            reason: None,
            response_bytes: response.len(),
        },
        &request.prompt,
        &response,
    )?;
    on_event(&ProgressEvent::AttemptCommitted { seq, files });

    let requirements = store.paths().root.join("requirements.txt");
    if !requirements.exists() {
        fs::write(&requirements, "")
            .with_context(|| format!("write {}", requirements.display()))?;
    }

    info!(project = %store.paths().name(), "project created");
    Ok(store.paths().clone())
}

/// Expand the idea via the local model, falling back to the raw idea text.
fn expand_idea<G: Gateway + ?Sized>(
    gateway: &G,
    engine: &PromptEngine,
    idea: &str,
    expand_model: &str,
) -> String {
    let expanded = engine.expand_idea(idea).ok().and_then(|prompt| {
        gateway
            .generate(
                ProviderId::Ollama,
                &GenerateRequest {
                    prompt,
                    system: Some(system_prompt(ProviderId::Ollama).to_string()),
                    model: Some(expand_model.to_string()),
                },
            )
            .ok()
    });
    match expanded {
        Some(text) => text,
        None => {
            warn!("idea expansion failed, using raw idea");
            idea.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_replaces_punctuation_and_lowercases() {
        assert_eq!(slugify_idea("A To-Do List (with colors!)"), "a-to-do-list-with-colors");
    }

    #[test]
    fn slug_caps_length() {
        let long = "word ".repeat(40);
        assert!(slugify_idea(&long).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn slug_falls_back_when_nothing_survives() {
        assert_eq!(slugify_idea("!!! ???"), "my-app");
    }

    #[test]
    fn unique_root_appends_a_counter() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(temp.path().join("app")).expect("mkdir");
        std::fs::create_dir(temp.path().join("app-2")).expect("mkdir");
        let root = unique_project_root(temp.path(), "app");
        assert_eq!(root, temp.path().join("app-3"));
    }
}
