//! The run → diagnose → repair → validate → commit control loop.
//!
//! All policy lives in `core` (ladder, streak, classification, diff guard);
//! this module wires it to the side-effecting boundaries and reports progress
//! through a caller-supplied callback. Side effects on the committed set only
//! happen through [`ProjectStore::commit`] and [`ProjectStore::rollback`], so
//! an abandoned attempt never leaves a torn project behind.

use std::fmt;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::bundle;
use crate::core::state::{EscalationLadder, Phase, SyntaxStreak, Tier};
use crate::core::types::{
    AttemptOutcome, AttemptPurpose, FailureKind, ProviderError, ProviderId, RunResult,
    ValidationError,
};
use crate::io::attempt_log::{AttemptRecord, next_attempt_seq, write_attempt};
use crate::io::config::PatchloopConfig;
use crate::io::prompt::{PromptEngine, summarize_files, system_prompt};
use crate::io::provider::{Gateway, GenerateRequest, generate_with_retry};
use crate::io::runner::{AppRunner, RunRequest};
use crate::io::store::ProjectStore;
use crate::io::validate::{SyntaxChecker, validate_destructive, validate_syntax};

/// Confirmation boundary for escalations that should not happen silently.
pub trait EscalationGate {
    /// May the loop hand the project to a remote model for a rescue rewrite?
    fn authorize_rescue(&self, reason: &str) -> bool;

    /// True when a human is watching (lowers the rescue threshold).
    fn interactive(&self) -> bool;
}

/// Progress reporting for CLI output and tests.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PhaseStarted { phase: Phase },
    RunFailed { kind: FailureKind, summary: String },
    AttemptStarted { seq: u32, provider: ProviderId, purpose: AttemptPurpose },
    AttemptRejected { seq: u32, reason: String },
    AttemptCommitted { seq: u32, files: Vec<String> },
    Escalated { provider: ProviderId },
    RescueSkipped { reason: String },
    RolledBack { files: usize },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::PhaseStarted { phase } => write!(f, "[{}]", phase.as_str()),
            ProgressEvent::RunFailed { kind, summary } => {
                write!(f, "[running] failed ({kind:?}): {summary}")
            }
            ProgressEvent::AttemptStarted { seq, provider, purpose } => {
                write!(f, "[repairing] attempt {seq} via {provider} ({purpose:?})")
            }
            ProgressEvent::AttemptRejected { seq, reason } => {
                write!(f, "[validating] attempt {seq} rejected: {reason}")
            }
            ProgressEvent::AttemptCommitted { seq, files } => {
                write!(f, "[committing] attempt {seq} accepted ({} files)", files.len())
            }
            ProgressEvent::Escalated { provider } => {
                write!(f, "[repairing] escalating to {provider}")
            }
            ProgressEvent::RescueSkipped { reason } => {
                write!(f, "[repairing] rescue skipped: {reason}")
            }
            ProgressEvent::RolledBack { files } => {
                write!(f, "[rolling back] restored {files} files from snapshot")
            }
        }
    }
}

/// Terminal outcome of one run-and-repair cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded { attempts_used: u32 },
    Exhausted { reasons: Vec<String> },
}

/// Everything a repair cycle needs, borrowed for its duration.
pub struct CycleContext<'a, G: ?Sized, R: ?Sized, C: ?Sized, E: ?Sized> {
    pub store: &'a ProjectStore,
    pub gateway: &'a G,
    pub runner: &'a R,
    pub checker: &'a C,
    pub gate: &'a E,
    pub cfg: &'a PatchloopConfig,
    /// Remote provider for the escalation tier and rescue passes, when
    /// credentials allow one.
    pub remote: Option<ProviderId>,
}

impl<G, R, C, E> CycleContext<'_, G, R, C, E>
where
    G: Gateway + ?Sized,
    R: AppRunner + ?Sized,
    C: SyntaxChecker + ?Sized,
    E: EscalationGate + ?Sized,
{
    fn run_request(&self) -> RunRequest {
        RunRequest {
            workdir: self.store.paths().root.clone(),
            runtime_cmd: self.cfg.runtime_cmd.clone(),
            timeout: std::time::Duration::from_secs(self.cfg.run_timeout_secs),
            output_limit_bytes: self.cfg.output_limit_bytes,
        }
    }

    fn provider_for(&self, tier: Tier) -> ProviderId {
        match tier {
            Tier::Local => ProviderId::Ollama,
            Tier::Remote => self.remote.unwrap_or(ProviderId::Ollama),
        }
    }
}

/// Run the project; on failure, drive the repair sequence to a terminal
/// outcome. The committed set either ends working or restored to the
/// pre-sequence snapshot.
#[instrument(skip_all, fields(project = %ctx.store.paths().name()))]
pub fn run_and_repair<G, R, C, E, F>(
    ctx: &CycleContext<'_, G, R, C, E>,
    feedback: Option<&str>,
    on_event: &mut F,
) -> Result<CycleOutcome>
where
    G: Gateway + ?Sized,
    R: AppRunner + ?Sized,
    C: SyntaxChecker + ?Sized,
    E: EscalationGate + ?Sized,
    F: FnMut(&ProgressEvent),
{
    on_event(&ProgressEvent::PhaseStarted { phase: Phase::Running });
    let first_run = ctx.runner.run(&ctx.run_request())?;
    if first_run.success() && feedback.is_none() {
        info!("run succeeded, nothing to repair");
        return Ok(CycleOutcome::Succeeded { attempts_used: 0 });
    }
    repair_sequence(ctx, first_run, feedback, on_event)
}

/// One bounded repair sequence against a single snapshot.
fn repair_sequence<G, R, C, E, F>(
    ctx: &CycleContext<'_, G, R, C, E>,
    first_run: RunResult,
    feedback: Option<&str>,
    on_event: &mut F,
) -> Result<CycleOutcome>
where
    G: Gateway + ?Sized,
    R: AppRunner + ?Sized,
    C: SyntaxChecker + ?Sized,
    E: EscalationGate + ?Sized,
    F: FnMut(&ProgressEvent),
{
    let engine = PromptEngine::new();
    ctx.store.snapshot().context("save snapshot before repair")?;

    let feedback = expand_feedback(ctx, &engine, feedback);

    let threshold = if ctx.gate.interactive() {
        ctx.cfg.syntax_rescue_threshold_interactive
    } else {
        ctx.cfg.syntax_rescue_threshold
    };
    let mut streak = SyntaxStreak::new(threshold);
    let mut ladder = EscalationLadder::new(ctx.cfg.attempts_per_tier);
    let mut reasons = Vec::new();
    let mut error_log = first_run.output.clone();

    if !first_run.success() {
        on_event(&ProgressEvent::RunFailed {
            kind: first_run.kind,
            summary: summarize_error(&first_run.output),
        });
        // The initial failure counts toward the streak too: a threshold of
        // one fires a rescue before the first ladder attempt.
        if streak.observe(first_run.kind) {
            streak.reset();
            if let Some(rescued) = rescue(ctx, &engine, &error_log, &mut reasons, on_event)? {
                if rescued.success() {
                    return Ok(CycleOutcome::Succeeded { attempts_used: 0 });
                }
                on_event(&ProgressEvent::RunFailed {
                    kind: rescued.kind,
                    summary: summarize_error(&rescued.output),
                });
                error_log = rescued.output;
            }
        }
    }

    let mut was_remote = false;
    while let Some(tier) = ladder.next() {
        let provider = ctx.provider_for(tier);
        if tier == Tier::Remote && !was_remote {
            was_remote = true;
            on_event(&ProgressEvent::Escalated { provider });
        }

        on_event(&ProgressEvent::PhaseStarted { phase: Phase::Repairing });
        let run = match attempt(
            ctx,
            &engine,
            provider,
            AttemptPurpose::Repair,
            &error_log,
            feedback.as_deref(),
            &mut reasons,
            on_event,
        )? {
            Some(run) => run,
            None => continue,
        };

        if run.success() {
            return Ok(CycleOutcome::Succeeded {
                attempts_used: ladder.attempts_used(),
            });
        }

        on_event(&ProgressEvent::RunFailed {
            kind: run.kind,
            summary: summarize_error(&run.output),
        });
        error_log = run.output;

        if streak.observe(run.kind) {
            streak.reset();
            if let Some(rescued) =
                rescue(ctx, &engine, &error_log, &mut reasons, on_event)?
            {
                if rescued.success() {
                    return Ok(CycleOutcome::Succeeded {
                        attempts_used: ladder.attempts_used(),
                    });
                }
                on_event(&ProgressEvent::RunFailed {
                    kind: rescued.kind,
                    summary: summarize_error(&rescued.output),
                });
                error_log = rescued.output;
            }
        }
    }

    on_event(&ProgressEvent::PhaseStarted { phase: Phase::RollingBack });
    let restored = ctx.store.rollback().context("roll back after exhaustion")?;
    on_event(&ProgressEvent::RolledBack { files: restored.len() });
    warn!(attempts = ctx.cfg.attempts_per_tier * 2, "repair budget exhausted, rolled back");
    Ok(CycleOutcome::Exhausted { reasons })
}

/// One provider attempt: prompt, decode, stage, validate, commit, re-run.
///
/// Returns `Ok(None)` when the attempt was rejected or the provider failed;
/// the sequence continues on the next ladder slot.
#[allow(clippy::too_many_arguments)]
fn attempt<G, R, C, E, F>(
    ctx: &CycleContext<'_, G, R, C, E>,
    engine: &PromptEngine,
    provider: ProviderId,
    purpose: AttemptPurpose,
    error_log: &str,
    feedback: Option<&str>,
    reasons: &mut Vec<String>,
    on_event: &mut F,
) -> Result<Option<RunResult>>
where
    G: Gateway + ?Sized,
    R: AppRunner + ?Sized,
    C: SyntaxChecker + ?Sized,
    E: EscalationGate + ?Sized,
    F: FnMut(&ProgressEvent),
{
    let committed = ctx.store.committed_files()?;
    let code_summary = summarize_files(&committed, ctx.cfg.file_summary_bytes);
    let prompt = match purpose {
        AttemptPurpose::Rescue => engine.rescue(&code_summary, error_log)?,
        _ => engine.repair(&code_summary, error_log, feedback)?,
    };
    let request = GenerateRequest {
        prompt,
        system: Some(system_prompt(provider).to_string()),
        model: None,
    };

    let attempts_dir = &ctx.store.paths().attempts_dir;
    let seq = next_attempt_seq(attempts_dir)?;
    on_event(&ProgressEvent::AttemptStarted { seq, provider, purpose });

    let response =
        match generate_with_retry(ctx.gateway, provider, &request, ctx.cfg.provider_retries) {
            Ok(text) => text,
            Err(err) => {
                let reason = attempt_failure_reason(&err)?;
                write_attempt(
                    attempts_dir,
                    &AttemptRecord {
                        seq,
                        provider,
                        purpose,
                        outcome: AttemptOutcome::ProviderError,
                        reason: Some(reason.clone()),
                        response_bytes: 0,
                    },
                    &request.prompt,
                    "",
                )?;
                on_event(&ProgressEvent::AttemptRejected { seq, reason: reason.clone() });
                reasons.push(reason);
                return Ok(None);
            }
        };

    let decoded = bundle::decode(&response);
    ctx.store.begin_staging()?;
    ctx.store.write_staged(&decoded)?;
    let staged = ctx.store.staged_files()?;

    on_event(&ProgressEvent::PhaseStarted { phase: Phase::Validating });
    let verdict = validate_syntax(ctx.checker, &staged, &ctx.store.paths().staging_dir)
        .and_then(|()| {
            validate_destructive(&committed, &staged, ctx.cfg.destructive_change_ratio)
        });
    if let Err(err) = verdict {
        let (outcome, reason) = rejection(&err)?;
        ctx.store.discard_staging()?;
        write_attempt(
            attempts_dir,
            &AttemptRecord {
                seq,
                provider,
                purpose,
                outcome,
                reason: Some(reason.clone()),
                response_bytes: response.len(),
            },
            &request.prompt,
            &response,
        )?;
        on_event(&ProgressEvent::AttemptRejected { seq, reason: reason.clone() });
        reasons.push(reason);
        return Ok(None);
    }

    on_event(&ProgressEvent::PhaseStarted { phase: Phase::Committing });
    let files = ctx.store.commit()?;
    write_attempt(
        attempts_dir,
        &AttemptRecord {
            seq,
            provider,
            purpose,
            outcome: AttemptOutcome::Accepted,
            reason: None,
            response_bytes: response.len(),
        },
        &request.prompt,
        &response,
    )?;
    on_event(&ProgressEvent::AttemptCommitted { seq, files });

    on_event(&ProgressEvent::PhaseStarted { phase: Phase::Running });
    let run = ctx.runner.run(&ctx.run_request())?;
    Ok(Some(run))
}

/// Gated one-shot remote rewrite after a syntax streak. Does not consume a
/// ladder slot.
fn rescue<G, R, C, E, F>(
    ctx: &CycleContext<'_, G, R, C, E>,
    engine: &PromptEngine,
    error_log: &str,
    reasons: &mut Vec<String>,
    on_event: &mut F,
) -> Result<Option<RunResult>>
where
    G: Gateway + ?Sized,
    R: AppRunner + ?Sized,
    C: SyntaxChecker + ?Sized,
    E: EscalationGate + ?Sized,
    F: FnMut(&ProgressEvent),
{
    let reason = "repeated syntax failures; a remote model would rewrite the broken files";
    let Some(provider) = ctx.remote else {
        on_event(&ProgressEvent::RescueSkipped {
            reason: "no remote provider available".to_string(),
        });
        return Ok(None);
    };
    if !ctx.gate.authorize_rescue(reason) {
        on_event(&ProgressEvent::RescueSkipped {
            reason: "declined by gate".to_string(),
        });
        return Ok(None);
    }
    attempt(
        ctx,
        engine,
        provider,
        AttemptPurpose::Rescue,
        error_log,
        None,
        reasons,
        on_event,
    )
}

/// Expand raw user feedback into change instructions via the local model.
///
/// Best effort: any failure degrades to the raw feedback text.
fn expand_feedback<G, R, C, E>(
    ctx: &CycleContext<'_, G, R, C, E>,
    engine: &PromptEngine,
    feedback: Option<&str>,
) -> Option<String>
where
    G: Gateway + ?Sized,
    R: AppRunner + ?Sized,
    C: SyntaxChecker + ?Sized,
    E: EscalationGate + ?Sized,
{
    let raw = feedback?.trim();
    if raw.is_empty() {
        return None;
    }
    let expanded = ctx
        .store
        .committed_files()
        .ok()
        .and_then(|committed| {
            let summary = summarize_files(&committed, ctx.cfg.file_summary_bytes);
            let prompt = engine.expand_feedback(&summary, raw).ok()?;
            ctx.gateway
                .generate(
                    ProviderId::Ollama,
                    &GenerateRequest {
                        prompt,
                        system: Some(system_prompt(ProviderId::Ollama).to_string()),
                        model: Some(ctx.cfg.expand_model.clone()),
                    },
                )
                .ok()
        });
    match expanded {
        Some(text) => Some(text),
        None => {
            warn!("feedback expansion failed, using raw feedback");
            Some(raw.to_string())
        }
    }
}

/// Map a validator rejection to an attempt outcome and reason.
///
/// Non-validation errors (e.g. a missing runtime for the checker) propagate.
fn rejection(err: &anyhow::Error) -> Result<(AttemptOutcome, String)> {
    match err.downcast_ref::<ValidationError>() {
        Some(v @ (ValidationError::InvalidSyntax { .. } | ValidationError::MissingEntryFile)) => {
            Ok((AttemptOutcome::RejectedInvalid, v.to_string()))
        }
        Some(v @ ValidationError::ExcessiveChange { .. }) => {
            Ok((AttemptOutcome::RejectedDestructive, v.to_string()))
        }
        None => Err(anyhow::anyhow!("{err:#}")),
    }
}

/// Provider failures feed the ladder; anything else is fatal for the cycle.
fn attempt_failure_reason(err: &anyhow::Error) -> Result<String> {
    match err.downcast_ref::<ProviderError>() {
        Some(p) => Ok(p.to_string()),
        None => Err(anyhow::anyhow!("{err:#}")),
    }
}

fn summarize_error(output: &str) -> String {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("(no output)")
        .trim()
        .to_string()
}
