//! CLI for the generate/run/repair loop.

use std::io::{BufRead, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use patchloop::core::types::{ProviderId, REMOTE_PREFERENCE, resolve_provider};
use patchloop::generate::create_project;
use patchloop::io::config::{PatchloopConfig, load_config};
use patchloop::io::provider::{Credentials, HttpGateway};
use patchloop::io::runner::PythonRunner;
use patchloop::io::store::{ProjectPaths, ProjectStore, RESERVED_DIR};
use patchloop::io::validate::PythonSyntaxChecker;
use patchloop::logging;
use patchloop::orchestrate::{
    CycleContext, CycleOutcome, EscalationGate, ProgressEvent, run_and_repair,
};

/// Exit code when a repair sequence exhausted its budget and rolled back.
const EXIT_EXHAUSTED: i32 = 2;

/// Wall-clock budget for one syntax check.
const SYNTAX_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

const CONFIG_FILE: &str = "patchloop.toml";

#[derive(Parser)]
#[command(
    name = "patchloop",
    version,
    about = "Generate, run, and repair small Python projects with LLMs"
)]
struct Cli {
    /// Directory holding all managed projects.
    #[arg(long, default_value = "projects", global = true)]
    root: PathBuf,

    /// Provider override: a provider name or "hybrid".
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Unattended mode: never prompt, auto-approve escalations.
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new project from a terse idea, then run and repair it.
    New {
        /// What the app should do (plain language).
        idea: String,
    },
    /// Run an existing project, repairing it on failure.
    Run {
        /// Project directory name under the root.
        name: String,
    },
    /// Apply user feedback to a working project, then run and repair it.
    Fix {
        name: String,
        /// Requested change (plain language).
        feedback: String,
    },
    /// Restore a project to its last pre-repair snapshot.
    Rollback { name: String },
    /// List managed projects.
    List,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let mut cfg = load_config(&cli.root.join(CONFIG_FILE))?;
    if let Some(provider) = &cli.provider {
        cfg.provider = provider.clone();
        cfg.validate()?;
    }

    match &cli.command {
        Command::New { idea } => cmd_new(&cli, &cfg, idea),
        Command::Run { name } => cmd_cycle(&cli, &cfg, name, None),
        Command::Fix { name, feedback } => cmd_cycle(&cli, &cfg, name, Some(feedback.as_str())),
        Command::Rollback { name } => cmd_rollback(&cli, name),
        Command::List => cmd_list(&cli),
    }
}

fn cmd_new(cli: &Cli, cfg: &PatchloopConfig, idea: &str) -> Result<()> {
    let gateway = HttpGateway::new(cfg)?;
    let checker = syntax_checker(cfg);
    let provider = primary_provider(cfg, gateway.credentials())?;

    let paths = create_project(
        &cli.root,
        idea,
        &gateway,
        &checker,
        cfg,
        provider,
        &mut print_event,
    )?;
    println!("created {}", paths.root.display());

    cycle(cli, cfg, ProjectStore::new(paths), None)
}

fn cmd_cycle(cli: &Cli, cfg: &PatchloopConfig, name: &str, feedback: Option<&str>) -> Result<()> {
    let store = open_project(&cli.root, name)?;
    cycle(cli, cfg, store, feedback)
}

fn cycle(
    cli: &Cli,
    cfg: &PatchloopConfig,
    store: ProjectStore,
    feedback: Option<&str>,
) -> Result<()> {
    let gateway = HttpGateway::new(cfg)?;
    let checker = syntax_checker(cfg);
    let gate = StdinGate { unattended: cli.yes };
    let primary = primary_provider(cfg, gateway.credentials())?;
    let remote = remote_provider(primary, gateway.credentials());

    let ctx = CycleContext {
        store: &store,
        gateway: &gateway,
        runner: &PythonRunner,
        checker: &checker,
        gate: &gate,
        cfg,
        remote,
    };
    match run_and_repair(&ctx, feedback, &mut print_event)? {
        CycleOutcome::Succeeded { attempts_used } => {
            if attempts_used == 0 {
                println!("{} runs cleanly", store.paths().name());
            } else {
                println!(
                    "{} repaired after {attempts_used} attempt(s)",
                    store.paths().name()
                );
            }
            Ok(())
        }
        CycleOutcome::Exhausted { reasons } => {
            eprintln!("repair budget exhausted, project rolled back:");
            for reason in reasons {
                eprintln!("  - {reason}");
            }
            std::process::exit(EXIT_EXHAUSTED);
        }
    }
}

fn cmd_rollback(cli: &Cli, name: &str) -> Result<()> {
    let store = open_project(&cli.root, name)?;
    let files = store.rollback()?;
    println!("restored {} file(s) from snapshot", files.len());
    Ok(())
}

fn cmd_list(cli: &Cli) -> Result<()> {
    if !cli.root.exists() {
        return Ok(());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&cli.root)
        .with_context(|| format!("read {}", cli.root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    for name in names {
        let store = ProjectStore::new(ProjectPaths::new(cli.root.join(&name)));
        let marker = if store.has_snapshot() { " (has snapshot)" } else { "" };
        println!("{name}{marker}");
    }
    Ok(())
}

fn open_project(root: &Path, name: &str) -> Result<ProjectStore> {
    if name.starts_with('.') || name.contains('/') || name == RESERVED_DIR {
        return Err(anyhow!("invalid project name {name:?}"));
    }
    let project_root = root.join(name);
    if !project_root.is_dir() {
        return Err(anyhow!("no such project {name:?} under {}", root.display()));
    }
    Ok(ProjectStore::new(ProjectPaths::new(project_root)))
}

fn syntax_checker(cfg: &PatchloopConfig) -> PythonSyntaxChecker {
    PythonSyntaxChecker::new(
        cfg.runtime_cmd.clone(),
        SYNTAX_CHECK_TIMEOUT,
        cfg.output_limit_bytes,
    )
}

/// Resolve the configured selection to the provider used for generation and
/// the local repair tier.
fn primary_provider(cfg: &PatchloopConfig, creds: &Credentials) -> Result<ProviderId> {
    let selection = cfg
        .selection()
        .ok_or_else(|| anyhow!("invalid provider {:?}", cfg.provider))?;
    Ok(resolve_provider(selection, |id| creds.has_key(id)))
}

/// Provider for the escalation tier: the primary when it is already remote,
/// otherwise the first remote provider with credentials.
fn remote_provider(primary: ProviderId, creds: &Credentials) -> Option<ProviderId> {
    if !primary.is_local() {
        return Some(primary);
    }
    REMOTE_PREFERENCE.into_iter().find(|id| creds.has_key(*id))
}

fn print_event(event: &ProgressEvent) {
    println!("{event}");
}

/// Confirmation gate over stdin; `--yes` auto-approves.
struct StdinGate {
    unattended: bool,
}

impl EscalationGate for StdinGate {
    fn authorize_rescue(&self, reason: &str) -> bool {
        if self.unattended {
            return true;
        }
        print!("{reason}. Continue? [y/N] ");
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }

    fn interactive(&self) -> bool {
        !self.unattended
    }
}
