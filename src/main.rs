use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use conductor::agent::{AgentClient, MockAgentClient, SystemAgentClient};
use conductor::config::Config;
use conductor::context::RunScope;
use conductor::error::EngineError;
use conductor::pipeline::executor::{self, RunOptions};
use conductor::pipeline::{self, PipelineSpec};
use conductor::session::{self, SessionPaths, SessionStatus};
use conductor::stage::Resolution;
use conductor::state::StateStore;
use conductor::{lock, logging};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Iterative agent pipeline engine for LLM coding-agent CLIs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Suppress the framed run reports
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline (or a single stage with --single-stage)
    Pipeline {
        /// Pipeline file or name; with --single-stage the first positional
        /// is the session name instead
        target: Option<String>,

        /// Session name (defaults to the pipeline/stage name)
        session: Option<String>,

        /// Max iterations (single-stage only)
        max_iterations: Option<u32>,

        /// Run one stage type as a synthesized one-stage pipeline
        #[arg(long)]
        single_stage: Option<String>,

        /// Displace an existing session lock after a warning
        #[arg(long)]
        force: bool,

        /// Resume a failed or crashed session
        #[arg(long)]
        resume: bool,

        /// Initial input file, directory, or glob (repeatable)
        #[arg(long = "input")]
        inputs: Vec<String>,

        /// Provider override (beats env and stage config)
        #[arg(long)]
        provider: Option<String>,

        /// Model override (beats env and stage config)
        #[arg(long)]
        model: Option<String>,
    },

    /// Show a session's classification and resume hint
    Status {
        /// Session name
        session: String,
    },

    /// List sessions under the sessions root
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = rewrite_stage_shortcut(std::env::args().collect());
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return Ok(());
        }
        Err(err) => {
            // Usage errors exit 1, like every other failure.
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Pipeline {
            target,
            session,
            max_iterations,
            single_stage,
            force,
            resume,
            inputs,
            provider,
            model,
        } => {
            let request = PipelineRequest {
                target,
                session,
                max_iterations,
                single_stage,
                force,
                resume,
                inputs,
                provider,
                model,
            };
            cmd_pipeline(&config, request, cli.debug, cli.quiet).await
        }
        Commands::Status { session } => {
            let _logging = logging::init_stderr_logging(&config, cli.debug)?;
            cmd_status(&config, &session)
        }
        Commands::Sessions => {
            let _logging = logging::init_stderr_logging(&config, cli.debug)?;
            cmd_sessions(&config)
        }
    }
}

/// `conductor <stage-type> …` is shorthand for
/// `conductor pipeline --single-stage <stage-type> …` when the first free
/// argument names a known stage directory.
fn rewrite_stage_shortcut(args: Vec<String>) -> Vec<String> {
    let Some(first) = args.get(1) else {
        return args;
    };
    if first.starts_with('-') || ["pipeline", "status", "sessions", "help"].contains(&first.as_str())
    {
        return args;
    }
    let config = Config::load(None).unwrap_or_default();
    if !conductor::stage::is_known_stage_type(&config, first) {
        return args;
    }

    let mut rewritten = vec![args[0].clone(), "pipeline".to_string()];
    rewritten.push("--single-stage".to_string());
    rewritten.push(first.clone());
    rewritten.extend(args.into_iter().skip(2));
    rewritten
}

struct PipelineRequest {
    target: Option<String>,
    session: Option<String>,
    max_iterations: Option<u32>,
    single_stage: Option<String>,
    force: bool,
    resume: bool,
    inputs: Vec<String>,
    provider: Option<String>,
    model: Option<String>,
}

async fn cmd_pipeline(
    config: &Config,
    request: PipelineRequest,
    debug: bool,
    quiet: bool,
) -> Result<()> {
    let resolution = Resolution {
        cli_provider: request.provider.clone(),
        cli_model: request.model.clone(),
        ..Resolution::default()
    };

    // With --single-stage the positionals shift left: target is the session
    // name, session is the max-iteration count.
    let (spec, session_arg, definition_text) = match &request.single_stage {
        Some(stage_type) => {
            let session_arg = request.target.clone();
            let max_iterations = request
                .session
                .as_deref()
                .map(str::parse::<u32>)
                .transpose()
                .map_err(|_| anyhow::anyhow!("max_iterations must be a number"))?
                .or(request.max_iterations);
            let spec = pipeline::single_stage_pipeline(
                config,
                stage_type,
                &resolution,
                max_iterations,
            )?;
            (spec, session_arg, None)
        }
        None => {
            let target = request
                .target
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("pipeline requires a file or name"))?;
            let file = pipeline::resolve_pipeline_file(config, target)?;
            let (raw, text) = pipeline::load_pipeline_file(&file)?;
            let spec = pipeline::normalize(&raw, config, &resolution)?;
            (spec, request.session.clone(), Some(text))
        }
    };

    let session = session_arg.unwrap_or_else(|| spec.name.clone());
    session::validate_session_name(&session)?;

    let status = session::classify_session(config, &session)?;
    if request.resume {
        match status {
            SessionStatus::Failed => {}
            SessionStatus::None => {
                eprintln!("Error: nothing to resume: session '{session}' has no prior state");
                std::process::exit(1);
            }
            SessionStatus::Active { pid } => {
                eprintln!("Error: session '{session}' is still running (pid {pid})");
                std::process::exit(1);
            }
            SessionStatus::Completed => {
                eprintln!("Error: session '{session}' already completed; start a new session");
                std::process::exit(1);
            }
        }
    }

    let paths = SessionPaths::new(&config.sessions_root(), &session);
    std::fs::create_dir_all(paths.run_dir())?;
    let logging_handle = logging::init_session_logging(config, paths.run_dir(), debug)?;

    // Clear leftovers from crashed engines before contending for our lock.
    let _ = lock::cleanup_stale(&config.locks_root());

    let guard = match lock::acquire(&config.locks_root(), &session, request.force) {
        Ok(guard) => guard,
        Err(lock::LockError::Busy { pid, .. }) => {
            eprintln!("Error: session '{session}' is locked by running process {pid}");
            eprintln!("Use --force to displace it.");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let scope = RunScope::new(&session, &spec.name, paths, config.clone());
    let agent: Arc<dyn AgentClient> = if config.agents.mock_mode {
        Arc::new(MockAgentClient::new())
    } else {
        Arc::new(SystemAgentClient::new())
    };
    let options = RunOptions {
        resume: request.resume,
        cli_inputs: request.inputs.clone(),
        definition_text,
    };

    let result = {
        let run = executor::run_pipeline(&scope, &spec, agent, &options);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            () = shutdown_signal() => {
                eprintln!("Interrupted; releasing session lock.");
                guard.release();
                std::process::exit(1);
            }
        }
    };

    match result {
        Ok(report) => {
            drop(guard);
            if !quiet {
                print_success(&report);
            }
            if let Some(log) = logging_handle.log_file_path {
                eprintln!("Session log: {}", log.display());
            }
            Ok(())
        }
        Err(err) => {
            drop(guard);
            print_failure(&scope, &spec, &request, &session, &err, quiet);
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn print_success(report: &executor::PipelineReport) {
    println!("{}", "─".repeat(60));
    println!("  Session complete: {}", report.session);
    println!("  Stages:           {}", report.stages_total);
    println!("  Reason:           {}", report.completion_reason);
    println!("  Output:           {}", report.run_dir.display());
    println!("{}", "─".repeat(60));
}

fn print_failure(
    scope: &RunScope,
    spec: &PipelineSpec,
    request: &PipelineRequest,
    session: &str,
    err: &EngineError,
    quiet: bool,
) {
    let (stage, iteration) = StateStore::open(&scope.scope.state_file())
        .map(|store| {
            let state = store.state();
            let stage = state
                .stages
                .iter()
                .find(|s| s.index == state.current_stage)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            (stage, state.iteration)
        })
        .unwrap_or_default();

    if !quiet {
        eprintln!("{}", "─".repeat(60));
        eprintln!("  Session failed: {session}");
        if !stage.is_empty() {
            eprintln!("  Stage:          {stage}");
        }
        eprintln!("  Iteration:      {iteration}");
        eprintln!("  Error:          {err}");
        eprintln!("{}", "─".repeat(60));
    }

    if err.resumable() {
        let resume_cmd = match &request.single_stage {
            Some(stage_type) => {
                format!("conductor pipeline --single-stage {stage_type} {session} --resume")
            }
            None => format!(
                "conductor pipeline {} {session} --resume",
                request.target.as_deref().unwrap_or(&spec.name)
            ),
        };
        eprintln!("Resume with: {resume_cmd}");
    } else {
        eprintln!("This failure is not resumable; inspect the session state first.");
    }
}

fn cmd_status(config: &Config, session: &str) -> Result<()> {
    session::validate_session_name(session)?;
    let status = session::classify_session(config, session)?;
    println!("{session}: {}", status.label());

    if status == SessionStatus::Failed {
        let paths = SessionPaths::new(&config.sessions_root(), session);
        if let Ok(store) = StateStore::open(&paths.state_file()) {
            let state = store.state();
            if let Some(error) = &state.error {
                println!("  error: {} ({})", error.message, error.error_type);
            }
            println!("  completed iterations: {}", state.iteration_completed);
            println!("  resume from:          {}", store.get_resume_iteration());
            println!("  resume with: conductor pipeline <definition> {session} --resume");
        }
    }
    Ok(())
}

fn cmd_sessions(config: &Config) -> Result<()> {
    let root = config.sessions_root();
    let entries = conductor::fsutil::sorted_entries(&root, |_| true)?;
    let sessions: Vec<_> = entries.iter().filter(|p| p.is_dir()).collect();

    if sessions.is_empty() {
        println!("No sessions under {}", root.display());
        return Ok(());
    }

    println!("Sessions ({})", sessions.len());
    println!("{}", "─".repeat(60));
    for dir in sessions {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let status = session::classify_session(config, name)?;
        let icon = match status {
            SessionStatus::Active { .. } => "▶",
            SessionStatus::Completed => "✓",
            SessionStatus::Failed => "✗",
            SessionStatus::None => "?",
        };
        println!("{icon} {name} [{}]", status.label());
    }
    Ok(())
}
