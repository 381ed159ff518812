//! Stackwright CLI entrypoint.
//!
//! Results go to stdout in the selected format; logs, prompts and
//! messages go to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stackwright::cli::{Cli, Commands, OutputFormatter, StateCommands};
use stackwright::config::{ConfigParser, ConfigValidator, StackConfig, find_config_file};
use stackwright::engine::{Orchestrator, open_provider, open_state_store};
use stackwright::error::Result;
use stackwright::graph::GraphBuilder;
use stackwright::planner::{CancellationFlag, Plan};
use stackwright::provider::Provider;
use stackwright::state::StateStore;

use clap::Parser;
use clap::error::ErrorKind;
use colored::Colorize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const STACK_TEMPLATE: &str = include_str!("../templates/stackwright.yaml");
const ENV_TEMPLATE: &str = include_str!("../templates/.env.example");

/// Exit code for a run that finished but left work undone.
const EXIT_PARTIAL: u8 = 1;
/// Exit code for bad arguments or a missing stack file.
const EXIT_INVOCATION: u8 = 3;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_INVOCATION,
            };
            // Nothing left to report to if stderr itself is gone
            e.print().ok();
            return ExitCode::from(code);
        }
    };

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system. Logs always go to stderr.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_env("STACKWRIGHT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Graph => cmd_graph(config_path, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config_path, yes, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Writes a starter stack.
fn cmd_init(path: &Path, force: bool) -> Result<u8> {
    info!("Initializing new stack in: {}", path.display());

    let stack_path = path.join("stackwright.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && stack_path.exists() {
        eprintln!("Stack file already exists: {}", stack_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(EXIT_INVOCATION);
    }

    std::fs::create_dir_all(path)?;

    std::fs::write(&stack_path, STACK_TEMPLATE)?;
    eprintln!("Created: {}", stack_path.display());

    std::fs::write(&env_path, ENV_TEMPLATE)?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".stackwright/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Stackwright")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.stackwright/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Edit stackwright.yaml to describe your resources");
    eprintln!("  2. Run 'stackwright validate' to check it");
    eprintln!("  3. Run 'stackwright plan' to see what would change");
    eprintln!("  4. Run 'stackwright apply' to provision it");

    Ok(0)
}

/// Validates the stack file and its dependency graph.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, _base) = load_stack(config_path)?;

    let result = ConfigValidator::new().validate(&config)?;
    let graph = GraphBuilder::build(&config.spec_set()?)?;
    debug!("Graph has {} resources and {} edges", graph.len(), graph.edge_count());

    emit(&formatter.format_validation(&config, &result, show_warnings))?;
    Ok(0)
}

/// Shows resources in dependency order.
fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<u8> {
    let (config, _base) = load_stack(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let graph = GraphBuilder::build(&config.spec_set()?)?;
    emit(&formatter.format_graph(&graph))?;
    Ok(0)
}

/// Shows the plan.
async fn cmd_plan(config_path: Option<&Path>, detailed: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, base) = load_stack(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let store = open_state_store(&config, &base).await?;
    let provider = open_provider(&config, &base)?;
    let engine = Orchestrator::from_config(&config, &provider, &store)?;

    let plan = engine.plan().await?;
    emit(&formatter.format_plan(&plan, detailed))?;
    Ok(0)
}

/// Computes the plan and applies it.
async fn cmd_apply(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, base) = load_stack(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let store = open_state_store(&config, &base).await?;
    let provider = open_provider(&config, &base)?;
    let cancellation = watch_ctrl_c();
    let engine = Orchestrator::from_config(&config, &provider, &store)?.with_cancellation(cancellation);

    let plan = engine.plan().await?;
    if plan.is_empty() {
        emit(&formatter.format_plan(&plan, false))?;
        return Ok(0);
    }

    if !auto_approve {
        eprintln!("{}", formatter.format_plan(&plan, false));
        let answer = prompt("Do you want to apply this plan? [y/N]: ")?;
        if !answer.eq_ignore_ascii_case("y") {
            eprintln!("Apply cancelled.");
            return Ok(0);
        }
    }

    execute(&engine, plan, formatter).await
}

/// Deletes everything recorded in state.
async fn cmd_destroy(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, base) = load_stack(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let store = open_state_store(&config, &base).await?;
    let provider = open_provider(&config, &base)?;
    let cancellation = watch_ctrl_c();
    let engine = Orchestrator::from_config(&config, &provider, &store)?.with_cancellation(cancellation);

    let plan = engine.plan_destroy().await?;
    if plan.is_empty() {
        eprintln!("Nothing to destroy.");
        return Ok(0);
    }

    if !auto_approve {
        eprintln!("{}", formatter.format_plan(&plan, false));
        let answer = prompt("This action is IRREVERSIBLE. Type 'destroy' to confirm: ")?;
        if answer != "destroy" {
            eprintln!("Destroy cancelled.");
            return Ok(0);
        }
    }

    execute(&engine, plan, formatter).await
}

/// State management commands.
async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    let (config, base) = load_stack(config_path)?;
    let store = open_state_store(&config, &base).await?;

    match command {
        StateCommands::Show => {
            let snapshot = store.load().await?;
            let lock = store.lock_info().await?;
            emit(&formatter.format_state(store.backend_type(), &snapshot, lock.as_ref()))?;
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(&formatter.warning("State forcefully unlocked."))?;
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(&formatter.success("State unlocked."))?;
            } else {
                eprintln!("{}", formatter.error("Please provide --lock-id or use --force"));
                return Ok(EXIT_INVOCATION);
            }
        }
    }

    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Applies a plan and reports the outcome.
async fn execute<P: Provider, S: StateStore>(
    engine: &Orchestrator<'_, P, S>,
    plan: Plan,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let result = engine.apply(plan).await?;
    emit(&formatter.format_apply(&result))?;

    if result.is_success() {
        Ok(0)
    } else {
        if !result.pending.is_empty() {
            warn!("{} changes were not applied", result.pending.len());
        }
        Ok(EXIT_PARTIAL)
    }
}

/// Trips the returned flag on the first Ctrl-C. The op in flight finishes.
fn watch_ctrl_c() -> CancellationFlag {
    let flag = CancellationFlag::new();
    let trip = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current change");
            trip.cancel();
        }
    });
    flag
}

/// Loads, overrides and returns the stack along with its directory.
fn load_stack(config_path: Option<&Path>) -> Result<(StackConfig, PathBuf)> {
    let stack_file = config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))?;
    let base = stack_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    debug!("Loading stack from: {}", stack_file.display());

    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&stack_file)?;

    Ok((config, base))
}

/// Reads one trimmed line from stdin after printing `question` to stderr.
fn prompt(question: &str) -> Result<String> {
    eprint!("{question}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Writes a command result to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", output.trim_end())?;
    Ok(())
}
