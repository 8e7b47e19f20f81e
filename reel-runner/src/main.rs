use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use reel::SimulatedBackend;
use reel_runner::actions;
use reel_runner::artifacts::ArtifactStore;
use reel_runner::config::{ConfigOverrides, RunnerConfig};
use reel_runner::control::{control_channel, ControlHandle, OperatorCommand};
use reel_runner::duration_parser::parse_duration;
use reel_runner::event_bus;
use reel_runner::resolver::ScriptResolver;
use reel_runner::runner::{RunStatus, ScriptRunner};
use reel_runner::step::{Step, StepKind};
use reel_runner::utils::{init_logging, parse_var};
use serde_json::Map;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "reel")]
#[command(about = "Run declarative UI workflow scripts with self-healing retries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Script file (YAML or JSON)
    script: PathBuf,

    /// Attempts per step before the run fails
    #[clap(long, env = "REEL_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Directory for state.json, steps.jsonl and error records
    #[clap(long = "artifacts", env = "REEL_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    /// Default timeout for each backend action (e.g. "30s", "500ms")
    #[clap(long, value_parser = parse_timeout)]
    action_timeout: Option<Duration>,

    /// Seed a variable: --var key=value (repeatable)
    #[clap(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,

    /// Make the simulated backend reject targets it does not know
    #[clap(long)]
    strict: bool,

    /// Initial location of the simulated surface
    #[clap(long, default_value = "about:blank")]
    location: String,

    /// Skip the first N main steps
    #[clap(long, conflicts_with = "resume")]
    start_at: Option<usize>,

    /// Continue after the last step recorded in the artifacts directory
    #[clap(long, requires = "artifacts_dir")]
    resume: bool,

    /// Print run events to stderr as JSON lines
    #[clap(long)]
    events: bool,
}

#[derive(Parser, Debug)]
struct ScriptArgs {
    /// Script file (YAML or JSON)
    script: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script against the simulated backend. Reads reload, skip, quit
    /// and continue commands from stdin.
    Run(RunArgs),
    /// Print the flattened script as YAML
    Resolve(ScriptArgs),
    /// Resolve and parse every step, reporting problems
    Check(ScriptArgs),
}

fn parse_timeout(input: &str) -> Result<Duration, String> {
    parse_duration(input).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging()?;

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Resolve(args) => resolve(&args.script),
        Commands::Check(args) => check(&args.script),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut vars = Map::new();
    for entry in &args.vars {
        let (key, value) = parse_var(entry)?;
        vars.insert(key, value);
    }

    let start_at = match (&args.artifacts_dir, args.resume) {
        (Some(dir), true) => match ArtifactStore::load_state(dir) {
            Some(state) => {
                info!("Resuming after step {} ({})", state.index, state.action);
                state.index + 1
            }
            None => {
                warn!("No saved state in {}; starting from the beginning", dir.display());
                0
            }
        },
        _ => args.start_at.unwrap_or(0),
    };

    let backend = Arc::new(
        SimulatedBackend::new()
            .strict(args.strict)
            .with_location(args.location.clone()),
    );
    let (handle, controls) = control_channel();
    spawn_command_reader(handle);
    if args.events {
        spawn_event_tail();
    }

    let overrides = ConfigOverrides {
        max_attempts: args.max_attempts,
        artifacts_dir: args.artifacts_dir.clone(),
        action_timeout: args.action_timeout,
    };
    let report = ScriptRunner::new(backend)
        .with_config(RunnerConfig::default())
        .with_overrides(overrides)
        .with_controls(controls)
        .with_vars(vars)
        .start_at(start_at)
        .run_file(&args.script)
        .await
        .with_context(|| format!("Could not run {}", args.script.display()))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.status {
        RunStatus::Failed => Err(anyhow!(
            "Run failed: {}",
            report
                .failure
                .as_ref()
                .map(|f| format!("step {} {}: {}", f.step_index, f.kind, f.message))
                .unwrap_or_else(|| "unknown error".to_string())
        )),
        RunStatus::Completed | RunStatus::Quit => Ok(()),
    }
}

/// Forward operator commands typed on stdin. A plain thread, so a pending read
/// never holds up runtime shutdown.
fn spawn_command_reader(handle: ControlHandle) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match line.parse::<OperatorCommand>() {
                Ok(command) => {
                    if !handle.send(command) {
                        break;
                    }
                }
                Err(e) => eprintln!("{e} (expected reload, skip, quit or continue)"),
            }
        }
    });
}

fn spawn_event_tail() {
    let mut events = event_bus::subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => eprintln!("{event}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    eprintln!("{{\"event\":\"events.lagged\",\"missed\":{missed}}}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn resolve(script: &Path) -> Result<()> {
    let flat = ScriptResolver::new().resolve_file(script)?;
    print!("{}", flat.to_script().to_yaml()?);
    Ok(())
}

fn check(script: &Path) -> Result<()> {
    let resolver = ScriptResolver::new();
    let flat = resolver.resolve_file(script)?;

    let mut unknown = Vec::new();
    for step in flat.setup.iter().chain(&flat.steps).chain(&flat.teardown) {
        collect_unknown_actions(step, &resolver, &flat.base_dir, &mut unknown);
    }

    println!(
        "{}: {} setup, {} steps, {} teardown, {} source files",
        script.display(),
        flat.setup.len(),
        flat.steps.len(),
        flat.teardown.len(),
        flat.sources.len()
    );
    for name in &unknown {
        println!("warning: '{name}' is not a built-in action or a sub-script");
    }
    Ok(())
}

fn collect_unknown_actions(step: &Step, resolver: &ScriptResolver, base: &Path, out: &mut Vec<String>) {
    match &step.kind {
        StepKind::Action { name, .. }
            if !actions::is_known(name) && resolver.find_script(name, base).is_none() =>
        {
            out.push(step.action_name());
        }
        StepKind::Compose { target, .. } => out.push(format!("compose:{target}")),
        _ => {}
    }
    for child in step.children() {
        collect_unknown_actions(child, resolver, base, out);
    }
}
