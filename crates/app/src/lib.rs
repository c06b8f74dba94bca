use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use seqflow_core::config::{config_path, data_dir, initialize_data_dir, RuntimeConfig};
use seqflow_core::debug_event::{format_value_preview, RuntimeEvent, VALUE_PREVIEW_MAX_CHARS};
use seqflow_core::debugger::{ComponentRef, DebuggerCommand};
use seqflow_core::graph::Project;
use seqflow_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use seqflow_core::registry::{build_default_registry, BehaviorRegistry};
use seqflow_core::scheduler::{Scheduler, TickOutcome};
use seqflow_core::types::Value;
use seqflow_core::vm::protocol::HostMessage;
use seqflow_core::vm::trace::TraceEvent;
use seqflow_core::vm::{compile_project, GraphModule, VmBridge};

#[derive(Parser)]
#[command(name = "seqflow", about = "Run and debug flow-based programs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every page flow of a project and tick until idle.
    Run(RunArgs),
    /// Check a project against the builtin behaviors.
    Validate(ValidateArgs),
    /// List the builtin behaviors and their ports.
    Behaviors,
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to project JSON file")]
    project: PathBuf,
    #[arg(long, help = "Attach the debugger and print a snapshot at every halt")]
    debug: bool,
    #[arg(
        long = "break",
        value_name = "FLOW/COMPONENT",
        help = "Add a breakpoint (repeatable, implies --debug)"
    )]
    breakpoints: Vec<String>,
    #[arg(long, help = "Maximum ticks before giving up (defaults to config)")]
    ticks: Option<usize>,
    #[arg(long, help = "Run the project inside the sandboxed module bridge")]
    vm: bool,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(help = "Path to project JSON file")]
    project: PathBuf,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    let config = load_config(&resolved_data_dir);

    match cli.command {
        Commands::Run(run) if run.vm => run_in_vm(run, &config).await,
        Commands::Run(run) => run_project(run, &config).await,
        Commands::Validate(args) => validate_project(&args.project),
        Commands::Behaviors => {
            print_behaviors(&build_default_registry());
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { log_dir, appender } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            debug!(log_dir = %log_dir.display(), "file logging enabled");
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> RuntimeConfig {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %error, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    debug!(config_path = %cfg_path.display(), "loading runtime config");
    match RuntimeConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %error, "Failed to load config file, using defaults");
            RuntimeConfig::default()
        }
    }
}

fn load_project(path: &Path) -> Result<Project> {
    if !path.exists() {
        bail!("Project file does not exist: {}", path.display());
    }
    info!("Loading project: {}", path.display());
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read project file: {}", path.display()))?;
    Project::from_json(&raw).with_context(|| format!("Invalid project: {}", path.display()))
}

fn validate_project(path: &Path) -> Result<()> {
    let project = load_project(path)?;
    project
        .validate(&build_default_registry())
        .context("Project validation failed")?;
    println!(
        "{}: {} flow(s), {} global(s) OK",
        path.display(),
        project.flows.len(),
        project.globals.len()
    );
    Ok(())
}

fn print_behaviors(registry: &BehaviorRegistry) {
    for name in registry.list_behaviors() {
        let Ok(behavior) = registry.get(name) else {
            continue;
        };
        let ports = |ports: Vec<seqflow_core::node::PortDefinition>| {
            ports
                .iter()
                .map(|port| {
                    let marker = if port.required { "*" } else { "" };
                    format!("{}{marker}:{:?}", port.name, port.port_type)
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "{name}\n  inputs:  {}\n  outputs: {}",
            ports(behavior.input_ports()),
            ports(behavior.output_ports())
        );
    }
}

async fn run_project(args: RunArgs, config: &RuntimeConfig) -> Result<()> {
    let project = load_project(&args.project)?;
    let registry = Arc::new(build_default_registry());
    let mut scheduler =
        Scheduler::with_options(project, registry, config.scheduler.options())
            .context("Project validation failed")?;

    let debugging = args.debug || !args.breakpoints.is_empty() || config.debugger.attach_on_start;
    if debugging {
        scheduler.apply_debugger_command(DebuggerCommand::Attach)?;
        for raw in &args.breakpoints {
            let target = ComponentRef::parse(raw)?;
            scheduler.apply_debugger_command(DebuggerCommand::AddBreakpoint { target })?;
        }
        if config.debugger.break_on_start {
            scheduler.apply_debugger_command(DebuggerCommand::Pause)?;
        }
    }

    let pages = scheduler.start_page_flows();
    info!(pages = pages.len(), "page flows started");

    let max_ticks = args.ticks.unwrap_or(config.scheduler.max_ticks);
    let interval = Duration::from_millis(config.scheduler.tick_interval_ms.max(1));
    let mut ticks = 0;
    loop {
        if ticks >= max_ticks {
            warn!(max_ticks, "tick limit reached");
            break;
        }
        ticks += 1;

        let outcome = scheduler.tick_all()?;
        report_events(scheduler.drain_events());
        match outcome {
            TickOutcome::Paused => {
                let snapshot = scheduler.debug_snapshot();
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                scheduler.apply_debugger_command(DebuggerCommand::Continue)?;
            }
            TickOutcome::Executed(count) => debug!(tick = ticks, executed = count, "tick"),
            TickOutcome::Idle if scheduler.has_running_records() => {
                tokio::time::sleep(interval).await;
            }
            TickOutcome::Idle => break,
        }
    }

    info!(ticks, "run finished");
    for (name, value) in scheduler.globals() {
        println!("{name} = {}", preview(value));
    }
    for handle in scheduler.flow_states() {
        let Some(state) = scheduler.flow_state(handle) else {
            continue;
        };
        for (name, value) in state.variables() {
            println!(
                "{}.{name} = {}",
                scheduler.flow_name(handle).unwrap_or("?"),
                preview(value)
            );
        }
    }
    Ok(())
}

async fn run_in_vm(args: RunArgs, config: &RuntimeConfig) -> Result<()> {
    if args.debug || !args.breakpoints.is_empty() {
        warn!("debugging is not available with --vm; ignoring debugger flags");
    }
    let project = load_project(&args.project)?;
    let registry = Arc::new(build_default_registry());
    let blob = compile_project(&project, &registry).context("Project validation failed")?;

    let module = GraphModule::new(Arc::clone(&registry), config.vm.options());
    let mut bridge = VmBridge::spawn(module)?;
    bridge.send(&HostMessage {
        graph: Some(blob),
        ..HostMessage::default()
    })?;

    let max_ticks = args.ticks.unwrap_or(config.scheduler.max_ticks);
    let interval = Duration::from_millis(config.scheduler.tick_interval_ms.max(1));
    let mut quiet_ticks = 0;
    for tick in 1..=max_ticks {
        if tick > 1 {
            bridge.send(&HostMessage::default())?;
        }
        let reply = tokio::task::block_in_place(|| bridge.wait_message())?;
        if let Some(frame) = reply.frame {
            debug!(width = frame.width, height = frame.height, "frame synced");
        }

        let events = bridge.poll_traces();
        if events.is_empty() {
            // Give async work a few chances to deliver before calling it idle.
            quiet_ticks += 1;
            if quiet_ticks > 3 {
                break;
            }
            tokio::time::sleep(interval).await;
            continue;
        }
        quiet_ticks = 0;
        for event in events {
            report_trace(&event);
        }
    }

    bridge.shutdown();
    info!("module run finished");
    Ok(())
}

fn report_events(events: Vec<RuntimeEvent>) {
    for event in events {
        match event {
            RuntimeEvent::Log(record) => match record.fault {
                Some(kind) => warn!(fault = ?kind, component = ?record.component, "{}", record.message),
                None => info!(component = ?record.component, "{}", record.message),
            },
            RuntimeEvent::ValuePropagated {
                flow,
                component,
                output,
                value,
            } => debug!(%flow, %component, %output, value = %preview(&value), "propagated"),
            other => debug!(event = ?other, "runtime event"),
        }
    }
}

fn report_trace(event: &TraceEvent) {
    match event {
        TraceEvent::Log { severity, message } => info!(severity = ?severity, "{message}"),
        other => debug!(event = ?other, "module trace"),
    }
}

fn preview(value: &Value) -> String {
    let (text, truncated) = format_value_preview(value, VALUE_PREVIEW_MAX_CHARS);
    if truncated {
        format!("{text}...")
    } else {
        text
    }
}
