use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mill_core::EngineError;
use mill_descriptor::Invocation;
use mill_runner::{
    module_catalog, DiscardLogSink, EngineConfig, ExecutionReport, FileId, JsonlTaskLogSink,
    LogSink, ManifestFile, MemoryCache, MemoryFileStore, PhaseDispatcher, Services, SystemClock,
    Task, TaskState, ToolCatalog, ToolIntegration,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mill", version, about = "taskmill: descriptor-driven task lifecycle engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the lifecycle modules a descriptor may declare.
    Modules {
        #[arg(long)]
        json: bool,
    },
    /// Load a descriptor, resolve its modules and print the chain.
    Check {
        descriptor: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Drive one invocation through every phase with in-memory collaborators.
    Simulate {
        descriptor: PathBuf,
        #[arg(long)]
        invocation: PathBuf,
        /// JSON list of files known to the in-memory file store.
        #[arg(long)]
        files: Option<PathBuf>,
        /// File ids selected by the user, in order.
        #[arg(long = "select")]
        selected: Vec<u64>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pretend the commands ran with this exit status and save results.
        #[arg(long)]
        exit_status: Option<i32>,
        #[arg(long)]
        json: bool,
    },
    /// Zip a task work directory for debugging.
    Bundle {
        #[arg(long)]
        work_dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_payload(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Modules { json } => {
            let modules: Vec<Value> = module_catalog()
                .iter()
                .map(|m| json!({"name": m.name, "summary": m.summary}))
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "modules",
                    "modules": modules,
                })));
            }
            for entry in module_catalog() {
                println!("{:<30} {}", entry.name, entry.summary);
            }
        }
        Commands::Check { descriptor, json } => {
            let mut catalog = ToolCatalog::new();
            let tool = catalog.link_from_json_file(&descriptor)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check",
                    "tool": tool_to_json(&tool),
                })));
            }
            println!("tool: {}", tool.name());
            println!("digest: {}", tool.descriptor.digest());
            println!("inputs: {}", tool.descriptor.inputs.len());
            println!("outputs: {}", tool.descriptor.output_files.len());
            println!("chain: {}", tool.layers().join(" -> "));
        }
        Commands::Simulate {
            descriptor,
            invocation,
            files,
            selected,
            config,
            exit_status,
            json,
        } => {
            let outcome = simulate(
                &descriptor,
                &invocation,
                files.as_deref(),
                selected,
                config.as_deref(),
                exit_status,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "simulate",
                    "tool": tool_to_json(&outcome.tool),
                    "tasks": outcome.tasks.iter().map(task_to_json).collect::<Vec<_>>(),
                })));
            }
            println!("tool: {}", outcome.tool.name());
            println!("chain: {}", outcome.tool.layers().join(" -> "));
            for task in &outcome.tasks {
                print_task(task);
            }
        }
        Commands::Bundle {
            work_dir,
            out,
            json,
        } => {
            let files = mill_provenance::build_debug_bundle(&work_dir, &out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "bundle",
                    "bundle": out.display().to_string(),
                    "files": files,
                })));
            }
            println!("bundle: {} ({} files)", out.display(), files);
        }
    }
    Ok(None)
}

struct SimulationOutcome {
    tool: Arc<ToolIntegration>,
    tasks: Vec<Task>,
}

fn simulate(
    descriptor: &Path,
    invocation: &Path,
    files: Option<&Path>,
    selected: Vec<u64>,
    config: Option<&Path>,
    exit_status: Option<i32>,
) -> Result<SimulationOutcome> {
    let config = EngineConfig::resolve(config)?;
    let mut catalog = ToolCatalog::new();
    let tool = catalog.link_from_json_file(descriptor)?;

    let raw = fs::read_to_string(invocation)
        .with_context(|| format!("failed to read invocation {}", invocation.display()))?;
    let invocation = Invocation::from_value(
        serde_json::from_str(&raw)
            .map_err(|err| anyhow!("invalid invocation json {}: {}", invocation.display(), err))?,
    )?;

    let store = match files {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read files manifest {}", path.display()))?;
            let manifest: Vec<ManifestFile> = serde_json::from_str(&raw)
                .map_err(|err| anyhow!("invalid files manifest {}: {}", path.display(), err))?;
            MemoryFileStore::from_manifest(&manifest)?
        }
        None => MemoryFileStore::new(),
    };
    let clock = Arc::new(SystemClock);
    let sink: Arc<dyn LogSink> = match &config.task_log_path {
        Some(path) => Arc::new(JsonlTaskLogSink::new(path)?),
        None => Arc::new(DiscardLogSink),
    };
    let services = Services::new(
        Arc::new(store),
        Arc::new(MemoryCache::new(clock.clone())),
        clock,
        sink,
        config.listing_ttl(),
        config.listing_grace(),
    );
    let dispatcher = PhaseDispatcher::new(services, config);

    let interface_files = selected.into_iter().map(FileId).collect();
    let mut task = dispatcher.new_task(&tool, invocation, interface_files);
    dispatcher.before_form(&tool, &mut task)?;
    dispatcher.after_form(&tool, &mut task)?;
    let mut tasks = dispatcher.invoke(&tool, &mut task)?;

    for task in &mut tasks {
        // One sibling failing does not stop the others; its state records why.
        if let Err(err) = dispatcher.setup(&tool, task) {
            tracing::warn!(task = %task.id, error = %err, "setup failed");
            continue;
        }
        if let Err(err) = dispatcher.build_commands(&tool, task) {
            tracing::warn!(task = %task.id, error = %err, "command generation failed");
            continue;
        }
        if let Some(code) = exit_status {
            if let Err(err) = dispatcher.save_results(&tool, task, &ExecutionReport::exited(code)) {
                tracing::warn!(task = %task.id, error = %err, "saving results failed");
            }
        }
    }
    Ok(SimulationOutcome { tool, tasks })
}

fn tool_to_json(tool: &ToolIntegration) -> Value {
    json!({
        "name": tool.name(),
        "digest": tool.descriptor.digest(),
        "source": tool.source.as_ref().map(|p| p.display().to_string()),
        "chain": tool.layers(),
        "inputs": tool.descriptor.inputs.iter().map(|i| i.id.clone()).collect::<Vec<_>>(),
        "outputs": tool.descriptor.output_files.iter().map(|o| o.id.clone()).collect::<Vec<_>>(),
    })
}

fn task_to_json(task: &Task) -> Value {
    let failure = match &task.state {
        TaskState::Failed(failure) => serde_json::to_value(failure).unwrap_or(Value::Null),
        _ => Value::Null,
    };
    json!({
        "id": task.id,
        "state": task.state.as_str(),
        "description": task.description,
        "invocation": task.invocation.as_map(),
        "interface_files": task.interface_files,
        "work_dir": task.work_dir.as_ref().map(|p| p.display().to_string()),
        "commands": task.context.commands,
        "saved_outputs": task.context.saved_outputs,
        "failure": failure,
        "log": task.log.lines().iter().map(|l| l.message.clone()).collect::<Vec<_>>(),
    })
}

fn print_task(task: &Task) {
    println!();
    println!("task: {} ({})", task.id, task.state);
    if !task.description.is_empty() {
        println!("description: {}", task.description.replace('\n', " "));
    }
    if let Some(work_dir) = &task.work_dir {
        println!("work_dir: {}", work_dir.display());
    }
    for command in &task.context.commands {
        println!("command: {}", command);
    }
    if let TaskState::Failed(failure) = &task.state {
        println!(
            "failed in {} ({}): {}",
            failure.phase,
            failure.layer.as_deref().unwrap_or("dispatcher"),
            failure.reason
        );
    }
}

fn error_payload(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<EngineError>() {
        Some(engine) => {
            let details = match engine {
                EngineError::Validation(errors) => json!({ "validation": errors }),
                EngineError::PhaseFailure { phase, layer, .. } => {
                    json!({ "phase": phase, "layer": layer })
                }
                EngineError::UnknownModule { supported, .. } => json!({ "supported": supported }),
                EngineError::ExecutionFailure { status, .. } => json!({ "status": status }),
                _ => json!({}),
            };
            json_error(engine.code(), format!("{:#}", err), details)
        }
        None => json_error("command_failed", format!("{:#}", err), json!({})),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Modules { json }
        | Commands::Check { json, .. }
        | Commands::Simulate { json, .. }
        | Commands::Bundle { json, .. } => *json,
    }
}
