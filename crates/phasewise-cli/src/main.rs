//! CLI binary for querying and validating phasewise workflow decisions.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use phasewise_engine::{EngineConfig, Severity, WorkflowEngine, WorkflowSchema};
use phasewise_types::{CycleInputs, HistoryRecord};
use serde::Deserialize;
use tracing::debug;

#[derive(Parser)]
#[command(name = "phasewise", version, about = "Workflow decisions for structure-solution pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct EngineArgs {
    /// Workflow schema JSON (default: built-in schema)
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Engine configuration JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Treat unknown condition keywords as errors
    #[arg(long)]
    strict: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide the phase and valid programs for one cycle
    Decide {
        /// Path to the cycle inputs JSON
        inputs: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Explain why a program is not available
    Explain {
        /// Program name (short names like "refine" are accepted)
        program: String,

        /// Path to the cycle inputs JSON
        inputs: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Lint a workflow schema
    Validate {
        /// Schema to lint (default: built-in schema)
        #[arg(long)]
        schema: Option<PathBuf>,
    },

    /// Print the built-in workflow schema
    Schema,
}

/// Cycle inputs as read from disk. `records` is an alternative to a
/// pre-aggregated `history`.
#[derive(Deserialize)]
struct DecisionRequest {
    #[serde(flatten)]
    inputs: CycleInputs,
    #[serde(default)]
    records: Vec<HistoryRecord>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Decide { inputs, engine } => cmd_decide(&inputs, &engine)?,
        Commands::Explain {
            program,
            inputs,
            engine,
        } => cmd_explain(&program, &inputs, &engine)?,
        Commands::Validate { schema } => cmd_validate(schema.as_deref())?,
        Commands::Schema => cmd_schema()?,
    }

    Ok(())
}

fn load_schema(path: Option<&Path>) -> anyhow::Result<WorkflowSchema> {
    let schema = match path {
        Some(p) => WorkflowSchema::load(p)
            .with_context(|| format!("failed to load schema {}", p.display()))?,
        None => WorkflowSchema::builtin()?,
    };
    Ok(schema)
}

fn build_engine(args: &EngineArgs) -> anyhow::Result<WorkflowEngine> {
    let config = match &args.config {
        Some(p) => EngineConfig::load(p)
            .with_context(|| format!("failed to load config {}", p.display()))?,
        None => EngineConfig::default(),
    };
    let config = if args.strict {
        config.with_strict_conditions(true)
    } else {
        config
    };
    Ok(WorkflowEngine::new(load_schema(args.schema.as_deref())?, config))
}

fn load_inputs(path: &Path, engine: &WorkflowEngine) -> anyhow::Result<CycleInputs> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let request: DecisionRequest = serde_json::from_str(&source)
        .with_context(|| format!("invalid cycle inputs in {}", path.display()))?;
    let mut inputs = request.inputs;
    if !request.records.is_empty() {
        debug!(records = request.records.len(), "aggregating history from raw records");
        let flags = std::mem::take(&mut inputs.history.flags);
        inputs.history = engine.history_from_records(&request.records);
        inputs.history.flags = flags;
    }
    Ok(inputs)
}

fn cmd_decide(path: &Path, args: &EngineArgs) -> anyhow::Result<()> {
    let engine = build_engine(args)?;
    let inputs = load_inputs(path, &engine)?;
    let state = engine.workflow_state(&inputs)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn cmd_explain(program: &str, path: &Path, args: &EngineArgs) -> anyhow::Result<()> {
    let engine = build_engine(args)?;
    let inputs = load_inputs(path, &engine)?;
    let ctx = engine.build_context(&inputs);
    match engine.explain_unavailable(program, &ctx)? {
        Some(why) => println!("{program}: {why}"),
        None => println!("{program}: available"),
    }
    Ok(())
}

fn cmd_validate(path: Option<&Path>) -> anyhow::Result<()> {
    let schema = load_schema(path)?;
    let diagnostics = phasewise_engine::validate(&schema);

    if diagnostics.is_empty() {
        println!("Schema is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
        if let Some(fix) = &diag.fix {
            println!("    fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_schema() -> anyhow::Result<()> {
    let schema = WorkflowSchema::builtin()?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
