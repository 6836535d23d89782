use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use surgsim_simulationengine::{
    boundary::parse_json, AdvanceOutcome, ComplicationResponse, EngineConfig, FinalAssessment,
    GenerateSimulationRequest, SimulationEngine, StepSubmission,
};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "simctl", version, about = "Surgical training simulator driver")]
struct Cli {
    /// Engine configuration (TOML); defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Appends CLI events to this JSON-lines file.
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lists catalog procedures.
    Procedures,
    /// Generates a plan and prints it.
    Generate {
        /// Creation request (JSON).
        #[arg(long)]
        request: PathBuf,
        /// Overrides the request seed.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Plays a scripted trainee through a session and prints the final report.
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Creation request (JSON).
    #[arg(long)]
    request: PathBuf,
    /// Trainee script (JSON).
    #[arg(long)]
    script: PathBuf,
    /// Overrides the request seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Writes the final report here as well as to stdout.
    #[arg(long)]
    report: Option<PathBuf>,
}

/// Scripted trainee behaviour, one entry per step in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TraineeScript {
    #[serde(default)]
    steps: Vec<ScriptedStep>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScriptedStep {
    #[serde(default)]
    actions: Vec<Value>,
    #[serde(default)]
    time_taken: f64,
    /// Response to a complication firing after this step; absent means the trainee
    /// lets it time out.
    #[serde(default)]
    complication: Option<ComplicationResponse>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = SimulationEngine::from_config(config)?;
    let log = cli.log.as_deref();
    match cli.command {
        Commands::Procedures => {
            for procedure in engine.procedures() {
                let levels: Vec<&str> = procedure.difficulties.iter().map(|d| d.label()).collect();
                println!(
                    "{} | {} | {} | {} steps | {}",
                    procedure.id,
                    procedure.name,
                    procedure.category,
                    procedure.step_count,
                    levels.join(",")
                );
            }
            Ok(())
        }
        Commands::Generate { request, seed } => {
            let request = read_request(&request, seed)?;
            let envelope = engine.generate(request)?;
            log_cli_event(
                log,
                LogLevel::Info,
                "simctl.generated",
                json!({ "simulation_id": envelope.simulation_id.to_string() }),
            )?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            engine.abandon(envelope.simulation_id)?;
            Ok(())
        }
        Commands::Run(args) => handle_run(&engine, &args, log),
    }
}

fn handle_run(engine: &SimulationEngine, args: &RunArgs, log: Option<&Path>) -> Result<()> {
    let request = read_request(&args.request, args.seed)?;
    let raw = fs::read_to_string(&args.script)
        .with_context(|| format!("reading script {}", args.script.display()))?;
    let script: TraineeScript = parse_json(&raw)?;

    let envelope = engine.generate(request)?;
    let id = envelope.simulation_id;
    println!(
        "session {id} | {} | {} | {} steps | {} complications",
        envelope.simulation.procedure_info.name,
        envelope.simulation.difficulty_level,
        envelope.simulation.steps.len(),
        envelope.simulation.complications.len()
    );
    log_cli_event(
        log,
        LogLevel::Info,
        "simctl.run.started",
        json!({ "simulation_id": id.to_string(), "script": args.script }),
    )?;

    match play(engine, id, &script) {
        Ok(report) => {
            let rendered = serde_json::to_string_pretty(&report)?;
            if let Some(path) = &args.report {
                fs::write(path, &rendered)
                    .with_context(|| format!("writing report {}", path.display()))?;
            }
            println!("{rendered}");
            log_cli_event(
                log,
                LogLevel::Info,
                "simctl.run.completed",
                json!({
                    "simulation_id": id.to_string(),
                    "certification_level": report.certification_level.label(),
                }),
            )?;
            Ok(())
        }
        Err(err) => {
            let _ = engine.abandon(id);
            log_cli_event(
                log,
                LogLevel::Error,
                "simctl.run.failed",
                json!({ "simulation_id": id.to_string(), "error": err.to_string() }),
            )?;
            Err(err)
        }
    }
}

fn play(engine: &SimulationEngine, id: Uuid, script: &TraineeScript) -> Result<FinalAssessment> {
    let mut step = 1;
    for scripted in &script.steps {
        let submission = StepSubmission {
            step_number: step,
            actions: scripted.actions.clone(),
            time_taken: scripted.time_taken,
        };
        let outcome = engine.submit_step(id, &submission)?;
        let vitals = engine.vitals(id)?;
        println!(
            "step {} {} | score {} | hr {:.0} bp {:.0}/{:.0} spo2 {:.0} | {:?}",
            outcome.assessment.step_index,
            outcome.assessment.step_title,
            outcome.assessment.overall_score,
            vitals.vitals.heart_rate,
            vitals.vitals.blood_pressure.systolic,
            vitals.vitals.blood_pressure.diastolic,
            vitals.vitals.oxygen_saturation,
            vitals.status
        );
        step = match outcome.next {
            AdvanceOutcome::Advanced { step: next } => next,
            AdvanceOutcome::Completed => return Ok(engine.complete(id)?),
            AdvanceOutcome::ComplicationTriggered { complication } => {
                println!(
                    "complication {} ({:?}) before step {}",
                    complication.kind, complication.severity, complication.trigger_step
                );
                let response = scripted.complication.clone().unwrap_or_default();
                let resolved = engine.resolve_complication(id, response)?;
                println!(
                    "  resolved: timed_out={} accuracy={:.1}",
                    resolved.resolution.timed_out, resolved.resolution.accuracy
                );
                match resolved.next {
                    AdvanceOutcome::Advanced { step: next } => next,
                    AdvanceOutcome::Completed => return Ok(engine.complete(id)?),
                    AdvanceOutcome::ComplicationTriggered { .. } => {
                        bail!("complication left pending after resolution")
                    }
                }
            }
        };
    }
    bail!(
        "script has {} steps but the session is still on step {step}",
        script.steps.len()
    )
}

fn read_request(path: &Path, seed: Option<u64>) -> Result<GenerateSimulationRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading request {}", path.display()))?;
    let mut request: GenerateSimulationRequest = parse_json(&raw)?;
    if seed.is_some() {
        request.seed = seed;
    }
    Ok(request)
}

fn log_cli_event(path: Option<&Path>, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let logger = JsonLogger::new(path)?;
    let mut record = LogRecord::new("simctl", level, message);
    if let Some(obj) = metadata.as_object() {
        record.metadata = obj.clone();
    }
    logger.log(&record)
}
