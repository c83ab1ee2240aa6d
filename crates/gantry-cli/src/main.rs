//! CLI binary for running, inspecting and debugging Gantry pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_stream::StreamExt;

use gantry_pipeline::qa::{self, QaPipeline, StageRecord};
use gantry_pipeline::{
    validate, validate_interrupts, CheckpointStore, EngineConfig, EventKind, EventStream, PipelineEngine,
    PipelineEvent, RunRegistry, Severity, TranscriptGenerator,
};
use gantry_recover::Recovery;
use gantry_types::{Run, RunStatus};

#[derive(Parser)]
#[command(name = "gantry", version, about = "Stage-graph runner for generative pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run registry directory (overrides the config file)
    #[arg(long, global = true, env = "GANTRY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON engine config file
    #[arg(long, global = true, env = "GANTRY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List runs, most recent first
    Runs,

    /// Show a run's metadata and checkpoint
    Show {
        run_id: String,
    },

    /// List a run's artifacts, or print one
    Artifacts {
        run_id: String,

        /// Print the content of this artifact
        #[arg(short, long)]
        print: Option<String>,
    },

    /// Run the recovery pipeline over a saved stage reply
    Recover {
        /// File holding the raw generator output
        file: PathBuf,

        /// Stage whose schema the output must match (e.g. Reviewer)
        #[arg(short, long)]
        schema: String,

        /// Parse the extracted candidate without repair rules
        #[arg(long)]
        no_repair: bool,
    },

    /// Lint the QA reference pipeline
    Validate {
        /// Interrupt set to check against the pipeline
        #[arg(long, value_delimiter = ',')]
        interrupts: Vec<String>,
    },

    /// Start a QA run replaying saved stage replies
    Run {
        /// Directory of `<Stage>.txt` replies
        #[arg(short, long)]
        transcripts: PathBuf,

        /// Product idea passed to the ProductManager
        #[arg(short, long)]
        idea: String,

        /// Run title (defaults to the idea)
        #[arg(long)]
        title: Option<String>,

        #[arg(long, value_enum, default_value = "full")]
        mode: StartMode,

        /// Extra input fields as a JSON object (e.g. an existing srs)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Pause before the human-review stages
        #[arg(long)]
        hitl: bool,

        /// Print streamed token chunks
        #[arg(long)]
        stream: bool,
    },

    /// Resume a paused or interrupted run
    Resume {
        run_id: String,

        /// Directory of `<Stage>.txt` replies
        #[arg(short, long)]
        transcripts: PathBuf,

        /// Keep pausing before the human-review stages
        #[arg(long)]
        hitl: bool,

        /// Print streamed token chunks
        #[arg(long)]
        stream: bool,
    },

    /// Stop a paused run
    Stop {
        run_id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StartMode {
    Full,
    StsOnly,
    TestsOnly,
}

impl StartMode {
    fn as_str(self) -> &'static str {
        match self {
            StartMode::Full => "full",
            StartMode::StsOnly => "sts_only",
            StartMode::TestsOnly => "tests_only",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_deref(), cli.data_dir).await?;

    match cli.command {
        Commands::Runs => cmd_runs(&config).await?,
        Commands::Show { run_id } => cmd_show(&config, &run_id).await?,
        Commands::Artifacts { run_id, print } => cmd_artifacts(&config, &run_id, print.as_deref()).await?,
        Commands::Recover { file, schema, no_repair } => cmd_recover(&file, &schema, no_repair)?,
        Commands::Validate { interrupts } => cmd_validate(&interrupts)?,
        Commands::Run {
            transcripts,
            idea,
            title,
            mode,
            input,
            hitl,
            stream,
        } => {
            let mut payload = match input {
                Some(path) => read_input(&path)?,
                None => serde_json::Map::new(),
            };
            payload.insert("product_idea".into(), serde_json::Value::String(idea.clone()));
            payload.insert("start_mode".into(), serde_json::Value::String(mode.as_str().into()));
            let run = Run::new(qa::PIPELINE_NAME, title.unwrap_or(idea), serde_json::Value::Object(payload));
            cmd_run(&config, &transcripts, Launch::Start(run), hitl, stream).await?;
        }
        Commands::Resume {
            run_id,
            transcripts,
            hitl,
            stream,
        } => cmd_run(&config, &transcripts, Launch::Resume(run_id), hitl, stream).await?,
        Commands::Stop { run_id } => cmd_stop(&config, &run_id).await?,
    }

    Ok(())
}

async fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = data_dir {
        config = config.with_data_dir(dir);
    }
    Ok(config)
}

fn read_input(path: &Path) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str::<serde_json::Value>(&text)? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("--input must hold a JSON object, found {}", other),
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

async fn cmd_runs(config: &EngineConfig) -> anyhow::Result<()> {
    let engine = PipelineEngine::from_config(config);
    let runs = engine.list_runs().await?;
    if runs.is_empty() {
        println!("No runs in {}", config.data_dir.display());
        return Ok(());
    }
    for meta in runs {
        println!(
            "{:<48} {:<10} {:<8} {}  {}",
            meta.id,
            meta.status.as_str(),
            meta.pipeline,
            meta.created_at.format("%Y-%m-%d %H:%M:%S"),
            meta.title
        );
    }
    Ok(())
}

async fn cmd_show(config: &EngineConfig, run_id: &str) -> anyhow::Result<()> {
    let engine = PipelineEngine::from_config(config);
    let store = engine.store();
    let Some(meta) = store.get(run_id).await? else {
        anyhow::bail!("run '{}' not found", run_id);
    };
    println!("{}", serde_json::to_string_pretty(&meta)?);

    match store.load_checkpoint(run_id).await? {
        Some(checkpoint) => {
            println!("\nCheckpoint ({})", checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S"));
            println!("  Next stage: {}", checkpoint.pending_stage_id);
            if !checkpoint.queued.is_empty() {
                println!("  Queued: {}", checkpoint.queued.join(", "));
            }
            let filled: Vec<&str> = checkpoint
                .fields
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, _)| k.as_str())
                .collect();
            println!("  Fields: {}", filled.join(", "));
            for (counter, count) in &checkpoint.retry_counters {
                println!("  {}: {}", counter, count);
            }
            for failure in &checkpoint.errors {
                println!("  [{}] {}", failure.stage, failure.message);
            }
            println!("  Tokens: {}", checkpoint.usage.total_tokens);
        }
        None => println!("\nNo checkpoint"),
    }
    Ok(())
}

async fn cmd_artifacts(config: &EngineConfig, run_id: &str, print: Option<&str>) -> anyhow::Result<()> {
    let engine = PipelineEngine::from_config(config);
    if let Some(name) = print {
        match engine.fetch_artifact(run_id, name).await? {
            Some(content) => print!("{}", content),
            None => anyhow::bail!("artifact '{}' not found for run '{}'", name, run_id),
        }
        return Ok(());
    }

    let manifest = engine.store().manifest(run_id).await?;
    if manifest.is_empty() {
        println!("No artifacts");
    }
    for record in manifest {
        println!(
            "{:<28} {:<14} {:<14} {}",
            record.name, record.category, record.stage, record.location
        );
    }
    Ok(())
}

fn cmd_recover(path: &Path, stage: &str, no_repair: bool) -> anyhow::Result<()> {
    let Some(schema) = qa::schema_for(stage) else {
        anyhow::bail!(
            "unknown stage '{}'; expected one of: {}",
            stage,
            qa::DEFAULT_INTERRUPTS
                .iter()
                .chain([qa::PRODUCT_MANAGER, qa::EXECUTOR].iter())
                .copied()
                .collect::<Vec<_>>()
                .join(", ")
        );
    };
    let text = std::fs::read_to_string(path)?;
    let recovery = if no_repair { Recovery::without_repair() } else { Recovery::new() };

    let record = match recovery.recover(&text, &schema) {
        Ok(record) => record,
        Err(e) => {
            eprintln!("Recovery failed: {}", e);
            std::process::exit(1);
        }
    };
    let typed = StageRecord::from_record(stage, record)?;
    println!("{}", serde_json::to_string_pretty(&typed)?);
    Ok(())
}

fn cmd_validate(interrupts: &[String]) -> anyhow::Result<()> {
    // Linting never calls the generator.
    let definition = QaPipeline::new(Arc::new(TranscriptGenerator::new("."))).build()?;
    let mut diagnostics = validate(&definition);
    diagnostics.extend(validate_interrupts(&definition, interrupts));

    if diagnostics.is_empty() {
        println!("Pipeline '{}' is valid", definition.name);
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
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

enum Launch {
    Start(Run),
    Resume(String),
}

async fn cmd_run(config: &EngineConfig, transcripts: &Path, launch: Launch, hitl: bool, stream: bool) -> anyhow::Result<()> {
    let engine = Arc::new(PipelineEngine::from_config(config));
    engine.register(QaPipeline::new(Arc::new(TranscriptGenerator::new(transcripts))).build()?);
    let interrupts = if hitl { qa::default_interrupts() } else { Vec::new() };

    let printer = tokio::spawn(print_events(engine.subscribe(), stream));

    let (run_id, handle) = match launch {
        Launch::Start(run) => {
            let id = run.id.clone();
            println!("Starting run {}", id);
            (id, engine.spawn_start(run, interrupts)?)
        }
        Launch::Resume(id) => {
            println!("Resuming run {}", id);
            let handle = engine.spawn_resume(&id, interrupts)?;
            (id, handle)
        }
    };

    let watcher = {
        let engine = Arc::clone(&engine);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nStopping run {}; the current stage finishes first", run_id);
                if let Err(e) = engine.request_stop(&run_id).await {
                    tracing::warn!(run = %run_id, error = %e, "Stop request failed");
                }
            }
        })
    };

    let outcome = handle.await?;
    watcher.abort();

    // The printer's stream ends after everything the run published.
    engine.bus().close_subscribers();
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "Event printer failed");
    }

    let run = outcome?;
    println!("\nRun {} finished with status: {}", run.id, run.status);
    if run.status == RunStatus::Paused {
        println!("Resume with: gantry resume {} --transcripts {}", run.id, transcripts.display());
    }
    for failure in &run.errors {
        println!("  [{}] {}", failure.stage, failure.message);
        for detail in &failure.errors {
            println!("      {}", detail);
        }
    }
    println!("Tokens: {}", run.usage.total_tokens);
    Ok(())
}

async fn print_events(mut events: EventStream, stream: bool) {
    while let Some(event) = events.next().await {
        print_event(&event, stream);
    }
}

fn print_event(event: &PipelineEvent, stream: bool) {
    let p = &event.payload;
    match event.kind {
        EventKind::Start => println!("== {} ({})", p["title"].as_str().unwrap_or(""), p["pipeline"].as_str().unwrap_or("")),
        EventKind::StageStart => println!("-> {}", p["stage"].as_str().unwrap_or("?")),
        EventKind::StageComplete => {
            let mark = if p["success"].as_bool().unwrap_or(false) { "ok" } else { "FAILED" };
            println!("<- {} [{}] {}", p["stage"].as_str().unwrap_or("?"), mark, p["message"].as_str().unwrap_or(""));
        }
        EventKind::ArtifactProduced => println!("   + {}", p["location"].as_str().unwrap_or("?")),
        EventKind::TokenChunk if stream => print!("{}", p["text"].as_str().unwrap_or("")),
        EventKind::TokenChunk => {}
        EventKind::Paused => println!("|| paused before {}", p["stage"].as_str().unwrap_or("?")),
        EventKind::Completed => println!("== {}", p["status"].as_str().unwrap_or("?")),
        EventKind::Error => eprintln!("!! {}", p["message"].as_str().unwrap_or("?")),
    }
}

async fn cmd_stop(config: &EngineConfig, run_id: &str) -> anyhow::Result<()> {
    let engine = PipelineEngine::from_config(config);
    if engine.request_stop(run_id).await? {
        println!("Run {} stopped", run_id);
    } else {
        println!("Run {} had already finished", run_id);
    }
    Ok(())
}
