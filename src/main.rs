//! # keystone
//!
//! Command-line front end for the synthesis pipeline: seed projects and
//! brainstorms, run synthesis (SSE frames on stdout), promote, convert,
//! and inspect snapshots.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use keystone_core::ids::{BrainstormId, OutputId, ProjectId, SnapshotId, SystemId};
use keystone_core::models::{BrainstormSource, NewBrainstorm, SnapshotTrigger};
use keystone_core::provider::{CompletionOptions, CompletionProvider};
use keystone_llm::{create_provider, ProviderConfig};
use keystone_store::{BrainstormRepo, Database, OutputRepo, ProjectRepo, SnapshotLinks};
use keystone_synthesis::convert::details_for;
use keystone_synthesis::{
    proposed_edges, AssemblyMode, ContextBuilder, ConversionEngine, ConversionRequest, EvolveSession,
    PromotionService, RefinementSession, RunnerConfig, SnapshotService, SynthesisRequest,
    SynthesisRunner, SystemSelection,
};
use keystone_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Game-design synthesis pipeline.
#[derive(Parser, Debug)]
#[command(name = "keystone", about = "Brainstorm synthesis for game-design planning")]
struct Cli {
    /// Path to the SQLite database.
    #[arg(long, env = "KEYSTONE_DB")]
    db: Option<PathBuf>,

    /// AI provider (`anthropic` or `openai`).
    #[arg(long, env = "KEYSTONE_PROVIDER", default_value = "anthropic")]
    provider: String,

    /// Model override; defaults to the provider's default model.
    #[arg(long, env = "KEYSTONE_MODEL")]
    model: Option<String>,

    /// Log output format (`json` or `pretty`).
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn default_db_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".keystone").join("keystone.db")
    }

    fn provider(&self) -> Result<Arc<dyn CompletionProvider>> {
        let mut config = ProviderConfig::new(&self.provider);
        if let Some(model) = &self.model {
            config = config.with_model(model);
        }
        Ok(create_provider(&config)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or list projects.
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Capture brainstorm notes.
    #[command(subcommand)]
    Brainstorm(BrainstormCommand),
    /// Run synthesis for a brainstorm and stream SSE frames to stdout.
    Synthesize(SynthesizeArgs),
    /// Move suggested candidates into the extracted lists.
    Promote(PromoteArgs),
    /// Persist the extracted candidates of an output as systems.
    Convert(ConvertArgs),
    /// Continue a synthesis conversationally.
    Refine {
        #[arg(long)]
        output: String,
        message: String,
    },
    /// Discuss and update one system.
    Evolve {
        #[arg(long)]
        system: String,
        message: String,
    },
    /// Record or inspect context snapshots.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum BrainstormCommand {
    Add {
        #[arg(long)]
        project: String,
        #[arg(long)]
        title: String,
        /// Read content from a file instead of `--content`.
        #[arg(long, conflicts_with = "content")]
        file: Option<PathBuf>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long, default_value = "manual")]
        source: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    List {
        #[arg(long)]
        project: String,
    },
}

#[derive(Args, Debug)]
struct SynthesizeArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    brainstorm: String,
    /// `rerun` or `update-context`.
    #[arg(long, default_value = "rerun")]
    mode: AssemblyMode,
    #[arg(long)]
    max_tokens: Option<u32>,
}

#[derive(Args, Debug)]
struct PromoteArgs {
    #[arg(long)]
    output: String,
    #[arg(long = "system")]
    systems: Vec<usize>,
    #[arg(long = "detail")]
    details: Vec<usize>,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    #[arg(long)]
    output: String,
    /// Candidate slugs to discard instead of create.
    #[arg(long = "discard")]
    discard: Vec<String>,
    /// Merge a candidate into an existing system: `slug=sys_id`.
    #[arg(long = "merge")]
    merge: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Build the full context now and record it.
    Capture {
        #[arg(long)]
        project: String,
    },
    Latest {
        #[arg(long)]
        project: String,
    },
    /// Changes since a snapshot (the latest one by default).
    Delta {
        #[arg(long)]
        project: String,
        #[arg(long)]
        since: Option<String>,
    },
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig::from_env()?;
    if let Some(format) = cli.log_format {
        telemetry.format = format;
    }
    init_telemetry(&telemetry)?;

    let db_path = cli.db.clone().unwrap_or_else(Cli::default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    match &cli.command {
        Command::Project(cmd) => project(&db, cmd),
        Command::Brainstorm(cmd) => brainstorm(&db, cmd),
        Command::Synthesize(args) => synthesize(&cli, db, args).await,
        Command::Promote(args) => {
            let output = PromotionService::new(db).promote(
                &OutputId::from_raw(&args.output),
                &args.systems,
                &args.details,
            )?;
            print_json(&output)
        }
        Command::Convert(args) => convert(db, args),
        Command::Refine { output, message } => {
            let session = RefinementSession::new(cli.provider()?, db, CompletionOptions::default());
            let outcome = session
                .refine(&OutputId::from_raw(output), message, &ctrl_c_token())
                .await?;
            println!("{}", outcome.reply.content);
            print_json(&json!({ "replaced": outcome.replaced, "tier": outcome.tier }))
        }
        Command::Evolve { system, message } => {
            let session = EvolveSession::new(cli.provider()?, db, CompletionOptions::default());
            let outcome = session
                .evolve(&SystemId::from_raw(system), message, &ctrl_c_token())
                .await?;
            println!("{}", outcome.reply.content);
            print_json(&outcome.system)
        }
        Command::Snapshot(cmd) => snapshot(&db, cmd),
    }
}

/// Cancellation token tripped by Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

fn project(db: &Database, cmd: &ProjectCommand) -> Result<()> {
    let repo = ProjectRepo::new(db.clone());
    match cmd {
        ProjectCommand::Create { name, description } => {
            print_json(&repo.create(name, description.as_deref())?)
        }
        ProjectCommand::List => print_json(&repo.list()?),
    }
}

fn brainstorm(db: &Database, cmd: &BrainstormCommand) -> Result<()> {
    let repo = BrainstormRepo::new(db.clone());
    match cmd {
        BrainstormCommand::Add {
            project,
            title,
            file,
            content,
            source,
            author,
            tags,
        } => {
            let content = match (file, content) {
                (Some(path), _) => std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, Some(text)) => text.clone(),
                (None, None) => anyhow::bail!("either --file or --content is required"),
            };
            let source: BrainstormSource = source.parse().map_err(anyhow::Error::msg)?;
            let session = repo.create(
                &ProjectId::from_raw(project),
                NewBrainstorm {
                    title: title.clone(),
                    source: Some(source),
                    content,
                    author: author.clone(),
                    tags: tags.clone(),
                    source_thread_refs: Vec::new(),
                },
            )?;
            print_json(&session)
        }
        BrainstormCommand::List { project } => {
            print_json(&repo.list_for_project(&ProjectId::from_raw(project))?)
        }
    }
}

async fn synthesize(cli: &Cli, db: Database, args: &SynthesizeArgs) -> Result<()> {
    let mut config = RunnerConfig::default();
    if let Some(max_tokens) = args.max_tokens {
        config.options = config.options.with_max_tokens(max_tokens);
    }

    let (event_tx, mut event_rx) = broadcast::channel(1024);
    let runner = SynthesisRunner::new(cli.provider()?, db, config, event_tx);

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    let _ = stdout.write_all(event.to_sse_frame().as_bytes());
                    let _ = stdout.flush();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = runner
        .run(
            SynthesisRequest {
                project_id: ProjectId::from_raw(&args.project),
                brainstorm_id: BrainstormId::from_raw(&args.brainstorm),
                mode: args.mode,
            },
            &ctrl_c_token(),
        )
        .await;
    drop(runner);
    printer.await?;

    let outcome = outcome?;
    if let Some(error) = &outcome.error {
        anyhow::bail!("synthesis {} failed: {}", outcome.output.id, error.message);
    }
    Ok(())
}

fn convert(db: Database, args: &ConvertArgs) -> Result<()> {
    let output_id = OutputId::from_raw(&args.output);
    let output = OutputRepo::new(db.clone()).get(&output_id)?;

    let mut merges = Vec::new();
    for spec in &args.merge {
        let (slug, id) = spec
            .split_once('=')
            .with_context(|| format!("expected slug=system_id, got {spec}"))?;
        merges.push((keystone_synthesis::slugify(slug), SystemId::from_raw(id)));
    }

    let selections = output
        .extracted_systems
        .iter()
        .map(|candidate| {
            let slug = keystone_synthesis::convert::candidate_slug(candidate);
            let details = details_for(candidate, &output.extracted_system_details);
            let selection = if args.discard.iter().any(|d| keystone_synthesis::slugify(d) == slug) {
                SystemSelection::discard(candidate.clone())
            } else if let Some((_, id)) = merges.iter().find(|(s, _)| *s == slug) {
                SystemSelection::merge(candidate.clone(), id.clone())
            } else {
                SystemSelection::create(candidate.clone())
            };
            selection.with_details(details)
        })
        .collect();

    let result = ConversionEngine::new(db).convert(ConversionRequest {
        project_id: output.project_id.clone(),
        output_id: Some(output_id),
        selections,
        edges: proposed_edges(&output.extracted_systems),
    })?;
    print_json(&result)
}

fn snapshot(db: &Database, cmd: &SnapshotCommand) -> Result<()> {
    let service = SnapshotService::new(db.clone());
    match cmd {
        SnapshotCommand::Capture { project } => print_json(&service.capture(
            &ProjectId::from_raw(project),
            SnapshotTrigger::Manual,
            SnapshotLinks::default(),
        )?),
        SnapshotCommand::Latest { project } => {
            print_json(&service.latest(&ProjectId::from_raw(project))?)
        }
        SnapshotCommand::Delta { project, since } => {
            let project_id = ProjectId::from_raw(project);
            let builder = ContextBuilder::new(db.clone());
            let changes = match since {
                Some(id) => builder.build_delta_since_snapshot_id(&project_id, &SnapshotId::from_raw(id))?,
                None => {
                    let latest = service
                        .latest(&project_id)?
                        .with_context(|| format!("project {project_id} has no snapshot yet"))?;
                    builder.build_delta_since_snapshot(&project_id, &latest)?
                }
            };
            print_json(&changes)
        }
    }
}
