use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use scribe::auth::StaticTokenValidator;
use scribe::bootstrap;
use scribe::config::ScribeConfig;
use scribe::dlq::DlqFilter;
use scribe::orchestrator::GenerationOptions;
use scribe::progress::EventKind;
use scribe::ratelimit::SlidingWindowLimiter;
use scribe::server::{AppState, build_router};

#[derive(Parser)]
#[command(name = "scribe")]
#[command(version, about = "Citation-backed chapter generation service")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to scribe.toml; defaults to ./scribe.toml when present.
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/WS server and the background worker runtime
    Serve,
    /// Generate one chapter in-process and stream its progress
    Generate {
        topic: String,
        #[arg(long, default_value = "operator")]
        user: String,
    },
    /// Print a chapter's stage, scores, and cost
    Status { chapter_id: Uuid },
    /// Inspect and manage the dead-letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum DlqCommands {
    List {
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    Show {
        task_id: String,
    },
    Retry {
        task_id: String,
    },
    Remove {
        task_id: String,
    },
    Stats,
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and print any warnings
    Validate,
    /// Write a default scribe.toml
    Init,
}

/// Install the subscriber; file logging (daily-rolled, non-blocking) when
/// SCRIBE_LOG_DIR is set. The returned guard must live for the process.
fn init_tracing(verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "scribe=debug" } else { "scribe=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if let Ok(dir) = std::env::var("SCRIBE_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "scribe.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose);

    let config = ScribeConfig::load(cli.config_file.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Generate { topic, user } => generate(config, &topic, &user).await,
        Commands::Status { chapter_id } => status(config, chapter_id),
        Commands::Dlq { command } => dlq(config, command).await,
        Commands::Config { command } => config_command(config, command),
    }
}

fn report_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("{} {warning}", style("warning:").yellow().bold());
    }
}

async fn serve(config: ScribeConfig) -> Result<()> {
    report_warnings(&config.validate()?);
    let bind_addr = config.server.bind_addr.clone();
    let heartbeat_secs = config.server.heartbeat_secs;
    let limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limit.clone()));

    let app = bootstrap::build_default(config)?;

    // Token table from SCRIBE_API_TOKENS ("token=user,token2=user2").
    let mut validator = StaticTokenValidator::new();
    if let Ok(raw) = std::env::var("SCRIBE_API_TOKENS") {
        for pair in raw.split(',').filter(|p| !p.is_empty()) {
            if let Some((token, user)) = pair.split_once('=') {
                validator = validator.with_token(token.trim(), user.trim());
            }
        }
    }

    let state = Arc::new(AppState {
        service: app.service.clone(),
        progress: app.service.progress().clone(),
        token_validator: Arc::new(validator),
        heartbeat_secs,
    });
    let router = build_router(state, limiter);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    println!("{} listening on {bind_addr}", style("scribe").green().bold());
    axum::serve(listener, router).await.context("Server exited")?;
    Ok(())
}

async fn generate(config: ScribeConfig, topic: &str, user: &str) -> Result<()> {
    report_warnings(&config.validate()?);
    let app = bootstrap::build_default(config)?;

    let chapter_id =
        app.service
            .start_generation(user, topic, GenerationOptions::default())?;
    println!(
        "{} chapter {}",
        style("started").green().bold(),
        style(chapter_id).cyan()
    );

    let mut events = app.service.subscribe(chapter_id);
    loop {
        // If the run finished between start and subscribe, fall through to
        // the final status read instead of waiting on a closed stream.
        let event = match tokio::time::timeout(
            std::time::Duration::from_secs(2),
            events.recv(),
        )
        .await
        {
            Ok(event) => event.context("Progress stream closed")?,
            Err(_) if !app.service.is_running(chapter_id) => break,
            Err(_) => continue,
        };
        match event.event {
            EventKind::StageStart => {
                if let Some(stage) = &event.stage {
                    println!(
                        "{} {stage} ({}/14)",
                        style("stage").dim(),
                        event.stage_number.unwrap_or(0)
                    );
                }
            }
            EventKind::SectionReady => {
                if let Some(data) = &event.data {
                    println!(
                        "  {} section {} — {}",
                        style("ready").green(),
                        data["section_number"],
                        data["section_title"].as_str().unwrap_or("")
                    );
                }
            }
            EventKind::ChapterComplete => {
                println!("{}", style("chapter complete").green().bold());
                break;
            }
            EventKind::ChapterFailed => {
                let detail = event
                    .data
                    .as_ref()
                    .and_then(|d| d["message"].as_str())
                    .unwrap_or("unknown failure")
                    .to_string();
                anyhow::bail!("generation failed: {detail}");
            }
            _ => {}
        }
    }

    let chapter = app.service.get_chapter(chapter_id)?;
    println!(
        "sections: {}  cost: ${:.4}  version: {}",
        chapter.sections.len(),
        chapter.total_cost_usd,
        chapter.version
    );
    Ok(())
}

fn status(config: ScribeConfig, chapter_id: Uuid) -> Result<()> {
    // Read-only: goes straight to the store, no providers required.
    let store = scribe::store::ChapterStore::new(std::path::Path::new(&config.server.db_path))?;
    let chapter = store
        .get_chapter(chapter_id)?
        .with_context(|| format!("chapter {chapter_id} not found"))?;
    println!("{}", style(&chapter.title).bold());
    println!("status:        {}", chapter.status.as_str());
    println!("current stage: {}", chapter.current_stage);
    println!("sections:      {}", chapter.sections.len());
    println!(
        "quality:       depth {:.2}  coverage {:.2}  evidence {:.2}  currency {:.2}",
        chapter.quality.depth,
        chapter.quality.coverage,
        chapter.quality.evidence,
        chapter.quality.currency
    );
    if let Some(completeness) = chapter.completeness {
        println!("completeness:  {completeness:.2}");
    }
    if let Some(passed) = chapter.fact_check_passed {
        println!("fact check:    {}", if passed { "passed" } else { "failed (soft)" });
    }
    println!("total cost:    ${:.4}", chapter.total_cost_usd);
    if let Some(kind) = chapter.failure_kind {
        println!(
            "{} {} — {}",
            style("failure:").red().bold(),
            kind,
            chapter.failure_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn dlq(config: ScribeConfig, command: DlqCommands) -> Result<()> {
    let app = bootstrap::build_default(config)?;
    match command {
        DlqCommands::List {
            task,
            limit,
            offset,
        } => {
            let filter = DlqFilter {
                task_name: task,
                ..Default::default()
            };
            let entries = app.dlq.list(&filter, limit, offset).await?;
            if entries.is_empty() {
                println!("dead-letter queue is empty");
            }
            for entry in entries {
                println!(
                    "{}  {}  {}  {}",
                    entry.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    style(&entry.task_name).cyan(),
                    entry.task_id,
                    style(entry.error_kind).red()
                );
            }
        }
        DlqCommands::Show { task_id } => match app.dlq.get(&task_id).await? {
            Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
            None => println!("no entry for task {task_id}"),
        },
        DlqCommands::Retry { task_id } => {
            let entry = app.dlq.retry(&task_id, app.runtime.as_ref()).await?;
            println!(
                "re-enqueued {} onto the {} queue",
                style(&entry.task_id).cyan(),
                entry.queue
            );
        }
        DlqCommands::Remove { task_id } => {
            if app.dlq.remove(&task_id).await? {
                println!("removed {task_id}");
            } else {
                println!("no entry for task {task_id}");
            }
        }
        DlqCommands::Stats => {
            let stats = app.dlq.statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        DlqCommands::Cleanup { days } => {
            let removed = app.dlq.cleanup(days).await?;
            println!("removed {removed} entries");
        }
    }
    Ok(())
}

fn config_command(config: ScribeConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command.unwrap_or(ConfigCommands::Show) {
        ConfigCommands::Show => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Validate => match config.validate() {
            Ok(warnings) if warnings.is_empty() => {
                println!("{}", style("configuration is valid").green());
            }
            Ok(warnings) => {
                report_warnings(&warnings);
                println!("valid with {} warning(s)", warnings.len());
            }
            Err(err) => {
                eprintln!("{} {err}", style("invalid:").red().bold());
                std::process::exit(1);
            }
        },
        ConfigCommands::Init => {
            let path = std::path::Path::new("scribe.toml");
            if path.exists() {
                anyhow::bail!("scribe.toml already exists");
            }
            std::fs::write(
                path,
                toml::to_string_pretty(&ScribeConfig::default_with_providers())?,
            )?;
            println!("wrote scribe.toml");
        }
    }
    Ok(())
}
