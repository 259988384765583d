//! CLI command definitions, routing, and tracing setup.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use gleaner_core::{
    BlockingPool, EvaluateOptions, Evaluator, KeywordPolicy, Pipeline, ProcessingOptions,
    ProcessingRequest, ProgressReporter, RunSummary, SilentProgress, SystemClock, TickSummary,
};
use gleaner_crawler::CancelToken;
use gleaner_shared::{
    AppConfig, ArtifactId, Source, SourceEntry, SourceType, init_config, load_config,
};
use gleaner_storage::{ContentStore, Storage, open_data_dir};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Gleaner: ingest, normalize and evaluate documents from scheduled sources.
#[derive(Parser)]
#[command(
    name = "gleaner",
    version,
    about = "Crawl configured sources, store deduplicated artifacts, extract text and score it against rubrics.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the scheduler loop until interrupted.
    Run {
        /// Run every due source once, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Source registry management.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Crawl one source now, regardless of its schedule.
    Crawl {
        /// Source name or id.
        source: String,
    },

    /// Normalize an artifact and print the processing response as JSON.
    Process {
        /// Artifact id. Omit with `--pending`.
        artifact: Option<String>,

        /// Re-normalize a normalized artifact or retry a failed one.
        #[arg(long)]
        force: bool,

        /// Normalize every artifact still in `fetched` instead.
        #[arg(long, conflicts_with = "artifact")]
        pending: bool,

        /// Maximum artifacts for `--pending`.
        #[arg(long, default_value = "500")]
        limit: u32,
    },

    /// Evaluate an artifact's latest normalized text against a rubric.
    Evaluate {
        /// Artifact id.
        artifact: String,

        /// Rubric name.
        #[arg(long)]
        rubric: String,

        /// Pin a rubric version (defaults to the latest).
        #[arg(long)]
        version: Option<u32>,

        /// Score again even if the document is unchanged.
        #[arg(long)]
        force: bool,
    },

    /// Rubric management.
    Rubric {
        #[command(subcommand)]
        action: RubricAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Source subcommands.
#[derive(Subcommand)]
pub(crate) enum SourceAction {
    /// Register a new source.
    Add {
        /// Unique source name.
        name: String,

        /// Root URL (site root, feed URL or API listing).
        url: String,

        /// Source type: feed, site or api.
        #[arg(long = "type", default_value = "site")]
        source_type: String,

        /// Cron schedule (5, 6 or 7 fields).
        #[arg(long, default_value = "0 */4 * * *")]
        schedule: String,

        /// Minimum delay between requests to one host, in ms.
        #[arg(long)]
        delay_ms: Option<u64>,

        /// In-flight fetches per crawl run.
        #[arg(long)]
        concurrency: Option<u32>,

        /// Maximum link depth; seeds are depth 0.
        #[arg(long)]
        max_depth: Option<u32>,
    },
    /// List registered sources.
    List,
    /// Re-activate a source.
    Activate {
        /// Source name or id.
        source: String,
    },
    /// Soft-deactivate a source.
    Deactivate {
        /// Source name or id.
        source: String,

        /// Reason shown in `source list`.
        #[arg(long, default_value = "deactivated by operator")]
        reason: String,
    },
    /// Register or update the `[[sources]]` declared in the config file.
    Sync,
}

/// Rubric subcommands.
#[derive(Subcommand)]
pub(crate) enum RubricAction {
    /// Publish criteria as the next version of a rubric.
    Publish {
        /// Rubric name.
        name: String,

        /// Path to a JSON file, or an inline JSON object.
        criteria: String,
    },
    /// List every published rubric version.
    List,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "gleaner=info,gleaner_core=info,gleaner_crawler=info",
        1 => "gleaner=debug,gleaner_core=debug,gleaner_crawler=debug,gleaner_normalize=debug",
        _ => "gleaner=trace,gleaner_core=trace,gleaner_crawler=trace,gleaner_normalize=trace,gleaner_storage=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { once } => cmd_run(once).await,
        Command::Source { action } => match action {
            SourceAction::Add {
                name,
                url,
                source_type,
                schedule,
                delay_ms,
                concurrency,
                max_depth,
            } => {
                let entry = SourceEntry {
                    name,
                    url,
                    source_type: source_type.parse::<SourceType>()?,
                    schedule,
                    is_active: true,
                    delay_ms,
                    concurrency,
                    max_depth,
                    follow: None,
                };
                cmd_source_add(&entry).await
            }
            SourceAction::List => cmd_source_list().await,
            SourceAction::Activate { source } => cmd_source_set_active(&source, true, None).await,
            SourceAction::Deactivate { source, reason } => {
                cmd_source_set_active(&source, false, Some(&reason)).await
            }
            SourceAction::Sync => cmd_source_sync().await,
        },
        Command::Crawl { source } => cmd_crawl(&source).await,
        Command::Process {
            artifact,
            force,
            pending,
            limit,
        } => match (artifact, pending) {
            (_, true) => cmd_process_pending(limit).await,
            (Some(artifact), false) => cmd_process(&artifact, force).await,
            (None, false) => Err(eyre!("an artifact id or --pending is required")),
        },
        Command::Evaluate {
            artifact,
            rubric,
            version,
            force,
        } => cmd_evaluate(&artifact, &rubric, version, force).await,
        Command::Rubric { action } => match action {
            RubricAction::Publish { name, criteria } => cmd_rubric_publish(&name, &criteria).await,
            RubricAction::List => cmd_rubric_list().await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

async fn open_stores(config: &AppConfig) -> Result<(Arc<Storage>, Arc<ContentStore>)> {
    let data_dir = config.storage.data_path()?;
    let (storage, store) = open_data_dir(&data_dir).await?;
    Ok((Arc::new(storage), Arc::new(store)))
}

async fn lookup_source(storage: &Storage, key: &str) -> Result<Source> {
    storage
        .find_source(key)
        .await?
        .ok_or_else(|| eyre!("no source named or with id '{key}'"))
}

fn parse_artifact_id(raw: &str) -> Result<ArtifactId> {
    raw.parse()
        .map_err(|e| eyre!("invalid artifact id '{raw}': {e}"))
}

/// A token cancelled by Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            handle.cancel();
        }
    });
    token
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn crawl_started(&self, source: &Source) {
        self.spinner.set_message(format!("Crawling {} ({})", source.name, source.url));
    }

    fn crawl_finished(&self, run: &RunSummary) {
        self.spinner.println(format!(
            "  {:<24} {:<22} fetched {:>4}  new {:>4}  failed {:>3}",
            run.source_name,
            run.status,
            run.report.fetched,
            run.report.new_artifacts,
            run.report.failed.len()
        ));
    }

    fn done(&self, _tick: &TickSummary) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(once: bool) -> Result<()> {
    let config = load_config()?;
    let (storage, store) = open_stores(&config).await?;
    let pipeline = Pipeline::from_config(&config, storage, store)?;
    let cancel = cancel_on_ctrl_c();

    if once {
        pipeline.seed().await?;
        let progress = Arc::new(CliProgress::new());
        let tick = pipeline.run_due(Utc::now(), &cancel, progress).await?;

        println!();
        println!("  Runs:         {}", tick.runs.len());
        println!("  Timed out:    {}", tick.timed_out.len());
        println!("  Deactivated:  {}", tick.deactivated.len());
        println!("  Swept:        {} normalized, {} failed", tick.swept.normalized.len(), tick.swept.failed.len());
        println!("  Time:         {:.1}s", tick.elapsed.as_secs_f64());
        println!();
        for (id, error) in &tick.errors {
            eprintln!("  source {id} aborted: {error}");
        }
        if !tick.errors.is_empty() {
            return Err(eyre!("{} crawl run(s) aborted", tick.errors.len()));
        }
        return Ok(());
    }

    info!("starting scheduler loop, press Ctrl-C to stop");
    pipeline
        .run_forever(Arc::new(SystemClock), &cancel, Arc::new(SilentProgress))
        .await?;
    Ok(())
}

async fn cmd_source_add(entry: &SourceEntry) -> Result<()> {
    let config = load_config()?;
    let source = entry.to_source(&config.defaults)?;
    let (storage, _) = open_stores(&config).await?;
    storage.insert_source(&source).await?;
    info!(source = %source.name, id = %source.id, "source registered");
    println!("Added source {} ({})", source.name, source.id);
    Ok(())
}

async fn cmd_source_list() -> Result<()> {
    let config = load_config()?;
    let (storage, _) = open_stores(&config).await?;
    let sources = storage.list_sources().await?;
    if sources.is_empty() {
        println!("No sources registered. Add one with `gleaner source add` or `gleaner source sync`.");
        return Ok(());
    }

    println!(
        "{:<24} {:<6} {:<16} {:<8} URL",
        "NAME", "TYPE", "SCHEDULE", "ACTIVE"
    );
    for s in &sources {
        println!(
            "{:<24} {:<6} {:<16} {:<8} {}",
            s.name,
            s.source_type,
            s.schedule,
            if s.is_active { "yes" } else { "no" },
            s.url
        );
        if let Some(reason) = &s.deactivated_reason {
            println!("{:<24} └ {reason}", "");
        }
    }
    Ok(())
}

async fn cmd_source_set_active(key: &str, active: bool, reason: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let (storage, _) = open_stores(&config).await?;
    let source = lookup_source(&storage, key).await?;
    storage.set_source_active(&source.id, active, reason).await?;
    let state = if active { "activated" } else { "deactivated" };
    info!(source = %source.name, state, "source updated");
    println!("Source {} {state}", source.name);
    Ok(())
}

async fn cmd_source_sync() -> Result<()> {
    let config = load_config()?;
    if config.sources.is_empty() {
        println!("No [[sources]] declared in the config file.");
        return Ok(());
    }
    let (storage, _) = open_stores(&config).await?;

    let (mut created, mut updated) = (0, 0);
    for entry in &config.sources {
        let source = entry.to_source(&config.defaults)?;
        let (stored, is_new) = storage.sync_source(&source).await?;
        if is_new {
            created += 1;
        } else {
            updated += 1;
        }
        info!(source = %stored.name, id = %stored.id, is_new, "source synced");
    }
    println!("Synced sources: {created} added, {updated} updated");
    Ok(())
}

async fn cmd_crawl(key: &str) -> Result<()> {
    let config = load_config()?;
    let (storage, store) = open_stores(&config).await?;
    let source = lookup_source(&storage, key).await?;
    let pipeline = Pipeline::from_config(&config, storage, store)?;
    pipeline.seed().await?;

    let cancel = cancel_on_ctrl_c();
    let progress = CliProgress::new();
    let run = pipeline.run_source(&source, &cancel, &progress).await;
    progress.spinner.finish_and_clear();
    let run = run?;

    println!();
    println!("  Source:      {}", run.source_name);
    println!("  Status:      {}", run.status);
    println!("  Fetched:     {}", run.report.fetched);
    println!("  New:         {}", run.report.new_artifacts);
    println!("  Aliased:     {}", run.report.aliased);
    println!("  Unchanged:   {}", run.report.unchanged);
    println!("  Excluded:    {}", run.report.excluded);
    println!("  Robots:      {}", run.report.robots_blocked);
    println!("  Normalized:  {}", run.normalized.normalized.len());
    println!("  Failed:      {}", run.report.failed.len() + run.normalized.failed.len());
    println!("  Time:        {:.1}s", run.report.duration.as_secs_f64());
    println!();
    for failure in &run.report.failed {
        println!("  ✗ {} ({})", failure.url, failure.reason);
    }
    for (id, reason) in &run.normalized.failed {
        println!("  ✗ artifact {id} ({reason})");
    }
    if run.deactivated {
        println!("  Source deactivated after repeated failures.");
    }
    Ok(())
}

async fn cmd_process(artifact: &str, force: bool) -> Result<()> {
    let config = load_config()?;
    let (storage, store) = open_stores(&config).await?;
    let pipeline = Pipeline::from_config(&config, storage, store)?;

    let response = pipeline
        .normalizer()
        .process(ProcessingRequest {
            artifact_id: parse_artifact_id(artifact)?,
            processing_options: ProcessingOptions { force },
        })
        .await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    match response.status_code() {
        200 => Ok(()),
        code => Err(eyre!("processing finished with status {code}")),
    }
}

async fn cmd_process_pending(limit: u32) -> Result<()> {
    let config = load_config()?;
    let (storage, store) = open_stores(&config).await?;
    let pipeline = Pipeline::from_config(&config, storage, store)?;

    let summary = pipeline.normalizer().normalize_pending(limit).await?;
    println!("Normalized {} artifact(s)", summary.normalized.len());
    for (id, reason) in &summary.failed {
        println!("  ✗ {id} ({reason})");
    }
    Ok(())
}

async fn cmd_evaluate(artifact: &str, rubric: &str, version: Option<u32>, force: bool) -> Result<()> {
    let config = load_config()?;
    let (storage, _) = open_stores(&config).await?;
    let evaluator = Evaluator::new(
        storage,
        Arc::new(KeywordPolicy),
        BlockingPool::new(config.normalizer.workers),
    );

    let outcome = evaluator
        .evaluate_artifact(
            &parse_artifact_id(artifact)?,
            rubric,
            version,
            EvaluateOptions { force },
        )
        .await?;
    let e = &outcome.evaluation;

    println!();
    println!("  Rubric:    {} v{}", e.rubric_name, e.rubric_version);
    println!("  Label:     {}", e.label);
    println!("  Score:     {:.3}", e.score);
    println!("  Document:  {}", e.normalized_id);
    println!(
        "  Record:    {}{}",
        e.id,
        if outcome.reused { " (unchanged, reused)" } else { "" }
    );
    println!();
    Ok(())
}

async fn cmd_rubric_publish(name: &str, criteria: &str) -> Result<()> {
    let raw = if criteria.trim_start().starts_with('{') {
        criteria.to_string()
    } else {
        std::fs::read_to_string(Path::new(criteria))
            .map_err(|e| eyre!("cannot read criteria file '{criteria}': {e}"))?
    };
    let criteria: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| eyre!("criteria are not valid JSON: {e}"))?;

    let config = load_config()?;
    let (storage, _) = open_stores(&config).await?;
    let evaluator = Evaluator::new(
        storage,
        Arc::new(KeywordPolicy),
        BlockingPool::new(config.normalizer.workers),
    );
    let rubric = evaluator.publish_rubric(name, &criteria).await?;
    println!("Published rubric {} v{} ({})", rubric.name, rubric.version, rubric.id);
    Ok(())
}

async fn cmd_rubric_list() -> Result<()> {
    let config = load_config()?;
    let (storage, _) = open_stores(&config).await?;
    let rubrics = storage.list_rubrics().await?;
    if rubrics.is_empty() {
        println!("No rubrics published.");
        return Ok(());
    }
    println!("{:<24} {:>7}  PUBLISHED", "NAME", "VERSION");
    for r in &rubrics {
        println!(
            "{:<24} {:>7}  {}",
            r.name,
            r.version,
            r.published_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
