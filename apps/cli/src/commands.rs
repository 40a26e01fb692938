//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use geoharvest_core::pipeline::{CancelToken, JobResult, ProgressReporter, harvest_source};
use geoharvest_shared::{
    AppConfig, HarvestConfig, HarvestSource, SourceConfig, SourceKind, init_config, load_config,
    new_id, resolve_path,
};
use geoharvest_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// GeoHarvest: keep a local record store in step with remote metadata catalogs.
#[derive(Parser)]
#[command(
    name = "geoharvest",
    version,
    about = "Harvest GEMINI2/ISO19139 metadata from CSW catalogs, web-accessible folders and single documents.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database file (overrides `[storage] db_path`).
    #[arg(long, env = "GEOHARVEST_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Source kind as accepted on the command line.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum KindArg {
    Csw,
    Waf,
    Single,
}

impl From<KindArg> for SourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Csw => SourceKind::Csw,
            KindArg::Waf => SourceKind::Waf,
            KindArg::Single => SourceKind::Single,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Manage harvest sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Run a harvest job (gather, fetch, import) against a source.
    Harvest {
        /// Source ID.
        source_id: String,

        /// Re-import documents even when their metadata date is unchanged.
        #[arg(long)]
        force: bool,

        /// Reject documents that fail validation instead of warning.
        #[arg(long)]
        reject_invalid: bool,
    },

    /// List the jobs run against a source.
    Jobs {
        /// Source ID.
        source_id: String,
    },

    /// Show the errors recorded for a job.
    Errors {
        /// Job ID.
        job_id: String,
    },

    /// List harvested records.
    Records,

    /// Show one harvested record as JSON.
    Show {
        /// Record name (or ID).
        name: String,
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
    /// Register a new harvest source.
    Add {
        /// Endpoint, directory or document URL.
        url: String,

        /// Source kind.
        #[arg(long, value_enum)]
        kind: KindArg,

        /// CQL constraint for catalog record queries.
        #[arg(long)]
        cql: Option<String>,

        /// Sort key for catalog record queries.
        #[arg(long)]
        sort_by: Option<String>,

        /// Treat the URL as a static catalog response document.
        #[arg(long)]
        static_xml: bool,

        /// Publisher (group) assigned to every harvested record.
        #[arg(long)]
        publisher: Option<String>,

        /// Always re-import this source's documents.
        #[arg(long)]
        force_import: bool,
    },
    /// List registered sources.
    List,
    /// Mark a source active.
    Enable { id: String },
    /// Mark a source inactive.
    Disable { id: String },
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
        0 => "geoharvest=info",
        1 => "geoharvest=debug",
        _ => "geoharvest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

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
    let db = cli.db;
    match cli.command {
        Command::Source { action } => {
            let (_, storage) = open_storage(db).await?;
            cmd_source(&storage, action).await
        }
        Command::Harvest {
            source_id,
            force,
            reject_invalid,
        } => {
            let (config, storage) = open_storage(db).await?;
            cmd_harvest(&storage, &config, &source_id, force, reject_invalid).await
        }
        Command::Jobs { source_id } => cmd_jobs(&open_storage(db).await?.1, &source_id).await,
        Command::Errors { job_id } => cmd_errors(&open_storage(db).await?.1, &job_id).await,
        Command::Records => cmd_records(&open_storage(db).await?.1).await,
        Command::Show { name } => cmd_show(&open_storage(db).await?.1, &name).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

/// Load the config and open the database it (or `--db`) points at.
async fn open_storage(db: Option<PathBuf>) -> Result<(AppConfig, Storage)> {
    let config = load_config()?;
    let path = match db {
        Some(path) => path,
        None => resolve_path(&config.storage.db_path)?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| eyre!("cannot create '{}': {e}", parent.display()))?;
    }
    let storage = Storage::open(&path).await?;
    Ok((config, storage))
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

async fn cmd_source(storage: &Storage, action: SourceAction) -> Result<()> {
    match action {
        SourceAction::Add {
            url,
            kind,
            cql,
            sort_by,
            static_xml,
            publisher,
            force_import,
        } => {
            Url::parse(&url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
            let source = HarvestSource {
                id: new_id(),
                url,
                kind: kind.into(),
                config: SourceConfig {
                    cql,
                    sort_by,
                    static_xml,
                    publisher_id: publisher,
                    force_import,
                },
                active: true,
                created_at: chrono::Utc::now(),
            };
            storage.insert_source(&source).await?;
            info!(id = %source.id, url = %source.url, kind = source.kind.as_str(), "source added");
            println!("{}", source.id);
        }
        SourceAction::List => {
            let sources = storage.list_sources().await?;
            if sources.is_empty() {
                println!("No harvest sources registered.");
            }
            for source in sources {
                println!(
                    "{}  {:<6} {:<8} {}",
                    source.id,
                    source.kind.as_str(),
                    if source.active { "active" } else { "inactive" },
                    source.url
                );
            }
        }
        SourceAction::Enable { id } => set_active(storage, &id, true).await?,
        SourceAction::Disable { id } => set_active(storage, &id, false).await?,
    }
    Ok(())
}

async fn set_active(storage: &Storage, id: &str, active: bool) -> Result<()> {
    if !storage.set_source_active(id, active).await? {
        return Err(eyre!("no harvest source with id '{id}'"));
    }
    println!("Source {id} {}.", if active { "enabled" } else { "disabled" });
    Ok(())
}

// ---------------------------------------------------------------------------
// Harvest
// ---------------------------------------------------------------------------

async fn cmd_harvest(
    storage: &Storage,
    config: &AppConfig,
    source_id: &str,
    force: bool,
    reject_invalid: bool,
) -> Result<()> {
    let mut harvest = HarvestConfig::from(config);
    harvest.reject_invalid |= reject_invalid;

    let cancel = CancelToken::default();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight retrievals");
            on_interrupt.cancel();
        }
    });

    info!(source_id, force, "starting harvest");
    let reporter = CliProgress::new();
    let result = harvest_source(storage, source_id, &harvest, force, &cancel, &reporter).await?;

    let stats = &result.stats;
    println!();
    println!("  Harvest {}", result.status.as_str());
    println!("  Job:      {}", result.job_id);
    println!("  Gathered: {}", stats.gathered);
    println!("  Fetched:  {}", stats.fetched);
    println!("  Created:  {}", stats.created);
    println!("  Updated:  {}", stats.updated);
    println!("  Deleted:  {}", stats.deleted);
    println!("  Skipped:  {}", stats.skipped);
    println!("  Errored:  {}", stats.errored);
    println!("  Time:     {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using indicatif spinners.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn object_fetched(&self, guid: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Fetching [{current}/{total}] {guid}"));
    }

    fn object_imported(&self, guid: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Importing [{current}/{total}] {guid}"));
    }

    fn done(&self, _result: &JobResult) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

async fn cmd_jobs(storage: &Storage, source_id: &str) -> Result<()> {
    for job in storage.list_jobs(source_id).await? {
        println!(
            "{}  {:<8} {}  created={} updated={} deleted={} errored={}",
            job.id,
            job.status.as_str(),
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
            job.stats.created,
            job.stats.updated,
            job.stats.deleted,
            job.stats.errored
        );
    }
    Ok(())
}

async fn cmd_errors(storage: &Storage, job_id: &str) -> Result<()> {
    if storage.get_job(job_id).await?.is_none() {
        return Err(eyre!("no harvest job with id '{job_id}'"));
    }
    let gather = storage.gather_errors(job_id).await?;
    let objects = storage.object_errors(job_id).await?;
    if gather.is_empty() && objects.is_empty() {
        println!("No errors recorded.");
        return Ok(());
    }
    for error in gather {
        println!("[Gather] {}", error.message);
    }
    for error in objects {
        println!("[{}] {}: {}", error.stage, error.guid, error.message);
    }
    Ok(())
}

async fn cmd_records(storage: &Storage) -> Result<()> {
    for record in storage.list_records().await? {
        println!(
            "{:<40} {:<8} {}",
            record.name,
            record.state.as_str(),
            record.title
        );
    }
    Ok(())
}

async fn cmd_show(storage: &Storage, name: &str) -> Result<()> {
    let record = match storage.get_record_by_name(name).await? {
        Some(record) => record,
        None => storage
            .get_record(name)
            .await?
            .ok_or_else(|| eyre!("no record named '{name}'"))?,
    };
    println!("{}", serde_json::to_string_pretty(&record)?);

    if let Some(object) = storage.current_object_for_record(&record.id).await? {
        println!();
        println!("GUID:      {}", object.guid);
        println!("Job:       {}", object.job_id);
        if let Some(reference) = &object.source_reference {
            println!("Reference: {reference}");
        }
    }

    let couplings = storage.couplings_for_service(&record.id).await?;
    if !couplings.is_empty() {
        println!();
        println!("Coupled datasets:");
        for coupling in couplings {
            println!(
                "  {} -> {}",
                coupling.coupled_guid,
                coupling.dataset_record_id.as_deref().unwrap_or("(not harvested)")
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_add() {
        let cli = Cli::try_parse_from([
            "geoharvest",
            "source",
            "add",
            "http://csw.example.com/csw",
            "--kind",
            "csw",
            "--cql",
            "AnyText like '%flood%'",
        ])
        .unwrap();
        let Command::Source {
            action: SourceAction::Add { kind, cql, static_xml, .. },
        } = cli.command
        else {
            panic!("expected source add");
        };
        assert_eq!(SourceKind::from(kind), SourceKind::Csw);
        assert_eq!(cql.as_deref(), Some("AnyText like '%flood%'"));
        assert!(!static_xml);
    }

    #[test]
    fn parses_harvest_flags() {
        let cli = Cli::try_parse_from(["geoharvest", "-vv", "harvest", "abc", "--force"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Command::Harvest { force: true, reject_invalid: false, .. }
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["geoharvest", "source", "add", "http://x", "--kind", "ftp"]).is_err());
    }
}
