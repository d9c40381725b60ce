use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use psp_core::{EntityKind, SyncMode, SyncRunRecord};
use psp_format::{schemas, DateStyle, FieldKind};
use psp_store::{
    ArchiveSource, DirArchiveSource, HttpArchiveSource, HttpSourceConfig, MemoryStore,
};
use psp_sync::{inspect_archive, SyncConfig, SyncEngine};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "psp-cli")]
#[command(about = "Czech Chamber of Deputies open-data synchronization")]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization pass and print its ledger record
    Sync {
        /// `full` or `incremental`
        #[arg(long, default_value = "incremental")]
        mode: String,

        /// Restrict the run to these entity kinds (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },

    /// List the members of one source archive without syncing
    Inspect {
        /// Archive file name, e.g. `poslanci.zip`
        archive: String,
    },

    /// Print the declared flat-file schemas
    Schemas,
}

fn build_source(config: &SyncConfig) -> Result<Arc<dyn ArchiveSource>> {
    match &config.archives_dir {
        Some(dir) => Ok(Arc::new(DirArchiveSource::new(dir.clone()))),
        None => {
            let source = HttpArchiveSource::new(HttpSourceConfig {
                base_url: config.base_url.clone(),
                user_agent: Some(config.user_agent.clone()),
                concurrency: config.fetch_concurrency,
                ..HttpSourceConfig::default()
            })?;
            Ok(Arc::new(source))
        }
    }
}

fn parse_mode(mode: &str) -> Result<SyncMode> {
    match mode {
        "full" => Ok(SyncMode::Full),
        "incremental" => Ok(SyncMode::Incremental),
        other => bail!("unknown sync mode `{other}` (expected `full` or `incremental`)"),
    }
}

fn parse_kinds(only: &[String]) -> Result<Option<Vec<EntityKind>>> {
    if only.is_empty() {
        return Ok(None);
    }
    let kinds = only
        .iter()
        .map(|name| name.parse::<EntityKind>().map_err(|e| anyhow!(e)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(kinds))
}

fn print_run(record: &SyncRunRecord) {
    println!(
        "run {} [{}] {}: {} processed, {} inserted, {} updated, {} unchanged, {} failed",
        record.run_id,
        record.mode.as_str(),
        record.status.as_str(),
        record.totals.processed,
        record.totals.inserted,
        record.totals.updated,
        record.totals.unchanged,
        record.totals.failed,
    );
    for (kind, counts) in &record.per_kind {
        println!(
            "  {kind:<16} processed={} inserted={} updated={} unchanged={} failed={}",
            counts.processed, counts.inserted, counts.updated, counts.unchanged, counts.failed
        );
    }
    if let Some(error) = &record.error {
        println!("  errors: {error}");
    }
}

fn field_label(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "text",
        FieldKind::Integer => "integer",
        FieldKind::Date(DateStyle::DayMonthYear) => "date (dd.mm.yyyy)",
        FieldKind::Date(DateStyle::Iso) => "date (yyyy-mm-dd)",
        FieldKind::Time => "time",
        FieldKind::Boolean => "boolean",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync { mode, only } => {
            let mode = parse_mode(&mode)?;
            let only = parse_kinds(&only)?;

            let source = build_source(&config)?;
            let store = Arc::new(MemoryStore::new());
            let engine = SyncEngine::new(config, source, store.clone(), store);

            let cancel = engine.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received; stopping after the current entity kind");
                    cancel.store(true, Ordering::Relaxed);
                }
            });

            let record = engine.run(mode, only.as_deref()).await?;
            print_run(&record);
        }
        Commands::Inspect { archive } => {
            let source = build_source(&config)?;
            let inspection = inspect_archive(source.as_ref(), &archive).await?;
            println!("{}:", inspection.archive);
            for member in &inspection.members {
                match member.table {
                    Some(table) => {
                        println!("  {:<24} {:>8} rows  (table {table})", member.member, member.rows)
                    }
                    None => println!(
                        "  {:<24} {:>8} rows  (no schema declared)",
                        member.member, member.rows
                    ),
                }
            }
        }
        Commands::Schemas => {
            for schema in schemas::all() {
                println!("{}:", schema.table);
                for field in schema.fields {
                    let null = if field.nullable { "null ok" } else { "required" };
                    println!("  {:<20} {:<18} {null}", field.name, field_label(field.kind));
                }
            }
        }
    }

    Ok(())
}
