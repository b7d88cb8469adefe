use crate::commands::Commands;
use crate::error::CliError;
use applier::chaos::NoChaos;
use applier::sink::MemorySink;
use clap::Parser;
use model::binlog::event::BinlogEvent;
use pipeline::producer::ScriptedProducer;
use pipeline::schema::{ActiveSchema, FixedActiveSchema, MySqlActiveSchema, TableSchema};
use replicator_core::config::Configuration;
use replicator_core::metrics::{Counter, ReplicatorMetrics};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

mod commands;
mod error;
mod shutdown;

#[derive(Parser)]
#[command(
    name = "binsink",
    version,
    about = "Replicates a MySQL binlog into a column-store sink"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let exit_code = match run_cli().await {
        Ok(()) => 0,
        Err(err) => {
            match &err {
                CliError::ShutdownRequested => info!("stopped on request"),
                other => tracing::error!("{other}"),
            }
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            let config = load_config(&config)?;
            config.validate()?;
            print_effective_settings(&config);
            Ok(())
        }
        Commands::Replay {
            config,
            trace,
            schema,
            dry_run,
        } => {
            let mut config = load_config(&config)?;
            config.validate()?;
            if dry_run {
                config.dry_run = true;
            }
            replay(&config, &trace, schema.as_deref()).await
        }
    }
}

fn load_config(path: &str) -> Result<Configuration, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CliError::Parse {
        path: path.to_string(),
        source,
    })
}

fn load_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CliError::Parse {
        path: path.to_string(),
        source,
    })
}

async fn resolve_active_schema(
    config: &Configuration,
    schema_file: Option<&str>,
) -> Result<Arc<dyn ActiveSchema>, CliError> {
    if let Some(path) = schema_file {
        let tables: Vec<TableSchema> = load_json(path)?;
        let mut fixed = FixedActiveSchema::new();
        for table in tables {
            fixed.insert(table);
        }
        return Ok(Arc::new(fixed));
    }

    let host = config
        .active_schema_host
        .as_deref()
        .ok_or_else(|| CliError::ActiveSchema("no schema file and no activeSchemaHost".into()))?;
    let active = MySqlActiveSchema::connect(
        host,
        &config.active_schema_user_name,
        &config.active_schema_password,
        &config.active_schema_db,
    )
    .await
    .map_err(|err| CliError::ActiveSchema(err.to_string()))?;
    Ok(Arc::new(active))
}

async fn replay(
    config: &Configuration,
    trace_path: &str,
    schema_file: Option<&str>,
) -> Result<(), CliError> {
    let events: Vec<BinlogEvent> = load_json(trace_path)?;
    info!(events = events.len(), "loaded event trace");

    let active_schema = resolve_active_schema(config, schema_file).await?;
    let sink = Arc::new(MemorySink::new());
    let metrics = ReplicatorMetrics::new();
    let cancel = CancellationToken::new();
    shutdown::listen_for_shutdown(cancel.clone());

    let (producer, receiver) = ScriptedProducer::new(events);
    pipeline::run_pipeline(
        config,
        producer,
        receiver,
        active_schema,
        Arc::clone(&sink) as Arc<dyn applier::sink::Sink>,
        Arc::new(NoChaos),
        metrics.clone(),
        cancel.clone(),
    )
    .await?;

    if cancel.is_cancelled() {
        return Err(CliError::ShutdownRequested);
    }

    print_replay_report(&metrics, sink.cell_count(), config.dry_run);
    Ok(())
}

fn print_effective_settings(config: &Configuration) {
    println!("Configuration is valid.");
    println!("-----------------------------");
    println!("{:<28} {}", "applier type", config.applier_type);
    println!("{:<28} {}", "replicated schema", config.replicant_schema_name);
    println!("{:<28} {}", "db alias", config.db_alias());
    println!(
        "{:<28} {}",
        "replicant host",
        config.replicant_active_host().unwrap_or_default()
    );
    println!(
        "{:<28} {}:{}",
        "starting position", config.starting_binlog_file_name, config.starting_binlog_position
    );
    println!(
        "{:<28} {}",
        "ending binlog file",
        config.ending_binlog_file_name.as_deref().unwrap_or("(none)")
    );
    println!(
        "{:<28} {}",
        "delta tables",
        if config.write_recent_changes_to_delta_tables {
            config.tables_for_which_to_track_daily_changes.join(", ")
        } else {
            "(disabled)".to_string()
        }
    );
    println!(
        "{:<28} {}",
        "stats",
        if config.stats_enabled() {
            format!(
                "{} -> {}",
                config.graphite_stats_namespace, config.graphite_endpoint
            )
        } else {
            "(disabled)".to_string()
        }
    );
    println!("{:<28} {}", "flush pool size", config.pool_size);
    println!("{:<28} {}", "task row budget", config.task_row_buffer_limit);
}

fn print_replay_report(metrics: &ReplicatorMetrics, cells_written: usize, dry_run: bool) {
    println!("Replay finished{}.", if dry_run { " (dry run)" } else { "" });
    println!("-----------------------------");
    for counter in [
        Counter::EventsObserved,
        Counter::RowsReceived,
        Counter::RowsCommitted,
        Counter::ApplierTasksSubmitted,
        Counter::ApplierTasksSucceeded,
        Counter::ApplierTasksFailed,
    ] {
        println!("{:<28} {}", counter.name(), metrics.sum(counter));
    }
    println!("{:<28} {}", "sink cells written", cells_written);
}
