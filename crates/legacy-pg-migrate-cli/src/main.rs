//! legacy-pg-migrate CLI - migrate legacy MSSQL tables into the redesigned PostgreSQL schema.

use clap::{Args, Parser, Subcommand};
use legacy_pg_migrate::{
    Config, Coordinator, MigrateError, MigrationLogics, ProgressEvent, RunResult, TableResult,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "legacy-pg-migrate")]
#[command(about = "Migrate legacy MSSQL tables into a redesigned PostgreSQL schema")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml", env = "MIGRATE_CONFIG")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for stages to unwind after SIGINT/SIGTERM
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that take precedence over the configuration file.
#[derive(Args)]
struct Overrides {
    /// Override number of transform workers
    #[arg(long, global = true, env = "MIGRATE_WORKERS")]
    workers: Option<usize>,

    /// Override target records per batch
    #[arg(long, global = true, env = "MIGRATE_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Override number of bulk writers
    #[arg(long, global = true, env = "MIGRATE_WRITERS")]
    writers: Option<usize>,

    /// Hash passwords with salted SHA-256 instead of PBKDF2
    #[arg(long, global = true, env = "MIGRATE_FAST_MODE")]
    fast_mode: bool,

    #[arg(long, hide = true, env = "MIGRATE_SOURCE_PASSWORD", hide_env_values = true)]
    source_password: Option<String>,

    #[arg(long, hide = true, env = "MIGRATE_TARGET_PASSWORD", hide_env_values = true)]
    target_password: Option<String>,

    #[arg(long, hide = true, env = "MIGRATE_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(w) = self.workers {
            config.migration.workers = Some(w);
        }
        if let Some(b) = self.batch_size {
            config.migration.batch_size = Some(b);
        }
        if let Some(w) = self.writers {
            config.migration.writers = Some(w);
        }
        if self.fast_mode {
            config.security.fast_mode = true;
        }
        if let Some(p) = self.source_password {
            config.source.password = p;
        }
        if let Some(p) = self.target_password {
            config.target.password = p;
        }
        if let Some(k) = self.encryption_key {
            config.security.encryption_key = Some(k);
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate one table
    Run {
        /// Table name as declared in the configuration
        table: String,

        /// Run inside one target transaction; roll back on failure
        #[arg(long)]
        transactional: bool,
    },

    /// Migrate every table in dependency order
    RunAll {
        /// Share one target transaction across all tables; roll back on failure
        #[arg(long)]
        transactional: bool,
    },

    /// Print (source, description, target) mapping triples
    Mapping {
        /// Only this table
        table: Option<String>,
    },

    /// Validate configuration and mappings without connecting
    Check,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::read(&cli.config)?;
    cli.overrides.apply(&mut config);
    config.validate()?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Check => {
            let order = config.execution_order()?;
            if cli.output_json {
                let report = serde_json::json!({ "valid": true, "execution_order": order });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Configuration is valid");
                println!("  Tables ({}): {}", order.len(), order.join(" -> "));
            }
        }

        Commands::Mapping { table } => {
            let logics: Vec<MigrationLogics> = match table {
                Some(name) => {
                    let spec = config
                        .table(&name)
                        .ok_or_else(|| MigrateError::UnknownTable(name.clone()))?;
                    vec![MigrationLogics::for_table(spec)]
                }
                None => config.tables.iter().map(MigrationLogics::for_table).collect(),
            };
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&logics)?);
            } else {
                for table in &logics {
                    print_mapping(table);
                }
            }
        }

        Commands::HealthCheck => {
            let coordinator = Coordinator::connect(config.with_auto_tuning()).await?;
            let result = coordinator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MSSQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }

        Commands::Run {
            table,
            transactional,
        } => {
            let coordinator = connect(config, cli.progress).await?;
            let cancel = setup_signal_handler(cli.shutdown_timeout);
            let result = coordinator
                .run_migration(&table, transactional, &cancel)
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\nMigration completed!");
                print_table_result(&result);
            }
        }

        Commands::RunAll { transactional } => {
            let coordinator = connect(config, cli.progress).await?;
            let cancel = setup_signal_handler(cli.shutdown_timeout);
            let mut result = coordinator.run_all(transactional, &cancel).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_run_result(&result);
            }
            if let Some(e) = result.take_failure() {
                return Err(e);
            }
        }
    }

    Ok(())
}

async fn connect(config: Config, progress: bool) -> Result<Coordinator, MigrateError> {
    let coordinator = Coordinator::connect(config.with_auto_tuning()).await?;
    if !progress {
        return Ok(coordinator);
    }
    Ok(coordinator.with_observer(Arc::new(|event: &ProgressEvent| {
        if let Ok(line) = serde_json::to_string(event) {
            eprintln!("{}", line);
        }
    })))
}

fn print_mapping(logics: &MigrationLogics) {
    println!("{} -> {}", logics.table, logics.target_table);
    for logic in &logics.columns {
        println!(
            "  {:<24} {:<48} {}",
            logic.source, logic.description, logic.target
        );
    }
    println!();
}

fn print_table_result(result: &TableResult) {
    println!("  Table: {} ({:?})", result.table, result.status);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Processed: {}", result.records_processed);
    println!("  Inserted: {}", result.records_inserted);
    println!("  Skipped: {}", result.records_skipped);
    for (reason, count) in &result.skipped_by_reason {
        println!("    {}: {}", reason, count);
    }
    println!("  Errored: {}", result.records_errored);
    for error in &result.errors {
        println!("    {}", error);
    }
    println!("  Throughput: {} rows/sec", result.rows_per_second);
}

fn print_run_result(result: &RunResult) {
    println!("\nRun {}: {}", result.run_id, result.status);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Tables: {}/{}",
        result.tables_completed, result.tables_total
    );
    println!("  Rows inserted: {}", result.total_inserted);
    println!("  Throughput: {} rows/sec", result.rows_per_second);
    for table in &result.tables {
        println!(
            "    {:<24} {:<12} inserted {:>10}  skipped {:>8}  errored {:>8}",
            table.table,
            format!("{:?}", table.status),
            table.records_inserted,
            table.records_skipped,
            table.records_errored
        );
    }
    if let Some(ref err) = result.error {
        println!("  Error: {}", err);
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout is reserved for results
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the run on SIGINT or SIGTERM.
///
/// Exits with the cancellation code if stages have not unwound within
/// `shutdown_timeout` seconds.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("Failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                name, shutdown_timeout
            );
            token.cancel();
            force_exit_after(shutdown_timeout).await;
        });
    }

    cancel_token
}

/// Cancel the run on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
        force_exit_after(shutdown_timeout).await;
    });

    cancel_token
}

async fn force_exit_after(shutdown_timeout: u64) {
    tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
    eprintln!("Shutdown timeout elapsed, exiting");
    std::process::exit(i32::from(MigrateError::Cancelled.exit_code()));
}
