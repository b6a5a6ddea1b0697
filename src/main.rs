use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use puente::config::{Config, ConfigError, LoggingConfig};
use puente::utils::{format_duration, parse_param};
use puente::Puente;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "puente")]
#[command(about = "A resilient access layer for legacy ERP and SQL database backends")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Puente Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the access layer and report health until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Run a single query and print the rows as JSON
    Query {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Logical connection id
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        connection: Option<String>,
        /// Failover group id
        #[arg(long)]
        group: Option<String>,
        /// Parameter as name:type=value (type defaults to varchar)
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// SQL statement
        sql: String,
    },
    /// Check every configured connection
    Health {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Configuration mode (sql or odbc)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_puente(config).await?,
        Commands::Query {
            config,
            connection,
            group,
            params,
            sql,
        } => run_query(config, connection, group, params, sql).await?,
        Commands::Health { config } => run_health(config).await?,
        Commands::Config { mode, output } => generate_config(mode, output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<Config> {
    Config::load_from_file(path)
        .with_context(|| format!("Failed to load config from {:?}", path))
}

async fn run_puente(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config.logging, false)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting puente");
    info!(path = ?config_path, environment = %config.environment, "configuration loaded");

    let puente = Puente::from_config(&config)
        .await
        .context("Failed to initialize puente")?;

    let interval = Duration::from_millis(config.health.interval_ms);
    let idle_timeout = Duration::from_millis(config.pool.idle_timeout_ms);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        interval = %format_duration(interval),
        connections = puente.pool().connection_ids().len(),
        "puente running, press Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (connection_id, report) in puente.health_report().await {
                    if report.connected {
                        info!(connection_id = %connection_id, response_time_ms = report.response_time_ms, "connection healthy");
                    } else {
                        warn!(connection_id = %connection_id, response_time_ms = report.response_time_ms, "connection unhealthy");
                    }
                }
                for group_id in puente.failover().group_ids().await {
                    if let Ok(status) = puente.failover().group_status(&group_id).await {
                        info!(group_id = %group_id, current = %status.current, "group status");
                    }
                }
                if !idle_timeout.is_zero() {
                    let evicted = puente.pool().evict_idle(idle_timeout).await;
                    if !evicted.is_empty() {
                        info!(evicted = ?evicted, "evicted idle connections");
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
                break;
            }
        }
    }

    puente.shutdown().await;
    Ok(())
}

async fn run_query(
    config_path: PathBuf,
    connection: Option<String>,
    group: Option<String>,
    params: Vec<String>,
    sql: String,
) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config.logging, true)?;

    let params = params
        .iter()
        .map(|raw| parse_param(raw).map_err(|e| anyhow!(e)))
        .collect::<Result<Vec<_>>>()?;

    let puente = Puente::from_config(&config)
        .await
        .context("Failed to initialize puente")?;

    let result = match (&connection, &group) {
        (_, Some(group_id)) => puente.query_group(group_id, &sql, &params).await,
        (Some(connection_id), None) => puente.query(connection_id, &sql, &params).await,
        (None, None) => Err(puente::error::PuenteError::validation(
            "either --connection or --group is required",
        )),
    };
    puente.shutdown().await;

    let rows = result.context("Query failed")?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn run_health(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config.logging, true)?;

    let puente = Puente::from_config(&config)
        .await
        .context("Failed to initialize puente")?;
    let report = puente.health_report().await;
    puente.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    let unhealthy: Vec<&String> = report
        .iter()
        .filter(|(_, r)| !r.connected)
        .map(|(id, _)| id)
        .collect();
    if !unhealthy.is_empty() {
        bail!("{} connection(s) unhealthy: {:?}", unhealthy.len(), unhealthy);
    }
    Ok(())
}

fn generate_config(mode: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  puente run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Environment: {}", config.environment);
            println!("  Connections: {}", config.connections.len());
            for (i, connection) in config.connections.iter().enumerate() {
                println!(
                    "    {}: {} ({:?}, {})",
                    i + 1,
                    connection.id,
                    connection.kind,
                    connection.driver.as_deref().unwrap_or("-")
                );
            }
            println!("  Groups: {}", config.groups.len());
            for group in &config.groups {
                let regions: Vec<&str> = group
                    .regions
                    .iter()
                    .map(|r| r.connection_id.as_str())
                    .collect();
                println!("    {}: {}", group.id, regions.join(" -> "));
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("puente v{}", env!("CARGO_PKG_VERSION"));
    println!("A resilient access layer for legacy ERP and SQL database backends");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Lazy connection pooling keyed by logical connection id");
    println!("  • Per-connection circuit breakers");
    println!("  • Retry with exponential backoff and jitter");
    println!("  • Multi-region failover with automatic failback");
    println!("  • ODBC-style legacy drivers and sqlx relational backends");
}

/// RUST_LOG takes precedence over the configured level
fn init_logging(config: &LoggingConfig, interactive: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        // query/health print results on stdout
        None if interactive => BoxMakeWriter::new(std::io::stderr),
        None if config.stdout => BoxMakeWriter::new(std::io::stdout),
        None => BoxMakeWriter::new(std::io::sink),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!(level = %config.level, format = %config.format, "logging initialized");
    Ok(())
}
