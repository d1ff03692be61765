// ABOUTME: Entry point for the aviso binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs listen/notify/key/value/status.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use aviso_core::{AvisoConfig, Schema};
use aviso_listener::{
    FunctionRegistry, ListenerConfig, ListenerManager, Notifier, build_listeners, parse_params,
};
use aviso_store::{PollerConfig, PollingScheduler, connect, cursor_for};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(name = "aviso", version, about = "Event notifications over a revisioned key-value store")]
struct Cli {
    /// Event schema file; overrides AVISO_SCHEMA.
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    /// Exit with status 0 even when the command fails; the error is still reported.
    #[arg(long, global = true, env = "AVISO_NO_FAIL")]
    no_fail: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the listeners declared in one or more YAML files.
    Listen {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Replay notifications published since this date.
        #[arg(long, value_parser = parse_date)]
        from: Option<DateTime<Utc>>,
        /// Stop replaying at this date; requires --from.
        #[arg(long, value_parser = parse_date, requires = "from")]
        to: Option<DateTime<Utc>>,
    },
    /// Publish a notification, e.g. `event=flight,stream=enfo,date=20190810,location=s3://b/f`.
    Notify { params: String },
    /// Print the key a notification would be written to.
    Key { params: String },
    /// Print the value currently stored for a notification.
    Value { params: String },
    /// Show store health, revision and members.
    Status,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("aviso=info")),
        )
        .init();

    let cli = Cli::parse();
    let no_fail = cli.no_fail;
    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(failure_code(no_fail));
    }
}

/// Exit status after a failed command.
fn failure_code(no_fail: bool) -> i32 {
    if no_fail { 0 } else { 1 }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AvisoConfig::from_env().context("invalid configuration")?;
    if let Some(path) = cli.schema {
        config.schema_path = Some(path);
    }
    tracing::debug!("configuration: {:?}", config);

    match cli.command {
        Command::Listen { files, from, to } => listen(&config, &files, from, to).await,
        Command::Notify { params } => {
            let published = notifier(&config)?.notify(&parse_params(&params)?).await?;
            println!("{}", published.keys.leaf);
            Ok(())
        }
        Command::Key { params } => {
            println!("{}", notifier(&config)?.key(&parse_params(&params)?)?);
            Ok(())
        }
        Command::Value { params } => {
            match notifier(&config)?.value(&parse_params(&params)?).await? {
                Some(value) => println!("{}", value),
                None => bail!("no value stored for these parameters"),
            }
            Ok(())
        }
        Command::Status => status(&config).await,
    }
}

fn load_schema(config: &AvisoConfig) -> Result<Schema> {
    let Some(path) = &config.schema_path else {
        bail!("no event schema given; pass --schema or set AVISO_SCHEMA");
    };
    Schema::load(path, config.engine.as_str())
        .with_context(|| format!("failed to load schema {}", path.display()))
}

fn notifier(config: &AvisoConfig) -> Result<Notifier> {
    let schema = load_schema(config)?;
    let store = connect(config)?;
    Ok(Notifier::new(store, schema, config.key_ttl))
}

/// Functions available to `function` triggers.
fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("print", |notification| {
        println!("{}", serde_json::to_string(notification)?);
        Ok(())
    });
    registry
}

async fn listen(
    config: &AvisoConfig,
    files: &[PathBuf],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<()> {
    let schema = load_schema(config)?;
    let registry = registry();

    // Every listener is validated before the store is touched.
    let mut listeners = Vec::new();
    for file in files {
        listeners.extend(load_listeners(file, &schema, &registry)?);
    }

    let store = connect(config)?;
    let cursor = cursor_for(config, store.as_ref());
    let scheduler = Arc::new(PollingScheduler::new(
        store,
        PollerConfig::from(config),
        Some(cursor),
    ));
    let manager = ListenerManager::new(scheduler);
    let started = manager.listen(listeners, from, to).await?;
    tracing::info!("{} listeners running", started);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupted, stopping listeners");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => tracing::error!("failed to install Ctrl-C handler: {}", e),
        }
    });

    manager.wait(shutdown_rx).await;
    Ok(())
}

fn load_listeners(
    path: &Path,
    schema: &Schema,
    registry: &FunctionRegistry,
) -> Result<Vec<aviso_listener::EventListener>> {
    let config = ListenerConfig::load(path)
        .with_context(|| format!("failed to read listeners from {}", path.display()))?;
    build_listeners(&config, schema, registry)
        .with_context(|| format!("invalid listener in {}", path.display()))
}

async fn status(config: &AvisoConfig) -> Result<()> {
    let store = connect(config)?;
    let endpoint = store.endpoint();
    println!("engine:   {}", store.engine_name());
    println!("endpoint: {}:{}", endpoint.host, endpoint.port);
    println!("healthy:  {}", store.health().await?);
    println!("revision: {}", store.latest_revision().await?);
    for member in store.members().await? {
        println!("member:   {} {}", member.name, member.client_urls.join(","));
    }
    Ok(())
}

/// Parse a date given on the command line; plain dates mean midnight UTC.
fn parse_date(text: &str) -> Result<DateTime<Utc>, String> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(dt.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format)
            && let Some(dt) = date.and_hms_opt(0, 0, 0)
        {
            return Ok(dt.and_utc());
        }
    }
    Err(format!("'{}' is not a date (try 2019-08-10 or 2019-08-10T12:00Z)", text))
}
