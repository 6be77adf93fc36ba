use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use payid_admin_api::{start_server, AppState};
use payid_registry::{MemoryRecordStore, PayIdRegistry, RecordStore, SledRecordStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;
mod version;

use settings::{AppConfig, StorageBackend};
use version::{git_commit_hash, PAYID_NODE_VERSION};

fn cli() -> Command {
    Command::new("payid-node")
        .version(PAYID_NODE_VERSION)
        .about("PayID registry node serving the private management API")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to a TOML configuration file"),
        )
        .arg(
            Arg::new("api-host")
                .long("api-host")
                .value_name("HOST")
                .help("Override admin API bind host"),
        )
        .arg(
            Arg::new("api-port")
                .long("api-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override admin API port"),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .value_name("BACKEND")
                .value_parser(value_parser!(StorageBackend))
                .help("Record storage backend"),
        )
        .arg(
            Arg::new("db-path")
                .long("db-path")
                .value_name("PATH")
                .help("Directory of the sled database"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Override log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format (pretty, compact)"),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Disable the Prometheus metrics endpoint"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = AppConfig::load(config_path.as_deref())?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(api_host) = matches.get_one::<String>("api-host") {
        config.api_host = api_host.clone();
    }

    if let Some(api_port) = matches.get_one::<u16>("api-port") {
        config.api_port = *api_port;
    }

    if let Some(backend) = matches.get_one::<StorageBackend>("storage") {
        config.storage_backend = *backend;
    }

    if let Some(db_path) = matches.get_one::<String>("db-path") {
        config.db_path = db_path.clone();
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if matches.get_flag("disable-metrics") {
        config.prometheus_enabled = false;
    }
}

/// Open the configured backend. The sled handle is returned separately so it
/// can be flushed on shutdown.
fn open_store(config: &AppConfig) -> Result<(Arc<dyn RecordStore>, Option<Arc<SledRecordStore>>)> {
    match config.storage_backend {
        StorageBackend::Memory => {
            warn!("Using in-memory record store; records are lost on restart");
            let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
            Ok((store, None))
        }
        StorageBackend::Sled => {
            let store = Arc::new(
                SledRecordStore::open(&config.db_path)
                    .with_context(|| format!("failed to open sled store at {}", config.db_path))?,
            );
            let shared: Arc<dyn RecordStore> = store.clone();
            Ok((shared, Some(store)))
        }
    }
}

fn init_metrics(config: &AppConfig) -> Option<PrometheusHandle> {
    if !config.prometheus_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics exporter registered");
            describe_counter!(
                "payid_registry_operations_total",
                "PayID registry operations by operation and outcome"
            );
            Some(handle)
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
            None
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "compact" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn print_version_info(config: &AppConfig) {
    info!(
        "payid-node {} (commit {})",
        PAYID_NODE_VERSION,
        git_commit_hash()
    );
    match &config.config_path {
        Some(path) => info!("Config file: {}", path.display()),
        None => info!("Config file: (built-in defaults)"),
    }
    info!("Storage backend: {}", config.storage_backend);
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    init_logging(&config)?;
    print_version_info(&config);
    let metrics = init_metrics(&config);

    let (store, sled_store) = open_store(&config)?;
    let registry = Arc::new(PayIdRegistry::new(store));
    info!("Registry ready with {} records", registry.count()?);

    let state = AppState::new(registry, config.storage_timeout()).with_metrics(metrics);
    start_server(state, &config.api_addr(), shutdown_signal()).await?;

    if let Some(store) = sled_store {
        store.flush().context("failed to flush sled store")?;
    }
    info!("payid-node stopped");
    Ok(())
}
