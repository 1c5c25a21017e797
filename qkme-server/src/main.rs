//! qkme server binary

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use qkme_server::{build_state, tls, KmeConfig, KmeServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("qkme-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("ETSI GS QKD 014 key management entity")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Bind address (overrides the config file)"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("PATH")
                .help("Key pool data directory")
                .conflicts_with("in-memory"),
        )
        .arg(
            Arg::new("in-memory")
                .long("in-memory")
                .help("Keep the key pool in memory only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("registry")
                .long("registry")
                .value_name("PATH")
                .help("SAE registry file"),
        )
        .arg(
            Arg::new("audit-log")
                .long("audit-log")
                .value_name("PATH")
                .help("Append authorization decisions to this file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .help("Emit logs as JSON")
                .action(ArgAction::SetTrue),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &clap::ArgMatches) -> anyhow::Result<KmeConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => KmeConfig::load(path)?,
        None => KmeConfig::default(),
    };

    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind = bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid bind address {}", bind))?;
    }
    if let Some(dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if matches.get_flag("in-memory") {
        config.data_dir = None;
    }
    if let Some(path) = matches.get_one::<String>("registry") {
        config.registry = PathBuf::from(path);
    }
    if let Some(path) = matches.get_one::<String>("audit-log") {
        config.audit_log = Some(PathBuf::from(path));
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let config = load_config(&matches)?;
    let Some(tls_settings) = &config.tls else {
        bail!("No TLS settings configured; SAEs must connect over mutual TLS");
    };

    info!("Starting qkme {} (peer {})", config.kme_id, config.peer_kme_id);
    match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
            info!("Data directory: {}", dir.display());
        }
        None => warn!("No data directory configured; keys are held in memory only"),
    }

    let state = build_state(&config)?;
    let manager = state.engine.manager().clone();
    let levels = manager.store().levels();
    info!(
        "Key pool loaded: {}/{} keys",
        levels.stored_key_count, levels.max_key_count
    );

    let acceptor = tls::acceptor(tls_settings)?;
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    let maintenance = manager.run_maintenance(config.maintenance_interval());
    manager.trigger_replenishment();

    let server = KmeServer::new(state, acceptor);
    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    maintenance.abort();
    Ok(())
}
