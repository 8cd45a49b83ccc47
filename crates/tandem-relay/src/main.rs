//! tandem-relay: WebSocket relay for tutorial sync sessions.
//!
//! Accepts WebSocket connections on `/sessions/{id}`, admits at most two per
//! session, and coordinates which peer holds the active role.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tandem_config::{config_to_json, load_config, load_from_path, LogLevel, TandemConfig};
use tandem_relay::connection::handle_connection;
use tandem_relay::{ManagerConfig, SessionManager};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "tandem-relay", about = "Session relay for tandem tutorial sync")]
struct Args {
    /// Config file (defaults to the platform config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind.
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Default session lifetime in seconds.
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Create sessions on first connect instead of requiring them up front.
    #[arg(long)]
    auto_create: bool,

    /// Forward every frame verbatim (no role management).
    #[arg(long)]
    legacy: bool,

    /// trace, debug, info, warn or error.
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

fn load(args: &Args) -> TandemConfig {
    let loaded = match &args.config {
        Some(path) => load_from_path(path),
        None => load_config(),
    };
    match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tandem-relay: {e}; using defaults");
            TandemConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut config = load(&args);

    let level = args.log_level.unwrap_or(config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("tandem_relay={0},tandem_protocol={0}", level.as_directive()).into()
            }),
        )
        .init();

    let relay = &mut config.relay;
    if let Some(bind) = args.bind.clone() {
        relay.bind = bind;
    }
    if let Some(port) = args.port {
        relay.port = port;
    }
    if let Some(ttl) = args.session_ttl {
        relay.session_ttl_secs = ttl;
    }
    if args.auto_create {
        relay.auto_create_sessions = true;
    }
    if args.legacy {
        relay.role_management = false;
    }
    if args.print_config {
        println!("{}", config_to_json(&config));
        return;
    }

    let manager = SessionManager::new(ManagerConfig::from(&config.relay));
    let auto_create = config.relay.auto_create_sessions;

    let addr = format!("{}:{}", config.relay.bind, config.relay.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind TCP listener");
            std::process::exit(1);
        }
    };

    tracing::info!(
        addr = %addr,
        policy = %config.relay.conflict_policy,
        role_management = config.relay.role_management,
        ttl = ?Duration::from_secs(config.relay.session_ttl_secs),
        "tandem-relay listening"
    );

    let _maintenance = manager.spawn_maintenance();

    // Accept loop.
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let manager = manager.clone();
                tokio::spawn(handle_connection(stream, addr, manager, auto_create));
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}
