//! rollgated — the rollgate daemon.
//!
//! Opens the fleet state store, builds the rollout engine and serves the
//! Omaha endpoint plus the management API.
//!
//! # Usage
//!
//! ```text
//! rollgated serve --config /etc/rollgate/rollgate.toml --listen 0.0.0.0:8000
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rollgate_core::{ChannelAliases, RollgateConfig};
use rollgate_omaha::Handler;
use rollgate_rollout::{Controller, ControllerConfig};
use rollgate_state::StateStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,rollgated=debug,rollgate=debug";

#[derive(Parser)]
#[command(name = "rollgated", about = "rollgate update server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve Omaha update checks and the management API.
    Serve {
        /// Path to rollgate.toml. Built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to listen on, overriding `[server] listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Directory for the state database, overriding `[store] path`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            serve(config, listen, data_dir).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    listen: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => RollgateConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RollgateConfig::default(),
    };
    info!(config = ?config_path, "rollgate daemon starting");

    // ── State store ────────────────────────────────────────────

    let db_path = match data_dir {
        Some(dir) => dir.join("rollgate.redb"),
        None => config.store.path.clone(),
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Rollout engine ─────────────────────────────────────────

    let controller_config = ControllerConfig::from_rollout_config(&config.rollout)?;
    info!(
        validity = ?controller_config.validity_interval,
        disable_on_failure = controller_config.disable_updates_on_failed_rollout,
        "rollout engine initialized"
    );
    let controller = Controller::new(store, controller_config);

    let aliases = ChannelAliases::new(&config.channel_aliases);
    info!(count = aliases.len(), "channel aliases loaded");

    // ── HTTP server ────────────────────────────────────────────

    let router = rollgate_api::build_router(Handler::new(controller, aliases));
    let addr = match listen {
        Some(addr) => addr,
        None => config
            .server
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", config.server.listen))?,
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
    })
    .await?;

    info!("rollgate daemon stopped");
    Ok(())
}
