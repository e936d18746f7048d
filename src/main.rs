use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use pairlink::{Config, Directory, InMemoryDirectory, MatchmakingServer, MigrationLoop};

#[derive(Parser, Debug)]
#[command(name = "pairlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP control-plane bind address.
    #[arg(long)]
    http_bind: Option<String>,

    /// Override the matchmaking listener bind address.
    #[arg(long)]
    matchmaking_bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.http_bind {
        config.http.bind = bind;
    }
    if let Some(bind) = args.matchmaking_bind {
        config.matchmaking.bind = bind;
    }

    let directory: Arc<dyn Directory> =
        Arc::new(InMemoryDirectory::with_relay_ttl(config.relay_ttl()));

    let matchmaking_listener = TcpListener::bind(&config.matchmaking.bind)
        .await
        .with_context(|| format!("failed to bind matchmaking listener on {}", config.matchmaking.bind))?;
    let http_listener = TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http.bind))?;
    info!(http = %config.http.bind, matchmaking = %config.matchmaking.bind, "pairlink directory starting");

    let matchmaking = Arc::new(MatchmakingServer::new(Arc::clone(&directory), &config));
    let migration = MigrationLoop::new(Arc::clone(&directory), &config);
    let router = pairlink::api::build_router(Arc::clone(&directory));

    let mut matchmaking_task = tokio::spawn(matchmaking.run(matchmaking_listener));
    let mut migration_task = tokio::spawn(migration.run());
    let mut http_task = tokio::spawn(async move {
        axum::serve(
            http_listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    // The servers run until a shutdown signal; a task exiting on its own is
    // a failure worth surfacing as exit code 1.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
            Ok(())
        }
        result = &mut matchmaking_task => {
            result.context("matchmaking task panicked")?.context("matchmaking server failed")
        }
        result = &mut migration_task => {
            result.context("migration task panicked")?;
            anyhow::bail!("migration loop exited unexpectedly")
        }
        result = &mut http_task => {
            result.context("HTTP task panicked")?.context("HTTP server failed")
        }
    }
}
