//! PushConn Server
//!
//! Demo server for push-message connections.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use msgcache::{MemoryStore, StoreMessageCache};
use server::auth::{StaticTokenAuthenticator, TOKEN_ENV_VAR};
use server::config::Config;
use server::{keyfile, Server};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// PushConn Server - secure persistent push-message connections.
#[derive(Parser, Debug)]
#[command(name = "pushconn-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for the server.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept client connections
    Serve,

    /// Generate a new server key
    Keygen {
        /// Overwrite an existing key file
        #[arg(long, short)]
        force: bool,
    },

    /// Print the server's public key for distribution to clients
    ShowKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.server.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Keygen { force } => {
            let path = &config.server.key_file;
            if path.exists() && !force {
                anyhow::bail!(
                    "Key file already exists: {} (use --force to replace it)",
                    path.display()
                );
            }
            let key = protocol::ServerKey::generate().context("Failed to generate server key")?;
            keyfile::save(path, &key)?;
            println!("Key written to: {}", path.display());
            println!("Public key: {}", key.public_key());
        }
        Commands::ShowKey => {
            let key = keyfile::load(&config.server.key_file)?;
            println!("{}", key.public_key());
        }
    }

    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("PushConn server starting...");

    let auth = StaticTokenAuthenticator::from_env()
        .with_context(|| format!("{} must be set to a non-empty token", TOKEN_ENV_VAR))?;
    let key = keyfile::load_or_generate(&config.server.key_file)?;
    tracing::info!("Server public key: {}", key.public_key());

    let shutdown = CancellationToken::new();

    let store = Arc::new(MemoryStore::new());
    let purger = Arc::clone(&store).spawn_purger(
        Duration::from_secs(config.cache.purge_interval_secs),
        shutdown.clone(),
    );
    let cache = Arc::new(StoreMessageCache::new(store));

    let server = Arc::new(Server::new(
        key,
        Arc::new(auth),
        cache,
        config.server_options(),
    ));
    let workers = server.spawn_workers(&shutdown);

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", config.server.listen_addr))?;

    let accept = tokio::spawn(Arc::clone(&server).serve(listener, shutdown.clone()));

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");
    shutdown.cancel();

    accept.await?.context("Accept loop failed")?;
    for worker in workers {
        worker.await?;
    }
    purger.await?;

    tracing::info!("PushConn server stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
