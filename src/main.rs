use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beadhub::config::{Config, ConfigOverrides};
use beadhub::notify;
use beadhub::server::{create_router, AppState};
use beadhub::store::{SqliteStore, Store};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "beadhub")]
#[command(about = "Coordination server for autonomous coding agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve {
        /// Host to bind to (overrides HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (overrides PORT)
        #[arg(long, short)]
        port: Option<u16>,

        /// SQLite database path (overrides DATABASE_URL)
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create the database and apply the schema
    Init {
        /// SQLite database path (overrides DATABASE_URL)
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

fn run_init(database: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::from_env(ConfigOverrides {
        database,
        ..Default::default()
    })?;
    if let Some(parent) = config.database.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = SqliteStore::new(&config.database)?;
    store.initialize()?;
    println!("Initialized database at {}", config.database.display());
    Ok(())
}

async fn run_serve(overrides: ConfigOverrides) -> anyhow::Result<()> {
    let config = Config::from_env(overrides)?;
    let addr = config.socket_addr()?;

    let store = SqliteStore::new(&config.database)
        .with_context(|| format!("open database at {}", config.database.display()))?;
    store.initialize().context("apply schema")?;
    let store: Arc<dyn Store> = Arc::new(store);

    let state = Arc::new(AppState::new(store.clone(), config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = notify::spawn(store, state.events.clone(), shutdown_rx);

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("Starting server on {}", addr);

    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = interrupted.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        info!("shutdown signal received, draining");
    });
    serve.await.context("server error")?;

    // Let the dispatcher finish its current batch.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(DRAIN_TIMEOUT, dispatcher).await.is_err() {
        tracing::warn!("dispatcher did not stop within drain timeout");
    }

    if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
        // Conventional SIGINT exit status.
        std::process::exit(130);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("beadhub=info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Admin {
            command: AdminCommands::Init { database },
        } => run_init(database),
        Commands::Serve {
            host,
            port,
            database,
        } => {
            run_serve(ConfigOverrides {
                host,
                port,
                database,
            })
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let unreachable = e
                .chain()
                .any(|cause| cause.downcast_ref::<std::io::Error>().is_some());
            if unreachable {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
