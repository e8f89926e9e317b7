use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use avc_daemon::{
    api::{ApiState, api_router},
    config::{Config, InstallerConfig, Lwm2mConfig, StorageConfig},
    downloader::{sink::FilePackageSink, source::HttpSource},
    installer::{CommandInstaller, Installer, NoopInstaller},
    runtime::{self, Collaborators, Settings},
    session::{connectivity::ManualConnection, lwm2m::MockLwm2mClient},
    storage::{Storage, file::FileStorage, memory::MemoryStorage, sqlite::SqliteStorage},
};
use axum::routing::get;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "avc-daemon")]
#[command(about = "Package download and update daemon for device management")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "avc-daemon.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,avc_daemon=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage, nothing survives a restart");
            run_daemon(MemoryStorage::default(), &config).await?;
        }
        StorageConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite storage");
            run_daemon(SqliteStorage::new(path).await?, &config).await?;
        }
        StorageConfig::File { dir } => {
            info!(dir = ?dir, "Using file storage");
            run_daemon(FileStorage::new(dir).await?, &config).await?;
        }
    }

    Ok(())
}

async fn run_daemon<S>(storage: S, config: &Config) -> color_eyre::Result<()>
where
    S: Storage + Clone,
{
    let cancel = CancellationToken::new();

    let lwm2m = match config.lwm2m {
        Lwm2mConfig::Mock { ack_delay_ms } => {
            info!(ack_delay_ms, "Using mock LWM2M client");
            Arc::new(MockLwm2mClient::new(Duration::from_millis(ack_delay_ms)))
        }
    };

    let installer: Arc<dyn Installer> = match &config.installer {
        InstallerConfig::Noop => Arc::new(NoopInstaller),
        InstallerConfig::Command { program, args } => {
            info!(program = ?program, "Using command installer");
            Arc::new(CommandInstaller::new(program.clone(), args.clone()))
        }
    };

    let source = HttpSource::new(
        Duration::from_secs(config.download.connect_timeout_secs),
        config.download.ca_cert.as_deref(),
    )?;
    let sink = FilePackageSink::new(&config.download.work_dir).await?;

    let parts = Collaborators {
        lwm2m,
        connection: Arc::new(ManualConnection::new(true)),
        source: Arc::new(source),
        sink: Arc::new(sink),
        installer,
    };
    let settings = Settings {
        downloader: config.download.downloader(),
        session: config.session.session(),
        push_ack_timeout: config.session.push_ack_timeout(),
    };

    let runtime = runtime::start(storage, parts, settings, cancel.clone()).await?;

    let api = api_router(ApiState {
        session: runtime.session.clone(),
        update: runtime.update.clone(),
        reporter: runtime.reporter.clone(),
    });
    let axum_app = api.route("/health", get(health_handler));

    let http_addr = config.server.http_addr;
    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let mut events = runtime.bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(status = ?event.status, kind = ?event.kind, progress = ?event.progress, "status");
        }
    });

    let cancel_clone = cancel.clone();
    tokio::select! {
        result = axum::serve(axum_listener, axum_app).with_graceful_shutdown(async move {
            cancel_clone.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }
    cancel.cancel();

    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}
