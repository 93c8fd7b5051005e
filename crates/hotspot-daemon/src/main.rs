//! `hotspotd`
//!
//! Runs the hotspot policy engine, quota ledger, payment settlement flow and
//! RouterOS reconciler, and serves the HTTP API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use hotspot_core::Counters;
use hotspot_core::config::{RouterBackend, load_config};
use hotspot_crypto::SecretBox;
use hotspot_daemon::app::{App, AppParts};
use hotspot_daemon::cache::MemoryCache;
use hotspot_daemon::notify::{NoopNotifier, Notifier, WhatsAppNotifier};
use hotspot_daemon::payment::{HttpProvider, MemoryProvider, PaymentProvider, ProviderConfig};
use hotspot_daemon::settings::{HotspotSettings, SettingsStore};
use hotspot_daemon::storage::Database;
use hotspot_routeros::{MemoryRouter, RestConfig, RestTransport, RouterApi, RouterClient};

#[derive(Parser, Debug)]
#[command(name = "hotspotd")]
#[command(version, about = "hotspotd - captive portal policy, payments and RouterOS reconciler")]
struct Args {
    /// Config file (JSON), layered over the global one
    #[arg(long, env = "HOTSPOT_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Database file path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "HOTSPOT_LOG_JSON")]
    log_json: bool,

    /// `rest` drives the router; `memory` is a dry run.
    #[arg(long)]
    router_backend: Option<RouterBackend>,

    /// `production` rejects unsigned webhooks; `development` only warns.
    #[arg(long)]
    environment: Option<String>,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "HOTSPOT_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.bind_addr = addr.to_string();
    }
    if let Some(path) = args.db_path {
        config.server.database_path = Some(path);
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    if let Some(backend) = args.router_backend {
        config.router.backend = backend;
    }
    if let Some(environment) = args.environment {
        config.server.environment = environment;
    }

    let log_filter = format!("hotspot_daemon={0},hotspotd={0}", config.server.log_level);
    // Held until exit so the final counter values are exported.
    #[cfg(feature = "metrics")]
    let telemetry = match args.metrics_endpoint.as_deref() {
        Some(endpoint) => Some(hotspot_core::tracing_init::init_tracing_with_metrics(
            &log_filter,
            args.log_json,
            &hotspot_core::metrics::TelemetryOptions::new(endpoint, &config.server.environment),
        )?),
        None => {
            hotspot_core::tracing_init::init_tracing(&log_filter, args.log_json);
            None
        }
    };
    #[cfg(not(feature = "metrics"))]
    hotspot_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let addr: SocketAddr = config
        .server
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind_addr))?;
    let production = config.server.is_production();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        backend = ?config.router.backend,
        production,
        "Starting hotspotd"
    );

    let db_path = match &config.server.database_path {
        Some(path) => path.clone(),
        None => hotspot_core::config::database_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let secret_box = config
        .security
        .settings_passphrase
        .as_deref()
        .map(SecretBox::from_passphrase)
        .transpose()?;
    if secret_box.is_none() {
        warn!("No settings passphrase; encrypted settings cannot be read or written");
    }
    let settings = SettingsStore::new(db.clone(), secret_box);
    let snapshot = HotspotSettings::load(&settings).await?;

    let (router, provider): (Arc<dyn RouterApi>, Arc<dyn PaymentProvider>) =
        match config.router.backend {
            RouterBackend::Rest => {
                let base_url = snapshot
                    .router
                    .base_url()
                    .ok_or_else(|| anyhow::anyhow!("MIKROTIK_HOST is not configured"))?;
                let transport = RestTransport::new(&RestConfig {
                    base_url,
                    username: snapshot.router.username.clone(),
                    password: snapshot.router.password.clone().unwrap_or_default(),
                    pool_size: config.router.pool_size,
                    command_timeout: Duration::from_secs(config.router.command_timeout_secs),
                    accept_invalid_certs: snapshot.router.accept_invalid_certs,
                })?;
                let server_key = settings.require("PAYMENT_SERVER_KEY").await?;
                let provider = HttpProvider::new(&ProviderConfig {
                    base_url: snapshot.payment_base_url.clone(),
                    server_key,
                })?;
                (
                    Arc::new(RouterClient::new(transport)),
                    Arc::new(provider),
                )
            }
            RouterBackend::Memory => {
                warn!("Dry run: router and payment provider are in-process");
                (
                    Arc::new(MemoryRouter::memory()),
                    Arc::new(MemoryProvider::new()),
                )
            }
        };

    let notifier: Arc<dyn Notifier> = match (
        snapshot.whatsapp_base_url.as_deref(),
        settings.get_string("WHATSAPP_API_KEY").await?,
    ) {
        (Some(base_url), Some(api_key)) => Arc::new(WhatsAppNotifier::new(base_url, &api_key)?),
        _ => {
            info!("WhatsApp gateway not configured; notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    if config.security.admin_token.is_none() {
        warn!("HOTSPOT_ADMIN_TOKEN is not set; /api routes will reject every request");
    }

    let app = App::new(AppParts {
        db,
        settings,
        cache: Arc::new(MemoryCache::default()),
        router,
        provider,
        notifier,
        counters: Counters::new(),
        production,
        admin_token: config.security.admin_token.clone(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = app.scheduler.spawn(&shutdown_rx);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = hotspot_daemon::server::serve(addr, app.clone(), shutdown_rx) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    info!(counters = ?app.counters.snapshot(), "hotspotd stopped");
    #[cfg(feature = "metrics")]
    if let Some(guard) = telemetry
        && let Err(e) = guard.shutdown()
    {
        warn!(error = %e, "Telemetry flush failed");
    }
    Ok(())
}
