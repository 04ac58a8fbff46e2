//! pushgate - Matrix push gateway
//!
//! Receives notify requests from homeservers on
//! `POST /_matrix/push/v1/notify` and relays them to APNs, FCM or WebPush
//! depending on which configured app-id pattern the device matches,
//! reporting permanently invalid pushkeys back in the response.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod dispatcher;
mod error;
mod metrics;
mod notification;
mod proxy;
mod push;
mod server;

use config::AppConfig;
use dispatcher::Dispatcher;
use metrics::Metrics;
use push::{ApnsPushkin, FcmPushkin, Pushkin, PushkinRegistry, WebPushPushkin};
use server::{AppState, GatewayServer, MetricsServer};

/// Grace period for in-flight notify requests once shutdown begins; the
/// same budget the dispatcher gives a whole notification.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// pushgate - Matrix push gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "PUSHGATE_CONF", default_value = "pushgate.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    init_logging(&config.log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %args.config,
        "Starting pushgate"
    );

    let metrics = Metrics::new().context("Failed to register metrics")?;

    let registry = build_registry(&config, &metrics)
        .await
        .context("Failed to set up pushkins")?;

    info!(
        apps = %config.apps.keys().cloned().collect::<Vec<_>>().join(", "),
        "Configured app ID patterns"
    );

    let state = Arc::new(AppState {
        dispatcher: Arc::new(Dispatcher::new(registry, metrics.clone())),
        metrics: metrics.clone(),
    });

    // Flipped exactly once, when the process is asked to stop; both
    // servers watch it and stop accepting.
    let (stop_tx, stop_rx) = watch::channel(false);

    let gateway = GatewayServer::new(config.http.clone(), state.clone());
    let gateway_stop = stop_rx.clone();
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run(gateway_stop).await {
            error!(error = %e, "Gateway server error");
            std::process::exit(1);
        }
    });

    let metrics_server = MetricsServer::new(config.metrics.clone(), metrics);
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = metrics_server.run(stop_rx).await {
            error!(error = %e, "Metrics server error");
            std::process::exit(1);
        }
    });

    info!("pushgate running");

    wait_for_termination().await;
    let _ = stop_tx.send(true);

    info!("Draining in-flight requests");
    let drained = timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(gateway_handle, metrics_handle);
    })
    .await;

    match drained {
        Ok(()) => info!("pushgate stopped"),
        Err(_) => warn!(
            grace = ?SHUTDOWN_GRACE,
            "Drain period elapsed, abandoning remaining requests"
        ),
    }

    Ok(())
}

/// Block until the process is asked to stop.
///
/// SIGTERM is how orchestrators ask; Ctrl+C covers interactive runs.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, falling back to Ctrl+C only");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        // No signal source at all: stay up until the process is killed.
        error!(error = %e, "Cannot listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}

/// Construct every configured pushkin; any failure is fatal at startup.
async fn build_registry(config: &AppConfig, metrics: &Metrics) -> Result<PushkinRegistry> {
    let mut registry = PushkinRegistry::new();
    let global_proxy = config.proxy.as_deref();

    for (pattern, app) in &config.apps {
        let pushkin: Arc<dyn Pushkin> = match app.kind.as_str() {
            "apns" => Arc::new(
                ApnsPushkin::new(pattern, app, global_proxy, metrics.clone())
                    .await
                    .with_context(|| format!("app '{pattern}'"))?,
            ),
            "gcm" => Arc::new(
                FcmPushkin::new(pattern, app, global_proxy, metrics.clone())
                    .await
                    .with_context(|| format!("app '{pattern}'"))?,
            ),
            "webpush" => Arc::new(
                WebPushPushkin::new(pattern, app, global_proxy, metrics.clone())
                    .await
                    .with_context(|| format!("app '{pattern}'"))?,
            ),
            other => anyhow::bail!("app '{pattern}' has unknown type '{other}'"),
        };

        info!(pattern = %pattern, kind = %app.kind, "Created pushkin");
        registry.insert(pattern, pushkin);
    }

    Ok(registry)
}

/// Initialize tracing from the `log` config section. `RUST_LOG` wins over
/// the configured level when set; format "off" disables output entirely.
fn init_logging(config: &config::LogConfig) {
    if config.format == "off" {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.init(),
    }
}
