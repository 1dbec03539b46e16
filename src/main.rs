// =============================================================================
// Borealis — Main Entry Point
// =============================================================================
//
// Startup order: env + logging, signal store, alert sink, monitor services
// restored from persisted configuration, then the signal-router API. A clean
// Ctrl+C stops the monitors and exits 0; a failed bootstrap (bad database,
// unbindable port) propagates as a non-zero exit.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use borealis_bot::alert::DingTalkAlerts;
use borealis_bot::api;
use borealis_bot::app_state::AppState;
use borealis_bot::config::AppConfig;
use borealis_bot::market::minute_alert::{MinuteAlertParams, MinuteAlertService};
use borealis_bot::market::monitor::MonitorConfig;
use borealis_bot::market::{CandleFetcher, MonitorService};
use borealis_bot::store::SignalStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Signal Orchestrator — Starting Up        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = AppConfig::from_env();
    info!(bind_addr = %config.bind_addr, database = %config.database_url, "configuration loaded");

    // ── 2. Persistence & alerts ──────────────────────────────────────────
    let store = SignalStore::connect(&config.database_url)
        .await
        .context("signal store bootstrap failed")?;
    // A default operator row so the monitor-config singleton has an owner.
    store
        .ensure_user("operator")
        .await
        .context("failed to ensure default operator user")?;

    let alerts = Arc::new(DingTalkAlerts::new(
        config.dingtalk_token.clone(),
        config.dingtalk_secret.clone(),
    ));
    if config.dingtalk_token.is_none() {
        warn!("DINGTALK_TOKEN not set, alerts will be logged and skipped");
    }

    let fetcher = Arc::new(CandleFetcher::new());

    // ── 3. Market monitor (restored from persisted config) ───────────────
    let monitor: Option<MonitorService> = match store.get_currency_monitor_config().await {
        Ok(Some(raw)) => match serde_json::from_str::<MonitorConfig>(&raw) {
            Ok(monitor_config) if !monitor_config.pairs.is_empty() => {
                let service = MonitorService::new(
                    monitor_config.pairs(),
                    monitor_config.params(),
                    fetcher.clone(),
                    alerts.clone(),
                );
                service.start();
                Some(service)
            }
            Ok(_) => {
                info!("monitor config present but has no pairs, monitor not started");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to parse persisted monitor config");
                None
            }
        },
        Ok(None) => {
            info!("no persisted monitor config, monitor not started");
            None
        }
        Err(e) => {
            warn!(error = %e, "monitor config lookup failed");
            None
        }
    };

    // ── 4. Minute alert service (env-configured) ─────────────────────────
    let minute_alerts = if config.minute_alert_symbols.is_empty() {
        None
    } else {
        let service = MinuteAlertService::new(
            config.minute_alert_symbols.clone(),
            MinuteAlertParams::default(),
            fetcher.clone(),
            alerts.clone(),
        );
        service.start();
        Some(service)
    };

    // ── 5. Signal router API ─────────────────────────────────────────────
    let state = Arc::new(AppState::new(store, alerts, config.clone()));
    let app = api::rest::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "signal router listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Some(service) = &minute_alerts {
        service.stop().await;
    }
    if let Some(service) = &monitor {
        service.stop().await;
    }

    info!("Borealis shut down complete.");
    Ok(())
}
