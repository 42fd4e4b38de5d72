//! Supervisor: builds every component, spawns the long-running loops,
//! watches their heartbeats, and drains everything on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zkperp_mm::alerts::{fire_and_forget, AlertLevel, AlertSink};
use zkperp_mm::config::Config;
use zkperp_mm::exchange::{ws_auth_token, OrderApi, OrderClientConfig, RestOrderClient};
use zkperp_mm::ledger::{MetricsLedger, PositionJournal};
use zkperp_mm::mm::account_ws::AccountListener;
use zkperp_mm::mm::hedger::Hedger;
use zkperp_mm::mm::maker::MakerEngine;
use zkperp_mm::mm::market_ws::MarketDataListener;
use zkperp_mm::now_ts;
use zkperp_mm::state::StateStore;
use zkperp_mm::telemetry::Telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = init_tracing();

    let cfg = Config::load_from_env();
    let app = cfg.app.name.clone();

    info!("═══════════════════════════════════════════════════");
    info!("  {app} — perp maker + inventory hedger");
    info!("═══════════════════════════════════════════════════");

    // ── ambient services ──
    let telemetry = Telemetry::new(cfg.telemetry.enabled, cfg.telemetry.port);
    tokio::spawn(telemetry.clone().serve());

    let alerts = AlertSink::new(cfg.alerts.webhook_url.clone(), cfg.alerts.enabled, &app);
    let state = Arc::new(StateStore::new());
    let ledger = Arc::new(MetricsLedger::new(
        cfg.ledger.path.clone(),
        cfg.ledger.archive_dir.clone().map(Into::into),
        cfg.ledger.max_bytes,
    ));
    let positions = Arc::new(PositionJournal::new(cfg.ledger.positions_path.clone()));

    let start_ts = now_ts();
    telemetry.set_gauge("app_start_ts", start_ts);
    fire_and_forget(&alerts, AlertLevel::Info, "Startup", &format!("{app} starting"));

    // ── order routing capability ──
    let have_key = cfg.api.private_key.is_some();
    let order_client: Arc<dyn OrderApi> = Arc::new(RestOrderClient::new(
        OrderClientConfig {
            base_url: cfg.api.base_url.clone(),
            account_index: cfg.api.account_index,
            api_key_index: cfg.api.api_key_index,
            size_scale: cfg.maker.size_scale,
            price_scale: cfg.maker.price_scale,
            request_timeout_ms: cfg.maker.limits.max_latency_ms,
            dry_run: !have_key,
        },
        cfg.api.private_key.clone(),
    ));

    // derive a WS auth token from the signing key when none was configured
    let mut ws_cfg = cfg.ws.clone();
    if ws_cfg.auth_token.is_none() {
        if let Some(key) = &cfg.api.private_key {
            match ws_auth_token(cfg.api.account_index, key, 24 * 3600) {
                Ok(token) => {
                    info!("derived WS auth token from signing key");
                    ws_cfg.auth_token = Some(token);
                }
                Err(err) => warn!("WS auth token derivation failed: {err}"),
            }
        }
    }

    // ── core loops ──
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (hedge_tx, hedge_rx) = mpsc::channel(64);
    let mut tasks = Vec::new();

    let listener = MarketDataListener::new(
        ws_cfg.clone(),
        cfg.capture.clone(),
        cfg.synthetic.clone(),
        &cfg.maker.pair,
        state.clone(),
        telemetry.clone(),
        alerts.clone(),
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(listener.run()));

    let account = AccountListener::new(
        ws_cfg.clone(),
        Some(cfg.api.account_index),
        &cfg.maker.pair,
        cfg.fees.clone(),
        state.clone(),
        ledger.clone(),
        positions.clone(),
        telemetry.clone(),
        hedge_tx,
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(account.run()));

    let hedger_dry_run =
        cfg.hedger.effective_dry_run(cfg.fees.taker_actual_rate) || !have_key;
    let hedger = Hedger::new(
        cfg.hedger.clone(),
        &cfg.maker.pair,
        hedger_dry_run,
        cfg.fees.taker_actual_rate,
        state.clone(),
        order_client.clone(),
        ledger.clone(),
        telemetry.clone(),
        alerts.clone(),
        hedge_rx,
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(hedger.run()));

    let maker = MakerEngine::new(
        cfg.maker.clone(),
        cfg.guard.clone(),
        state.clone(),
        order_client.clone(),
        telemetry.clone(),
        alerts.clone(),
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(maker.run()));

    // periodic gauges
    {
        let telemetry = telemetry.clone();
        let state = state.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                telemetry.set_gauge("uptime_seconds", (now_ts() - start_ts).max(0.0));
                state.publish_gauges(&telemetry);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(Duration::from_secs(5)) => {}
                }
            }
        }));
    }

    // heartbeat watchdogs
    {
        let telemetry = telemetry.clone();
        let alerts = alerts.clone();
        let wd = cfg.watchdogs.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            info!(
                "[main] watchdogs enabled. ws_stale={}s quote_stale={}s",
                wd.ws_stale_seconds, wd.quote_stale_seconds
            );
            let mut last_ws_alert = 0.0_f64;
            let mut last_quote_alert = 0.0_f64;
            loop {
                let now = now_ts();
                if let Some(age) = telemetry.heartbeat_age("ws") {
                    if age > wd.ws_stale_seconds && now - last_ws_alert > wd.reminder_every_seconds
                    {
                        last_ws_alert = now;
                        fire_and_forget(
                            &alerts,
                            AlertLevel::Warning,
                            "WebSocket appears stale",
                            &format!("No WS frames for {}s.", age as i64),
                        );
                    }
                }
                if let Some(age) = telemetry.heartbeat_age("quote") {
                    if age > wd.quote_stale_seconds
                        && now - last_quote_alert > wd.reminder_every_seconds
                    {
                        last_quote_alert = now;
                        fire_and_forget(
                            &alerts,
                            AlertLevel::Warning,
                            "Maker quotes stale",
                            &format!("No quotes emitted for {}s.", age as i64),
                        );
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(Duration::from_secs(2)) => {}
                }
            }
        }));
    }

    info!("Starting {app}...");
    tokio::signal::ctrl_c().await.ok();

    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    telemetry.set_gauge("shutdown_ts", now_ts());
    alerts.info("Shutdown", &format!("{app} stopped")).await;

    // grace window, then force-cancel the stragglers
    sleep(Duration::from_millis(1200)).await;
    for task in tasks {
        task.abort();
        let _ = task.await;
    }
    Ok(())
}

/// Console logging by default; `LOG_DIR` adds a daily-rolled file writer.
/// The returned guard must stay alive or buffered lines are lost.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match std::env::var("LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "zkperp-mm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
