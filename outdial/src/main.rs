#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[macro_use]
extern crate slog;
#[macro_use]
extern crate slog_scope;

use std::sync::Arc;
use std::time::Duration;

use docopt::Docopt;
use serde_derive::Deserialize;
use tokio::sync::watch;

use outdial::app_state::AppState;
use outdial::dispatch::{RedialDispatcher, SmsDispatcher};
use outdial::maintenance;
use outdial::settings::Settings;
use outdial::tracker::CallStateTracker;
use outdial_common::errors::{DialerErrorKind, Result};
use outdial_common::logging;

const USAGE: &str = "
Usage: outdial [options]

Options:
    -h, --help                          Show this message.
    --config=CONFIGFILE                 Orchestrator configuration file path.
";

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let mut filenames = Vec::new();
    if let Some(config_filename) = args.flag_config {
        filenames.push(config_filename);
    }
    let settings =
        Settings::with_env_and_config_files(&filenames).map_err(DialerErrorKind::ConfigError)?;
    logging::init_logging(
        !settings.human_logs,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
    .expect("Logging failed to initialize");
    debug!("Starting up outdial...");

    let shutdown_budget = Duration::from_secs(settings.shutdown_budget_seconds);
    let state = AppState::from_settings(settings)
        .await
        .map_err(DialerErrorKind::ConfigError)?;
    info!("Starting outdial";
        "data_dir" => &state.settings.data_dir,
        "redial_tick_minutes" => state.settings.redial_tick_minutes,
        "sms_tick_minutes" => state.settings.sms_tick_minutes);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let redial_dispatcher = Arc::new(RedialDispatcher::new(state.clone()));
    handles.push(RedialDispatcher::spawn(
        redial_dispatcher,
        Duration::from_secs(state.settings.redial_tick_minutes * 60),
        shutdown_rx.clone(),
    ));

    let sms_dispatcher = Arc::new(SmsDispatcher::new(state.clone()));
    handles.push(SmsDispatcher::spawn(
        sms_dispatcher,
        Duration::from_secs(state.settings.sms_tick_minutes * 60),
        shutdown_rx.clone(),
    ));

    handles.push(CallStateTracker::spawn_periodic_flush(
        state.tracker.clone(),
        Duration::from_secs(state.settings.call_state_persist_interval_seconds),
        shutdown_rx.clone(),
    ));
    handles.push(maintenance::spawn_daily_reset(
        state.redial.clone(),
        state.policy.clone(),
        state.settings.reset_timing,
        shutdown_rx.clone(),
    ));
    handles.push(maintenance::spawn_retention_sweep(
        state.redial.clone(),
        state.webhook_log.clone(),
        state.policy.clone(),
        state.settings.retention_days,
        shutdown_rx.clone(),
    ));
    handles.push(maintenance::spawn_stale_sweep(
        state.tracker.clone(),
        state.policy.clone(),
        Duration::from_secs(state.settings.stale_pending_max_minutes * 60),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; stopping timers");
    let _ = shutdown_tx.send(true);

    // Finish in-flight ticks and final flushes within the budget; anything
    // unfinished is abandoned safely under the temp-then-rename protocol.
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(shutdown_budget, drain).await.is_err() {
        warn!("Shutdown budget exhausted; abandoning unfinished work");
    }
    state.flush_all().await;

    info!("Shutting down outdial");
    Ok(())
}
