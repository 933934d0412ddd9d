// =============================================================================
// MEP Engine — Main Entry Point
// =============================================================================
//
// Single long-running process. The environment ("paper" or "live") selects
// URL bases and the credential pair; startup aborts with a non-zero exit when
// discovery yields no pairs or the initial authentication is rejected.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod control;
mod discovery;
mod engine;
mod error;
mod executor;
mod latency;
mod quotes;
mod reconcile;
mod reference;
mod signals;
mod status;
mod types;
mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::control::ControlChannel;
use crate::discovery::{discover_pairs, pick_reference_pair, symbols_for};
use crate::engine::{run_account_refresh, run_fill_consumer, run_instrument_refresh, Engine};
use crate::error::ConfigError;
use crate::latency::run_latency_probe;
use crate::reconcile::Reconciler;
use crate::reference::RateEstimator;
use crate::status::StatusPublisher;
use crate::wire::{RestClient, WireClient};

const SETTINGS_PATH: &str = "settings.json";

/// Grace period for child tasks after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              MEP Engine — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut settings = Settings::load(SETTINGS_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        Settings::default()
    });
    apply_env_overrides(&mut settings);

    // Missing credentials for the selected environment are fatal.
    settings.credentials()?;
    info!(env = %settings.env, account = %settings.account(), "environment selected");

    let settings = Arc::new(RwLock::new(settings));

    // ── 2. Instrument discovery ──────────────────────────────────────────
    let rest = {
        let s = settings.read();
        RestClient::new(s.urls().0, s.rest_timeout_s)
    };
    let pairs = discover_pairs(&rest).await?;
    if pairs.is_empty() {
        return Err(ConfigError::NoPairs.into());
    }
    let reference_pair = pick_reference_pair(&pairs).expect("non-empty pair set");
    info!(
        pairs = pairs.len(),
        reference = %reference_pair,
        "tradable pairs discovered"
    );

    let symbols = symbols_for(&pairs);
    let pairs = Arc::new(RwLock::new(pairs));

    // ── 3. Wire client ───────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let auth_failed = Arc::new(AtomicBool::new(false));

    let client = Arc::new(WireClient::new(settings.clone(), symbols));
    {
        let runner = client.clone();
        let cancel = cancel.clone();
        let auth_failed = auth_failed.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!(error = %e, "wire client terminated");
                if e.is_auth() {
                    auth_failed.store(true, Ordering::SeqCst);
                }
                cancel.cancel();
            }
        });
    }

    // Block trading until the first authentication lands (or fails).
    while client.token().is_empty() {
        if cancel.is_cancelled() {
            anyhow::bail!("authentication unrecoverable — aborting startup");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // ── 4. Initial account snapshot ──────────────────────────────────────
    let account = settings.read().account();
    let (cash_ars, cash_usd) = match rest.account_report(&client.token(), &account).await {
        Ok(cash) => cash,
        Err(e) => {
            warn!(error = %e, "initial account snapshot failed — starting from zero");
            (0.0, 0.0)
        }
    };
    info!(cash_ars, cash_usd, "account seeded");
    let reconciler = Arc::new(Reconciler::new(cash_ars, cash_usd));

    // ── 5. Shared state & auxiliary tasks ────────────────────────────────
    let estimator = Arc::new(Mutex::new(RateEstimator::new(settings.read().half_life_s)));
    let client = Arc::new(RwLock::new(client));

    tokio::spawn(run_fill_consumer(
        client.clone(),
        reconciler.clone(),
        cancel.clone(),
    ));
    tokio::spawn(run_account_refresh(
        settings.clone(),
        client.clone(),
        reconciler.clone(),
        cancel.clone(),
    ));
    tokio::spawn(run_instrument_refresh(
        settings.clone(),
        client.clone(),
        pairs.clone(),
        cancel.clone(),
    ));
    tokio::spawn(run_latency_probe(
        client.clone(),
        settings.clone(),
        estimator.clone(),
        pairs.clone(),
        cancel.clone(),
    ));

    // ── 6. Trading loop ──────────────────────────────────────────────────
    let publisher = StatusPublisher::new(settings.read().state_dir.clone())?;
    let control = ControlChannel::new(settings.read().control_path.clone());

    let engine = Engine {
        settings: settings.clone(),
        client: client.clone(),
        estimator,
        reconciler,
        pairs,
        publisher,
        cancel: cancel.clone(),
    };
    let engine_task = tokio::spawn(engine.run(control));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => warn!("shutdown signal received"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    let current = client.read().clone();
    current.stop().await;
    if tokio::time::timeout(SHUTDOWN_GRACE, engine_task).await.is_err() {
        warn!("trading loop did not stop within the grace period");
    }

    if auth_failed.load(Ordering::SeqCst) {
        anyhow::bail!("authentication rejected by the venue");
    }

    if let Err(e) = settings.read().save(SETTINGS_PATH) {
        warn!(error = %e, "failed to save settings on shutdown");
    }

    info!("MEP engine shut down complete");
    Ok(())
}

/// Credentials and environment selection may come from the process
/// environment instead of the settings file.
fn apply_env_overrides(settings: &mut Settings) {
    let overrides: [(&str, &mut String); 8] = [
        ("MEP_ENV", &mut settings.env),
        ("MEP_PAPER_USERNAME", &mut settings.paper_username),
        ("MEP_PAPER_PASSWORD", &mut settings.paper_password),
        ("MEP_LIVE_USERNAME", &mut settings.live_username),
        ("MEP_LIVE_PASSWORD", &mut settings.live_password),
        ("MEP_ACCOUNT_PAPER", &mut settings.account_paper),
        ("MEP_ACCOUNT_LIVE", &mut settings.account_live),
        ("MEP_PROPRIETARY_TAG", &mut settings.proprietary_tag),
    ];
    for (var, field) in overrides {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                *field = value.trim().to_string();
            }
        }
    }
}
