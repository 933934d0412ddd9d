// =============================================================================
// Latency Probe — round-trip time measurement and half-life retuning
// =============================================================================
//
// Periodically submits a deliberately un-fillable limit BUY (one unit at an
// absurdly low price, IOC) on the reference pair's ARS leg and measures the
// wall time until the venue's execution report for that client order id comes
// back. The rolling median RTT retunes the reference estimator's half-life:
//
//   half_life = clamp(ref_k × median_rtt_s, [ref_min_hl_s, ref_max_hl_s])
//
// Failures are silent; the probe keeps running.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Settings;
use crate::discovery::pick_reference_pair;
use crate::reference::RateEstimator;
use crate::types::{Pair, Side, Tif};
use crate::wire::{OrderGateway, WireClient};

/// Samples kept in the rolling window.
const RTT_WINDOW: usize = 120;

/// Probe orders are tiny and priced far below any plausible bid.
const PROBE_QTY: i64 = 1;
const PROBE_PRICE: f64 = 0.01;

/// Upper bound on the wait for the probe's own execution report.
const PROBE_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Rolling round-trip-time window with a median readout.
#[derive(Debug)]
pub struct RttWindow {
    buf: VecDeque<f64>,
    cap: usize,
}

impl RttWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn add(&mut self, ms: f64) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(ms);
    }

    /// Median of the window; the mean of the two middle samples when even.
    pub fn median_ms(&self) -> Option<f64> {
        if self.buf.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.buf.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        Some(if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        })
    }
}

/// Retune target for a measured median RTT.
pub fn tuned_half_life(median_rtt_ms: f64, ref_k: f64, min_hl_s: f64, max_hl_s: f64) -> f64 {
    (ref_k * median_rtt_ms / 1000.0).clamp(min_hl_s, max_hl_s)
}

/// Long-running probe task. Holds the hot-swappable client handle so a
/// re-authentication does not kill the probe.
pub async fn run_latency_probe(
    client: Arc<RwLock<Arc<WireClient>>>,
    settings: Arc<RwLock<Settings>>,
    estimator: Arc<Mutex<RateEstimator>>,
    pairs: Arc<RwLock<Vec<Pair>>>,
    cancel: CancellationToken,
) {
    let mut window = RttWindow::new(RTT_WINDOW);

    loop {
        let probe_interval = settings.read().lat_probe_s.max(1.0);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs_f64(probe_interval)) => {}
        }

        let gateway = client.read().clone();
        let Some(symbol) = probe_symbol(&gateway, &pairs.read()) else {
            continue;
        };

        // Subscribe before sending so the echo cannot be missed.
        let mut reports = gateway.subscribe_reports();
        let sent_at = Instant::now();
        let clid = match gateway
            .send_limit(&symbol, Side::Buy, PROBE_QTY, PROBE_PRICE, Tif::Ioc)
            .await
        {
            Ok(clid) => clid,
            Err(e) => {
                debug!(error = %e, "latency probe order failed");
                continue;
            }
        };

        let Some(rtt_ms) = await_probe_echo(&mut reports, &clid, sent_at).await else {
            debug!(symbol = %symbol, "latency probe report never arrived");
            continue;
        };

        window.add(rtt_ms);
        debug!(symbol = %symbol, rtt_ms, "latency probe round trip");

        let (tune, k, min_hl, max_hl) = {
            let s = settings.read();
            (s.ref_tune, s.ref_k, s.ref_min_hl_s, s.ref_max_hl_s)
        };
        if tune {
            if let Some(median) = window.median_ms() {
                let half_life = tuned_half_life(median, k, min_hl, max_hl);
                settings.write().half_life_s = half_life;
                estimator.lock().set_half_life(half_life);
                debug!(median_ms = median, half_life_s = half_life, "reference half-life retuned");
            }
        }
    }
}

fn probe_symbol(gateway: &WireClient, pairs: &[Pair]) -> Option<String> {
    let subscribed = gateway.subscribed_symbols();
    if let Some(reference) = pick_reference_pair(pairs) {
        if subscribed.contains(&reference.ars_symbol) {
            return Some(reference.ars_symbol);
        }
    }
    subscribed.first().cloned()
}

async fn await_probe_echo(
    reports: &mut tokio::sync::broadcast::Receiver<crate::types::ExecReport>,
    clid: &str,
    sent_at: Instant,
) -> Option<f64> {
    let deadline = sent_at + PROBE_REPORT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, reports.recv()).await {
            Ok(Ok(er)) if er.client_order_id == clid => {
                return Some(sent_at.elapsed().as_secs_f64() * 1000.0);
            }
            Ok(Ok(_)) => {} // someone else's report
            Ok(Err(_)) | Err(_) => return None,
        }
    }
}
