// =============================================================================
// Trading Loop — signal → execution orchestration
// =============================================================================
//
// Each tick at `poll_s` cadence:
//   1. apply control overrides and consume one-shot actions
//   2. snapshot quotes and cash
//   3. feed the reference estimator from the reference pair
//   4. select references per REF_MODE
//   5. trade every qualifying ARS→USD pair, sequentially
//   6. trade the single best USD→ARS candidate when USD cash is available
//   7. publish status / books / positions snapshots
//   8. sleep until the next tick
//
// The loop owns the hot-swappable wire-client handle: `force_reauth` stops
// the current client, builds a fresh one from the live settings, and swaps it
// under the lock. Auxiliary tasks re-acquire the handle and keep running.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BalanceMode, Settings};
use crate::control::{ControlActions, ControlChannel};
use crate::discovery::{discover_pairs, pick_reference_pair, symbols_for};
use crate::executor::{run_two_leg, Direction, ExecParams, LegPlan, ResidualCheck};
use crate::reconcile::Reconciler;
use crate::reference::RateEstimator;
use crate::signals::{
    implied_ars_to_usd, implied_usd_to_ars, nominal_cap, operable_ars_a2u, operable_ars_u2a,
    signal_ars_to_usd, signal_usd_to_ars,
};
use crate::status::{StatusPublisher, StatusSnapshot, TradeRow};
use crate::types::{Cash, Pair, Side, Tif, TopOfBook};
use crate::wire::{OrderGateway, RestClient, WireClient};

/// How often auxiliary consumers re-check the client handle for a swap.
const HANDLE_RECHECK: Duration = Duration::from_secs(1);

/// A fully sized trade the coordinator can execute.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub pair: Pair,
    pub direction: Direction,
    pub implied: f64,
    pub reference: f64,
    pub plan: LegPlan,
}

pub struct Engine {
    pub settings: Arc<RwLock<Settings>>,
    pub client: Arc<RwLock<Arc<WireClient>>>,
    pub estimator: Arc<Mutex<RateEstimator>>,
    pub reconciler: Arc<Reconciler>,
    pub pairs: Arc<RwLock<Vec<Pair>>>,
    pub publisher: StatusPublisher,
    pub cancel: CancellationToken,
}

impl Engine {
    pub async fn run(self, mut control: ControlChannel) -> Result<()> {
        let mut trading_enabled = true;
        let mut account_cash = Cash::default();
        let mut last_account_poll: Option<Instant> = None;
        let mut last_refresh_ts = 0.0_f64;
        let mut rest = self.rest_client();

        info!("trading loop started");

        while !self.cancel.is_cancelled() {
            // ── 1. Control document ─────────────────────────────────────
            let actions = control.poll(&self.settings);
            self.apply_actions(&actions, &mut trading_enabled, &mut rest).await;

            let settings = self.settings.read().clone();
            let gateway = self.client.read().clone();

            // ── 2. Quotes and cash ──────────────────────────────────────
            let snapshot = gateway.snapshot();

            let (cash, source) = match settings.balance_mode {
                BalanceMode::RiskPoll => {
                    let due = last_account_poll
                        .map_or(true, |t| t.elapsed().as_secs_f64() >= settings.risk_poll_s);
                    if due && !gateway.token().is_empty() {
                        match rest
                            .account_report(&gateway.token(), &settings.account())
                            .await
                        {
                            Ok((ars, usd)) => {
                                account_cash = Cash { ars, usd };
                                last_account_poll = Some(Instant::now());
                                last_refresh_ts = unix_now();
                            }
                            Err(e) => warn!(error = %e, "account poll failed"),
                        }
                    }
                    (account_cash, "risk_poll")
                }
                BalanceMode::ErReconcile => {
                    last_refresh_ts = unix_now();
                    (self.reconciler.cash(), "er_reconcile")
                }
            };

            // ── 3–4. Reference update and selection ─────────────────────
            {
                let mut estimator = self.estimator.lock();
                if (estimator.half_life() - settings.half_life_s).abs() > f64::EPSILON {
                    estimator.set_half_life(settings.half_life_s);
                }
            }
            let reference_pair = pick_reference_pair(&self.pairs.read());
            if let Some(rp) = &reference_pair {
                if let (Some(ars), Some(usd)) =
                    (snapshot.get(&rp.ars_symbol), snapshot.get(&rp.usd_symbol))
                {
                    self.estimator
                        .lock()
                        .update(unix_now(), ars.ask, usd.bid, ars.bid, usd.ask);
                }
            }
            let (ref_a2u, ref_u2a) = {
                let estimator = self.estimator.lock();
                (
                    estimator.ref_ars_to_usd(settings.ref_mode),
                    estimator.ref_usd_to_ars(settings.ref_mode),
                )
            };

            // ── 5. ARS→USD: every qualifying pair, in order ─────────────
            let pairs = self.pairs.read().clone();
            if trading_enabled && ref_a2u.is_some() {
                for pair in &pairs {
                    let (Some(ars), Some(usd)) = (
                        snapshot.get(&pair.ars_symbol),
                        snapshot.get(&pair.usd_symbol),
                    ) else {
                        continue;
                    };
                    if let Some(intent) = plan_ars_to_usd(
                        pair,
                        ars,
                        usd,
                        ref_a2u,
                        cash.ars,
                        settings.min_notional_ars,
                        settings.thresh_pct,
                    ) {
                        self.execute(&gateway, &intent, &settings).await;
                    }
                }
            }

            // ── 6. USD→ARS: single best candidate ───────────────────────
            if trading_enabled && cash.usd > 0.0 {
                if let Some(intent) = plan_usd_to_ars(
                    &pairs,
                    &snapshot,
                    ref_u2a,
                    cash.usd,
                    settings.min_notional_ars,
                    settings.thresh_pct,
                ) {
                    self.execute(&gateway, &intent, &settings).await;
                }
            }

            // ── 7. Publish ──────────────────────────────────────────────
            let ts = unix_now();
            let positions = self.reconciler.snapshot_positions();
            let publish = StatusSnapshot {
                ts,
                env: settings.env.clone(),
                mode: settings.balance_mode.as_str().to_string(),
                source: source.to_string(),
                last_refresh: last_refresh_ts,
                cash_ars: cash.ars,
                cash_usd: cash.usd,
                trading_enabled,
                ref_ars_to_usd: ref_a2u,
                ref_usd_to_ars: ref_u2a,
                ref_mode: settings.ref_mode.as_str().to_string(),
                half_life_s: settings.half_life_s,
                thresh_pct: settings.thresh_pct,
                min_notional_ars: settings.min_notional_ars,
                reference_pair: reference_pair.map(|p| p.to_string()),
            };
            if let Err(e) = self
                .publisher
                .write_status(&publish)
                .and_then(|_| self.publisher.write_books(ts, &snapshot))
                .and_then(|_| self.publisher.write_positions(ts, &positions, cash))
            {
                warn!(error = %e, "status publication failed");
            }

            // ── 8. Sleep ────────────────────────────────────────────────
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs_f64(settings.poll_s.max(0.01))) => {}
            }
        }

        info!("trading loop stopped");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // One-shot actions
    // -------------------------------------------------------------------------

    async fn apply_actions(
        &self,
        actions: &ControlActions,
        trading_enabled: &mut bool,
        rest: &mut RestClient,
    ) {
        if actions.panic_stop {
            *trading_enabled = false;
            warn!("panic stop — trading disabled");
        }
        if actions.resume {
            *trading_enabled = true;
            info!("trading resumed");
        }
        if actions.force_reauth {
            self.swap_wire_client(rest).await;
        }
        if actions.reload_instruments {
            self.reload_instruments(rest).await;
        }
        if actions.force_flatten {
            self.flatten_positions().await;
        }
    }

    /// Stop the current wire client and bring up a fresh one from the live
    /// settings (picking up any credential or endpoint overrides).
    async fn swap_wire_client(&self, rest: &mut RestClient) {
        let old = self.client.read().clone();
        old.stop().await;

        let symbols = symbols_for(&self.pairs.read());
        let fresh = Arc::new(WireClient::new(self.settings.clone(), symbols));
        let runner = fresh.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!(error = %e, "replacement wire client terminated");
            }
        });

        *self.client.write() = fresh;
        *rest = self.rest_client();
        info!("wire client replaced on operator request");
    }

    async fn reload_instruments(&self, rest: &RestClient) {
        match discover_pairs(rest).await {
            Ok(new_pairs) if !new_pairs.is_empty() => {
                let symbols = symbols_for(&new_pairs);
                *self.pairs.write() = new_pairs;
                let gateway = self.client.read().clone();
                if let Err(e) = gateway.update_symbols(symbols).await {
                    warn!(error = %e, "resubscription after instrument reload failed");
                }
            }
            Ok(_) => warn!("instrument reload produced no pairs — keeping the current set"),
            Err(e) => warn!(error = %e, "instrument reload failed"),
        }
    }

    /// Send an opposite-side market IOC for every open position.
    async fn flatten_positions(&self) {
        let gateway = self.client.read().clone();
        let positions = self.reconciler.snapshot_positions();
        info!(count = positions.len(), "flattening open positions");

        for (symbol, qty) in positions {
            if qty == 0 {
                continue;
            }
            let side = if qty > 0 { Side::Sell } else { Side::Buy };
            if let Err(e) = gateway
                .send_market(&symbol, side, qty.abs(), Tif::Ioc)
                .await
            {
                warn!(symbol = %symbol, error = %e, "flatten order failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    async fn execute(&self, gateway: &Arc<WireClient>, intent: &TradeIntent, settings: &Settings) {
        if settings.trace_enabled {
            info!(
                pair = %intent.pair,
                direction = %intent.direction,
                implied = intent.implied,
                reference = intent.reference,
                nominal = intent.plan.buy_qty_cap,
                "signal fired"
            );
        }

        let params = ExecParams {
            wait_ms: settings.wait_ms,
            grace_ms: settings.grace_ms,
            edge_tol_bps: settings.edge_tol_bps,
            thresh_pct: settings.thresh_pct,
            unwind_mode: settings.unwind_mode,
        };

        let check_gateway = gateway.clone();
        let check_pair = intent.pair.clone();
        let direction = intent.direction;
        let reference = intent.reference;
        let residual =
            move || residual_check_for(&check_gateway.snapshot(), &check_pair, direction, reference);

        match run_two_leg(gateway.as_ref(), &intent.plan, &params, residual).await {
            Ok(outcome) => {
                info!(
                    pair = %intent.pair,
                    direction = %intent.direction,
                    bought = outcome.bought,
                    sold = outcome.sold,
                    unwound = outcome.unwound,
                    "two-leg sequence finished"
                );
            }
            Err(e) => warn!(pair = %intent.pair, error = %e, "two-leg sequence failed"),
        }

        let row = TradeRow {
            ts: Utc::now().to_rfc3339(),
            pair: intent.pair.to_string(),
            direction: intent.direction.to_string(),
            implied: intent.implied,
            reference: intent.reference,
            nominal: intent.plan.buy_qty_cap,
            price_ars: match intent.direction {
                Direction::ArsToUsd => intent.plan.buy_price.unwrap_or(0.0),
                Direction::UsdToArs => intent.plan.sell_price.unwrap_or(0.0),
            },
            price_usd: match intent.direction {
                Direction::ArsToUsd => intent.plan.sell_price,
                Direction::UsdToArs => None,
            },
        };
        if let Err(e) = self.publisher.append_trade(&row) {
            debug!(error = %e, "trade log append failed");
        }
    }

    fn rest_client(&self) -> RestClient {
        let settings = self.settings.read();
        let (rest_base, _) = settings.urls();
        RestClient::new(rest_base, settings.rest_timeout_s)
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Pure planning helpers
// ---------------------------------------------------------------------------

/// Size an ARS→USD conversion for one pair, or `None` when the signal does
/// not fire or the book/cash cannot support the minimum notional.
pub fn plan_ars_to_usd(
    pair: &Pair,
    ars: &TopOfBook,
    usd: &TopOfBook,
    reference: Option<f64>,
    cash_ars: f64,
    min_notional: f64,
    thresh: f64,
) -> Option<TradeIntent> {
    let reference = reference?;
    let implied = implied_ars_to_usd(ars, usd)?;
    let operable = operable_ars_a2u(ars, usd, Some(implied));
    if !signal_ars_to_usd(implied, Some(reference), operable, min_notional, thresh) {
        return None;
    }

    let nominal = nominal_cap(usd.bid_qty, ars.ask_qty, cash_ars, ars.ask);
    if nominal <= 0 || (nominal as f64) * ars.ask < min_notional {
        return None;
    }

    Some(TradeIntent {
        pair: pair.clone(),
        direction: Direction::ArsToUsd,
        implied,
        reference,
        plan: LegPlan {
            buy_symbol: pair.ars_symbol.clone(),
            buy_price: Some(ars.ask),
            buy_qty_cap: nominal,
            sell_symbol: pair.usd_symbol.clone(),
            sell_price: Some(usd.bid),
        },
    })
}

/// Pick the best USD→ARS candidate across all pairs (maximum implied rate)
/// and size it, or `None` when nothing qualifies.
pub fn plan_usd_to_ars(
    pairs: &[Pair],
    snapshot: &HashMap<String, TopOfBook>,
    reference: Option<f64>,
    cash_usd: f64,
    min_notional: f64,
    thresh: f64,
) -> Option<TradeIntent> {
    let reference = reference?;
    let mut best: Option<(f64, &Pair)> = None;
    for pair in pairs {
        let (Some(ars), Some(usd)) = (
            snapshot.get(&pair.ars_symbol),
            snapshot.get(&pair.usd_symbol),
        ) else {
            continue;
        };
        let Some(implied_rev) = implied_usd_to_ars(ars, usd) else {
            continue;
        };
        let operable = operable_ars_u2a(ars, usd, Some(implied_rev));
        if signal_usd_to_ars(implied_rev, Some(reference), operable, min_notional, thresh)
            && best.map_or(true, |(current, _)| implied_rev > current)
        {
            best = Some((implied_rev, pair));
        }
    }

    let (implied_rev, pair) = best?;
    let ars = snapshot.get(&pair.ars_symbol)?;
    let usd = snapshot.get(&pair.usd_symbol)?;

    let nominal = nominal_cap(ars.bid_qty, usd.ask_qty, cash_usd, usd.ask);
    if nominal <= 0 || (nominal as f64) * ars.bid < min_notional {
        return None;
    }

    Some(TradeIntent {
        pair: pair.clone(),
        direction: Direction::UsdToArs,
        implied: implied_rev,
        reference,
        plan: LegPlan {
            buy_symbol: pair.usd_symbol.clone(),
            buy_price: None, // market IOC on the USD leg
            buy_qty_cap: nominal,
            sell_symbol: pair.ars_symbol.clone(),
            sell_price: Some(ars.bid),
        },
    })
}

/// Fresh market context for the coordinator's smart unwind, from a new
/// quote snapshot.
pub fn residual_check_for(
    snapshot: &HashMap<String, TopOfBook>,
    pair: &Pair,
    direction: Direction,
    reference: f64,
) -> ResidualCheck {
    let ars = snapshot.get(&pair.ars_symbol);
    let usd = snapshot.get(&pair.usd_symbol);

    match direction {
        Direction::ArsToUsd => ResidualCheck {
            direction,
            reference: Some(reference),
            implied_now: ars.zip(usd).and_then(|(a, u)| implied_ars_to_usd(a, u)),
            book_ok: usd.is_some_and(|u| u.bid_qty > 0.0),
            residual_price: usd.map(|u| u.bid),
        },
        Direction::UsdToArs => ResidualCheck {
            direction,
            reference: Some(reference),
            implied_now: ars.zip(usd).and_then(|(a, u)| implied_usd_to_ars(a, u)),
            book_ok: ars.is_some_and(|a| a.bid_qty > 0.0),
            residual_price: ars.map(|a| a.bid),
        },
    }
}

// ---------------------------------------------------------------------------
// Auxiliary long-running tasks
// ---------------------------------------------------------------------------

/// Apply every execution report to the reconciler. Survives wire-client swaps
/// by re-acquiring the handle; a lagged bus is tolerated because the periodic
/// account refresh reseeds cash.
pub async fn run_fill_consumer(
    client: Arc<RwLock<Arc<WireClient>>>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let gateway = client.read().clone();
        let mut reports = gateway.subscribe_reports();
        let mut recheck = tokio::time::interval(HANDLE_RECHECK);
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = recheck.tick() => {
                    if !Arc::ptr_eq(&gateway, &*client.read()) {
                        break; // client was swapped; resubscribe on the new one
                    }
                }
                report = reports.recv() => match report {
                    Ok(er) => reconciler.apply_fill(&er),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fill consumer lagged — awaiting account reseed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

/// Periodic REST reseed of the reconciler's cash in `er_reconcile` mode.
pub async fn run_account_refresh(
    settings: Arc<RwLock<Settings>>,
    client: Arc<RwLock<Arc<WireClient>>>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) {
    loop {
        let interval = settings.read().risk_refresh_s.max(1.0);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {}
        }
        if settings.read().balance_mode != BalanceMode::ErReconcile {
            continue;
        }

        let gateway = client.read().clone();
        let token = gateway.token();
        if token.is_empty() {
            continue;
        }
        let (rest_base, account, timeout_s) = {
            let s = settings.read();
            (s.urls().0, s.account(), s.rest_timeout_s)
        };
        let rest = RestClient::new(rest_base, timeout_s);
        match rest.account_report(&token, &account).await {
            Ok((ars, usd)) => {
                reconciler.full_refresh(ars, usd);
                debug!(ars, usd, "reconciler cash reseeded from account report");
            }
            Err(e) => warn!(error = %e, "account refresh failed"),
        }
    }
}

/// Periodic instrument re-discovery and resubscription.
pub async fn run_instrument_refresh(
    settings: Arc<RwLock<Settings>>,
    client: Arc<RwLock<Arc<WireClient>>>,
    pairs: Arc<RwLock<Vec<Pair>>>,
    cancel: CancellationToken,
) {
    loop {
        let interval = settings.read().instrument_refresh_s.max(1.0);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {}
        }

        let (rest_base, timeout_s) = {
            let s = settings.read();
            (s.urls().0, s.rest_timeout_s)
        };
        let rest = RestClient::new(rest_base, timeout_s);
        match discover_pairs(&rest).await {
            Ok(new_pairs) if !new_pairs.is_empty() => {
                let symbols = symbols_for(&new_pairs);
                *pairs.write() = new_pairs;
                let gateway = client.read().clone();
                if let Err(e) = gateway.update_symbols(symbols).await {
                    warn!(error = %e, "periodic resubscription failed");
                }
            }
            Ok(_) => debug!("periodic discovery returned no pairs"),
            Err(e) => debug!(error = %e, "periodic discovery failed"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn book(bid: f64, ask: f64, bid_qty: f64, ask_qty: f64) -> TopOfBook {
        TopOfBook {
            ts: Utc::now(),
            bid,
            ask,
            bid_qty,
            ask_qty,
        }
    }

    fn al30_pair() -> Pair {
        Pair::new("AL30", "AL30D")
    }

    #[test]
    fn a2u_plan_sizes_the_worked_example() {
        // AL30 1000/1010 100x50, AL30D 1.00/1.01 200x100, ref 1020,
        // thresh 0.2%, min notional 40 000, cash 1 000 000 ARS.
        let ars = book(1000.0, 1010.0, 100.0, 50.0);
        let usd = book(1.00, 1.01, 200.0, 100.0);

        let intent = plan_ars_to_usd(
            &al30_pair(),
            &ars,
            &usd,
            Some(1020.0),
            1_000_000.0,
            40_000.0,
            0.002,
        )
        .expect("signal fires in the worked example");

        assert_eq!(intent.direction, Direction::ArsToUsd);
        assert!((intent.implied - 1010.0).abs() < 1e-9);
        assert_eq!(intent.plan.buy_symbol, "AL30");
        assert_eq!(intent.plan.buy_price, Some(1010.0));
        assert_eq!(intent.plan.buy_qty_cap, 50);
        assert_eq!(intent.plan.sell_symbol, "AL30D");
        assert_eq!(intent.plan.sell_price, Some(1.00));
    }

    #[test]
    fn a2u_plan_respects_the_second_notional_gate() {
        // Signal passes on operable volume but the nominal is cash-capped so
        // low that nominal × price < min notional.
        let ars = book(1000.0, 1010.0, 100.0, 50.0);
        let usd = book(1.00, 1.01, 200.0, 100.0);

        let intent = plan_ars_to_usd(
            &al30_pair(),
            &ars,
            &usd,
            Some(1020.0),
            30_000.0, // only ~29 units affordable → 29 × 1010 < 40 000
            40_000.0,
            0.002,
        );
        assert!(intent.is_none());
    }

    #[test]
    fn a2u_plan_needs_a_reference() {
        let ars = book(1000.0, 1010.0, 100.0, 50.0);
        let usd = book(1.00, 1.01, 200.0, 100.0);
        assert!(
            plan_ars_to_usd(&al30_pair(), &ars, &usd, None, 1_000_000.0, 40_000.0, 0.002)
                .is_none()
        );
    }

    #[test]
    fn u2a_plan_picks_the_richest_implied_rate() {
        let pairs = vec![al30_pair(), Pair::new("GD30", "GD30D")];
        let mut snapshot = HashMap::new();
        // AL30 implied_rev = 1030 / 1.0 = 1030.
        snapshot.insert("AL30".to_string(), book(1030.0, 1040.0, 500.0, 500.0));
        snapshot.insert("AL30D".to_string(), book(0.99, 1.00, 500.0, 500.0));
        // GD30 implied_rev = 1050 / 1.0 = 1050 — richer, must win.
        snapshot.insert("GD30".to_string(), book(1050.0, 1060.0, 500.0, 500.0));
        snapshot.insert("GD30D".to_string(), book(0.99, 1.00, 500.0, 500.0));

        let intent = plan_usd_to_ars(
            &pairs,
            &snapshot,
            Some(1000.0),
            10_000.0,
            40_000.0,
            0.002,
        )
        .expect("both pairs qualify");

        assert_eq!(intent.pair.ars_symbol, "GD30");
        assert_eq!(intent.direction, Direction::UsdToArs);
        assert!((intent.implied - 1050.0).abs() < 1e-9);
        // Entry leg is a market IOC buy of the USD listing.
        assert_eq!(intent.plan.buy_symbol, "GD30D");
        assert_eq!(intent.plan.buy_price, None);
        assert_eq!(intent.plan.sell_symbol, "GD30");
        assert_eq!(intent.plan.sell_price, Some(1050.0));
    }

    #[test]
    fn u2a_plan_sizes_by_depth_and_usd_cash() {
        let pairs = vec![al30_pair()];
        let mut snapshot = HashMap::new();
        snapshot.insert("AL30".to_string(), book(1030.0, 1040.0, 80.0, 500.0));
        snapshot.insert("AL30D".to_string(), book(0.99, 1.00, 500.0, 120.0));

        let intent = plan_usd_to_ars(
            &pairs,
            &snapshot,
            Some(1000.0),
            100.0, // only 100 USD: cash cap 100 / 1.00 = 100
            40_000.0,
            0.002,
        )
        .expect("qualifies");

        // depth cap = min(80, 120) = 80; cash cap = 100 → nominal 80.
        assert_eq!(intent.plan.buy_qty_cap, 80);
    }

    #[test]
    fn u2a_plan_none_without_usd_quotes() {
        let pairs = vec![al30_pair()];
        let snapshot = HashMap::new();
        assert!(plan_usd_to_ars(&pairs, &snapshot, Some(1000.0), 100.0, 0.0, 0.002).is_none());
    }

    #[test]
    fn residual_check_reads_the_exit_leg() {
        let mut snapshot = HashMap::new();
        snapshot.insert("AL30".to_string(), book(1000.0, 1010.0, 100.0, 50.0));
        snapshot.insert("AL30D".to_string(), book(1.00, 1.01, 200.0, 100.0));

        let check = residual_check_for(&snapshot, &al30_pair(), Direction::ArsToUsd, 1020.0);
        assert_eq!(check.reference, Some(1020.0));
        assert!((check.implied_now.unwrap() - 1010.0).abs() < 1e-9);
        assert!(check.book_ok);
        assert_eq!(check.residual_price, Some(1.00));

        let check = residual_check_for(&snapshot, &al30_pair(), Direction::UsdToArs, 1000.0);
        assert!((check.implied_now.unwrap() - (1000.0 / 1.01)).abs() < 1e-9);
        assert_eq!(check.residual_price, Some(1000.0));
    }

    #[test]
    fn residual_check_with_missing_books_is_not_ok() {
        let snapshot = HashMap::new();
        let check = residual_check_for(&snapshot, &al30_pair(), Direction::ArsToUsd, 1020.0);
        assert!(!check.book_ok);
        assert!(check.implied_now.is_none());
        assert!(check.residual_price.is_none());
    }
}
