// =============================================================================
// Execution Coordinator — two-leg buy-then-sell with smart unwind
// =============================================================================
//
// One conversion is a pair of orders: buy the entry leg (IOC), wait a short
// window for fills, sell exactly what was bought on the exit leg, then deal
// with any residual. The coordinator subscribes to the execution-report bus
// *before* submitting the buy, so no fill can slip between send and listen.
//
// Phases:
//   BUY   — limit IOC when a price is given, market IOC otherwise
//   WAIT  — accumulate buy-leg fills for `wait_ms`
//   SELL  — limit DAY when a price is given, market IOC otherwise
//   GRACE — accumulate sell-leg fills for `grace_ms`, early exit once flat
//   UNWIND — none | always | smart (re-check the edge before flattening)
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::UnwindMode;
use crate::types::{Side, Tif};
use crate::wire::OrderGateway;

/// Trade direction of the whole two-leg sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ArsToUsd,
    UsdToArs,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArsToUsd => write!(f, "ARS->USD"),
            Self::UsdToArs => write!(f, "USD->ARS"),
        }
    }
}

/// What to buy and what to sell. `None` prices mean market IOC.
#[derive(Debug, Clone)]
pub struct LegPlan {
    pub buy_symbol: String,
    pub buy_price: Option<f64>,
    pub buy_qty_cap: i64,
    pub sell_symbol: String,
    pub sell_price: Option<f64>,
}

/// Tunables snapshot for one coordinator call.
#[derive(Debug, Clone, Copy)]
pub struct ExecParams {
    pub wait_ms: u64,
    pub grace_ms: u64,
    pub edge_tol_bps: f64,
    pub thresh_pct: f64,
    pub unwind_mode: UnwindMode,
}

/// Fresh market context for the smart-unwind decision.
#[derive(Debug, Clone)]
pub struct ResidualCheck {
    pub direction: Direction,
    pub reference: Option<f64>,
    pub implied_now: Option<f64>,
    /// Whether the exit leg still shows size to sell into.
    pub book_ok: bool,
    /// Price for the residual sell retry; `None` retries at market.
    pub residual_price: Option<f64>,
}

/// Outcome of one two-leg sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegOutcome {
    pub bought: i64,
    pub sold: i64,
    pub unwound: bool,
}

/// Edge re-check for the smart unwind.
///
/// Returns `(still_edge, break_even)`: whether the original dislocation still
/// holds beyond the tolerance, and whether at least the tolerance margin
/// itself survives.
pub fn edge_ok(
    implied_now: Option<f64>,
    reference: Option<f64>,
    direction: Direction,
    thresh_pct: f64,
    tol_bps: f64,
) -> (bool, bool) {
    let (Some(implied), Some(reference)) = (implied_now, reference) else {
        return (false, false);
    };
    let tol = tol_bps / 10_000.0;
    match direction {
        Direction::ArsToUsd => (
            implied <= reference * (1.0 - thresh_pct - tol),
            implied <= reference * (1.0 - tol),
        ),
        Direction::UsdToArs => (
            implied >= reference * (1.0 + thresh_pct + tol),
            implied >= reference * (1.0 + tol),
        ),
    }
}

/// Run one buy-then-sell sequence. The trading loop guarantees at most one
/// coordinator call is in flight per tick; pairs are processed sequentially.
pub async fn run_two_leg<G, F>(
    gateway: &G,
    plan: &LegPlan,
    params: &ExecParams,
    residual_check: F,
) -> Result<LegOutcome>
where
    G: OrderGateway,
    F: FnOnce() -> ResidualCheck,
{
    // Subscribe before the buy goes out.
    let mut reports = gateway.subscribe_reports();

    match plan.buy_price {
        Some(price) => {
            gateway
                .send_limit(&plan.buy_symbol, Side::Buy, plan.buy_qty_cap, price, Tif::Ioc)
                .await?
        }
        None => {
            gateway
                .send_market(&plan.buy_symbol, Side::Buy, plan.buy_qty_cap, Tif::Ioc)
                .await?
        }
    };

    // WAIT: accumulate entry fills.
    let mut bought: i64 = 0;
    let wait_deadline = Instant::now() + Duration::from_millis(params.wait_ms);
    drain_fills(
        &mut reports,
        wait_deadline,
        &plan.buy_symbol,
        Side::Buy,
        &mut bought,
        None,
    )
    .await;

    if bought <= 0 {
        debug!(symbol = %plan.buy_symbol, "entry leg did not fill");
        return Ok(LegOutcome {
            bought: 0,
            sold: 0,
            unwound: false,
        });
    }

    match plan.sell_price {
        Some(price) => {
            gateway
                .send_limit(&plan.sell_symbol, Side::Sell, bought, price, Tif::Day)
                .await?
        }
        None => {
            gateway
                .send_market(&plan.sell_symbol, Side::Sell, bought, Tif::Ioc)
                .await?
        }
    };

    // GRACE: accumulate exit fills, stop as soon as the position is flat.
    let mut sold: i64 = 0;
    let grace_deadline = Instant::now() + Duration::from_millis(params.grace_ms);
    drain_fills(
        &mut reports,
        grace_deadline,
        &plan.sell_symbol,
        Side::Sell,
        &mut sold,
        Some(bought),
    )
    .await;

    let remainder = bought - sold;
    if remainder <= 0 || params.unwind_mode == UnwindMode::None {
        return Ok(LegOutcome {
            bought,
            sold,
            unwound: false,
        });
    }

    if params.unwind_mode == UnwindMode::Always {
        gateway
            .send_market(&plan.buy_symbol, Side::Sell, remainder, Tif::Ioc)
            .await?;
        info!(symbol = %plan.buy_symbol, remainder, "residual flattened on the entry leg");
        return Ok(LegOutcome {
            bought,
            sold,
            unwound: true,
        });
    }

    // Smart unwind: only keep chasing the exit leg while the edge still pays.
    let check = residual_check();
    let (still_edge, break_even) = edge_ok(
        check.implied_now,
        check.reference,
        check.direction,
        params.thresh_pct,
        params.edge_tol_bps,
    );

    if check.book_ok && (still_edge || break_even) {
        match check.residual_price {
            Some(price) => {
                gateway
                    .send_limit(&plan.sell_symbol, Side::Sell, remainder, price, Tif::Ioc)
                    .await?
            }
            None => {
                gateway
                    .send_market(&plan.sell_symbol, Side::Sell, remainder, Tif::Ioc)
                    .await?
            }
        };
        debug!(symbol = %plan.sell_symbol, remainder, still_edge, break_even, "residual sell retried");
        return Ok(LegOutcome {
            bought,
            sold,
            unwound: false,
        });
    }

    gateway
        .send_market(&plan.buy_symbol, Side::Sell, remainder, Tif::Ioc)
        .await?;
    info!(symbol = %plan.buy_symbol, remainder, "edge gone — residual flattened on the entry leg");
    Ok(LegOutcome {
        bought,
        sold,
        unwound: true,
    })
}

/// Consume reports until `deadline`, adding fill quantities that match
/// `(symbol, side)`. With `target` set, exits early once the total reaches it.
/// Reports for other orders are ignored here; every other consumer has its own
/// bus subscription.
async fn drain_fills(
    reports: &mut tokio::sync::broadcast::Receiver<crate::types::ExecReport>,
    deadline: Instant,
    symbol: &str,
    side: Side,
    total: &mut i64,
    target: Option<i64>,
) {
    while Instant::now() < deadline {
        if let Some(target) = target {
            if *total >= target {
                return;
            }
        }
        let slice = deadline
            .saturating_duration_since(Instant::now())
            .min(Duration::from_millis(50));
        match tokio::time::timeout(slice, reports.recv()).await {
            Ok(Ok(er)) => {
                if er.symbol == symbol && er.side == Some(side) && er.status.is_fill() {
                    *total += er.qty.floor() as i64;
                }
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "coordinator lagged on the report bus");
            }
            Ok(Err(RecvError::Closed)) => return,
            Err(_elapsed) => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecReport, OrderStatus};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::broadcast;

    #[derive(Debug, Clone, PartialEq)]
    struct SentOrder {
        symbol: String,
        side: Side,
        qty: i64,
        price: Option<f64>,
        tif: Tif,
    }

    /// Scripted gateway: each submitted order pops a batch of reports and
    /// broadcasts them, simulating the venue's response.
    struct MockGateway {
        tx: broadcast::Sender<ExecReport>,
        sent: Mutex<Vec<SentOrder>>,
        responses: Mutex<VecDeque<Vec<ExecReport>>>,
    }

    impl MockGateway {
        fn new(responses: Vec<Vec<ExecReport>>) -> Self {
            let (tx, _) = broadcast::channel(64);
            Self {
                tx,
                sent: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into()),
            }
        }

        fn respond(&self) {
            if let Some(batch) = self.responses.lock().pop_front() {
                for er in batch {
                    let _ = self.tx.send(er);
                }
            }
        }

        fn sent(&self) -> Vec<SentOrder> {
            self.sent.lock().clone()
        }
    }

    impl OrderGateway for MockGateway {
        fn subscribe_reports(&self) -> broadcast::Receiver<ExecReport> {
            self.tx.subscribe()
        }

        async fn send_limit(
            &self,
            symbol: &str,
            side: Side,
            qty: i64,
            price: f64,
            tif: Tif,
        ) -> Result<String> {
            self.sent.lock().push(SentOrder {
                symbol: symbol.to_string(),
                side,
                qty,
                price: Some(price),
                tif,
            });
            self.respond();
            Ok(format!("mock-{}", self.sent.lock().len()))
        }

        async fn send_market(
            &self,
            symbol: &str,
            side: Side,
            qty: i64,
            tif: Tif,
        ) -> Result<String> {
            self.sent.lock().push(SentOrder {
                symbol: symbol.to_string(),
                side,
                qty,
                price: None,
                tif,
            });
            self.respond();
            Ok(format!("mock-{}", self.sent.lock().len()))
        }
    }

    fn fill(symbol: &str, side: Side, qty: f64, status: OrderStatus) -> ExecReport {
        ExecReport {
            ts: Utc::now(),
            symbol: symbol.to_string(),
            side: Some(side),
            price: 1.0,
            qty,
            status,
            order_id: "o".into(),
            client_order_id: "c".into(),
        }
    }

    fn plan() -> LegPlan {
        LegPlan {
            buy_symbol: "AL30".into(),
            buy_price: Some(1010.0),
            buy_qty_cap: 50,
            sell_symbol: "AL30D".into(),
            sell_price: Some(1.00),
        }
    }

    fn params(unwind: UnwindMode) -> ExecParams {
        ExecParams {
            wait_ms: 40,
            grace_ms: 40,
            edge_tol_bps: 1.0,
            thresh_pct: 0.002,
            unwind_mode: unwind,
        }
    }

    fn no_residual_check() -> ResidualCheck {
        ResidualCheck {
            direction: Direction::ArsToUsd,
            reference: None,
            implied_now: None,
            book_ok: false,
            residual_price: None,
        }
    }

    #[tokio::test]
    async fn no_fill_terminates_after_the_buy() {
        let gw = MockGateway::new(vec![vec![]]);
        let out = run_two_leg(&gw, &plan(), &params(UnwindMode::Smart), no_residual_check)
            .await
            .unwrap();

        assert_eq!(
            out,
            LegOutcome {
                bought: 0,
                sold: 0,
                unwound: false
            }
        );
        let sent = gw.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].side, Side::Buy);
        assert_eq!(sent[0].tif, Tif::Ioc);
        assert_eq!(sent[0].price, Some(1010.0));
    }

    #[tokio::test]
    async fn full_round_trip_needs_no_unwind() {
        let gw = MockGateway::new(vec![
            vec![fill("AL30", Side::Buy, 50.0, OrderStatus::Filled)],
            vec![fill("AL30D", Side::Sell, 50.0, OrderStatus::Filled)],
        ]);
        let out = run_two_leg(&gw, &plan(), &params(UnwindMode::Smart), no_residual_check)
            .await
            .unwrap();

        assert_eq!(
            out,
            LegOutcome {
                bought: 50,
                sold: 50,
                unwound: false
            }
        );
        let sent = gw.sent();
        assert_eq!(sent.len(), 2);
        // Exit leg is a limit DAY for exactly what was bought.
        assert_eq!(sent[1].symbol, "AL30D");
        assert_eq!(sent[1].side, Side::Sell);
        assert_eq!(sent[1].qty, 50);
        assert_eq!(sent[1].tif, Tif::Day);
    }

    #[tokio::test]
    async fn partial_buy_sells_only_what_filled() {
        let gw = MockGateway::new(vec![
            vec![
                fill("AL30", Side::Buy, 25.0, OrderStatus::PartiallyFilled),
                fill("AL30", Side::Buy, 15.0, OrderStatus::PartiallyFilled),
                // Reports for other orders must be ignored by the filter.
                fill("GD30", Side::Buy, 99.0, OrderStatus::Filled),
                fill("AL30", Side::Sell, 7.0, OrderStatus::Filled),
            ],
            vec![fill("AL30D", Side::Sell, 40.0, OrderStatus::Filled)],
        ]);
        let out = run_two_leg(&gw, &plan(), &params(UnwindMode::Smart), no_residual_check)
            .await
            .unwrap();

        assert_eq!(out.bought, 40);
        assert_eq!(out.sold, 40);
        assert!(!out.unwound);
        assert_eq!(gw.sent()[1].qty, 40);
    }

    #[tokio::test]
    async fn smart_unwind_flattens_when_the_edge_is_gone() {
        // Buy fills 40 of 50; sell fills 30; edge broken at re-check.
        let gw = MockGateway::new(vec![
            vec![fill("AL30", Side::Buy, 40.0, OrderStatus::PartiallyFilled)],
            vec![fill("AL30D", Side::Sell, 30.0, OrderStatus::PartiallyFilled)],
            vec![],
        ]);
        let out = run_two_leg(&gw, &plan(), &params(UnwindMode::Smart), || ResidualCheck {
            direction: Direction::ArsToUsd,
            reference: Some(1020.0),
            implied_now: Some(1025.0), // moved through the reference: no edge
            book_ok: true,
            residual_price: Some(1.00),
        })
        .await
        .unwrap();

        assert_eq!(
            out,
            LegOutcome {
                bought: 40,
                sold: 30,
                unwound: true
            }
        );
        let sent = gw.sent();
        assert_eq!(sent.len(), 3);
        // Residual 10 flattened with a market IOC on the entry leg.
        assert_eq!(sent[2].symbol, "AL30");
        assert_eq!(sent[2].side, Side::Sell);
        assert_eq!(sent[2].qty, 10);
        assert_eq!(sent[2].price, None);
        assert_eq!(sent[2].tif, Tif::Ioc);
    }

    #[tokio::test]
    async fn smart_unwind_retries_the_exit_leg_while_the_edge_holds() {
        let gw = MockGateway::new(vec![
            vec![fill("AL30", Side::Buy, 40.0, OrderStatus::Filled)],
            vec![fill("AL30D", Side::Sell, 30.0, OrderStatus::PartiallyFilled)],
            vec![],
        ]);
        let out = run_two_leg(&gw, &plan(), &params(UnwindMode::Smart), || ResidualCheck {
            direction: Direction::ArsToUsd,
            reference: Some(1020.0),
            implied_now: Some(1010.0), // still well below the reference
            book_ok: true,
            residual_price: Some(1.005),
        })
        .await
        .unwrap();

        assert_eq!(
            out,
            LegOutcome {
                bought: 40,
                sold: 30,
                unwound: false
            }
        );
        let sent = gw.sent();
        // Retry is a limit IOC on the exit leg at the residual price.
        assert_eq!(sent[2].symbol, "AL30D");
        assert_eq!(sent[2].qty, 10);
        assert_eq!(sent[2].price, Some(1.005));
        assert_eq!(sent[2].tif, Tif::Ioc);
    }

    #[tokio::test]
    async fn unwind_always_flattens_without_checking() {
        let gw = MockGateway::new(vec![
            vec![fill("AL30", Side::Buy, 40.0, OrderStatus::Filled)],
            vec![],
            vec![],
        ]);
        let out = run_two_leg(&gw, &plan(), &params(UnwindMode::Always), no_residual_check)
            .await
            .unwrap();

        assert_eq!(
            out,
            LegOutcome {
                bought: 40,
                sold: 0,
                unwound: true
            }
        );
        let sent = gw.sent();
        assert_eq!(sent[2].symbol, "AL30");
        assert_eq!(sent[2].qty, 40);
    }

    #[tokio::test]
    async fn unwind_none_leaves_the_residual() {
        let gw = MockGateway::new(vec![
            vec![fill("AL30", Side::Buy, 40.0, OrderStatus::Filled)],
            vec![],
        ]);
        let out = run_two_leg(&gw, &plan(), &params(UnwindMode::None), no_residual_check)
            .await
            .unwrap();

        assert_eq!(
            out,
            LegOutcome {
                bought: 40,
                sold: 0,
                unwound: false
            }
        );
        assert_eq!(gw.sent().len(), 2);
    }

    #[tokio::test]
    async fn market_buy_when_no_price_is_given() {
        let mut p = plan();
        p.buy_price = None;
        p.sell_price = None;
        let gw = MockGateway::new(vec![
            vec![fill("AL30", Side::Buy, 10.0, OrderStatus::Filled)],
            vec![fill("AL30D", Side::Sell, 10.0, OrderStatus::Filled)],
        ]);
        let out = run_two_leg(&gw, &p, &params(UnwindMode::Smart), no_residual_check)
            .await
            .unwrap();

        assert_eq!(out.bought, 10);
        let sent = gw.sent();
        assert_eq!(sent[0].price, None);
        assert_eq!(sent[0].tif, Tif::Ioc);
        // Market exit is IOC, not DAY.
        assert_eq!(sent[1].price, None);
        assert_eq!(sent[1].tif, Tif::Ioc);
    }

    // ---- edge_ok ----------------------------------------------------------

    #[test]
    fn edge_ok_ars_to_usd_bands() {
        let reference = Some(1000.0);
        // thresh 0.2% + tol 1 bp: still-edge boundary at 997.9, break-even at 999.9.
        let (still, be) = edge_ok(Some(997.0), reference, Direction::ArsToUsd, 0.002, 1.0);
        assert!(still && be);
        let (still, be) = edge_ok(Some(999.0), reference, Direction::ArsToUsd, 0.002, 1.0);
        assert!(!still && be);
        let (still, be) = edge_ok(Some(1000.5), reference, Direction::ArsToUsd, 0.002, 1.0);
        assert!(!still && !be);
    }

    #[test]
    fn edge_ok_usd_to_ars_bands() {
        let reference = Some(1000.0);
        let (still, be) = edge_ok(Some(1003.0), reference, Direction::UsdToArs, 0.002, 1.0);
        assert!(still && be);
        let (still, be) = edge_ok(Some(1001.0), reference, Direction::UsdToArs, 0.002, 1.0);
        assert!(!still && be);
        let (still, be) = edge_ok(Some(999.0), reference, Direction::UsdToArs, 0.002, 1.0);
        assert!(!still && !be);
    }

    #[test]
    fn edge_ok_requires_both_inputs() {
        assert_eq!(
            edge_ok(None, Some(1000.0), Direction::ArsToUsd, 0.002, 1.0),
            (false, false)
        );
        assert_eq!(
            edge_ok(Some(990.0), None, Direction::ArsToUsd, 0.002, 1.0),
            (false, false)
        );
    }
}
