// =============================================================================
// Reconciler — running cash and per-symbol positions
// =============================================================================
//
// Tracks approximate cash and signed positions by applying execution reports.
// In `er_reconcile` mode this ledger is the source of truth for cash between
// periodic REST reseeds; in `risk_poll` mode it only tracks positions while
// cash comes straight from the account endpoint.
//
// Convention: USD-leg symbols end in "D" and are quoted in units of 1 USD
// nominal, so a USD-leg fill moves USD cash by its quantity. ARS legs move
// ARS cash by quantity × price.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Cash, ExecReport, Side};

pub struct Reconciler {
    cash: RwLock<Cash>,
    positions: RwLock<HashMap<String, i64>>,
}

impl Reconciler {
    pub fn new(initial_ars: f64, initial_usd: f64) -> Self {
        Self {
            cash: RwLock::new(Cash {
                ars: initial_ars,
                usd: initial_usd,
            }),
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Apply one execution report. Only FILLED / PARTIALLY_FILLED reports with
    /// a positive quantity mutate state; everything else is ignored here.
    ///
    /// Deliberately not idempotent: the bus delivers each report exactly once
    /// per consumer, and applying a fill twice must double-count.
    pub fn apply_fill(&self, er: &ExecReport) {
        if !er.status.is_fill() {
            return;
        }
        let qty = er.qty.floor() as i64;
        if qty <= 0 {
            return;
        }
        let Some(side) = er.side else {
            return;
        };

        let symbol = er.symbol.to_ascii_uppercase();
        let signed = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };

        {
            let mut positions = self.positions.write();
            let entry = positions.entry(symbol.clone()).or_insert(0);
            *entry += signed;
            if *entry == 0 {
                positions.remove(&symbol);
            }
        }

        let mut cash = self.cash.write();
        if symbol.ends_with('D') {
            match side {
                Side::Sell => cash.usd += qty as f64,
                Side::Buy => cash.usd -= qty as f64,
            }
        } else {
            let notional_ars = qty as f64 * er.price;
            match side {
                Side::Buy => cash.ars -= notional_ars,
                Side::Sell => cash.ars += notional_ars,
            }
        }

        debug!(
            symbol = %symbol,
            side = %side,
            qty,
            price = er.price,
            "fill applied to ledger"
        );
    }

    /// Reseed cash from an authoritative account snapshot. Positions are left
    /// alone; they are fill-driven in both balance modes.
    pub fn full_refresh(&self, ars: f64, usd: f64) {
        let mut cash = self.cash.write();
        cash.ars = ars;
        cash.usd = usd;
    }

    pub fn cash(&self) -> Cash {
        *self.cash.read()
    }

    /// Consistent copy of all non-zero positions.
    pub fn snapshot_positions(&self) -> HashMap<String, i64> {
        self.positions.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderStatus;
    use chrono::Utc;

    fn fill(symbol: &str, side: Side, qty: f64, price: f64, status: OrderStatus) -> ExecReport {
        ExecReport {
            ts: Utc::now(),
            symbol: symbol.to_string(),
            side: Some(side),
            price,
            qty,
            status,
            order_id: "1".into(),
            client_order_id: "c1".into(),
        }
    }

    #[test]
    fn positions_sum_buys_minus_sells() {
        let rec = Reconciler::new(0.0, 0.0);
        rec.apply_fill(&fill("AL30", Side::Buy, 50.0, 1010.0, OrderStatus::Filled));
        rec.apply_fill(&fill("AL30", Side::Buy, 10.0, 1011.0, OrderStatus::PartiallyFilled));
        rec.apply_fill(&fill("AL30", Side::Sell, 20.0, 1012.0, OrderStatus::Filled));

        assert_eq!(rec.snapshot_positions()["AL30"], 40);
    }

    #[test]
    fn flat_position_is_removed() {
        let rec = Reconciler::new(0.0, 0.0);
        rec.apply_fill(&fill("AL30", Side::Buy, 50.0, 1010.0, OrderStatus::Filled));
        rec.apply_fill(&fill("AL30", Side::Sell, 50.0, 1012.0, OrderStatus::Filled));
        assert!(rec.snapshot_positions().is_empty());
    }

    #[test]
    fn ars_leg_moves_ars_cash_by_notional() {
        let rec = Reconciler::new(1_000_000.0, 0.0);
        rec.apply_fill(&fill("AL30", Side::Buy, 50.0, 1010.0, OrderStatus::Filled));
        assert!((rec.cash().ars - (1_000_000.0 - 50.0 * 1010.0)).abs() < 1e-9);

        rec.apply_fill(&fill("AL30", Side::Sell, 50.0, 1020.0, OrderStatus::Filled));
        assert!((rec.cash().ars - (1_000_000.0 - 50.0 * 1010.0 + 50.0 * 1020.0)).abs() < 1e-9);
    }

    #[test]
    fn usd_leg_moves_usd_cash_by_quantity() {
        let rec = Reconciler::new(0.0, 100.0);
        rec.apply_fill(&fill("AL30D", Side::Sell, 40.0, 1.0, OrderStatus::Filled));
        assert!((rec.cash().usd - 140.0).abs() < 1e-9);

        rec.apply_fill(&fill("AL30D", Side::Buy, 15.0, 1.0, OrderStatus::Filled));
        assert!((rec.cash().usd - 125.0).abs() < 1e-9);
        // ARS cash untouched by the USD leg.
        assert_eq!(rec.cash().ars, 0.0);
    }

    #[test]
    fn non_fill_statuses_do_not_mutate() {
        let rec = Reconciler::new(100.0, 100.0);
        for status in [
            OrderStatus::New,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Other("PENDING".into()),
        ] {
            rec.apply_fill(&fill("AL30", Side::Buy, 10.0, 1000.0, status));
        }
        assert!(rec.snapshot_positions().is_empty());
        assert!((rec.cash().ars - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_quantity_is_ignored() {
        let rec = Reconciler::new(0.0, 0.0);
        rec.apply_fill(&fill("AL30", Side::Buy, 0.0, 1000.0, OrderStatus::Filled));
        assert!(rec.snapshot_positions().is_empty());
    }

    #[test]
    fn applying_the_same_report_twice_double_counts() {
        // The bus guarantees exactly-once per consumer; the ledger must not
        // try to dedupe on its own.
        let rec = Reconciler::new(0.0, 0.0);
        let er = fill("AL30", Side::Buy, 10.0, 1000.0, OrderStatus::Filled);
        rec.apply_fill(&er);
        rec.apply_fill(&er);
        assert_eq!(rec.snapshot_positions()["AL30"], 20);
        assert!((rec.cash().ars + 20_000.0).abs() < 1e-9);
    }

    #[test]
    fn full_refresh_reseeds_cash_only() {
        let rec = Reconciler::new(0.0, 0.0);
        rec.apply_fill(&fill("AL30", Side::Buy, 10.0, 1000.0, OrderStatus::Filled));
        rec.full_refresh(500_000.0, 250.0);

        assert!((rec.cash().ars - 500_000.0).abs() < 1e-9);
        assert!((rec.cash().usd - 250.0).abs() < 1e-9);
        assert_eq!(rec.snapshot_positions()["AL30"], 10);
    }
}
