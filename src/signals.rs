// =============================================================================
// Signal Rules — dislocation detection between the two listings
// =============================================================================
//
// The implied FX rate of a pair is compared against the smoothed reference.
// A trade only fires when the gap exceeds the configured threshold AND the
// top-of-book depth supports at least `min_notional_ars` on both legs.
// =============================================================================

use crate::types::TopOfBook;

/// Implied rate for buying USD via the ARS leg: ask(ARS) / bid(USD).
pub fn implied_ars_to_usd(ars: &TopOfBook, usd: &TopOfBook) -> Option<f64> {
    if ars.ask > 0.0 && usd.bid > 0.0 {
        Some(ars.ask / usd.bid)
    } else {
        None
    }
}

/// Implied rate for the reverse route: bid(ARS) / ask(USD).
pub fn implied_usd_to_ars(ars: &TopOfBook, usd: &TopOfBook) -> Option<f64> {
    if ars.bid > 0.0 && usd.ask > 0.0 {
        Some(ars.bid / usd.ask)
    } else {
        None
    }
}

/// ARS-valued volume achievable on both legs at top-of-book, ARS→USD route.
pub fn operable_ars_a2u(ars: &TopOfBook, usd: &TopOfBook, implied: Option<f64>) -> f64 {
    match implied {
        Some(implied) => (ars.ask_qty * ars.ask).min(usd.bid_qty * usd.bid * implied),
        None => 0.0,
    }
}

/// ARS-valued volume achievable on both legs at top-of-book, USD→ARS route.
pub fn operable_ars_u2a(ars: &TopOfBook, usd: &TopOfBook, implied_rev: Option<f64>) -> f64 {
    match implied_rev {
        Some(implied_rev) => (ars.bid_qty * ars.bid).min(usd.ask_qty * usd.ask * implied_rev),
        None => 0.0,
    }
}

/// ARS→USD fires when the implied rate is at least `thresh` below reference.
pub fn signal_ars_to_usd(
    implied: f64,
    reference: Option<f64>,
    operable_ars: f64,
    min_notional: f64,
    thresh: f64,
) -> bool {
    let Some(reference) = reference else {
        return false;
    };
    if operable_ars < min_notional {
        return false;
    }
    implied <= reference * (1.0 - thresh)
}

/// USD→ARS fires when the implied rate is at least `thresh` above reference.
pub fn signal_usd_to_ars(
    implied_rev: f64,
    reference: Option<f64>,
    operable_ars: f64,
    min_notional: f64,
    thresh: f64,
) -> bool {
    let Some(reference) = reference else {
        return false;
    };
    if operable_ars < min_notional {
        return false;
    }
    implied_rev >= reference * (1.0 + thresh)
}

/// Integer nominal cap: lesser of book depth and what cash can pay at `price`.
///
/// `depth` is the smaller displayed size of the two legs; `cash / price` is
/// floored so the order never exceeds the available balance.
pub fn nominal_cap(depth_a: f64, depth_b: f64, cash: f64, price: f64) -> i64 {
    if price <= 0.0 {
        return 0;
    }
    let cap_by_depth = depth_a.min(depth_b).floor() as i64;
    let cap_by_cash = ((cash / price).floor() as i64).max(0);
    cap_by_depth.min(cap_by_cash).max(0)
}
