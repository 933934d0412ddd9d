// =============================================================================
// Instrument Discovery — ARS/USD pair building
// =============================================================================
//
// The venue lists both legs of a dual-listed bond under a trivial naming
// convention: the hard-dollar listing is the ARS symbol with a "D" suffix
// (AL30 / AL30D). Discovery fetches the full instrument list and keeps every
// symbol whose sibling is also listed.
// =============================================================================

use anyhow::Result;
use tracing::info;

use crate::types::Pair;
use crate::wire::rest::{Instrument, RestClient};

/// Fetch the instrument list and build the tradable pair set.
pub async fn discover_pairs(rest: &RestClient) -> Result<Vec<Pair>> {
    let instruments = rest.fetch_instruments().await?;
    let pairs = build_pairs(&instruments);
    info!(
        instruments = instruments.len(),
        pairs = pairs.len(),
        "instrument discovery completed"
    );
    Ok(pairs)
}

/// Pure pair construction from an instrument list: a pair exists when both
/// `X` and `XD` are listed. Result is sorted and de-duplicated.
pub fn build_pairs(instruments: &[Instrument]) -> Vec<Pair> {
    let symbols: std::collections::HashSet<&str> = instruments
        .iter()
        .map(|i| i.symbol.as_str())
        .filter(|s| !s.is_empty())
        .collect();

    let mut pairs: Vec<Pair> = symbols
        .iter()
        .filter_map(|sym| {
            let ars = sym.strip_suffix('D')?;
            if !ars.is_empty() && symbols.contains(ars) {
                Some(Pair::new(ars, *sym))
            } else {
                None
            }
        })
        .collect();

    pairs.sort();
    pairs.dedup();
    pairs
}

/// All symbols a pair set needs subscribed, sorted unique.
pub fn symbols_for(pairs: &[Pair]) -> Vec<String> {
    let mut symbols: Vec<String> = pairs
        .iter()
        .flat_map(|p| [p.ars_symbol.clone(), p.usd_symbol.clone()])
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

/// The designated reference pair: AL30/AL30D when listed, else the first.
pub fn pick_reference_pair(pairs: &[Pair]) -> Option<Pair> {
    pairs
        .iter()
        .find(|p| p.ars_symbol.eq_ignore_ascii_case("AL30"))
        .or_else(|| pairs.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruments(symbols: &[&str]) -> Vec<Instrument> {
        symbols
            .iter()
            .map(|s| Instrument {
                symbol: s.to_string(),
            })
            .collect()
    }

    #[test]
    fn pairs_require_both_legs() {
        let pairs = build_pairs(&instruments(&["AL30", "AL30D", "GD30", "AE38D"]));
        assert_eq!(pairs, vec![Pair::new("AL30", "AL30D")]);
    }

    #[test]
    fn pairs_are_sorted_and_unique() {
        let pairs = build_pairs(&instruments(&[
            "GD30", "GD30D", "AL30", "AL30D", "AL30", "AL30D",
        ]));
        assert_eq!(
            pairs,
            vec![Pair::new("AL30", "AL30D"), Pair::new("GD30", "GD30D")]
        );
    }

    #[test]
    fn bare_d_symbol_is_not_a_pair() {
        assert!(build_pairs(&instruments(&["D", ""])).is_empty());
    }

    #[test]
    fn symbols_cover_both_legs_sorted() {
        let pairs = vec![Pair::new("GD30", "GD30D"), Pair::new("AL30", "AL30D")];
        assert_eq!(
            symbols_for(&pairs),
            vec!["AL30", "AL30D", "GD30", "GD30D"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn reference_pair_prefers_al30() {
        let pairs = vec![Pair::new("AE38", "AE38D"), Pair::new("AL30", "AL30D")];
        assert_eq!(pick_reference_pair(&pairs).unwrap().ars_symbol, "AL30");

        let pairs = vec![Pair::new("AE38", "AE38D"), Pair::new("GD30", "GD30D")];
        assert_eq!(pick_reference_pair(&pairs).unwrap().ars_symbol, "AE38");

        assert!(pick_reference_pair(&[]).is_none());
    }
}
