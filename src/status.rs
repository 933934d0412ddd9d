// =============================================================================
// Status Publication — snapshot files for the dashboard
// =============================================================================
//
// The dashboard is an external process that only reads files. Every snapshot
// is written tmp + rename so a reader can never observe a partial document.
// Trade rows go to an append-only CSV.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::types::{Cash, TopOfBook};

/// One line of the trade log.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    pub ts: String,
    pub pair: String,
    pub direction: String,
    pub implied: f64,
    pub reference: f64,
    pub nominal: i64,
    pub price_ars: f64,
    pub price_usd: Option<f64>,
}

/// Loop-level state summary published every tick.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ts: f64,
    pub env: String,
    pub mode: String,
    pub source: String,
    pub last_refresh: f64,
    pub cash_ars: f64,
    pub cash_usd: f64,
    pub trading_enabled: bool,
    pub ref_ars_to_usd: Option<f64>,
    pub ref_usd_to_ars: Option<f64>,
    pub ref_mode: String,
    pub half_life_s: f64,
    pub thresh_pct: f64,
    pub min_notional_ars: f64,
    pub reference_pair: Option<String>,
}

#[derive(Serialize)]
struct BooksFile<'a> {
    ts: f64,
    books: &'a HashMap<String, TopOfBook>,
}

#[derive(Serialize)]
struct PositionsFile<'a> {
    ts: f64,
    positions: &'a HashMap<String, i64>,
    cash_ars: f64,
    cash_usd: f64,
}

pub struct StatusPublisher {
    dir: PathBuf,
}

impl StatusPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn write_status(&self, status: &StatusSnapshot) -> Result<()> {
        atomic_write_json(&self.dir.join("status.json"), status)
    }

    pub fn write_books(&self, ts: f64, books: &HashMap<String, TopOfBook>) -> Result<()> {
        atomic_write_json(&self.dir.join("books.json"), &BooksFile { ts, books })
    }

    pub fn write_positions(
        &self,
        ts: f64,
        positions: &HashMap<String, i64>,
        cash: Cash,
    ) -> Result<()> {
        atomic_write_json(
            &self.dir.join("positions.json"),
            &PositionsFile {
                ts,
                positions,
                cash_ars: cash.ars,
                cash_usd: cash.usd,
            },
        )
    }

    /// Append one row to the trade log, writing the header on first use.
    pub fn append_trade(&self, row: &TradeRow) -> Result<()> {
        let path = self.dir.join("live_trades.csv");
        let new_file = !path.exists();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open trade log {}", path.display()))?;

        if new_file {
            writeln!(file, "ts,pair,direction,implied,reference,nominal,price_ars,price_usd")?;
        }
        writeln!(
            file,
            "{},{},{},{},{},{},{},{}",
            row.ts,
            row.pair,
            row.direction,
            row.implied,
            row.reference,
            row.nominal,
            row.price_ars,
            row.price_usd.map_or(String::new(), |p| p.to_string()),
        )?;
        Ok(())
    }
}

/// Serialize to a sibling tmp file, then rename over the target.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("failed to serialize snapshot")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("failed to write tmp snapshot {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename snapshot into {}", path.display()))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mep-status-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn books_file_shape_matches_the_contract() {
        let dir = temp_dir();
        let publisher = StatusPublisher::new(&dir).unwrap();

        let mut books = HashMap::new();
        books.insert(
            "AL30".to_string(),
            TopOfBook {
                ts: Utc::now(),
                bid: 1000.0,
                ask: 1010.0,
                bid_qty: 100.0,
                ask_qty: 50.0,
            },
        );
        publisher.write_books(123.5, &books).unwrap();

        let raw = std::fs::read_to_string(dir.join("books.json")).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["ts"], 123.5);
        assert_eq!(parsed["books"]["AL30"]["bid"], 1000.0);
        assert_eq!(parsed["books"]["AL30"]["ask_qty"], 50.0);
        // No tmp file left behind.
        assert!(!dir.join("books.json.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn positions_file_carries_cash() {
        let dir = temp_dir();
        let publisher = StatusPublisher::new(&dir).unwrap();

        let mut positions = HashMap::new();
        positions.insert("AL30".to_string(), 40_i64);
        publisher
            .write_positions(1.0, &positions, Cash { ars: 10.0, usd: 2.0 })
            .unwrap();

        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("positions.json")).unwrap())
                .unwrap();
        assert_eq!(parsed["positions"]["AL30"], 40);
        assert_eq!(parsed["cash_ars"], 10.0);
        assert_eq!(parsed["cash_usd"], 2.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn trade_log_writes_header_once() {
        let dir = temp_dir();
        let publisher = StatusPublisher::new(&dir).unwrap();

        let row = TradeRow {
            ts: "2024-01-01T00:00:00Z".into(),
            pair: "AL30:AL30D".into(),
            direction: "ARS->USD".into(),
            implied: 1010.0,
            reference: 1020.0,
            nominal: 50,
            price_ars: 1010.0,
            price_usd: Some(1.0),
        };
        publisher.append_trade(&row).unwrap();
        publisher.append_trade(&row).unwrap();

        let content = std::fs::read_to_string(dir.join("live_trades.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ts,pair,direction"));
        assert!(lines[1].contains("ARS->USD"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn status_snapshot_round_trips() {
        let dir = temp_dir();
        let publisher = StatusPublisher::new(&dir).unwrap();

        publisher
            .write_status(&StatusSnapshot {
                ts: 9.0,
                env: "paper".into(),
                mode: "risk_poll".into(),
                source: "risk_poll".into(),
                last_refresh: 8.0,
                cash_ars: 1_000_000.0,
                cash_usd: 0.0,
                trading_enabled: true,
                ref_ars_to_usd: Some(1020.0),
                ref_usd_to_ars: None,
                ref_mode: "hybrid".into(),
                half_life_s: 7.0,
                thresh_pct: 0.002,
                min_notional_ars: 40_000.0,
                reference_pair: Some("AL30:AL30D".into()),
            })
            .unwrap();

        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("status.json")).unwrap())
                .unwrap();
        assert_eq!(parsed["trading_enabled"], true);
        assert_eq!(parsed["ref_ars_to_usd"], 1020.0);
        assert!(parsed["ref_usd_to_ars"].is_null());
        assert_eq!(parsed["reference_pair"], "AL30:AL30D");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
