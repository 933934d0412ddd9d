// =============================================================================
// Control Channel — operator overrides and one-shot actions
// =============================================================================
//
// The trading loop reads a small operator-authored JSON document every tick.
// Recognized options overwrite the live Settings (throttled to once per
// 250 ms); one-shot action flags are consumed by clearing them and writing
// the document back atomically (tmp + rename), so the dashboard never sees a
// half-written file.
//
// A single option whose value cannot be coerced is ignored; the rest of the
// document still applies.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{BalanceMode, RefMode, Settings, UnwindMode};

/// Minimum spacing between two override applications.
const APPLY_THROTTLE: Duration = Duration::from_millis(250);

/// One-shot actions requested by the operator this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlActions {
    pub panic_stop: bool,
    pub resume: bool,
    pub reload_instruments: bool,
    pub force_flatten: bool,
    pub force_reauth: bool,
}

pub struct ControlChannel {
    path: PathBuf,
    last_apply: Option<Instant>,
}

impl ControlChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_apply: None,
        }
    }

    /// Read the document once: consume one-shot flags (clearing them in the
    /// file) and apply overrides, throttled.
    pub fn poll(&mut self, settings: &RwLock<Settings>) -> ControlActions {
        let mut doc = match load_document(&self.path) {
            Some(doc) => doc,
            None => return ControlActions::default(),
        };

        let actions = ControlActions {
            panic_stop: take_flag(&mut doc, "panic_stop"),
            resume: take_flag(&mut doc, "resume"),
            reload_instruments: take_flag(&mut doc, "reload_instruments_now"),
            force_flatten: take_flag(&mut doc, "force_flatten"),
            force_reauth: take_flag(&mut doc, "force_reauth"),
        };
        if actions != ControlActions::default() {
            info!(?actions, "control actions consumed");
            if let Err(e) = write_document(&self.path, &doc) {
                warn!(error = %e, "failed to clear one-shot control flags");
            }
        }

        let throttled = self
            .last_apply
            .is_some_and(|t| t.elapsed() < APPLY_THROTTLE);
        if !throttled {
            let applied = apply_overrides(&doc, &mut settings.write());
            if !applied.is_empty() {
                self.last_apply = Some(Instant::now());
                debug!(applied = ?applied, "control overrides applied");
            }
        }

        actions
    }
}

fn load_document(path: &Path) -> Option<Map<String, Value>> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => {
            debug!(path = %path.display(), "control document is not a JSON object");
            None
        }
    }
}

fn write_document(path: &Path, doc: &Map<String, Value>) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&Value::Object(doc.clone()))?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a one-shot flag and clear it in the document when set.
fn take_flag(doc: &mut Map<String, Value>, key: &str) -> bool {
    let set = doc.get(key).and_then(Value::as_bool) == Some(true);
    if set {
        doc.insert(key.to_string(), Value::Bool(false));
    }
    set
}

/// Apply every recognized override onto `settings`, returning the names that
/// actually applied. Unknown keys and uncoercible values are skipped.
pub fn apply_overrides(doc: &Map<String, Value>, settings: &mut Settings) -> Vec<&'static str> {
    let mut applied = Vec::new();

    macro_rules! numeric {
        ($key:literal, $field:ident, $cast:ty) => {
            if let Some(v) = doc.get($key) {
                if let Some(n) = coerce_number(v) {
                    settings.$field = n as $cast;
                    applied.push($key);
                }
            }
        };
    }

    numeric!("WAIT_MS", wait_ms, u64);
    numeric!("GRACE_MS", grace_ms, u64);
    numeric!("EDGE_TOL_BPS", edge_tol_bps, f64);
    numeric!("thresh_pct", thresh_pct, f64);
    numeric!("min_notional_ars", min_notional_ars, f64);
    numeric!("risk_poll_s", risk_poll_s, f64);
    numeric!("risk_refresh_s", risk_refresh_s, f64);
    numeric!("poll_s", poll_s, f64);
    numeric!("HALF_LIFE_S", half_life_s, f64);
    numeric!("REF_K", ref_k, f64);
    numeric!("REF_MIN_HL_S", ref_min_hl_s, f64);
    numeric!("REF_MAX_HL_S", ref_max_hl_s, f64);
    numeric!("LAT_PROBE_S", lat_probe_s, f64);
    numeric!("instrument_refresh_s", instrument_refresh_s, f64);

    macro_rules! boolean {
        ($key:literal, $field:ident) => {
            if let Some(v) = doc.get($key) {
                if let Some(b) = coerce_bool(v) {
                    settings.$field = b;
                    applied.push($key);
                }
            }
        };
    }

    boolean!("trace_enabled", trace_enabled);
    boolean!("trace_raw", trace_raw);
    boolean!("REF_TUNE", ref_tune);

    if let Some(mode) = doc.get("REF_MODE").and_then(Value::as_str) {
        if let Some(mode) = RefMode::parse(mode) {
            settings.ref_mode = mode;
            applied.push("REF_MODE");
        }
    }
    if let Some(mode) = doc.get("UNWIND_MODE").and_then(Value::as_str) {
        if let Some(mode) = UnwindMode::parse(mode) {
            settings.unwind_mode = mode;
            applied.push("UNWIND_MODE");
        }
    }
    if let Some(mode) = doc.get("balance_mode").and_then(Value::as_str) {
        if let Some(mode) = BalanceMode::parse(mode) {
            settings.balance_mode = mode;
            applied.push("balance_mode");
        }
    }

    macro_rules! text {
        ($key:literal, $field:ident) => {
            if let Some(v) = doc.get($key).and_then(Value::as_str) {
                settings.$field = v.to_string();
                applied.push($key);
            }
        };
    }

    // Environment and credential fields take effect on the next re-auth.
    text!("env", env);
    text!("rest_base_url", rest_base_url);
    text!("ws_url", ws_url);
    text!("paper_username", paper_username);
    text!("paper_password", paper_password);
    text!("live_username", live_username);
    text!("live_password", live_password);
    text!("account_paper", account_paper);
    text!("account_live", account_live);
    text!("proprietary_tag", proprietary_tag);

    applied
}

fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
