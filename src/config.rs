// =============================================================================
// Settings — hot-reloadable engine configuration with atomic save
// =============================================================================
//
// Central configuration hub for the MEP engine. Every tunable parameter lives
// here so the trading loop can be reconfigured at runtime without a restart;
// the operator control document (control.rs) writes into this struct.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_env() -> String {
    "paper".to_string()
}

fn default_poll_s() -> f64 {
    0.2
}

fn default_rest_timeout_s() -> f64 {
    3.0
}

fn default_proprietary_tag() -> String {
    "PBCP".to_string()
}

fn default_min_notional_ars() -> f64 {
    40_000.0
}

fn default_thresh_pct() -> f64 {
    0.002
}

fn default_risk_poll_s() -> f64 {
    0.5
}

fn default_risk_refresh_s() -> f64 {
    30.0
}

fn default_instrument_refresh_s() -> f64 {
    24.0 * 60.0 * 60.0
}

fn default_wait_ms() -> u64 {
    120
}

fn default_grace_ms() -> u64 {
    800
}

fn default_edge_tol_bps() -> f64 {
    1.0
}

fn default_half_life_s() -> f64 {
    7.0
}

fn default_ref_k() -> f64 {
    4.0
}

fn default_ref_min_hl_s() -> f64 {
    2.0
}

fn default_ref_max_hl_s() -> f64 {
    20.0
}

fn default_lat_probe_s() -> f64 {
    30.0
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_control_path() -> String {
    "state/control.json".to_string()
}

// =============================================================================
// Mode enums
// =============================================================================

/// Which source of truth drives cash balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMode {
    /// Cash comes from periodic REST account polls; fills only move positions.
    RiskPoll,
    /// Cash is derived from fills, with a slower periodic REST reseed.
    ErReconcile,
}

impl Default for BalanceMode {
    fn default() -> Self {
        Self::RiskPoll
    }
}

impl BalanceMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "risk_poll" => Some(Self::RiskPoll),
            "er_reconcile" => Some(Self::ErReconcile),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RiskPoll => "risk_poll",
            Self::ErReconcile => "er_reconcile",
        }
    }
}

/// What to do with a residual after the sell grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindMode {
    /// Re-check the edge; retry the sell if it still pays, flatten otherwise.
    Smart,
    /// Flatten on the buy leg unconditionally.
    Always,
    /// Leave the residual alone.
    None,
}

impl Default for UnwindMode {
    fn default() -> Self {
        Self::Smart
    }
}

impl UnwindMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "smart" => Some(Self::Smart),
            "always" => Some(Self::Always),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// How the reference rate is selected from the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefMode {
    /// Instantaneous ratio only.
    Tick,
    /// Conservative blend of instantaneous and time-decayed EMA.
    Hybrid,
}

impl Default for RefMode {
    fn default() -> Self {
        Self::Hybrid
    }
}

impl RefMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "tick" => Some(Self::Tick),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Hybrid => "hybrid",
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level runtime configuration for the MEP engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Environment & endpoints --------------------------------------------
    /// Selected environment: "paper" (Remarkets) or "live".
    #[serde(default = "default_env")]
    pub env: String,

    /// Explicit REST base URL. Empty means "use the environment default".
    #[serde(default)]
    pub rest_base_url: String,

    /// Explicit streaming URL. Empty means "use the environment default".
    #[serde(default)]
    pub ws_url: String,

    #[serde(default)]
    pub paper_username: String,
    #[serde(default)]
    pub paper_password: String,
    #[serde(default)]
    pub live_username: String,
    #[serde(default)]
    pub live_password: String,

    #[serde(default)]
    pub account_paper: String,
    #[serde(default)]
    pub account_live: String,

    /// Proprietary tag stamped on every order.
    #[serde(default = "default_proprietary_tag")]
    pub proprietary_tag: String,

    // --- Cadences -----------------------------------------------------------
    /// Trading-loop tick cadence in seconds.
    #[serde(default = "default_poll_s")]
    pub poll_s: f64,

    /// Timeout applied to every REST call, in seconds.
    #[serde(default = "default_rest_timeout_s")]
    pub rest_timeout_s: f64,

    #[serde(default = "default_risk_poll_s")]
    pub risk_poll_s: f64,

    #[serde(default = "default_risk_refresh_s")]
    pub risk_refresh_s: f64,

    #[serde(default = "default_instrument_refresh_s")]
    pub instrument_refresh_s: f64,

    // --- Signal thresholds --------------------------------------------------
    /// Minimum ARS-valued volume achievable on both legs for a trade.
    #[serde(default = "default_min_notional_ars")]
    pub min_notional_ars: f64,

    /// Minimum dislocation from the reference, as a fraction (0.002 = 0.2%).
    #[serde(default = "default_thresh_pct")]
    pub thresh_pct: f64,

    // --- Two-leg execution --------------------------------------------------
    /// Budget for the buy-fill accumulation window, milliseconds.
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,

    /// Budget for the sell grace window, milliseconds.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Tolerance margin for the smart-unwind edge re-check, basis points.
    #[serde(default = "default_edge_tol_bps")]
    pub edge_tol_bps: f64,

    #[serde(default)]
    pub unwind_mode: UnwindMode,

    // --- Reference estimator ------------------------------------------------
    #[serde(default)]
    pub ref_mode: RefMode,

    /// EMA half-life in seconds.
    #[serde(default = "default_half_life_s")]
    pub half_life_s: f64,

    /// When true, the latency probe retunes the half-life from measured RTT.
    #[serde(default)]
    pub ref_tune: bool,

    /// Half-life = clamp(ref_k × median RTT, [ref_min_hl_s, ref_max_hl_s]).
    #[serde(default = "default_ref_k")]
    pub ref_k: f64,

    #[serde(default = "default_ref_min_hl_s")]
    pub ref_min_hl_s: f64,

    #[serde(default = "default_ref_max_hl_s")]
    pub ref_max_hl_s: f64,

    /// Latency-probe cadence in seconds.
    #[serde(default = "default_lat_probe_s")]
    pub lat_probe_s: f64,

    // --- Balances -----------------------------------------------------------
    #[serde(default)]
    pub balance_mode: BalanceMode,

    // --- Files --------------------------------------------------------------
    /// Directory for published status/books/positions snapshots.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Operator control document read by the trading loop.
    #[serde(default = "default_control_path")]
    pub control_path: String,

    // --- Trace --------------------------------------------------------------
    /// Emit signal/execution trace events.
    #[serde(default)]
    pub trace_enabled: bool,

    /// Also log raw wire payloads at debug level. Noisy.
    #[serde(default)]
    pub trace_raw: bool,
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings object deserializes")
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(path = %path.display(), env = %settings.env, "settings loaded");
        Ok(settings)
    }

    /// Persist the current settings to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialize settings")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        Ok(())
    }

    /// Resolve (REST base, streaming URL) for the selected environment.
    /// Explicit overrides win over the environment defaults.
    pub fn urls(&self) -> (String, String) {
        let (rest, ws) = if self.env.eq_ignore_ascii_case("live") {
            (
                "https://api.primary.com.ar",
                "wss://api.primary.com.ar/ws",
            )
        } else {
            (
                "https://api.remarkets.primary.com.ar",
                "wss://api.remarkets.primary.com.ar/ws",
            )
        };

        let rest = if self.rest_base_url.is_empty() {
            rest.to_string()
        } else {
            self.rest_base_url.trim_end_matches('/').to_string()
        };
        let ws = if self.ws_url.is_empty() {
            ws.to_string()
        } else {
            self.ws_url.clone()
        };
        (rest, ws)
    }

    /// Credential pair for the selected environment. Missing credentials are
    /// a fatal configuration error.
    pub fn credentials(&self) -> Result<(String, String), ConfigError> {
        let (user, pwd) = if self.env.eq_ignore_ascii_case("live") {
            (self.live_username.clone(), self.live_password.clone())
        } else {
            (self.paper_username.clone(), self.paper_password.clone())
        };
        if user.is_empty() || pwd.is_empty() {
            return Err(ConfigError::MissingCredentials(self.env.clone()));
        }
        Ok((user, pwd))
    }

    /// Trading account for the selected environment.
    pub fn account(&self) -> String {
        if self.env.eq_ignore_ascii_case("live") {
            self.account_live.clone()
        } else {
            self.account_paper.clone()
        }
    }
}
