// =============================================================================
// Reference Estimator — implied FX rate from the reference pair
// =============================================================================
//
// Maintains two references per direction:
//   - instantaneous (tick to tick)
//   - time-decayed EMA (half-life in seconds, independent of tick cadence)
//
// EMA update:
//   tau   = half_life / ln 2
//   alpha = 1 - exp(-dt / tau)
//   ema_t = (1 - alpha) * ema_{t-1} + alpha * inst_t
//
// The first valid tick seeds both values; a direction whose instantaneous
// ratio is unavailable this tick keeps its EMA untouched.
// =============================================================================

use crate::config::RefMode;

/// Stateful estimator of the ARS→USD and USD→ARS implied rates.
#[derive(Debug)]
pub struct RateEstimator {
    half_life_s: f64,
    tau: Option<f64>,
    last_ts: Option<f64>,

    inst_ars_to_usd: Option<f64>,
    inst_usd_to_ars: Option<f64>,
    ema_ars_to_usd: Option<f64>,
    ema_usd_to_ars: Option<f64>,
}

impl RateEstimator {
    pub fn new(half_life_s: f64) -> Self {
        let half = half_life_s.max(0.0);
        Self {
            half_life_s: half,
            tau: tau_for(half),
            last_ts: None,
            inst_ars_to_usd: None,
            inst_usd_to_ars: None,
            ema_ars_to_usd: None,
            ema_usd_to_ars: None,
        }
    }

    /// Change the half-life immediately. Existing EMA values are preserved;
    /// only the decay speed of future updates changes.
    pub fn set_half_life(&mut self, half_life_s: f64) {
        self.half_life_s = half_life_s.max(0.0);
        self.tau = tau_for(self.half_life_s);
    }

    pub fn half_life(&self) -> f64 {
        self.half_life_s
    }

    /// Feed the reference pair's current top-of-book.
    ///
    /// `ts_unix` is wall time in seconds; `dt` between ticks drives the EMA
    /// weight. Ratios are only formed from strictly positive prices.
    pub fn update(
        &mut self,
        ts_unix: f64,
        ask_ars: f64,
        bid_usd: f64,
        bid_ars: f64,
        ask_usd: f64,
    ) {
        let a2u_now = safe_ratio(ask_ars, bid_usd);
        let u2a_now = safe_ratio(bid_ars, ask_usd);
        if a2u_now.is_some() {
            self.inst_ars_to_usd = a2u_now;
        }
        if u2a_now.is_some() {
            self.inst_usd_to_ars = u2a_now;
        }

        let Some(tau) = self.tau else {
            // Degenerate half-life: EMA mirrors the instantaneous value.
            self.ema_ars_to_usd = self.inst_ars_to_usd;
            self.ema_usd_to_ars = self.inst_usd_to_ars;
            self.last_ts = Some(ts_unix);
            return;
        };

        let Some(last_ts) = self.last_ts else {
            // First tick seeds the EMAs for whichever directions are defined.
            self.ema_ars_to_usd = a2u_now;
            self.ema_usd_to_ars = u2a_now;
            self.last_ts = Some(ts_unix);
            return;
        };

        let dt = (ts_unix - last_ts).max(0.0);
        self.last_ts = Some(ts_unix);
        if dt == 0.0 || (a2u_now.is_none() && u2a_now.is_none()) {
            return;
        }

        let alpha = 1.0 - (-dt / tau).exp();
        if let Some(now) = a2u_now {
            let prev = self.ema_ars_to_usd.unwrap_or(now);
            self.ema_ars_to_usd = Some((1.0 - alpha) * prev + alpha * now);
        }
        if let Some(now) = u2a_now {
            let prev = self.ema_usd_to_ars.unwrap_or(now);
            self.ema_usd_to_ars = Some((1.0 - alpha) * prev + alpha * now);
        }
    }

    pub fn inst_ars_to_usd(&self) -> Option<f64> {
        self.inst_ars_to_usd
    }

    pub fn inst_usd_to_ars(&self) -> Option<f64> {
        self.inst_usd_to_ars
    }

    pub fn ema_ars_to_usd(&self) -> Option<f64> {
        self.ema_ars_to_usd
    }

    pub fn ema_usd_to_ars(&self) -> Option<f64> {
        self.ema_usd_to_ars
    }

    /// Reference for buying USD with ARS. In hybrid mode the conservative
    /// pick is the *minimum* of {instantaneous, EMA}: a cheaper reference
    /// demands a deeper dislocation before a trade fires.
    pub fn ref_ars_to_usd(&self, mode: RefMode) -> Option<f64> {
        match mode {
            RefMode::Tick => self.inst_ars_to_usd,
            RefMode::Hybrid => conservative(self.inst_ars_to_usd, self.ema_ars_to_usd, f64::min),
        }
    }

    /// Reference for converting USD back to ARS. Hybrid takes the *maximum*:
    /// an expensive reference demands a richer implied rate to sell into.
    pub fn ref_usd_to_ars(&self, mode: RefMode) -> Option<f64> {
        match mode {
            RefMode::Tick => self.inst_usd_to_ars,
            RefMode::Hybrid => conservative(self.inst_usd_to_ars, self.ema_usd_to_ars, f64::max),
        }
    }
}

fn tau_for(half_life_s: f64) -> Option<f64> {
    if half_life_s > 0.0 {
        Some(half_life_s / std::f64::consts::LN_2)
    } else {
        None
    }
}

fn safe_ratio(num: f64, den: f64) -> Option<f64> {
    if num > 0.0 && den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

fn conservative(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(pick(x, y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}
