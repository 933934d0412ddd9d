// =============================================================================
// REST Client — token exchange, instrument list, account report
// =============================================================================
//
// The venue authenticates once via POST /auth/getToken with username/password
// headers; the token comes back in the X-Auth-Token response header and is
// attached to every subsequent call (and to the streaming URL).
// =============================================================================

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::WireError;

pub const AUTH_HEADER: &str = "X-Auth-Token";

/// One entry from the instrument list. Only the symbol matters here.
#[derive(Debug, Clone, Deserialize)]
pub struct Instrument {
    #[serde(default)]
    pub symbol: String,
}

#[derive(Clone)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout_s: f64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs_f64(timeout_s))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------------

    /// POST /auth/getToken. Credential rejection (4xx) is an auth error the
    /// caller treats as terminal on startup; anything else is transport.
    pub async fn get_token(&self, username: &str, password: &str) -> Result<String, WireError> {
        let url = format!("{}/auth/getToken", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("X-Username", username)
            .header("X-Password", password)
            .send()
            .await
            .context("POST /auth/getToken request failed")?;

        let status = resp.status();
        if status.is_client_error() {
            return Err(WireError::Auth(format!(
                "token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(WireError::Transport(anyhow!(
                "token endpoint returned {status}"
            )));
        }

        let token = resp
            .headers()
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| WireError::Auth("no token in response headers".to_string()))?;

        debug!("auth token obtained");
        Ok(token)
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    /// GET /rest/instruments/all. The venue returns either a bare array or an
    /// object with an `instruments` array.
    pub async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let url = format!("{}/rest/instruments/all", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /rest/instruments/all request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse instruments response")?;

        if !status.is_success() {
            anyhow::bail!("GET /rest/instruments/all returned {status}: {body}");
        }

        let raw = if body.is_array() {
            body
        } else {
            body.get("instruments")
                .cloned()
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new()))
        };

        let instruments: Vec<Instrument> =
            serde_json::from_value(raw).context("instruments array has unexpected shape")?;

        debug!(count = instruments.len(), "instruments fetched");
        Ok(instruments)
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /rest/risk/accountReport/{account} → (available ARS, available USD).
    pub async fn account_report(&self, token: &str, account: &str) -> Result<(f64, f64)> {
        let url = format!("{}/rest/risk/accountReport/{}", self.base_url, account);

        let resp = self
            .client
            .get(&url)
            .header(AUTH_HEADER, token)
            .header("accept", "application/json")
            .send()
            .await
            .context("GET accountReport request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse accountReport response")?;

        if !status.is_success() {
            anyhow::bail!("GET accountReport returned {status}: {body}");
        }

        let (ars, usd) = parse_account_cash(&body);
        debug!(ars, usd, "account report fetched");
        Ok((ars, usd))
    }
}

/// Extract available cash from an account report, tolerating both field
/// spellings and a missing `detailedPosition` wrapper.
pub fn parse_account_cash(body: &serde_json::Value) -> (f64, f64) {
    let detail = body.get("detailedPosition").unwrap_or(body);

    let read = |primary: &str, fallback: &str| -> f64 {
        detail
            .get(primary)
            .or_else(|| detail.get(fallback))
            .and_then(|v| v.as_f64())
            .unwrap_or_else(|| {
                warn!(field = primary, "cash field missing from account report");
                0.0
            })
    };

    (
        read("availableCashARS", "cashARS"),
        read("availableCashUSD", "cashUSD"),
    )
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
