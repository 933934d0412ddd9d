// =============================================================================
// Streaming Client — one bidirectional socket for quotes, reports, and orders
// =============================================================================
//
// Lifecycle: UNAUTHENTICATED → AUTHENTICATED → CONNECTED ⇄ DISCONNECTED →
// STOPPED. Credential rejection on the very first authentication is terminal;
// once past it, every transport fault falls back to an exponential-backoff
// reconnect (1 s doubling to a 30 s cap, reset on success) that re-logs-in
// best effort and resubscribes market data and order reports.
//
// The outbound path is serialized behind a tokio Mutex on the write half.
// Inbound dispatch owns the read half: `md` messages replace entries in the
// quote board, `er` messages fan out on a broadcast channel so the
// reconciler, the execution coordinator, and the latency probe each see every
// report.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::WireError;
use crate::quotes::QuoteBoard;
use crate::types::{ExecReport, OrderStatus, Side, Tif, TopOfBook};
use crate::wire::rest::{RestClient, AUTH_HEADER};

/// Capacity of the per-subscriber execution-report queues.
const ER_BUS_CAPACITY: usize = 1024;

/// Application-level keepalive: ping cadence and tolerated pong silence.
const PING_INTERVAL: Duration = Duration::from_secs(15);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ---------------------------------------------------------------------------
// Order gateway trait
// ---------------------------------------------------------------------------

/// The narrow surface the execution coordinator and the latency probe need.
/// The trading loop may swap the live client on re-authentication, and tests
/// script fills through a mock, so both depend on this seam instead of the
/// concrete client.
pub trait OrderGateway: Send + Sync {
    /// Every subscriber receives every report, in wire order.
    fn subscribe_reports(&self) -> broadcast::Receiver<ExecReport>;

    /// Submit a limit order; returns the generated client order id.
    fn send_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        price: f64,
        tif: Tif,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Submit a market order; returns the generated client order id.
    fn send_market(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        tif: Tif,
    ) -> impl Future<Output = Result<String>> + Send;
}

// ---------------------------------------------------------------------------
// Wire client
// ---------------------------------------------------------------------------

pub struct WireClient {
    settings: Arc<RwLock<Settings>>,
    rest: RestClient,
    quotes: Arc<QuoteBoard>,
    token: RwLock<String>,
    symbols: RwLock<Vec<String>>,
    er_tx: broadcast::Sender<ExecReport>,
    writer: Mutex<Option<WsSink>>,
    cancel: CancellationToken,
}

impl WireClient {
    pub fn new(settings: Arc<RwLock<Settings>>, symbols: Vec<String>) -> Self {
        let (rest_base, _) = settings.read().urls();
        let timeout_s = settings.read().rest_timeout_s;
        let (er_tx, _) = broadcast::channel(ER_BUS_CAPACITY);

        Self {
            settings,
            rest: RestClient::new(rest_base, timeout_s),
            quotes: Arc::new(QuoteBoard::new()),
            token: RwLock::new(String::new()),
            symbols: RwLock::new(sorted_unique(symbols)),
            er_tx,
            writer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Current auth token; empty until authenticated.
    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.symbols.read().clone()
    }

    /// Atomic copy of the quote cache.
    pub fn snapshot(&self) -> std::collections::HashMap<String, TopOfBook> {
        self.quotes.snapshot()
    }

    /// Close the connection and make `run()` return. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            let _ = sink.send(Message::Close(None)).await;
        }
        *writer = None;
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Run the connection until `stop()`. Returns `WireError::Auth` only when
    /// the very first authentication is rejected; after that, auth failures
    /// during reconnect are swallowed and the backoff loop keeps trying.
    pub async fn run(&self) -> Result<(), WireError> {
        let mut backoff = 1.0_f64;
        let mut authenticated_once = false;

        while !self.cancel.is_cancelled() {
            if self.token.read().is_empty() {
                match self.login().await {
                    Ok(()) => authenticated_once = true,
                    Err(e) if e.is_auth() && !authenticated_once => return Err(e),
                    Err(e) => {
                        warn!(error = %e, backoff_s = backoff, "authentication failed — retrying");
                        self.backoff_sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }
                }
            }
            authenticated_once = true;

            let read = match self.connect().await {
                Ok(read) => read,
                Err(e) => {
                    warn!(error = %e, backoff_s = backoff, "connect failed — backing off");
                    self.backoff_sleep(backoff).await;
                    backoff = next_backoff(backoff);
                    // Best-effort re-login in case the token went stale.
                    if let Err(e) = self.login().await {
                        debug!(error = %e, "re-login during backoff failed");
                    }
                    continue;
                }
            };

            backoff = 1.0;

            if let Err(e) = self.dispatch(read).await {
                warn!(error = %e, "stream dropped — reconnecting");
                *self.writer.lock().await = None;
                self.backoff_sleep(backoff).await;
                backoff = next_backoff(backoff);
                if let Err(e) = self.login().await {
                    debug!(error = %e, "re-login during backoff failed");
                }
            } else {
                break; // stopped cleanly
            }
        }

        *self.writer.lock().await = None;
        info!("wire client stopped");
        Ok(())
    }

    async fn login(&self) -> Result<(), WireError> {
        let (username, password) = {
            let s = self.settings.read();
            s.credentials()
                .map_err(|e| WireError::Auth(e.to_string()))?
        };
        let token = self.rest.get_token(&username, &password).await?;
        *self.token.write() = token;
        info!("authenticated");
        Ok(())
    }

    /// Open the socket, store the write half, and resubscribe: market data
    /// for the current symbol set first, then order reports for the account.
    async fn connect(&self) -> Result<WsSource> {
        let (_, ws_url) = self.settings.read().urls();
        let token = self.token();
        let url = format!("{ws_url}?{AUTH_HEADER}={token}");

        info!(url = %ws_url, "connecting to streaming endpoint");
        let (stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to streaming endpoint")?;
        let (sink, read) = stream.split();
        *self.writer.lock().await = Some(sink);

        let symbols = self.subscribed_symbols();
        if !symbols.is_empty() {
            self.send_json(&market_data_subscription(&symbols)).await?;
        }
        let account = self.settings.read().account();
        self.send_json(&order_report_subscription(&account)).await?;

        info!(subscribed = symbols.len(), "streaming connected and subscribed");
        Ok(read)
    }

    /// Read loop. Returns Ok(()) only on cancellation; every other exit is a
    /// transport fault the caller turns into a reconnect.
    async fn dispatch(&self, mut read: WsSource) -> Result<()> {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.reset();
        let mut last_pong = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),

                _ = ping_timer.tick() => {
                    if last_pong.elapsed() > PING_INTERVAL + PONG_TIMEOUT {
                        anyhow::bail!("pong timeout");
                    }
                    let mut writer = self.writer.lock().await;
                    if let Some(sink) = writer.as_mut() {
                        sink.send(Message::Ping(Vec::new()))
                            .await
                            .context("ping send failed")?;
                    }
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_message(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        let mut writer = self.writer.lock().await;
                        if let Some(sink) = writer.as_mut() {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => last_pong = tokio::time::Instant::now(),
                    Some(Ok(Message::Close(_))) => anyhow::bail!("server closed the stream"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("streaming read error"),
                    None => anyhow::bail!("stream ended"),
                },
            }
        }
    }

    fn handle_message(&self, text: &str) {
        if self.settings.read().trace_raw {
            debug!(payload = text, "raw inbound");
        }
        match parse_inbound(text) {
            Some(Inbound::Quote { symbol, book }) => self.quotes.update(&symbol, book),
            Some(Inbound::Report(er)) => {
                // Send only fails when nobody is subscribed, which is fine.
                let _ = self.er_tx.send(er);
            }
            None => debug!("dropping undecodable or unhandled inbound message"),
        }
    }

    async fn backoff_sleep(&self, seconds: f64) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Replace the market-data subscription with the sorted-unique input and
    /// evict quotes that left the subscription.
    pub async fn update_symbols(&self, new_symbols: Vec<String>) -> Result<()> {
        let symbols = sorted_unique(new_symbols);
        self.quotes.retain_subscribed(&symbols);
        *self.symbols.write() = symbols.clone();

        let connected = self.writer.lock().await.is_some();
        if connected {
            self.send_json(&market_data_subscription(&symbols)).await?;
        }
        info!(symbols = symbols.len(), "market-data subscription replaced");
        Ok(())
    }

    async fn send_json(&self, payload: &Value) -> Result<()> {
        if self.settings.read().trace_raw {
            debug!(payload = %payload, "raw outbound");
        }
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().context("not connected")?;
        sink.send(Message::Text(payload.to_string()))
            .await
            .context("streaming send failed")
    }

    /// Full-control limit submission, including iceberg display quantity.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        price: f64,
        tif: Tif,
        iceberg: bool,
        display_qty: Option<i64>,
    ) -> Result<String> {
        anyhow::ensure!(qty > 0, "limit order qty must be positive");
        anyhow::ensure!(price > 0.0, "limit order price must be positive");

        let clid = new_client_order_id();
        let (account, proprietary) = {
            let s = self.settings.read();
            (s.account(), s.proprietary_tag.clone())
        };
        let payload = limit_order(
            symbol,
            side,
            qty,
            price,
            tif,
            iceberg,
            display_qty,
            &account,
            &proprietary,
            &clid,
        );
        self.send_json(&payload).await?;
        debug!(symbol, side = %side, qty, price, tif = tif.as_str(), clid = %clid, "limit order sent");
        Ok(clid)
    }

    pub async fn send_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        tif: Tif,
    ) -> Result<String> {
        anyhow::ensure!(qty > 0, "market order qty must be positive");

        let clid = new_client_order_id();
        let (account, proprietary) = {
            let s = self.settings.read();
            (s.account(), s.proprietary_tag.clone())
        };
        let payload = market_order(symbol, side, qty, tif, &account, &proprietary, &clid);
        self.send_json(&payload).await?;
        debug!(symbol, side = %side, qty, tif = tif.as_str(), clid = %clid, "market order sent");
        Ok(clid)
    }
}

impl OrderGateway for WireClient {
    fn subscribe_reports(&self) -> broadcast::Receiver<ExecReport> {
        self.er_tx.subscribe()
    }

    async fn send_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        price: f64,
        tif: Tif,
    ) -> Result<String> {
        self.send_limit_order(symbol, side, qty, price, tif, false, None)
            .await
    }

    async fn send_market(&self, symbol: &str, side: Side, qty: i64, tif: Tif) -> Result<String> {
        self.send_market_order(symbol, side, qty, tif).await
    }
}

impl std::fmt::Debug for WireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClient")
            .field("symbols", &self.symbols.read().len())
            .field("authenticated", &!self.token.read().is_empty())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pure message builders and parsers
// ---------------------------------------------------------------------------

fn new_client_order_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn sorted_unique(mut symbols: Vec<String>) -> Vec<String> {
    symbols.sort();
    symbols.dedup();
    symbols
}

/// Next reconnect delay: double, capped at 30 s.
pub fn next_backoff(current: f64) -> f64 {
    (current * 2.0).min(30.0)
}

pub fn market_data_subscription(symbols: &[String]) -> Value {
    json!({
        "type": "smd",
        "level": 1,
        "symbols": symbols,
        "entries": ["BI", "OF"],
    })
}

pub fn order_report_subscription(account: &str) -> Value {
    json!({
        "type": "spr",
        "accounts": [account],
        "all": true,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn limit_order(
    symbol: &str,
    side: Side,
    qty: i64,
    price: f64,
    tif: Tif,
    iceberg: bool,
    display_qty: Option<i64>,
    account: &str,
    proprietary: &str,
    client_order_id: &str,
) -> Value {
    let mut payload = json!({
        "type": "no",
        "product": { "marketId": "ROFX", "symbol": symbol },
        "price": price,
        "quantity": qty,
        "side": side.as_str(),
        "account": account,
        "timeInForce": tif.as_str(),
        "iceberg": iceberg,
        "wsClOrdId": client_order_id,
        "proprietary": proprietary,
    });
    if iceberg {
        if let Some(display) = display_qty {
            payload["displayQuantity"] = json!(display);
        }
    }
    payload
}

pub fn market_order(
    symbol: &str,
    side: Side,
    qty: i64,
    tif: Tif,
    account: &str,
    proprietary: &str,
    client_order_id: &str,
) -> Value {
    json!({
        "type": "no",
        "product": { "marketId": "ROFX", "symbol": symbol },
        "quantity": qty,
        "side": side.as_str(),
        "account": account,
        "ordType": "MARKET",
        "timeInForce": tif.as_str(),
        "wsClOrdId": client_order_id,
        "proprietary": proprietary,
    })
}

#[derive(Debug)]
pub enum Inbound {
    Quote { symbol: String, book: TopOfBook },
    Report(ExecReport),
}

/// Decode one inbound frame. Malformed or unknown messages yield `None` and
/// are dropped by the dispatcher; they never propagate.
pub fn parse_inbound(text: &str) -> Option<Inbound> {
    let root: Value = serde_json::from_str(text).ok()?;
    match root.get("type").and_then(|t| t.as_str())? {
        "md" => {
            let symbol = root.get("symbol")?.as_str()?.to_string();
            let entries = root.get("entries")?;
            let bid = entries.get("BI").and_then(|v| v.get(0));
            let ask = entries.get("OF").and_then(|v| v.get(0));
            let book = TopOfBook {
                ts: Utc::now(),
                bid: number_field(bid, "price"),
                ask: number_field(ask, "price"),
                bid_qty: number_field(bid, "size"),
                ask_qty: number_field(ask, "size"),
            };
            Some(Inbound::Quote { symbol, book })
        }
        "er" => {
            let symbol = root
                .get("product")
                .and_then(|p| p.get("symbol"))
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            let side = match root.get("side").and_then(|s| s.as_str()) {
                Some("BUY") => Some(Side::Buy),
                Some("SELL") => Some(Side::Sell),
                _ => None,
            };
            let price = root
                .get("lastPx")
                .and_then(|v| v.as_f64())
                .or_else(|| root.get("price").and_then(|v| v.as_f64()))
                .unwrap_or(0.0);
            let qty = root
                .get("lastQty")
                .and_then(|v| v.as_f64())
                .or_else(|| root.get("quantity").and_then(|v| v.as_f64()))
                .unwrap_or(0.0);
            let status = OrderStatus::parse(
                root.get("status").and_then(|s| s.as_str()).unwrap_or(""),
            );
            Some(Inbound::Report(ExecReport {
                ts: Utc::now(),
                symbol,
                side,
                price,
                qty,
                status,
                order_id: string_field(&root, "orderId"),
                client_order_id: string_field(&root, "clOrdId"),
            }))
        }
        _ => None,
    }
}

fn number_field(entry: Option<&Value>, field: &str) -> f64 {
    entry
        .and_then(|e| e.get(field))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

fn string_field(root: &Value, field: &str) -> String {
    match root.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
