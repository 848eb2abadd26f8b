// =============================================================================
// Binance USDⓈ-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the supervisor and Binance servers.
//
// Transient failures (timeouts, rate limits, 5xx) are retried up to three
// attempts with exponential backoff starting at 500 ms; anything else maps to
// a permanent venue error and is surfaced immediately.
//
// Orders on the same symbol are serialized through a per-symbol lock so that
// quantity sizing never races the venue's precision filters.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use sha2::Sha256;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::exchange::{normalize_symbol, round_amount, ExchangeAdapter, SymbolFilters};
use crate::types::{AccountBalance, Bar, Fill, Side, Ticker, Timeframe, VenuePosition};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Total attempts for transient failures (1 initial + 2 retries).
const MAX_ATTEMPTS: u32 = 3;
/// First backoff delay; doubles per attempt.
const BACKOFF_BASE_MS: u64 = 500;

/// Live or testnet endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueMode {
    Live,
    Testnet,
}

impl VenueMode {
    fn base_url(self) -> &'static str {
        match self {
            Self::Live => "https://fapi.binance.com",
            Self::Testnet => "https://testnet.binancefuture.com",
        }
    }
}

/// Binance futures REST client with HMAC-SHA256 request signing.
pub struct BinanceFuturesClient {
    secret: String,
    base_url: String,
    http: reqwest::Client,
    /// Cached precision filters per symbol (exchangeInfo is expensive).
    filters: RwLock<HashMap<String, SymbolFilters>>,
    /// One async lock per symbol; orders on distinct symbols stay concurrent.
    order_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    /// * `mode`    — live or testnet endpoints.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, mode: VenueMode) -> Self {
        let api_key = api_key.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = mode.base_url(), "BinanceFuturesClient initialised");

        Self {
            secret: secret.into(),
            base_url: mode.base_url().to_string(),
            http,
            filters: RwLock::new(HashMap::new()),
            order_locks: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport with retry
    // -------------------------------------------------------------------------

    /// Send one request, retrying transient failures with exponential backoff.
    ///
    /// Signed requests are re-signed on every attempt so the timestamp stays
    /// inside the recv-window.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> EngineResult<serde_json::Value> {
        let mut last_transient = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
                debug!(path, attempt, delay_ms = delay, "retrying venue request");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let query = if signed {
                self.signed_query(params)
            } else {
                params.to_string()
            };
            let url = if query.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, query)
            };

            let resp = match self.http.request(method.clone(), &url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    // Network-level failures are always transient.
                    last_transient = format!("{method} {path}: {e}");
                    continue;
                }
            };

            let status = resp.status();
            let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

            if status.is_success() {
                return Ok(body);
            }

            if is_transient_status(status.as_u16()) {
                last_transient = format!("{method} {path} returned {status}: {body}");
                warn!(path, %status, "transient venue failure");
                continue;
            }

            let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let msg = body
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("no message");
            return Err(EngineError::VenuePermanent(format!(
                "{method} {path} returned {status} (code {code}): {msg}"
            )));
        }

        Err(EngineError::VenueTransient(format!(
            "exhausted {MAX_ATTEMPTS} attempts: {last_transient}"
        )))
    }

    // -------------------------------------------------------------------------
    // Precision filters
    // -------------------------------------------------------------------------

    /// Venue-declared filters for `symbol`, cached after the first fetch.
    async fn symbol_filters(&self, symbol: &str) -> EngineResult<SymbolFilters> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(*f);
        }

        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/exchangeInfo",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .ok_or_else(|| {
                EngineError::VenuePermanent(format!("symbol {symbol} not found in exchangeInfo"))
            })?;

        let mut filters = SymbolFilters::default();
        if let Some(list) = info["filters"].as_array() {
            for f in list {
                match f["filterType"].as_str() {
                    Some("PRICE_FILTER") => {
                        if let Ok(tick) = parse_str_f64(&f["tickSize"]) {
                            filters.price_tick = tick;
                        }
                    }
                    Some("LOT_SIZE") => {
                        if let Ok(step) = parse_str_f64(&f["stepSize"]) {
                            filters.amount_step = step;
                        }
                        if let Ok(min) = parse_str_f64(&f["minQty"]) {
                            filters.min_qty = min;
                        }
                    }
                    _ => {}
                }
            }
        }

        self.filters.write().insert(symbol.to_string(), filters);
        debug!(symbol, ?filters, "symbol filters cached");
        Ok(filters)
    }

    fn order_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.order_locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Order helpers
    // -------------------------------------------------------------------------

    /// Submit a market order and parse the venue fill from the RESULT
    /// response (avgPrice / executedQty).
    async fn market_order(
        &self,
        symbol: &str,
        order_side: &str,
        qty: f64,
        reduce_only: bool,
    ) -> EngineResult<Fill> {
        let client_order_id = Uuid::new_v4().simple().to_string();
        let mut params = format!(
            "symbol={symbol}&side={order_side}&type=MARKET&quantity={qty}\
             &newOrderRespType=RESULT&newClientOrderId=bb-{client_order_id}"
        );
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;

        let price = parse_str_f64(&body["avgPrice"])?;
        let filled_qty = parse_str_f64(&body["executedQty"])?;
        let timestamp = body["updateTime"]
            .as_i64()
            .unwrap_or_else(|| Self::timestamp_ms() as i64);

        if filled_qty <= 0.0 || price <= 0.0 {
            return Err(EngineError::VenuePermanent(format!(
                "market order reported no fill: {body}"
            )));
        }

        debug!(
            symbol,
            order_side,
            price,
            qty = filled_qty,
            reduce_only,
            "market order filled"
        );

        Ok(Fill {
            price,
            qty: filled_qty,
            timestamp,
        })
    }
}

/// 429 (rate limit), 418 (auto-ban warning), and 5xx are retryable.
fn is_transient_status(status: u16) -> bool {
    status == 429 || status == 418 || (500..600).contains(&status)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> EngineResult<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| EngineError::VenuePermanent(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(EngineError::VenuePermanent(format!(
            "expected string or number, got: {val}"
        )))
    }
}

// =============================================================================
// ExchangeAdapter implementation
// =============================================================================

#[async_trait]
impl ExchangeAdapter for BinanceFuturesClient {
    #[instrument(skip(self), name = "binance::configure_leverage")]
    async fn configure_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let symbol = normalize_symbol(symbol);
        match self
            .request(
                reqwest::Method::POST,
                "/fapi/v1/leverage",
                &format!("symbol={symbol}&leverage={leverage}"),
                true,
            )
            .await
        {
            Ok(_) => Ok(()),
            // -4046: "No need to change leverage" — already configured.
            Err(EngineError::VenuePermanent(msg)) if msg.contains("code -4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "binance::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker> {
        let symbol = normalize_symbol(symbol);

        let book = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/ticker/bookTicker",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        let premium = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        let last = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/ticker/price",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;

        Ok(Ticker {
            bid: parse_str_f64(&book["bidPrice"])?,
            ask: parse_str_f64(&book["askPrice"])?,
            last: parse_str_f64(&last["price"])?,
            mark: parse_str_f64(&premium["markPrice"])?,
            timestamp: premium["time"]
                .as_i64()
                .unwrap_or_else(|| Self::timestamp_ms() as i64),
        })
    }

    /// GET /fapi/v1/klines (public — no signature required).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "binance::fetch_bars")]
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> EngineResult<Vec<Bar>> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/klines",
                &format!(
                    "symbol={}&interval={}&limit={}",
                    symbol,
                    timeframe.as_str(),
                    limit
                ),
                false,
            )
            .await?;

        let raw = body.as_array().ok_or_else(|| {
            EngineError::VenuePermanent("klines response is not an array".into())
        })?;

        let now_ms = Self::timestamp_ms() as i64;
        let mut bars = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = match entry.as_array() {
                Some(arr) if arr.len() >= 7 => arr,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };

            let close_time = arr[6].as_i64().unwrap_or(0);
            // Drop the in-progress bar; callers only see closed bars.
            if close_time > now_ms {
                continue;
            }

            bars.push(Bar {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
                close_time,
            });
        }

        debug!(symbol, timeframe = %timeframe, count = bars.len(), "bars fetched");
        Ok(bars)
    }

    #[instrument(skip(self), name = "binance::open_market")]
    async fn open_market(&self, symbol: &str, side: Side, notional: f64) -> EngineResult<Fill> {
        let symbol = normalize_symbol(symbol);
        let lock = self.order_lock(&symbol);
        let _guard = lock.lock().await;

        let filters = self.symbol_filters(&symbol).await?;
        let ticker = self.fetch_ticker(&symbol).await?;
        if ticker.mark <= 0.0 {
            return Err(EngineError::VenuePermanent(format!(
                "mark price unavailable for {symbol}"
            )));
        }

        let qty = round_amount(notional / ticker.mark, filters.amount_step);
        if qty <= 0.0 || qty < filters.min_qty {
            return Err(EngineError::VenuePermanent(format!(
                "notional {notional} sizes below the minimum quantity for {symbol}"
            )));
        }

        let order_side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        self.market_order(&symbol, order_side, qty, false).await
    }

    #[instrument(skip(self), name = "binance::reduce_market")]
    async fn reduce_market(&self, symbol: &str, side: Side, qty: f64) -> EngineResult<Fill> {
        let symbol = normalize_symbol(symbol);
        let lock = self.order_lock(&symbol);
        let _guard = lock.lock().await;

        let filters = self.symbol_filters(&symbol).await?;
        let qty = round_amount(qty, filters.amount_step);
        if qty <= 0.0 {
            return Err(EngineError::VenuePermanent(format!(
                "reduce quantity rounds to zero for {symbol}"
            )));
        }

        // Exiting a long sells; exiting a short buys.
        let order_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        self.market_order(&symbol, order_side, qty, true).await
    }

    #[instrument(skip(self), name = "binance::close_market")]
    async fn close_market(&self, symbol: &str, side: Side) -> EngineResult<Fill> {
        let symbol = normalize_symbol(symbol);
        let position = self.fetch_position(&symbol).await?.ok_or_else(|| {
            EngineError::VenuePermanent(format!("no open position to close for {symbol}"))
        })?;

        if position.side != side {
            return Err(EngineError::VenuePermanent(format!(
                "venue position for {symbol} is {} but close requested {}",
                position.side, side
            )));
        }

        self.reduce_market(&symbol, side, position.qty).await
    }

    #[instrument(skip(self), name = "binance::fetch_position")]
    async fn fetch_position(&self, symbol: &str) -> EngineResult<Option<VenuePosition>> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v2/positionRisk",
                &format!("symbol={symbol}"),
                true,
            )
            .await?;

        let entry = body
            .as_array()
            .and_then(|arr| arr.iter().find(|p| p["symbol"].as_str() == Some(&symbol)));
        let Some(entry) = entry else {
            return Ok(None);
        };

        let amt = parse_str_f64(&entry["positionAmt"])?;
        if amt.abs() < 1e-12 {
            return Ok(None);
        }

        Ok(Some(VenuePosition {
            symbol: symbol.clone(),
            side: if amt > 0.0 { Side::Long } else { Side::Short },
            entry_price: parse_str_f64(&entry["entryPrice"])?,
            qty: amt.abs(),
            leverage: parse_str_f64(&entry["leverage"]).unwrap_or(1.0) as u32,
            unrealized_pnl: parse_str_f64(&entry["unRealizedProfit"]).unwrap_or(0.0),
        }))
    }

    #[instrument(skip(self), name = "binance::fetch_balance")]
    async fn fetch_balance(&self) -> EngineResult<AccountBalance> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/balance", "", true)
            .await?;

        let assets = body.as_array().ok_or_else(|| {
            EngineError::VenuePermanent("balance response is not an array".into())
        })?;

        for asset in assets {
            if asset["asset"].as_str() == Some("USDT") {
                let total = parse_str_f64(&asset["balance"])?;
                let free = parse_str_f64(&asset["availableBalance"])?;
                return Ok(AccountBalance {
                    total,
                    free,
                    used: (total - free).max(0.0),
                });
            }
        }

        warn!("USDT not found in balance response — returning zeros");
        Ok(AccountBalance {
            total: 0.0,
            free: 0.0,
            used: 0.0,
        })
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
