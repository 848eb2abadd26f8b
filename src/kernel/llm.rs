// =============================================================================
// LLM-signal kernel — prompt-driven direction signals
// =============================================================================
//
// Formats a factor summary (price, change, RSI, trend) into a prompt, calls a
// chat-completion endpoint no more often than `callIntervalSeconds`, and
// parses a strict JSON verdict:
//
//   {"signal": "long|short|hold", "confidence": 0.0-1.0,
//    "reasoning": "...", "risk_level": "low|medium|high"}
//
// A verdict at or above `confidenceThreshold` trades; malformed responses are
// recoverable errors and never trade. The transport sits behind an async
// trait so tests script responses without a network.
// =============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{LlmSection, StrategyConfig};
use crate::error::{EngineError, EngineResult};
use crate::indicators::calculate_rsi;
use crate::indicators::sma::latest_sma;
use crate::types::{Side, TradeKind, TradeRecord};

use super::{Prediction, StrategyContext};

const SYSTEM_PROMPT: &str = "You are a disciplined crypto-futures analyst. Respond with a single \
JSON object: {\"signal\": \"long\"|\"short\"|\"hold\", \"confidence\": number in [0,1], \
\"reasoning\": string, \"risk_level\": \"low\"|\"medium\"|\"high\"}. No other text.";

/// Price history kept for the factor summary.
const FACTOR_WINDOW: usize = 60;

// ---------------------------------------------------------------------------
// Completion transport
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// One chat completion round-trip; returns the assistant text.
    async fn complete(&self, system: &str, user: &str) -> EngineResult<String>;
}

/// OpenAI-compatible chat-completions transport.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl HttpCompletionClient {
    pub fn from_section(section: &LlmSection) -> EngineResult<Self> {
        let api_key = std::env::var(&section.api_key_env).map_err(|_| {
            EngineError::Config(format!(
                "environment variable {} is not set",
                section.api_key_env
            ))
        })?;
        if api_key.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "environment variable {} is empty",
                section.api_key_env
            )));
        }

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build reqwest client"),
            endpoint: section.endpoint.clone(),
            api_key,
            model: section.model.clone(),
            max_tokens: section.max_tokens,
            temperature: section.temperature,
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, system: &str, user: &str) -> EngineResult<String> {
        let request = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::VenueTransient(format!("completion request: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(300).collect();
            return Err(EngineError::KernelRecoverable(format!(
                "completion endpoint returned {status}: {snippet}"
            )));
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
        }
        #[derive(Deserialize)]
        struct ChatChoice {
            message: ChatMessage,
        }
        #[derive(Deserialize)]
        struct ChatMessage {
            content: String,
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| EngineError::KernelRecoverable(format!("completion json: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::KernelRecoverable("completion had no choices".into()))
    }
}

impl std::fmt::Debug for HttpCompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCompletionClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Verdict parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LlmVerdict {
    pub signal: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub risk_level: String,
}

impl LlmVerdict {
    pub fn prediction(&self) -> Prediction {
        let direction = match self.signal.to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(Side::Long),
            "short" | "sell" => Some(Side::Short),
            _ => None,
        };
        Prediction {
            direction,
            confidence: self.confidence,
        }
    }
}

/// Parse the assistant text into a verdict. Tolerates markdown code fences;
/// everything else malformed is a recoverable error.
pub fn parse_verdict(raw: &str) -> EngineResult<LlmVerdict> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let verdict: LlmVerdict = serde_json::from_str(body)
        .map_err(|e| EngineError::KernelRecoverable(format!("malformed llm response: {e}")))?;

    if !(0.0..=1.0).contains(&verdict.confidence) || !verdict.confidence.is_finite() {
        return Err(EngineError::KernelRecoverable(format!(
            "llm confidence {} out of range",
            verdict.confidence
        )));
    }
    match verdict.signal.to_ascii_lowercase().as_str() {
        "long" | "short" | "hold" | "buy" | "sell" => Ok(verdict),
        other => Err(EngineError::KernelRecoverable(format!(
            "unknown llm signal '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

pub struct LlmKernel {
    cfg: LlmSection,
    client: Option<Box<dyn CompletionClient>>,
    prices: Vec<f64>,
    /// Venue time of the last completion call, epoch ms.
    last_call_at: Option<i64>,
}

impl LlmKernel {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        let cfg = config
            .llm
            .clone()
            .ok_or_else(|| EngineError::Config("llm section missing".into()))?;
        Ok(Self {
            cfg,
            client: None,
            prices: Vec::new(),
            last_call_at: None,
        })
    }

    #[cfg(test)]
    pub fn with_client(mut self, client: Box<dyn CompletionClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub async fn initialize(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        // The API key is resolved here, not at construction, so a missing key
        // surfaces as a start failure instead of a CRUD failure.
        if self.client.is_none() {
            self.client = Some(Box::new(HttpCompletionClient::from_section(&self.cfg)?));
        }

        let bars = ctx
            .exchange
            .fetch_bars(
                &ctx.config.trading.symbol,
                crate::types::Timeframe::M5,
                FACTOR_WINDOW as u32,
            )
            .await?;
        self.prices = bars.iter().map(|b| b.close).collect();
        Ok(())
    }

    pub async fn run_once(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        let price = ctx
            .price()
            .ok_or_else(|| EngineError::KernelRecoverable("no ticker this tick".into()))?;
        let now = ctx
            .now_ms()
            .ok_or_else(|| EngineError::KernelRecoverable("no venue time this tick".into()))?;

        self.prices.push(price);
        if self.prices.len() > FACTOR_WINDOW {
            let excess = self.prices.len() - FACTOR_WINDOW;
            self.prices.drain(..excess);
        }

        // Call throttle.
        if let Some(last) = self.last_call_at {
            if now - last < self.cfg.call_interval_seconds as i64 * 1000 {
                return Ok(());
            }
        }

        let prompt = self.factor_summary(ctx, price);
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| EngineError::KernelRecoverable("completion client missing".into()))?;

        self.last_call_at = Some(now);
        let raw = client.complete(SYSTEM_PROMPT, &prompt).await?;
        let verdict = parse_verdict(&raw)?;
        debug!(
            signal = %verdict.signal,
            confidence = verdict.confidence,
            risk = %verdict.risk_level,
            "llm verdict"
        );

        let prediction = verdict.prediction();
        if prediction.confidence < self.cfg.confidence_threshold {
            return Ok(());
        }
        let Some(direction) = prediction.direction else {
            return Ok(());
        };

        match ctx.position {
            None => ctx.request_trade(TradeKind::Open, direction, self.cfg.order_notional),
            Some(pos) if pos.side != direction => {
                warn!(held = %pos.side, predicted = %direction, "llm exit on opposite signal");
                ctx.request_close(pos.side);
            }
            Some(_) => {}
        }

        Ok(())
    }

    pub fn on_trade(&mut self, _trade: &TradeRecord) {}

    /// Compact market summary the model reasons over.
    fn factor_summary(&self, ctx: &StrategyContext<'_>, price: f64) -> String {
        let change_pct = self
            .prices
            .first()
            .filter(|&&p| p > 0.0)
            .map(|&first| (price - first) / first * 100.0)
            .unwrap_or(0.0);
        let rsi = calculate_rsi(&self.prices, 14)
            .last()
            .copied()
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "n/a".into());
        let sma20 = latest_sma(&self.prices, 20)
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "n/a".into());
        let position = match ctx.position {
            Some(pos) => format!(
                "{} {:.6} @ {:.2} ({:+.2}%)",
                pos.side,
                pos.qty,
                pos.entry_price,
                pos.unrealized_pnl_pct()
            ),
            None => "flat".into(),
        };

        format!(
            "Symbol: {}\nPrice: {:.2}\nChange over window: {:+.2}%\nRSI(14): {}\nSMA(20): {}\nOpen position: {}\nDecide the next action.",
            ctx.config.trading.symbol, price, change_pct, rsi, sma20, position
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::sim::SimulatedExchange;
    use crate::exchange::ExchangeAdapter;
    use crate::types::Ticker;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn config(threshold: f64, interval: u64) -> StrategyConfig {
        StrategyConfig::parse(&json!({
            "kernel": "llm",
            "trading": {"symbol": "BTCUSDT"},
            "llm": {"model": "test-model", "callIntervalSeconds": interval,
                    "confidenceThreshold": threshold, "orderNotional": 100.0}
        }))
        .unwrap()
    }

    fn ticker(price: f64, ts: i64) -> Ticker {
        Ticker {
            bid: price,
            ask: price,
            last: price,
            mark: price,
            timestamp: ts,
        }
    }

    fn exchange() -> Arc<dyn ExchangeAdapter> {
        Arc::new(SimulatedExchange::new("BTCUSDT", Vec::new(), 0, 0.0))
    }

    /// Scripted transport; records how many calls were made.
    struct Scripted {
        responses: Mutex<Vec<String>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for Scripted {
        async fn complete(&self, _system: &str, _user: &str) -> EngineResult<String> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(EngineError::KernelRecoverable("script exhausted".into()));
            }
            Ok(responses.remove(0))
        }
    }

    // ---- parse_verdict ----------------------------------------------------

    #[test]
    fn parses_plain_json() {
        let verdict = parse_verdict(
            r#"{"signal": "long", "confidence": 0.8, "reasoning": "up", "risk_level": "low"}"#,
        )
        .unwrap();
        assert_eq!(verdict.signal, "long");
        assert_eq!(verdict.prediction().direction, Some(Side::Long));
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"signal\": \"short\", \"confidence\": 0.7}\n```";
        let verdict = parse_verdict(raw).unwrap();
        assert_eq!(verdict.prediction().direction, Some(Side::Short));
    }

    #[test]
    fn rejects_prose() {
        let err = parse_verdict("I think you should buy.").unwrap_err();
        assert_eq!(err.kind(), "kernel_recoverable");
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        assert!(parse_verdict(r#"{"signal": "long", "confidence": 1.7}"#).is_err());
    }

    #[test]
    fn rejects_unknown_signal() {
        assert!(parse_verdict(r#"{"signal": "yolo", "confidence": 0.9}"#).is_err());
    }

    #[test]
    fn hold_maps_to_no_direction() {
        let verdict = parse_verdict(r#"{"signal": "hold", "confidence": 0.9}"#).unwrap();
        assert_eq!(verdict.prediction().direction, None);
    }

    // ---- kernel -----------------------------------------------------------

    #[tokio::test]
    async fn confident_signal_opens_position() {
        let cfg = config(0.6, 300);
        let ex = exchange();
        let mut kernel = LlmKernel::new(&cfg).unwrap().with_client(Box::new(Scripted::new(vec![
            r#"{"signal": "long", "confidence": 0.8, "reasoning": "momentum", "risk_level": "low"}"#,
        ])));

        let t = ticker(50_000.0, 1_000);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Open);
        assert_eq!(reqs[0].side, Side::Long);
    }

    #[tokio::test]
    async fn low_confidence_holds() {
        let cfg = config(0.6, 300);
        let ex = exchange();
        let mut kernel = LlmKernel::new(&cfg).unwrap().with_client(Box::new(Scripted::new(vec![
            r#"{"signal": "long", "confidence": 0.4}"#,
        ])));

        let t = ticker(50_000.0, 1_000);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());
    }

    #[tokio::test]
    async fn malformed_response_is_recoverable_and_trades_nothing() {
        let cfg = config(0.6, 300);
        let ex = exchange();
        let mut kernel = LlmKernel::new(&cfg)
            .unwrap()
            .with_client(Box::new(Scripted::new(vec!["buy now!!"])));

        let t = ticker(50_000.0, 1_000);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        let err = kernel.run_once(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind(), "kernel_recoverable");
        assert!(ctx.take_requests().is_empty());
    }

    /// Box-able handle that leaves the script observable from the test.
    struct Shared(Arc<Scripted>);

    #[async_trait]
    impl CompletionClient for Shared {
        async fn complete(&self, system: &str, user: &str) -> EngineResult<String> {
            self.0.complete(system, user).await
        }
    }

    #[tokio::test]
    async fn call_interval_throttles_the_endpoint() {
        let cfg = config(0.9, 300); // high threshold: no trades, just calls
        let ex = exchange();
        let scripted = Arc::new(Scripted::new(vec![
            r#"{"signal": "hold", "confidence": 0.1}"#,
            r#"{"signal": "hold", "confidence": 0.1}"#,
        ]));
        let mut kernel = LlmKernel::new(&cfg)
            .unwrap()
            .with_client(Box::new(Shared(scripted.clone())));

        // t=0s: first call. t=100s: throttled. t=301s: second call.
        for ts in [0i64, 100_000, 301_000] {
            let t = ticker(50_000.0, ts);
            let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
            kernel.run_once(&mut ctx).await.unwrap();
        }
        assert_eq!(*scripted.calls.lock().unwrap(), 2);
    }
}
