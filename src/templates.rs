// =============================================================================
// Template registry — seed documents for new strategy definitions
// =============================================================================
//
// An immutable catalog, built once at startup. Templates only ever seed new
// strategy definitions; nothing at runtime reads them again.
// =============================================================================

use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub config: serde_json::Value,
}

pub struct TemplateRegistry {
    templates: Vec<Template>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: build_catalog(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn list(&self) -> &[Template] {
        &self.templates
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_catalog() -> Vec<Template> {
    vec![
        Template {
            id: "martingale-btc",
            name: "Martingale BTC",
            description: "Averages down on 5% drawdowns with doubling size.",
            category: "averaging",
            config: json!({
                "kernel": "martingale",
                "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 10,
                            "reconcileOnStart": "close"},
                "risk": {"stopLossPercent": 15.0, "takeProfitPercent": 20.0,
                         "maxLossPercent": 30.0},
                "monitoring": {"checkIntervalSeconds": 5.0, "pricePrecision": 2},
                "martingale": {"initialPosition": 200.0, "multiplier": 2.0, "maxAdditions": 5},
                "trigger": {"priceDropPercent": 5.0, "startImmediately": true}
            }),
        },
        Template {
            id: "dca-hourly",
            name: "Hourly DCA",
            description: "Buys a fixed notional every hour below a price ceiling.",
            category: "averaging",
            config: json!({
                "kernel": "dca",
                "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 1},
                "risk": {"stopLossPercent": 25.0, "takeProfitPercent": 50.0,
                         "maxLossPercent": 40.0},
                "monitoring": {"checkIntervalSeconds": 30.0},
                "dca": {"amountPerInterval": 50.0, "intervalSeconds": 3600,
                        "priceCeiling": 80000.0, "maxInvestment": 2000.0}
            }),
        },
        Template {
            id: "grid-range",
            name: "Range Grid",
            description: "Buys level crossings down, sells them back on the way up.",
            category: "market-structure",
            config: json!({
                "kernel": "grid",
                "trading": {"symbol": "ETHUSDT", "side": "long", "leverage": 3},
                "risk": {"stopLossPercent": 20.0, "takeProfitPercent": 60.0,
                         "maxLossPercent": 35.0},
                "monitoring": {"checkIntervalSeconds": 5.0},
                "grid": {"priceLow": 2000.0, "priceHigh": 3000.0, "levels": 11,
                         "orderNotional": 100.0}
            }),
        },
        Template {
            id: "trend-ma-cross",
            name: "MA Cross Trend",
            description: "Follows fast/slow moving-average crossovers both ways.",
            category: "trend",
            config: json!({
                "kernel": "trend",
                "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 5},
                "risk": {"stopLossPercent": 8.0, "takeProfitPercent": 25.0,
                         "maxLossPercent": 25.0},
                "monitoring": {"checkIntervalSeconds": 15.0},
                "trend": {"fastPeriod": 9, "slowPeriod": 21, "timeframe": "15m",
                          "orderNotional": 300.0}
            }),
        },
        Template {
            id: "mean-reversion-band",
            name: "Mean Reversion",
            description: "Fades 2% deviations from the 20-bar average.",
            category: "mean-reversion",
            config: json!({
                "kernel": "meanReversion",
                "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 3},
                "risk": {"stopLossPercent": 6.0, "takeProfitPercent": 12.0,
                         "maxLossPercent": 20.0},
                "monitoring": {"checkIntervalSeconds": 10.0},
                "meanReversion": {"period": 20, "deviationPct": 2.0, "timeframe": "5m",
                                  "orderNotional": 200.0}
            }),
        },
        Template {
            id: "ml-random-forest",
            name: "Random Forest Classifier",
            description: "Trades high-confidence directional predictions from a seeded forest.",
            category: "model",
            config: json!({
                "kernel": "ml",
                "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 5},
                "risk": {"stopLossPercent": 5.0, "takeProfitPercent": 10.0,
                         "maxLossPercent": 20.0},
                "monitoring": {"checkIntervalSeconds": 30.0},
                "ml": {"lookback": 240, "confidenceThreshold": 0.65,
                       "retrainIntervalTicks": 120, "trees": 25, "maxDepth": 4,
                       "seed": 42, "timeframe": "5m", "orderNotional": 250.0}
            }),
        },
        Template {
            id: "llm-analyst",
            name: "LLM Analyst",
            description: "Asks a completion model for a structured signal every five minutes.",
            category: "model",
            config: json!({
                "kernel": "llm",
                "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 3},
                "risk": {"stopLossPercent": 5.0, "takeProfitPercent": 10.0,
                         "maxLossPercent": 15.0},
                "monitoring": {"checkIntervalSeconds": 30.0},
                "llm": {"model": "anthropic/claude-sonnet-4", "apiKeyEnv": "LLM_API_KEY",
                        "callIntervalSeconds": 300, "confidenceThreshold": 0.6,
                        "orderNotional": 150.0}
            }),
        },
    ]
}
