// =============================================================================
// ML-classifier kernel — random-forest direction prediction
// =============================================================================
//
// Pipeline per tick:
//   1. Append the tick price to a bounded history buffer.
//   2. Retrain when due (every `retrainIntervalTicks`, or when a forced
//      retrain is pending). Training happens inline but the previous forest
//      stays in service until the replacement is fully grown.
//   3. Extract the fixed feature vector and ask the forest for a direction
//      probability.
//   4. Request an entry when confidence >= `confidenceThreshold`; an opposite
//      signal at threshold closes the open position.
//
// Training is seeded (`ml.seed`) so identical bar sequences grow identical
// forests and backtests stay deterministic.
// =============================================================================

use std::collections::VecDeque;

use rand::prelude::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::config::{MlSection, StrategyConfig};
use crate::error::{EngineError, EngineResult};
use crate::indicators::{calculate_bollinger, calculate_ema, calculate_macd, calculate_rsi};
use crate::indicators::sma::latest_sma;
use crate::types::{Side, TradeKind, TradeRecord};

use super::{Prediction, StrategyContext};

/// Oldest history a feature vector needs.
const MIN_HISTORY: usize = 64;
/// Node split floor; below this a node becomes a leaf.
const MIN_SPLIT: usize = 8;
/// Candidate thresholds sampled per feature when growing a split.
const THRESHOLD_CANDIDATES: usize = 8;

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Fixed feature vector over a close-price history (most recent last):
/// SMA ratios, EMA ratio, RSI, MACD histogram, Bollinger %B, last return,
/// and rolling volatility. Returns `None` until `MIN_HISTORY` closes exist.
pub fn extract_features(closes: &[f64]) -> Option<Vec<f64>> {
    if closes.len() < MIN_HISTORY {
        return None;
    }
    let price = *closes.last()?;
    if price <= 0.0 {
        return None;
    }

    let sma5 = latest_sma(closes, 5)?;
    let sma10 = latest_sma(closes, 10)?;
    let sma20 = latest_sma(closes, 20)?;
    let ema12 = *calculate_ema(closes, 12).last()?;
    let rsi14 = *calculate_rsi(closes, 14).last()?;
    let macd = calculate_macd(closes, 12, 26, 9)?;
    let bb = calculate_bollinger(closes, 20, 2.0)?;

    let last_return = {
        let prev = closes[closes.len() - 2];
        if prev > 0.0 {
            (price - prev) / prev
        } else {
            0.0
        }
    };

    // Std-dev of the last 20 one-bar returns.
    let returns: Vec<f64> = closes[closes.len() - 21..]
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    let volatility = if returns.is_empty() {
        0.0
    } else {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64).sqrt()
    };

    let features = vec![
        sma5 / sma20 - 1.0,
        sma10 / sma20 - 1.0,
        ema12 / price - 1.0,
        rsi14 / 100.0,
        macd.histogram / price,
        bb.percent_b,
        last_return,
        volatility,
    ];
    features.iter().all(|f| f.is_finite()).then_some(features)
}

/// Training set: features at bar i, label = did bar i+1 close higher.
fn build_dataset(closes: &[f64]) -> (Vec<Vec<f64>>, Vec<bool>) {
    let mut samples = Vec::new();
    let mut labels = Vec::new();
    if closes.len() <= MIN_HISTORY {
        return (samples, labels);
    }
    for i in MIN_HISTORY..closes.len() {
        if i + 1 >= closes.len() {
            break;
        }
        if let Some(features) = extract_features(&closes[..=i]) {
            samples.push(features);
            labels.push(closes[i + 1] > closes[i]);
        }
    }
    (samples, labels)
}

// ---------------------------------------------------------------------------
// Random forest
// ---------------------------------------------------------------------------

enum TreeNode {
    Leaf {
        prob_up: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn predict(&self, features: &[f64]) -> f64 {
        match self {
            Self::Leaf { prob_up } => *prob_up,
            Self::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if features.get(*feature).copied().unwrap_or(0.0) <= *threshold {
                    left.predict(features)
                } else {
                    right.predict(features)
                }
            }
        }
    }
}

pub struct RandomForest {
    trees: Vec<TreeNode>,
}

impl RandomForest {
    /// Grow `n_trees` trees over bootstrap samples with random feature
    /// subsets at each split. Returns `None` when the dataset is too small to
    /// be worth anything.
    pub fn train(
        samples: &[Vec<f64>],
        labels: &[bool],
        n_trees: usize,
        max_depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> Option<Self> {
        if samples.len() < MIN_SPLIT * 2 || samples.len() != labels.len() {
            return None;
        }
        let n_features = samples[0].len();
        // Classic sqrt(d) feature subset per split.
        let k_features = ((n_features as f64).sqrt().round() as usize).max(1);

        let trees = (0..n_trees)
            .map(|_| {
                let indices: Vec<usize> = (0..samples.len())
                    .map(|_| rng.gen_range(0..samples.len()))
                    .collect();
                grow_tree(samples, labels, &indices, 0, max_depth, k_features, rng)
            })
            .collect();

        Some(Self { trees })
    }

    /// Probability in [0, 1] that the next bar closes higher.
    pub fn predict_up_probability(&self, features: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }
        let sum: f64 = self.trees.iter().map(|t| t.predict(features)).sum();
        sum / self.trees.len() as f64
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

fn grow_tree(
    samples: &[Vec<f64>],
    labels: &[bool],
    indices: &[usize],
    depth: usize,
    max_depth: usize,
    k_features: usize,
    rng: &mut ChaCha8Rng,
) -> TreeNode {
    let ups = indices.iter().filter(|&&i| labels[i]).count();
    let prob_up = ups as f64 / indices.len().max(1) as f64;

    // Stop on depth, node size, or purity.
    if depth >= max_depth || indices.len() < MIN_SPLIT || prob_up == 0.0 || prob_up == 1.0 {
        return TreeNode::Leaf { prob_up };
    }

    let n_features = samples[0].len();
    let mut feature_pool: Vec<usize> = (0..n_features).collect();
    feature_pool.shuffle(rng);
    feature_pool.truncate(k_features);

    let parent_gini = gini(prob_up);
    let mut best: Option<(usize, f64, f64)> = None; // (feature, threshold, score)

    for &feature in &feature_pool {
        for _ in 0..THRESHOLD_CANDIDATES {
            let pivot = indices[rng.gen_range(0..indices.len())];
            let threshold = samples[pivot][feature];

            let (mut left_n, mut left_up, mut right_n, mut right_up) = (0usize, 0usize, 0usize, 0usize);
            for &i in indices {
                if samples[i][feature] <= threshold {
                    left_n += 1;
                    left_up += labels[i] as usize;
                } else {
                    right_n += 1;
                    right_up += labels[i] as usize;
                }
            }
            if left_n == 0 || right_n == 0 {
                continue;
            }

            let total = indices.len() as f64;
            let score = left_n as f64 / total * gini(left_up as f64 / left_n as f64)
                + right_n as f64 / total * gini(right_up as f64 / right_n as f64);

            if best.map_or(true, |(_, _, s)| score < s) {
                best = Some((feature, threshold, score));
            }
        }
    }

    let Some((feature, threshold, score)) = best else {
        return TreeNode::Leaf { prob_up };
    };
    if score >= parent_gini {
        // No impurity gain; splitting further only memorizes noise.
        return TreeNode::Leaf { prob_up };
    }

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
        .iter()
        .copied()
        .partition(|&i| samples[i][feature] <= threshold);

    TreeNode::Split {
        feature,
        threshold,
        left: Box::new(grow_tree(
            samples, labels, &left_idx, depth + 1, max_depth, k_features, rng,
        )),
        right: Box::new(grow_tree(
            samples, labels, &right_idx, depth + 1, max_depth, k_features, rng,
        )),
    }
}

fn gini(p: f64) -> f64 {
    2.0 * p * (1.0 - p)
}

// ---------------------------------------------------------------------------
// Oracle seam
// ---------------------------------------------------------------------------

/// Direction source behind the kernel; the forest in production, a script in
/// tests.
pub trait DirectionOracle: Send {
    fn predict(&self, features: &[f64]) -> Option<Prediction>;
}

impl DirectionOracle for RandomForest {
    fn predict(&self, features: &[f64]) -> Option<Prediction> {
        let prob_up = self.predict_up_probability(features);
        let (direction, confidence) = if prob_up >= 0.5 {
            (Some(Side::Long), prob_up)
        } else {
            (Some(Side::Short), 1.0 - prob_up)
        };
        Some(Prediction {
            direction,
            confidence,
        })
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

pub struct MlKernel {
    cfg: MlSection,
    prices: VecDeque<f64>,
    forest: Option<RandomForest>,
    ticks_since_train: u32,
    retrain_pending: bool,
    /// Test seam; when set, training is skipped and this oracle answers.
    override_oracle: Option<Box<dyn DirectionOracle>>,
}

impl MlKernel {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        let cfg = config
            .ml
            .clone()
            .ok_or_else(|| EngineError::Config("ml section missing".into()))?;
        Ok(Self {
            cfg,
            prices: VecDeque::new(),
            forest: None,
            ticks_since_train: 0,
            retrain_pending: false,
            override_oracle: None,
        })
    }

    /// Replace the forest with a scripted oracle (tests only).
    #[cfg(test)]
    pub fn with_oracle(mut self, oracle: Box<dyn DirectionOracle>) -> Self {
        self.override_oracle = Some(oracle);
        self
    }

    /// Idempotent: the next tick rebuilds the model regardless of cadence.
    pub fn force_retrain(&mut self) {
        self.retrain_pending = true;
    }

    pub async fn initialize(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        let bars = ctx
            .exchange
            .fetch_bars(
                &ctx.config.trading.symbol,
                self.cfg.timeframe,
                self.cfg.lookback as u32,
            )
            .await?;
        self.prices = bars.iter().map(|b| b.close).collect();
        self.trim_buffer();
        self.retrain();
        info!(
            history = self.prices.len(),
            trained = self.forest.is_some(),
            "ml kernel primed"
        );
        Ok(())
    }

    pub async fn run_once(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        let price = ctx
            .price()
            .ok_or_else(|| EngineError::KernelRecoverable("no ticker this tick".into()))?;
        self.prices.push_back(price);
        self.trim_buffer();

        self.ticks_since_train += 1;
        if self.override_oracle.is_none()
            && (self.forest.is_none()
                || self.retrain_pending
                || self.ticks_since_train >= self.cfg.retrain_interval_ticks)
        {
            self.retrain();
        }

        let closes: Vec<f64> = self.prices.iter().copied().collect();
        let Some(features) = extract_features(&closes) else {
            return Ok(());
        };

        let prediction = match (&self.override_oracle, &self.forest) {
            (Some(oracle), _) => oracle.predict(&features),
            (None, Some(forest)) => forest.predict(&features),
            (None, None) => None,
        };
        let Some(prediction) = prediction else {
            return Ok(());
        };

        if prediction.confidence < self.cfg.confidence_threshold {
            return Ok(());
        }
        let Some(direction) = prediction.direction else {
            return Ok(());
        };

        match ctx.position {
            None => {
                debug!(
                    direction = %direction,
                    confidence = prediction.confidence,
                    "classifier entry"
                );
                ctx.request_trade(TradeKind::Open, direction, self.cfg.order_notional);
            }
            Some(pos) if pos.side != direction => {
                debug!(
                    held = %pos.side,
                    predicted = %direction,
                    confidence = prediction.confidence,
                    "classifier exit on opposite signal"
                );
                ctx.request_close(pos.side);
            }
            Some(_) => {}
        }

        Ok(())
    }

    pub fn on_trade(&mut self, _trade: &TradeRecord) {}

    /// Grow a replacement forest; the current one stays live until the new
    /// one is ready, so a thin dataset never leaves the kernel model-less.
    fn retrain(&mut self) {
        self.retrain_pending = false;
        self.ticks_since_train = 0;

        let closes: Vec<f64> = self.prices.iter().copied().collect();
        let (samples, labels) = build_dataset(&closes);
        let mut rng = ChaCha8Rng::seed_from_u64(self.cfg.seed);
        match RandomForest::train(&samples, &labels, self.cfg.trees, self.cfg.max_depth, &mut rng)
        {
            Some(forest) => {
                debug!(
                    samples = samples.len(),
                    trees = forest.tree_count(),
                    "forest retrained"
                );
                self.forest = Some(forest);
            }
            None => {
                debug!(samples = samples.len(), "dataset too small, keeping old model");
            }
        }
    }

    fn trim_buffer(&mut self) {
        while self.prices.len() > self.cfg.lookback {
            self.prices.pop_front();
        }
    }
}
