//! Byte-to-token heuristic and per-model rates.
//!
//! Both are configuration data. [`RateLookup`] is the seam for callers that
//! want a different source of prices.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trail_core::config::{Rate, RollupConfig};

/// Tokens estimated from byte counts, with per-family ratios.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenHeuristic {
    default_ratio: f64,
    ratios: BTreeMap<String, f64>,
}

impl TokenHeuristic {
    pub fn new(default_ratio: f64, ratios: BTreeMap<String, f64>) -> Self {
        Self {
            default_ratio,
            ratios: ratios.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect(),
        }
    }

    pub fn from_config(config: &RollupConfig) -> Self {
        Self::new(config.default_tokens_per_byte, config.tokens_per_byte.clone())
    }

    pub fn ratio(&self, model: Option<&str>) -> f64 {
        model
            .and_then(|m| longest_match(&self.ratios, m))
            .copied()
            .unwrap_or(self.default_ratio)
    }

    pub fn estimate(&self, bytes: u64, model: Option<&str>) -> u64 {
        (bytes as f64 * self.ratio(model)).floor() as u64
    }
}

pub trait RateLookup: Send + Sync {
    /// Price for `model`, or `None` when it cannot be priced.
    fn rate_for(&self, model: Option<&str>) -> Option<Rate>;
}

/// Rates keyed by model-name fragment. The longest fragment contained in
/// the (lowercased) model name wins, so `gpt-4o-mini` beats `gpt-4o`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateTable {
    rates: BTreeMap<String, Rate>,
    default_rate: Option<Rate>,
}

impl RateTable {
    pub fn new(rates: BTreeMap<String, Rate>, default_rate: Option<Rate>) -> Self {
        Self {
            rates: rates.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect(),
            default_rate,
        }
    }

    pub fn from_config(config: &RollupConfig) -> Self {
        Self::new(config.rates.clone(), config.default_rate)
    }
}

impl RateLookup for RateTable {
    fn rate_for(&self, model: Option<&str>) -> Option<Rate> {
        model
            .and_then(|m| longest_match(&self.rates, m))
            .copied()
            .or(self.default_rate)
    }
}

fn longest_match<'a, V>(table: &'a BTreeMap<String, V>, model: &str) -> Option<&'a V> {
    let model = model.to_lowercase();
    table
        .iter()
        .filter(|(key, _)| model.contains(key.as_str()))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, value)| value)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "usd", rename_all = "snake_case")]
pub enum CostEstimate {
    Known(f64),
    Unknown,
}

impl CostEstimate {
    pub fn compute(rate: Option<Rate>, tokens_in: u64, tokens_out: u64) -> Self {
        match rate {
            Some(rate) => {
                let usd = tokens_in as f64 / 1000.0 * rate.input_per_1k
                    + tokens_out as f64 / 1000.0 * rate.output_per_1k;
                Self::Known(round6(usd))
            }
            None => Self::Unknown,
        }
    }

    pub fn known(&self) -> Option<f64> {
        match self {
            Self::Known(usd) => Some(*usd),
            Self::Unknown => None,
        }
    }
}

pub(crate) fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
