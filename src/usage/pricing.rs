//! Cost estimation for finished calls.

use crate::models::{ModelPrice, TokenTotals};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Turns a finished call's consumption into USD.
pub trait CostEstimator: Send + Sync {
    fn estimate_cost(
        &self,
        model_id: &str,
        tokens: Option<&TokenTotals>,
        response_images: u64,
        image_size: Option<&str>,
    ) -> f64;
}

impl<F> CostEstimator for F
where
    F: Fn(&str, Option<&TokenTotals>, u64, Option<&str>) -> f64 + Send + Sync,
{
    fn estimate_cost(
        &self,
        model_id: &str,
        tokens: Option<&TokenTotals>,
        response_images: u64,
        image_size: Option<&str>,
    ) -> f64 {
        self(model_id, tokens, response_images, image_size)
    }
}

/// Price table keyed by model id.
///
/// Versioned ids reported by providers ("gpt-4o-mini-2024-07-18") fall back
/// to the longest configured id they start with.
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
    warned: Mutex<HashSet<String>>,
}

impl PriceTable {
    pub fn new(prices: Vec<ModelPrice>) -> Self {
        Self {
            prices: prices.into_iter().map(|p| (p.id.clone(), p)).collect(),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Find the price entry for a model id.
    pub fn lookup(&self, model_id: &str) -> Option<&ModelPrice> {
        if let Some(price) = self.prices.get(model_id) {
            return Some(price);
        }

        self.prices
            .values()
            .filter(|p| model_id.starts_with(p.id.as_str()))
            .max_by_key(|p| p.id.len())
    }

    fn warn_once(&self, model_id: &str) {
        if self.warned.lock().insert(model_id.to_string()) {
            warn!(model = model_id, "No pricing configured, cost counted as 0");
        }
    }
}

fn per_million(tokens: u64, price_per_1m: f64) -> f64 {
    (tokens as f64 / 1_000_000.0) * price_per_1m
}

impl CostEstimator for PriceTable {
    fn estimate_cost(
        &self,
        model_id: &str,
        tokens: Option<&TokenTotals>,
        response_images: u64,
        image_size: Option<&str>,
    ) -> f64 {
        let Some(price) = self.lookup(model_id) else {
            self.warn_once(model_id);
            return 0.0;
        };

        let mut cost = 0.0;

        if let Some(tokens) = tokens {
            let cached = tokens.cached.min(tokens.prompt);
            let uncached_prompt = tokens.prompt - cached;
            let cached_price = price
                .cached_input_price_per_1m
                .unwrap_or(price.input_price_per_1m);
            let thinking_price = price
                .thinking_price_per_1m
                .unwrap_or(price.output_price_per_1m);

            cost += per_million(
                uncached_prompt.saturating_add(tokens.tool_use_prompt),
                price.input_price_per_1m,
            );
            cost += per_million(cached, cached_price);
            cost += per_million(
                tokens.response.saturating_add(tokens.response_image_tokens),
                price.output_price_per_1m,
            );
            cost += per_million(tokens.thinking, thinking_price);
        }

        if response_images > 0 {
            let multiplier = image_size
                .and_then(|size| price.image_size_multipliers.get(size))
                .copied()
                .unwrap_or(1.0);
            cost += response_images as f64 * price.price_per_image * multiplier;
        }

        cost
    }
}
