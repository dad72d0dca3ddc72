use crate::{
    config::{ModelPricing, PricingConfig},
    model::TokenCounts,
};
use std::collections::HashMap;

/// Per-model price table. Model keys are matched exactly first, then by the
/// longest key that prefixes the normalized model name.
#[derive(Debug, Clone)]
pub struct PricingTable {
    currency: String,
    default: ModelPricing,
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn from_config(config: &PricingConfig) -> Self {
        let models = config
            .models
            .iter()
            .map(|(model, pricing)| (model.to_ascii_lowercase(), pricing.clone()))
            .collect();
        Self {
            currency: config.currency.clone(),
            default: config.default.clone(),
            models,
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn lookup(&self, model: &str) -> Option<&ModelPricing> {
        if let Some(pricing) = self.models.get(model) {
            return Some(pricing);
        }
        self.models
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, pricing)| pricing)
    }

    /// USD cost of `tokens` for `model`. A provider-reported cost is taken as
    /// is; otherwise the table rates apply, falling back to the default rates.
    pub fn estimate(&self, model: &str, tokens: &TokenCounts, reported: Option<f64>) -> f64 {
        match reported {
            Some(cost) => cost,
            None => cost_for(self.lookup(model).unwrap_or(&self.default), tokens),
        }
    }
}

fn cost_for(pricing: &ModelPricing, tokens: &TokenCounts) -> f64 {
    let cache_write_rate = pricing.cache_write_per_1m.unwrap_or(pricing.input_per_1m);
    let cache_read_rate = pricing.cache_read_per_1m.unwrap_or(pricing.input_per_1m);
    (tokens.input_tokens as f64 * pricing.input_per_1m
        + tokens.output_tokens as f64 * pricing.output_per_1m
        + tokens.cache_write_tokens as f64 * cache_write_rate
        + tokens.cache_read_tokens as f64 * cache_read_rate)
        / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::DEFAULT_MODEL;

    fn table() -> PricingTable {
        let mut models = HashMap::new();
        models.insert(
            "claude-opus-4".to_string(),
            ModelPricing {
                input_per_1m: 15.0,
                output_per_1m: 75.0,
                cache_write_per_1m: Some(18.75),
                cache_read_per_1m: Some(1.5),
            },
        );
        models.insert(
            "claude-opus-4-5".to_string(),
            ModelPricing {
                input_per_1m: 5.0,
                output_per_1m: 25.0,
                cache_write_per_1m: None,
                cache_read_per_1m: None,
            },
        );
        PricingTable::from_config(&PricingConfig {
            currency: "USD".to_string(),
            default: ModelPricing {
                input_per_1m: 1.0,
                output_per_1m: 2.0,
                cache_write_per_1m: None,
                cache_read_per_1m: None,
            },
            models,
        })
    }

    fn tokens(input: u64, output: u64, write: u64, read: u64) -> TokenCounts {
        TokenCounts {
            input_tokens: input,
            output_tokens: output,
            cache_write_tokens: write,
            cache_read_tokens: read,
        }
    }

    #[test]
    fn exact_and_longest_prefix_lookup() {
        let table = table();
        assert_eq!(table.lookup("claude-opus-4").unwrap().input_per_1m, 15.0);
        assert_eq!(table.lookup("claude-opus-4-1").unwrap().input_per_1m, 15.0);
        assert_eq!(table.lookup("claude-opus-4-5").unwrap().input_per_1m, 5.0);
        assert!(table.lookup("gpt-4.1").is_none());
    }

    #[test]
    fn estimate_uses_all_token_classes() {
        let usage = tokens(1_000_000, 100_000, 200_000, 1_000_000);
        let cost = table().estimate("claude-opus-4", &usage, None);
        let expected = 15.0 + 7.5 + 3.75 + 1.5;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn cache_rates_fall_back_to_input_rate() {
        let usage = tokens(0, 0, 1_000_000, 1_000_000);
        let cost = table().estimate("claude-opus-4-5", &usage, None);
        assert!((cost - 10.0).abs() < 1e-9);
    }

    #[test]
    fn reported_cost_wins_over_table_rates() {
        let table = table();
        let usage = tokens(1_000_000, 1_000_000, 0, 0);
        assert!((table.estimate("claude-opus-4", &usage, Some(0.42)) - 0.42).abs() < 1e-9);
        assert!((table.estimate("mystery-model", &usage, Some(0.42)) - 0.42).abs() < 1e-9);
        assert!((table.estimate(DEFAULT_MODEL, &usage, Some(9.0)) - 9.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_without_reported_cost_uses_default_rates() {
        let usage = tokens(1_000_000, 1_000_000, 0, 0);
        assert!((table().estimate("mystery-model", &usage, None) - 3.0).abs() < 1e-9);
    }
}
