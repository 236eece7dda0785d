//! Cost estimation from the pricing table. Prices are configured in USD per
//! 1M tokens and held internally as USD micros per token so the arithmetic
//! stays integral.

use std::collections::HashMap;

use crate::config::ModelsConfig;
use crate::types::Usage;

#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    entries: HashMap<(String, String), ModelPricing>,
}

#[derive(Clone, Copy, Debug)]
pub struct ModelPricing {
    pub input_usd_micros_per_token: u64,
    pub output_usd_micros_per_token: u64,
}

impl PricingTable {
    pub fn from_models_config(config: &ModelsConfig) -> Self {
        let mut entries = HashMap::new();
        for (alias, providers) in &config.pricing {
            for (provider, price) in providers {
                entries.insert(
                    (alias.clone(), provider.clone()),
                    ModelPricing {
                        input_usd_micros_per_token: usd_per_million_to_micros(price.input),
                        output_usd_micros_per_token: usd_per_million_to_micros(price.output),
                    },
                );
            }
        }
        Self { entries }
    }

    pub fn pricing(&self, alias: &str, provider: &str) -> Option<ModelPricing> {
        self.entries
            .get(&(alias.to_string(), provider.to_string()))
            .copied()
    }

    /// Estimated cost in USD micros, `None` when the pair is unpriced.
    pub fn estimate_usd_micros(&self, alias: &str, provider: &str, usage: Usage) -> Option<u64> {
        let pricing = self.pricing(alias, provider)?;
        let input =
            u64::from(usage.prompt_tokens).saturating_mul(pricing.input_usd_micros_per_token);
        let output =
            u64::from(usage.completion_tokens).saturating_mul(pricing.output_usd_micros_per_token);
        Some(input.saturating_add(output))
    }
}

/// USD per 1M tokens → USD micros per token. The two scale factors cancel,
/// so this is a straight rounding of the configured value.
fn usd_per_million_to_micros(usd_per_million: f64) -> u64 {
    if !usd_per_million.is_finite() || usd_per_million <= 0.0 {
        return 0;
    }
    usd_per_million.round() as u64
}

pub fn usd_micros_to_usd(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

pub fn usd_micros_to_cents(micros: u64) -> i64 {
    (micros / 10_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceEntry;

    fn table() -> PricingTable {
        let mut config = ModelsConfig::default();
        let mut by_provider = HashMap::new();
        // $30/1M input, $60/1M output.
        by_provider.insert(
            "openai".to_string(),
            PriceEntry {
                input: 30.0,
                output: 60.0,
            },
        );
        config
            .pricing
            .insert("test-model".to_string(), by_provider);
        PricingTable::from_models_config(&config)
    }

    #[test]
    fn estimates_cost_from_usage() {
        let usage = Usage {
            prompt_tokens: 1_000,
            completion_tokens: 500,
            total_tokens: 1_500,
        };
        // 1000 * 30 + 500 * 60 = 60_000 micros = $0.06.
        let micros = table()
            .estimate_usd_micros("test-model", "openai", usage)
            .unwrap();
        assert_eq!(micros, 60_000);
        assert!((usd_micros_to_usd(micros) - 0.06).abs() < 1e-9);
        assert_eq!(usd_micros_to_cents(micros), 6);
    }

    #[test]
    fn unpriced_pair_yields_none() {
        assert!(table()
            .estimate_usd_micros("test-model", "anthropic", Usage::default())
            .is_none());
    }

    #[test]
    fn negative_or_nan_price_clamps_to_zero() {
        assert_eq!(usd_per_million_to_micros(-1.0), 0);
        assert_eq!(usd_per_million_to_micros(f64::NAN), 0);
    }
}
