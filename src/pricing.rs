//! Pricing and cost aggregation
//!
//! Rates are expressed per million tokens. A model slug missing from the table
//! falls back to the designated default model, then to a built-in last-resort
//! rate; every fallback is reported through [`RateSource`] and an annotation.
//! Costs are accumulated as [`Decimal`] and only rounded for display.

use crate::models::{Annotation, ModelId, ModelUsage, RateSource, TokenTotals};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

const TOKENS_PER_MILLION: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Overrides the configured thought multiplier for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_multiplier: Option<f64>,
}

impl ModelRate {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
            thought_multiplier: None,
        }
    }
}

/// Used when neither the model nor the default model is priced.
pub const LAST_RESORT_RATE: ModelRate = ModelRate::new(10.0, 40.0);

pub const DEFAULT_PRICING_MODEL: &str = "o3";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRate<'a> {
    pub rate: ModelRate,
    pub source: RateSource,
    /// Slug whose rates were used, `None` for the last-resort rate.
    pub rate_model: Option<&'a str>,
}

/// A `models` table given in configuration replaces the built-in one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingTable {
    pub default_model: String,
    pub last_resort: ModelRate,
    pub models: BTreeMap<String, ModelRate>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PricingTable {
    pub fn new(default_model: impl Into<String>, last_resort: ModelRate) -> Self {
        Self {
            default_model: default_model.into(),
            last_resort,
            models: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, slug: impl Into<String>, rate: ModelRate) -> Self {
        self.models.insert(slug.into(), rate);
        self
    }

    /// Published rates for the models commonly found in chat exports.
    pub fn builtin() -> Self {
        Self::new(DEFAULT_PRICING_MODEL, LAST_RESORT_RATE)
            .with_model("gpt-4o", ModelRate::new(2.5, 10.0))
            .with_model("research", ModelRate::new(10.0, 40.0))
            .with_model("o3", ModelRate::new(10.0, 40.0))
            .with_model("o1-pro", ModelRate::new(150.0, 600.0))
            .with_model("gpt-4-5", ModelRate::new(75.0, 150.0))
            .with_model("o1", ModelRate::new(15.0, 60.0))
            .with_model("o1-preview", ModelRate::new(15.0, 60.0))
    }

    pub fn get(&self, slug: &str) -> Option<&ModelRate> {
        self.models.get(slug)
    }

    /// Literal slug, then the default model, then the last-resort rate.
    pub fn resolve(&self, model: &ModelId) -> ResolvedRate<'_> {
        if let Some((slug, rate)) = model.slug().and_then(|s| self.models.get_key_value(s)) {
            return ResolvedRate {
                rate: *rate,
                source: RateSource::Exact,
                rate_model: Some(slug.as_str()),
            };
        }

        if let Some(rate) = self.models.get(&self.default_model) {
            return ResolvedRate {
                rate: *rate,
                source: RateSource::DefaultModel,
                rate_model: Some(self.default_model.as_str()),
            };
        }

        ResolvedRate {
            rate: self.last_resort,
            source: RateSource::LastResort,
            rate_model: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let check = |name: &str, rate: &ModelRate| -> anyhow::Result<()> {
            if !(rate.input_per_million >= 0.0 && rate.output_per_million >= 0.0) {
                anyhow::bail!("Pricing for {} must have non-negative rates", name);
            }
            if let Some(m) = rate.thought_multiplier {
                if !(m >= 0.0) {
                    anyhow::bail!("Thought multiplier for {} must be non-negative", name);
                }
            }
            Ok(())
        };

        check("last_resort", &self.last_resort)?;
        for (slug, rate) in &self.models {
            check(slug, rate)?;
        }
        Ok(())
    }
}

/// Converts a configured float into a decimal; non-finite values become zero.
pub fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

/// `tokens * rate_per_million / 1_000_000`.
pub fn cost_of(tokens: Decimal, rate_per_million: f64) -> Decimal {
    tokens * to_decimal(rate_per_million) / Decimal::from(TOKENS_PER_MILLION)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Charge {
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub source: RateSource,
}

impl Charge {
    pub fn total(&self) -> Decimal {
        self.input_cost + self.output_cost
    }
}

#[derive(Debug, Clone, Default)]
pub struct CostSummary {
    pub models: BTreeMap<ModelId, ModelUsage>,
    pub tokens: TokenTotals,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub total_cost: Decimal,
    pub approximate: bool,
    pub annotations: Vec<Annotation>,
}

/// Accumulates charges for one conversation, keyed by model.
pub struct CostAggregator<'a> {
    pricing: &'a PricingTable,
    thought_multiplier: f64,
    models: BTreeMap<ModelId, ModelUsage>,
    annotated: HashSet<ModelId>,
    annotations: Vec<Annotation>,
}

impl<'a> CostAggregator<'a> {
    pub fn new(pricing: &'a PricingTable, thought_multiplier: f64) -> Self {
        Self {
            pricing,
            thought_multiplier,
            models: BTreeMap::new(),
            annotated: HashSet::new(),
            annotations: Vec::new(),
        }
    }

    /// Bills `tokens` against `model`. Thought tokens are billed as output,
    /// scaled by the thought multiplier; `input_scale` discounts the input rate.
    pub fn record(&mut self, model: &ModelId, messages: usize, tokens: TokenTotals, input_scale: Decimal) -> Charge {
        let resolved = self.pricing.resolve(model);

        if resolved.source.is_approximate() && self.annotated.insert(model.clone()) {
            warn!(
                model = %model,
                source = ?resolved.source,
                rate_model = resolved.rate_model.unwrap_or("built-in"),
                "No pricing for model, using fallback rate"
            );
            self.annotations.push(Annotation::PriceFallback {
                model: model.to_string(),
                source: resolved.source,
                rate_model: resolved.rate_model.map(str::to_string),
            });
        }

        let multiplier = resolved.rate.thought_multiplier.unwrap_or(self.thought_multiplier);
        let billed_output = Decimal::from(tokens.output) + Decimal::from(tokens.thought) * to_decimal(multiplier);

        let charge = Charge {
            input_cost: cost_of(Decimal::from(tokens.input), resolved.rate.input_per_million) * input_scale,
            output_cost: cost_of(billed_output, resolved.rate.output_per_million),
            source: resolved.source,
        };

        let usage = self.models.entry(model.clone()).or_default();
        usage.merge(&ModelUsage {
            messages,
            tokens,
            input_cost: charge.input_cost,
            output_cost: charge.output_cost,
            cost: charge.total(),
            rate_source: resolved.source,
        });

        charge
    }

    pub fn finish(self) -> CostSummary {
        let mut summary = CostSummary {
            approximate: !self.annotations.is_empty(),
            annotations: self.annotations,
            ..Default::default()
        };

        for usage in self.models.values() {
            summary.tokens.add(&usage.tokens);
            summary.input_cost += usage.input_cost;
            summary.output_cost += usage.output_cost;
            summary.total_cost += usage.cost;
        }
        summary.models = self.models;
        summary
    }
}
