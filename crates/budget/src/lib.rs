//! Tracks spend against a dollar ceiling and prices individual LLM calls.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PricingEntry {
    pub input_cost_per_m: f64,
    pub output_cost_per_m: f64,
}

#[derive(Debug, Deserialize)]
struct PricingFile {
    models: HashMap<String, PricingEntry>,
}

/// `model -> (input_per_million, output_per_million)` lookup table.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
    fallback: PricingEntry,
}

impl PricingTable {
    /// Loads the table from `path` if given and readable; otherwise
    /// falls back to a small built-in table and logs a stale-pricing
    /// warning, per spec §4.5.
    pub fn load(path: Option<&Path>) -> Self {
        if let Some(path) = path {
            match std::fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str::<PricingFile>(&contents) {
                    Ok(file) => return Self { entries: file.models, fallback: builtin_fallback_entry() },
                    Err(e) => warn!(path = %path.display(), error = %e, "pricing file malformed, using built-in stale pricing"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "pricing file unreadable, using built-in stale pricing"),
            }
        } else {
            warn!("no pricing_path configured, using built-in stale pricing");
        }
        Self::builtin()
    }

    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        entries.insert("gpt-4o-mini".to_string(), PricingEntry { input_cost_per_m: 0.15, output_cost_per_m: 0.60 });
        entries.insert("gpt-4o".to_string(), PricingEntry { input_cost_per_m: 2.50, output_cost_per_m: 10.00 });
        entries.insert("gpt-3.5-turbo".to_string(), PricingEntry { input_cost_per_m: 0.50, output_cost_per_m: 1.50 });
        Self { entries, fallback: builtin_fallback_entry() }
    }

    /// Entry used for an unrecognized model, so `cost()` never panics
    /// and never silently charges nothing for an unknown model.
    fn entry_for(&self, model: &str) -> PricingEntry {
        self.entries.get(model).copied().unwrap_or(self.fallback)
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let entry = self.entry_for(model);
        let input_cost = (input_tokens as f64 / 1_000_000.0) * entry.input_cost_per_m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * entry.output_cost_per_m;
        input_cost + output_cost
    }
}

fn builtin_fallback_entry() -> PricingEntry {
    PricingEntry { input_cost_per_m: 1.0, output_cost_per_m: 1.0 }
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("budget ceiling exceeded: spent {spent:.4}, limit {limit:.4}")]
    Exceeded { spent: f64, limit: f64 },
}

/// Accumulates cost across one Agent Loop run and enforces a hard ceiling.
#[derive(Debug, Clone)]
pub struct BudgetManager {
    pricing: PricingTable,
    ceiling: f64,
    spent: f64,
}

impl BudgetManager {
    pub fn new(pricing: PricingTable, ceiling_dollars: f64) -> Self {
        Self { pricing, ceiling: ceiling_dollars, spent: 0.0 }
    }

    pub fn total(&self) -> f64 {
        self.spent
    }

    pub fn remaining(&self) -> f64 {
        (self.ceiling - self.spent).max(0.0)
    }

    /// Must be called before issuing the next LLM request (spec §4.6
    /// step 1). Does not mutate state.
    pub fn ensure_within_budget(&self) -> Result<(), BudgetError> {
        if self.spent >= self.ceiling {
            return Err(BudgetError::Exceeded { spent: self.spent, limit: self.ceiling });
        }
        Ok(())
    }

    /// Prices and records one completion's usage. Refuses (without
    /// mutating `spent`) if the ceiling was already exceeded.
    pub fn record(&mut self, model: &str, input_tokens: u64, output_tokens: u64) -> Result<f64, BudgetError> {
        self.ensure_within_budget()?;
        let delta = self.pricing.cost(model, input_tokens, output_tokens);
        self.spent += delta;
        Ok(delta)
    }

    pub fn summary(&self) -> String {
        format!(
            "spent ${:.4} of ${:.4} budget (${:.4} remaining)",
            self.spent,
            self.ceiling,
            self.remaining()
        )
    }
}
