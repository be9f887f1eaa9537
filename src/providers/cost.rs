//! Cost accounting for provider calls.
//!
//! Every successful call emits one [`CallMetric`]; the ledger aggregates
//! them per provider and per task. Cost is always `tokens × configured
//! per-1K rate` — nothing in the core hardcodes dollar figures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{TaskKind, TokenUsage};

/// Per-1K-token USD rates for one provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenRates {
    pub in_per_1k_usd: f64,
    pub out_per_1k_usd: f64,
}

impl TokenRates {
    pub fn cost_of(&self, usage: TokenUsage) -> f64 {
        (usage.tokens_in as f64 / 1000.0) * self.in_per_1k_usd
            + (usage.tokens_out as f64 / 1000.0) * self.out_per_1k_usd
    }
}

/// One successful provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetric {
    pub provider: String,
    pub task: TaskKind,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub calls: u64,
    pub by_provider: BTreeMap<String, f64>,
    pub by_task: BTreeMap<String, f64>,
}

/// Thread-safe metric sink. One global ledger lives in the router; the
/// orchestrator keeps a per-chapter ledger alongside it.
#[derive(Default)]
pub struct CostLedger {
    metrics: Mutex<Vec<CallMetric>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: CallMetric) {
        tracing::debug!(
            provider = %metric.provider,
            task = %metric.task,
            tokens_in = metric.tokens_in,
            tokens_out = metric.tokens_out,
            cost_usd = metric.cost_usd,
            duration_ms = metric.duration_ms,
            "provider call completed"
        );
        self.metrics
            .lock()
            .expect("cost ledger lock poisoned")
            .push(metric);
    }

    pub fn summary(&self) -> CostSummary {
        let metrics = self.metrics.lock().expect("cost ledger lock poisoned");
        let mut summary = CostSummary::default();
        for metric in metrics.iter() {
            summary.total_cost_usd += metric.cost_usd;
            summary.total_tokens_in += metric.tokens_in;
            summary.total_tokens_out += metric.tokens_out;
            summary.calls += 1;
            *summary
                .by_provider
                .entry(metric.provider.clone())
                .or_default() += metric.cost_usd;
            *summary
                .by_task
                .entry(metric.task.as_str().to_string())
                .or_default() += metric.cost_usd;
        }
        summary
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.metrics
            .lock()
            .expect("cost ledger lock poisoned")
            .iter()
            .map(|m| m.cost_usd)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_follows_configured_rates() {
        let rates = TokenRates {
            in_per_1k_usd: 0.01,
            out_per_1k_usd: 0.03,
        };
        let cost = rates.cost_of(TokenUsage {
            tokens_in: 2000,
            tokens_out: 500,
        });
        assert!((cost - (0.02 + 0.015)).abs() < 1e-12);
    }

    #[test]
    fn ledger_aggregates_by_provider_and_task() {
        let ledger = CostLedger::new();
        ledger.record(CallMetric {
            provider: "apex".to_string(),
            task: TaskKind::ContentGeneration,
            tokens_in: 1000,
            tokens_out: 1000,
            cost_usd: 0.04,
            duration_ms: 900,
        });
        ledger.record(CallMetric {
            provider: "apex".to_string(),
            task: TaskKind::FactChecking,
            tokens_in: 500,
            tokens_out: 100,
            cost_usd: 0.01,
            duration_ms: 400,
        });
        ledger.record(CallMetric {
            provider: "structura".to_string(),
            task: TaskKind::FactChecking,
            tokens_in: 500,
            tokens_out: 100,
            cost_usd: 0.005,
            duration_ms: 350,
        });

        let summary = ledger.summary();
        assert_eq!(summary.calls, 3);
        assert!((summary.total_cost_usd - 0.055).abs() < 1e-12);
        assert!((summary.by_provider["apex"] - 0.05).abs() < 1e-12);
        assert!((summary.by_task["fact_checking"] - 0.015).abs() < 1e-12);
        assert_eq!(summary.total_tokens_in, 2000);
    }
}
