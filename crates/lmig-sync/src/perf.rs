//! Stage latency samples with nearest-rank percentiles, plus the p95 budget gate.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelStats {
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
}

pub type PerfReport = BTreeMap<String, LabelStats>;

/// Nearest rank over an ascending slice: index `floor(n * p)` clamped to `n - 1`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * p).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Default)]
pub struct PerfTracker {
    samples: Mutex<HashMap<String, Vec<f64>>>,
}

impl PerfTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn samples(&self) -> MutexGuard<'_, HashMap<String, Vec<f64>>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start<'a>(&'a self, label: &'a str) -> PerfTimer<'a> {
        PerfTimer {
            tracker: self,
            label,
            started: Instant::now(),
        }
    }

    pub fn record(&self, label: &str, duration_ms: f64) {
        self.samples()
            .entry(label.to_string())
            .or_default()
            .push(duration_ms);
    }

    pub fn stats(&self, label: &str) -> LabelStats {
        match self.samples().get(label) {
            Some(values) => summarize(values),
            None => LabelStats::default(),
        }
    }

    pub fn report(&self) -> PerfReport {
        self.samples()
            .iter()
            .map(|(label, values)| (label.clone(), summarize(values)))
            .collect()
    }

    pub fn reset(&self) {
        self.samples().clear();
    }
}

fn summarize(values: &[f64]) -> LabelStats {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    LabelStats {
        count: sorted.len(),
        p50: percentile(&sorted, 0.50),
        p95: percentile(&sorted, 0.95),
    }
}

/// Records its elapsed time under the label when stopped; dropping it records nothing.
#[must_use = "a timer records only when stopped"]
pub struct PerfTimer<'a> {
    tracker: &'a PerfTracker,
    label: &'a str,
    started: Instant,
}

impl PerfTimer<'_> {
    pub fn stop(self) -> f64 {
        let ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.tracker.record(self.label, ms);
        ms
    }
}

/// Maximum acceptable p95 per label, in milliseconds.
pub type PerfBudgets = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub label: String,
    pub p95_ms: f64,
    pub budget_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} perf budget(s) exceeded: {}", .0.len(), describe(.0))]
pub struct BudgetViolations(pub Vec<BudgetViolation>);

fn describe(violations: &[BudgetViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} p95 {:.1}ms > {:.1}ms", v.label, v.p95_ms, v.budget_ms))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Labels without samples pass.
pub fn check_budgets(report: &PerfReport, budgets: &PerfBudgets) -> Result<(), BudgetViolations> {
    let violations = budgets
        .iter()
        .filter_map(|(label, &budget_ms)| {
            let stats = report.get(label)?;
            (stats.count > 0 && stats.p95 > budget_ms).then(|| BudgetViolation {
                label: label.clone(),
                p95_ms: stats.p95,
                budget_ms,
            })
        })
        .collect::<Vec<_>>();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(BudgetViolations(violations))
    }
}
