//! Baseline vs candidate deltas, classified against a ±1% noise band.
//!
//! Every metric here is "lower is better". A metric that cannot be computed (missing on
//! either side, zero baseline, zero rate denominator) becomes
//! [`MetricComparison::NotComparable`] with a reason, never a fabricated number.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metrics::{Counter, CounterReport, MacroTiming};
use crate::Variant;

/// Deltas with a magnitude below this many percent are noise.
pub const NOISE_BAND_PCT: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Improved,
    Regressed,
    Unchanged,
}

impl Classification {
    pub fn of(improvement_pct: f64) -> Self {
        if improvement_pct.abs() < NOISE_BAND_PCT {
            Classification::Unchanged
        } else if improvement_pct > 0.0 {
            Classification::Improved
        } else {
            Classification::Regressed
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Classification::Improved => "IMPROVED",
            Classification::Regressed => "REGRESSED",
            Classification::Unchanged => "NO CHANGE",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a metric's raw values are rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricScale {
    Microseconds,
    Count,
    /// A ratio in `[0, 1]`, shown as a percentage.
    Rate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub metric: String,
    pub scale: MetricScale,
    pub baseline: f64,
    pub candidate: f64,
    pub improvement_pct: f64,
    pub classification: Classification,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MetricComparison {
    Compared(MetricDelta),
    NotComparable { metric: String, reason: String },
}

impl MetricComparison {
    pub fn metric(&self) -> &str {
        match self {
            MetricComparison::Compared(delta) => &delta.metric,
            MetricComparison::NotComparable { metric, .. } => metric,
        }
    }

    pub fn classification(&self) -> Option<Classification> {
        match self {
            MetricComparison::Compared(delta) => Some(delta.classification),
            MetricComparison::NotComparable { .. } => None,
        }
    }

    fn not_comparable(metric: &str, reason: impl Into<String>) -> Self {
        MetricComparison::NotComparable {
            metric: metric.to_string(),
            reason: reason.into(),
        }
    }
}

/// `(baseline - candidate) / baseline * 100`, or `None` when the baseline is zero.
pub fn percent_improvement(baseline: f64, candidate: f64) -> Option<f64> {
    if baseline == 0.0 {
        return None;
    }
    Some((baseline - candidate) / baseline * 100.0)
}

/// Compare two already-computed values of one metric.
pub fn compare_values(
    metric: &str,
    scale: MetricScale,
    baseline: f64,
    candidate: f64,
) -> MetricComparison {
    match percent_improvement(baseline, candidate) {
        Some(pct) => MetricComparison::Compared(MetricDelta {
            metric: metric.to_string(),
            scale,
            baseline,
            candidate,
            improvement_pct: pct,
            classification: Classification::of(pct),
        }),
        None => MetricComparison::not_comparable(metric, "baseline value is zero"),
    }
}

pub const TIMING_METRIC: &str = "mean time";

pub fn compare_timing(
    baseline: Option<&MacroTiming>,
    candidate: Option<&MacroTiming>,
) -> MetricComparison {
    match (baseline, candidate) {
        (Some(b), Some(c)) => {
            compare_values(TIMING_METRIC, MetricScale::Microseconds, b.mean_us, c.mean_us)
        }
        (None, _) => MetricComparison::not_comparable(
            TIMING_METRIC,
            "could not extract benchmark time from baseline result",
        ),
        (_, None) => MetricComparison::not_comparable(
            TIMING_METRIC,
            "could not extract benchmark time from candidate result",
        ),
    }
}

/// A value derived from one counter report.
#[derive(Clone, Copy, Debug)]
enum CounterMetric {
    Raw(Counter),
    Rate { misses: Counter, total: Counter },
}

/// Only the instruction count and the two miss rates are compared; absolute miss and
/// reference counts depend on how much work ran and are left out.
const COUNTER_METRICS: [(&str, CounterMetric); 3] = [
    ("instructions", CounterMetric::Raw(Counter::Instructions)),
    (
        "branch-miss rate",
        CounterMetric::Rate {
            misses: Counter::BranchMisses,
            total: Counter::Branches,
        },
    ),
    (
        "cache-miss rate",
        CounterMetric::Rate {
            misses: Counter::CacheMisses,
            total: Counter::CacheReferences,
        },
    ),
];

fn derive(report: &CounterReport, variant: Variant, metric: CounterMetric) -> Result<f64, String> {
    if !report.sampler.is_completed() {
        return Err(format!("{variant} counter sampler {}", report.sampler));
    }
    let get = |counter: Counter| {
        report
            .counters
            .get(counter)
            .ok_or_else(|| format!("`{counter}` missing from {variant} report"))
    };
    match metric {
        CounterMetric::Raw(counter) => Ok(get(counter)? as f64),
        CounterMetric::Rate { misses, total } => {
            let misses = get(misses)?;
            let total_value = get(total)?;
            if total_value == 0 {
                return Err(format!("zero `{total}` in {variant} report"));
            }
            Ok(misses as f64 / total_value as f64)
        }
    }
}

pub fn compare_counters(
    baseline: &CounterReport,
    candidate: &CounterReport,
) -> Vec<MetricComparison> {
    COUNTER_METRICS
        .iter()
        .map(|&(name, metric)| {
            let scale = match metric {
                CounterMetric::Raw(_) => MetricScale::Count,
                CounterMetric::Rate { .. } => MetricScale::Rate,
            };
            let b = derive(baseline, Variant::Baseline, metric);
            let c = derive(candidate, Variant::Candidate, metric);
            match (b, c) {
                (Ok(b), Ok(c)) => compare_values(name, scale, b, c),
                (Err(reason), _) | (_, Err(reason)) => {
                    MetricComparison::not_comparable(name, reason)
                }
            }
        })
        .collect()
}
