//! Extraction of numeric results from tool output this crate does not control.
//!
//! Two formats are understood: the pyperf JSON document written by `pyperformance run -o`,
//! and the text report written by `perf stat -o`. All format knowledge lives here. A pattern
//! that does not match produces an absent value, never an error and never a zero.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The hardware counters sampled by the microbenchmark, in report order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Counter {
    Instructions,
    Branches,
    BranchMisses,
    CacheReferences,
    CacheMisses,
}

impl Counter {
    pub const ALL: [Counter; 5] = [
        Counter::Instructions,
        Counter::Branches,
        Counter::BranchMisses,
        Counter::CacheReferences,
        Counter::CacheMisses,
    ];

    /// Event name as `perf` spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::Instructions => "instructions",
            Counter::Branches => "branches",
            Counter::BranchMisses => "branch-misses",
            Counter::CacheReferences => "cache-references",
            Counter::CacheMisses => "cache-misses",
        }
    }

    pub fn from_event(name: &str) -> Option<Counter> {
        Counter::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Comma-joined event list for `perf stat -e`.
    pub fn event_list() -> String {
        Counter::ALL.map(|c| c.as_str()).join(",")
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mean wall time of the macro benchmark.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MacroTiming {
    pub samples: usize,
    pub mean_us: f64,
}

/// Counters found in one `perf stat` report. Counters that were not found are absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterSet {
    counts: BTreeMap<Counter, u64>,
}

impl CounterSet {
    pub fn get(&self, counter: Counter) -> Option<u64> {
        self.counts.get(&counter).copied()
    }

    pub fn insert(&mut self, counter: Counter, value: u64) {
        self.counts.insert(counter, value);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        self.counts.iter().map(|(c, v)| (*c, *v))
    }
}

impl FromIterator<(Counter, u64)> for CounterSet {
    fn from_iter<I: IntoIterator<Item = (Counter, u64)>>(iter: I) -> Self {
        Self {
            counts: iter.into_iter().collect(),
        }
    }
}

/// Whether the counter sampler produced a report at all.
///
/// Keeps "perf could not run" distinct from "perf ran but an event line was missing".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SamplerStatus {
    Completed,
    Failed { code: i32 },
    Unavailable { reason: String },
}

impl SamplerStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, SamplerStatus::Completed)
    }
}

impl fmt::Display for SamplerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerStatus::Completed => f.write_str("completed"),
            SamplerStatus::Failed { code } => write!(f, "failed with status {code}"),
            SamplerStatus::Unavailable { reason } => write!(f, "unavailable ({reason})"),
        }
    }
}

/// Counters for one variant together with the sampler outcome that produced them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterReport {
    pub sampler: SamplerStatus,
    pub counters: CounterSet,
}

impl CounterReport {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            sampler: SamplerStatus::Unavailable {
                reason: reason.into(),
            },
            counters: CounterSet::default(),
        }
    }
}

/// Mean of every measured sample in a pyperf result document, in microseconds.
///
/// Samples are seconds. Warmups are ignored. A document that is not JSON falls back to
/// scraping the first `"values": [...]` array. Any non-numeric sample makes the whole
/// result absent.
pub fn extract_timing(document: &str) -> Option<MacroTiming> {
    let samples = match serde_json::from_str::<Value>(document) {
        Ok(root) => samples_from_json(&root)?,
        Err(_) => samples_from_text(document)?,
    };
    if samples.is_empty() {
        return None;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    Some(MacroTiming {
        samples: samples.len(),
        mean_us: mean * 1e6,
    })
}

fn samples_from_json(root: &Value) -> Option<Vec<f64>> {
    let mut samples = Vec::new();
    for bench in root.get("benchmarks")?.as_array()? {
        let Some(runs) = bench.get("runs").and_then(Value::as_array) else {
            continue;
        };
        for run in runs {
            // Calibration runs carry only warmups.
            let Some(values) = run.get("values") else {
                continue;
            };
            for v in values.as_array()? {
                let v = v.as_f64()?;
                if !v.is_finite() || v < 0.0 {
                    return None;
                }
                samples.push(v);
            }
        }
    }
    Some(samples)
}

static VALUES_ARRAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""values"\s*:\s*\[([^\]]*)\]"#).expect("values pattern is valid")
});

fn samples_from_text(text: &str) -> Option<Vec<f64>> {
    let body = VALUES_ARRAY.captures(text)?.get(1)?.as_str();
    body.split(',')
        .map(|tok| {
            tok.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
        })
        .collect()
}

static COUNTER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(\d{1,3}(?:,\d{3})+|\d+)\s+(instructions|branches|branch-misses|cache-references|cache-misses)(?::[a-zA-Z]+)?(?:\s|$)",
    )
    .expect("counter pattern is valid")
});

/// Scan a `perf stat` report line by line for the five sampled counters.
///
/// The count must directly precede the event name and may use `,` thousands grouping.
/// Lines such as `<not supported> cache-misses` or a malformed grouping leave the counter
/// absent. The first occurrence of a counter wins.
pub fn extract_counters(report: &str) -> CounterSet {
    let mut set = CounterSet::default();
    for line in report.lines() {
        let Some(caps) = COUNTER_LINE.captures(line) else {
            continue;
        };
        let Some(counter) = Counter::from_event(&caps[2]) else {
            continue;
        };
        if set.get(counter).is_some() {
            continue;
        }
        let digits: String = caps[1].chars().filter(|c| *c != ',').collect();
        if let Ok(value) = digits.parse::<u64>() {
            set.insert(counter, value);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERF_REPORT: &str = "\
# started on Mon Oct 12 10:14:03 2026


 Performance counter stats for '/work/Python-3.10.12/install/bin/python3 -c ...':

     1,234,567,890      instructions              #    1.52  insn per cycle
       250,000,123      branches
         1,250,001      branch-misses             #    0.50% of all branches
        10,000,000      cache-references
           420,000      cache-misses              #    4.200 % of all cache refs

       0.412345678 seconds time elapsed
";

    const PYPERF_DOC: &str = r#"{
        "version": "1.0",
        "metadata": {"perf_version": "2.6.0"},
        "benchmarks": [{
            "metadata": {"name": "deepcopy", "unit": "second"},
            "runs": [
                {"metadata": {"calibrate_loops": 8}, "warmups": [[1, 0.5], [2, 0.6]]},
                {"metadata": {}, "warmups": [[8, 0.9]], "values": [0.0001, 0.0002]},
                {"metadata": {}, "warmups": [[8, 0.9]], "values": [0.0003]}
            ]
        }]
    }"#;

    #[test]
    fn counters_parse_grouped_integers() {
        let set = extract_counters(PERF_REPORT);
        assert_eq!(set.len(), 5);
        assert_eq!(set.get(Counter::Instructions), Some(1_234_567_890));
        assert_eq!(set.get(Counter::Branches), Some(250_000_123));
        assert_eq!(set.get(Counter::BranchMisses), Some(1_250_001));
        assert_eq!(set.get(Counter::CacheReferences), Some(10_000_000));
        assert_eq!(set.get(Counter::CacheMisses), Some(420_000));
    }

    #[test]
    fn missing_counter_line_stays_absent() {
        let report: String = PERF_REPORT
            .lines()
            .filter(|l| !l.contains("cache-misses"))
            .map(|l| format!("{l}\n"))
            .collect();
        let set = extract_counters(&report);
        assert_eq!(set.len(), 4);
        assert_eq!(set.get(Counter::CacheMisses), None);
    }

    #[test]
    fn unsupported_and_malformed_counts_are_absent() {
        let report = "\
   <not supported>      cache-misses
          1,00,000      branches
            12,345      cache-references
           1234567      instructions:u
";
        let set = extract_counters(report);
        assert_eq!(set.get(Counter::CacheMisses), None);
        assert_eq!(set.get(Counter::Branches), None);
        assert_eq!(set.get(Counter::CacheReferences), Some(12_345));
        assert_eq!(set.get(Counter::Instructions), Some(1_234_567));
    }

    #[test]
    fn zero_is_a_measured_value() {
        let set = extract_counters("                 0      cache-misses\n");
        assert_eq!(set.get(Counter::CacheMisses), Some(0));
    }

    #[test]
    fn comment_mentions_do_not_count() {
        let set = extract_counters("  1,000   branch-misses  # 5.00% of all branches\n");
        assert_eq!(set.get(Counter::BranchMisses), Some(1_000));
        assert_eq!(set.get(Counter::Branches), None);
    }

    #[test]
    fn empty_report_yields_empty_set() {
        assert!(extract_counters("").is_empty());
    }

    #[test]
    fn timing_averages_all_runs_in_microseconds() {
        let timing = extract_timing(PYPERF_DOC).unwrap();
        assert_eq!(timing.samples, 3);
        assert!((timing.mean_us - 200.0).abs() < 1e-9);
    }

    #[test]
    fn timing_falls_back_to_text_scrape() {
        let truncated = r#"{"benchmarks": [{"runs": [{"values": [0.0001, 0.0003]}, {"values": [9"#;
        let timing = extract_timing(truncated).unwrap();
        assert_eq!(timing.samples, 2);
        assert!((timing.mean_us - 200.0).abs() < 1e-9);

        let sci = r#"garbage "values": [1e-4, 3.0E-4] more"#;
        assert!((extract_timing(sci).unwrap().mean_us - 200.0).abs() < 1e-9);
    }

    #[test]
    fn timing_is_absent_without_samples() {
        assert_eq!(extract_timing(""), None);
        assert_eq!(extract_timing("{}"), None);
        assert_eq!(extract_timing(r#"{"benchmarks": []}"#), None);
        assert_eq!(
            extract_timing(r#"{"benchmarks": [{"runs": [{"warmups": [[1, 0.5]]}]}]}"#),
            None
        );
    }

    #[test]
    fn corrupt_samples_are_not_fabricated() {
        assert_eq!(
            extract_timing(r#"{"benchmarks": [{"runs": [{"values": [0.1, "x"]}]}]}"#),
            None
        );
        assert_eq!(extract_timing(r#"oops "values": [0.1, abc]"#), None);
    }

    #[test]
    fn extraction_is_idempotent() {
        assert_eq!(extract_timing(PYPERF_DOC), extract_timing(PYPERF_DOC));
        assert_eq!(extract_counters(PERF_REPORT), extract_counters(PERF_REPORT));
    }

    #[test]
    fn event_list_matches_perf_syntax() {
        assert_eq!(
            Counter::event_list(),
            "instructions,branches,branch-misses,cache-references,cache-misses"
        );
    }
}
