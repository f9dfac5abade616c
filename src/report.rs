//! Plain-text rendering of a [`PipelineReport`] plus run metadata helpers.

use std::fmt::Write as _;

use crate::compare::{Classification, MetricComparison, MetricDelta, MetricScale};
use crate::oracle::CorrectnessVerdict;
use crate::schema::{PipelineReport, RunMeta, SCHEMA_VERSION};

pub fn run_meta(mode: &str) -> RunMeta {
    RunMeta {
        schema_version: SCHEMA_VERSION,
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        mode: mode.to_string(),
        timestamp_utc: now_utc(),
        git_sha: git_sha_short(),
    }
}

fn now_utc() -> String {
    // Seconds since the epoch are enough to order reports.
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("unix:{secs}")
}

fn git_sha_short() -> Option<String> {
    // Best-effort: read from environment set by CI/build scripts.
    std::env::var("GIT_SHA")
        .ok()
        .or_else(|| std::env::var("GITHUB_SHA").ok())
        .map(|s| s.chars().take(12).collect())
}

fn format_value(scale: MetricScale, v: f64) -> String {
    match scale {
        MetricScale::Microseconds => format!("{v:.1} µs"),
        MetricScale::Count => group_thousands(v.round() as u64),
        MetricScale::Rate => format!("{:.3}%", v * 100.0),
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn delta_line(d: &MetricDelta) -> String {
    format!(
        "  {:<10} {:<18}: {:>14} -> {:>14} ({:+.2}%)",
        d.classification.label(),
        d.metric,
        format_value(d.scale, d.baseline),
        format_value(d.scale, d.candidate),
        d.improvement_pct
    )
}

/// One report line for a comparison, including the explicit not-comparable notice.
pub fn comparison_line(cmp: &MetricComparison) -> String {
    match cmp {
        MetricComparison::Compared(d) => delta_line(d),
        MetricComparison::NotComparable { metric, reason } => {
            format!("  {:<10} {:<18}: not comparable ({reason})", "SKIPPED", metric)
        }
    }
}

/// Headline for the macro timing, following the noise-band classification.
fn timing_headline(d: &MetricDelta) -> String {
    let verdict = match d.classification {
        Classification::Improved => "Faster",
        Classification::Regressed => "Slower",
        Classification::Unchanged => "No significant change",
    };
    format!(
        "{verdict}: {:.2}% ({:.1} -> {:.1} µs)",
        d.improvement_pct.abs(),
        d.baseline,
        d.candidate
    )
}

pub fn render_text(report: &PipelineReport) -> String {
    let mut out = String::new();

    if let Some(verdict) = &report.correctness {
        match verdict {
            CorrectnessVerdict::Pass { output } => {
                let _ = writeln!(out, "Correctness: PASS ({output})");
            }
            CorrectnessVerdict::Fail { code, check, .. } => {
                let check = check.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string());
                let _ = writeln!(out, "Correctness: FAIL (check {check}, status {code})");
            }
        }
        out.push('\n');
    }

    let _ = writeln!(out, "Macro benchmark (pyperformance deepcopy):");
    let _ = writeln!(out, "{}", comparison_line(&report.timing));
    if let MetricComparison::Compared(d) = &report.timing {
        let _ = writeln!(out, "  {}", timing_headline(d));
    }

    let _ = writeln!(out, "\nHardware counters (perf stat, deepcopy microbenchmark):");
    for cmp in &report.counters {
        let _ = writeln!(out, "{}", comparison_line(cmp));
    }
    let _ = writeln!(
        out,
        "  (only rates and instruction count are compared; absolute event counts are omitted)"
    );

    let _ = writeln!(out, "\nResults saved to:");
    for path in report.outputs.all() {
        let _ = writeln!(out, "  {}", path.display());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{compare_counters, compare_timing};
    use crate::metrics::{Counter, CounterReport, CounterSet, MacroTiming, SamplerStatus};
    use crate::schema::{ResultPaths, VariantResult};
    use crate::Variant;
    use std::path::Path;

    fn counters(pairs: &[(Counter, u64)]) -> CounterReport {
        CounterReport {
            sampler: SamplerStatus::Completed,
            counters: pairs.iter().copied().collect::<CounterSet>(),
        }
    }

    fn sample_report() -> PipelineReport {
        let bt = MacroTiming { samples: 3, mean_us: 100.0 };
        let ct = MacroTiming { samples: 3, mean_us: 80.0 };
        let b = counters(&[
            (Counter::Instructions, 2_000_000),
            (Counter::Branches, 1_000_000),
            (Counter::BranchMisses, 50_000),
            (Counter::CacheReferences, 10_000),
            (Counter::CacheMisses, 100),
        ]);
        let c = counters(&[
            (Counter::Instructions, 1_500_000),
            (Counter::Branches, 1_000_000),
            (Counter::BranchMisses, 49_900),
            (Counter::CacheReferences, 10_000),
        ]);
        PipelineReport {
            run: run_meta("compare"),
            patch: Vec::new(),
            timing: compare_timing(Some(&bt), Some(&ct)),
            counters: compare_counters(&b, &c),
            baseline: VariantResult {
                variant: Variant::Baseline,
                binary_path: None,
                timing: Some(bt),
                counters: b,
            },
            candidate: VariantResult {
                variant: Variant::Candidate,
                binary_path: None,
                timing: Some(ct),
                counters: c,
            },
            correctness: Some(CorrectnessVerdict::Pass {
                output: "deepcopy correctness verified".to_string(),
            }),
            outputs: ResultPaths::in_dir(Path::new("/work")),
            stages: Vec::new(),
        }
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1_000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn text_report_covers_every_section() {
        let text = render_text(&sample_report());
        assert!(text.contains("Correctness: PASS"));
        assert!(text.contains("Faster: 20.00% (100.0 -> 80.0 µs)"));
        assert!(text.contains("IMPROVED   instructions"));
        assert!(text.contains("2,000,000"));
        assert!(text.contains("NO CHANGE  branch-miss rate"));
        assert!(text.contains("5.000%"));
        assert!(text.contains(
            "cache-miss rate   : not comparable (`cache-misses` missing from candidate report)"
        ));
        assert!(text.contains("/work/perf_optimized.txt"));
    }

    #[test]
    fn timing_headline_follows_noise_band() {
        let mut report = sample_report();
        let t = MacroTiming { samples: 3, mean_us: 100.0 };
        report.timing = compare_timing(Some(&t), Some(&t));
        let text = render_text(&report);
        assert!(text.contains("No significant change: 0.00% (100.0 -> 100.0 µs)"));
        assert!(!text.contains("Slower"));

        let within = MacroTiming { samples: 3, mean_us: 99.5 };
        report.timing = compare_timing(Some(&t), Some(&within));
        let text = render_text(&report);
        assert!(text.contains("No significant change: 0.50% (100.0 -> 99.5 µs)"));
        assert!(!text.contains("Faster"));

        let slower = MacroTiming { samples: 3, mean_us: 110.0 };
        report.timing = compare_timing(Some(&t), Some(&slower));
        assert!(render_text(&report).contains("Slower: 10.00% (100.0 -> 110.0 µs)"));
    }

    #[test]
    fn report_serializes_to_json() {
        let json = serde_json::to_value(sample_report()).unwrap();
        assert_eq!(json["run"]["schema_version"], 1);
        assert_eq!(json["timing"]["outcome"], "compared");
        assert_eq!(json["timing"]["classification"], "improved");
        assert_eq!(json["counters"][2]["outcome"], "not_comparable");
        assert_eq!(json["correctness"]["verdict"], "pass");
        assert_eq!(json["baseline"]["counters"]["sampler"]["status"], "completed");
        assert_eq!(json["baseline"]["counters"]["counters"]["branch-misses"], 50_000);
    }
}
