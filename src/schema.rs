use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::compare::MetricComparison;
use crate::metrics::{CounterReport, MacroTiming};
use crate::oracle::CorrectnessVerdict;
use crate::patch::PatchDigest;
use crate::Variant;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub schema_version: u32,
    pub tool_version: String,
    pub mode: String,
    pub timestamp_utc: String,
    pub git_sha: Option<String>,
}

/// Where each persisted tool output lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPaths {
    pub baseline_json: PathBuf,
    pub candidate_json: PathBuf,
    pub baseline_perf: PathBuf,
    pub candidate_perf: PathBuf,
}

impl ResultPaths {
    /// The fixed file names used by the deepcopy experiment, inside `root`.
    pub fn in_dir(root: &std::path::Path) -> Self {
        Self {
            baseline_json: root.join("deepcopy_baseline.json"),
            candidate_json: root.join("deepcopy_optimized.json"),
            baseline_perf: root.join("perf_baseline.txt"),
            candidate_perf: root.join("perf_optimized.txt"),
        }
    }

    pub fn macro_json(&self, variant: Variant) -> &PathBuf {
        match variant {
            Variant::Baseline => &self.baseline_json,
            Variant::Candidate => &self.candidate_json,
        }
    }

    pub fn perf_report(&self, variant: Variant) -> &PathBuf {
        match variant {
            Variant::Baseline => &self.baseline_perf,
            Variant::Candidate => &self.candidate_perf,
        }
    }

    pub fn all(&self) -> [&PathBuf; 4] {
        [
            &self.baseline_json,
            &self.candidate_json,
            &self.baseline_perf,
            &self.candidate_perf,
        ]
    }
}

/// Wall time of one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub variant: Variant,
    pub stage: String,
    pub seconds: f64,
}

/// Everything measured for one variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant: Variant,
    /// Absent when the interpreter's tree was discarded or never built (compare mode).
    pub binary_path: Option<PathBuf>,
    pub timing: Option<MacroTiming>,
    pub counters: CounterReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run: RunMeta,
    pub patch: Vec<PatchDigest>,
    pub baseline: VariantResult,
    pub candidate: VariantResult,
    /// `None` in compare mode, where no interpreter is available to check.
    pub correctness: Option<CorrectnessVerdict>,
    pub timing: MetricComparison,
    pub counters: Vec<MetricComparison>,
    pub outputs: ResultPaths,
    pub stages: Vec<StageTiming>,
}
