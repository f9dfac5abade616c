//! Sequences build, benchmark, verify and compare for the baseline and candidate builds.
//!
//! Every external step is blocking and the two variants never overlap. Both extract to
//! the same directory name, so the baseline tree is discarded before the candidate archive
//! is unpacked.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::builder::{ArtifactBuilder, BuildArtifact, BuildRecipe};
use crate::compare::{compare_counters, compare_timing};
use crate::error::{PipelineError, Result};
use crate::harness::Invocation;
use crate::metrics::{
    extract_counters, extract_timing, Counter, CounterReport, MacroTiming, SamplerStatus,
};
use crate::oracle::{self, CorrectnessVerdict};
use crate::patch::{PatchDigest, PatchSet};
use crate::report::run_meta;
use crate::runner::BenchTools;
use crate::schema::{PipelineReport, ResultPaths, StageTiming, VariantResult};
use crate::Variant;

/// Default source archive name, looked up in the working directory.
pub const DEFAULT_ARCHIVE: &str = "cpython-3.10.12.tar.gz";

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Extraction directory and home of the persisted results.
    pub work_dir: PathBuf,
    pub archive: PathBuf,
    pub patch: PatchSet,
    pub recipe: BuildRecipe,
    pub tools: BenchTools,
    pub outputs: ResultPaths,
    /// Opaque host provisioning script, run with `sh` before anything else.
    pub provision: Option<PathBuf>,
    /// Keep the candidate tree (and its interpreter) after the run.
    pub keep_candidate: bool,
}

impl PipelineConfig {
    /// The stock deepcopy experiment rooted at `work_dir`.
    pub fn deepcopy_default(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            archive: work_dir.join(DEFAULT_ARCHIVE),
            patch: PatchSet::deepcopy_default(&work_dir),
            recipe: BuildRecipe::default(),
            tools: BenchTools::default(),
            outputs: ResultPaths::in_dir(&work_dir),
            provision: None,
            keep_candidate: false,
            work_dir,
        }
    }
}

struct Leg {
    result: VariantResult,
    artifact: BuildArtifact,
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    stages: Vec<StageTiming>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
        }
    }

    /// Full run: build and measure both variants, verify the candidate, compare.
    ///
    /// A candidate that fails the correctness oracle aborts the run before any comparison
    /// is produced.
    pub fn run(mut self) -> Result<PipelineReport> {
        let cfg = self.config;
        if let Some(script) = &cfg.provision {
            provision(script);
        }
        cfg.patch.validate()?;
        let patch_digests = cfg.patch.digests()?;
        if !cfg.archive.is_file() {
            return Err(PipelineError::io(
                format!("source archive {}", cfg.archive.display()),
                io::Error::new(io::ErrorKind::NotFound, "not found"),
            ));
        }
        cfg.tools.preflight()?;

        let builder = ArtifactBuilder::new(&cfg.work_dir, &cfg.archive, &cfg.recipe);

        info!("building baseline version");
        let baseline = self.stage(Variant::Baseline, "build", || builder.build_baseline())?;
        let baseline = self.measure(baseline)?;
        let baseline_result = baseline.result;
        baseline.artifact.discard()?;

        info!("building candidate version");
        let candidate = self.stage(Variant::Candidate, "build", || {
            builder.build_candidate(&cfg.patch)
        })?;
        let candidate = self.measure(candidate)?;

        let verdict = self.stage(Variant::Candidate, "verify", || {
            oracle::verify(&candidate.artifact.binary_path)
        })?;
        if let CorrectnessVerdict::Fail { code, check, stderr } = verdict {
            return Err(PipelineError::CorrectnessFailed { code, check, stderr });
        }

        let mut candidate_result = candidate.result;
        if cfg.keep_candidate {
            info!(tree = %candidate.artifact.source_root.display(), "keeping candidate build");
        } else {
            candidate.artifact.discard()?;
            candidate_result.binary_path = None;
        }

        let mut report = assemble(
            "run",
            patch_digests,
            baseline_result,
            candidate_result,
            cfg.outputs.clone(),
        );
        report.correctness = Some(verdict);
        report.stages = self.stages;
        Ok(report)
    }

    fn measure(&mut self, artifact: BuildArtifact) -> Result<Leg> {
        let cfg = self.config;
        let variant = artifact.variant;
        let json = cfg.outputs.macro_json(variant);
        let perf = cfg.outputs.perf_report(variant);

        self.stage(variant, "macro", || cfg.tools.run_macro(&artifact, json))?;
        let timing = load_timing(json)?;
        let sampler = self.stage(variant, "micro", || cfg.tools.run_micro(&artifact, perf))?;
        let counters = load_counters(perf, sampler)?;

        Ok(Leg {
            result: VariantResult {
                variant,
                binary_path: Some(artifact.binary_path.clone()),
                timing,
                counters,
            },
            artifact,
        })
    }

    fn stage<T>(
        &mut self,
        variant: Variant,
        stage: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let out = f()?;
        self.stages.push(StageTiming {
            variant,
            stage: stage.to_string(),
            seconds: start.elapsed().as_secs_f64(),
        });
        Ok(out)
    }
}

/// Compare results persisted by an earlier run without building anything.
pub fn compare_files(outputs: &ResultPaths) -> Result<PipelineReport> {
    let baseline = load_variant(Variant::Baseline, outputs)?;
    let candidate = load_variant(Variant::Candidate, outputs)?;
    Ok(assemble("compare", Vec::new(), baseline, candidate, outputs.clone()))
}

/// Correctness-only mode: run the oracle against an already-built interpreter.
pub fn verify_only(python: &Path) -> Result<CorrectnessVerdict> {
    if !python.is_file() {
        return Err(PipelineError::MissingInterpreter(python.to_path_buf()));
    }
    oracle::verify(python)
}

fn assemble(
    mode: &str,
    patch: Vec<PatchDigest>,
    baseline: VariantResult,
    candidate: VariantResult,
    outputs: ResultPaths,
) -> PipelineReport {
    let timing = compare_timing(baseline.timing.as_ref(), candidate.timing.as_ref());
    let counters = compare_counters(&baseline.counters, &candidate.counters);
    PipelineReport {
        run: run_meta(mode),
        patch,
        baseline,
        candidate,
        correctness: None,
        timing,
        counters,
        outputs,
        stages: Vec::new(),
    }
}

fn load_variant(variant: Variant, outputs: &ResultPaths) -> Result<VariantResult> {
    let timing = load_timing(outputs.macro_json(variant))?;
    let perf = outputs.perf_report(variant);
    let sampler = if perf.is_file() {
        SamplerStatus::Completed
    } else {
        SamplerStatus::Unavailable {
            reason: format!("no report at {}", perf.display()),
        }
    };
    Ok(VariantResult {
        variant,
        binary_path: None,
        timing,
        counters: load_counters(perf, sampler)?,
    })
}

/// The macro result must exist (its harness exited cleanly), but its contents may not parse.
fn load_timing(path: &Path) -> Result<Option<MacroTiming>> {
    let text = fs::read_to_string(path)
        .map_err(|e| PipelineError::io(format!("read {}", path.display()), e))?;
    let timing = extract_timing(&text);
    match &timing {
        Some(t) => info!(
            path = %path.display(),
            mean_us = t.mean_us,
            samples = t.samples,
            "benchmark time extracted"
        ),
        None => warn!(path = %path.display(), "could not extract benchmark time"),
    }
    Ok(timing)
}

fn load_counters(path: &Path, sampler: SamplerStatus) -> Result<CounterReport> {
    if !sampler.is_completed() {
        return Ok(CounterReport {
            sampler,
            counters: Default::default(),
        });
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "counter report missing");
            return Ok(CounterReport::unavailable(format!("no report at {}", path.display())));
        }
        Err(e) => return Err(PipelineError::io(format!("read {}", path.display()), e)),
    };
    let counters = extract_counters(&text);
    if counters.len() < Counter::ALL.len() {
        warn!(
            path = %path.display(),
            found = counters.len(),
            "counter report is missing some events"
        );
    }
    Ok(CounterReport { sampler, counters })
}

/// Host provisioning is an opaque precondition; its failure is only a warning.
fn provision(script: &Path) -> bool {
    provision_with(Path::new("sh"), script)
}

fn provision_with(shell: &Path, script: &Path) -> bool {
    info!(script = %script.display(), "provisioning host");
    match Invocation::new(shell).arg(script).streamed().run() {
        Ok(done) if done.success() => true,
        Ok(done) => {
            warn!(code = done.exit_code(), "provisioning script failed; continuing");
            false
        }
        Err(err) => {
            warn!(error = %err, "provisioning shell unavailable; continuing");
            false
        }
    }
}
