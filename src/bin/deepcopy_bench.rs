use clap::{Parser, Subcommand};
use deepcopy_bench::oracle::CorrectnessVerdict;
use deepcopy_bench::patch::{PatchSet, RecipeFragment, SourceOverride};
use deepcopy_bench::pipeline::{self, Pipeline, PipelineConfig, DEFAULT_ARCHIVE};
use deepcopy_bench::report::render_text;
use deepcopy_bench::schema::{PipelineReport, ResultPaths};
use deepcopy_bench::PipelineError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Options for a full pipeline run.
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// CPython source archive (single top-level directory, .tar.gz).
    #[arg(long, value_name = "FILE")]
    archive: Option<PathBuf>,

    /// Directory mirroring the source tree; every file in it overrides its counterpart.
    ///
    /// Replaces the default patch set (Modules/fastcopy.c and Lib/copy.py from --root).
    #[arg(long, value_name = "DIR")]
    patch_dir: Option<PathBuf>,

    /// Extra override in TARGET=SOURCE form. Can be provided multiple times.
    #[arg(long = "override", value_name = "TARGET=SOURCE", action = clap::ArgAction::Append)]
    overrides: Vec<SourceOverride>,

    /// Build recipe line registering a compiled module (NAME=SOURCE).
    #[arg(long, value_name = "NAME=SOURCE")]
    module: Option<RecipeFragment>,

    /// Do not write a build recipe line.
    #[arg(long, default_value_t = false, conflicts_with = "module")]
    no_module: bool,

    /// Build tool driving the runtime's compile and install stages.
    #[arg(long, default_value = "make")]
    make: String,

    /// Parallel compile jobs; defaults to the available CPU count.
    #[arg(long)]
    jobs: Option<usize>,

    /// Host interpreter with pyperformance installed.
    #[arg(long, default_value = "python3")]
    harness_python: String,

    /// Hardware counter sampler.
    #[arg(long, default_value = "perf")]
    perf: String,

    /// Skip the page-cache flush before counter sampling.
    #[arg(long, default_value_t = false)]
    no_flush: bool,

    /// Host provisioning script, run with `sh` before anything else.
    #[arg(long, value_name = "FILE")]
    provision: Option<PathBuf>,

    /// Keep the candidate source tree and interpreter after the run.
    #[arg(long, default_value_t = false)]
    keep_candidate: bool,
}

impl RunArgs {
    /// Layer the command-line overrides on top of the stock experiment rooted at `root`.
    fn into_config(self, root: &Path) -> Result<PipelineConfig, PipelineError> {
        let mut cfg = PipelineConfig::deepcopy_default(root);
        cfg.archive = self.archive.unwrap_or_else(|| root.join(DEFAULT_ARCHIVE));
        if let Some(dir) = self.patch_dir {
            let recipe = cfg.patch.recipe().cloned();
            cfg.patch = PatchSet::from_dir(&dir)?;
            cfg.patch.set_recipe(recipe);
        }
        for ov in self.overrides {
            cfg.patch.push_override(ov);
        }
        if self.no_module {
            cfg.patch.set_recipe(None);
        } else if let Some(module) = self.module {
            cfg.patch.set_recipe(Some(module));
        }
        cfg.recipe.make = self.make.into();
        if let Some(jobs) = self.jobs {
            cfg.recipe.jobs = jobs;
        }
        cfg.tools.harness_python = self.harness_python.into();
        cfg.tools.perf = self.perf.into();
        cfg.tools.flush_caches = !self.no_flush;
        cfg.provision = self.provision;
        cfg.keep_candidate = self.keep_candidate;
        Ok(cfg)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build baseline and candidate, benchmark both, verify the candidate, compare.
    Run(RunArgs),

    /// Run only the deepcopy correctness checks against an already-built interpreter.
    Verify {
        #[arg(value_name = "PYTHON")]
        python: PathBuf,
    },

    /// Re-extract and compare the result files persisted by an earlier run.
    Compare,
}

#[derive(Parser, Debug)]
#[command(name = "deepcopy-bench")]
#[command(about = "Build, benchmark, verify and compare a patched CPython deepcopy")]
struct Args {
    /// Working directory: extraction target, patch sources and result files.
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Where to write the JSON summary. If omitted, only the text report is printed.
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(stderr) = err.captured_stderr() {
                if !stderr.trim().is_empty() {
                    eprintln!("{}", stderr.trim_end());
                }
            }
            exit_status(err.exit_code())
        }
    }
}

/// Map a tool's status onto a process exit code; anything that would read as success is 1.
fn exit_status(code: i32) -> ExitCode {
    match u8::try_from(code & 0xff) {
        Ok(0) | Err(_) => ExitCode::FAILURE,
        Ok(byte) => ExitCode::from(byte),
    }
}

fn run(args: Args) -> Result<(), PipelineError> {
    let report = match args.cmd {
        Command::Verify { python } => {
            return match pipeline::verify_only(&python)? {
                CorrectnessVerdict::Pass { output } => {
                    println!("{output}");
                    Ok(())
                }
                CorrectnessVerdict::Fail { code, check, stderr } => {
                    Err(PipelineError::CorrectnessFailed { code, check, stderr })
                }
            };
        }
        Command::Compare => pipeline::compare_files(&ResultPaths::in_dir(&args.root))?,
        Command::Run(opts) => {
            let cfg = opts.into_config(&args.root)?;
            Pipeline::new(&cfg).run()?
        }
    };

    print!("{}", render_text(&report));
    write_json(&report, args.out)
}

fn write_json(report: &PipelineReport, out: Option<PathBuf>) -> Result<(), PipelineError> {
    let Some(out) = out else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(report)?;
    fs::write(&out, json)
        .map_err(|e| PipelineError::io(format!("write {}", out.display()), e))?;
    eprintln!("JSON report written to {}", out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config(argv: &[&str]) -> PipelineConfig {
        let args = Args::try_parse_from(argv).unwrap();
        match args.cmd {
            Command::Run(opts) => opts.into_config(&args.root).unwrap(),
            other => panic!("expected run, got {other:?}"),
        }
    }

    fn source_for<'a>(cfg: &'a PipelineConfig, target: &str) -> Option<&'a Path> {
        cfg.patch
            .overrides()
            .iter()
            .find(|ov| ov.target == Path::new(target))
            .map(|ov| ov.source.as_path())
    }

    #[test]
    fn defaults_follow_root() {
        let cfg = run_config(&["deepcopy-bench", "--root", "/work", "run"]);
        assert_eq!(cfg.archive, PathBuf::from("/work/cpython-3.10.12.tar.gz"));
        assert_eq!(source_for(&cfg, "Lib/copy.py"), Some(Path::new("/work/copy.py")));
        assert_eq!(cfg.patch.recipe().unwrap().render(), "fastcopy fastcopy.c\n");
        assert!(cfg.tools.flush_caches);
        assert!(!cfg.keep_candidate);
    }

    #[test]
    fn patch_dir_keeps_default_recipe() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Modules")).unwrap();
        fs::write(dir.path().join("Modules/fastcopy.c"), "/* c */\n").unwrap();
        let patch_dir = dir.path().to_string_lossy().into_owned();

        let cfg = run_config(&["deepcopy-bench", "run", "--patch-dir", &patch_dir]);
        assert_eq!(cfg.patch.overrides().len(), 1);
        assert_eq!(
            source_for(&cfg, "Modules/fastcopy.c"),
            Some(dir.path().join("Modules/fastcopy.c").as_path())
        );
        assert_eq!(cfg.patch.recipe().unwrap().render(), "fastcopy fastcopy.c\n");
    }

    #[test]
    fn override_replaces_default_target() {
        let cfg = run_config(&[
            "deepcopy-bench",
            "--root",
            "/work",
            "run",
            "--override",
            "Lib/copy.py=/tmp/copy.py",
            "--override",
            "Lib/copy_reg.py=/tmp/copy_reg.py",
        ]);
        assert_eq!(cfg.patch.overrides().len(), 3);
        assert_eq!(source_for(&cfg, "Lib/copy.py"), Some(Path::new("/tmp/copy.py")));
        assert_eq!(source_for(&cfg, "Modules/fastcopy.c"), Some(Path::new("/work/fastcopy.c")));
    }

    #[test]
    fn module_flags_set_or_clear_recipe() {
        let cfg = run_config(&["deepcopy-bench", "run", "--no-module"]);
        assert!(cfg.patch.recipe().is_none());

        let cfg = run_config(&["deepcopy-bench", "run", "--module", "_fastcopy=fastcopy.c"]);
        assert_eq!(cfg.patch.recipe().unwrap().render(), "_fastcopy fastcopy.c\n");

        let conflicting =
            Args::try_parse_from(["deepcopy-bench", "run", "--no-module", "--module", "a=b.c"]);
        assert!(conflicting.is_err());
    }

    #[test]
    fn tool_flags_reach_config() {
        let cfg = run_config(&[
            "deepcopy-bench",
            "run",
            "--make",
            "gmake",
            "--jobs",
            "3",
            "--perf",
            "/opt/perf",
            "--no-flush",
            "--keep-candidate",
        ]);
        assert_eq!(cfg.recipe.make, std::ffi::OsString::from("gmake"));
        assert_eq!(cfg.recipe.jobs, 3);
        assert_eq!(cfg.tools.perf, std::ffi::OsString::from("/opt/perf"));
        assert!(!cfg.tools.flush_caches);
        assert!(cfg.keep_candidate);
    }

    #[test]
    fn exit_status_never_reads_as_success() {
        assert_eq!(exit_status(3), ExitCode::from(3));
        assert_eq!(exit_status(256), ExitCode::FAILURE);
    }
}
