//! Drives the two external measurement tools against a built interpreter.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::builder::BuildArtifact;
use crate::error::{PipelineError, Result};
use crate::harness::Invocation;
use crate::metrics::{Counter, SamplerStatus};

/// pyperformance benchmark that exercises `copy.deepcopy`.
pub const MACRO_BENCHMARK: &str = "deepcopy";

/// In-process workload sampled under `perf stat`.
pub const MICRO_WORKLOAD: &str = r#"
import copy, random

data = {
    'list_int': [random.randint(0, 1000) for _ in range(1000)],
    'nested_list': [[i for i in range(100)] for _ in range(50)],
    'dict_obj': {str(i): {'val': i, 'list': list(range(50))} for i in range(100)},
    'mix': [{'a': [1, 2, 3], 'b': (4, 5, 6)} for _ in range(200)],
}

for _ in range(50):
    _ = copy.deepcopy(data)
"#;

const DROP_CACHES: &str = "sync; echo 3 > /proc/sys/vm/drop_caches";

/// External tools used for measurement.
#[derive(Clone, Debug)]
pub struct BenchTools {
    /// Host interpreter that has `pyperformance` installed.
    pub harness_python: OsString,
    pub perf: OsString,
    pub benchmark: String,
    pub flush_caches: bool,
}

impl Default for BenchTools {
    fn default() -> Self {
        Self {
            harness_python: OsString::from("python3"),
            perf: OsString::from("perf"),
            benchmark: MACRO_BENCHMARK.to_string(),
            flush_caches: true,
        }
    }
}

impl BenchTools {
    /// Fail fast when the macro harness is missing, before any build starts.
    pub fn preflight(&self) -> Result<()> {
        let done = Invocation::new(&self.harness_python)
            .args(["-m", "pyperformance", "--version"])
            .run_checked()?;
        info!(version = %done.combined_output().trim(), "pyperformance available");

        match Invocation::new(&self.perf).arg("--version").run() {
            Ok(done) if done.success() => {
                info!(version = %done.stdout.trim(), "perf available");
            }
            Ok(done) => warn!(
                code = done.exit_code(),
                "perf --version failed; counter comparison may be unavailable"
            ),
            Err(err) => warn!(
                error = %err,
                "perf not runnable; counter comparison will be unavailable"
            ),
        }
        Ok(())
    }

    /// Run the macro benchmark against `artifact`, writing pyperf JSON to `out`.
    ///
    /// A non-zero exit is fatal.
    pub fn run_macro(&self, artifact: &BuildArtifact, out: &Path) -> Result<()> {
        // pyperformance refuses to overwrite an existing result file.
        remove_stale(out)?;

        let mut python_arg = OsString::from("--python=");
        python_arg.push(artifact.binary_path.as_os_str());

        info!(variant = %artifact.variant, benchmark = %self.benchmark, "running macro benchmark");
        Invocation::new(&self.harness_python)
            .args(["-m", "pyperformance", "run", "--bench"])
            .arg(&self.benchmark)
            .arg(python_arg)
            .arg("-o")
            .arg(out)
            .streamed()
            .run_checked()?;
        info!(out = %out.display(), "benchmark JSON saved");
        Ok(())
    }

    /// Sample hardware counters around the deepcopy workload, writing the report to `out`.
    ///
    /// Never fatal: counter sampling needs permissions and hardware support that may be
    /// missing, so the outcome is returned as a [`SamplerStatus`].
    pub fn run_micro(&self, artifact: &BuildArtifact, out: &Path) -> Result<SamplerStatus> {
        if self.flush_caches {
            flush_caches();
        }
        remove_stale(out)?;

        info!(variant = %artifact.variant, "running perf stat on deepcopy microbenchmark");
        let invocation = Invocation::new(&self.perf)
            .arg("stat")
            .arg("-o")
            .arg(out)
            .arg("-e")
            .arg(Counter::event_list())
            .arg(&artifact.binary_path)
            .arg("-c")
            .arg(MICRO_WORKLOAD);

        let status = match invocation.run() {
            Ok(done) if done.success() => SamplerStatus::Completed,
            Ok(done) => {
                warn!(
                    variant = %artifact.variant,
                    code = done.exit_code(),
                    stderr = %done.stderr.trim(),
                    "counter sampler failed; continuing without counters"
                );
                SamplerStatus::Failed {
                    code: done.exit_code(),
                }
            }
            Err(err) => {
                warn!(variant = %artifact.variant, error = %err, "counter sampler unavailable");
                SamplerStatus::Unavailable {
                    reason: err.to_string(),
                }
            }
        };

        if status.is_completed() && !out.is_file() {
            warn!(out = %out.display(), "counter sampler exited cleanly but wrote no report");
            return Ok(SamplerStatus::Unavailable {
                reason: format!("no report written to {}", out.display()),
            });
        }
        if status.is_completed() {
            info!(out = %out.display(), "perf results saved");
        }
        Ok(status)
    }
}

/// Best effort: needs root and a Linux `/proc`; any failure is ignored.
fn flush_caches() {
    debug!("flushing page cache");
    match Invocation::new("sh").args(["-c", DROP_CACHES]).run() {
        Ok(done) if done.success() => {}
        Ok(done) => debug!(code = done.exit_code(), "cache flush failed; ignoring"),
        Err(err) => debug!(error = %err, "cache flush unavailable; ignoring"),
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale result file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(format!("remove {}", path.display()), e)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::Variant;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn artifact(dir: &Path) -> BuildArtifact {
        BuildArtifact {
            variant: Variant::Baseline,
            binary_path: dir.join("python3"),
            source_root: dir.to_path_buf(),
        }
    }

    fn tools(harness: &Path, perf: &Path) -> BenchTools {
        BenchTools {
            harness_python: harness.into(),
            perf: perf.into(),
            flush_caches: false,
            ..BenchTools::default()
        }
    }

    #[test]
    fn macro_run_replaces_stale_output_and_passes_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let args_log = dir.path().join("args.log");
        let harness = script(
            dir.path(),
            "harness",
            &format!(
                "echo \"$@\" > {}\nfor a; do last=$a; done\n[ -e \"$last\" ] && exit 9\necho '{{}}' > \"$last\"\n",
                args_log.display()
            ),
        );
        let out = dir.path().join("deepcopy_baseline.json");
        fs::write(&out, "stale").unwrap();

        let t = tools(&harness, Path::new("perf"));
        t.run_macro(&artifact(dir.path()), &out).unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "{}\n");
        let args = fs::read_to_string(&args_log).unwrap();
        assert!(args.starts_with("-m pyperformance run --bench deepcopy --python="));
        assert!(args.contains(&format!("-o {}", out.display())));
    }

    #[test]
    fn macro_failure_is_fatal_with_tool_status() {
        let dir = tempfile::tempdir().unwrap();
        let harness = script(dir.path(), "harness", "exit 4\n");
        let t = tools(&harness, Path::new("perf"));
        let err = t
            .run_macro(&artifact(dir.path()), &dir.path().join("out.json"))
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn micro_failure_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        let perf = script(dir.path(), "perf", "echo 'perf_event_paranoid' >&2\nexit 129\n");
        let t = tools(Path::new("python3"), &perf);
        let status = t
            .run_micro(&artifact(dir.path()), &dir.path().join("perf.txt"))
            .unwrap();
        assert_eq!(status, SamplerStatus::Failed { code: 129 });
    }

    #[test]
    fn micro_without_sampler_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let t = tools(Path::new("python3"), &dir.path().join("no-such-perf"));
        let status = t
            .run_micro(&artifact(dir.path()), &dir.path().join("perf.txt"))
            .unwrap();
        assert!(matches!(status, SamplerStatus::Unavailable { .. }));
    }

    #[test]
    fn micro_without_report_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let perf = script(dir.path(), "perf", "exit 0\n");
        let t = tools(Path::new("python3"), &perf);
        let status = t
            .run_micro(&artifact(dir.path()), &dir.path().join("perf.txt"))
            .unwrap();
        assert!(matches!(status, SamplerStatus::Unavailable { .. }));
    }

    #[test]
    fn micro_passes_event_list_and_workload() {
        let dir = tempfile::tempdir().unwrap();
        let perf = script(
            dir.path(),
            "perf",
            "[ \"$1\" = stat ] || exit 2\n[ \"$4\" = -e ] || exit 3\nprintf '%s\\n' \"$5\" > \"$3\"\n",
        );
        let out = dir.path().join("perf.txt");
        let t = tools(Path::new("python3"), &perf);
        let status = t.run_micro(&artifact(dir.path()), &out).unwrap();
        assert_eq!(status, SamplerStatus::Completed);
        assert_eq!(
            fs::read_to_string(&out).unwrap().trim(),
            "instructions,branches,branch-misses,cache-references,cache-misses"
        );
    }
}
