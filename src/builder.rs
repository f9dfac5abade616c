//! Extract, patch, configure, compile and install one interpreter build.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::harness::Invocation;
use crate::patch::PatchSet;
use crate::Variant;

/// Install prefix, relative to the extracted tree.
pub const INSTALL_SUBDIR: &str = "install";
/// Interpreter entry point, relative to the install prefix.
pub const INTERPRETER: &str = "bin/python3";

/// A built, runnable interpreter.
///
/// The install prefix lives inside `source_root`, so [`BuildArtifact::discard`] removes
/// the binary as well.
#[derive(Clone, Debug)]
pub struct BuildArtifact {
    pub variant: Variant,
    pub binary_path: PathBuf,
    pub source_root: PathBuf,
}

impl BuildArtifact {
    /// Remove the extracted tree. Consumes the artifact: nothing may run against it afterwards.
    pub fn discard(self) -> Result<()> {
        info!(variant = %self.variant, tree = %self.source_root.display(), "removing source tree");
        remove_tree(&self.source_root)
    }
}

/// How the runtime's own build system is driven.
#[derive(Clone, Debug)]
pub struct BuildRecipe {
    pub make: OsString,
    pub jobs: usize,
}

impl Default for BuildRecipe {
    fn default() -> Self {
        Self {
            make: OsString::from("make"),
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

pub struct ArtifactBuilder<'a> {
    work_dir: &'a Path,
    archive: &'a Path,
    recipe: &'a BuildRecipe,
}

impl<'a> ArtifactBuilder<'a> {
    pub fn new(work_dir: &'a Path, archive: &'a Path, recipe: &'a BuildRecipe) -> Self {
        Self {
            work_dir,
            archive,
            recipe,
        }
    }

    pub fn build_baseline(&self) -> Result<BuildArtifact> {
        self.build(Variant::Baseline, None)
    }

    pub fn build_candidate(&self, patch: &PatchSet) -> Result<BuildArtifact> {
        self.build(Variant::Candidate, Some(patch))
    }

    fn build(&self, variant: Variant, patch: Option<&PatchSet>) -> Result<BuildArtifact> {
        let start = Instant::now();
        let tree = self.extract()?;

        if let Some(patch) = patch {
            info!(%variant, overrides = patch.overrides().len(), "applying patch set");
            patch.apply(&tree)?;
        }

        info!(%variant, tree = %tree.display(), jobs = self.recipe.jobs, "building interpreter");
        let prefix = tree.join(INSTALL_SUBDIR);
        let mut prefix_arg = OsString::from("--prefix=");
        prefix_arg.push(prefix.as_os_str());

        Invocation::new(tree.join("configure"))
            .arg(prefix_arg)
            .current_dir(&tree)
            .run_checked()?;
        Invocation::new(&self.recipe.make)
            .arg(format!("-j{}", self.recipe.jobs.max(1)))
            .current_dir(&tree)
            .run_checked()?;
        Invocation::new(&self.recipe.make)
            .arg("install")
            .current_dir(&tree)
            .run_checked()?;

        let binary_path = prefix.join(INTERPRETER);
        if !binary_path.is_file() {
            return Err(PipelineError::MissingInterpreter(binary_path));
        }

        info!(
            %variant,
            binary = %binary_path.display(),
            build_s = start.elapsed().as_secs_f64(),
            "build complete"
        );
        Ok(BuildArtifact {
            variant,
            binary_path,
            source_root: tree,
        })
    }

    /// Extract the archive into the working directory and return the tree it created.
    ///
    /// Both variants extract to the same directory name; whatever is there already is
    /// removed first so trees never mix.
    fn extract(&self) -> Result<PathBuf> {
        let top = archive_root(self.archive)?;
        let tree = self.work_dir.join(&top);
        if tree.exists() {
            warn!(tree = %tree.display(), "removing stale source tree before extraction");
            remove_tree(&tree)?;
        }

        info!(archive = %self.archive.display(), "extracting source archive");
        Invocation::new("tar")
            .arg("-xzf")
            .arg(self.archive)
            .arg("-C")
            .arg(self.work_dir)
            .run_checked()?;
        Ok(tree)
    }
}

/// Name of the single top-level directory: the first path segment of the first entry.
pub fn archive_root(archive: &Path) -> Result<String> {
    let listing = Invocation::new("tar")
        .arg("-tzf")
        .arg(archive)
        .run_checked()?;
    first_segment(&listing.stdout).ok_or_else(|| PipelineError::EmptyArchive(archive.to_path_buf()))
}

fn first_segment(listing: &str) -> Option<String> {
    listing
        .lines()
        .map(|line| line.trim_start_matches("./"))
        .find_map(|line| line.split('/').next().filter(|seg| !seg.is_empty() && *seg != "."))
        .map(str::to_string)
}

fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(format!("remove {}", path.display()), e)),
    }
}
