//! The patch set that turns a stock source tree into the candidate.
//!
//! A patch set is a list of whole-file replacements plus an optional build-recipe line
//! (`<module> <source>`) that registers a new compiled module with the runtime's build.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Recipe file (relative to the tree root) that receives the module line.
pub const DEFAULT_RECIPE_PATH: &str = "Modules/Setup.local";

/// Replace `target` (relative to the tree root) with the contents of `source`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceOverride {
    pub target: PathBuf,
    pub source: PathBuf,
}

impl FromStr for SourceOverride {
    type Err = String;

    /// Parses `TARGET=SOURCE`, e.g. `Modules/fastcopy.c=./fastcopy.c`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (target, source) = s
            .split_once('=')
            .ok_or_else(|| format!("expected TARGET=SOURCE, got `{s}`"))?;
        if target.is_empty() || source.is_empty() {
            return Err(format!("expected TARGET=SOURCE, got `{s}`"));
        }
        Ok(Self {
            target: PathBuf::from(target),
            source: PathBuf::from(source),
        })
    }
}

/// One line of the build recipe associating a module name with its source file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeFragment {
    pub module: String,
    pub source: String,
}

impl RecipeFragment {
    pub fn new(module: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            source: source.into(),
        }
    }

    pub fn render(&self) -> String {
        format!("{} {}\n", self.module, self.source)
    }
}

impl FromStr for RecipeFragment {
    type Err = String;

    /// Accepts `NAME=SOURCE` or the recipe's own `NAME SOURCE` form.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (module, source) = s
            .split_once('=')
            .or_else(|| s.trim().split_once(char::is_whitespace))
            .ok_or_else(|| format!("expected NAME=SOURCE, got `{s}`"))?;
        let (module, source) = (module.trim(), source.trim());
        if module.is_empty() || source.is_empty() || module.contains(char::is_whitespace) {
            return Err(format!("expected NAME=SOURCE, got `{s}`"));
        }
        Ok(Self::new(module, source))
    }
}

/// Content hash of one replacement file, recorded in the report for provenance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDigest {
    pub target: String,
    pub source: String,
    pub sha256: String,
}

#[derive(Clone, Debug)]
pub struct PatchSet {
    overrides: Vec<SourceOverride>,
    recipe: Option<RecipeFragment>,
    recipe_path: PathBuf,
}

impl Default for PatchSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchSet {
    pub fn new() -> Self {
        Self {
            overrides: Vec::new(),
            recipe: None,
            recipe_path: PathBuf::from(DEFAULT_RECIPE_PATH),
        }
    }

    /// The stock deepcopy experiment: a C accelerator module plus a rewired `copy.py`,
    /// both expected next to the source archive in `root`.
    pub fn deepcopy_default(root: &Path) -> Self {
        Self::new()
            .with_override("Modules/fastcopy.c", root.join("fastcopy.c"))
            .with_override("Lib/copy.py", root.join("copy.py"))
            .with_recipe(RecipeFragment::new("fastcopy", "fastcopy.c"))
    }

    /// Every regular file under `dir` overrides the file at the same relative path.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut set = Self::new();
        for entry in walkdir::WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                PipelineError::InvalidPatch(format!("cannot walk {}: {e}", dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let target = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| PipelineError::InvalidPatch(e.to_string()))?
                .to_path_buf();
            set.overrides.push(SourceOverride {
                target,
                source: entry.path().to_path_buf(),
            });
        }
        Ok(set)
    }

    pub fn with_override(mut self, target: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        self.push_override(SourceOverride {
            target: target.into(),
            source: source.into(),
        });
        self
    }

    /// Later overrides for the same target replace earlier ones.
    pub fn push_override(&mut self, ov: SourceOverride) {
        self.overrides.retain(|existing| existing.target != ov.target);
        self.overrides.push(ov);
    }

    pub fn with_recipe(mut self, recipe: RecipeFragment) -> Self {
        self.recipe = Some(recipe);
        self
    }

    pub fn set_recipe(&mut self, recipe: Option<RecipeFragment>) {
        self.recipe = recipe;
    }

    pub fn overrides(&self) -> &[SourceOverride] {
        &self.overrides
    }

    pub fn recipe(&self) -> Option<&RecipeFragment> {
        self.recipe.as_ref()
    }

    /// Checked before the baseline build starts so a typo does not cost a full build.
    pub fn validate(&self) -> Result<()> {
        if self.overrides.is_empty() {
            return Err(PipelineError::InvalidPatch(
                "at least one source override is required".to_string(),
            ));
        }
        for ov in &self.overrides {
            if !is_tree_relative(&ov.target) {
                return Err(PipelineError::InvalidPatch(format!(
                    "override target {} must be a relative path inside the source tree",
                    ov.target.display()
                )));
            }
            if !ov.source.is_file() {
                return Err(PipelineError::InvalidPatch(format!(
                    "override source {} does not exist",
                    ov.source.display()
                )));
            }
        }
        Ok(())
    }

    /// Write every override (and the recipe line) into an extracted tree.
    pub fn apply(&self, tree: &Path) -> Result<()> {
        for ov in &self.overrides {
            let dest = tree.join(&ov.target);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::io(format!("create {}", parent.display()), e))?;
            }
            fs::copy(&ov.source, &dest).map_err(|e| {
                PipelineError::io(
                    format!("copy {} -> {}", ov.source.display(), dest.display()),
                    e,
                )
            })?;
            debug!(file = %ov.target.display(), from = %ov.source.display(), "override applied");
        }

        if let Some(recipe) = &self.recipe {
            let dest = tree.join(&self.recipe_path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::io(format!("create {}", parent.display()), e))?;
            }
            fs::write(&dest, recipe.render())
                .map_err(|e| PipelineError::io(format!("write {}", dest.display()), e))?;
            debug!(module = %recipe.module, recipe = %dest.display(), "recipe fragment written");
        }
        Ok(())
    }

    pub fn digests(&self) -> Result<Vec<PatchDigest>> {
        self.overrides
            .iter()
            .map(|ov| {
                let digest = sha256_file(&ov.source)?;
                Ok(PatchDigest {
                    target: ov.target.display().to_string(),
                    source: ov.source.display().to_string(),
                    sha256: hex32(digest),
                })
            })
            .collect()
    }
}

fn is_tree_relative(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn sha256_file(path: &Path) -> Result<[u8; 32]> {
    let bytes =
        fs::read(path).map_err(|e| PipelineError::io(format!("read {}", path.display()), e))?;
    Ok(Sha256::digest(&bytes).into())
}

fn hex32(d: [u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in d {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
