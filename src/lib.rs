use serde::{Deserialize, Serialize};
use std::fmt;

pub mod builder;
pub mod compare;
pub mod error;
pub mod harness;
pub mod metrics;
pub mod oracle;
pub mod patch;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod schema;

pub use error::{PipelineError, Result};

/// Which of the two interpreter builds an artifact or measurement belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Stock interpreter, built from the unmodified archive.
    Baseline,
    /// Interpreter built with the patch set applied.
    Candidate,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Baseline => "baseline",
            Variant::Candidate => "candidate",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
