use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::oracle::OracleCheck;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Every way the pipeline can abort.
///
/// Soft failures (cache flush, counter sampling, extraction misses) never become a
/// `PipelineError`; they are logged and surface as "not comparable" entries instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with status {code}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("deepcopy correctness check failed{}", describe_check(.check))]
    CorrectnessFailed {
        code: i32,
        check: Option<OracleCheck>,
        stderr: String,
    },

    #[error("source archive {} lists no entries", .0.display())]
    EmptyArchive(PathBuf),

    #[error("invalid patch set: {0}")]
    InvalidPatch(String),

    #[error("interpreter not found at {}", .0.display())]
    MissingInterpreter(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize report: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn describe_check(check: &Option<OracleCheck>) -> String {
    match check {
        Some(check) => format!(" ({check})"),
        None => String::new(),
    }
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }

    /// Exit status the process should terminate with.
    ///
    /// External tool failures propagate the tool's own status; everything internal maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::CommandFailed { code, .. }
            | PipelineError::CorrectnessFailed { code, .. } => *code,
            _ => 1,
        }
    }

    /// Captured error stream of the failing tool, if there was one.
    pub fn captured_stderr(&self) -> Option<&str> {
        match self {
            PipelineError::CommandFailed { stderr, .. }
            | PipelineError::CorrectnessFailed { stderr, .. } => Some(stderr.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_propagates_tool_status() {
        let err = PipelineError::CommandFailed {
            command: "make -j8".to_string(),
            code: 2,
            stderr: "make: *** [all] Error 2".to_string(),
        };
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.to_string(), "`make -j8` exited with status 2");
        assert_eq!(err.captured_stderr(), Some("make: *** [all] Error 2"));
    }

    #[test]
    fn correctness_failure_names_the_check() {
        let err = PipelineError::CorrectnessFailed {
            code: 1,
            check: Some(OracleCheck::CycleRewiring),
            stderr: String::new(),
        };
        assert_eq!(err.exit_code(), 1);
        assert_eq!(
            err.to_string(),
            "deepcopy correctness check failed (cycle-rewiring)"
        );
    }

    #[test]
    fn internal_errors_exit_with_one() {
        let err = PipelineError::InvalidPatch("no overrides".to_string());
        assert_eq!(err.exit_code(), 1);
        assert!(err.captured_stderr().is_none());
    }
}
