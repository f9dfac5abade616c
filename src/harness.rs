//! Blocking subprocess invocation shared by every pipeline stage.
//!
//! Each external tool (tar, configure, make, pyperformance, perf, the interpreter itself)
//! goes through [`Invocation`]. Calls never time out: the pipeline waits for the child to
//! exit and then inspects its status.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// What happens to the child's stdout/stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Capture both streams; they are returned in [`Completed`].
    Capture,
    /// Let the child write straight to the terminal (long-running tools with progress output).
    Stream,
}

#[derive(Clone, Debug)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    mode: OutputMode,
}

/// A child process that ran to completion, successfully or not.
#[derive(Clone, Debug)]
pub struct Completed {
    pub command: String,
    /// `None` when the child was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl Completed {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Status to propagate; signal deaths count as a generic failure.
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(1)
    }

    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }

    pub fn into_failure(self) -> PipelineError {
        let code = self.exit_code();
        PipelineError::CommandFailed {
            command: self.command,
            code,
            stderr: self.stderr,
        }
    }
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            mode: OutputMode::Capture,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn streamed(mut self) -> Self {
        self.mode = OutputMode::Stream;
        self
    }

    /// Human-readable command line, used for logs and error reports.
    ///
    /// Multi-line arguments (inline scripts passed with `-c`) are elided.
    pub fn display(&self) -> String {
        let mut out = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            out.push(' ');
            if arg.contains('\n') {
                out.push_str("<script>");
            } else {
                out.push_str(&arg);
            }
        }
        out
    }

    /// Run to completion and return whatever status the child produced.
    ///
    /// Only a failure to launch the program is an error here.
    pub fn run(&self) -> Result<Completed> {
        let command = self.display();
        info!(command = %command, "running");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let completed = match self.mode {
            OutputMode::Capture => {
                let output = cmd.output().map_err(|source| PipelineError::Spawn {
                    command: command.clone(),
                    source,
                })?;
                Completed {
                    command,
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    elapsed: start.elapsed(),
                }
            }
            OutputMode::Stream => {
                let status = cmd.status().map_err(|source| PipelineError::Spawn {
                    command: command.clone(),
                    source,
                })?;
                Completed {
                    command,
                    code: status.code(),
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed: start.elapsed(),
                }
            }
        };

        debug!(
            command = %completed.command,
            code = ?completed.code,
            elapsed_s = completed.elapsed.as_secs_f64(),
            "finished"
        );
        Ok(completed)
    }

    /// Run and turn a non-zero exit into [`PipelineError::CommandFailed`].
    pub fn run_checked(&self) -> Result<Completed> {
        let completed = self.run()?;
        if completed.success() {
            Ok(completed)
        } else {
            Err(completed.into_failure())
        }
    }
}
