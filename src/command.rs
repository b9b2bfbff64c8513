//! External tool execution.
//!
//! One program, one synchronous invocation, captured output. All parsing
//! of that output belongs to the calling pipeline stage.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Captured output of a tool invocation that actually ran.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Why a tool invocation did not succeed.
///
/// `Start` means the process never ran at all (missing binary, bad
/// permissions). `Exit` means it ran and returned a non-zero status;
/// the captured output rides along for callers that want to log it.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}")]
    Exit {
        program: String,
        code: i32,
        output: ToolOutput,
    },
}

impl RunError {
    /// Captured output, when the process actually ran.
    pub fn output(&self) -> Option<&ToolOutput> {
        match self {
            RunError::Start { .. } => None,
            RunError::Exit { output, .. } => Some(output),
        }
    }
}

/// Capability to run one external program to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> Result<ToolOutput, RunError>;
}

/// Runs programs on the host. No retries, no timeout.
pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<ToolOutput, RunError> {
        debug!(program = %program.display(), ?args, "running external tool");

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RunError::Start {
                program: program.display().to_string(),
                source,
            })?;

        let captured = ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if output.status.success() {
            Ok(captured)
        } else {
            Err(RunError::Exit {
                program: program.display().to_string(),
                code: output.status.code().unwrap_or(-1),
                output: captured,
            })
        }
    }
}
