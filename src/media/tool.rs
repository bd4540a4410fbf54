//! Bounded-timeout invocation of external media tools.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error};

/// Captured result of a finished tool run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// stderr if present, otherwise stdout
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{program} timed out after {seconds}s")]
    TimedOut { program: String, seconds: u64 },

    #[error("{program} failed to run: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `program args...`, killing it if it outlives `timeout`
pub async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<ToolOutput, ToolError> {
    let start = Instant::now();
    debug!("Executing {} {:?}", program, args);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotFound(program.to_string()),
            _ => ToolError::Io {
                program: program.to_string(),
                source: e,
            },
        })?;

    // Dropping the wait future on timeout drops the child, which kills it
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            debug!(
                "{} exited with {} in {:.2}s",
                program,
                output.status,
                start.elapsed().as_secs_f64()
            );
            Ok(ToolOutput {
                success: output.status.success(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Ok(Err(e)) => Err(ToolError::Io {
            program: program.to_string(),
            source: e,
        }),
        Err(_) => {
            error!("⏰ {} timed out after {:.1}s", program, start.elapsed().as_secs_f64());
            Err(ToolError::TimedOut {
                program: program.to_string(),
                seconds: timeout.as_secs(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_tool_is_not_found() {
        let result = run_tool(
            "whisperrr-definitely-missing-tool",
            &["-version".to_string()],
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ToolError::NotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_exit_status_and_output() {
        let output = run_tool(
            "sh",
            &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.diagnostic().trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let start = Instant::now();
        let result = run_tool("sleep", &["10".to_string()], Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ToolError::TimedOut { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
