//! kubectl execution.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::{
    command::{CommandBuildError, CommandBuilder, CommandParts},
    filearg::{FileArgError, decode_file_args},
};

/// Default limit for a single kubectl run.
pub const DEFAULT_KUBECTL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Execution error.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Build(#[from] CommandBuildError),
    #[error(transparent)]
    FileArg(#[from] FileArgError),
    #[error("Failed to start command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Command failed ({status}): {output}")]
    Failed { status: String, output: String },
}

/// Trait for whatever turns a command text into output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` and return its output.
    async fn execute(&self, command: &str) -> Result<String, ExecError>;
}

/// Runs command text as arguments to `kubectl`.
///
/// stdout and stderr are both captured and returned together, stderr
/// after stdout. A non-zero exit becomes [`ExecError::Failed`] carrying the
/// same output.
#[derive(Debug, Clone)]
pub struct KubectlExecutor {
    builder: CommandBuilder,
    timeout: Duration,
}

impl Default for KubectlExecutor {
    fn default() -> Self {
        Self::new(CommandBuilder::new("kubectl"))
    }
}

impl KubectlExecutor {
    /// Create an executor for a builder.
    #[must_use]
    pub const fn new(builder: CommandBuilder) -> Self {
        Self {
            builder,
            timeout: DEFAULT_KUBECTL_TIMEOUT,
        }
    }

    /// Override the execution timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CommandExecutor for KubectlExecutor {
    async fn execute(&self, command: &str) -> Result<String, ExecError> {
        let CommandParts { program, args } = self.builder.build(command)?;
        // Temp files must outlive the child process.
        let decoded = decode_file_args(&args)?;
        let (program, args) = CommandParts::new(program, decoded.args.clone())
            .into_resolved()
            .await?;

        tracing::debug!(program = %program.display(), ?args, "Running command");
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout(self.timeout))??;
        drop(decoded);

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            tracing::error!(status = %output.status, "Command failed");
            Err(ExecError::Failed {
                status: output.status.to_string(),
                output: combined,
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::filearg::encode_base64;

    fn sh(script: &str) -> KubectlExecutor {
        KubectlExecutor::new(CommandBuilder::new("sh -c").params([script.to_string()]))
    }

    #[tokio::test]
    async fn test_combined_output() {
        let output = sh("echo out; echo err >&2").execute("").await.unwrap();
        assert_eq!(output, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = sh("echo boom >&2; exit 3").execute("").await.unwrap_err();
        match err {
            ExecError::Failed { output, .. } => assert_eq!(output, "boom\n"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let err = sh("sleep 5")
            .with_timeout(Duration::from_millis(100))
            .execute("")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_decoded_file_is_readable_during_run() {
        // sh -c 'script' name arg1 ...: $1 is the first forwarded argument.
        let encoded = encode_base64(b"kind: ConfigMap");
        let output = sh(r#"cat "$2""#)
            .execute(&format!("sh -f {encoded}"))
            .await
            .unwrap();
        assert_eq!(output, "kind: ConfigMap");
    }

    #[tokio::test]
    async fn test_arguments_reach_process_verbatim() {
        let output = sh(r#"printf '%s|%s' "$1" "$2""#)
            .execute(r"label owner=o'brien app\.io")
            .await
            .unwrap();
        assert_eq!(output, r"owner=o'brien|app\.io");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = KubectlExecutor::new(CommandBuilder::new("kubegate-no-such-binary"))
            .execute("get pods")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Build(CommandBuildError::NotFound(_))));
    }
}
