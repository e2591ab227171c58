use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use kubesmith_shared_types::{HostSpec, ProvisionError};

/// Captured output of one remote command. A non-zero exit status is not an
/// error at this layer; transport failures and cancellation are.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_status: 0,
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_status: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("invalid host spec: {0}")]
    InvalidSpec(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("command failed: {message}")]
    CommandFailed { message: String, stderr: String },
    #[error("command cancelled")]
    Cancelled { stdout: String, stderr: String },
    #[error("session closed")]
    SessionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ShellError> for ProvisionError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::InvalidSpec(msg) => ProvisionError::InvalidSpec(msg),
            ShellError::ConnectionFailed(msg) => ProvisionError::ConnectionFailed(msg),
            ShellError::CommandFailed { message, stderr } => {
                ProvisionError::CommandFailed { message, stderr }
            }
            ShellError::Cancelled { .. } => ProvisionError::Internal("command cancelled".into()),
            ShellError::SessionClosed => {
                ProvisionError::ConnectionFailed("session closed".to_string())
            }
            ShellError::Io(e) => ProvisionError::Internal(e.to_string()),
        }
    }
}

pub type ShellResult<T> = std::result::Result<T, ShellError>;

/// Callback receiving merged stdout/stderr chunks as they arrive.
pub type OutputChunkFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// One authenticated channel to a single remote host.
///
/// Every operation takes a cancellation token; when the token fires before
/// the remote process exits, the session signals the process to terminate
/// and returns `ShellError::Cancelled` with whatever output was captured.
/// After `close` every operation fails with `SessionClosed`.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` to completion, capturing both streams in full.
    /// Returns `Ok` even when the command exits non-zero.
    async fn run(&self, cancel: &CancellationToken, command: &str) -> ShellResult<CommandOutput>;

    /// Run `command`, delivering output chunks in arrival order. Returns
    /// when the remote process exits.
    async fn run_streaming(
        &self,
        cancel: &CancellationToken,
        command: &str,
        on_chunk: OutputChunkFn<'_>,
    ) -> ShellResult<CommandOutput>;

    /// Byte-accurate file upload over the shell channel.
    async fn upload(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
    ) -> ShellResult<()>;

    /// Byte-accurate file download over the shell channel.
    async fn download(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        local_path: &Path,
    ) -> ShellResult<()>;

    /// Release the underlying transport. Idempotent.
    async fn close(&self) -> ShellResult<()>;

    /// Run `command` and convert a non-zero exit into `CommandFailed`
    /// carrying stderr verbatim.
    async fn run_checked(
        &self,
        cancel: &CancellationToken,
        command: &str,
    ) -> ShellResult<CommandOutput> {
        let output = self.run(cancel, command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ShellError::CommandFailed {
                message: format!("command exited with status {}", output.exit_status),
                stderr: output.stderr,
            })
        }
    }

    /// One lightweight echo to prove the channel works.
    async fn test_connection(&self, cancel: &CancellationToken) -> ShellResult<()> {
        self.run_checked(cancel, "echo 'test'").await.map(|_| ())
    }

    /// Collect basic facts about the host. Keys: `hostname`, `os`,
    /// `kernel`, `swap_enabled` (`"true"`/`"false"`).
    async fn host_info(&self, cancel: &CancellationToken) -> ShellResult<HashMap<String, String>> {
        let mut info = HashMap::new();

        if let Ok(out) = self.run(cancel, "hostname").await {
            if out.success() {
                info.insert("hostname".to_string(), out.stdout.trim().to_string());
            }
        }

        if let Ok(out) = self
            .run(
                cancel,
                "cat /etc/os-release | grep PRETTY_NAME | cut -d'=' -f2 | tr -d '\"'",
            )
            .await
        {
            if out.success() {
                info.insert("os".to_string(), out.stdout.trim().to_string());
            }
        }

        if let Ok(out) = self.run(cancel, "uname -r").await {
            if out.success() {
                info.insert("kernel".to_string(), out.stdout.trim().to_string());
            }
        }

        let swap = match self.run(cancel, "swapon --show").await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => "true",
            _ => "false",
        };
        info.insert("swap_enabled".to_string(), swap.to_string());

        Ok(info)
    }
}

/// Opens authenticated shells from host specifications.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, host: &HostSpec) -> ShellResult<Box<dyn RemoteShell>>;
}

pub mod scripted;
pub mod ssh;

pub use scripted::{ScriptedConnector, ScriptedShell};
pub use ssh::{SshConnector, SshSession};
