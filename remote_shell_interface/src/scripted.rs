//! Scripted fake shell for testing and development.
//!
//! Provides an in-memory implementation that answers commands from a rule
//! table instead of touching the network, and records everything that was
//! executed so tests can assert on the exact command sequence.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use kubesmith_shared_types::HostSpec;

use crate::{CommandOutput, OutputChunkFn, RemoteShell, ShellConnector, ShellError, ShellResult};

#[derive(Debug, Clone)]
struct ScriptRule {
    pattern: String,
    output: CommandOutput,
}

#[derive(Default)]
struct ScriptedInner {
    rules: Mutex<Vec<ScriptRule>>,
    refused: Mutex<Vec<String>>,
    commands: Mutex<Vec<(String, String)>>,
}

/// Connector handing out scripted shells that share one rule table and
/// one command log.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    inner: Arc<ScriptedInner>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` succeed with the given stdout.
    /// Rules match first-wins in registration order.
    pub async fn respond(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.inner.rules.lock().await.push(ScriptRule {
            pattern: pattern.into(),
            output: CommandOutput::ok(stdout),
        });
    }

    /// Commands containing `pattern` exit non-zero with the given stderr.
    pub async fn fail_on(&self, pattern: impl Into<String>, stderr: impl Into<String>) {
        self.inner.rules.lock().await.push(ScriptRule {
            pattern: pattern.into(),
            output: CommandOutput::failed(stderr),
        });
    }

    /// Connection attempts to `address` fail.
    pub async fn refuse_connection(&self, address: impl Into<String>) {
        self.inner.refused.lock().await.push(address.into());
    }

    /// Every (address, command) pair executed so far, in order.
    pub async fn executed(&self) -> Vec<(String, String)> {
        self.inner.commands.lock().await.clone()
    }

    /// Commands executed against a single address, in order.
    pub async fn executed_on(&self, address: &str) -> Vec<String> {
        self.inner
            .commands
            .lock()
            .await
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Drop the command log, keeping the rules.
    pub async fn clear_log(&self) {
        self.inner.commands.lock().await.clear();
    }
}

#[async_trait]
impl ShellConnector for ScriptedConnector {
    async fn connect(&self, host: &HostSpec) -> ShellResult<Box<dyn RemoteShell>> {
        if self.inner.refused.lock().await.contains(&host.address) {
            return Err(ShellError::ConnectionFailed(format!(
                "failed to connect to {}:{}: connection refused",
                host.address, host.port
            )));
        }
        Ok(Box::new(ScriptedShell {
            address: host.address.clone(),
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Fake shell bound to one address, answering from the connector's rules.
pub struct ScriptedShell {
    address: String,
    inner: Arc<ScriptedInner>,
    closed: AtomicBool,
}

impl ScriptedShell {
    async fn lookup(&self, command: &str) -> CommandOutput {
        let rules = self.inner.rules.lock().await;
        rules
            .iter()
            .find(|r| command.contains(&r.pattern))
            .map(|r| r.output.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn run(&self, cancel: &CancellationToken, command: &str) -> ShellResult<CommandOutput> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShellError::SessionClosed);
        }
        if cancel.is_cancelled() {
            return Err(ShellError::Cancelled {
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        self.inner
            .commands
            .lock()
            .await
            .push((self.address.clone(), command.to_string()));
        Ok(self.lookup(command).await)
    }

    async fn run_streaming(
        &self,
        cancel: &CancellationToken,
        command: &str,
        on_chunk: OutputChunkFn<'_>,
    ) -> ShellResult<CommandOutput> {
        let output = self.run(cancel, command).await?;
        if !output.stdout.is_empty() {
            on_chunk(&output.stdout);
        }
        if !output.stderr.is_empty() {
            on_chunk(&output.stderr);
        }
        Ok(output)
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
    ) -> ShellResult<()> {
        self.run_checked(
            cancel,
            &format!("cat > {remote_path} < {}", local_path.display()),
        )
        .await
        .map(|_| ())
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        local_path: &Path,
    ) -> ShellResult<()> {
        let output = self.run_checked(cancel, &format!("cat {remote_path}")).await?;
        tokio::fs::write(local_path, output.stdout).await?;
        Ok(())
    }

    async fn close(&self) -> ShellResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(address: &str) -> HostSpec {
        HostSpec {
            hostname: address.to_string(),
            address: address.to_string(),
            user: "root".to_string(),
            ssh_key: Some("key".to_string()),
            ssh_key_path: None,
            port: 22,
        }
    }

    #[tokio::test]
    async fn responds_by_substring_rule() {
        let connector = ScriptedConnector::new();
        connector.respond("uname -r", "6.5.0-generic\n").await;

        let shell = connector.connect(&host("10.0.0.1")).await.unwrap();
        let cancel = CancellationToken::new();

        let out = shell.run(&cancel, "uname -r").await.unwrap();
        assert_eq!(out.stdout, "6.5.0-generic\n");
        assert!(out.success());

        // Unmatched commands succeed with empty output.
        let out = shell.run(&cancel, "true").await.unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn records_executed_commands_per_address() {
        let connector = ScriptedConnector::new();
        let cancel = CancellationToken::new();

        let a = connector.connect(&host("10.0.0.1")).await.unwrap();
        let b = connector.connect(&host("10.0.0.2")).await.unwrap();
        a.run(&cancel, "hostname").await.unwrap();
        b.run(&cancel, "uname -r").await.unwrap();
        a.run(&cancel, "swapon --show").await.unwrap();

        assert_eq!(
            connector.executed_on("10.0.0.1").await,
            vec!["hostname".to_string(), "swapon --show".to_string()]
        );
        assert_eq!(connector.executed().await.len(), 3);
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_stderr() {
        let connector = ScriptedConnector::new();
        connector.fail_on("kubeadm join", "join blew up").await;

        let shell = connector.connect(&host("10.0.0.1")).await.unwrap();
        let cancel = CancellationToken::new();

        let err = shell
            .run_checked(&cancel, "kubeadm join 10.0.0.1:6443")
            .await
            .unwrap_err();
        match err {
            ShellError::CommandFailed { stderr, .. } => assert_eq!(stderr, "join blew up"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn refused_address_fails_to_connect() {
        let connector = ScriptedConnector::new();
        connector.refuse_connection("10.0.0.9").await;

        let err = match connector.connect(&host("10.0.0.9")).await {
            Err(e) => e,
            Ok(_) => panic!("expected connection to fail"),
        };
        assert!(matches!(err, ShellError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn closed_shell_fails_deterministically() {
        let connector = ScriptedConnector::new();
        let shell = connector.connect(&host("10.0.0.1")).await.unwrap();
        let cancel = CancellationToken::new();

        shell.close().await.unwrap();
        let err = shell.run(&cancel, "hostname").await.unwrap_err();
        assert!(matches!(err, ShellError::SessionClosed));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let connector = ScriptedConnector::new();
        let shell = connector.connect(&host("10.0.0.1")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = shell.run(&cancel, "sleep 60").await.unwrap_err();
        assert!(matches!(err, ShellError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn host_info_reads_swap_state() {
        let connector = ScriptedConnector::new();
        connector.respond("hostname", "cp1\n").await;
        connector.respond("uname -r", "6.5.0\n").await;
        connector.respond("PRETTY_NAME", "Ubuntu 22.04.3 LTS\n").await;
        connector
            .respond("swapon --show", "NAME      TYPE SIZE USED\n/swapfile file   2G   0B\n")
            .await;

        let shell = connector.connect(&host("10.0.0.1")).await.unwrap();
        let cancel = CancellationToken::new();

        let info = shell.host_info(&cancel).await.unwrap();
        assert_eq!(info.get("hostname").map(String::as_str), Some("cp1"));
        assert_eq!(info.get("os").map(String::as_str), Some("Ubuntu 22.04.3 LTS"));
        assert_eq!(info.get("swap_enabled").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn download_writes_scripted_stdout() {
        let connector = ScriptedConnector::new();
        connector
            .respond("cat /etc/kubernetes/admin.conf", "apiVersion: v1\n")
            .await;

        let shell = connector.connect(&host("10.0.0.1")).await.unwrap();
        let cancel = CancellationToken::new();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("kubeconfig.yaml");
        shell
            .download(&cancel, "/etc/kubernetes/admin.conf", &local)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&local).unwrap(), b"apiVersion: v1\n");
    }

    #[tokio::test]
    async fn streaming_delivers_chunks_in_order() {
        let connector = ScriptedConnector::new();
        connector.respond("kubeadm init", "phase one\n").await;

        let shell = connector.connect(&host("10.0.0.1")).await.unwrap();
        let cancel = CancellationToken::new();

        let chunks = std::sync::Mutex::new(Vec::new());
        shell
            .run_streaming(&cancel, "kubeadm init", &|chunk: &str| {
                chunks.lock().unwrap().push(chunk.to_string());
            })
            .await
            .unwrap();

        assert_eq!(chunks.into_inner().unwrap(), vec!["phase one\n".to_string()]);
    }
}
