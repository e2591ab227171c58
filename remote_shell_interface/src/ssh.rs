//! SSH implementation of RemoteShell using russh.
//!
//! Host-key verification is accept-all, matching the current trust model
//! for user-supplied hosts. A production deployment needs a real trust
//! policy before this can face untrusted networks.

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect, Sig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kubesmith_shared_types::HostSpec;

use crate::{CommandOutput, OutputChunkFn, RemoteShell, ShellConnector, ShellError, ShellResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

struct AcceptAllHostKeys;

#[async_trait]
impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Accept-all; see module docs.
        Ok(true)
    }
}

/// Load private key material for a host: inline key first, key file second.
async fn load_key(host: &HostSpec) -> ShellResult<russh_keys::key::KeyPair> {
    let pem = if let Some(key) = host.ssh_key.as_deref().filter(|k| !k.is_empty()) {
        key.to_string()
    } else if let Some(path) = host.ssh_key_path.as_deref().filter(|p| !p.is_empty()) {
        tokio::fs::read_to_string(path).await.map_err(|e| {
            ShellError::InvalidSpec(format!("failed to read SSH key from {path}: {e}"))
        })?
    } else {
        return Err(ShellError::InvalidSpec(format!(
            "no SSH key provided for host {}",
            host.address
        )));
    };

    russh_keys::decode_secret_key(&pem, None)
        .map_err(|e| ShellError::InvalidSpec(format!("failed to parse SSH key: {e}")))
}

/// Opens `SshSession`s. Stateless; safe to share across orchestrator tasks.
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, host: &HostSpec) -> ShellResult<Box<dyn RemoteShell>> {
        let session = SshSession::connect(host.clone()).await?;
        Ok(Box::new(session))
    }
}

/// One authenticated SSH connection to a single remote host.
pub struct SshSession {
    handle: client::Handle<AcceptAllHostKeys>,
    host: HostSpec,
    closed: AtomicBool,
}

impl SshSession {
    /// Open a connection to `address:port` authenticated as `user`.
    pub async fn connect(host: HostSpec) -> ShellResult<Self> {
        let key = load_key(&host).await?;

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let addr = (host.address.as_str(), host.port);
        let connect = client::connect(config, addr, AcceptAllHostKeys);
        let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                ShellError::ConnectionFailed(format!(
                    "timed out connecting to {}:{}",
                    host.address, host.port
                ))
            })?
            .map_err(|e| {
                ShellError::ConnectionFailed(format!(
                    "failed to connect to {}:{}: {e}",
                    host.address, host.port
                ))
            })?;

        let authenticated = handle
            .authenticate_publickey(host.user.as_str(), Arc::new(key))
            .await
            .map_err(|e| {
                ShellError::ConnectionFailed(format!(
                    "authentication error for {}@{}: {e}",
                    host.user, host.address
                ))
            })?;
        if !authenticated {
            return Err(ShellError::ConnectionFailed(format!(
                "authentication rejected for {}@{}",
                host.user, host.address
            )));
        }

        debug!(host = %host.address, user = %host.user, "SSH session established");

        Ok(Self {
            handle,
            host,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> ShellResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ShellError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Run a command on a fresh channel, optionally feeding stdin and
    /// forwarding chunks. Raw bytes are kept so file transfer stays
    /// byte-accurate.
    async fn exec(
        &self,
        cancel: &CancellationToken,
        command: &str,
        stdin: Option<&[u8]>,
        on_chunk: Option<OutputChunkFn<'_>>,
    ) -> ShellResult<(Vec<u8>, Vec<u8>, u32)> {
        self.ensure_open()?;

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ShellError::ConnectionFailed(format!("failed to open channel: {e}")))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| ShellError::ConnectionFailed(format!("failed to start command: {e}")))?;

        if let Some(bytes) = stdin {
            channel
                .data(bytes)
                .await
                .map_err(|e| ShellError::ConnectionFailed(format!("failed to write stdin: {e}")))?;
            channel
                .eof()
                .await
                .map_err(|e| ShellError::ConnectionFailed(format!("failed to close stdin: {e}")))?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = 0u32;

        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if let Some(chunk_fn) = on_chunk {
                                chunk_fn(&String::from_utf8_lossy(&data));
                            }
                            stdout.extend_from_slice(&data);
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            if let Some(chunk_fn) = on_chunk {
                                chunk_fn(&String::from_utf8_lossy(&data));
                            }
                            stderr.extend_from_slice(&data);
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            exit_status = status;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        if cancelled {
            if let Err(e) = channel.signal(Sig::KILL).await {
                warn!(host = %self.host.address, error = %e, "failed to signal remote process");
            }
            return Err(ShellError::Cancelled {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }

        Ok((stdout, stderr, exit_status))
    }
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn run(&self, cancel: &CancellationToken, command: &str) -> ShellResult<CommandOutput> {
        let (stdout, stderr, exit_status) = self.exec(cancel, command, None, None).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn run_streaming(
        &self,
        cancel: &CancellationToken,
        command: &str,
        on_chunk: OutputChunkFn<'_>,
    ) -> ShellResult<CommandOutput> {
        let (stdout, stderr, exit_status) =
            self.exec(cancel, command, None, Some(on_chunk)).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
    ) -> ShellResult<()> {
        let content = tokio::fs::read(local_path).await?;
        let (_, stderr, exit_status) = self
            .exec(cancel, &format!("cat > {remote_path}"), Some(&content), None)
            .await?;
        if exit_status != 0 {
            return Err(ShellError::CommandFailed {
                message: format!("upload to {remote_path} failed"),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        local_path: &Path,
    ) -> ShellResult<()> {
        let (stdout, stderr, exit_status) = self
            .exec(cancel, &format!("cat {remote_path}"), None, None)
            .await?;
        if exit_status != 0 {
            return Err(ShellError::CommandFailed {
                message: format!("download of {remote_path} failed"),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        tokio::fs::write(local_path, stdout).await?;
        Ok(())
    }

    async fn close(&self) -> ShellResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| ShellError::ConnectionFailed(format!("disconnect failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(key: Option<&str>, key_path: Option<&str>) -> HostSpec {
        HostSpec {
            hostname: "cp1".to_string(),
            address: "10.0.0.1".to_string(),
            user: "root".to_string(),
            ssh_key: key.map(String::from),
            ssh_key_path: key_path.map(String::from),
            port: 22,
        }
    }

    #[tokio::test]
    async fn missing_key_material_is_invalid_spec() {
        let err = load_key(&host(None, None)).await.unwrap_err();
        assert!(matches!(err, ShellError::InvalidSpec(_)));
        assert!(err.to_string().contains("10.0.0.1"));
    }

    #[tokio::test]
    async fn unreadable_key_file_is_invalid_spec() {
        let err = load_key(&host(None, Some("/nonexistent/key")))
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn garbage_inline_key_is_invalid_spec() {
        let err = load_key(&host(Some("not a pem key"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::InvalidSpec(_)));
    }
}
