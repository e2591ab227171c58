//! Idempotent host preparation.
//!
//! Drives a single host from bare Linux to kubeadm-ready: swap off, kernel
//! modules, sysctl, container runtime, Kubernetes tools. Every step is
//! written so that re-running it on a partially prepared host converges
//! instead of failing.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kubesmith_shared_types::{ContainerRuntime, HostSpec, ProvisionError, Result};
use provisioner_interface::{emit, EventSink, ProvisionEvent};
use remote_shell_interface::{RemoteShell, ShellConnector};

const DISABLE_SWAP: &str = "swapoff -a && sed -i '/ swap / s/^/#/' /etc/fstab";

const LOAD_KERNEL_MODULES: &str = r#"
cat <<EOF | tee /etc/modules-load.d/k8s.conf
overlay
br_netfilter
EOF
modprobe overlay
modprobe br_netfilter
"#;

const CONFIGURE_SYSCTL: &str = r#"
cat <<EOF | tee /etc/sysctl.d/k8s.conf
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF
sysctl --system
"#;

const INSTALL_CONTAINERD: &str = r#"
# Install dependencies
apt-get update
apt-get install -y apt-transport-https ca-certificates curl gnupg lsb-release

# Add Docker's official GPG key
mkdir -p /etc/apt/keyrings
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | gpg --dearmor -o /etc/apt/keyrings/docker.gpg

# Set up the repository
echo "deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable" | tee /etc/apt/sources.list.d/docker.list > /dev/null

# Install containerd
apt-get update
apt-get install -y containerd.io

# Configure containerd
mkdir -p /etc/containerd
containerd config default | tee /etc/containerd/config.toml
sed -i 's/SystemdCgroup = false/SystemdCgroup = true/g' /etc/containerd/config.toml

# Restart containerd
systemctl restart containerd
systemctl enable containerd
"#;

/// Prepares hosts for one (runtime, version) pair. Cheap to construct;
/// the orchestrator's provisioner makes one per prepare_hosts call.
pub struct HostPreparer {
    connector: Arc<dyn ShellConnector>,
    events: EventSink,
    runtime: ContainerRuntime,
    k8s_version: String,
}

impl HostPreparer {
    pub fn new(
        connector: Arc<dyn ShellConnector>,
        events: EventSink,
        runtime: ContainerRuntime,
        k8s_version: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            events,
            runtime,
            k8s_version: k8s_version.into(),
        }
    }

    /// Run the full preparation sequence against one host.
    pub async fn prepare(&self, cancel: &CancellationToken, host: &HostSpec) -> Result<()> {
        let shell = match self.connector.connect(host).await {
            Ok(shell) => shell,
            Err(e) => {
                let err = ProvisionError::from(e);
                return Err(self
                    .step_failed(host, "probe", "failed to connect", err)
                    .await);
            }
        };

        let result = self.prepare_with_shell(cancel, host, shell.as_ref()).await;
        let _ = shell.close().await;
        result
    }

    async fn prepare_with_shell(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        shell: &dyn RemoteShell,
    ) -> Result<()> {
        self.emit_info(host, "probe", "Connected to host").await;

        if let Err(e) = shell.test_connection(cancel).await {
            return Err(self
                .step_failed(host, "probe", "connection test failed", e.into())
                .await);
        }

        let swap_enabled = shell
            .host_info(cancel)
            .await
            .ok()
            .and_then(|info| info.get("swap_enabled").cloned())
            .is_some_and(|v| v == "true");
        if swap_enabled {
            self.emit_info(host, "swap", "Disabling swap").await;
            if let Err(e) = shell.run_checked(cancel, DISABLE_SWAP).await {
                return Err(self
                    .step_failed(host, "swap", "failed to disable swap", e.into())
                    .await);
            }
        }

        self.emit_info(host, "kernel-modules", "Loading kernel modules")
            .await;
        if let Err(e) = shell.run_checked(cancel, LOAD_KERNEL_MODULES).await {
            return Err(self
                .step_failed(host, "kernel-modules", "failed to load kernel modules", e.into())
                .await);
        }

        self.emit_info(host, "sysctl", "Configuring sysctl parameters")
            .await;
        if let Err(e) = shell.run_checked(cancel, CONFIGURE_SYSCTL).await {
            return Err(self
                .step_failed(host, "sysctl", "failed to configure sysctl", e.into())
                .await);
        }

        self.install_container_runtime(cancel, host, shell).await?;
        self.install_kubernetes_tools(cancel, host, shell).await?;

        info!(host = %host.address, "host prepared");
        Ok(())
    }

    async fn install_container_runtime(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        shell: &dyn RemoteShell,
    ) -> Result<()> {
        self.emit_info(
            host,
            "install-runtime",
            format!("Installing {}", self.runtime),
        )
        .await;

        match self.runtime {
            ContainerRuntime::Containerd => {
                if let Err(e) = shell.run_checked(cancel, INSTALL_CONTAINERD).await {
                    return Err(self
                        .step_failed(
                            host,
                            "install-runtime",
                            "containerd installation failed",
                            e.into(),
                        )
                        .await);
                }
                self.emit_info(host, "install-runtime", "Containerd installed successfully")
                    .await;
                Ok(())
            }
            ContainerRuntime::CriO => {
                let err = ProvisionError::NotImplemented(
                    "CRI-O installation not yet implemented".to_string(),
                );
                Err(self
                    .step_failed(host, "install-runtime", "unsupported runtime", err)
                    .await)
            }
        }
    }

    async fn install_kubernetes_tools(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        shell: &dyn RemoteShell,
    ) -> Result<()> {
        self.emit_info(
            host,
            "install-k8s",
            format!("Installing Kubernetes {} tools", self.k8s_version),
        )
        .await;

        let major_minor = major_minor(&self.k8s_version)?;

        let script = format!(
            r#"
# Add Kubernetes apt repository
apt-get update
apt-get install -y apt-transport-https ca-certificates curl gpg

mkdir -p /etc/apt/keyrings
curl -fsSL https://pkgs.k8s.io/core:/stable:/v{major_minor}/deb/Release.key | gpg --dearmor -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg

echo "deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v{major_minor}/deb/ /" | tee /etc/apt/sources.list.d/kubernetes.list

# Install kubelet, kubeadm, kubectl
apt-get update
apt-get install -y kubelet kubeadm kubectl
apt-mark hold kubelet kubeadm kubectl

# Enable kubelet
systemctl enable kubelet
"#
        );

        if let Err(e) = shell.run_checked(cancel, &script).await {
            return Err(self
                .step_failed(
                    host,
                    "install-k8s",
                    "kubernetes tools installation failed",
                    e.into(),
                )
                .await);
        }

        self.emit_info(host, "install-k8s", "Kubernetes tools installed successfully")
            .await;
        Ok(())
    }

    async fn emit_info(&self, host: &HostSpec, step: &str, message: impl Into<String>) {
        emit(
            &self.events,
            ProvisionEvent::info(host.address.as_str(), step, message),
        )
        .await;
    }

    /// Emit the error event for a failed step and return the error with
    /// step context folded into its message.
    async fn step_failed(
        &self,
        host: &HostSpec,
        step: &str,
        context: &str,
        err: ProvisionError,
    ) -> ProvisionError {
        let message = format!("{context}: {err}");
        emit(
            &self.events,
            ProvisionEvent::error(host.address.as_str(), step, message.clone()),
        )
        .await;

        match err {
            ProvisionError::CommandFailed { stderr, .. } => {
                ProvisionError::CommandFailed { message, stderr }
            }
            ProvisionError::ConnectionFailed(inner) => {
                ProvisionError::ConnectionFailed(format!("{context}: {inner}"))
            }
            other => other,
        }
    }
}

/// Derive the `major.minor` package channel from a full version. Rejects a
/// version that does not split into at least two dotted components.
pub(crate) fn major_minor(version: &str) -> Result<String> {
    let mut parts = version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if !major.is_empty() && !minor.is_empty() => {
            Ok(format!("{major}.{minor}"))
        }
        _ => Err(ProvisionError::InvalidSpec(format!(
            "invalid k8s version format: {version}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubesmith_shared_types::EventLevel;
    use remote_shell_interface::ScriptedConnector;
    use tokio::sync::mpsc;

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

    fn preparer(
        connector: &ScriptedConnector,
        runtime: ContainerRuntime,
    ) -> (HostPreparer, mpsc::Receiver<ProvisionEvent>) {
        let (events, rx) = mpsc::channel(64);
        (
            HostPreparer::new(Arc::new(connector.clone()), events, runtime, "1.28.0"),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<ProvisionEvent>) -> Vec<ProvisionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn major_minor_extraction() {
        assert_eq!(major_minor("1.28.0").unwrap(), "1.28");
        assert_eq!(major_minor("1.29.3").unwrap(), "1.29");
        assert!(major_minor("1").is_err());
        assert!(major_minor("").is_err());
    }

    #[tokio::test]
    async fn prepare_runs_full_sequence() {
        let connector = ScriptedConnector::new();
        let (preparer, mut rx) = preparer(&connector, ContainerRuntime::Containerd);
        let cancel = CancellationToken::new();

        preparer.prepare(&cancel, &host("10.0.0.1")).await.unwrap();

        let commands = connector.executed_on("10.0.0.1").await;
        assert!(commands.iter().any(|c| c.contains("modprobe overlay")));
        assert!(commands.iter().any(|c| c.contains("sysctl --system")));
        assert!(commands.iter().any(|c| c.contains("containerd.io")));
        assert!(commands.iter().any(|c| c.contains("pkgs.k8s.io/core:/stable:/v1.28")));
        assert!(commands.iter().any(|c| c.contains("apt-mark hold")));
        // Swap untouched when swapon shows nothing.
        assert!(!commands.iter().any(|c| c.contains("swapoff")));

        let events = drain(&mut rx);
        assert_eq!(
            events.last().unwrap().message,
            "Kubernetes tools installed successfully"
        );
        // None of the preparer's events reuse the orchestrator's trail tags.
        assert!(events.iter().all(|e| e.step != "prepare"));
    }

    #[tokio::test]
    async fn prepare_disables_active_swap() {
        let connector = ScriptedConnector::new();
        connector
            .respond("swapon --show", "NAME TYPE SIZE\n/swapfile file 2G\n")
            .await;
        let (preparer, _rx) = preparer(&connector, ContainerRuntime::Containerd);
        let cancel = CancellationToken::new();

        preparer.prepare(&cancel, &host("10.0.0.1")).await.unwrap();

        let commands = connector.executed_on("10.0.0.1").await;
        assert!(commands.iter().any(|c| c.contains("swapoff -a")));
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let connector = ScriptedConnector::new();
        let (preparer, _rx) = preparer(&connector, ContainerRuntime::Containerd);
        let cancel = CancellationToken::new();

        preparer.prepare(&cancel, &host("10.0.0.1")).await.unwrap();
        let first = connector.executed_on("10.0.0.1").await;
        connector.clear_log().await;

        preparer.prepare(&cancel, &host("10.0.0.1")).await.unwrap();
        let second = connector.executed_on("10.0.0.1").await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cri_o_is_not_implemented() {
        let connector = ScriptedConnector::new();
        let (preparer, mut rx) = preparer(&connector, ContainerRuntime::CriO);
        let cancel = CancellationToken::new();

        let err = preparer.prepare(&cancel, &host("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotImplemented(_)));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| e.level == EventLevel::Error && e.step == "install-runtime"));
    }

    #[tokio::test]
    async fn failed_step_emits_error_and_aborts() {
        let connector = ScriptedConnector::new();
        connector.fail_on("modprobe", "module not found").await;
        let (preparer, mut rx) = preparer(&connector, ContainerRuntime::Containerd);
        let cancel = CancellationToken::new();

        let err = preparer.prepare(&cancel, &host("10.0.0.1")).await.unwrap_err();
        match err {
            ProvisionError::CommandFailed { message, stderr } => {
                assert!(message.contains("failed to load kernel modules"));
                assert_eq!(stderr, "module not found");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Sysctl and later steps never ran.
        let commands = connector.executed_on("10.0.0.1").await;
        assert!(!commands.iter().any(|c| c.contains("sysctl --system")));

        let events = drain(&mut rx);
        assert_eq!(events.last().unwrap().level, EventLevel::Error);
    }

    #[tokio::test]
    async fn connect_failure_is_connection_failed() {
        let connector = ScriptedConnector::new();
        connector.refuse_connection("10.0.0.1").await;
        let (preparer, _rx) = preparer(&connector, ContainerRuntime::Containerd);
        let cancel = CancellationToken::new();

        let err = preparer.prepare(&cancel, &host("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn malformed_version_is_rejected_before_install() {
        let connector = ScriptedConnector::new();
        let (events, _rx) = mpsc::channel(64);
        let preparer = HostPreparer::new(
            Arc::new(connector.clone()),
            events,
            ContainerRuntime::Containerd,
            "latest",
        );
        let cancel = CancellationToken::new();

        let err = preparer.prepare(&cancel, &host("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidSpec(_)));

        let commands = connector.executed_on("10.0.0.1").await;
        assert!(!commands.iter().any(|c| c.contains("pkgs.k8s.io")));
    }
}
