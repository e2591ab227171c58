//! kubeadm-based cluster provisioning strategy.
//!
//! Bootstraps the first control plane with `kubeadm init`, parses the join
//! artifacts out of its output, applies the selected CNI manifest, and
//! attaches the remaining hosts with `kubeadm join`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use kubesmith_shared_types::{
    ClusterSpec, Cni, ContainerRuntime, HostSpec, ProvisionError, Result,
};
use provisioner_interface::{
    emit, ClusterInfo, EventSink, Provisioner, ProvisionerDeps, ProvisionerRegistry,
    ProvisionEvent, ProvisionResult,
};
use remote_shell_interface::{RemoteShell, ShellConnector};

use crate::preparer::HostPreparer;

pub const PROVIDER_NAME: &str = "kubeadm";

const CALICO_MANIFEST: &str =
    "https://raw.githubusercontent.com/projectcalico/calico/v3.26.1/manifests/calico.yaml";
const FLANNEL_MANIFEST: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";
const WEAVE_MANIFEST: &str =
    "https://github.com/weaveworks/weave/releases/download/v2.8.1/weave-daemonset-k8s.yaml";

const INSTALL_KUBECONFIG: &str = "mkdir -p $HOME/.kube && cp -i /etc/kubernetes/admin.conf $HOME/.kube/config && chown $(id -u):$(id -g) $HOME/.kube/config";
const READ_KUBECONFIG: &str = "cat /etc/kubernetes/admin.conf";
const WAIT_FOR_PODS: &str =
    "kubectl wait --for=condition=Ready pods --all -n kube-system --timeout=300s";
const RESET_NODE: &str = "kubeadm reset -f";
const CLEAN_NODE: &str = "rm -rf /etc/cni/net.d && rm -rf $HOME/.kube/config";

pub struct KubeadmProvisioner {
    connector: Arc<dyn ShellConnector>,
    events: EventSink,
}

impl KubeadmProvisioner {
    pub fn new(connector: Arc<dyn ShellConnector>, events: EventSink) -> Self {
        Self { connector, events }
    }

    /// Register the kubeadm factory under its provider tag.
    pub fn register(registry: &mut ProvisionerRegistry) {
        registry.register(
            PROVIDER_NAME,
            Box::new(|deps: ProvisionerDeps| {
                Ok(Arc::new(KubeadmProvisioner::new(deps.connector, deps.events))
                    as Arc<dyn Provisioner>)
            }),
        );
    }

    async fn connect(&self, host: &HostSpec) -> Result<Box<dyn RemoteShell>> {
        self.connector.connect(host).await.map_err(|e| {
            ProvisionError::ConnectionFailed(format!("failed to connect to {}: {e}", host.address))
        })
    }

    async fn emit(&self, event: ProvisionEvent) {
        emit(&self.events, event).await;
    }

    async fn reset_node(&self, cancel: &CancellationToken, host: &HostSpec) -> Result<()> {
        let shell = self.connect(host).await?;

        self.emit(ProvisionEvent::info(
            host.address.as_str(),
            "reset",
            "Running kubeadm reset",
        ))
        .await;

        let result = shell.run_checked(cancel, RESET_NODE).await;
        if result.is_ok() {
            // Best-effort cleanup of leftover network and credential state.
            let _ = shell.run(cancel, CLEAN_NODE).await;
        }
        let _ = shell.close().await;
        result.map(|_| ()).map_err(Into::into)
    }
}

#[async_trait]
impl Provisioner for KubeadmProvisioner {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn validate_spec(&self, spec: &mut ClusterSpec) -> Result<()> {
        spec.validate()
    }

    async fn prepare_hosts(
        &self,
        cancel: &CancellationToken,
        hosts: &[HostSpec],
        runtime: ContainerRuntime,
        k8s_version: &str,
    ) -> Result<()> {
        let preparer = HostPreparer::new(
            self.connector.clone(),
            self.events.clone(),
            runtime,
            k8s_version,
        );

        let preparations = hosts.iter().map(|host| {
            let preparer = &preparer;
            async move {
                preparer.prepare(cancel, host).await.map_err(|e| match e {
                    ProvisionError::CommandFailed { message, stderr } => {
                        ProvisionError::CommandFailed {
                            message: format!("failed to prepare host {}: {message}", host.address),
                            stderr,
                        }
                    }
                    other => other,
                })
            }
        });

        futures::future::try_join_all(preparations).await.map(|_| ())
    }

    async fn bootstrap_control_plane(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        spec: &ClusterSpec,
    ) -> Result<ProvisionResult> {
        let shell = self.connect(host).await?;

        self.emit(ProvisionEvent::info(
            host.address.as_str(),
            "init",
            "Initializing control plane",
        ))
        .await;

        let mut init_cmd = format!(
            "kubeadm init --pod-network-cidr={} --kubernetes-version={}",
            spec.pod_network_cidr, spec.k8s_version
        );
        if let Some(endpoint) = spec.api_server_endpoint.as_deref() {
            init_cmd.push_str(&format!(" --control-plane-endpoint={endpoint}"));
        }
        // Upload certificates so additional control planes can join.
        init_cmd.push_str(" --upload-certs");

        self.emit(ProvisionEvent::info(
            host.address.as_str(),
            "init",
            "Running kubeadm init (this may take a few minutes)",
        ))
        .await;

        let output = shell.run(cancel, &init_cmd).await.map_err(ProvisionError::from)?;
        if !output.success() {
            self.emit(ProvisionEvent::error(
                host.address.as_str(),
                "init",
                format!("kubeadm init failed: {}", output.stderr),
            ))
            .await;
            let _ = shell.close().await;
            return Err(ProvisionError::CommandFailed {
                message: format!("kubeadm init failed on {}", host.address),
                stderr: output.stderr,
            });
        }

        self.emit(ProvisionEvent::info(
            host.address.as_str(),
            "init",
            "kubeadm init completed",
        ))
        .await;

        let join_command = extract_join_command(&output.stdout);
        let certificate_key = extract_certificate_key(&output.stdout);

        self.emit(ProvisionEvent::info(
            host.address.as_str(),
            "init",
            "Retrieving kubeconfig",
        ))
        .await;

        shell
            .run_checked(cancel, INSTALL_KUBECONFIG)
            .await
            .map_err(|e| ProvisionError::CommandFailed {
                message: format!("failed to setup kubeconfig on {}", host.address),
                stderr: match e {
                    remote_shell_interface::ShellError::CommandFailed { stderr, .. } => stderr,
                    other => other.to_string(),
                },
            })?;

        let kubeconfig = shell
            .run_checked(cancel, READ_KUBECONFIG)
            .await
            .map_err(|e| ProvisionError::CommandFailed {
                message: format!("failed to retrieve kubeconfig from {}", host.address),
                stderr: match e {
                    remote_shell_interface::ShellError::CommandFailed { stderr, .. } => stderr,
                    other => other.to_string(),
                },
            })?
            .stdout
            .into_bytes();

        self.emit(ProvisionEvent::info(
            host.address.as_str(),
            "init",
            "Control plane bootstrapped successfully",
        ))
        .await;

        let _ = shell.close().await;

        Ok(ProvisionResult {
            kubeconfig,
            join_command,
            certificate_key,
        })
    }

    async fn install_cni(
        &self,
        cancel: &CancellationToken,
        _kubeconfig: &[u8],
        cni: Cni,
        control_plane: &HostSpec,
    ) -> Result<()> {
        self.emit(ProvisionEvent::info(
            control_plane.address.as_str(),
            "install-cni",
            format!("Installing {cni} CNI"),
        ))
        .await;

        let manifest = match cni {
            Cni::Calico => CALICO_MANIFEST,
            Cni::Flannel => FLANNEL_MANIFEST,
            Cni::Weave => WEAVE_MANIFEST,
            Cni::Cilium => {
                return Err(ProvisionError::NotImplemented(
                    "cilium installation requires Helm or CLI, not yet implemented".to_string(),
                ))
            }
        };

        let shell = self.connect(control_plane).await?;

        let apply_cmd = format!("kubectl apply -f {manifest}");
        let output = shell.run(cancel, &apply_cmd).await.map_err(ProvisionError::from)?;
        if !output.success() {
            self.emit(ProvisionEvent::error(
                control_plane.address.as_str(),
                "install-cni",
                format!("Failed to apply CNI: {}", output.stderr),
            ))
            .await;
            let _ = shell.close().await;
            return Err(ProvisionError::CommandFailed {
                message: format!("failed to apply {cni} manifest"),
                stderr: output.stderr,
            });
        }

        self.emit(
            ProvisionEvent::info(
                control_plane.address.as_str(),
                "install-cni",
                "CNI applied successfully",
            )
            .with_output(output.stdout),
        )
        .await;

        // Readiness is advisory: a slow rollout is a warning, not a failure.
        match shell.run(cancel, WAIT_FOR_PODS).await {
            Ok(wait) if wait.success() => {
                self.emit(ProvisionEvent::info(
                    control_plane.address.as_str(),
                    "install-cni",
                    "CNI pods are ready",
                ))
                .await;
            }
            _ => {
                self.emit(ProvisionEvent::warn(
                    control_plane.address.as_str(),
                    "install-cni",
                    "CNI pods may not be fully ready yet",
                ))
                .await;
            }
        }

        let _ = shell.close().await;
        Ok(())
    }

    async fn join_control_plane(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        join_command: &str,
        certificate_key: &str,
    ) -> Result<()> {
        let shell = self.connect(host).await?;

        self.emit(ProvisionEvent::info(
            host.address.as_str(),
            "join-cp",
            "Joining control plane",
        ))
        .await;

        let full_cmd = format!("{join_command} --control-plane --certificate-key {certificate_key}");
        let result = shell.run_checked(cancel, &full_cmd).await;
        let _ = shell.close().await;

        match result {
            Ok(_) => {
                self.emit(ProvisionEvent::info(
                    host.address.as_str(),
                    "join-cp",
                    "Control plane joined successfully",
                ))
                .await;
                Ok(())
            }
            Err(remote_shell_interface::ShellError::CommandFailed { stderr, .. }) => {
                Err(ProvisionError::CommandFailed {
                    message: format!("failed to join control plane {}", host.address),
                    stderr,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn join_worker(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        join_command: &str,
    ) -> Result<()> {
        let shell = self.connect(host).await?;

        self.emit(ProvisionEvent::info(
            host.address.as_str(),
            "join-worker",
            "Joining worker node",
        ))
        .await;

        let result = shell.run_checked(cancel, join_command).await;
        let _ = shell.close().await;

        match result {
            Ok(_) => {
                self.emit(ProvisionEvent::info(
                    host.address.as_str(),
                    "join-worker",
                    "Worker node joined successfully",
                ))
                .await;
                Ok(())
            }
            Err(remote_shell_interface::ShellError::CommandFailed { stderr, .. }) => {
                Err(ProvisionError::CommandFailed {
                    message: format!("failed to join worker {}", host.address),
                    stderr,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy_cluster(&self, cancel: &CancellationToken, spec: &ClusterSpec) -> Result<()> {
        for host in spec.all_hosts() {
            if let Err(e) = self.reset_node(cancel, &host).await {
                warn!(host = %host.address, error = %e, "failed to reset node");
                self.emit(ProvisionEvent::warn(
                    host.address.as_str(),
                    "destroy",
                    format!("Failed to reset node: {e}"),
                ))
                .await;
            }
        }
        Ok(())
    }

    async fn generate_join_token(
        &self,
        _cancel: &CancellationToken,
        _kubeconfig: &[u8],
        _control_plane: bool,
    ) -> Result<String> {
        Err(ProvisionError::NotImplemented(
            "join token generation is not implemented".to_string(),
        ))
    }

    async fn get_cluster_info(
        &self,
        _cancel: &CancellationToken,
        _kubeconfig: &[u8],
    ) -> Result<ClusterInfo> {
        Err(ProvisionError::NotImplemented(
            "cluster introspection is not implemented".to_string(),
        ))
    }

    async fn remove_node(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        _kubeconfig: &[u8],
    ) -> Result<()> {
        // Drain-before-reset is an open item; reset only for now.
        self.reset_node(cancel, host).await
    }
}

/// Extract the worker join invocation from kubeadm init output: the
/// `kubeadm join` line plus continuation lines starting with `--` or a
/// line-continuation marker, merged into a single command string.
pub fn extract_join_command(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if !line.contains("kubeadm join") {
            continue;
        }

        let mut parts = vec![line.trim().trim_end_matches('\\').trim_end().to_string()];
        for next in lines.iter().skip(i + 1).take(4) {
            let next = next.trim();
            if next.is_empty() || !(next.starts_with("--") || next.starts_with('\\')) {
                break;
            }
            let cleaned = next
                .trim_start_matches('\\')
                .trim()
                .trim_end_matches('\\')
                .trim_end();
            parts.push(cleaned.to_string());
        }
        return parts.join(" ").trim().to_string();
    }
    String::new()
}

/// Extract the certificate key: the whitespace-delimited token following
/// the `--certificate-key` flag.
pub fn extract_certificate_key(output: &str) -> String {
    for line in output.lines() {
        if let Some(idx) = line.find("--certificate-key") {
            let rest = &line[idx + "--certificate-key".len()..];
            if let Some(token) = rest.split_whitespace().next() {
                return token.to_string();
            }
        }
    }
    String::new()
}
