use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kubesmith_shared_types::{
    ClusterSpec, Cni, ContainerRuntime, EventLevel, HostSpec, ProvisionError, Result,
};
use remote_shell_interface::ShellConnector;

/// One observation emitted by a provisioner while it works. The
/// orchestrator persists and broadcasts these; provisioners only produce
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub host: String,
    pub step: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ProvisionEvent {
    pub fn new(
        level: EventLevel,
        host: impl Into<String>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            host: host.into(),
            step: step.into(),
            message: message.into(),
            output: None,
        }
    }

    pub fn info(
        host: impl Into<String>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(EventLevel::Info, host, step, message)
    }

    pub fn warn(
        host: impl Into<String>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(EventLevel::Warn, host, step, message)
    }

    pub fn error(
        host: impl Into<String>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(EventLevel::Error, host, step, message)
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Bounded channel carrying provisioning events to their single consumer.
/// The consumer persists first, then broadcasts; a full channel
/// back-pressures the producer.
pub type EventSink = mpsc::Sender<ProvisionEvent>;

/// Send an event, tolerating a consumer that has already gone away
/// (process shutdown tears the drain down before the producer).
pub async fn emit(sink: &EventSink, event: ProvisionEvent) {
    if sink.send(event).await.is_err() {
        tracing::debug!("event sink closed, dropping provisioning event");
    }
}

/// Artifacts produced by bootstrapping the first control plane.
#[derive(Debug, Clone, Default)]
pub struct ProvisionResult {
    /// Admin credentials as produced by the bootstrap tool, verbatim.
    pub kubeconfig: Vec<u8>,
    /// Complete worker join invocation, single line.
    pub join_command: String,
    /// One-time secret allowing additional control planes to join.
    pub certificate_key: String,
}

/// Runtime information about a provisioned cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub version: String,
    pub ready: bool,
    pub node_count: usize,
}

/// A cluster provisioning strategy.
///
/// Variants are selected by the cluster's `provider` tag through the
/// registry. The single shipped variant is kubeadm; k3s and kind are the
/// expected future additions.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// The provider tag this strategy registers under.
    fn name(&self) -> &str;

    /// Apply defaults and reject invalid specifications.
    fn validate_spec(&self, spec: &mut ClusterSpec) -> Result<()>;

    /// Bring every host from bare Linux to kubeadm-ready. Hosts are
    /// prepared independently and may be worked in parallel; a single
    /// host failure fails the whole operation.
    async fn prepare_hosts(
        &self,
        cancel: &CancellationToken,
        hosts: &[HostSpec],
        runtime: ContainerRuntime,
        k8s_version: &str,
    ) -> Result<()>;

    /// Initialize the first control plane and return the generated
    /// credentials and join artifacts.
    async fn bootstrap_control_plane(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        spec: &ClusterSpec,
    ) -> Result<ProvisionResult>;

    /// Apply the pod network manifest and wait for it to settle. A wait
    /// timeout is a warning; a failed apply is an error.
    async fn install_cni(
        &self,
        cancel: &CancellationToken,
        kubeconfig: &[u8],
        cni: Cni,
        control_plane: &HostSpec,
    ) -> Result<()>;

    /// Attach an additional control plane using the bootstrap-derived
    /// certificate key.
    async fn join_control_plane(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        join_command: &str,
        certificate_key: &str,
    ) -> Result<()>;

    /// Attach a worker.
    async fn join_worker(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        join_command: &str,
    ) -> Result<()>;

    /// Reset every host best-effort. Individual host failures are
    /// warnings, never fatal.
    async fn destroy_cluster(&self, cancel: &CancellationToken, spec: &ClusterSpec) -> Result<()>;

    /// Mint a fresh join token. Declared; not implemented yet.
    async fn generate_join_token(
        &self,
        cancel: &CancellationToken,
        kubeconfig: &[u8],
        control_plane: bool,
    ) -> Result<String>;

    /// Introspect a running cluster. Declared; not implemented yet.
    async fn get_cluster_info(
        &self,
        cancel: &CancellationToken,
        kubeconfig: &[u8],
    ) -> Result<ClusterInfo>;

    /// Detach a single node (reset-only; drain is an open item).
    async fn remove_node(
        &self,
        cancel: &CancellationToken,
        host: &HostSpec,
        kubeconfig: &[u8],
    ) -> Result<()>;
}

/// Everything a provisioner needs from its surroundings.
#[derive(Clone)]
pub struct ProvisionerDeps {
    pub connector: Arc<dyn ShellConnector>,
    pub events: EventSink,
}

pub type ProvisionerFactory =
    Box<dyn Fn(ProvisionerDeps) -> Result<Arc<dyn Provisioner>> + Send + Sync>;

/// Maps provider tags to provisioner factories. Built once at startup and
/// passed to the orchestrator as an explicit dependency.
#[derive(Default)]
pub struct ProvisionerRegistry {
    factories: HashMap<String, ProvisionerFactory>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ProvisionerFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiate the provisioner registered under `name`.
    pub fn create(&self, name: &str, deps: ProvisionerDeps) -> Result<Arc<dyn Provisioner>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ProvisionError::ProvisionerNotFound(name.to_string()))?;
        factory(deps)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_shell_interface::ScriptedConnector;

    struct NoopProvisioner;

    #[async_trait]
    impl Provisioner for NoopProvisioner {
        fn name(&self) -> &str {
            "noop"
        }

        fn validate_spec(&self, spec: &mut ClusterSpec) -> Result<()> {
            spec.validate()
        }

        async fn prepare_hosts(
            &self,
            _cancel: &CancellationToken,
            _hosts: &[HostSpec],
            _runtime: ContainerRuntime,
            _k8s_version: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn bootstrap_control_plane(
            &self,
            _cancel: &CancellationToken,
            _host: &HostSpec,
            _spec: &ClusterSpec,
        ) -> Result<ProvisionResult> {
            Ok(ProvisionResult::default())
        }

        async fn install_cni(
            &self,
            _cancel: &CancellationToken,
            _kubeconfig: &[u8],
            _cni: Cni,
            _control_plane: &HostSpec,
        ) -> Result<()> {
            Ok(())
        }

        async fn join_control_plane(
            &self,
            _cancel: &CancellationToken,
            _host: &HostSpec,
            _join_command: &str,
            _certificate_key: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn join_worker(
            &self,
            _cancel: &CancellationToken,
            _host: &HostSpec,
            _join_command: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn destroy_cluster(
            &self,
            _cancel: &CancellationToken,
            _spec: &ClusterSpec,
        ) -> Result<()> {
            Ok(())
        }

        async fn generate_join_token(
            &self,
            _cancel: &CancellationToken,
            _kubeconfig: &[u8],
            _control_plane: bool,
        ) -> Result<String> {
            Err(ProvisionError::NotImplemented("join token".into()))
        }

        async fn get_cluster_info(
            &self,
            _cancel: &CancellationToken,
            _kubeconfig: &[u8],
        ) -> Result<ClusterInfo> {
            Err(ProvisionError::NotImplemented("cluster info".into()))
        }

        async fn remove_node(
            &self,
            _cancel: &CancellationToken,
            _host: &HostSpec,
            _kubeconfig: &[u8],
        ) -> Result<()> {
            Err(ProvisionError::NotImplemented("remove node".into()))
        }
    }

    fn deps() -> ProvisionerDeps {
        let (events, _rx) = mpsc::channel(16);
        ProvisionerDeps {
            connector: Arc::new(ScriptedConnector::new()),
            events,
        }
    }

    #[test]
    fn registry_resolves_registered_provider() {
        let mut registry = ProvisionerRegistry::new();
        registry.register("noop", Box::new(|_deps| Ok(Arc::new(NoopProvisioner))));

        let provisioner = registry.create("noop", deps()).unwrap();
        assert_eq!(provisioner.name(), "noop");
    }

    #[test]
    fn registry_rejects_unknown_provider() {
        let registry = ProvisionerRegistry::new();
        let err = match registry.create("k3s", deps()) {
            Err(e) => e,
            Ok(_) => panic!("expected unknown provisioner to fail"),
        };
        assert!(matches!(err, ProvisionError::ProvisionerNotFound(name) if name == "k3s"));
    }

    #[tokio::test]
    async fn emit_tolerates_closed_sink() {
        let (sink, rx) = mpsc::channel(1);
        drop(rx);
        emit(&sink, ProvisionEvent::info("localhost", "prepare", "hello")).await;
    }

    #[test]
    fn event_constructors_set_levels() {
        assert_eq!(
            ProvisionEvent::warn("10.0.0.1", "cni", "slow").level,
            EventLevel::Warn
        );
        assert_eq!(
            ProvisionEvent::error("10.0.0.1", "join", "boom").level,
            EventLevel::Error
        );
    }
}
