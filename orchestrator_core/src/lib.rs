//! Provisioning orchestrator.
//!
//! One spawned task per cluster drives the state machine from `pending`
//! through `provisioning` to `ready` or `failed`, owning that cluster's
//! job record. Every event flows through a single bounded channel whose
//! drain persists it and then broadcasts it, so subscribers and history
//! agree on order.

pub mod api;
pub mod config;

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kubesmith_shared_types::{
    ClusterId, ClusterSpec, ClusterStatus, JobId, JobStatus, NewEvent, NodeStatus, ProvisionError,
};
use observability::EventHub;
use provisioner_interface::{
    emit, EventSink, ProvisionerDeps, ProvisionerRegistry, ProvisionEvent,
};
use remote_shell_interface::ShellConnector;
use repository_interface::{JobUpdate, Repository};

/// Buffer between event producers (orchestrator + provisioner) and the
/// persist-then-broadcast drain.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Drives cluster provisioning tasks. Process-wide; collaborators are
/// shared handles.
pub struct Orchestrator {
    repository: Arc<dyn Repository>,
    hub: EventHub,
    registry: Arc<ProvisionerRegistry>,
    connector: Arc<dyn ShellConnector>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<dyn Repository>,
        hub: EventHub,
        registry: Arc<ProvisionerRegistry>,
        connector: Arc<dyn ShellConnector>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            hub,
            registry,
            connector,
            shutdown,
        })
    }

    /// Spawn the provisioning task for a freshly created cluster. The
    /// request path returns as soon as this is scheduled.
    pub fn spawn_provision(
        self: &Arc<Self>,
        cluster_id: ClusterId,
        job_id: JobId,
        spec: ClusterSpec,
        provider: String,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator
                .provision(cluster_id, job_id, spec, provider)
                .await;
        })
    }

    async fn provision(
        &self,
        cluster_id: ClusterId,
        job_id: JobId,
        spec: ClusterSpec,
        provider: String,
    ) {
        let cancel = self.shutdown.child_token();
        let (events, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let drain = tokio::spawn(drain_events(
            self.repository.clone(),
            self.hub.clone(),
            cluster_id,
            event_rx,
        ));

        self.provision_inner(&cancel, cluster_id, job_id, spec, provider, &events)
            .await;

        // Flush every event before the task ends so history is complete
        // by the time the join handle resolves.
        drop(events);
        if let Err(e) = drain.await {
            error!(cluster_id, error = %e, "event drain task panicked");
        }
    }

    async fn provision_inner(
        &self,
        cancel: &CancellationToken,
        cluster_id: ClusterId,
        job_id: JobId,
        mut spec: ClusterSpec,
        provider: String,
        events: &EventSink,
    ) {
        if let Err(e) = self
            .repository
            .update_cluster_status(cluster_id, ClusterStatus::Provisioning)
            .await
        {
            error!(cluster_id, error = %e, "failed to mark cluster provisioning");
        }
        let _ = self
            .repository
            .update_job(
                job_id,
                JobUpdate::status(JobStatus::Running).with_started_at(Utc::now()),
            )
            .await;

        let deps = ProvisionerDeps {
            connector: self.connector.clone(),
            events: events.clone(),
        };
        let provisioner = match self.registry.create(&provider, deps) {
            Ok(provisioner) => provisioner,
            Err(e) => {
                return self
                    .fail(cancel, cluster_id, job_id, events, "Failed to get provisioner", e)
                    .await;
            }
        };

        if let Err(e) = provisioner.validate_spec(&mut spec) {
            return self
                .fail(cancel, cluster_id, job_id, events, "Invalid cluster spec", e)
                .await;
        }
        self.progress(job_id, 5).await;

        // Prepare every host, control planes first in spec order.
        emit(
            events,
            ProvisionEvent::info("localhost", "prepare", "Preparing hosts"),
        )
        .await;
        let hosts = spec.all_hosts();
        if let Err(e) = provisioner
            .prepare_hosts(cancel, &hosts, spec.container_runtime(), &spec.k8s_version)
            .await
        {
            return self
                .fail(cancel, cluster_id, job_id, events, "Failed to prepare hosts", e)
                .await;
        }
        self.progress(job_id, 30).await;

        // Bootstrap the first control plane.
        let first = spec.control_planes[0].clone();
        emit(
            events,
            ProvisionEvent::info(first.address.as_str(), "bootstrap", "Bootstrapping control plane"),
        )
        .await;
        let result = match provisioner
            .bootstrap_control_plane(cancel, &first, &spec)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                return self
                    .fail(
                        cancel,
                        cluster_id,
                        job_id,
                        events,
                        "Failed to bootstrap control plane",
                        e,
                    )
                    .await;
            }
        };

        if let Err(e) = self
            .repository
            .update_cluster_secrets(
                cluster_id,
                &result.kubeconfig,
                &result.join_command,
                &result.certificate_key,
            )
            .await
        {
            return self
                .fail(
                    cancel,
                    cluster_id,
                    job_id,
                    events,
                    "Failed to persist cluster credentials",
                    e,
                )
                .await;
        }
        self.mark_node(cluster_id, &first.address, NodeStatus::Ready, Some(&spec.k8s_version))
            .await;
        self.progress(job_id, 55).await;

        // CNI install failure is logged, not fatal: the operator can
        // apply the manifest manually.
        emit(
            events,
            ProvisionEvent::info(first.address.as_str(), "cni", "Installing CNI"),
        )
        .await;
        if let Err(e) = provisioner
            .install_cni(cancel, &result.kubeconfig, spec.cni(), &first)
            .await
        {
            warn!(cluster_id, error = %e, "CNI install failed, continuing");
            emit(
                events,
                ProvisionEvent::error("localhost", "error", format!("Failed to install CNI: {e}")),
            )
            .await;
        }
        self.progress(job_id, 65).await;

        // Additional control planes join strictly sequentially; they
        // share the bootstrap-derived certificate key window.
        for cp in &spec.control_planes[1..] {
            if cancel.is_cancelled() {
                return self
                    .cancelled(cluster_id, job_id, events, "control-plane joins")
                    .await;
            }
            emit(
                events,
                ProvisionEvent::info(cp.address.as_str(), "join", "Joining control plane"),
            )
            .await;
            match provisioner
                .join_control_plane(cancel, cp, &result.join_command, &result.certificate_key)
                .await
            {
                Ok(()) => {
                    self.mark_node(cluster_id, &cp.address, NodeStatus::Ready, Some(&spec.k8s_version))
                        .await;
                }
                Err(e) => {
                    emit(
                        events,
                        ProvisionEvent::error(
                            cp.address.as_str(),
                            "join",
                            format!("Failed to join control plane: {e}"),
                        ),
                    )
                    .await;
                    self.mark_node(cluster_id, &cp.address, NodeStatus::NotReady, None)
                        .await;
                }
            }
        }
        self.progress(job_id, 80).await;

        // Workers join sequentially; a failed join leaves that node
        // behind without failing the cluster.
        for worker in &spec.workers {
            if cancel.is_cancelled() {
                return self
                    .cancelled(cluster_id, job_id, events, "worker joins")
                    .await;
            }
            emit(
                events,
                ProvisionEvent::info(worker.address.as_str(), "join", "Joining worker"),
            )
            .await;
            match provisioner
                .join_worker(cancel, worker, &result.join_command)
                .await
            {
                Ok(()) => {
                    self.mark_node(
                        cluster_id,
                        &worker.address,
                        NodeStatus::Ready,
                        Some(&spec.k8s_version),
                    )
                    .await;
                }
                Err(e) => {
                    emit(
                        events,
                        ProvisionEvent::error(
                            worker.address.as_str(),
                            "join",
                            format!("Failed to join worker: {e}"),
                        ),
                    )
                    .await;
                    self.mark_node(cluster_id, &worker.address, NodeStatus::NotReady, None)
                        .await;
                }
            }
        }
        self.progress(job_id, 95).await;

        if let Err(e) = self
            .repository
            .update_cluster_status(cluster_id, ClusterStatus::Ready)
            .await
        {
            return self
                .fail(
                    cancel,
                    cluster_id,
                    job_id,
                    events,
                    "Failed to mark cluster ready",
                    e,
                )
                .await;
        }
        emit(
            events,
            ProvisionEvent::info("localhost", "complete", "Cluster provisioned successfully"),
        )
        .await;
        let _ = self
            .repository
            .update_job(
                job_id,
                JobUpdate::status(JobStatus::Completed)
                    .with_progress(100)
                    .with_finished_at(Utc::now()),
            )
            .await;
        info!(cluster_id, "cluster provisioned");
    }

    /// Record a fatal provisioning failure: error event, cluster
    /// `failed`, job terminated with the same error. A failure observed
    /// after shutdown began is recorded as a cancellation instead.
    async fn fail(
        &self,
        cancel: &CancellationToken,
        cluster_id: ClusterId,
        job_id: JobId,
        events: &EventSink,
        context: &str,
        err: ProvisionError,
    ) {
        if cancel.is_cancelled() {
            return self.cancelled(cluster_id, job_id, events, context).await;
        }

        let message = format!("{context}: {err}");
        error!(cluster_id, "{message}");
        emit(
            events,
            ProvisionEvent::error("localhost", "error", message.clone()),
        )
        .await;

        if let Err(e) = self
            .repository
            .update_cluster_status(cluster_id, ClusterStatus::Failed)
            .await
        {
            error!(cluster_id, error = %e, "failed to mark cluster failed");
        }
        let _ = self
            .repository
            .update_job(
                job_id,
                JobUpdate::status(JobStatus::Failed)
                    .with_error(message)
                    .with_finished_at(Utc::now()),
            )
            .await;
    }

    /// Shutdown reached this cluster mid-provision: stop issuing work,
    /// record a final warning, and leave the cluster where it got to.
    async fn cancelled(
        &self,
        cluster_id: ClusterId,
        job_id: JobId,
        events: &EventSink,
        stage: &str,
    ) {
        let message = format!("Provisioning cancelled during {stage}");
        warn!(cluster_id, "{message}");
        emit(events, ProvisionEvent::warn("localhost", "error", message.clone())).await;
        let _ = self
            .repository
            .update_job(
                job_id,
                JobUpdate::status(JobStatus::Cancelled)
                    .with_error(message)
                    .with_finished_at(Utc::now()),
            )
            .await;
    }

    async fn progress(&self, job_id: JobId, progress: u8) {
        if let Err(e) = self
            .repository
            .update_job(job_id, JobUpdate::default().with_progress(progress))
            .await
        {
            warn!(job_id, error = %e, "failed to update job progress");
        }
    }

    async fn mark_node(
        &self,
        cluster_id: ClusterId,
        address: &str,
        status: NodeStatus,
        k8s_version: Option<&str>,
    ) {
        let node = match self.repository.find_node_by_address(cluster_id, address).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!(cluster_id, address, "no node record for host");
                return;
            }
            Err(e) => {
                warn!(cluster_id, address, error = %e, "failed to look up node");
                return;
            }
        };
        if let Err(e) = self
            .repository
            .update_node_status(node.id, status, k8s_version)
            .await
        {
            warn!(cluster_id, address, error = %e, "failed to update node status");
        }
    }
}

/// Persist each event, then broadcast it. Single consumer per
/// provisioning run keeps the per-cluster order total and makes
/// history-replay semantics consistent with live delivery.
async fn drain_events(
    repository: Arc<dyn Repository>,
    hub: EventHub,
    cluster_id: ClusterId,
    mut event_rx: mpsc::Receiver<ProvisionEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        let mut record = NewEvent::new(
            cluster_id,
            event.level,
            event.host,
            event.step,
            event.message,
        );
        record.timestamp = event.timestamp;
        record.output = event.output;

        match repository.insert_event(record).await {
            Ok(persisted) => hub.broadcast(persisted).await,
            Err(e) => {
                // Broadcasting an unpersisted event would let live
                // subscribers see history that replay can never serve.
                error!(cluster_id, error = %e, "failed to persist event, dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubesmith_shared_types::EventLevel as Level;
    use repository_interface::InMemoryRepository;

    #[tokio::test]
    async fn drain_persists_before_broadcast() {
        let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let (hub, hub_loop) = EventHub::new();
        tokio::spawn(hub_loop.run());

        let mut subscription = hub.subscribe(1).await;
        let (tx, rx) = mpsc::channel(8);
        let drain = tokio::spawn(drain_events(repository.clone(), hub.clone(), 1, rx));

        tx.send(ProvisionEvent::info("localhost", "prepare", "hello"))
            .await
            .unwrap();
        drop(tx);
        drain.await.unwrap();

        let live = subscription.events.recv().await.unwrap();
        assert_eq!(live.message, "hello");
        assert_eq!(live.level, Level::Info);

        // The broadcast event carries the persisted id.
        let history = repository.recent_events(1, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, live.id);
    }
}

pub use api::{build_router, ApiState};
