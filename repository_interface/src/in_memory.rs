//! In-memory implementation of Repository.
//!
//! Backs tests and local development. All records live in maps behind a
//! single RwLock; id assignment mimics the SQLite autoincrement columns.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use kubesmith_shared_types::{
    Cluster, ClusterId, ClusterStatus, Event, Job, JobId, JobStatus, JobType, NewEvent, Node,
    NodeId, NodeStatus, ProvisionError, Result,
};

use crate::{JobUpdate, NewCluster, NewNode, Repository};

#[derive(Default)]
struct Inner {
    clusters: HashMap<ClusterId, Cluster>,
    nodes: HashMap<NodeId, Node>,
    events: Vec<Event>,
    jobs: HashMap<JobId, Job>,
    next_cluster_id: ClusterId,
    next_node_id: NodeId,
    next_event_id: i64,
    next_job_id: JobId,
}

#[derive(Clone, Default)]
pub struct InMemoryRepository {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    // ===== Cluster Operations =====

    async fn create_cluster(&self, new: NewCluster) -> Result<Cluster> {
        let mut inner = self.inner.write().await;
        if inner.clusters.values().any(|c| c.name == new.name) {
            return Err(ProvisionError::Conflict(format!(
                "cluster {} already exists",
                new.name
            )));
        }

        inner.next_cluster_id += 1;
        let now = Utc::now();
        let cluster = Cluster {
            id: inner.next_cluster_id,
            name: new.name,
            k8s_version: new.k8s_version,
            pod_network_cidr: new.pod_network_cidr,
            service_cidr: new.service_cidr,
            cni: new.cni,
            container_runtime: new.container_runtime,
            api_server_endpoint: new.api_server_endpoint,
            provider: new.provider,
            status: new.status,
            kubeconfig: None,
            join_command: None,
            certificate_key: None,
            created_at: now,
            updated_at: now,
        };
        inner.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    async fn get_cluster(&self, id: ClusterId) -> Result<Option<Cluster>> {
        Ok(self.inner.read().await.clusters.get(&id).cloned())
    }

    async fn get_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self
            .inner
            .read()
            .await
            .clusters
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let inner = self.inner.read().await;
        let mut clusters: Vec<Cluster> = inner.clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.id);
        Ok(clusters)
    }

    async fn update_cluster_status(&self, id: ClusterId, status: ClusterStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let cluster = inner
            .clusters
            .get_mut(&id)
            .ok_or_else(|| ProvisionError::NotFound(format!("cluster {id}")))?;
        cluster.status = status;
        cluster.updated_at = Utc::now();
        Ok(())
    }

    async fn update_cluster_secrets(
        &self,
        id: ClusterId,
        kubeconfig: &[u8],
        join_command: &str,
        certificate_key: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let cluster = inner
            .clusters
            .get_mut(&id)
            .ok_or_else(|| ProvisionError::NotFound(format!("cluster {id}")))?;
        cluster.kubeconfig = Some(kubeconfig.to_vec());
        cluster.join_command = Some(join_command.to_string());
        cluster.certificate_key = Some(certificate_key.to_string());
        cluster.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_cluster(&self, id: ClusterId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.clusters.remove(&id);
        inner.nodes.retain(|_, node| node.cluster_id != id);
        // Events are insert-only and survive the cluster.
        Ok(())
    }

    // ===== Node Operations =====

    async fn create_node(&self, new: NewNode) -> Result<Node> {
        let mut inner = self.inner.write().await;
        inner.next_node_id += 1;
        let now = Utc::now();
        let node = Node {
            id: inner.next_node_id,
            cluster_id: new.cluster_id,
            hostname: new.hostname,
            address: new.address,
            user: new.user,
            ssh_key_path: new.ssh_key_path,
            port: new.port,
            role: new.role,
            status: new.status,
            k8s_version: None,
            container_runtime: new.container_runtime,
            joined_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn list_nodes(&self, cluster_id: ClusterId) -> Result<Vec<Node>> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<Node> = inner
            .nodes
            .values()
            .filter(|n| n.cluster_id == cluster_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn update_node_status(
        &self,
        id: NodeId,
        status: NodeStatus,
        k8s_version: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| ProvisionError::NotFound(format!("node {id}")))?;
        node.status = status;
        if let Some(version) = k8s_version {
            node.k8s_version = Some(version.to_string());
            node.joined_at = Some(Utc::now());
        }
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn find_node_by_address(
        &self,
        cluster_id: ClusterId,
        address: &str,
    ) -> Result<Option<Node>> {
        Ok(self
            .inner
            .read()
            .await
            .nodes
            .values()
            .find(|n| n.cluster_id == cluster_id && n.address == address)
            .cloned())
    }

    // ===== Event Operations =====

    async fn insert_event(&self, event: NewEvent) -> Result<Event> {
        let mut inner = self.inner.write().await;
        inner.next_event_id += 1;
        let event = Event {
            id: inner.next_event_id,
            cluster_id: event.cluster_id,
            timestamp: event.timestamp,
            level: event.level,
            host: event.host,
            step: event.step,
            message: event.message,
            output: event.output,
        };
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn recent_events(&self, cluster_id: ClusterId, limit: u32) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.cluster_id == cluster_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        events.truncate(limit as usize);
        Ok(events)
    }

    // ===== Job Operations =====

    async fn create_job(&self, cluster_id: ClusterId, job_type: JobType) -> Result<Job> {
        let mut inner = self.inner.write().await;
        if let Some(active) = inner
            .jobs
            .values()
            .find(|j| j.cluster_id == cluster_id && !j.status.is_terminal())
        {
            return Err(ProvisionError::Conflict(format!(
                "cluster {} already has an active {} job",
                cluster_id, active.job_type
            )));
        }

        inner.next_job_id += 1;
        let now = Utc::now();
        let job = Job {
            id: inner.next_job_id,
            cluster_id,
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn active_job(&self, cluster_id: ClusterId) -> Result<Option<Job>> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .values()
            .find(|j| j.cluster_id == cluster_id && !j.status.is_terminal())
            .cloned())
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| ProvisionError::NotFound(format!("job {id}")))?;
        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(progress) = update.progress {
            job.progress = progress;
        }
        if update.error.is_some() {
            job.error = update.error;
        }
        if update.started_at.is_some() {
            job.started_at = update.started_at;
        }
        if update.finished_at.is_some() {
            job.finished_at = update.finished_at;
        }
        job.updated_at = Utc::now();
        Ok(())
    }
}
