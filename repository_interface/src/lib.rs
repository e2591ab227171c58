use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use kubesmith_shared_types::{
    Cluster, ClusterId, ClusterSpec, ClusterStatus, Cni, ContainerRuntime, Event, Job, JobId,
    JobStatus, JobType, NewEvent, Node, NodeId, NodeRole, NodeStatus, ProvisionError, Result,
};

/// Errors specific to repository operations
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<RepositoryError> for ProvisionError {
    fn from(err: RepositoryError) -> Self {
        ProvisionError::Repository(err.to_string())
    }
}

/// Fields required to create a cluster record. The id, timestamps and
/// secret columns are assigned by the repository.
#[derive(Debug, Clone)]
pub struct NewCluster {
    pub name: String,
    pub k8s_version: String,
    pub pod_network_cidr: String,
    pub service_cidr: String,
    pub cni: Cni,
    pub container_runtime: ContainerRuntime,
    pub api_server_endpoint: Option<String>,
    pub provider: String,
    pub status: ClusterStatus,
}

impl NewCluster {
    /// Build a pending cluster record from a validated spec.
    pub fn from_spec(spec: &ClusterSpec, provider: impl Into<String>) -> Self {
        Self {
            name: spec.name.clone(),
            k8s_version: spec.k8s_version.clone(),
            pod_network_cidr: spec.pod_network_cidr.clone(),
            service_cidr: spec.service_cidr.clone(),
            cni: spec.cni(),
            container_runtime: spec.container_runtime(),
            api_server_endpoint: spec.api_server_endpoint.clone(),
            provider: provider.into(),
            status: ClusterStatus::Pending,
        }
    }
}

/// Fields required to create a node record.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub cluster_id: ClusterId,
    pub hostname: String,
    pub address: String,
    pub user: String,
    pub ssh_key_path: Option<String>,
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub container_runtime: Option<String>,
}

/// Partial update applied to a job record. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }
}

/// Core trait for persistent state management.
///
/// This trait provides the abstraction layer for storing and retrieving
/// cluster, node, event and job records. Implementations can be in-memory
/// (for testing and development) or SQL-backed (for production).
///
/// Implementations must be safe for concurrent use: orchestrator tasks
/// write while request handlers and subscriber replay read.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Initialize the backing store (create schema where applicable).
    async fn initialize(&self) -> Result<()>;

    /// Check that the backing store is reachable.
    async fn health_check(&self) -> Result<bool>;

    // ===== Cluster Operations =====

    /// Create a cluster. Fails with a conflict when a non-deleted cluster
    /// of the same name exists.
    async fn create_cluster(&self, new: NewCluster) -> Result<Cluster>;

    /// Get a cluster by id. Tombstoned clusters are not returned.
    async fn get_cluster(&self, id: ClusterId) -> Result<Option<Cluster>>;

    /// Get a cluster by name among non-deleted clusters.
    async fn get_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>>;

    /// List all non-deleted clusters.
    async fn list_clusters(&self) -> Result<Vec<Cluster>>;

    async fn update_cluster_status(&self, id: ClusterId, status: ClusterStatus) -> Result<()>;

    /// Persist the secrets produced by bootstrap.
    async fn update_cluster_secrets(
        &self,
        id: ClusterId,
        kubeconfig: &[u8],
        join_command: &str,
        certificate_key: &str,
    ) -> Result<()>;

    /// Tombstone a cluster and all of its nodes.
    async fn delete_cluster(&self, id: ClusterId) -> Result<()>;

    // ===== Node Operations =====

    async fn create_node(&self, new: NewNode) -> Result<Node>;

    /// List the non-deleted nodes of a cluster in creation order.
    async fn list_nodes(&self, cluster_id: ClusterId) -> Result<Vec<Node>>;

    /// Update a node's status; when `k8s_version` is set the node also
    /// records its joined-at time.
    async fn update_node_status(
        &self,
        id: NodeId,
        status: NodeStatus,
        k8s_version: Option<&str>,
    ) -> Result<()>;

    /// Find a cluster's node by host address.
    async fn find_node_by_address(
        &self,
        cluster_id: ClusterId,
        address: &str,
    ) -> Result<Option<Node>>;

    // ===== Event Operations =====

    /// Append an event and return it with its assigned id. Events are
    /// insert-only.
    async fn insert_event(&self, event: NewEvent) -> Result<Event>;

    /// The most recent events of a cluster, newest first.
    async fn recent_events(&self, cluster_id: ClusterId, limit: u32) -> Result<Vec<Event>>;

    // ===== Job Operations =====

    /// Create a job. Fails with a conflict when the cluster already has a
    /// job in a non-terminal status.
    async fn create_job(&self, cluster_id: ClusterId, job_type: JobType) -> Result<Job>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// The cluster's job in `pending` or `running`, if any.
    async fn active_job(&self, cluster_id: ClusterId) -> Result<Option<Job>>;

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<()>;
}

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

/// Configuration for repository backends.
#[derive(Debug, Clone)]
pub enum RepositoryConfig {
    /// SQLite backend (default).
    Sqlite { dsn: String },
    /// In-memory backend for tests and development.
    InMemory,
}

/// Create a repository from configuration and run its schema setup.
pub async fn create_repository(config: RepositoryConfig) -> Result<Arc<dyn Repository>> {
    let repository: Arc<dyn Repository> = match config {
        RepositoryConfig::Sqlite { dsn } => Arc::new(SqliteRepository::open(&dsn).await?),
        RepositoryConfig::InMemory => Arc::new(InMemoryRepository::new()),
    };
    repository.initialize().await?;
    Ok(repository)
}
