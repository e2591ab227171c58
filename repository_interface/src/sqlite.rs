//! SQLite implementation of Repository using sqlx.
//!
//! This is the default, production storage backend. The schema is created
//! at open time; deletes are tombstones so that event history survives a
//! cluster removal.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row};
use std::str::FromStr;

use kubesmith_shared_types::{
    Cluster, ClusterId, ClusterStatus, Event, Job, JobId, JobStatus, JobType, NewEvent, Node,
    NodeId, NodeStatus, ProvisionError, Result,
};

use crate::{JobUpdate, NewCluster, NewNode, Repository, RepositoryError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clusters (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    name                TEXT NOT NULL,
    k8s_version         TEXT NOT NULL,
    pod_network_cidr    TEXT NOT NULL,
    service_cidr        TEXT NOT NULL,
    cni                 TEXT NOT NULL,
    container_runtime   TEXT NOT NULL,
    api_server_endpoint TEXT,
    provider            TEXT NOT NULL,
    status              TEXT NOT NULL,
    kubeconfig          BLOB,
    join_command        TEXT,
    certificate_key     TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    deleted_at          TEXT
);

CREATE TABLE IF NOT EXISTS nodes (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id        INTEGER NOT NULL,
    hostname          TEXT NOT NULL,
    address           TEXT NOT NULL,
    user              TEXT NOT NULL,
    ssh_key_path      TEXT,
    port              INTEGER NOT NULL,
    role              TEXT NOT NULL,
    status            TEXT NOT NULL,
    k8s_version       TEXT,
    container_runtime TEXT,
    joined_at         TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    deleted_at        TEXT
);
CREATE INDEX IF NOT EXISTS idx_nodes_cluster ON nodes(cluster_id);

CREATE TABLE IF NOT EXISTS events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id INTEGER NOT NULL,
    timestamp  TEXT NOT NULL,
    level      TEXT NOT NULL,
    host       TEXT NOT NULL,
    step       TEXT NOT NULL,
    message    TEXT NOT NULL,
    output     TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_cluster ON events(cluster_id);

CREATE TABLE IF NOT EXISTS jobs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id  INTEGER NOT NULL,
    job_type    TEXT NOT NULL,
    status      TEXT NOT NULL,
    progress    INTEGER NOT NULL DEFAULT 0,
    error       TEXT,
    started_at  TEXT,
    finished_at TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_cluster ON jobs(cluster_id);
"#;

/// SQLite-backed implementation of Repository.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open or create a SQLite database for the given DSN. Accepts either
    /// a plain file path or a `sqlite:` URL.
    pub async fn open(dsn: &str) -> Result<Self> {
        let options = if dsn.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(dsn)
                .map_err(|e| RepositoryError::ConnectionError(e.to_string()))?
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new()
                .filename(dsn)
                .create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| RepositoryError::ConnectionError(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing). The pool is pinned to a
    /// single connection so every query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RepositoryError::ConnectionError(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| RepositoryError::ConnectionError(e.to_string()))?;

        let repository = Self { pool };
        repository.initialize().await?;
        Ok(repository)
    }
}

fn db_err(e: sqlx::Error) -> ProvisionError {
    RepositoryError::InternalError(e.to_string()).into()
}

fn cluster_from_row(row: &SqliteRow) -> Result<Cluster> {
    let cni: String = row.try_get("cni").map_err(db_err)?;
    let runtime: String = row.try_get("container_runtime").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(Cluster {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        k8s_version: row.try_get("k8s_version").map_err(db_err)?,
        pod_network_cidr: row.try_get("pod_network_cidr").map_err(db_err)?,
        service_cidr: row.try_get("service_cidr").map_err(db_err)?,
        cni: cni.parse()?,
        container_runtime: runtime.parse()?,
        api_server_endpoint: row.try_get("api_server_endpoint").map_err(db_err)?,
        provider: row.try_get("provider").map_err(db_err)?,
        status: status.parse()?,
        kubeconfig: row.try_get("kubeconfig").map_err(db_err)?,
        join_command: row.try_get("join_command").map_err(db_err)?,
        certificate_key: row.try_get("certificate_key").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn node_from_row(row: &SqliteRow) -> Result<Node> {
    let role: String = row.try_get("role").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let port: i64 = row.try_get("port").map_err(db_err)?;

    Ok(Node {
        id: row.try_get("id").map_err(db_err)?,
        cluster_id: row.try_get("cluster_id").map_err(db_err)?,
        hostname: row.try_get("hostname").map_err(db_err)?,
        address: row.try_get("address").map_err(db_err)?,
        user: row.try_get("user").map_err(db_err)?,
        ssh_key_path: row.try_get("ssh_key_path").map_err(db_err)?,
        port: port as u16,
        role: role.parse()?,
        status: status.parse()?,
        k8s_version: row.try_get("k8s_version").map_err(db_err)?,
        container_runtime: row.try_get("container_runtime").map_err(db_err)?,
        joined_at: row.try_get("joined_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let level: String = row.try_get("level").map_err(db_err)?;

    Ok(Event {
        id: row.try_get("id").map_err(db_err)?,
        cluster_id: row.try_get("cluster_id").map_err(db_err)?,
        timestamp: row.try_get("timestamp").map_err(db_err)?,
        level: level.parse()?,
        host: row.try_get("host").map_err(db_err)?,
        step: row.try_get("step").map_err(db_err)?,
        message: row.try_get("message").map_err(db_err)?,
        output: row.try_get("output").map_err(db_err)?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let job_type: String = row.try_get("job_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let progress: i64 = row.try_get("progress").map_err(db_err)?;

    Ok(Job {
        id: row.try_get("id").map_err(db_err)?,
        cluster_id: row.try_get("cluster_id").map_err(db_err)?,
        job_type: job_type.parse()?,
        status: status.parse()?,
        progress: progress as u8,
        error: row.try_get("error").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn initialize(&self) -> Result<()> {
        self.pool.execute(SCHEMA).await.map_err(db_err)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok())
    }

    // ===== Cluster Operations =====

    async fn create_cluster(&self, new: NewCluster) -> Result<Cluster> {
        if self.get_cluster_by_name(&new.name).await?.is_some() {
            return Err(ProvisionError::Conflict(format!(
                "cluster {} already exists",
                new.name
            )));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO clusters \
             (name, k8s_version, pod_network_cidr, service_cidr, cni, container_runtime, \
              api_server_endpoint, provider, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.name)
        .bind(&new.k8s_version)
        .bind(&new.pod_network_cidr)
        .bind(&new.service_cidr)
        .bind(new.cni.to_string())
        .bind(new.container_runtime.to_string())
        .bind(&new.api_server_endpoint)
        .bind(&new.provider)
        .bind(new.status.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let id = result.last_insert_rowid();
        self.get_cluster(id)
            .await?
            .ok_or_else(|| RepositoryError::InternalError("cluster vanished after insert".into()).into())
    }

    async fn get_cluster(&self, id: ClusterId) -> Result<Option<Cluster>> {
        let row = sqlx::query("SELECT * FROM clusters WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(cluster_from_row).transpose()
    }

    async fn get_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>> {
        let row = sqlx::query("SELECT * FROM clusters WHERE name = ? AND deleted_at IS NULL")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(cluster_from_row).transpose()
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let rows = sqlx::query("SELECT * FROM clusters WHERE deleted_at IS NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(cluster_from_row).collect()
    }

    async fn update_cluster_status(&self, id: ClusterId, status: ClusterStatus) -> Result<()> {
        sqlx::query("UPDATE clusters SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_cluster_secrets(
        &self,
        id: ClusterId,
        kubeconfig: &[u8],
        join_command: &str,
        certificate_key: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE clusters SET kubeconfig = ?, join_command = ?, certificate_key = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(kubeconfig)
        .bind(join_command)
        .bind(certificate_key)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_cluster(&self, id: ClusterId) -> Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE clusters SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE nodes SET deleted_at = ?, updated_at = ? WHERE cluster_id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // ===== Node Operations =====

    async fn create_node(&self, new: NewNode) -> Result<Node> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO nodes \
             (cluster_id, hostname, address, user, ssh_key_path, port, role, status, \
              container_runtime, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.cluster_id)
        .bind(&new.hostname)
        .bind(&new.address)
        .bind(&new.user)
        .bind(&new.ssh_key_path)
        .bind(new.port as i64)
        .bind(new.role.to_string())
        .bind(new.status.to_string())
        .bind(&new.container_runtime)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let id = result.last_insert_rowid();
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        node_from_row(&row)
    }

    async fn list_nodes(&self, cluster_id: ClusterId) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT * FROM nodes WHERE cluster_id = ? AND deleted_at IS NULL ORDER BY id",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(node_from_row).collect()
    }

    async fn update_node_status(
        &self,
        id: NodeId,
        status: NodeStatus,
        k8s_version: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        match k8s_version {
            Some(version) => {
                sqlx::query(
                    "UPDATE nodes SET status = ?, k8s_version = ?, joined_at = ?, \
                     updated_at = ? WHERE id = ?",
                )
                .bind(status.to_string())
                .bind(version)
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query("UPDATE nodes SET status = ?, updated_at = ? WHERE id = ?")
                    .bind(status.to_string())
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }

    async fn find_node_by_address(
        &self,
        cluster_id: ClusterId,
        address: &str,
    ) -> Result<Option<Node>> {
        let row = sqlx::query(
            "SELECT * FROM nodes WHERE cluster_id = ? AND address = ? AND deleted_at IS NULL",
        )
        .bind(cluster_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(node_from_row).transpose()
    }

    // ===== Event Operations =====

    async fn insert_event(&self, event: NewEvent) -> Result<Event> {
        let result = sqlx::query(
            "INSERT INTO events (cluster_id, timestamp, level, host, step, message, output) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.cluster_id)
        .bind(event.timestamp)
        .bind(event.level.to_string())
        .bind(&event.host)
        .bind(&event.step)
        .bind(&event.message)
        .bind(&event.output)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Event {
            id: result.last_insert_rowid(),
            cluster_id: event.cluster_id,
            timestamp: event.timestamp,
            level: event.level,
            host: event.host,
            step: event.step,
            message: event.message,
            output: event.output,
        })
    }

    async fn recent_events(&self, cluster_id: ClusterId, limit: u32) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE cluster_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(cluster_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    // ===== Job Operations =====

    async fn create_job(&self, cluster_id: ClusterId, job_type: JobType) -> Result<Job> {
        if let Some(job) = self.active_job(cluster_id).await? {
            return Err(ProvisionError::Conflict(format!(
                "cluster {} already has an active {} job",
                cluster_id, job.job_type
            )));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO jobs (cluster_id, job_type, status, progress, created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(cluster_id)
        .bind(job_type.to_string())
        .bind(JobStatus::Pending.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let id = result.last_insert_rowid();
        self.get_job(id)
            .await?
            .ok_or_else(|| RepositoryError::InternalError("job vanished after insert".into()).into())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn active_job(&self, cluster_id: ClusterId) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE cluster_id = ? AND status IN ('pending', 'running') \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<()> {
        let current = self
            .get_job(id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(format!("job {id}")))?;

        let status = update.status.unwrap_or(current.status);
        let progress = update.progress.unwrap_or(current.progress);
        let error = update.error.or(current.error);
        let started_at = update.started_at.or(current.started_at);
        let finished_at = update.finished_at.or(current.finished_at);

        sqlx::query(
            "UPDATE jobs SET status = ?, progress = ?, error = ?, started_at = ?, \
             finished_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(progress as i64)
        .bind(error)
        .bind(started_at)
        .bind(finished_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubesmith_shared_types::{Cni, ContainerRuntime, EventLevel, NodeRole};

    fn new_cluster(name: &str) -> NewCluster {
        NewCluster {
            name: name.to_string(),
            k8s_version: "1.28.0".to_string(),
            pod_network_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            cni: Cni::Calico,
            container_runtime: ContainerRuntime::Containerd,
            api_server_endpoint: None,
            provider: "kubeadm".to_string(),
            status: ClusterStatus::Pending,
        }
    }

    fn new_node(cluster_id: ClusterId, address: &str, role: NodeRole) -> NewNode {
        NewNode {
            cluster_id,
            hostname: address.to_string(),
            address: address.to_string(),
            user: "root".to_string(),
            ssh_key_path: Some("/keys/id".to_string()),
            port: 22,
            role,
            status: NodeStatus::Provisioning,
            container_runtime: Some("containerd".to_string()),
        }
    }

    #[tokio::test]
    async fn opens_a_file_backed_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubesmith.db");

        let repo = SqliteRepository::open(path.to_str().unwrap()).await.unwrap();
        repo.initialize().await.unwrap();
        repo.create_cluster(new_cluster("persisted")).await.unwrap();

        // A second open against the same file sees the data.
        let reopened = SqliteRepository::open(path.to_str().unwrap()).await.unwrap();
        reopened.initialize().await.unwrap();
        let cluster = reopened.get_cluster_by_name("persisted").await.unwrap();
        assert!(cluster.is_some());
    }

    #[tokio::test]
    async fn cluster_crud() {
        let repo = SqliteRepository::in_memory().await.unwrap();

        let cluster = repo.create_cluster(new_cluster("alpha")).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Pending);
        assert!(cluster.kubeconfig.is_none());

        let fetched = repo.get_cluster(cluster.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "alpha");

        repo.update_cluster_status(cluster.id, ClusterStatus::Provisioning)
            .await
            .unwrap();
        let fetched = repo.get_cluster(cluster.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ClusterStatus::Provisioning);

        assert_eq!(repo.list_clusters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.create_cluster(new_cluster("alpha")).await.unwrap();

        let err = repo.create_cluster(new_cluster("alpha")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict(_)));
    }

    #[tokio::test]
    async fn name_is_reusable_after_delete() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let cluster = repo.create_cluster(new_cluster("alpha")).await.unwrap();
        repo.delete_cluster(cluster.id).await.unwrap();

        assert!(repo.get_cluster(cluster.id).await.unwrap().is_none());
        repo.create_cluster(new_cluster("alpha")).await.unwrap();
    }

    #[tokio::test]
    async fn secrets_round_trip() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let cluster = repo.create_cluster(new_cluster("alpha")).await.unwrap();

        repo.update_cluster_secrets(cluster.id, b"kubeconfig-bytes", "kubeadm join ...", "KEY")
            .await
            .unwrap();

        let fetched = repo.get_cluster(cluster.id).await.unwrap().unwrap();
        assert_eq!(fetched.kubeconfig.as_deref(), Some(&b"kubeconfig-bytes"[..]));
        assert_eq!(fetched.join_command.as_deref(), Some("kubeadm join ..."));
        assert_eq!(fetched.certificate_key.as_deref(), Some("KEY"));
    }

    #[tokio::test]
    async fn delete_tombstones_nodes() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let cluster = repo.create_cluster(new_cluster("alpha")).await.unwrap();
        repo.create_node(new_node(cluster.id, "10.0.0.1", NodeRole::ControlPlane))
            .await
            .unwrap();

        repo.delete_cluster(cluster.id).await.unwrap();
        assert!(repo.list_nodes(cluster.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn node_status_update_records_join() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let cluster = repo.create_cluster(new_cluster("alpha")).await.unwrap();
        let node = repo
            .create_node(new_node(cluster.id, "10.0.0.1", NodeRole::Worker))
            .await
            .unwrap();

        repo.update_node_status(node.id, NodeStatus::Ready, Some("1.28.0"))
            .await
            .unwrap();

        let nodes = repo.list_nodes(cluster.id).await.unwrap();
        assert_eq!(nodes[0].status, NodeStatus::Ready);
        assert_eq!(nodes[0].k8s_version.as_deref(), Some("1.28.0"));
        assert!(nodes[0].joined_at.is_some());
    }

    #[tokio::test]
    async fn events_are_ordered_and_limited() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let cluster = repo.create_cluster(new_cluster("alpha")).await.unwrap();

        for i in 0..5 {
            repo.insert_event(NewEvent::new(
                cluster.id,
                EventLevel::Info,
                "localhost",
                "prepare",
                format!("step {i}"),
            ))
            .await
            .unwrap();
        }

        let events = repo.recent_events(cluster.id, 3).await.unwrap();
        assert_eq!(events.len(), 3);
        // Newest first, ids strictly decreasing.
        assert!(events.windows(2).all(|w| w[0].id > w[1].id));
        assert_eq!(events[0].message, "step 4");
    }

    #[tokio::test]
    async fn at_most_one_active_job() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let cluster = repo.create_cluster(new_cluster("alpha")).await.unwrap();

        let job = repo
            .create_job(cluster.id, JobType::Provision)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let err = repo
            .create_job(cluster.id, JobType::Destroy)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict(_)));

        // Finishing the job admits a new one.
        repo.update_job(job.id, JobUpdate::status(JobStatus::Completed))
            .await
            .unwrap();
        repo.create_job(cluster.id, JobType::Destroy).await.unwrap();
    }

    #[tokio::test]
    async fn job_update_is_partial() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let cluster = repo.create_cluster(new_cluster("alpha")).await.unwrap();
        let job = repo
            .create_job(cluster.id, JobType::Provision)
            .await
            .unwrap();

        repo.update_job(
            job.id,
            JobUpdate::status(JobStatus::Running)
                .with_progress(40)
                .with_started_at(Utc::now()),
        )
        .await
        .unwrap();
        repo.update_job(job.id, JobUpdate::default().with_progress(55))
            .await
            .unwrap();

        let job = repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 55);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_none());
    }
}
