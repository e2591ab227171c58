//! API request handlers.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kubesmith_shared_types::{
    Cluster, ClusterId, ClusterSpec, ClusterStatus, Cni, ContainerRuntime, Event, HostSpec,
    JobType, Node, NodeId, NodeRole, NodeStatus,
};
use repository_interface::{NewCluster, NewNode};

use super::error::{ApiError, ApiResult};
use super::state::ApiState;

/// Provider tag assigned to clusters created through the API. The only
/// shipped strategy; the registry still dispatches on the stored tag.
const DEFAULT_PROVIDER: &str = "kubeadm";

/// How many events the detail and events endpoints return, newest first.
const EVENT_PAGE_SIZE: u32 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to create a new cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    #[serde(default)]
    pub k8s_version: String,
    #[serde(default)]
    pub pod_network_cidr: String,
    #[serde(default)]
    pub service_cidr: String,
    #[serde(default)]
    pub cni: Option<Cni>,
    #[serde(default)]
    pub container_runtime: Option<ContainerRuntime>,
    #[serde(default)]
    pub api_server_endpoint: Option<String>,
    #[serde(default)]
    pub control_planes: Vec<HostSpec>,
    #[serde(default)]
    pub workers: Vec<HostSpec>,
}

impl From<CreateClusterRequest> for ClusterSpec {
    fn from(req: CreateClusterRequest) -> Self {
        ClusterSpec {
            name: req.name,
            control_planes: req.control_planes,
            workers: req.workers,
            k8s_version: req.k8s_version,
            pod_network_cidr: req.pod_network_cidr,
            service_cidr: req.service_cidr,
            cni: req.cni,
            container_runtime: req.container_runtime,
            api_server_endpoint: req.api_server_endpoint,
        }
    }
}

/// Public view of a cluster. Deliberately has no secret fields: the
/// kubeconfig, join command and certificate key never leave the record
/// layer through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub id: ClusterId,
    pub name: String,
    pub k8s_version: String,
    pub pod_network_cidr: String,
    pub service_cidr: String,
    pub cni: Cni,
    pub container_runtime: ContainerRuntime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_endpoint: Option<String>,
    pub provider: String,
    pub status: ClusterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Cluster> for ClusterResponse {
    fn from(cluster: Cluster) -> Self {
        ClusterResponse {
            id: cluster.id,
            name: cluster.name,
            k8s_version: cluster.k8s_version,
            pod_network_cidr: cluster.pod_network_cidr,
            service_cidr: cluster.service_cidr,
            cni: cluster.cni,
            container_runtime: cluster.container_runtime,
            api_server_endpoint: cluster.api_server_endpoint,
            provider: cluster.provider,
            status: cluster.status,
            created_at: cluster.created_at,
            updated_at: cluster.updated_at,
        }
    }
}

/// Public view of a node. SSH key material stays out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResponse {
    pub id: NodeId,
    pub cluster_id: ClusterId,
    pub hostname: String,
    pub address: String,
    pub user: String,
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        NodeResponse {
            id: node.id,
            cluster_id: node.cluster_id,
            hostname: node.hostname,
            address: node.address,
            user: node.user,
            port: node.port,
            role: node.role,
            status: node.status,
            k8s_version: node.k8s_version,
            joined_at: node.joined_at,
        }
    }
}

/// Cluster with its nodes, as returned by list and create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterWithNodes {
    #[serde(flatten)]
    pub cluster: ClusterResponse,
    pub nodes: Vec<NodeResponse>,
}

/// Cluster with nodes and its recent event trail, as returned by get.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDetail {
    #[serde(flatten)]
    pub cluster: ClusterResponse,
    pub nodes: Vec<NodeResponse>,
    pub events: Vec<Event>,
}

/// Standard success envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// ============================================================================
// Cluster Handlers
// ============================================================================

/// List all clusters with their nodes.
pub async fn list_clusters(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let clusters = state.repository.list_clusters().await.map_err(ApiError::from)?;

    let mut items = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let nodes = state
            .repository
            .list_nodes(cluster.id)
            .await
            .map_err(ApiError::from)?;
        items.push(ClusterWithNodes {
            cluster: cluster.into(),
            nodes: nodes.into_iter().map(Into::into).collect(),
        });
    }

    Ok(Json(ApiResponse::new(items)))
}

/// Create a cluster and schedule its provisioning. The response returns
/// before provisioning begins.
pub async fn create_cluster(
    State(state): State<ApiState>,
    Json(request): Json<CreateClusterRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut spec: ClusterSpec = request.into();
    spec.validate().map_err(ApiError::from)?;

    let cluster = state
        .repository
        .create_cluster(NewCluster::from_spec(&spec, DEFAULT_PROVIDER))
        .await
        .map_err(ApiError::from)?;

    for host in &spec.control_planes {
        state
            .repository
            .create_node(new_node(cluster.id, host, NodeRole::ControlPlane, &spec))
            .await
            .map_err(ApiError::from)?;
    }
    for host in &spec.workers {
        state
            .repository
            .create_node(new_node(cluster.id, host, NodeRole::Worker, &spec))
            .await
            .map_err(ApiError::from)?;
    }

    let job = state
        .repository
        .create_job(cluster.id, JobType::Provision)
        .await
        .map_err(ApiError::from)?;

    let _provision_task = state
        .orchestrator
        .spawn_provision(cluster.id, job.id, spec, cluster.provider.clone());

    let nodes = state
        .repository
        .list_nodes(cluster.id)
        .await
        .map_err(ApiError::from)?;
    let body = ClusterWithNodes {
        cluster: cluster.into(),
        nodes: nodes.into_iter().map(Into::into).collect(),
    };

    Ok((StatusCode::CREATED, Json(ApiResponse::new(body))))
}

/// Get one cluster with nodes and recent events.
pub async fn get_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<ClusterId>,
) -> ApiResult<impl IntoResponse> {
    let cluster = state
        .repository
        .get_cluster(cluster_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Cluster not found"))?;

    let nodes = state
        .repository
        .list_nodes(cluster_id)
        .await
        .map_err(ApiError::from)?;
    let events = state
        .repository
        .recent_events(cluster_id, EVENT_PAGE_SIZE)
        .await
        .map_err(ApiError::from)?;

    let body = ClusterDetail {
        cluster: cluster.into(),
        nodes: nodes.into_iter().map(Into::into).collect(),
        events,
    };
    Ok(Json(ApiResponse::new(body)))
}

/// Delete a cluster. Tombstones the record and its nodes; resetting the
/// hosts first remains an open item.
pub async fn delete_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<ClusterId>,
) -> ApiResult<impl IntoResponse> {
    let _ = state
        .repository
        .get_cluster(cluster_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Cluster not found"))?;

    state
        .repository
        .update_cluster_status(cluster_id, ClusterStatus::Destroying)
        .await
        .map_err(ApiError::from)?;
    state
        .repository
        .delete_cluster(cluster_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(ApiResponse::new(MessageResponse {
        message: "Cluster deleted".to_string(),
    })))
}

/// Serve the persisted kubeconfig verbatim as a YAML attachment.
pub async fn get_kubeconfig(
    State(state): State<ApiState>,
    Path(cluster_id): Path<ClusterId>,
) -> ApiResult<impl IntoResponse> {
    let cluster = state
        .repository
        .get_cluster(cluster_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Cluster not found"))?;

    let kubeconfig = cluster
        .kubeconfig
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::not_found("Kubeconfig not available"))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-yaml"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=kubeconfig.yaml",
            ),
        ],
        kubeconfig,
    ))
}

/// The most recent events for a cluster, newest first.
pub async fn get_events(
    State(state): State<ApiState>,
    Path(cluster_id): Path<ClusterId>,
) -> ApiResult<impl IntoResponse> {
    let _ = state
        .repository
        .get_cluster(cluster_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Cluster not found"))?;

    let events = state
        .repository
        .recent_events(cluster_id, EVENT_PAGE_SIZE)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(ApiResponse::new(events)))
}

// ============================================================================
// Node Handlers (declared, not implemented)
// ============================================================================

pub async fn add_node(
    State(_state): State<ApiState>,
    Path(_cluster_id): Path<ClusterId>,
) -> ApiResult<impl IntoResponse> {
    Err::<(), _>(ApiError::not_implemented("Not yet implemented"))
}

pub async fn remove_node(
    State(_state): State<ApiState>,
    Path((_cluster_id, _node_id)): Path<(ClusterId, NodeId)>,
) -> ApiResult<impl IntoResponse> {
    Err::<(), _>(ApiError::not_implemented("Not yet implemented"))
}

// ============================================================================
// Health
// ============================================================================

pub async fn healthz() -> impl IntoResponse {
    Json(ApiResponse::new(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

fn new_node(
    cluster_id: ClusterId,
    host: &HostSpec,
    role: NodeRole,
    spec: &ClusterSpec,
) -> NewNode {
    NewNode {
        cluster_id,
        hostname: host.hostname.clone(),
        address: host.address.clone(),
        user: host.user.clone(),
        ssh_key_path: host.ssh_key_path.clone(),
        port: host.port,
        role,
        status: NodeStatus::Provisioning,
        container_runtime: Some(spec.container_runtime().to_string()),
    }
}
