//! API route definitions.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use observability::{cluster_events_handler, EventStreamState};

use super::handlers;
use super::state::ApiState;

/// Build the API router with all routes.
pub fn build_router(state: ApiState) -> Router {
    let stream_state = EventStreamState::new(state.hub.clone(), state.repository.clone());

    let api = Router::new()
        .route(
            "/api/clusters",
            get(handlers::list_clusters).post(handlers::create_cluster),
        )
        .route(
            "/api/clusters/:id",
            get(handlers::get_cluster).delete(handlers::delete_cluster),
        )
        .route("/api/clusters/:id/nodes", post(handlers::add_node))
        .route(
            "/api/clusters/:id/nodes/:node_id",
            delete(handlers::remove_node),
        )
        .route("/api/clusters/:id/kubeconfig", get(handlers::get_kubeconfig))
        .route("/api/clusters/:id/events", get(handlers::get_events))
        .route("/healthz", get(handlers::healthz))
        .with_state(state);

    let ws = Router::new()
        .route("/ws/clusters/:id/events", get(cluster_events_handler))
        .with_state(stream_state);

    api.merge(ws)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
