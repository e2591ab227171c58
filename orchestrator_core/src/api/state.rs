//! API server state.

use std::sync::Arc;

use observability::EventHub;
use repository_interface::Repository;

use crate::Orchestrator;

/// Shared state for the API server.
#[derive(Clone)]
pub struct ApiState {
    /// Repository for persistence.
    pub repository: Arc<dyn Repository>,
    /// Orchestrator that provisioning tasks are handed to.
    pub orchestrator: Arc<Orchestrator>,
    /// Event hub backing the live event stream.
    pub hub: EventHub,
}

impl ApiState {
    pub fn new(
        repository: Arc<dyn Repository>,
        orchestrator: Arc<Orchestrator>,
        hub: EventHub,
    ) -> Self {
        Self {
            repository,
            orchestrator,
            hub,
        }
    }
}
