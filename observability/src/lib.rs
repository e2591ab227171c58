//! Event fan-out and tracing for the provisioning server.

pub mod events;
pub mod tracing_setup;
pub mod websocket;

pub use events::{EventHub, EventHubLoop, Subscription, HISTORY_REPLAY_LIMIT};
pub use tracing_setup::{init_tracing, TracingConfig};
pub use websocket::{cluster_events_handler, EventStreamState};
