//! WebSocket handler for the `/ws/clusters/{id}/events` endpoint.
//!
//! A new connection first receives up to the 50 most recent persisted
//! events in chronological order, then live events for its cluster. The
//! server pings every 30 seconds; a failed write or a client read error
//! tears the subscription down.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use kubesmith_shared_types::ClusterId;
use repository_interface::Repository;

use crate::events::{EventHub, HISTORY_REPLAY_LIMIT};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// State for the event-stream endpoint: the hub for live events and the
/// repository for history replay.
#[derive(Clone)]
pub struct EventStreamState {
    pub hub: EventHub,
    pub repository: Arc<dyn Repository>,
}

impl EventStreamState {
    pub fn new(hub: EventHub, repository: Arc<dyn Repository>) -> Self {
        Self { hub, repository }
    }
}

/// Upgrade handler for cluster event streaming.
pub async fn cluster_events_handler(
    State(state): State<EventStreamState>,
    Path(cluster_id): Path<ClusterId>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, cluster_id))
}

async fn handle_socket(socket: WebSocket, state: EventStreamState, cluster_id: ClusterId) {
    debug!(cluster_id, "event stream client connected");

    // Subscribe before replaying so no event published during the replay
    // is lost; replayed ids are used to drop the overlap.
    let mut subscription = state.hub.subscribe(cluster_id).await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut max_replayed_id = 0;
    match state
        .repository
        .recent_events(cluster_id, HISTORY_REPLAY_LIMIT)
        .await
    {
        Ok(mut history) => {
            // recent_events is newest-first; replay chronologically.
            history.reverse();
            for event in history {
                max_replayed_id = max_replayed_id.max(event.id);
                if send_event(&mut ws_sender, &event).await.is_err() {
                    state.hub.unsubscribe(subscription.id).await;
                    return;
                }
            }
        }
        Err(e) => {
            debug!(cluster_id, error = %e, "failed to load event history");
        }
    }

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_timer.reset();

    loop {
        tokio::select! {
            event = subscription.events.recv() => {
                match event {
                    Some(event) => {
                        // Already delivered during replay.
                        if event.id <= max_replayed_id {
                            continue;
                        }
                        if send_event(&mut ws_sender, &event).await.is_err() {
                            debug!(cluster_id, "failed to send event, client disconnected");
                            break;
                        }
                    }
                    None => {
                        debug!(cluster_id, "hub dropped subscription");
                        break;
                    }
                }
            }

            _ = ping_timer.tick() => {
                if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(cluster_id, "failed to ping, client disconnected");
                    break;
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        debug!(cluster_id, "event stream client closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    // Other client messages are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unsubscribe(subscription.id).await;
    debug!(cluster_id, "event stream client disconnected");
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &kubesmith_shared_types::Event,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(json)).await
}
