//! Cluster-keyed event fan-out hub.
//!
//! One dispatcher loop services subscribe, unsubscribe and broadcast
//! commands serially, which gives every subscriber of a cluster the same
//! delivery order as publication order. The command channel is bounded, so
//! publishers block instead of queueing unboundedly when consumers are
//! slow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use kubesmith_shared_types::{ClusterId, Event};

/// Capacity of the hub's command channel. Publishers block when full.
pub const BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Per-subscriber buffer between the hub and its WebSocket task.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// How many persisted events a new subscriber is given before live
/// delivery starts.
pub const HISTORY_REPLAY_LIMIT: u32 = 50;

pub type SubscriberId = u64;

enum HubCommand {
    Subscribe {
        cluster_id: ClusterId,
        subscriber_id: SubscriberId,
        sender: mpsc::Sender<Event>,
    },
    Unsubscribe {
        subscriber_id: SubscriberId,
    },
    Broadcast {
        event: Event,
    },
}

/// A live subscription to one cluster's event stream. Dropping the
/// receiver makes the hub evict the subscriber on its next write.
pub struct Subscription {
    pub id: SubscriberId,
    pub events: mpsc::Receiver<Event>,
}

/// Cloneable handle to the hub loop.
#[derive(Clone)]
pub struct EventHub {
    commands: mpsc::Sender<HubCommand>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl EventHub {
    /// Create the hub handle and its dispatcher loop. The loop must be
    /// spawned by the caller; it exits when every handle is dropped.
    pub fn new() -> (Self, EventHubLoop) {
        let (commands, command_rx) = mpsc::channel(BROADCAST_CHANNEL_CAPACITY);
        (
            Self {
                commands,
                next_subscriber_id: Arc::new(AtomicU64::new(0)),
            },
            EventHubLoop {
                commands: command_rx,
                subscribers: HashMap::new(),
                clusters_by_subscriber: HashMap::new(),
            },
        )
    }

    /// Register a subscriber for one cluster's events.
    pub async fn subscribe(&self, cluster_id: ClusterId) -> Subscription {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let _ = self
            .commands
            .send(HubCommand::Subscribe {
                cluster_id,
                subscriber_id,
                sender,
            })
            .await;
        Subscription {
            id: subscriber_id,
            events,
        }
    }

    /// Remove a subscriber. Safe to call for an already-evicted id.
    pub async fn unsubscribe(&self, subscriber_id: SubscriberId) {
        let _ = self
            .commands
            .send(HubCommand::Unsubscribe { subscriber_id })
            .await;
    }

    /// Publish an event to every subscriber of its cluster. Blocks when
    /// the hub's command channel is full; that back-pressure is
    /// intentional.
    pub async fn broadcast(&self, event: Event) {
        let _ = self.commands.send(HubCommand::Broadcast { event }).await;
    }
}

/// The serial dispatcher owning the subscription registry.
pub struct EventHubLoop {
    commands: mpsc::Receiver<HubCommand>,
    subscribers: HashMap<ClusterId, HashMap<SubscriberId, mpsc::Sender<Event>>>,
    clusters_by_subscriber: HashMap<SubscriberId, ClusterId>,
}

impl EventHubLoop {
    /// Service commands until every `EventHub` handle is gone.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Subscribe {
                    cluster_id,
                    subscriber_id,
                    sender,
                } => {
                    self.subscribers
                        .entry(cluster_id)
                        .or_default()
                        .insert(subscriber_id, sender);
                    self.clusters_by_subscriber.insert(subscriber_id, cluster_id);
                    debug!(cluster_id, subscriber_id, "subscriber registered");
                }
                HubCommand::Unsubscribe { subscriber_id } => {
                    self.remove(subscriber_id);
                    debug!(subscriber_id, "subscriber unregistered");
                }
                HubCommand::Broadcast { event } => {
                    let cluster_id = event.cluster_id;
                    let Some(cluster_subs) = self.subscribers.get(&cluster_id) else {
                        continue;
                    };

                    let mut dead = Vec::new();
                    for (subscriber_id, sender) in cluster_subs {
                        if sender.send(event.clone()).await.is_err() {
                            dead.push(*subscriber_id);
                        }
                    }
                    for subscriber_id in dead {
                        debug!(cluster_id, subscriber_id, "dropping failed subscriber");
                        self.remove(subscriber_id);
                    }
                }
            }
        }
    }

    fn remove(&mut self, subscriber_id: SubscriberId) {
        let Some(cluster_id) = self.clusters_by_subscriber.remove(&subscriber_id) else {
            return;
        };
        if let Some(cluster_subs) = self.subscribers.get_mut(&cluster_id) {
            cluster_subs.remove(&subscriber_id);
            if cluster_subs.is_empty() {
                self.subscribers.remove(&cluster_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kubesmith_shared_types::EventLevel;

    fn event(cluster_id: ClusterId, id: i64, message: &str) -> Event {
        Event {
            id,
            cluster_id,
            timestamp: Utc::now(),
            level: EventLevel::Info,
            host: "localhost".to_string(),
            step: "prepare".to_string(),
            message: message.to_string(),
            output: None,
        }
    }

    fn spawn_hub() -> EventHub {
        let (hub, hub_loop) = EventHub::new();
        tokio::spawn(hub_loop.run());
        hub
    }

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let hub = spawn_hub();
        let mut sub = hub.subscribe(1).await;

        for i in 0..10 {
            hub.broadcast(event(1, i, &format!("e{i}"))).await;
        }

        for i in 0..10 {
            let received = sub.events.recv().await.unwrap();
            assert_eq!(received.id, i);
        }
    }

    #[tokio::test]
    async fn does_not_leak_across_clusters() {
        let hub = spawn_hub();
        let mut sub_one = hub.subscribe(1).await;
        let mut sub_two = hub.subscribe(2).await;

        hub.broadcast(event(1, 1, "for cluster one")).await;
        hub.broadcast(event(2, 2, "for cluster two")).await;

        assert_eq!(sub_one.events.recv().await.unwrap().cluster_id, 1);
        assert_eq!(sub_two.events.recv().await.unwrap().cluster_id, 2);
        assert!(sub_one.events.try_recv().is_err());
        assert!(sub_two.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let hub = spawn_hub();
        let mut a = hub.subscribe(1).await;
        let mut b = hub.subscribe(1).await;

        hub.broadcast(event(1, 1, "hello")).await;

        assert_eq!(a.events.recv().await.unwrap().message, "hello");
        assert_eq!(b.events.recv().await.unwrap().message, "hello");
    }

    #[tokio::test]
    async fn dropped_receiver_is_evicted() {
        let hub = spawn_hub();
        let sub = hub.subscribe(1).await;
        let mut live = hub.subscribe(1).await;
        drop(sub.events);

        // First broadcast hits the dead sender and evicts it; the live
        // subscriber keeps receiving afterwards.
        hub.broadcast(event(1, 1, "first")).await;
        hub.broadcast(event(1, 2, "second")).await;

        assert_eq!(live.events.recv().await.unwrap().id, 1);
        assert_eq!(live.events.recv().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = spawn_hub();
        let mut sub = hub.subscribe(1).await;

        hub.broadcast(event(1, 1, "before")).await;
        assert_eq!(sub.events.recv().await.unwrap().id, 1);

        hub.unsubscribe(sub.id).await;
        hub.broadcast(event(1, 2, "after")).await;

        // The hub dropped its sender; the channel closes without more
        // events.
        assert!(sub.events.recv().await.is_none());
    }
}
