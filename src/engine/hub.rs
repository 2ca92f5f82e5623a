//! Subscription/broadcast hub: decouples "a bus's state changed" from "who
//! needs to know". Topic registry plus per-client queues; delivery is
//! best-effort and never blocks the publishing side.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::engine::eta::Eta;
use crate::engine::state::BusStatus;

pub type ClientId = Uuid;

/// Pending events buffered per client before the hub starts dropping.
const CLIENT_QUEUE_CAPACITY: usize = 64;

/// A named broadcast channel: all buses of a route, or all ETA changes
/// affecting one stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Route(i64),
    Stop(i64),
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Route(id) => write!(f, "route:{}", id),
            Topic::Stop(id) => write!(f, "stop:{}", id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid topic '{0}', expected route:<id> or stop:<id>")]
pub struct TopicParseError(String);

impl std::str::FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or_else(|| TopicParseError(s.into()))?;
        let id: i64 = id.parse().map_err(|_| TopicParseError(s.into()))?;
        match kind {
            "route" => Ok(Topic::Route(id)),
            "stop" => Ok(Topic::Stop(id)),
            _ => Err(TopicParseError(s.into())),
        }
    }
}

/// Event pushed to subscribed clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    /// Live position of a bus on a route
    Position {
        bus_id: i64,
        route_id: i64,
        lat: f64,
        lon: f64,
        distance_along_km: f64,
        next_stop_id: Option<i64>,
        speed_kmh: f64,
        status: BusStatus,
        timestamp: String,
    },
    /// A materially changed arrival prediction for one stop
    Eta { eta: Eta },
    /// A bus changed status without a new fix (idle/offline demotion)
    BusStatus {
        bus_id: i64,
        route_id: i64,
        status: BusStatus,
        timestamp: String,
    },
}

/// Topic-to-subscriber registry with one bounded queue per connected client.
/// Publishes take read locks only, so concurrent fan-out for different
/// topics never serializes behind a global writer.
#[derive(Default)]
pub struct Hub {
    topics: RwLock<HashMap<Topic, HashSet<ClientId>>>,
    clients: RwLock<HashMap<ClientId, mpsc::Sender<EngineEvent>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client connection; the receiver is the client's event
    /// stream until `unregister`.
    pub async fn register(&self) -> (ClientId, mpsc::Receiver<EngineEvent>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let mut clients = self.clients.write().await;
        clients.insert(client_id, tx);
        (client_id, rx)
    }

    /// Drop a client and every subscription it held.
    pub async fn unregister(&self, client_id: ClientId) {
        {
            let mut clients = self.clients.write().await;
            clients.remove(&client_id);
        }
        let mut topics = self.topics.write().await;
        for subscribers in topics.values_mut() {
            subscribers.remove(&client_id);
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Returns false when the client is not registered.
    pub async fn subscribe(&self, client_id: ClientId, topic: Topic) -> bool {
        {
            let clients = self.clients.read().await;
            if !clients.contains_key(&client_id) {
                return false;
            }
        }
        let mut topics = self.topics.write().await;
        topics.entry(topic).or_default().insert(client_id);
        true
    }

    pub async fn unsubscribe(&self, client_id: ClientId, topic: Topic) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(&topic) {
            subscribers.remove(&client_id);
            if subscribers.is_empty() {
                topics.remove(&topic);
            }
        }
    }

    /// Deliver an event to every client currently subscribed to the topic.
    /// Full or closed client queues drop the event for that client only.
    /// Returns the number of successful deliveries.
    pub async fn publish(&self, topic: Topic, event: EngineEvent) -> usize {
        let subscribers: Vec<ClientId> = {
            let topics = self.topics.read().await;
            match topics.get(&topic) {
                Some(subscribers) => subscribers.iter().copied().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut disconnected = Vec::new();
        {
            let clients = self.clients.read().await;
            for client_id in subscribers {
                let Some(tx) = clients.get(&client_id) else {
                    continue;
                };
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            client = %client_id,
                            topic = %topic,
                            "Subscriber queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        disconnected.push(client_id);
                    }
                }
            }
        }

        for client_id in disconnected {
            tracing::debug!(client = %client_id, "Pruning disconnected subscriber");
            self.unregister(client_id).await;
        }

        delivered
    }

    pub async fn client_count(&self) -> usize {
        let clients = self.clients.read().await;
        clients.len()
    }

    pub async fn subscription_count(&self) -> usize {
        let topics = self.topics.read().await;
        topics.values().map(|subscribers| subscribers.len()).sum()
    }
}

/// Convenience alias used across the engine.
pub type SharedHub = Arc<Hub>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(bus_id: i64) -> EngineEvent {
        EngineEvent::BusStatus {
            bus_id,
            route_id: 7,
            status: BusStatus::Active,
            timestamp: "2026-03-02T08:30:00Z".to_string(),
        }
    }

    #[test]
    fn topics_parse_and_display() {
        assert_eq!("route:7".parse::<Topic>().unwrap(), Topic::Route(7));
        assert_eq!("stop:102".parse::<Topic>().unwrap(), Topic::Stop(102));
        assert_eq!(Topic::Stop(102).to_string(), "stop:102");
        assert!("line:9".parse::<Topic>().is_err());
        assert!("route:".parse::<Topic>().is_err());
        assert!("gibberish".parse::<Topic>().is_err());
    }

    #[tokio::test]
    async fn publishes_only_to_matching_subscribers() {
        let hub = Hub::new();
        let (stop_client, mut stop_rx) = hub.register().await;
        let (route_client, mut route_rx) = hub.register().await;

        assert!(hub.subscribe(stop_client, Topic::Stop(102)).await);
        assert!(hub.subscribe(route_client, Topic::Route(7)).await);

        // Position on route 7: only the route subscriber sees it
        assert_eq!(hub.publish(Topic::Route(7), status_event(42)).await, 1);
        assert!(route_rx.try_recv().is_ok());
        assert!(stop_rx.try_recv().is_err());

        // ETA change for stop 102: only the stop subscriber sees it
        assert_eq!(hub.publish(Topic::Stop(102), status_event(42)).await, 1);
        assert!(stop_rx.try_recv().is_ok());
        assert!(route_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = Hub::new();
        let (client, mut rx) = hub.register().await;
        hub.subscribe(client, Topic::Route(7)).await;

        hub.unsubscribe(client, Topic::Route(7)).await;
        assert_eq!(hub.publish(Topic::Route(7), status_event(42)).await, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn disconnected_client_is_pruned_on_publish() {
        let hub = Hub::new();
        let (client, rx) = hub.register().await;
        hub.subscribe(client, Topic::Route(7)).await;
        drop(rx);

        assert_eq!(hub.publish(Topic::Route(7), status_event(42)).await, 0);
        assert_eq!(hub.client_count().await, 0);
        assert_eq!(hub.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let hub = Hub::new();
        let (client, _rx) = hub.register().await;
        hub.subscribe(client, Topic::Route(7)).await;

        for _ in 0..CLIENT_QUEUE_CAPACITY {
            assert_eq!(hub.publish(Topic::Route(7), status_event(42)).await, 1);
        }
        // Queue is full now; the publish completes but delivers nothing
        assert_eq!(hub.publish(Topic::Route(7), status_event(42)).await, 0);
        // The client is still registered, only the event was dropped
        assert_eq!(hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn subscribe_requires_registration() {
        let hub = Hub::new();
        assert!(!hub.subscribe(Uuid::new_v4(), Topic::Route(7)).await);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&status_event(42)).unwrap();
        assert!(json.contains("\"type\":\"bus_status\""));
        assert!(json.contains("\"bus_id\":42"));
    }
}
