//! The telemetry/event bus (spec §6.3): `feature-query-logs`,
//! `migration-events`, `cleanup-events`. At-least-once delivery is
//! sufficient; consumers must tolerate duplicates. Per-key ordering is
//! preserved by partitioning on a hash of the partition key, so producers
//! running in parallel still deliver one key's events in program order
//! (spec §5, §9).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// A bus topic, published to with a partition key (usually the feature
/// key, or the task id for migration/cleanup events) and a JSON payload.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, partition_key: &str, payload: serde_json::Value);
}

/// Serializes `payload` and publishes it, logging (not propagating) any
/// serialization error -- telemetry emission must never fail the caller's
/// request.
pub async fn publish_event(bus: &dyn EventBus, topic: &str, partition_key: &str, payload: &impl Serialize) {
    match serde_json::to_value(payload) {
        Ok(value) => bus.publish(topic, partition_key, value).await,
        Err(err) => warn!(topic, partition_key, %err, "failed to serialize event payload"),
    }
}

fn partition_of(partition_key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    partition_key.hash(&mut hasher);
    (hasher.finish() as usize) % partitions.max(1)
}

/// A single partition's outbound queue: one `mpsc` channel, drained by
/// one task, so publishes that hash to the same partition are delivered
/// in send order.
struct Partition {
    sender: mpsc::UnboundedSender<(String, serde_json::Value)>,
}

/// In-process, hash-partitioned event bus. Each partition is an
/// independent `mpsc` channel drained by its own task; publishing never
/// blocks the caller on delivery, matching the bus's at-least-once,
/// best-effort delivery contract.
pub struct PartitionedEventBus {
    partitions: Vec<Partition>,
}

impl PartitionedEventBus {
    /// Spawns one drain task per partition. `on_event` is invoked (on the
    /// drain task) for every published `(topic, partition_key, payload)`
    /// triple; a real deployment wires this to a Kafka/NATS producer.
    #[must_use]
    pub fn new<F>(partition_count: usize, on_event: F) -> Self
    where
        F: Fn(&str, &str, &serde_json::Value) + Send + Sync + 'static,
    {
        let on_event = Arc::new(on_event);
        let mut partitions = Vec::with_capacity(partition_count.max(1));
        for _ in 0..partition_count.max(1) {
            let (tx, mut rx) = mpsc::unbounded_channel::<(String, serde_json::Value)>();
            let on_event = on_event.clone();
            tokio::spawn(async move {
                while let Some((topic, payload)) = rx.recv().await {
                    let partition_key =
                        payload.get("partition_key").and_then(|v| v.as_str()).unwrap_or_default();
                    on_event(&topic, partition_key, &payload);
                }
            });
            partitions.push(Partition { sender: tx });
        }
        Self { partitions }
    }
}

#[async_trait]
impl EventBus for PartitionedEventBus {
    async fn publish(&self, topic: &str, partition_key: &str, payload: serde_json::Value) {
        let idx = partition_of(partition_key, self.partitions.len());
        let mut envelope = payload;
        if let Some(obj) = envelope.as_object_mut() {
            obj.insert("partition_key".to_string(), serde_json::Value::String(partition_key.to_string()));
        }
        if self.partitions[idx].sender.send((topic.to_string(), envelope)).is_err() {
            warn!(topic, partition_key, "event bus partition drain task has exited");
        }
    }
}

/// Discards every event. Used in tests and by components that don't need
/// telemetry wiring.
pub struct NullEventBus;

#[async_trait]
impl EventBus for NullEventBus {
    async fn publish(&self, _topic: &str, _partition_key: &str, _payload: serde_json::Value) {}
}

/// Records every publish in order, for assertions in tests.
#[cfg(test)]
pub struct RecordingEventBus {
    pub events: parking_lot::Mutex<Vec<(String, String, serde_json::Value)>>,
}

#[cfg(test)]
impl RecordingEventBus {
    pub fn new() -> Self {
        Self { events: parking_lot::Mutex::new(Vec::new()) }
    }
}

#[cfg(test)]
#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, topic: &str, partition_key: &str, payload: serde_json::Value) {
        self.events.lock().push((topic.to_string(), partition_key.to_string(), payload));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn partition_of_is_deterministic() {
        assert_eq!(partition_of("k", 16), partition_of("k", 16));
    }

    #[tokio::test]
    async fn recording_bus_preserves_publish_order() {
        let bus = RecordingEventBus::new();
        bus.publish("feature-query-logs", "k", json!({"n": 1})).await;
        bus.publish("feature-query-logs", "k", json!({"n": 2})).await;

        let events = bus.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].2["n"], 1);
        assert_eq!(events[1].2["n"], 2);
    }

    #[tokio::test]
    async fn partitioned_bus_delivers_same_key_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = PartitionedEventBus::new(4, move |topic, key, payload| {
            let _ = tx.send((topic.to_string(), key.to_string(), payload.clone()));
        });

        for i in 0..10 {
            bus.publish("feature-query-logs", "same-key", json!({"n": i})).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 10);
        for (i, (_, _, payload)) in received.iter().enumerate() {
            assert_eq!(payload["n"], i);
        }
    }

    #[tokio::test]
    async fn null_bus_discards_silently() {
        let bus = NullEventBus;
        bus.publish("anything", "k", json!({})).await;
    }
}
