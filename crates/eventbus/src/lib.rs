use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sa_store::Store;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// An event delivered to subscribers, mirroring the reference
/// `anteroom.services.event_bus.EventBus` wire shape (SPEC_FULL §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub channel: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<Event>,
}

struct Inner {
    process_id: String,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    databases: Mutex<HashMap<String, Arc<Store>>>,
    last_seen_ids: Mutex<HashMap<String, i64>>,
    next_sub_id: AtomicU64,
    subscriber_capacity: usize,
    default_db: String,
    poll_interval: Duration,
    retention_secs: i64,
    cleanup_every_n_polls: u64,
}

/// Two-tier pub/sub: a local bounded-queue fast path, plus a polled
/// change-log table for cross-process delivery (SPEC_FULL §4.5).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(default_db: impl Into<String>, subscriber_capacity: usize) -> Self {
        Self::with_intervals(
            default_db,
            subscriber_capacity,
            Duration::from_millis(1500),
            600,
        )
    }

    pub fn with_intervals(
        default_db: impl Into<String>,
        subscriber_capacity: usize,
        poll_interval: Duration,
        retention_secs: i64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                process_id: Uuid::new_v4().to_string(),
                subscribers: Mutex::new(HashMap::new()),
                databases: Mutex::new(HashMap::new()),
                last_seen_ids: Mutex::new(HashMap::new()),
                next_sub_id: AtomicU64::new(1),
                subscriber_capacity,
                default_db: default_db.into(),
                poll_interval,
                retention_secs,
                // cleanup runs roughly every 300s of poll_interval ticks
                cleanup_every_n_polls: 200,
            }),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.inner.process_id
    }

    /// Enrolls a database for cross-process polling, seeding the last-seen
    /// id from the current max so prior events are not replayed.
    pub fn register_database(&self, name: impl Into<String>, store: Arc<Store>) {
        let name = name.into();
        let max_id = store.max_change_log_id().unwrap_or(0);
        self.inner.databases.lock().insert(name.clone(), store);
        self.inner.last_seen_ids.lock().insert(name, max_id);
    }

    pub fn subscribe(&self, channel: impl Into<String>) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let channel = channel.into();
        let (tx, rx) = mpsc::channel(self.inner.subscriber_capacity);
        let id = SubscriptionId(self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .lock()
            .entry(channel)
            .or_default()
            .push(Subscriber { id, sender: tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) {
        if let Some(subs) = self.inner.subscribers.lock().get_mut(channel) {
            subs.retain(|s| s.id != id);
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(channel)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn channel_to_db_name(&self, channel: &str) -> String {
        channel
            .strip_prefix("global:")
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.inner.default_db.clone())
    }

    fn deliver_local(&self, channel: &str, event: &Event) {
        let mut subs = self.inner.subscribers.lock();
        if let Some(list) = subs.get_mut(channel) {
            list.retain(|sub| match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel, "event bus subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Publishes locally (best-effort, non-blocking) and persists a
    /// change-log row for cross-process delivery (also best-effort).
    pub fn publish(&self, channel: &str, event_type: &str, payload: serde_json::Value) {
        let event = Event {
            channel: channel.to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
        };
        self.deliver_local(channel, &event);

        let db_name = self.channel_to_db_name(channel);
        let store = self.inner.databases.lock().get(&db_name).cloned();
        if let Some(store) = store {
            if let Err(e) = store.insert_change_log(&self.inner.process_id, channel, event_type, &payload) {
                warn!(error = %e, "failed to persist event to change log");
            }
        }
    }

    /// Spawns the background poller. Returns its join handle so callers can
    /// keep it alive for the process lifetime.
    pub fn start_polling(&self) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut tick: u64 = 0;
            loop {
                tokio::time::sleep(bus.inner.poll_interval).await;
                bus.poll_all_databases();
                tick += 1;
                if tick % bus.inner.cleanup_every_n_polls == 0 {
                    bus.cleanup_old_events();
                }
            }
        })
    }

    fn poll_all_databases(&self) {
        let databases: Vec<(String, Arc<Store>)> = self
            .inner
            .databases
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (db_name, store) in databases {
            let last_id = *self.inner.last_seen_ids.lock().get(&db_name).unwrap_or(&0);
            let rows = match store.change_log_since(last_id) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(db = %db_name, error = %e, "event bus poll failed");
                    continue;
                }
            };
            let mut new_last = last_id;
            for row in rows {
                new_last = row.id;
                if row.origin_process_id == self.inner.process_id {
                    continue;
                }
                let event = Event {
                    channel: row.channel.clone(),
                    event_type: row.event_type,
                    payload: row.payload,
                };
                self.deliver_local(&row.channel, &event);
            }
            self.inner.last_seen_ids.lock().insert(db_name, new_last);
        }
    }

    fn cleanup_old_events(&self) {
        let databases: Vec<Arc<Store>> = self.inner.databases.lock().values().cloned().collect();
        for store in databases {
            match store.cleanup_change_log_older_than_secs(self.inner.retention_secs) {
                Ok(n) if n > 0 => debug!(count = n, "swept stale change log rows"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "change log cleanup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_store::Role;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn local_publish_delivers_in_process() {
        let bus = EventBus::new("personal", 16);
        let (_id, mut rx) = bus.subscribe("conversation:abc");
        bus.publish("conversation:abc", "token", serde_json::json!({"text": "hi"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "token");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let bus = EventBus::new("personal", 1);
        let (_id, mut rx) = bus.subscribe("c");
        bus.publish("c", "a", serde_json::json!(1));
        bus.publish("c", "b", serde_json::json!(2));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, "a");
    }

    #[tokio::test]
    async fn cross_process_delivery_skips_self_origin() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shared.db");
        let store1 = Arc::new(Store::open(&db_path).unwrap());
        let store2 = Arc::new(Store::open(&db_path).unwrap());

        let bus1 = EventBus::new("personal", 16);
        bus1.register_database("personal", store1);
        let bus2 = EventBus::new("personal", 16);
        bus2.register_database("personal", store2);

        let (_id, mut rx1) = bus1.subscribe("global:personal");
        bus2.publish("global:personal", "notice", serde_json::json!({"x": 1}));

        // bus1 has not polled yet locally, so cross-process delivery is what
        // must bring this event to rx1.
        bus1.poll_all_databases();
        let event = tokio::time::timeout(StdDuration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "notice");

        // bus2 must not re-receive its own publish via the cross-process path.
        let (_id2, mut rx2) = bus2.subscribe("global:personal");
        bus2.poll_all_databases();
        let nothing = tokio::time::timeout(StdDuration::from_millis(50), rx2.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new("personal", 16);
        let (id, mut rx) = bus.subscribe("c");
        bus.unsubscribe("c", id);
        bus.publish("c", "a", serde_json::json!(1));
        let nothing = tokio::time::timeout(StdDuration::from_millis(20), rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[test]
    fn register_database_seeds_last_seen_from_max() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("a.db")).unwrap());
        let convo = store.create_conversation("t").unwrap();
        store.append_message(&convo.id, Role::User, "hi").unwrap();
        store
            .insert_change_log("other-proc", "global:personal", "x", &serde_json::json!(1))
            .unwrap();
        let bus = EventBus::new("personal", 16);
        bus.register_database("personal", store);
        // Internal: last_seen_ids should equal max id already present, so a
        // poll right after registration shouldn't redeliver it.
        bus.poll_all_databases();
    }
}
