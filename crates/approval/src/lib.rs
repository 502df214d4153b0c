use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_MESSAGE_CHARS: usize = 10_000;

struct PendingEntry {
    owner: String,
    created_at: Instant,
    sender: Option<oneshot::Sender<bool>>,
    receiver: Option<oneshot::Receiver<bool>>,
}

struct Inner {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    max_age: Duration,
}

/// Serialises one-shot human-confirmation requests with their resolutions
/// across front-ends (SPEC_FULL §4.4).
#[derive(Clone)]
pub struct ApprovalBroker {
    inner: Arc<Inner>,
}

impl ApprovalBroker {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                max_age: default_timeout,
            }),
        }
    }

    /// Registers a new approval request and returns its id.
    pub fn request(&self, message: &str, owner: &str) -> Uuid {
        let truncated: String = message.chars().take(MAX_MESSAGE_CHARS).collect();
        let _ = truncated; // message content is not retained server-side beyond the id/owner correlation
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            PendingEntry {
                owner: owner.to_string(),
                created_at: Instant::now(),
                sender: Some(tx),
                receiver: Some(rx),
            },
        );
        id
    }

    /// Blocks until the request is resolved or `timeout` elapses. Removes
    /// the entry on every exit path. A missing id returns `false` immediately.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> bool {
        let receiver = {
            let mut pending = self.inner.pending.lock();
            match pending.get_mut(&id) {
                Some(entry) => entry.receiver.take(),
                None => None,
            }
        };
        let Some(receiver) = receiver else {
            self.inner.pending.lock().remove(&id);
            return false;
        };
        let result = tokio::time::timeout(timeout, receiver).await;
        self.inner.pending.lock().remove(&id);
        match result {
            Ok(Ok(approved)) => approved,
            Ok(Err(_)) => false,
            Err(_) => false,
        }
    }

    /// Resolves a pending request. Returns whether the resolution took
    /// effect — `false` if the id is unknown, already resolved, or the
    /// owner tag does not match.
    pub fn resolve(&self, id: Uuid, approved: bool, owner: &str) -> bool {
        let sender = {
            let mut pending = self.inner.pending.lock();
            match pending.get_mut(&id) {
                Some(entry) if entry.owner == owner => entry.sender.take(),
                _ => None,
            }
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(approved);
                true
            }
            None => false,
        }
    }

    fn sweep_once(&self) {
        let expired: Vec<Uuid> = {
            let pending = self.inner.pending.lock();
            pending
                .iter()
                .filter(|(_, e)| e.created_at.elapsed() > self.inner.max_age)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            let mut pending = self.inner.pending.lock();
            if let Some(mut entry) = pending.remove(&id) {
                if let Some(tx) = entry.sender.take() {
                    let _ = tx.send(false);
                }
                debug!(%id, "swept expired approval request");
            }
        }
    }

    /// Spawns a periodic sweep so requests nobody ever `wait`s on still get
    /// garbage-collected and fail safe.
    pub fn start_sweep(&self, interval: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                broker.sweep_once();
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_then_wait_returns_the_decision() {
        let broker = ApprovalBroker::new(Duration::from_secs(5));
        let id = broker.request("delete everything?", "cli");
        assert!(broker.resolve(id, true, "cli"));
        assert!(broker.wait(id, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn wait_then_resolve_returns_the_decision() {
        let broker = ApprovalBroker::new(Duration::from_secs(5));
        let id = broker.request("delete everything?", "cli");
        let broker2 = broker.clone();
        let handle = tokio::spawn(async move { broker2.wait(id, Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(broker.resolve(id, false, "cli"));
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_and_fails_safe() {
        let broker = ApprovalBroker::new(Duration::from_secs(5));
        let id = broker.request("m", "cli");
        let approved = broker.wait(id, Duration::from_millis(20)).await;
        assert!(!approved);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_owner_cannot_resolve() {
        let broker = ApprovalBroker::new(Duration::from_secs(5));
        let id = broker.request("m", "cli");
        assert!(!broker.resolve(id, true, "http"));
        assert!(broker.resolve(id, true, "cli"));
    }

    #[tokio::test]
    async fn resolve_is_exactly_once() {
        let broker = ApprovalBroker::new(Duration::from_secs(5));
        let id = broker.request("m", "cli");
        assert!(broker.resolve(id, true, "cli"));
        assert!(!broker.resolve(id, false, "cli"));
    }

    #[tokio::test]
    async fn missing_id_wait_returns_false_immediately() {
        let broker = ApprovalBroker::new(Duration::from_secs(5));
        let bogus = Uuid::new_v4();
        assert!(!broker.wait(bogus, Duration::from_secs(5)).await);
    }
}
