//! In-process broker with NATS subject semantics.
//!
//! Supports `*` and `>` wildcards, queue groups (one member per group receives
//! each message, round robin), request/reply through private inboxes and
//! no-responder detection. Used by tests and by services embedding the runtime
//! without a NATS server.

use super::transport::{Delivery, Subscription, Transport};
use crate::error::RpcError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1024;

struct Entry {
    id: u64,
    pattern: String,
    queue: Option<String>,
    tx: mpsc::Sender<Delivery>,
}

struct BrokerState {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
    capacity: usize,
}

impl BrokerState {
    fn register(
        &self,
        pattern: &str,
        queue: Option<&str>,
        capacity: usize,
    ) -> (u64, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry {
            id,
            pattern: pattern.to_string(),
            queue: queue.filter(|q| !q.is_empty()).map(str::to_string),
            tx,
        });
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    /// Route one message; returns how many subscribers accepted it.
    fn deliver(&self, subject: &str, reply: Option<&str>, payload: &[u8]) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|e| !e.tx.is_closed());

        let mut targets: Vec<&Entry> = Vec::new();
        let mut groups: BTreeMap<&str, Vec<&Entry>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| subject_matches(&e.pattern, subject)) {
            match entry.queue.as_deref() {
                Some(queue) => groups.entry(queue).or_default().push(entry),
                None => targets.push(entry),
            }
        }
        for members in groups.values() {
            let pick = self.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            targets.push(members[pick]);
        }

        let mut delivered = 0;
        for entry in targets {
            let delivery = Delivery {
                subject: subject.to_string(),
                reply: reply.map(str::to_string),
                payload: payload.to_vec(),
            };
            match entry.tx.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subject = %subject, pattern = %entry.pattern, "Slow consumer, message dropped")
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

/// NATS subject match: `*` matches one token, a trailing `>` one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct LocalBroker {
    state: Arc<BrokerState>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Broker whose subscriptions buffer at most `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(BrokerState {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                cursor: AtomicUsize::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Open a client link. Closing it only drops this link's subscriptions.
    pub fn connect(&self) -> LocalTransport {
        LocalTransport {
            state: self.state.clone(),
            owned: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Live subscriptions across all links.
    pub fn subscription_count(&self) -> usize {
        let mut entries = self.state.entries.lock();
        entries.retain(|e| !e.tx.is_closed());
        entries.len()
    }
}

/// One client link to a [`LocalBroker`].
pub struct LocalTransport {
    state: Arc<BrokerState>,
    owned: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        self.ensure_open()?;
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let (id, mut rx) = self.state.register(&inbox, None, 1);

        if self.state.deliver(subject, Some(&inbox), &payload) == 0 {
            self.state.remove(id);
            return Err(RpcError::NoResponders(subject.to_string()));
        }

        let reply = tokio::time::timeout(timeout, rx.recv()).await;
        self.state.remove(id);
        match reply {
            Ok(Some(delivery)) => Ok(delivery.payload),
            Ok(None) => Err(RpcError::Transport("reply inbox closed".to_string())),
            Err(_) => Err(RpcError::Timeout(format!(
                "no reply on '{subject}' within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), RpcError> {
        self.ensure_open()?;
        self.state.deliver(subject, None, &payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn Subscription>, RpcError> {
        self.ensure_open()?;
        let (id, rx) = self.state.register(subject, queue, self.state.capacity);
        self.owned.lock().push(id);
        Ok(Box::new(LocalSubscription {
            id,
            rx,
            state: self.state.clone(),
        }))
    }

    async fn flush(&self) -> Result<(), RpcError> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let owned = std::mem::take(&mut *self.owned.lock());
        self.state
            .entries
            .lock()
            .retain(|e| !owned.contains(&e.id));
        Ok(())
    }
}

struct LocalSubscription {
    id: u64,
    rx: mpsc::Receiver<Delivery>,
    state: Arc<BrokerState>,
}

#[async_trait]
impl Subscription for LocalSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<(), RpcError> {
        self.state.remove(self.id);
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("api.users", "api.users"));
        assert!(subject_matches("api.*", "api.users"));
        assert!(!subject_matches("api.*", "api.users.1"));
        assert!(subject_matches("api.>", "api.users.1"));
        assert!(!subject_matches("api.>", "api"));
        assert!(!subject_matches("api.users", "api.orders"));
    }

    #[tokio::test]
    async fn test_publish_reaches_every_plain_subscriber() {
        let broker = LocalBroker::new();
        let link = broker.connect();
        let mut a = link.subscribe("events.created", None).await.unwrap();
        let mut b = link.subscribe("events.*", None).await.unwrap();

        link.publish("events.created", b"x".to_vec()).await.unwrap();

        assert_eq!(a.next().await.unwrap().payload, b"x");
        assert_eq!(b.next().await.unwrap().subject, "events.created");
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once_and_balances() {
        let broker = LocalBroker::new();
        let link = broker.connect();
        let mut first = link.subscribe("jobs", Some("workers")).await.unwrap();
        let mut second = link.subscribe("jobs", Some("workers")).await.unwrap();

        for i in 0..4u8 {
            link.publish("jobs", vec![i]).await.unwrap();
        }
        link.close().await.unwrap();

        let mut received = Vec::new();
        while let Some(d) = first.next().await {
            received.push(d.payload[0]);
        }
        let first_count = received.len();
        while let Some(d) = second.next().await {
            received.push(d.payload[0]);
        }
        received.sort();

        assert_eq!(received, vec![0, 1, 2, 3]);
        assert_eq!(first_count, 2);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = LocalBroker::new();
        let server = broker.connect();
        let client = broker.connect();
        let mut sub = server.subscribe("echo", None).await.unwrap();

        tokio::spawn(async move {
            let delivery = sub.next().await.unwrap();
            let reply = delivery.reply.unwrap();
            server.publish(&reply, delivery.payload).await.unwrap();
        });

        let reply = client
            .request("echo", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn test_request_without_listener_has_no_responders() {
        let broker = LocalBroker::new();
        let err = broker
            .connect()
            .request("nobody.home", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NoResponders(_)));
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let broker = LocalBroker::new();
        let link = broker.connect();
        let _silent = link.subscribe("slow", None).await.unwrap();

        let err = link
            .request("slow", Vec::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_close_only_affects_own_link() {
        let broker = LocalBroker::new();
        let a = broker.connect();
        let b = broker.connect();
        let _sa = a.subscribe("x", None).await.unwrap();
        let _sb = b.subscribe("x", None).await.unwrap();

        a.close().await.unwrap();
        assert_eq!(broker.subscription_count(), 1);
        assert!(a.publish("x", Vec::new()).await.is_err());
        assert!(b.publish("x", Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = LocalBroker::new();
        let link = broker.connect();
        let mut sub = link.subscribe("x", None).await.unwrap();
        sub.unsubscribe().await.unwrap();
        link.publish("x", Vec::new()).await.unwrap();
        assert!(sub.next().await.is_none());
    }
}
