//! Fire-and-forget event handlers.
//!
//! Handlers are registered up front and activated against a live connection.
//! Each delivery runs on its own task; a failing or panicking handler is logged
//! and never affects sibling subscriptions.

use crate::connection::{Connection, Delivery, Subscription};
use crate::context::Context;
use crate::envelope::Message;
use crate::error::RpcError;
use crate::metrics::RpcMetrics;
use crate::router::panic_message;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type EventFn = dyn Fn(Message) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync;

struct Registration {
    subject: String,
    queue: Option<String>,
    handler: Arc<EventFn>,
}

struct Active {
    subject: String,
    task: JoinHandle<Result<(), RpcError>>,
}

struct Inner {
    pending: Mutex<Vec<Registration>>,
    active: Mutex<Vec<Active>>,
    stop: watch::Sender<bool>,
}

/// Registry of event handlers keyed by subject and optional queue group.
///
/// Clones share the same registry.
#[derive(Clone)]
pub struct MessageSubscriber {
    inner: Arc<Inner>,
}

impl Default for MessageSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSubscriber")
            .field("pending", &self.inner.pending.lock().len())
            .field("active", &self.inner.active.lock().len())
            .finish()
    }
}

impl MessageSubscriber {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(Vec::new()),
                active: Mutex::new(Vec::new()),
                stop,
            }),
        }
    }

    /// Register `handler` for `subject`. An empty `queue` means every instance
    /// receives every event.
    pub fn register<F, Fut>(&self, subject: &str, queue: &str, handler: F) -> &Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.inner.pending.lock().push(Registration {
            subject: subject.to_string(),
            queue: (!queue.is_empty()).then(|| queue.to_string()),
            handler: Arc::new(move |message| handler(message).boxed()),
        });
        self
    }

    /// Register a handler receiving the decoded body and the sender's context.
    pub fn register_json<T, F, Fut>(&self, subject: &str, queue: &str, handler: F) -> &Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(subject, queue, move |message: Message| {
            let handler = Arc::clone(&handler);
            async move {
                let (ctx, body) = message.parse::<T>()?;
                handler(ctx, body).await
            }
        })
    }

    /// Registrations not yet activated.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Subscriptions currently active.
    pub fn active(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Activate every pending registration on `connection`.
    ///
    /// Registrations are consumed, so calling this again only activates those
    /// added since.
    pub async fn subscribe(&self, connection: &Connection) -> Result<(), RpcError> {
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        for registration in pending {
            let subscription = connection
                .subscribe(&registration.subject, registration.queue.as_deref())
                .await?;
            info!(
                subject = %registration.subject,
                queue = registration.queue.as_deref().unwrap_or_default(),
                "Event subscription active"
            );
            let subject = registration.subject.clone();
            let task = tokio::spawn(listen(
                subscription,
                registration,
                self.inner.stop.subscribe(),
            ));
            self.inner.active.lock().push(Active { subject, task });
        }
        Ok(())
    }

    /// Release every active subscription. Failures are logged, not returned.
    pub async fn drain(&self) {
        self.inner.stop.send_replace(true);
        let active = std::mem::take(&mut *self.inner.active.lock());
        for Active { subject, task } in active {
            match task.await {
                Ok(Ok(())) => debug!(subject = %subject, "Event subscription released"),
                Ok(Err(e)) => warn!(subject = %subject, error = %e, "Failed to unsubscribe"),
                Err(e) => warn!(subject = %subject, error = %e, "Event listener task failed"),
            }
        }
        self.inner.stop.send_replace(false);
    }
}

async fn listen(
    mut subscription: Box<dyn Subscription>,
    registration: Registration,
    mut stop: watch::Receiver<bool>,
) -> Result<(), RpcError> {
    let metrics = RpcMetrics::new(&registration.subject);
    loop {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stop| *stop) => break,
            delivery = subscription.next() => match delivery {
                Some(delivery) => {
                    tokio::spawn(deliver(
                        Arc::clone(&registration.handler),
                        delivery,
                        metrics.clone(),
                    ));
                }
                None => return Ok(()),
            },
        }
    }
    subscription.unsubscribe().await
}

async fn deliver(handler: Arc<EventFn>, delivery: Delivery, metrics: RpcMetrics) {
    let message: Message = match serde_json::from_slice(&delivery.payload) {
        Ok(message) => message,
        Err(e) => {
            metrics.event_handled("decode_error");
            warn!(subject = %delivery.subject, error = %e, "Unreadable event, dropped");
            return;
        }
    };
    let request_id = message.headers.request_id.clone().unwrap_or_default();

    match AssertUnwindSafe(async move { handler(message).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => metrics.event_handled("ok"),
        Ok(Err(e)) => {
            metrics.event_handled("error");
            warn!(subject = %delivery.subject, request_id = %request_id, error = %e, "Event handler failed");
        }
        Err(panic) => {
            metrics.event_handled("panic");
            error!(
                subject = %delivery.subject,
                request_id = %request_id,
                panic = %panic_message(panic.as_ref()),
                "Event handler panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::connection::LocalBroker;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn connection(broker: &LocalBroker) -> Connection {
        Connection::local(broker, Duration::from_secs(1)).await.unwrap()
    }

    #[derive(Debug, Deserialize)]
    struct Created {
        id: u32,
    }

    #[tokio::test]
    async fn test_registrations_are_consumed() {
        let broker = LocalBroker::new();
        let conn = connection(&broker).await;
        let subscriber = MessageSubscriber::new();
        subscriber.register("events.a", "", |_| async { Ok(()) });
        assert_eq!(subscriber.pending(), 1);

        subscriber.subscribe(&conn).await.unwrap();
        subscriber.subscribe(&conn).await.unwrap();
        assert_eq!(subscriber.pending(), 0);
        assert_eq!(subscriber.active(), 1);
        assert_eq!(broker.subscription_count(), 1);

        subscriber.drain().await;
        assert_eq!(subscriber.active(), 0);
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_published_event_reaches_handler() {
        let broker = LocalBroker::new();
        let conn = connection(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscriber = MessageSubscriber::new();
        subscriber.register_json("events.created", "workers", move |ctx: Context, body: Created| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((ctx.request_id().to_string(), body.id));
                Ok(())
            }
        });
        subscriber.subscribe(&conn).await.unwrap();

        let ctx = Context::background().with_request_id("evt-7");
        Client::new(conn.clone())
            .publish(&ctx, "events.created", &json!({"id": 7}))
            .await
            .unwrap();

        let (request_id, id) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request_id, "evt-7");
        assert_eq!(id, 7);
    }

    async fn explode(_message: Message) -> Result<(), RpcError> {
        panic!("bad handler")
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let broker = LocalBroker::new();
        let conn = connection(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscriber = MessageSubscriber::new();
        subscriber.register("events.bad", "", explode);
        subscriber.register("events.good", "", move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.body);
                Ok(())
            }
        });
        subscriber.subscribe(&conn).await.unwrap();

        let client = Client::new(conn.clone());
        let ctx = Context::background();
        client.publish(&ctx, "events.bad", &json!(1)).await.unwrap();
        client.publish(&ctx, "events.bad", &json!(2)).await.unwrap();
        client.publish(&ctx, "events.good", &json!(3)).await.unwrap();

        let body = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, json!(3));
        assert_eq!(subscriber.active(), 2);
    }
}
