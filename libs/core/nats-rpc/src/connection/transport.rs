//! Broker abstraction the runtime is written against.
//!
//! Implemented for NATS ([`NatsTransport`](super::NatsTransport)) and for an
//! in-process broker ([`LocalBroker`](super::LocalBroker)).

use crate::error::RpcError;
use async_trait::async_trait;
use std::time::Duration;

/// Message received from a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the message was published to
    pub subject: String,
    /// Reply subject for request-reply patterns
    pub reply: Option<String>,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

/// Publish/subscribe/request primitives of a message broker.
///
/// Implementations must be safe for concurrent use from many tasks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Request-reply with a per-call timeout.
    ///
    /// Fails with [`RpcError::Timeout`] when no reply arrives in time and with
    /// [`RpcError::NoResponders`] when nobody listens on `subject`.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError>;

    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), RpcError>;

    /// Subscribe to `subject`, optionally as a member of a queue group.
    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn Subscription>, RpcError>;

    /// Wait until buffered outbound messages reached the broker.
    async fn flush(&self) -> Result<(), RpcError>;

    /// Release the link. Further calls fail with [`RpcError::Transport`].
    async fn close(&self) -> Result<(), RpcError>;
}

/// Stream of incoming messages for one subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next message; `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Delivery>;

    /// Stop receiving. Messages already buffered may still be returned by `next`.
    async fn unsubscribe(&mut self) -> Result<(), RpcError>;
}
