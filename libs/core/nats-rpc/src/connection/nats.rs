//! NATS implementation of [`Transport`].

use super::transport::{Delivery, Subscription, Transport};
use crate::error::RpcError;
use async_nats::client::RequestErrorKind;
use async_nats::{Client, ConnectOptions, Event, Subscriber};
use async_trait::async_trait;
use core_config::nats::NatsConfig;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Broker link backed by an `async-nats` client.
pub struct NatsTransport {
    client: Client,
    closed: AtomicBool,
}

impl NatsTransport {
    /// Connect with the settings of `config`.
    ///
    /// Reconnects are unlimited; connection events are logged.
    pub async fn connect(config: &NatsConfig) -> Result<Self, RpcError> {
        let servers = config.servers_string();
        if servers.is_empty() {
            return Err(RpcError::Config("no NATS server configured".to_string()));
        }

        let client = ConnectOptions::new()
            .name(config.client_name())
            .connection_timeout(config.connect_timeout)
            .subscription_capacity(config.subscription_capacity)
            .max_reconnects(None::<usize>)
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("NATS connected"),
                    Event::Disconnected => warn!("NATS disconnected"),
                    Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer, messages dropped"),
                    Event::ClientError(e) => error!(error = %e, "NATS client error"),
                    Event::ServerError(e) => error!(error = %e, "NATS server error"),
                    other => debug!(event = %other, "NATS event"),
                }
            })
            .connect(servers.as_str())
            .await
            .map_err(|e| RpcError::Transport(format!("failed to connect to NATS at {servers}: {e}")))?;

        info!(servers = %servers, name = %config.client_name(), "Connected to NATS");
        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying NATS client for advanced operations
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for NatsTransport {
    #[instrument(skip(self, payload), fields(subject = %subject))]
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        self.ensure_open()?;
        let request = async_nats::Request::new()
            .payload(payload.into())
            .timeout(Some(timeout));

        match self.client.send_request(subject.to_string(), request).await {
            Ok(message) => Ok(message.payload.to_vec()),
            Err(e) => match e.kind() {
                RequestErrorKind::TimedOut => Err(RpcError::Timeout(format!(
                    "no reply on '{subject}' within {}ms",
                    timeout.as_millis()
                ))),
                RequestErrorKind::NoResponders => Err(RpcError::NoResponders(subject.to_string())),
                _ => Err(RpcError::Transport(e.to_string())),
            },
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), RpcError> {
        self.ensure_open()?;
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| RpcError::Transport(format!("failed to publish to '{subject}': {e}")))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn Subscription>, RpcError> {
        self.ensure_open()?;
        let subscriber = match queue.filter(|q| !q.is_empty()) {
            Some(queue) => {
                self.client
                    .queue_subscribe(subject.to_string(), queue.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| RpcError::Transport(format!("failed to subscribe to '{subject}': {e}")))?;

        Ok(Box::new(NatsSubscription { subscriber }))
    }

    async fn flush(&self) -> Result<(), RpcError> {
        self.ensure_open()?;
        self.client
            .flush()
            .await
            .map_err(|e| RpcError::Transport(format!("flush failed: {e}")))
    }

    async fn close(&self) -> Result<(), RpcError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // the socket is released once the last client handle is dropped
        self.client
            .flush()
            .await
            .map_err(|e| RpcError::Transport(format!("flush on close failed: {e}")))
    }
}

struct NatsSubscription {
    subscriber: Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.subscriber.next().await.map(|msg| Delivery {
            subject: msg.subject.to_string(),
            reply: msg.reply.map(|s| s.to_string()),
            payload: msg.payload.to_vec(),
        })
    }

    async fn unsubscribe(&mut self) -> Result<(), RpcError> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|e| RpcError::Transport(format!("unsubscribe failed: {e}")))
    }
}
