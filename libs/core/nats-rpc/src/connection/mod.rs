//! One logical link to the broker.
//!
//! [`Connection`] turns envelopes into broker calls with bounded timeouts. It
//! runs a warm-up request on construction so that the broker client has its reply
//! subscription in place before real traffic arrives.

mod local;
mod nats;
mod transport;

pub use local::{subject_matches, LocalBroker, LocalTransport};
pub use nats::NatsTransport;
pub use transport::{Delivery, Subscription, Transport};

use crate::envelope::{Method, Request, Response};
use crate::error::RpcError;
use core_config::nats::NatsConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Added to the read timeout so the remote handler deadline expires first.
pub const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

const WARMUP_SUBJECT_PREFIX: &str = "_warmup.ping";
const WARMUP_TIMEOUT: Duration = Duration::from_millis(1);

/// Cloneable handle to a broker link shared by clients, servers and subscribers.
#[derive(Clone)]
pub struct Connection {
    transport: Arc<dyn Transport>,
    read_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to NATS using `config`.
    pub async fn connect(config: &NatsConfig) -> Result<Self, RpcError> {
        let transport = NatsTransport::connect(config).await?;
        Self::with_transport(Arc::new(transport), config.read_timeout).await
    }

    /// Build a connection over any transport, running the warm-up request.
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        read_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let connection = Self {
            transport,
            read_timeout,
        };
        connection.warm_up().await?;
        Ok(connection)
    }

    /// Connection to an in-process broker.
    pub async fn local(broker: &LocalBroker, read_timeout: Duration) -> Result<Self, RpcError> {
        Self::with_transport(Arc::new(broker.connect()), read_timeout).await
    }

    async fn warm_up(&self) -> Result<(), RpcError> {
        let warmup = format!("{}.{}", WARMUP_SUBJECT_PREFIX, uuid::Uuid::new_v4().simple());
        let payload = serde_json::to_vec(&Request::new(Method::Get, format!("/{warmup}")))?;

        match self.transport.request(&warmup, payload, WARMUP_TIMEOUT).await {
            Ok(_) | Err(RpcError::Timeout(_)) | Err(RpcError::NoResponders(_)) => {}
            Err(e) => return Err(RpcError::caused_by("connection warm-up failed", e)),
        }
        self.transport.flush().await?;
        debug!("Connection warmed up");
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Timeout applied to outbound requests.
    pub fn request_timeout(&self) -> Duration {
        self.read_timeout + REQUEST_TIMEOUT_MARGIN
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send `request` to `subject` and wait for the reply envelope.
    pub async fn send_request(&self, request: &Request, subject: &str) -> Result<Response, RpcError> {
        if subject.is_empty() {
            return Err(RpcError::Invalid("subject must not be empty".to_string()));
        }
        let payload = serde_json::to_vec(request)?;
        let reply = self
            .transport
            .request(subject, payload, self.request_timeout())
            .await?;
        serde_json::from_slice(&reply)
            .map_err(|e| RpcError::Decode(format!("unreadable reply from '{subject}': {e}")))
    }

    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), RpcError> {
        if subject.is_empty() {
            return Err(RpcError::Invalid("subject must not be empty".to_string()));
        }
        self.transport.publish(subject, payload).await
    }

    pub async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn Subscription>, RpcError> {
        self.transport.subscribe(subject, queue).await
    }

    pub async fn flush(&self) -> Result<(), RpcError> {
        self.transport.flush().await
    }

    /// Flush, giving up after `bound`.
    pub async fn drain(&self, bound: Duration) -> Result<(), RpcError> {
        match tokio::time::timeout(bound, self.transport.flush()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(bound_ms = bound.as_millis() as u64, "Connection drain bound reached");
                Ok(())
            }
        }
    }

    pub async fn close(&self) -> Result<(), RpcError> {
        self.transport.close().await?;
        info!("Connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct BrokenTransport;

    #[async_trait]
    impl Transport for BrokenTransport {
        async fn request(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<Vec<u8>, RpcError> {
            Err(RpcError::Transport("socket reset".into()))
        }
        async fn publish(&self, _: &str, _: Vec<u8>) -> Result<(), RpcError> {
            Ok(())
        }
        async fn subscribe(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<Box<dyn Subscription>, RpcError> {
            Err(RpcError::Transport("socket reset".into()))
        }
        async fn flush(&self) -> Result<(), RpcError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), RpcError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_warm_up_swallows_missing_listener() {
        let broker = LocalBroker::new();
        let connection = Connection::local(&broker, Duration::from_secs(1)).await.unwrap();
        assert_eq!(connection.request_timeout(), Duration::from_secs(6));
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_warm_up_surfaces_other_errors() {
        let err = Connection::with_transport(Arc::new(BrokenTransport), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_empty_subject_is_rejected() {
        let broker = LocalBroker::new();
        let connection = Connection::local(&broker, Duration::from_secs(1)).await.unwrap();
        let err = connection
            .send_request(&Request::get("/x").build(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Invalid(_)));
        assert!(connection.publish("", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_send_request_round_trip() {
        let broker = LocalBroker::new();
        let connection = Connection::local(&broker, Duration::from_secs(1)).await.unwrap();
        let mut sub = connection.subscribe("svc.echo", None).await.unwrap();

        let responder = connection.clone();
        tokio::spawn(async move {
            let delivery = sub.next().await.unwrap();
            let request: Request = serde_json::from_slice(&delivery.payload).unwrap();
            let response = Response::builder().body(request.body).build();
            responder
                .publish(&delivery.reply.unwrap(), serde_json::to_vec(&response).unwrap())
                .await
                .unwrap();
        });

        let request = Request::post("/svc/echo").body("hello").build();
        let response = connection.send_request(&request, "svc.echo").await.unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.body, b"hello");
    }
}
