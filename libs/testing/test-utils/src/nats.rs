//! Throwaway NATS broker for request/reply tests.

use async_nats::Client;
use core_config::nats::NatsConfig;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;
use tokio::task::JoinHandle;

const CLIENT_PORT: u16 = 4222;

/// Image tag, overridable with `NATS_TEST_IMAGE_TAG`.
fn image_tag() -> String {
    std::env::var("NATS_TEST_IMAGE_TAG").unwrap_or_else(|_| "2.10-alpine".to_string())
}

/// A NATS server in a container, removed when dropped.
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
/// let config = nats.config("api.users.v1");
/// let raw = nats.client();
/// # }
/// ```
pub struct TestNats {
    _container: ContainerAsync<Nats>,
    client: Client,
    url: String,
}

impl TestNats {
    /// Start the container and wait until a client can connect.
    pub async fn new() -> Self {
        let container = Nats::default()
            .with_tag(image_tag())
            .start()
            .await
            .expect("NATS container should start");
        let port = container
            .get_host_port_ipv4(CLIENT_PORT)
            .await
            .expect("NATS client port should be mapped");
        let url = format!("nats://127.0.0.1:{port}");

        let client = async_nats::connect(&url)
            .await
            .expect("test client should connect to NATS");
        tracing::info!(url = %url, "Test NATS started");

        Self {
            _container: container,
            client,
            url,
        }
    }

    /// Raw broker client for assertions outside the RPC layer.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Settings for a server or client on `subject` with a short read timeout.
    pub fn config(&self, subject: &str) -> NatsConfig {
        NatsConfig::new(self.url.clone())
            .with_subject(subject)
            .with_read_timeout(Duration::from_secs(2))
            .with_client_name(format!("test-{subject}"))
    }

    /// Answer every request on `subject` with its own payload until aborted.
    pub async fn echo_responder(&self, subject: &str) -> JoinHandle<()> {
        let mut requests = self
            .client
            .subscribe(subject.to_string())
            .await
            .expect("echo responder should subscribe");
        self.client
            .flush()
            .await
            .expect("echo subscription should reach the server");
        let client = self.client.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.next().await {
                if let Some(reply) = request.reply {
                    let _ = client.publish(reply, request.payload).await;
                }
            }
        })
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!(url = %self.url, "Removing test NATS container");
    }
}
