use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

pub const DEFAULT_SERVER: &str = "nats://localhost:4222";
pub const DEFAULT_QUEUE: &str = "workers";

/// NATS connection and subscription settings for RPC services and clients.
#[derive(Clone, Debug, PartialEq)]
pub struct NatsConfig {
    /// Server URLs tried in order
    pub servers: Vec<String>,

    /// Subject the service answers on (empty for client-only use)
    pub subject: String,

    /// Queue group shared by instances of the same service
    pub queue: String,

    /// Upper bound for handling one request
    pub read_timeout: Duration,

    /// Initial connection timeout
    pub connect_timeout: Duration,

    /// Messages buffered per subscription before the client reports a slow consumer
    pub subscription_capacity: usize,

    /// Connection name reported to the server
    pub client_name: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_SERVER.to_string()],
            subject: String::new(),
            queue: DEFAULT_QUEUE.to_string(),
            read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            subscription_capacity: 65_536,
            client_name: None,
        }
    }
}

impl NatsConfig {
    pub fn new(servers: impl Into<String>) -> Self {
        Self {
            servers: split_servers(&servers.into()),
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Servers as a comma separated list
    pub fn servers_string(&self) -> String {
        self.servers.join(",")
    }

    /// Explicit client name, else `<hostname>-<subject>`
    pub fn client_name(&self) -> String {
        match &self.client_name {
            Some(name) => name.clone(),
            None => {
                let host = env_or_default("HOSTNAME", "localhost");
                if self.subject.is_empty() {
                    host
                } else {
                    format!("{}-{}", host, self.subject)
                }
            }
        }
    }
}

fn split_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl FromEnv for NatsConfig {
    /// Reads from environment variables with defaults:
    /// - NATS_URL: comma separated servers, defaults to nats://localhost:4222
    /// - NATS_SUBJECT: defaults to empty
    /// - NATS_QUEUE: defaults to "workers"
    /// - NATS_READ_TIMEOUT_MS: defaults to 5000
    /// - NATS_CONNECT_TIMEOUT_MS: defaults to 10000
    /// - NATS_SUBSCRIPTION_CAPACITY: defaults to 65536
    /// - NATS_CLIENT_NAME: optional
    fn from_env() -> Result<Self, ConfigError> {
        let servers = split_servers(&env_or_default("NATS_URL", DEFAULT_SERVER));
        if servers.is_empty() {
            return Err(ConfigError::ParseError {
                key: "NATS_URL".to_string(),
                details: "no server URL given".to_string(),
            });
        }

        let read_timeout_ms: u64 = env_parse("NATS_READ_TIMEOUT_MS", "5000")?;
        let connect_timeout_ms: u64 = env_parse("NATS_CONNECT_TIMEOUT_MS", "10000")?;

        Ok(Self {
            servers,
            subject: env_or_default("NATS_SUBJECT", ""),
            queue: env_or_default("NATS_QUEUE", DEFAULT_QUEUE),
            read_timeout: Duration::from_millis(read_timeout_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            subscription_capacity: env_parse("NATS_SUBSCRIPTION_CAPACITY", "65536")?,
            client_name: std::env::var("NATS_CLIENT_NAME")
                .ok()
                .filter(|v| !v.is_empty()),
        })
    }
}
