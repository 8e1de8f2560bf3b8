//! Request/reply server.
//!
//! A [`Server`] binds a [`Router`] to one subject (optionally in a queue group so
//! several processes share the load). Every inbound message is handled on its own
//! task; shutdown stops intake first and then waits, bounded, for in-flight
//! requests before closing the connection.
//!
//! ```text
//! subject ──▶ subscription ──▶ task per message ──▶ Router::dispatch ──▶ reply
//!                  │                    │
//!                  └─ stop: unsubscribe └─ InFlightGuard held until the reply is sent
//! ```

mod shutdown;

pub use shutdown::{shutdown_signal, InFlight, InFlightGuard, DRAIN_CEILING};

use crate::connection::{Connection, Delivery, LocalBroker, Subscription, Transport};
use crate::context::{new_request_id, Context};
use crate::envelope::{Method, Request, Response};
use crate::error::RpcError;
use crate::headers::unix_nanos;
use crate::metrics::RpcMetrics;
use crate::path;
use crate::router::{panic_message, Router};
use crate::subscriber::MessageSubscriber;
use core_config::nats::NatsConfig;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Build metadata served by the default `info` route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    pub date: String,
    pub tag: String,
}

impl BuildInfo {
    /// Read `BUILD_VERSION`, `BUILD_DATE` and `BUILD_TAG`.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).unwrap_or_default();
        Self {
            version: var("BUILD_VERSION"),
            date: var("BUILD_DATE"),
            tag: var("BUILD_TAG"),
        }
    }
}

/// Body of the default `info` route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub build: BuildInfo,
}

/// Body of the default `health` route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
}

impl Health {
    pub fn up() -> Self {
        Self {
            status: "UP".to_string(),
        }
    }
}

/// Lifecycle of a started server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Draining,
    Stopped,
}

/// Configures and validates a [`Server`].
pub struct ServerBuilder {
    config: NatsConfig,
    router: Router,
    transport: Option<Arc<dyn Transport>>,
    subscriber: Option<MessageSubscriber>,
    drain_timeout: Duration,
    build_info: Option<BuildInfo>,
}

impl ServerBuilder {
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Serve over `transport` instead of connecting to the configured servers.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Serve over an in-process broker.
    pub fn local(self, broker: &LocalBroker) -> Self {
        self.transport(Arc::new(broker.connect()))
    }

    /// Event handlers activated with the server and drained on shutdown.
    pub fn subscriber(mut self, subscriber: MessageSubscriber) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Ceiling on the in-flight wait at shutdown (default [`DRAIN_CEILING`]).
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Build info served by the `info` route (default [`BuildInfo::from_env`]).
    pub fn build_info(mut self, info: BuildInfo) -> Self {
        self.build_info = Some(info);
        self
    }

    pub fn build(self) -> Result<Server, RpcError> {
        let ServerBuilder {
            config,
            mut router,
            transport,
            subscriber,
            drain_timeout,
            build_info,
        } = self;

        if router.is_empty() {
            return Err(RpcError::Config("no handler registered".to_string()));
        }
        if config.subject.trim().is_empty() {
            return Err(RpcError::Config("subject must not be empty".to_string()));
        }
        if transport.is_none() && config.servers.iter().all(|s| s.trim().is_empty()) {
            return Err(RpcError::Config("NATS server address must not be empty".to_string()));
        }
        if config.read_timeout.is_zero() {
            return Err(RpcError::Config("read timeout must be positive".to_string()));
        }

        let metrics = RpcMetrics::new(&config.subject);
        register_default_routes(
            &mut router,
            &config.subject,
            build_info.unwrap_or_else(BuildInfo::from_env),
        )?;
        router.configure(config.read_timeout, metrics.clone());

        Ok(Server {
            config,
            router: Arc::new(router),
            transport,
            subscriber,
            drain_timeout,
            metrics,
        })
    }
}

/// `GET {base}/health` and `GET {base}/info`; skipped for wildcard subjects.
fn register_default_routes(router: &mut Router, subject: &str, build: BuildInfo) -> Result<(), RpcError> {
    if subject.split('.').any(|token| token == "*" || token == ">") {
        debug!(subject = %subject, "Wildcard subject, default routes not registered");
        return Ok(());
    }
    let health = Arc::new(serde_json::to_vec(&Health::up())?);
    let info = Arc::new(serde_json::to_vec(&AppInfo { build })?);

    router.route(Method::Get, &path::subject_to_url(subject, "health"), move |_, _| {
        let body = health.as_ref().clone();
        async move { Response::builder().body(body).build() }
    })?;
    router.route(Method::Get, &path::subject_to_url(subject, "info"), move |_, _| {
        let body = info.as_ref().clone();
        async move { Response::builder().body(body).build() }
    })?;
    Ok(())
}

/// RPC server bound to one subject.
pub struct Server {
    config: NatsConfig,
    router: Arc<Router>,
    transport: Option<Arc<dyn Transport>>,
    subscriber: Option<MessageSubscriber>,
    drain_timeout: Duration,
    metrics: RpcMetrics,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("subject", &self.config.subject)
            .field("queue", &self.config.queue)
            .field("routes", &self.router.len())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn builder(config: NatsConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            router: Router::new(),
            transport: None,
            subscriber: None,
            drain_timeout: DRAIN_CEILING,
            build_info: None,
        }
    }

    /// Connect, subscribe and serve in the background.
    ///
    /// Returns once the subscription is live.
    pub async fn start(self) -> Result<ServerHandle, RpcError> {
        let connection = match &self.transport {
            Some(transport) => {
                Connection::with_transport(Arc::clone(transport), self.config.read_timeout).await?
            }
            None => Connection::connect(&self.config).await?,
        };

        let queue = Some(self.config.queue.as_str()).filter(|q| !q.is_empty());
        let subscription = connection.subscribe(&self.config.subject, queue).await?;
        if let Some(subscriber) = &self.subscriber {
            subscriber.subscribe(&connection).await?;
        }

        let (stop, _) = watch::channel(false);
        let (state_tx, state) = watch::channel(ServerState::Running);
        let shared = Arc::new(Shared {
            subject: self.config.subject.clone(),
            router: self.router,
            in_flight: InFlight::new(),
            metrics: self.metrics,
            stop,
        });

        info!(
            subject = %shared.subject,
            queue = queue.unwrap_or_default(),
            servers = %self.config.servers_string(),
            routes = shared.router.len(),
            "Server started"
        );

        tokio::spawn(serve(
            Arc::clone(&shared),
            connection,
            subscription,
            self.subscriber,
            self.drain_timeout,
            state_tx,
        ));

        Ok(ServerHandle { shared, state })
    }

    /// Serve until SIGINT/SIGTERM, then shut down gracefully.
    ///
    /// Use [`Server::start`] to keep a [`ServerHandle`] that can stop it
    /// programmatically, or [`Server::run_until`] to supply the trigger.
    pub async fn run(self) -> Result<(), RpcError> {
        self.run_until(async {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Error waiting for shutdown signal");
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then shut down gracefully.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RpcError>
    where
        F: std::future::Future<Output = ()>,
    {
        let handle = self.start().await?;
        tokio::select! {
            _ = shutdown => {}
            _ = handle.stopped() => {}
        }
        handle.stop();
        handle.stopped().await;
        Ok(())
    }
}

struct Shared {
    subject: String,
    router: Arc<Router>,
    in_flight: InFlight,
    metrics: RpcMetrics,
    stop: watch::Sender<bool>,
}

/// Control handle of a started server. Clones control the same server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    state: watch::Receiver<ServerState>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("subject", &self.shared.subject)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn in_flight(&self) -> u64 {
        self.shared.in_flight.count()
    }

    /// Resolves once the server accepts requests.
    pub async fn started(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s != ServerState::Stopped).await;
    }

    /// Begin graceful shutdown. Returns immediately; await [`Self::stopped`].
    pub fn stop(&self) {
        self.shared.stop.send_replace(true);
    }

    /// Resolves after drain and close have completed.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
    }
}

async fn serve(
    shared: Arc<Shared>,
    connection: Connection,
    mut subscription: Box<dyn Subscription>,
    subscriber: Option<MessageSubscriber>,
    drain_timeout: Duration,
    state: watch::Sender<ServerState>,
) {
    let mut stop = shared.stop.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stop| *stop) => break,
            delivery = subscription.next() => match delivery {
                Some(delivery) => {
                    let guard = shared.in_flight.guard();
                    shared.metrics.in_flight(shared.in_flight.count());
                    let shared = Arc::clone(&shared);
                    let connection = connection.clone();
                    tokio::spawn(async move {
                        handle_delivery(&shared, &connection, delivery).await;
                        drop(guard);
                        shared.metrics.in_flight(shared.in_flight.count());
                    });
                }
                None => {
                    warn!(subject = %shared.subject, "Subscription closed by the broker");
                    break;
                }
            },
        }
    }

    state.send_replace(ServerState::Draining);
    info!(subject = %shared.subject, in_flight = shared.in_flight.count(), "Server draining");

    if let Err(e) = subscription.unsubscribe().await {
        warn!(subject = %shared.subject, error = %e, "Failed to unsubscribe");
    }
    if let Err(e) = connection.flush().await {
        warn!(subject = %shared.subject, error = %e, "Failed to flush connection");
    }
    if !shared.in_flight.wait_for_drain(drain_timeout).await {
        warn!(
            subject = %shared.subject,
            in_flight = shared.in_flight.count(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Drain ceiling reached, abandoning in-flight requests"
        );
    }
    if let Some(subscriber) = subscriber {
        subscriber.drain().await;
    }
    if let Err(e) = connection.close().await {
        warn!(subject = %shared.subject, error = %e, "Failed to close connection");
    }

    state.send_replace(ServerState::Stopped);
    info!(subject = %shared.subject, "Server stopped");
}

async fn handle_delivery(shared: &Shared, connection: &Connection, delivery: Delivery) {
    let started = Instant::now();
    let Delivery {
        subject,
        reply,
        payload,
    } = delivery;

    let mut request: Request = match serde_json::from_slice(&payload) {
        Ok(request) => request,
        Err(e) => {
            let request_id = new_request_id();
            warn!(subject = %subject, request_id = %request_id, error = %e, "Unreadable request");
            let mut response = RpcError::Decode(e.to_string()).to_response(&request_id, "");
            response.headers.request_id = Some(request_id);
            send_reply(connection, &subject, reply.as_deref(), response).await;
            return;
        }
    };

    if request.headers.request_id.as_deref().map_or(true, str::is_empty) {
        request.headers.request_id = Some(new_request_id());
    }
    let request_id = request.headers.request_id.clone().unwrap_or_default();
    let method = request.method;
    let url = path::loggable_url(&request.url);

    let span = info_span!(
        "rpc.request",
        request_id = %request_id,
        method = %method,
        url = %url,
        subject = %subject
    );
    let ctx = Context::from_headers(&request.headers).with_span(span.clone());
    debug!(parent: &span, "server received request");

    let dispatch = shared.router.dispatch(ctx, request).instrument(span.clone());
    let mut response = match AssertUnwindSafe(dispatch).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            shared.metrics.panic_recovered();
            let message = panic_message(panic.as_ref());
            error!(parent: &span, panic = %message, "Request task panicked");
            let mut response = RpcError::Panic(message).to_response(&request_id, &url);
            response.headers.request_id = Some(request_id.clone());
            response
        }
    };
    response.headers.response_time = Some(unix_nanos().to_string());

    let elapsed = started.elapsed();
    shared
        .metrics
        .request_handled(method.as_str(), response.code, elapsed);
    debug!(
        parent: &span,
        method = %method,
        url = %url,
        status = response.code,
        elapsed_ms = elapsed.as_millis() as u64,
        "request handled"
    );

    send_reply(connection, &subject, reply.as_deref(), response).await;
}

async fn send_reply(connection: &Connection, subject: &str, reply: Option<&str>, response: Response) {
    let Some(inbox) = reply.filter(|r| !r.is_empty()) else {
        debug!(subject = %subject, "No reply subject, response dropped");
        return;
    };
    let payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            error!(subject = %subject, error = %e, "Failed to encode reply");
            return;
        }
    };
    if let Err(e) = connection.publish(inbox, payload).await {
        warn!(subject = %subject, error = %e, "Failed to publish reply");
    }
}
