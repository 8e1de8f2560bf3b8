//! HTTP-shaped request/reply RPC over NATS.
//!
//! Services exchange JSON envelopes that look like HTTP calls (method, URL,
//! headers, base64 body) over NATS request/reply. A [`Server`] routes inbound
//! requests to handlers, a [`Client`] issues calls with correlation, identity and
//! trace propagation, and a [`MessageSubscriber`] runs fire-and-forget event
//! handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  Request  ┌──────────────────┐  Delivery  ┌──────────────┐
//! │   Client   │──────────▶│    Connection    │───────────▶│    Server    │
//! │ (+Context) │◀──────────│ (NATS / Local)   │◀───────────│  (+Router)   │
//! └────────────┘  Response └──────────────────┘   reply    └──────────────┘
//!                                   │                              │
//!                                   ▼                              ▼
//!                         ┌───────────────────┐          ┌──────────────────┐
//!                         │ MessageSubscriber │          │ Handler::Raw     │
//!                         │ (events, no reply)│          │ Handler::Typed   │
//!                         └───────────────────┘          └──────────────────┘
//! ```
//!
//! # Key Features
//!
//! - **Typed handlers**: `async fn(Context, Json<U>) -> Result<T, RpcError>`, with
//!   body validation through `validator`
//! - **Authorization**: per-route predicates (`secured`, `is_authenticated`, ...)
//! - **Error taxonomy**: every failure becomes a structured reply with a status
//! - **Panic isolation**: a panicking handler yields a 500, the server keeps going
//! - **Graceful shutdown**: intake stops first, in-flight requests drain (bounded)
//! - **Prometheus metrics**: through the `metrics` facade
//! - **In-process broker**: [`LocalBroker`] for tests and embedded use
//!
//! # Example
//!
//! ```rust,ignore
//! use nats_rpc::{Context, Json, Method, Router, RpcError, Server};
//! use core_config::nats::NatsConfig;
//!
//! async fn get_user(ctx: Context) -> Result<Json<User>, RpcError> {
//!     let id = ctx.path_param("id").unwrap_or_default();
//!     Ok(Json(load_user(id).await?))
//! }
//!
//! let mut router = Router::new();
//! router.register_json(Method::Get, "/api/users/v1/{id}", get_user, [])?;
//!
//! Server::builder(NatsConfig::new("nats://localhost:4222").with_subject("api.users.v1"))
//!     .router(router)
//!     .build()?
//!     .run()
//!     .await?;
//! ```

pub mod auth;
mod body;
mod client;
pub mod connection;
mod context;
mod envelope;
mod error;
pub mod headers;
pub mod metrics;
pub mod path;
mod router;
mod server;
mod subscriber;
mod user;

pub use auth::{deny_all, is_anonymous, is_authenticated, secured, Authorizer};
pub use body::{Json, RawBody, ReplyBody};
pub use client::{CallSpan, Client, SpanFactory, TracingSpanFactory, SLOW_CALL_THRESHOLD};
pub use connection::{Connection, LocalBroker};
pub use context::{new_request_id, Context};
pub use envelope::{reason_phrase, Message, Method, Request, RequestBuilder, Response, ResponseBuilder};
pub use error::{ClientResponseError, DomainError, ErrorBody, FieldViolation, RpcError};
pub use headers::Headers;
pub use metrics::RpcMetrics;
pub use router::{FromBody, Handler, IntoReply, Router, TypedHandler, WILDCARD_PARAM};
pub use server::{
    shutdown_signal, AppInfo, BuildInfo, Health, InFlight, InFlightGuard, Server, ServerBuilder,
    ServerHandle, ServerState, DRAIN_CEILING,
};
pub use subscriber::MessageSubscriber;
pub use user::UserInfo;
