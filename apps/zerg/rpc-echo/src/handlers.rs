//! Routes and event handlers of the echo service.

use nats_rpc::{
    is_authenticated, secured, Client, Context, Json, Message, MessageSubscriber, Method, Request,
    Response, Router, RpcError, UserInfo,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use validator::Validate;

pub const SUBJECT: &str = "api.echo.v1";
pub const GREETED_EVENT: &str = "events.echo.greeted";
pub const EVENT_QUEUE: &str = "rpc-echo";

const EVENTS_DRAIN_BOUND: Duration = Duration::from_secs(5);

/// Counters shared by handlers and the event subscriber.
#[derive(Debug)]
pub struct EchoState {
    greeted: AtomicU64,
    events: AtomicU64,
    started: Instant,
    events_client: Option<Client>,
}

impl EchoState {
    /// `events_client` publishes greeting events; without one nothing is published.
    pub fn new(events_client: Option<Client>) -> Self {
        Self {
            greeted: AtomicU64::new(0),
            events: AtomicU64::new(0),
            started: Instant::now(),
            events_client,
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            greeted: self.greeted.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    /// Flush pending events and close the publisher's connection.
    pub async fn close(&self) -> Result<(), RpcError> {
        if let Some(client) = &self.events_client {
            client.connection().drain(EVENTS_DRAIN_BOUND).await?;
            client.connection().close().await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct GreetRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(length(max = 8))]
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub message: String,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeted {
    pub name: String,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub greeted: u64,
    pub events: u64,
    pub uptime_seconds: u64,
}

fn greeting_for(name: &str, language: Option<&str>) -> String {
    match language {
        Some("de") => format!("Hallo, {name}!"),
        Some("es") => format!("¡Hola, {name}!"),
        _ => format!("Hello, {name}!"),
    }
}

async fn echo(_ctx: Context, request: Request) -> Response {
    let mut response = Response::builder().body(request.body).build();
    response.headers.merge(&request.headers);
    response
}

async fn item(ctx: Context) -> Result<Json<Item>, RpcError> {
    let id = ctx
        .path_param("id")
        .ok_or_else(|| RpcError::Invalid("missing item id".to_string()))?;
    Ok(Json(Item {
        id: id.to_string(),
        from: ctx.query_param("from").map(str::to_string),
    }))
}

async fn whoami(ctx: Context) -> Result<Json<UserInfo>, RpcError> {
    Ok(Json(ctx.user_info().cloned().unwrap_or_default()))
}

/// Service routes, mounted under `/api/echo/v1`.
pub fn router(state: Arc<EchoState>) -> Result<Router, RpcError> {
    let mut router = Router::new();

    let greet_state = Arc::clone(&state);
    let stats_state = Arc::clone(&state);

    router
        .route(Method::Post, "/api/echo/v1/echo", echo)?
        .register_json(
            Method::Post,
            "/api/echo/v1/greet",
            move |ctx: Context, Json(body): Json<GreetRequest>| {
                let state = Arc::clone(&greet_state);
                async move {
                    state.greeted.fetch_add(1, Ordering::Relaxed);
                    if let Some(client) = &state.events_client {
                        let event = Greeted {
                            name: body.name.clone(),
                        };
                        if let Err(e) = client.publish(&ctx, GREETED_EVENT, &event).await {
                            warn!(error = %e, "Failed to publish greeting event");
                        }
                    }
                    Ok::<_, RpcError>(Json(Greeting {
                        message: greeting_for(&body.name, body.language.as_deref()),
                    }))
                }
            },
            [],
        )?
        .register_json(Method::Get, "/api/echo/v1/items/{id}", item, [])?
        .register_json(Method::Get, "/api/echo/v1/whoami", whoami, [is_authenticated()])?
        .register_json(
            Method::Get,
            "/api/echo/v1/stats",
            move |_ctx: Context| {
                let stats = stats_state.stats();
                async move { Ok::<_, RpcError>(Json(stats)) }
            },
            [secured(["admin"])],
        )?;

    Ok(router)
}

/// Event handlers of the service.
pub fn subscriber(state: Arc<EchoState>) -> MessageSubscriber {
    let subscriber = MessageSubscriber::new();
    subscriber.register_json(
        GREETED_EVENT,
        EVENT_QUEUE,
        move |ctx: Context, event: Greeted| {
            let state = Arc::clone(&state);
            async move {
                state.events.fetch_add(1, Ordering::Relaxed);
                info!(
                    request_id = %ctx.request_id(),
                    origin = %ctx.origin(),
                    name = %event.name,
                    "Greeting event received"
                );
                Ok(())
            }
        },
    );
    subscriber.register("events.echo.raw", "", |message: Message| async move {
        info!(body = %message.body, "Raw event received");
        Ok(())
    });
    subscriber
}
