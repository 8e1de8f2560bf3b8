//! Route table and dispatch.
//!
//! Patterns are `/`-separated; a `{name}` segment captures one path segment and
//! a trailing `*` captures the remainder (available as the `*` path param).
//! Dispatch always produces a reply: routing, authorization, decoding, handler
//! errors, timeouts and panics are all mapped through [`RpcError::to_response`].

mod handler;

pub use handler::{FromBody, Handler, IntoReply, TypedHandler};

use crate::auth::{self, Authorizer};
use crate::context::Context;
use crate::envelope::{Method, Request, Response};
use crate::error::RpcError;
use crate::metrics::RpcMetrics;
use crate::path::{self, PathParams};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error};

/// Path param holding the remainder matched by a trailing `*`.
pub const WILDCARD_PARAM: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    segments: Vec<Segment>,
    wildcard: bool,
}

impl Pattern {
    fn parse(raw: &str) -> Result<Self, RpcError> {
        let mut segments = Vec::new();
        let mut wildcard = false;
        let parts: Vec<&str> = path::segments(raw).collect();

        for (index, part) in parts.iter().enumerate() {
            if *part == "*" {
                if index + 1 != parts.len() {
                    return Err(RpcError::Config(format!(
                        "route '{raw}': '*' is only allowed as the last segment"
                    )));
                }
                wildcard = true;
            } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() {
                    return Err(RpcError::Config(format!("route '{raw}': empty parameter name")));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            wildcard,
        })
    }

    fn matches(&self, parts: &[&str]) -> Option<PathParams> {
        let fixed = self.segments.len();
        if parts.len() < fixed || (!self.wildcard && parts.len() != fixed) {
            return None;
        }

        let mut params = PathParams::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal.as_str() == *part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    let value = urlencoding::decode(part)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| part.to_string());
                    params.insert(name.clone(), value);
                }
            }
        }
        if self.wildcard {
            params.insert(WILDCARD_PARAM.to_string(), parts[fixed..].join("/"));
        }
        Some(params)
    }
}

#[derive(Clone)]
struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
    authorizers: Vec<Authorizer>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.raw)
            .field("handler", &self.handler)
            .field("authorizers", &self.authorizers.len())
            .finish()
    }
}

/// Route table of one server.
///
/// Routes are registered during startup and read-only afterwards; the first
/// registered route matching method and path wins.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
    timeout: Option<Duration>,
    metrics: Option<RpcMetrics>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every handler invocation; an overrun replies 503.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn configure(&mut self, timeout: Duration, metrics: RpcMetrics) {
        self.timeout = Some(timeout);
        self.metrics = Some(metrics);
    }

    /// Register `handler` for `method` on `pattern`.
    ///
    /// With no authorizers the route is open; otherwise one accepting authorizer
    /// is enough.
    pub fn register<I>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        authorizers: I,
    ) -> Result<&mut Self, RpcError>
    where
        I: IntoIterator<Item = Authorizer>,
    {
        let pattern = Pattern::parse(pattern)?;
        debug!(method = %method, pattern = %pattern.raw, "Route registered");
        self.routes.push(Route {
            method,
            pattern,
            handler,
            authorizers: authorizers.into_iter().collect(),
        });
        Ok(self)
    }

    /// Open raw route.
    pub fn route<F, Fut>(&mut self, method: Method, pattern: &str, handler: F) -> Result<&mut Self, RpcError>
    where
        F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Response> + Send + 'static,
    {
        self.register(method, pattern, Handler::raw(handler), [])
    }

    /// Typed route guarded by `authorizers`.
    pub fn register_json<H, Args, I>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
        authorizers: I,
    ) -> Result<&mut Self, RpcError>
    where
        H: TypedHandler<Args>,
        Args: 'static,
        I: IntoIterator<Item = Authorizer>,
    {
        self.register(method, pattern, Handler::typed(handler), authorizers)
    }

    /// Typed `POST /<topic>` route.
    pub fn register_topic<H, Args, I>(&mut self, topic: &str, handler: H, authorizers: I) -> Result<&mut Self, RpcError>
    where
        H: TypedHandler<Args>,
        Args: 'static,
        I: IntoIterator<Item = Authorizer>,
    {
        let pattern = format!("/{}", topic.trim_start_matches('/'));
        self.register_json(Method::Post, &pattern, handler, authorizers)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn resolve(&self, method: Method, url: &str) -> Result<(&Route, PathParams), RpcError> {
        let parts: Vec<&str> = path::segments(url).collect();
        let mut path_matched = false;
        for route in &self.routes {
            if let Some(params) = route.pattern.matches(&parts) {
                if route.method == method {
                    return Ok((route, params));
                }
                path_matched = true;
            }
        }
        let path = path::split_query(url).0.to_string();
        if path_matched {
            Err(RpcError::MethodNotAllowed {
                method: method.to_string(),
                path,
            })
        } else {
            Err(RpcError::NotFound(format!("{method} {path}")))
        }
    }

    /// Turn one inbound request into its reply.
    ///
    /// The reply always carries the request id of `ctx`.
    pub async fn dispatch(&self, ctx: Context, mut request: Request) -> Response {
        let request_id = ctx.request_id().to_string();
        let url = request.url.clone();

        let mut response = match self.invoke(ctx, &mut request).await {
            Ok(response) => response,
            Err(e) => e.to_response(&request_id, &url),
        };
        if !request_id.is_empty() {
            response.headers.request_id = Some(request_id);
        }
        response
    }

    async fn invoke(&self, ctx: Context, request: &mut Request) -> Result<Response, RpcError> {
        let (route, params) = self.resolve(request.method, &request.url)?;

        let query = path::query_params(&request.url);
        request.query = query.clone();
        request.path_params = params.clone();
        let mut ctx = ctx.with_query(query).with_path_params(params);
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_timeout(timeout);
        }

        if !auth::is_authorized(&ctx, &route.authorizers) {
            return Err(RpcError::Unauthorized);
        }

        let request = std::mem::take(request);
        let call = AssertUnwindSafe(route.handler.call(ctx, request)).catch_unwind();
        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| RpcError::HandlerTimeout(timeout))?,
            None => call.await,
        };

        outcome.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(pattern = %route.pattern.raw, panic = %message, "Handler panicked");
            if let Some(metrics) = &self.metrics {
                metrics.panic_recovered();
            }
            Err(RpcError::Panic(message))
        })
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
