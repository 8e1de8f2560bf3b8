//! Outbound calls.
//!
//! The client merges the caller's [`Context`] into request headers, resolves the
//! subject, and classifies the outcome: transport failures and non-2xx replies
//! come back as [`ClientResponseError`] so the caller can inspect or re-raise the
//! upstream reply.

use crate::body::ReplyBody;
use crate::connection::Connection;
use crate::context::{new_request_id, Context};
use crate::envelope::{Message, Request, Response};
use crate::error::{ClientResponseError, RpcError};
use crate::headers::{unix_nanos, Headers};
use crate::metrics::RpcMetrics;
use crate::path;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn, Span};

/// Calls slower than this are logged as warnings.
pub const SLOW_CALL_THRESHOLD: Duration = Duration::from_millis(2000);

/// Hook creating a tracing span around each outbound call.
pub trait SpanFactory: Send + Sync {
    /// Start a span labelled `label`; may write propagation headers.
    fn start(&self, label: &str, headers: &mut Headers) -> Box<dyn CallSpan>;
}

/// Span handle returned by a [`SpanFactory`].
pub trait CallSpan: Send {
    fn finish(self: Box<Self>, status: Option<u16>);
}

/// Default [`SpanFactory`] backed by `tracing` spans.
///
/// Assigns a trace id when the call does not carry one yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSpanFactory;

struct TracingCallSpan {
    span: Span,
    started: Instant,
}

impl SpanFactory for TracingSpanFactory {
    fn start(&self, label: &str, headers: &mut Headers) -> Box<dyn CallSpan> {
        let trace_id = headers
            .trace_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
            .clone();
        let span = tracing::debug_span!("rpc.client", call = %label, trace_id = %trace_id);
        Box::new(TracingCallSpan {
            span,
            started: Instant::now(),
        })
    }
}

impl CallSpan for TracingCallSpan {
    fn finish(self: Box<Self>, status: Option<u16>) {
        let _entered = self.span.enter();
        debug!(
            status = status.unwrap_or_default(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Call span finished"
        );
    }
}

/// RPC client over a shared [`Connection`].
#[derive(Clone)]
pub struct Client {
    connection: Connection,
    origin: String,
    spans: Arc<dyn SpanFactory>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            origin: String::new(),
            spans: Arc::new(TracingSpanFactory),
        }
    }

    /// Origin tag sent when the caller's context has none.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_span_factory(mut self, spans: Arc<dyn SpanFactory>) -> Self {
        self.spans = spans;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Copy call metadata from `ctx` into `headers`; returns the request id.
    fn propagate(&self, ctx: &Context, headers: &mut Headers) -> String {
        let request_id = [ctx.request_id(), headers.request_id.as_deref().unwrap_or_default()]
            .into_iter()
            .find(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_request_id);
        headers.request_id = Some(request_id.clone());

        if !ctx.origin().is_empty() {
            headers.origin = Some(ctx.origin().to_string());
        } else if headers.origin.is_none() && !self.origin.is_empty() {
            headers.origin = Some(self.origin.clone());
        }
        if !ctx.trace_id().is_empty() {
            headers.trace_id = Some(ctx.trace_id().to_string());
        }
        if let Some(user_info) = ctx.user_info_json() {
            headers.user_info = Some(user_info.to_string());
        }
        request_id
    }

    /// Issue `request` and return the 2xx reply.
    ///
    /// Transport failures become a synthetic 408 (timeout), 404 (nobody listening)
    /// or 500 reply wrapped in [`ClientResponseError`]; replies with status >= 300
    /// or < 200 are returned as errors carrying the reply.
    pub async fn send_request(&self, ctx: &Context, mut request: Request) -> Result<Response, RpcError> {
        let request_id = self.propagate(ctx, &mut request.headers);
        request.headers.request_time = Some(unix_nanos().to_string());

        let subject = request
            .explicit_subject()
            .map(str::to_string)
            .unwrap_or_else(|| path::url_to_subject(&request.url));
        let url = path::loggable_url(&request.url);
        let label = format!("{} {}", request.method, url);
        let span = self.spans.start(&label, &mut request.headers);
        let metrics = RpcMetrics::new(&subject);

        debug!(
            request_id = %request_id,
            method = %request.method,
            url = %url,
            subject = %subject,
            "Sending request"
        );

        let started = Instant::now();
        let result = self.connection.send_request(&request, &subject).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        if elapsed > SLOW_CALL_THRESHOLD {
            warn!(request_id = %request_id, method = %request.method, url = %url, elapsed_ms, "slow api");
        } else {
            debug!(request_id = %request_id, method = %request.method, url = %url, elapsed_ms, "request complete");
        }

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                span.finish(None);
                let (code, outcome) = match e.root() {
                    RpcError::Timeout(_) => (408, "timeout"),
                    RpcError::NoResponders(_) => (404, "no_responders"),
                    _ => (500, "error"),
                };
                metrics.client_request(outcome, elapsed);
                warn!(request_id = %request_id, subject = %subject, error = %e, "Request failed");

                let mut synthetic = Response::new(code);
                synthetic.reason = format!("{}: {}", synthetic.reason, request_id);
                synthetic.headers.request_id = Some(request_id);
                let message = synthetic.reason.clone();
                return Err(ClientResponseError::new(message, synthetic)
                    .with_cause(e)
                    .into());
            }
        };

        if response.headers.request_id.is_none() {
            response.headers.request_id = Some(request_id.clone());
        }
        self.check_latency(&request_id, &response);
        response.headers.response_time = None;
        span.finish(Some(response.code));

        let failure = if response.is_error() {
            Some(format!("{} {}", response.code, response.reason).trim_end().to_string())
        } else if response.is_redirection() {
            Some("HTTP 3xx Redirection was not implemented yet".to_string())
        } else if response.is_informational() {
            Some("HTTP 1xx Informational response was not implemented yet".to_string())
        } else {
            None
        };

        match failure {
            Some(message) => {
                metrics.client_request("rejected", elapsed);
                Err(ClientResponseError::new(message, response).into())
            }
            None => {
                metrics.client_request("ok", elapsed);
                Ok(response)
            }
        }
    }

    fn check_latency(&self, request_id: &str, response: &Response) {
        let Some(stamp) = response
            .headers
            .response_time
            .as_deref()
            .and_then(|v| v.parse::<i64>().ok())
        else {
            return;
        };
        let latency_ms = (unix_nanos() - stamp) / 1_000_000;
        if latency_ms > SLOW_CALL_THRESHOLD.as_millis() as i64 {
            warn!(request_id = %request_id, latency_ms, "response latency is too high");
        }
    }

    /// Issue `request` and decode the reply body into `T`.
    pub async fn send_and_receive_json<T: ReplyBody>(
        &self,
        ctx: &Context,
        request: Request,
    ) -> Result<T, RpcError> {
        let response = self.send_request(ctx, request).await?;
        T::decode(&response.body)
    }

    /// Publish `body` as a fire-and-forget [`Message`] on `subject`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        subject: &str,
        body: &T,
    ) -> Result<(), RpcError> {
        let mut message = Message::new(body)?;
        let request_id = self.propagate(ctx, &mut message.headers);
        let payload = serde_json::to_vec(&message)?;
        self.connection.publish(subject, payload).await?;
        debug!(request_id = %request_id, subject = %subject, "Published message");
        Ok(())
    }
}
