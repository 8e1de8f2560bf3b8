//! Per-call scope propagated across the broker hop.
//!
//! A [`Context`] is immutable: every `with_*` method returns a derived copy and
//! leaves the receiver untouched. Missing fields read as empty defaults.

use crate::headers::Headers;
use crate::path::{PathParams, QueryParams};
use crate::user::UserInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{warn, Span};

/// Fresh request id: a time-ordered UUID without hyphens.
pub fn new_request_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// Call metadata threaded through clients, handlers and subscribers.
#[derive(Clone, Debug)]
pub struct Context {
    request_id: String,
    origin: String,
    trace_id: String,
    user_info: Option<Arc<UserInfo>>,
    user_info_json: Option<Arc<str>>,
    query: Arc<QueryParams>,
    path_params: Arc<PathParams>,
    cache: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    deadline: Option<Instant>,
    span: Span,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            origin: String::new(),
            trace_id: String::new(),
            user_info: None,
            user_info_json: None,
            query: Arc::default(),
            path_params: Arc::default(),
            cache: Arc::default(),
            deadline: None,
            span: Span::none(),
        }
    }
}

impl Context {
    /// Empty root context for outbound calls that start a new chain.
    pub fn background() -> Self {
        Self::default()
    }

    /// Context rebuilt from inbound headers.
    ///
    /// An unreadable user-info header is logged and treated as anonymous.
    pub fn from_headers(headers: &Headers) -> Self {
        let mut ctx = Context::default();
        if let Some(id) = headers.request_id.as_deref() {
            ctx.request_id = id.to_string();
        }
        if let Some(origin) = headers.origin.as_deref() {
            ctx.origin = origin.to_string();
        }
        if let Some(trace_id) = headers.trace_id.as_deref() {
            ctx.trace_id = trace_id.to_string();
        }
        if let Some(raw) = headers.user_info.as_deref().filter(|v| !v.is_empty()) {
            match serde_json::from_str::<UserInfo>(raw) {
                Ok(user) => {
                    ctx.user_info = Some(Arc::new(user));
                    ctx.user_info_json = Some(Arc::from(raw));
                }
                Err(e) => {
                    warn!(request_id = %ctx.request_id, error = %e, "Unreadable user info header")
                }
            }
        }
        ctx
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Caller identity; `None` for anonymous callers.
    pub fn user_info(&self) -> Option<&UserInfo> {
        self.user_info.as_deref()
    }

    /// Serialized caller identity as it travels in headers.
    pub fn user_info_json(&self) -> Option<&str> {
        self.user_info_json.as_deref()
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn path_params(&self) -> &PathParams {
        &self.path_params
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Logger handle for this call.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Per-call cache shared by every context derived from the same call.
    pub fn cache_get(&self, key: &str) -> Option<serde_json::Value> {
        self.cache.lock().get(key).cloned()
    }

    pub fn cache_put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.cache.lock().insert(key.into(), value);
    }

    pub fn with_request_id(&self, id: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.request_id = id.into();
        ctx
    }

    pub fn with_origin(&self, origin: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.origin = origin.into();
        ctx
    }

    pub fn with_trace_id(&self, trace_id: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.trace_id = trace_id.into();
        ctx
    }

    /// Derive a context acting as `user`.
    ///
    /// # Security
    ///
    /// This elevates the call to another identity without any check. Only use it
    /// after the caller has been authenticated by other means (for example a
    /// verified token at the edge); downstream services trust this identity as-is.
    pub fn with_user_info(&self, user: UserInfo) -> Self {
        let mut ctx = self.clone();
        ctx.user_info_json = serde_json::to_string(&user).ok().map(Arc::from);
        ctx.user_info = Some(Arc::new(user));
        ctx
    }

    /// Derive an anonymous context.
    pub fn without_user_info(&self) -> Self {
        let mut ctx = self.clone();
        ctx.user_info = None;
        ctx.user_info_json = None;
        ctx
    }

    pub fn with_query(&self, query: QueryParams) -> Self {
        let mut ctx = self.clone();
        ctx.query = Arc::new(query);
        ctx
    }

    pub fn with_path_params(&self, params: PathParams) -> Self {
        let mut ctx = self.clone();
        ctx.path_params = Arc::new(params);
        ctx
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(deadline);
        ctx
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_span(&self, span: Span) -> Self {
        let mut ctx = self.clone();
        ctx.span = span;
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{ORIGIN, REQUEST_ID, TRACE_ID, USER_INFO};
    use serde_json::json;

    #[test]
    fn test_defaults_are_empty() {
        let ctx = Context::background();
        assert_eq!(ctx.request_id(), "");
        assert_eq!(ctx.origin(), "");
        assert!(ctx.user_info().is_none());
        assert!(ctx.query().is_empty());
        assert_eq!(ctx.path_param("id"), None);
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_derivation_does_not_mutate_parent() {
        let parent = Context::background().with_request_id("r-1");
        let child = parent.with_request_id("r-2").with_origin("billing");

        assert_eq!(parent.request_id(), "r-1");
        assert_eq!(parent.origin(), "");
        assert_eq!(child.request_id(), "r-2");
        assert_eq!(child.origin(), "billing");
    }

    #[test]
    fn test_from_headers() {
        let mut headers = Headers::new();
        headers.set(REQUEST_ID, "abc");
        headers.set(ORIGIN, "gateway");
        headers.set(TRACE_ID, "t-1");
        headers.set(USER_INFO, r#"{"userId":"u-1","role":"user"}"#);

        let ctx = Context::from_headers(&headers);
        assert_eq!(ctx.request_id(), "abc");
        assert_eq!(ctx.origin(), "gateway");
        assert_eq!(ctx.trace_id(), "t-1");
        assert_eq!(ctx.user_info().and_then(|u| u.user_id.as_deref()), Some("u-1"));
        assert_eq!(ctx.user_info_json(), Some(r#"{"userId":"u-1","role":"user"}"#));
    }

    #[test]
    fn test_bad_user_info_is_anonymous() {
        let mut headers = Headers::new();
        headers.set(USER_INFO, "{not json");
        let ctx = Context::from_headers(&headers);
        assert!(ctx.user_info().is_none());
        assert!(ctx.user_info_json().is_none());
    }

    #[test]
    fn test_user_info_elevation() {
        let anonymous = Context::background();
        let admin = anonymous.with_user_info(UserInfo::new("u-9").with_role("admin"));

        assert!(anonymous.user_info().is_none());
        assert!(admin.user_info().is_some_and(|u| u.has_role("admin")));
        assert_eq!(admin.user_info_json(), Some(r#"{"userId":"u-9","role":"admin"}"#));
        assert!(admin.without_user_info().user_info().is_none());
    }

    #[test]
    fn test_cache_is_shared_across_derived_contexts() {
        let ctx = Context::background();
        let derived = ctx.with_request_id("x");
        derived.cache_put("tenant", json!("t-1"));
        assert_eq!(ctx.cache_get("tenant"), Some(json!("t-1")));
    }

    #[test]
    fn test_params_accessors() {
        let mut query = QueryParams::new();
        query.insert("from".into(), vec!["10".into(), "20".into()]);
        let mut path = PathParams::new();
        path.insert("id".into(), "42".into());

        let ctx = Context::background().with_query(query).with_path_params(path);
        assert_eq!(ctx.query_param("from"), Some("10"));
        assert_eq!(ctx.path_param("id"), Some("42"));
    }

    #[test]
    fn test_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(60));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining > Duration::from_secs(50));
    }
}
