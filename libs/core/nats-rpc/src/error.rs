//! Error taxonomy shared by client and server, and its wire rendering.
//!
//! Every server-side failure becomes a structured [`ErrorBody`] reply:
//!
//! | Error | Status |
//! |-------|--------|
//! | `Timeout` | 408 |
//! | `Transport`, `Config`, `Panic`, `Other` | 500 |
//! | `NoResponders`, `NotFound` | 404 |
//! | `Unauthorized` | 401 |
//! | `Validation`, `Decode`, `Invalid` | 400 |
//! | `MethodNotAllowed` | 405 |
//! | `HandlerTimeout` | 503 |
//! | `Domain` | its own status (default 400) |
//! | `ClientResponse` | upstream status and body |
//!
//! `Caused` wrappers and eyre context are looked through: an `Other` report that
//! carries a `DomainError`, `ClientResponseError` or `ValidationErrors` maps like
//! the bare error.

use crate::envelope::{reason_phrase, Response};
use crate::headers;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use validator::{ValidationErrors, ValidationErrorsKind};

/// `serverError` code for unexpected failures.
pub const GENERIC_SERVER_ERROR: &str = "SOME_THINGS_WENT_WRONG";

pub const VALIDATION_MESSAGE: &str = "Validation Errors";

/// Typed business error raised by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainError {
    pub status: u16,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl DomainError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: 400,
            code: code.into(),
            message: message.into(),
            param: None,
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message).with_status(404)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message).with_status(409)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DomainError {}

/// A call that produced an unusable reply, with the reply itself attached.
#[derive(Debug)]
pub struct ClientResponseError {
    pub message: String,
    pub response: Response,
    pub cause: Option<Box<RpcError>>,
}

impl ClientResponseError {
    pub fn new(message: impl Into<String>, response: Response) -> Self {
        Self {
            message: message.into(),
            response,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: RpcError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn status(&self) -> u16 {
        self.response.code
    }
}

impl fmt::Display for ClientResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClientResponseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no responders for subject '{0}'")]
    NoResponders(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation Errors: {0}")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    ClientResponse(Box<ClientResponseError>),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("no route for {0}")]
    NotFound(String),

    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("nats handler timeout after {0:?}")]
    HandlerTimeout(Duration),

    #[error("handler panicked: {0}")]
    Panic(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{message}")]
    Caused {
        message: String,
        #[source]
        source: Box<RpcError>,
    },

    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl From<ClientResponseError> for RpcError {
    fn from(err: ClientResponseError) -> Self {
        RpcError::ClientResponse(Box::new(err))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Decode(err.to_string())
    }
}

impl RpcError {
    /// Wrap `source` with context that is peeled off again before status mapping.
    pub fn caused_by(message: impl Into<String>, source: RpcError) -> Self {
        RpcError::Caused {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Innermost error under any `Caused` wrappers or eyre context.
    pub fn root(&self) -> &RpcError {
        let mut current = self;
        loop {
            match current {
                RpcError::Caused { source, .. } => current = &**source,
                RpcError::Other(report) => match report.downcast_ref::<RpcError>() {
                    Some(inner) => current = inner,
                    None => return current,
                },
                _ => return current,
            }
        }
    }

    /// Business error, either direct or wrapped in eyre context.
    pub fn domain(&self) -> Option<&DomainError> {
        match self.root() {
            RpcError::Domain(e) => Some(e),
            RpcError::Other(report) => report.downcast_ref::<DomainError>(),
            _ => None,
        }
    }

    /// Upstream failure, either direct or wrapped in eyre context.
    pub fn upstream(&self) -> Option<&ClientResponseError> {
        match self.root() {
            RpcError::ClientResponse(e) => Some(&**e),
            RpcError::Other(report) => report.downcast_ref::<ClientResponseError>(),
            _ => None,
        }
    }

    fn validation(&self) -> Option<&ValidationErrors> {
        match self.root() {
            RpcError::Validation(errors) => Some(errors),
            RpcError::Other(report) => report.downcast_ref::<ValidationErrors>(),
            _ => None,
        }
    }

    pub fn status(&self) -> u16 {
        if let Some(e) = self.upstream() {
            return e.status();
        }
        if let Some(e) = self.domain() {
            return e.status;
        }
        if self.validation().is_some() {
            return 400;
        }
        match self.root() {
            RpcError::Timeout(_) => 408,
            RpcError::Transport(_) => 500,
            RpcError::NoResponders(_) => 404,
            RpcError::Unauthorized => 401,
            RpcError::Validation(_) => 400,
            RpcError::Domain(e) => e.status,
            RpcError::ClientResponse(e) => e.status(),
            RpcError::Decode(_) | RpcError::Invalid(_) => 400,
            RpcError::NotFound(_) => 404,
            RpcError::MethodNotAllowed { .. } => 405,
            RpcError::HandlerTimeout(_) => 503,
            RpcError::Panic(_) | RpcError::Config(_) | RpcError::Other(_) => 500,
            RpcError::Caused { .. } => 500,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self.upstream() {
            Some(e) => e.status() == 408,
            None => matches!(self.root(), RpcError::Timeout(_)),
        }
    }

    /// Failures a caller may reasonably retry. The runtime itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self.upstream() {
            Some(e) => matches!(e.status(), 408 | 502 | 503 | 504),
            None => matches!(
                self.root(),
                RpcError::Timeout(_) | RpcError::Transport(_) | RpcError::NoResponders(_)
            ),
        }
    }

    /// Upstream reply carried by a `ClientResponse` error.
    pub fn response(&self) -> Option<&Response> {
        self.upstream().map(|e| &e.response)
    }

    /// Render this error as the reply to the call identified by `request_id`.
    pub fn to_response(&self, request_id: &str, url: &str) -> Response {
        let status = self.status();

        if status >= 500 {
            tracing::error!(request_id = %request_id, status, error = %self, "Request failed");
        } else {
            tracing::debug!(request_id = %request_id, status, error = %self, "Request rejected");
        }

        let mut body = ErrorBody::new(self.to_string(), request_id, url);
        if let Some(e) = self.upstream() {
            if !e.response.body.is_empty() {
                let mut response = Response::new(status);
                response.headers.content_type = e.response.headers.content_type.clone();
                response.body = e.response.body.clone();
                return response;
            }
            body.message = e.message.clone();
            body.server_error = Some(server_error_code(status).to_string());
        } else if let Some(e) = self.domain() {
            body.message = e.message.clone();
            body.logref = Some(e.code.clone());
            body.path = e.param.clone();
            body.server_error = Some(e.code.clone());
        } else if let Some(errors) = self.validation() {
            body.message = VALIDATION_MESSAGE.to_string();
            body.server_error = Some(reason_phrase(400).to_string());
            body.validation_errors = FieldViolation::from_errors(errors);
        } else {
            match self.root() {
                RpcError::Unauthorized => {
                    body.message = reason_phrase(401).to_string();
                    body.server_error = Some(reason_phrase(401).to_string());
                }
                RpcError::HandlerTimeout(_) => {
                    body.message = "nats handler timeout".to_string();
                    body.server_error = Some(reason_phrase(503).to_string());
                }
                RpcError::Panic(_) => {
                    body.message = reason_phrase(500).to_string();
                    body.server_error = Some(GENERIC_SERVER_ERROR.to_string());
                }
                _ => {
                    body.server_error = Some(server_error_code(status).to_string());
                }
            }
        }

        body.into_response(status)
    }
}

fn server_error_code(status: u16) -> &'static str {
    if status >= 500 {
        GENERIC_SERVER_ERROR
    } else {
        reason_phrase(status)
    }
}

/// Structured error reply body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "_links", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, Vec<String>>,
    #[serde(rename = "_embedded", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub embedded: BTreeMap<String, Vec<ErrorBody>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<FieldViolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_error: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, request_id: &str, url: &str) -> Self {
        let mut links = BTreeMap::new();
        if !url.is_empty() {
            links.insert("self".to_string(), vec![url.to_string()]);
        }
        Self {
            message: message.into(),
            links,
            trace_id: (!request_id.is_empty()).then(|| request_id.to_string()),
            ..Default::default()
        }
    }

    pub fn into_response(self, status: u16) -> Response {
        let mut response = Response::new(status);
        response.headers.content_type = Some(headers::APPLICATION_JSON.to_string());
        // serializing a plain struct of strings cannot fail
        response.body = serde_json::to_vec(&self).unwrap_or_default();
        response
    }
}

/// One failed field constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Dotted path to the field, with `[i]` for list items.
    pub namespace: String,
    pub field: String,
    /// Name of the failed constraint, e.g. `required` or `length`.
    pub rule: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl FieldViolation {
    /// Flatten nested validation errors, sorted by namespace.
    pub fn from_errors(errors: &ValidationErrors) -> Vec<FieldViolation> {
        let mut out = Vec::new();
        collect_violations("", errors, &mut out);
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.rule.cmp(&b.rule)));
        out
    }
}

fn collect_violations(prefix: &str, errors: &ValidationErrors, out: &mut Vec<FieldViolation>) {
    for (field, kind) in errors.errors() {
        let namespace = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    let mut params: Vec<String> = error
                        .params
                        .iter()
                        .filter(|(key, _)| **key != "value")
                        .map(|(key, value)| format!("{key}={}", param_text(value)))
                        .collect();
                    params.sort();
                    out.push(FieldViolation {
                        namespace: namespace.clone(),
                        field: field.to_string(),
                        rule: error.code.to_string(),
                        value: error
                            .params
                            .get("value")
                            .cloned()
                            .unwrap_or_default(),
                        param: (!params.is_empty()).then(|| params.join(",")),
                    });
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_violations(&namespace, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_violations(&format!("{namespace}[{index}]"), nested, out);
                }
            }
        }
    }
}

fn param_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use validator::Validate;

    #[derive(Debug, Validate)]
    struct Signup {
        #[validate(required)]
        name: Option<String>,
        #[validate(length(min = 3, max = 10))]
        nickname: String,
    }

    #[test]
    fn test_caused_is_peeled_for_status() {
        let err = RpcError::caused_by(
            "loading profile",
            RpcError::caused_by("fetching user", RpcError::Unauthorized),
        );
        assert!(matches!(err.root(), RpcError::Unauthorized));
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RpcError::Timeout("x".into()).status(), 408);
        assert_eq!(RpcError::Transport("x".into()).status(), 500);
        assert_eq!(RpcError::Decode("x".into()).status(), 400);
        assert_eq!(RpcError::NotFound("/a".into()).status(), 404);
        assert_eq!(RpcError::HandlerTimeout(Duration::from_secs(1)).status(), 503);
        assert_eq!(RpcError::Other(eyre::eyre!("boom")).status(), 500);
        assert_eq!(
            RpcError::from(DomainError::conflict("DUPLICATE", "exists")).status(),
            409
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(RpcError::Timeout("x".into()).is_retryable());
        assert!(RpcError::Timeout("x".into()).is_timeout());
        assert!(!RpcError::Unauthorized.is_retryable());
        let upstream = ClientResponseError::new("busy", Response::new(503));
        assert!(RpcError::from(upstream).is_retryable());
    }

    #[test]
    fn test_validation_rendering() {
        let invalid = Signup {
            name: None,
            nickname: "ab".into(),
        };
        let err = RpcError::from(invalid.validate().unwrap_err());
        let response = err.to_response("req-1", "/api/signup");
        assert_eq!(response.code, 400);

        let body: ErrorBody = response.json().unwrap();
        assert_eq!(body.message, VALIDATION_MESSAGE);
        assert_eq!(body.server_error.as_deref(), Some("Bad Request"));
        assert_eq!(body.trace_id.as_deref(), Some("req-1"));
        assert_eq!(body.links["self"], vec!["/api/signup"]);

        let fields: Vec<_> = body.validation_errors.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "nickname"]);
        let nickname = &body.validation_errors[1];
        assert_eq!(nickname.rule, "length");
        assert_eq!(nickname.value, json!("ab"));
        assert_eq!(nickname.param.as_deref(), Some("max=10,min=3"));
    }

    #[test]
    fn test_domain_rendering() {
        let err = RpcError::from(DomainError::not_found("USER_NOT_FOUND", "no such user").with_param("id"));
        let response = err.to_response("r", "/users/1");
        assert_eq!(response.code, 404);
        let body: ErrorBody = response.json().unwrap();
        assert_eq!(body.message, "no such user");
        assert_eq!(body.server_error.as_deref(), Some("USER_NOT_FOUND"));
        assert_eq!(body.path.as_deref(), Some("id"));
    }

    #[test]
    fn test_upstream_reply_passes_through() {
        let upstream = Response::builder()
            .status(409)
            .json(&json!({"message": "taken"}))
            .unwrap()
            .build();
        let err = RpcError::from(ClientResponseError::new("conflict upstream", upstream));
        let response = err.to_response("r", "/x");
        assert_eq!(response.code, 409);
        assert_eq!(response.json::<serde_json::Value>().unwrap(), json!({"message": "taken"}));
    }

    #[test]
    fn test_empty_upstream_reply_gets_error_body() {
        let err = RpcError::from(ClientResponseError::new("gone", Response::new(410)));
        let response = err.to_response("r", "/x");
        assert_eq!(response.code, 410);
        let body: ErrorBody = response.json().unwrap();
        assert_eq!(body.message, "gone");
    }

    #[test]
    fn test_eyre_wrapped_domain_error_keeps_status() {
        use eyre::WrapErr;

        let saved: Result<(), DomainError> = Err(DomainError::conflict("DUPLICATE_EMAIL", "email taken"));
        let err: RpcError = saved.wrap_err("saving user").unwrap_err().into();
        assert_eq!(err.status(), 409);
        assert_eq!(err.domain().map(|e| e.code.as_str()), Some("DUPLICATE_EMAIL"));

        let response = err.to_response("r", "/users");
        assert_eq!(response.code, 409);
        let body: ErrorBody = response.json().unwrap();
        assert_eq!(body.message, "email taken");
        assert_eq!(body.logref.as_deref(), Some("DUPLICATE_EMAIL"));
    }

    #[test]
    fn test_eyre_wrapped_upstream_reply_passes_through() {
        use eyre::WrapErr;

        let upstream = Response::builder()
            .status(503)
            .json(&json!({"message": "maintenance"}))
            .unwrap()
            .build();
        let called: Result<(), ClientResponseError> = Err(ClientResponseError::new("upstream down", upstream));
        let err: RpcError = called.wrap_err("calling billing").unwrap_err().into();
        assert_eq!(err.status(), 503);
        assert!(err.is_retryable());
        assert!(err.response().is_some());

        let response = err.to_response("r", "/x");
        assert_eq!(response.code, 503);
        assert_eq!(
            response.json::<serde_json::Value>().unwrap(),
            json!({"message": "maintenance"})
        );
    }

    #[test]
    fn test_eyre_wrapped_rpc_error_is_peeled() {
        use eyre::WrapErr;

        let denied: Result<(), RpcError> = Err(RpcError::Unauthorized);
        let err: RpcError = denied.wrap_err("loading profile").unwrap_err().into();
        assert!(matches!(err.root(), RpcError::Unauthorized));
        assert_eq!(err.status(), 401);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unexpected_errors_use_generic_code() {
        let response = RpcError::Other(eyre::eyre!("disk full")).to_response("r", "/x");
        assert_eq!(response.code, 500);
        let body: ErrorBody = response.json().unwrap();
        assert_eq!(body.message, "disk full");
        assert_eq!(body.server_error.as_deref(), Some(GENERIC_SERVER_ERROR));
    }
}
