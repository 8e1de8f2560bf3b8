use crate::error::RpcError;
use crate::headers::{self, Headers};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Canonical reason phrase for a status code.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Reply to a [`Request`](super::Request).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub reason: String,
    pub code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "super::base64_body")]
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self {
            reason: reason_phrase(code).to_string(),
            code,
            headers: Headers::default(),
            body: Vec::new(),
        }
    }

    /// Builder preset to 200 with a JSON content type.
    pub fn builder() -> ResponseBuilder {
        let mut response = Response::new(200);
        response.headers.content_type = Some(headers::APPLICATION_JSON.to_string());
        ResponseBuilder { response }
    }

    pub fn set_status(&mut self, code: u16) {
        self.code = code;
        self.reason = reason_phrase(code).to_string();
    }

    pub fn is_informational(&self) -> bool {
        self.code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(headers::REQUEST_ID)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Fluent construction of a [`Response`].
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    pub fn status(mut self, code: u16) -> Self {
        self.response.set_status(code);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.response.body = body.into();
        self
    }

    /// Plain-text body.
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.response.body = body.into().into_bytes();
        self.response.headers.content_type = Some(headers::TEXT_PLAIN.to_string());
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, RpcError> {
        self.response.body = serde_json::to_vec(value)?;
        self.response.headers.content_type = Some(headers::APPLICATION_JSON.to_string());
        Ok(self)
    }

    pub fn build(self) -> Response {
        self.response
    }
}
