use crate::error::RpcError;
use crate::headers::{self, Headers};
use crate::path::{self, PathParams, QueryParams};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Request method. Serialized upper-case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "CONNECT" => Ok(Method::Connect),
            other => Err(RpcError::Invalid(format!("unknown method '{other}'"))),
        }
    }
}

/// Inbound or outbound call.
///
/// `query` and `path_params` are filled by the router at dispatch time and never
/// serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "super::base64_body")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip)]
    pub query: QueryParams,
    #[serde(skip)]
    pub path_params: PathParams,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            request: Request::new(method, url),
        }
    }

    pub fn get(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Delete, url)
    }

    pub fn head(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Head, url)
    }

    pub fn options(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Options, url)
    }

    /// URL without the query string.
    pub fn path(&self) -> &str {
        path::split_query(&self.url).0
    }

    /// Explicit subject override, ignoring empty values.
    pub fn explicit_subject(&self) -> Option<&str> {
        self.subject.as_deref().filter(|s| !s.is_empty())
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Fluent construction of a [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Append a header value.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.append(name, value);
        self
    }

    /// Replace a header value.
    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.set(name, value);
        self
    }

    pub fn headers(mut self, headers: &Headers) -> Self {
        self.request.headers.merge(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.request.body = body.into();
        self
    }

    /// Serialize `value` as the body and mark it as JSON.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, RpcError> {
        self.request.body = serde_json::to_vec(value)?;
        self.request.headers.content_type = Some(headers::APPLICATION_JSON.to_string());
        Ok(self)
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.request.subject = Some(subject.into());
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}
