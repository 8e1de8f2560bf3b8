//! Handler shapes accepted by the router.
//!
//! Two shapes are supported and stored as a tagged [`Handler`]:
//!
//! - raw: `async fn(Context, Request) -> Response`, full control over encoding;
//! - typed: `async fn(Context) -> Result<T, RpcError>` or
//!   `async fn(Context, U) -> Result<T, RpcError>`, where `U: FromBody` is decoded
//!   (and validated) from the request body and `T: IntoReply` is encoded back.
//!
//! Shapes are checked by the compiler through [`TypedHandler`]; nothing is
//! inspected at runtime.

use crate::body::{Json, RawBody};
use crate::context::Context;
use crate::envelope::{Request, Response};
use crate::error::RpcError;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use validator::Validate;

type RawFn = dyn Fn(Context, Request) -> BoxFuture<'static, Response> + Send + Sync;
type TypedFn = dyn Fn(Context, Request) -> BoxFuture<'static, Result<Response, RpcError>> + Send + Sync;

/// Registered handler.
#[derive(Clone)]
pub enum Handler {
    Raw(Arc<RawFn>),
    Typed(Arc<TypedFn>),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Raw(_) => f.write_str("Handler::Raw"),
            Handler::Typed(_) => f.write_str("Handler::Typed"),
        }
    }
}

impl Handler {
    /// Handler receiving the request envelope and building the reply itself.
    pub fn raw<F, Fut>(handler: F) -> Self
    where
        F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Handler::Raw(Arc::new(move |ctx, request| Box::pin(handler(ctx, request))))
    }

    /// Handler with a decoded argument and an encoded result.
    pub fn typed<H, Args>(handler: H) -> Self
    where
        H: TypedHandler<Args>,
        Args: 'static,
    {
        Handler::Typed(Arc::new(move |ctx, request| handler.invoke(ctx, request)))
    }

    pub(crate) async fn call(&self, ctx: Context, request: Request) -> Result<Response, RpcError> {
        match self {
            Handler::Raw(handler) => Ok(handler(ctx, request).await),
            Handler::Typed(handler) => handler(ctx, request).await,
        }
    }
}

/// Functions usable as typed handlers. `Args` only disambiguates the impls.
pub trait TypedHandler<Args>: Send + Sync + 'static {
    fn invoke(&self, ctx: Context, request: Request) -> BoxFuture<'static, Result<Response, RpcError>>;
}

impl<F, Fut, T> TypedHandler<(T,)> for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
    T: IntoReply,
{
    fn invoke(&self, ctx: Context, _request: Request) -> BoxFuture<'static, Result<Response, RpcError>> {
        let fut = self(ctx);
        Box::pin(async move { fut.await?.into_reply() })
    }
}

impl<F, Fut, U, T> TypedHandler<(U, T)> for F
where
    F: Fn(Context, U) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
    U: FromBody,
    T: IntoReply,
{
    fn invoke(&self, ctx: Context, request: Request) -> BoxFuture<'static, Result<Response, RpcError>> {
        let arg = match U::from_body(&request.body) {
            Ok(arg) => arg,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let fut = self(ctx, arg);
        Box::pin(async move { fut.await?.into_reply() })
    }
}

/// Handler arguments decoded from the request body.
pub trait FromBody: Sized + Send + 'static {
    fn from_body(body: &[u8]) -> Result<Self, RpcError>;
}

/// Decodes JSON and runs the type's `validator` constraints.
impl<U> FromBody for Json<U>
where
    U: DeserializeOwned + Validate + Send + 'static,
{
    fn from_body(body: &[u8]) -> Result<Self, RpcError> {
        if body.trim_ascii().is_empty() {
            return Err(RpcError::Invalid("Body is empty".to_string()));
        }
        let value: U = serde_json::from_slice(body)?;
        value.validate()?;
        Ok(Json(value))
    }
}

/// Body text; a JSON string literal is unquoted.
impl FromBody for String {
    fn from_body(body: &[u8]) -> Result<Self, RpcError> {
        let text = String::from_utf8(body.to_vec())
            .map_err(|e| RpcError::Decode(format!("body is not UTF-8: {e}")))?;
        if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
            if let Ok(unquoted) = serde_json::from_str::<String>(&text) {
                return Ok(unquoted);
            }
        }
        Ok(text)
    }
}

impl FromBody for RawBody {
    fn from_body(body: &[u8]) -> Result<Self, RpcError> {
        Ok(RawBody(body.to_vec()))
    }
}

/// Handler results encoded into a reply.
///
/// `()` and `None` give an empty 200; strings, numbers and booleans are sent as
/// their literal text; a [`Response`] passes through unchanged; `Json` and
/// `serde_json::Value` are JSON-encoded.
pub trait IntoReply: Send + 'static {
    fn into_reply(self) -> Result<Response, RpcError>;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Response, RpcError> {
        Ok(Response::new(200))
    }
}

impl IntoReply for Response {
    fn into_reply(self) -> Result<Response, RpcError> {
        Ok(self)
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Result<Response, RpcError> {
        Ok(Response::builder().text(self).build())
    }
}

impl IntoReply for &'static str {
    fn into_reply(self) -> Result<Response, RpcError> {
        Ok(Response::builder().text(self).build())
    }
}

macro_rules! literal_reply {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoReply for $ty {
                fn into_reply(self) -> Result<Response, RpcError> {
                    Ok(Response::builder().text(self.to_string()).build())
                }
            }
        )*
    };
}

literal_reply!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool);

impl<T: Serialize + Send + 'static> IntoReply for Json<T> {
    fn into_reply(self) -> Result<Response, RpcError> {
        Ok(Response::builder().json(&self.0)?.build())
    }
}

impl IntoReply for serde_json::Value {
    fn into_reply(self) -> Result<Response, RpcError> {
        Ok(Response::builder().json(&self)?.build())
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Result<Response, RpcError> {
        match self {
            Some(value) => value.into_reply(),
            None => Ok(Response::new(200)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, Validate)]
    struct Rename {
        #[validate(length(min = 1))]
        name: String,
    }

    async fn rename(_ctx: Context, Json(body): Json<Rename>) -> Result<String, RpcError> {
        Ok(body.name)
    }

    async fn count(_ctx: Context) -> Result<u32, RpcError> {
        Ok(7)
    }

    async fn nothing(_ctx: Context) -> Result<Option<Json<Rename>>, RpcError> {
        Ok(None)
    }

    #[tokio::test]
    async fn test_typed_with_body() {
        let handler = Handler::typed(rename);
        let request = Request::post("/rename").body(r#"{"name":"ann"}"#).build();
        let response = handler.call(Context::background(), request).await.unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.body, b"ann");
    }

    #[tokio::test]
    async fn test_typed_rejects_invalid_body() {
        let handler = Handler::typed(rename);

        let empty = Request::post("/rename").build();
        let err = handler.call(Context::background(), empty).await.unwrap_err();
        assert!(matches!(err, RpcError::Invalid(_)));
        assert_eq!(err.status(), 400);

        let blank = Request::post("/rename").body("  \n").build();
        let err = handler.call(Context::background(), blank).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid request: Body is empty");

        let invalid = Request::post("/rename").body(r#"{"name":""}"#).build();
        let err = handler.call(Context::background(), invalid).await.unwrap_err();
        assert!(matches!(err, RpcError::Validation(_)));
    }

    #[tokio::test]
    async fn test_scalar_and_empty_results() {
        let response = Handler::typed(count)
            .call(Context::background(), Request::get("/count").build())
            .await
            .unwrap();
        assert_eq!(response.body, b"7");

        let response = Handler::typed(nothing)
            .call(Context::background(), Request::get("/nothing").build())
            .await
            .unwrap();
        assert_eq!(response.code, 200);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_raw_handler_passes_through() {
        let handler = Handler::raw(|_ctx, request: Request| async move {
            Response::builder().status(201).body(request.body).build()
        });
        let response = handler
            .call(Context::background(), Request::post("/x").body("abc").build())
            .await
            .unwrap();
        assert_eq!(response.code, 201);
        assert_eq!(response.body, b"abc");
    }

    #[test]
    fn test_string_body_is_unquoted() {
        assert_eq!(String::from_body(br#""hello""#).unwrap(), "hello");
        assert_eq!(String::from_body(b"plain").unwrap(), "plain");
        assert_eq!(String::from_body(br#""say \"hi\"""#).unwrap(), r#"say "hi""#);
        assert_eq!(String::from_body(br#""unterminated \""#).unwrap(), r#""unterminated \""#);
    }
}
