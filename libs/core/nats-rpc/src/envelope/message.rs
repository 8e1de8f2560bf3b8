use crate::context::Context;
use crate::error::RpcError;
use crate::headers::Headers;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Fire-and-forget event: propagated headers plus a JSON body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Message {
    pub fn new<T: Serialize + ?Sized>(body: &T) -> Result<Self, RpcError> {
        Ok(Self {
            headers: Headers::default(),
            body: serde_json::to_value(body)?,
        })
    }

    /// Rebuild the sender's call context and decode the body.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<(Context, T), RpcError> {
        let ctx = Context::from_headers(&self.headers);
        let body = T::deserialize(&self.body)?;
        Ok((ctx, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{REQUEST_ID, USER_INFO};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Created {
        id: u32,
    }

    #[test]
    fn test_parse_restores_context() {
        let mut message = Message::new(&json!({"id": 7})).unwrap();
        message.headers.set(REQUEST_ID, "req-9");
        message
            .headers
            .set(USER_INFO, r#"{"userId":"u-1","role":"admin"}"#);

        let (ctx, body): (Context, Created) = message.parse().unwrap();
        assert_eq!(body, Created { id: 7 });
        assert_eq!(ctx.request_id(), "req-9");
        assert_eq!(ctx.user_info().and_then(|u| u.role.as_deref()), Some("admin"));
    }

    #[test]
    fn test_parse_rejects_mismatched_body() {
        let message = Message::new(&json!({"id": "nope"})).unwrap();
        let result: Result<(Context, Created), _> = message.parse();
        assert!(matches!(result, Err(RpcError::Decode(_))));
    }
}
