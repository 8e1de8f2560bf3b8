//! Body wrappers shared by handlers and clients, and reply decoding.

use crate::error::RpcError;
use serde::de::DeserializeOwned;
use std::ops::{Deref, DerefMut};

/// JSON-encoded body.
///
/// As a handler argument the body is decoded and validated; as a handler result
/// the value is encoded as JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Json<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Undecoded body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBody(pub Vec<u8>);

impl RawBody {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Types a reply body can be decoded into.
///
/// Scalars (strings, numbers, booleans) are parsed from the raw text after
/// stripping one trailing newline, so handlers that answer with a literal value
/// interoperate with callers expecting that scalar. An empty body or a literal
/// `null` yields the type's zero value (`None` for options, `Default` otherwise).
pub trait ReplyBody: Sized {
    fn decode(body: &[u8]) -> Result<Self, RpcError>;
}

fn is_null(body: &[u8]) -> bool {
    let trimmed = body.trim_ascii();
    trimmed.is_empty() || trimmed == b"null"
}

fn clean_text(body: &[u8]) -> Result<&str, RpcError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| RpcError::Decode(format!("reply body is not UTF-8: {e}")))?;
    Ok(text.strip_suffix('\n').unwrap_or(text))
}

macro_rules! scalar_reply {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ReplyBody for $ty {
                fn decode(body: &[u8]) -> Result<Self, RpcError> {
                    if is_null(body) {
                        return Ok(<$ty>::default());
                    }
                    clean_text(body)?.trim().parse::<$ty>().map_err(|e| {
                        RpcError::Decode(format!(
                            "reply body is not a valid {}: {e}",
                            stringify!($ty)
                        ))
                    })
                }
            }
        )*
    };
}

scalar_reply!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool);

impl ReplyBody for String {
    fn decode(body: &[u8]) -> Result<Self, RpcError> {
        if is_null(body) {
            return Ok(String::new());
        }
        Ok(clean_text(body)?.to_string())
    }
}

impl ReplyBody for () {
    fn decode(_body: &[u8]) -> Result<Self, RpcError> {
        Ok(())
    }
}

impl ReplyBody for serde_json::Value {
    fn decode(body: &[u8]) -> Result<Self, RpcError> {
        if is_null(body) {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(body)?)
    }
}

impl ReplyBody for RawBody {
    fn decode(body: &[u8]) -> Result<Self, RpcError> {
        Ok(RawBody(body.to_vec()))
    }
}

impl<T: DeserializeOwned + Default> ReplyBody for Json<T> {
    fn decode(body: &[u8]) -> Result<Self, RpcError> {
        if is_null(body) {
            return Ok(Json(T::default()));
        }
        Ok(Json(serde_json::from_slice(body)?))
    }
}

impl<T: ReplyBody> ReplyBody for Option<T> {
    fn decode(body: &[u8]) -> Result<Self, RpcError> {
        if is_null(body) {
            return Ok(None);
        }
        T::decode(body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct User {
        name: String,
    }

    #[test]
    fn test_scalars_strip_one_newline() {
        assert_eq!(i64::decode(b"42\n").unwrap(), 42);
        assert_eq!(f64::decode(b"1.5").unwrap(), 1.5);
        assert!(bool::decode(b"true").unwrap());
        assert_eq!(String::decode(b"hello\n").unwrap(), "hello");
        assert_eq!(String::decode(b"hello\n\n").unwrap(), "hello\n");
    }

    #[test]
    fn test_null_and_empty_are_zero() {
        assert_eq!(i32::decode(b"null").unwrap(), 0);
        assert_eq!(String::decode(b"").unwrap(), "");
        assert_eq!(Json::<User>::decode(b"null").unwrap(), Json(User::default()));
        assert_eq!(Option::<u8>::decode(b"").unwrap(), None);
        assert_eq!(serde_json::Value::decode(b"").unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn test_bad_scalar_is_decode_error() {
        let err = u32::decode(b"forty").unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
        assert!(err.to_string().contains("u32"));
    }

    #[test]
    fn test_json_struct() {
        let user = Json::<User>::decode(br#"{"name":"ann"}"#).unwrap();
        assert_eq!(user.name, "ann");
        assert!(Json::<User>::decode(b"[1]").is_err());
    }
}
