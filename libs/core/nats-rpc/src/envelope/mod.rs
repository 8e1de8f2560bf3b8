//! Request/response envelope and the fire-and-forget message shape.
//!
//! Bodies travel as base64 strings inside the JSON envelope.

mod message;
mod request;
mod response;

pub use message::Message;
pub use request::{Method, Request, RequestBuilder};
pub use response::{reason_phrase, Response, ResponseBuilder};

pub(crate) mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
