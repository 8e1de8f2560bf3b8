//! Test infrastructure for NATS RPC services.
//!
//! `TestNats` (feature `nats`, on by default) runs a broker in a container.
//! Container-backed tests need Docker; mark them `#[ignore]` and run them with
//! `cargo test -- --ignored`:
//!
//! ```rust,ignore
//! use nats_rpc::{Connection, Client, Context, Request};
//! use test_utils::TestNats;
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let connection = Connection::connect(&nats.config("api.users.v1")).await.unwrap();
//!     let client = Client::new(connection);
//!     // ...
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;
