//! Echo RPC Service
//!
//! Answers HTTP-shaped calls on `api.echo.v1` over NATS request/reply and
//! consumes the greeting events it publishes.
//!
//! ## Architecture
//!
//! ```text
//! caller (nats_rpc::Client)
//!   ↓ request on api.echo.v1 (queue group)
//! Server → Router
//!   ├─ POST /api/echo/v1/echo        raw echo
//!   ├─ POST /api/echo/v1/greet       validated JSON, publishes events.echo.greeted
//!   ├─ GET  /api/echo/v1/items/{id}  path + query params
//!   ├─ GET  /api/echo/v1/whoami      authenticated callers
//!   ├─ GET  /api/echo/v1/stats       admin role
//!   ├─ GET  /api/echo/v1/health      built in
//!   └─ GET  /api/echo/v1/info        built in
//! MessageSubscriber
//!   └─ events.echo.greeted (queue rpc-echo)
//! ```
//!
//! ## Configuration
//!
//! - `NATS_*`: see [`core_config::nats::NatsConfig`]; the subject defaults to `api.echo.v1`
//! - `METRICS_PORT`: Prometheus exporter port (default 9090)
//! - `APP_ENV`, `RUST_LOG`: logging
//! - `BUILD_VERSION`, `BUILD_DATE`, `BUILD_TAG`: reported by the info route

pub mod handlers;

use core_config::nats::NatsConfig;
use core_config::{env_parse, Environment, FromEnv};
use eyre::{Result, WrapErr};
use handlers::{EchoState, SUBJECT};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_rpc::{BuildInfo, Client, Connection, Server};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Service configuration from the environment.
pub fn load_config() -> Result<(NatsConfig, u16)> {
    let mut nats = NatsConfig::from_env().wrap_err("Invalid NATS configuration")?;
    if nats.subject.is_empty() {
        nats.subject = SUBJECT.to_string();
    }
    let metrics_port: u16 = env_parse("METRICS_PORT", "9090").wrap_err("Invalid METRICS_PORT")?;
    Ok((nats, metrics_port))
}

/// Run the echo service until SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the metrics exporter
/// cannot bind, or the NATS connection fails.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let (config, metrics_port) = load_config()?;
    let build = BuildInfo::from_env();

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], metrics_port)))
        .install()
        .wrap_err("Failed to install Prometheus exporter")?;

    info!(
        version = %build.version,
        subject = %config.subject,
        servers = %config.servers_string(),
        metrics_port,
        environment = ?environment,
        "Starting echo RPC service"
    );

    let events = Connection::connect(&config)
        .await
        .wrap_err("Failed to connect event publisher")?;
    let state = Arc::new(EchoState::new(Some(
        Client::new(events).with_origin("rpc-echo"),
    )));

    Server::builder(config)
        .router(handlers::router(Arc::clone(&state))?)
        .subscriber(handlers::subscriber(Arc::clone(&state)))
        .build_info(build)
        .build()?
        .run()
        .await
        .wrap_err("RPC server failed")?;
    state
        .close()
        .await
        .wrap_err("Failed to close event publisher")?;

    info!(stats = ?state.stats(), "Echo RPC service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults_subject() {
        temp_env::with_vars_unset(["NATS_SUBJECT", "METRICS_PORT"], || {
            let (config, port) = load_config().unwrap();
            assert_eq!(config.subject, SUBJECT);
            assert_eq!(port, 9090);
        });
    }

    #[test]
    fn test_load_config_rejects_bad_metrics_port() {
        temp_env::with_var("METRICS_PORT", Some("ninety"), || {
            let err = load_config().unwrap_err();
            assert!(format!("{err:#}").contains("METRICS_PORT"));
        });
    }
}
