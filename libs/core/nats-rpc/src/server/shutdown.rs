//! In-flight request tracking and shutdown signals.

use crate::error::RpcError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

/// Longest a server waits for in-flight requests once shutdown begins.
pub const DRAIN_CEILING: Duration = Duration::from_secs(15);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Count of requests being handled by one server.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    count: Arc<AtomicU64>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one request until the guard is dropped, including during unwinding.
    #[must_use]
    pub fn guard(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until no request is in flight, polling up to `timeout`.
    ///
    /// Returns `false` if requests were still running when the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() -> Result<(), RpcError> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .map_err(|e| RpcError::Config(format!("failed to install Ctrl+C handler: {e}")))
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(|e| RpcError::Config(format!("failed to install SIGTERM handler: {e}")))?
            .recv()
            .await;
        Ok::<(), RpcError>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<(), RpcError>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
    Ok(())
}
