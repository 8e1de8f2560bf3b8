//! Echo RPC service
//!
//! Binary entry point.

use core_config::tracing::install_color_eyre;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_color_eyre();
    zerg_rpc_echo::run().await
}
