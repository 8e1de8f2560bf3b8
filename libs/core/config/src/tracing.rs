use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Default filter for RPC services when `RUST_LOG` is unset.
pub const DEVELOPMENT_FILTER: &str = "debug,async_nats=info";
pub const PRODUCTION_FILTER: &str = "info,async_nats=warn";

/// Install color-eyre for `main`. Later calls are no-ops.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Filter from `RUST_LOG`, else the environment's default.
pub fn env_filter(environment: &Environment) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if environment.is_production() {
            PRODUCTION_FILTER
        } else {
            DEVELOPMENT_FILTER
        })
    })
}

/// Initialize the global subscriber.
///
/// Production (`APP_ENV=production`) logs flattened JSON lines so request
/// fields (`request_id`, `method`, `url`, `status`) land as top-level keys;
/// development logs compact human-readable lines. Both carry an `ErrorLayer`
/// so eyre reports include the active span trace.
///
/// A subscriber that is already installed is left in place.
pub fn init_tracing(environment: &Environment) {
    let filter = env_filter(environment);

    let result = if environment.is_production() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(true)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(()) => info!(environment = ?environment, "Tracing initialized"),
        Err(_) => debug!("Tracing already initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_defaults_per_environment() {
        temp_env::with_var_unset("RUST_LOG", || {
            let development = env_filter(&Environment::Development).to_string();
            assert!(development.contains("async_nats=info"), "{development}");
            let production = env_filter(&Environment::Production).to_string();
            assert!(production.contains("async_nats=warn"), "{production}");
        });
    }

    #[test]
    fn test_env_filter_prefers_rust_log() {
        temp_env::with_var("RUST_LOG", Some("warn"), || {
            assert_eq!(env_filter(&Environment::Production).to_string(), "warn");
        });
    }

    #[test]
    fn test_install_color_eyre_twice() {
        install_color_eyre();
        install_color_eyre();
        let report = color_eyre::eyre::eyre!("boom").wrap_err("starting service");
        let rendered = format!("{report:?}");
        assert!(rendered.contains("starting service"), "{rendered}");
        assert!(rendered.contains("boom"), "{rendered}");
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing(&Environment::Development);
        init_tracing(&Environment::Production);
    }
}
