//! Environment-driven configuration shared by RPC services.

pub mod nats;
pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Deployment environment, from `APP_ENV`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// `production` (any case) selects production; anything else is development.
    pub fn from_env() -> Self {
        match env::var("APP_ENV") {
            Ok(value) if value.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Configuration loadable from environment variables.
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse `key`, falling back to `default` when unset.
pub fn env_parse<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_or_default(key, default)
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_from_app_env() {
        temp_env::with_var_unset("APP_ENV", || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
        temp_env::with_var("APP_ENV", Some("Production"), || {
            let env = Environment::from_env();
            assert!(env.is_production());
            assert!(!env.is_development());
        });
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("RPC_TEST_VAR", Some("set"), || {
            assert_eq!(env_or_default("RPC_TEST_VAR", "fallback"), "set");
        });
        temp_env::with_var_unset("RPC_TEST_VAR", || {
            assert_eq!(env_or_default("RPC_TEST_VAR", "fallback"), "fallback");
        });
    }

    #[test]
    fn test_env_required_names_the_variable() {
        temp_env::with_var_unset("RPC_REQUIRED", || {
            let err = env_required("RPC_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("RPC_REQUIRED"));
        });
    }

    #[test]
    fn test_env_parse() {
        temp_env::with_var("RPC_PORT", Some(" 4222 "), || {
            assert_eq!(env_parse::<u16>("RPC_PORT", "1").unwrap(), 4222);
        });
        temp_env::with_var_unset("RPC_PORT", || {
            assert_eq!(env_parse::<u16>("RPC_PORT", "1").unwrap(), 1);
        });
        temp_env::with_var("RPC_PORT", Some("many"), || {
            let err = env_parse::<u16>("RPC_PORT", "1").unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "RPC_PORT"));
        });
    }
}
