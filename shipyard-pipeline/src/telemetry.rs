//! Tracing subscriber initialisation

use crate::constants::{
    DEFAULT_LOG_FILTER, DEFAULT_SERVICE_NAME, ENV_LOG_FILTER, ENV_LOG_JSON, ENV_SERVICE_NAME,
};
use shipyard_core::{ConfigError, ShipyardResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive string.
    pub log_filter: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json: true,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_filter: std::env::var(ENV_LOG_FILTER).unwrap_or(defaults.log_filter),
            json: std::env::var(ENV_LOG_JSON)
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.json),
            service_name: std::env::var(ENV_SERVICE_NAME).unwrap_or(defaults.service_name),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails with [`ConfigError`] because a
/// global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> ShipyardResult<()> {
    let env_filter =
        EnvFilter::try_new(&config.log_filter).map_err(|e| ConfigError::InvalidValue {
            field: ENV_LOG_FILTER.to_string(),
            value: config.log_filter.clone(),
            reason: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ConfigError::TracingInit {
        reason: e.to_string(),
    })?;

    tracing::info!(
        service_name = %config.service_name,
        json = config.json,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::ShipyardError;

    #[test]
    fn test_invalid_filter_is_config_error() {
        let config = TelemetryConfig {
            log_filter: "shipyard=notalevel".to_string(),
            ..TelemetryConfig::default()
        };
        let err = init_tracing(&config).unwrap_err();
        assert!(matches!(
            err,
            ShipyardError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig {
            json: false,
            ..TelemetryConfig::default()
        };
        // Another test in this binary may already have installed a
        // subscriber, so only the second call is asserted.
        let _ = init_tracing(&config);
        let err = init_tracing(&config).unwrap_err();
        assert!(matches!(
            err,
            ShipyardError::Config(ConfigError::TracingInit { .. })
        ));
    }
}
