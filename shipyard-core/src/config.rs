//! Ingestion and fan-out configuration

use crate::constants::{
    DEFAULT_CI_AUTO_TRIGGER_BATCH_SIZE, DEFAULT_SYSTEM_USER_ID, ENV_CI_AUTO_TRIGGER_BATCH_SIZE,
    ENV_DEFAULT_DATA_SOURCE, ENV_SYSTEM_USER_ID,
};
use crate::{DataSource, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiConfig {
    /// Artifacts triggered concurrently per batch. Values below 1 are
    /// treated as 1.
    pub auto_trigger_batch_size: i64,
    /// Principal whose actions count as automatic triggers.
    pub system_user_id: UserId,
    /// Data source recorded when a build request does not name one.
    pub default_data_source: DataSource,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            auto_trigger_batch_size: DEFAULT_CI_AUTO_TRIGGER_BATCH_SIZE,
            system_user_id: UserId(DEFAULT_SYSTEM_USER_ID),
            default_data_source: DataSource::External,
        }
    }
}

impl CiConfig {
    /// Create config from environment variables. Unparsable values fall back
    /// to defaults.
    pub fn from_env() -> Self {
        let auto_trigger_batch_size = std::env::var(ENV_CI_AUTO_TRIGGER_BATCH_SIZE)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_CI_AUTO_TRIGGER_BATCH_SIZE);

        let system_user_id = std::env::var(ENV_SYSTEM_USER_ID)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(UserId)
            .unwrap_or(UserId(DEFAULT_SYSTEM_USER_ID));

        let default_data_source = std::env::var(ENV_DEFAULT_DATA_SOURCE)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Self {
            auto_trigger_batch_size,
            system_user_id,
            default_data_source,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.auto_trigger_batch_size = batch_size;
        self
    }

    pub fn effective_batch_size(&self) -> usize {
        usize::try_from(self.auto_trigger_batch_size.max(1)).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_batch_size_clamps() {
        assert_eq!(CiConfig::default().with_batch_size(0).effective_batch_size(), 1);
        assert_eq!(CiConfig::default().with_batch_size(-4).effective_batch_size(), 1);
        assert_eq!(CiConfig::default().with_batch_size(8).effective_batch_size(), 8);
    }

    #[test]
    fn test_defaults() {
        let config = CiConfig::default();
        assert_eq!(config.auto_trigger_batch_size, 1);
        assert!(config.system_user_id.is_system());
        assert_eq!(config.default_data_source, DataSource::External);
    }
}
