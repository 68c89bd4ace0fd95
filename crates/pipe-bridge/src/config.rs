//! Runtime configuration for the bridge.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;

use crate::error::{BridgeError, Result};

/// Bytes moved per read. Also the most a single direction ever holds.
pub const CHUNK_SIZE: usize = 4096;

/// How long one `poll` waits before the cancellation token is re-checked.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What happens to a chunk whose sink reports `EAGAIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum WritePolicy {
    /// Discard the chunk and keep going. Lossy.
    #[default]
    Drop,
    /// Hold the chunk and stop reading its source until the sink drains.
    Retry,
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
    pub on_full: WritePolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            on_full: WritePolicy::Drop,
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.on_full = policy;
        self
    }

    /// Validate the configuration. `poll(2)` takes whole milliseconds, so the
    /// interval must land in `1..=u16::MAX` ms.
    pub fn validate(&self) -> Result<()> {
        let millis = self.poll_interval.as_millis();
        if millis == 0 {
            return Err(BridgeError::Config(
                "poll interval must be at least 1ms".to_string(),
            ));
        }
        if millis > u128::from(u16::MAX) {
            return Err(BridgeError::Config(format!(
                "poll interval must be at most {}ms (got {millis}ms)",
                u16::MAX
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_historical_behaviour() {
        let config = BridgeConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.on_full, WritePolicy::Drop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides_fields() {
        let config = BridgeConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_write_policy(WritePolicy::Retry);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.on_full, WritePolicy::Retry);
    }

    #[test]
    fn zero_interval_rejected() {
        let err = BridgeConfig::default()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("at least 1ms"));
    }

    #[test]
    fn oversized_interval_rejected() {
        let config = BridgeConfig::default().with_poll_interval(Duration::from_secs(120));
        assert!(config.validate().is_err());
    }

    #[test]
    fn policy_names_match_cli_values() {
        assert_eq!(WritePolicy::Drop.to_string(), "drop");
        assert_eq!(WritePolicy::from_str("retry", true).unwrap(), WritePolicy::Retry);
    }
}
