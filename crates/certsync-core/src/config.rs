//! Configuration types for the certsync system
//!
//! Every section is serde-derivable with per-field defaults, so a partial
//! JSON document (or none at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main certsync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertsyncConfig {
    /// Renewal scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// DNS-01 challenge settings
    #[serde(default)]
    pub challenge: ChallengeConfig,

    /// Agent protocol settings
    #[serde(default)]
    pub agent: AgentProtocolConfig,

    /// Download rate limiter settings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl CertsyncConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.scheduler.validate()?;
        self.challenge.validate()?;
        self.agent.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }
}

/// Renewal scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Renew certificates expiring within this many days
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,

    /// Interval of the full expiry sweep (in seconds)
    #[serde(default = "default_daily_sweep_interval_secs")]
    pub daily_sweep_interval_secs: u64,

    /// Interval of the retry sweep (in seconds)
    #[serde(default = "default_retry_sweep_interval_secs")]
    pub retry_sweep_interval_secs: u64,
}

impl SchedulerConfig {
    /// Validate the scheduler configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.renew_before_days <= 0 {
            return Err(crate::Error::config("renew_before_days must be > 0"));
        }
        if self.daily_sweep_interval_secs == 0 {
            return Err(crate::Error::config("daily_sweep_interval_secs must be > 0"));
        }
        if self.retry_sweep_interval_secs == 0 {
            return Err(crate::Error::config("retry_sweep_interval_secs must be > 0"));
        }
        Ok(())
    }

    /// Daily sweep interval
    pub fn daily_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.daily_sweep_interval_secs)
    }

    /// Retry sweep interval
    pub fn retry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retry_sweep_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            renew_before_days: default_renew_before_days(),
            daily_sweep_interval_secs: default_daily_sweep_interval_secs(),
            retry_sweep_interval_secs: default_retry_sweep_interval_secs(),
        }
    }
}

fn default_renew_before_days() -> i64 {
    30
}

fn default_daily_sweep_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_retry_sweep_interval_secs() -> u64 {
    10 * 60
}

/// DNS-01 challenge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Give up waiting for TXT visibility after this long (in seconds)
    #[serde(default = "default_propagation_timeout_secs")]
    pub propagation_timeout_secs: u64,

    /// Delay between propagation checks (in seconds)
    #[serde(default = "default_propagation_poll_interval_secs")]
    pub propagation_poll_interval_secs: u64,

    /// Bound on waiting for the CA to validate and the order to settle (in seconds)
    #[serde(default = "default_challenge_timeout_secs")]
    pub challenge_timeout_secs: u64,

    /// Delay between order status polls (in milliseconds)
    #[serde(default = "default_order_poll_interval_ms")]
    pub order_poll_interval_ms: u64,
}

impl ChallengeConfig {
    /// Validate the challenge configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.propagation_timeout_secs == 0 {
            return Err(crate::Error::config("propagation_timeout_secs must be > 0"));
        }
        if self.propagation_poll_interval_secs > self.propagation_timeout_secs {
            return Err(crate::Error::config(
                "propagation_poll_interval_secs must not exceed propagation_timeout_secs",
            ));
        }
        if self.challenge_timeout_secs == 0 {
            return Err(crate::Error::config("challenge_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Propagation timeout
    pub fn propagation_timeout(&self) -> Duration {
        Duration::from_secs(self.propagation_timeout_secs)
    }

    /// Propagation poll interval
    pub fn propagation_poll_interval(&self) -> Duration {
        Duration::from_secs(self.propagation_poll_interval_secs)
    }

    /// Challenge validation timeout
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    /// Order poll interval
    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_millis(self.order_poll_interval_ms)
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            propagation_timeout_secs: default_propagation_timeout_secs(),
            propagation_poll_interval_secs: default_propagation_poll_interval_secs(),
            challenge_timeout_secs: default_challenge_timeout_secs(),
            order_poll_interval_ms: default_order_poll_interval_ms(),
        }
    }
}

fn default_propagation_timeout_secs() -> u64 {
    300
}

fn default_propagation_poll_interval_secs() -> u64 {
    10
}

fn default_challenge_timeout_secs() -> u64 {
    300
}

fn default_order_poll_interval_ms() -> u64 {
    2000
}

/// Agent protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProtocolConfig {
    /// Poll interval handed to newly registered agents (in seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub default_poll_interval_secs: u64,

    /// An agent is offline after this many missed poll intervals
    #[serde(default = "default_offline_after_multiplier")]
    pub offline_after_multiplier: u32,
}

impl AgentProtocolConfig {
    /// Validate the agent protocol configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.default_poll_interval_secs == 0 {
            return Err(crate::Error::config("default_poll_interval_secs must be > 0"));
        }
        if self.offline_after_multiplier == 0 {
            return Err(crate::Error::config("offline_after_multiplier must be > 0"));
        }
        Ok(())
    }
}

impl Default for AgentProtocolConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_secs: default_poll_interval_secs(),
            offline_after_multiplier: default_offline_after_multiplier(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_offline_after_multiplier() -> u32 {
    3
}

/// Certificate download rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per client IP inside one window
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Sliding window length (in seconds)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Interval of the background purge (in seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Entries older than this are purged (in seconds)
    #[serde(default = "default_max_entry_age_secs")]
    pub max_entry_age_secs: u64,
}

impl RateLimitConfig {
    /// Validate the rate limiter configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_requests == 0 {
            return Err(crate::Error::config("max_requests must be > 0"));
        }
        if self.window_secs == 0 {
            return Err(crate::Error::config("window_secs must be > 0"));
        }
        if self.max_entry_age_secs < self.window_secs {
            return Err(crate::Error::config(
                "max_entry_age_secs must be >= window_secs",
            ));
        }
        Ok(())
    }

    /// Sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entry_age_secs: default_max_entry_age_secs(),
        }
    }
}

fn default_max_requests() -> usize {
    10
}

fn default_window_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_max_entry_age_secs() -> u64 {
    2 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: CertsyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.scheduler.renew_before_days, 30);
        assert_eq!(config.scheduler.retry_sweep_interval(), Duration::from_secs(600));
        assert_eq!(config.challenge.propagation_timeout(), Duration::from_secs(300));
        assert_eq!(config.challenge.propagation_poll_interval(), Duration::from_secs(10));
        assert_eq!(config.agent.offline_after_multiplier, 3);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = CertsyncConfig::default();
        config.scheduler.renew_before_days = 0;
        assert!(config.validate().is_err());

        let mut config = CertsyncConfig::default();
        config.rate_limit.max_entry_age_secs = 10;
        assert!(config.validate().is_err());

        let mut config = CertsyncConfig::default();
        config.challenge.propagation_poll_interval_secs = 600;
        assert!(config.validate().is_err());
    }
}
