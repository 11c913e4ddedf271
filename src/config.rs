//! Configuration surface (§6.6): documented defaults and bounds, clamped
//! by [`Config::validate`] the way the teacher's builders apply defaults
//! for unset fields.

use std::time::Duration;

/// Tunables for one registry's worth of device sessions. Values outside
/// their documented bound are clamped by [`Config::validate`] rather than
/// rejected, matching the teacher's builder-default behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// SOAP request timeout, 8000-60000 ms.
    pub communication_timeout_ms: u64,
    /// Polling-timer interval, 0-1_200_000 ms.
    pub device_polling_interval_ms: u64,
    /// Command-queue worker interval, 0-60_000 ms.
    pub queue_processing_interval_ms: u64,
    /// Photo slideshow dwell time, seconds.
    pub photo_transitional_timeout_secs: u64,
    /// Maximum percentage-of-duration remaining still counted as "played
    /// to completion" for auto-advance purposes.
    pub max_resume_pct: f64,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// `FriendlyName.dlna.org` header and GENA friendly name.
    pub friendly_name: String,
}

const MIN_COMMUNICATION_TIMEOUT_MS: u64 = 8_000;
const MAX_COMMUNICATION_TIMEOUT_MS: u64 = 60_000;
const MAX_DEVICE_POLLING_INTERVAL_MS: u64 = 1_200_000;
const MAX_QUEUE_PROCESSING_INTERVAL_MS: u64 = 60_000;

impl Default for Config {
    fn default() -> Self {
        Self {
            communication_timeout_ms: MIN_COMMUNICATION_TIMEOUT_MS,
            device_polling_interval_ms: 30_000,
            queue_processing_interval_ms: 1_000,
            photo_transitional_timeout_secs: 5,
            max_resume_pct: 2.0,
            user_agent: "dlna-session-engine".to_string(),
            friendly_name: "Media Server".to_string(),
        }
    }
}

impl Config {
    pub fn communication_timeout(&self) -> Duration {
        Duration::from_millis(self.communication_timeout_ms)
    }

    pub fn device_polling_interval(&self) -> Duration {
        Duration::from_millis(self.device_polling_interval_ms)
    }

    pub fn queue_processing_interval(&self) -> Duration {
        Duration::from_millis(self.queue_processing_interval_ms)
    }

    pub fn photo_transitional_timeout(&self) -> Duration {
        Duration::from_secs(self.photo_transitional_timeout_secs)
    }

    /// Clamps out-of-range values to their documented bound in place.
    pub fn validate(&mut self) {
        self.communication_timeout_ms = self
            .communication_timeout_ms
            .clamp(MIN_COMMUNICATION_TIMEOUT_MS, MAX_COMMUNICATION_TIMEOUT_MS);
        self.device_polling_interval_ms = self
            .device_polling_interval_ms
            .min(MAX_DEVICE_POLLING_INTERVAL_MS);
        self.queue_processing_interval_ms = self
            .queue_processing_interval_ms
            .min(MAX_QUEUE_PROCESSING_INTERVAL_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_already_valid() {
        let mut config = Config::default();
        let before = config.clone();
        config.validate();
        assert_eq!(before, config);
    }

    #[test]
    fn test_validate_clamps_out_of_range_values() {
        let mut config = Config {
            communication_timeout_ms: 1,
            device_polling_interval_ms: u64::MAX,
            queue_processing_interval_ms: u64::MAX,
            ..Config::default()
        };

        config.validate();

        assert_eq!(MIN_COMMUNICATION_TIMEOUT_MS, config.communication_timeout_ms);
        assert_eq!(MAX_DEVICE_POLLING_INTERVAL_MS, config.device_polling_interval_ms);
        assert_eq!(MAX_QUEUE_PROCESSING_INTERVAL_MS, config.queue_processing_interval_ms);
    }
}
