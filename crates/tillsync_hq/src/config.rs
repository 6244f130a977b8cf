//! HQ handler configuration.

use std::time::Duration;

/// Configuration for the HQ request handler.
#[derive(Debug, Clone)]
pub struct HqConfig {
    /// Largest upload batch accepted, in records.
    pub max_upload_records: usize,
    /// How long a download batch may wait for its ack before it is failed
    /// and its items retried.
    pub ack_timeout: Duration,
}

impl HqConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_upload_records: 1_000,
            ack_timeout: Duration::from_secs(120),
        }
    }

    /// Sets the upload size limit.
    pub fn with_max_upload_records(mut self, max: usize) -> Self {
        self.max_upload_records = max;
        self
    }

    /// Sets the download ack timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

impl Default for HqConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = HqConfig::default();
        assert_eq!(config.max_upload_records, 1_000);
        assert_eq!(config.ack_timeout, Duration::from_secs(120));
    }

    #[test]
    fn config_builder() {
        let config = HqConfig::new()
            .with_max_upload_records(50)
            .with_ack_timeout(Duration::from_secs(5));

        assert_eq!(config.max_upload_records, 50);
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
    }
}
