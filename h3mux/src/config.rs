//! Session configuration and tunable parameters.

use std::time::Duration;

/// Configuration for session behavior.
///
/// Default values match the reference deployment; adjust per embedding.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on any single wait for transport readability inside
    /// [`crate::Session::run`] and [`crate::SingleStreamSession::read_data`]
    /// (default: 30 seconds).
    ///
    /// An elapsed timeout is reported as connection failure; the transport's
    /// own internal timers firing earlier is not.
    pub io_timeout: Duration,

    /// Maximum number of send vectors requested from the engine per
    /// `writev_stream` call (default: 8).
    pub egress_batch: usize,

    /// Size of the per-stream scratch buffer for transport reads
    /// (default: 4 KB).
    pub ingest_buffer_size: usize,

    /// Chunk size for the copying body-provider path (default: 16 KB).
    ///
    /// Only used when a provider has no persistent storage; chunks of this
    /// size are retained until acknowledged and then recycled.
    pub body_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            egress_batch: 8,
            ingest_buffer_size: 4096,
            body_chunk_size: 16 * 1024,
        }
    }
}

impl SessionConfig {
    /// Validate configuration values are within reasonable bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.io_timeout.is_zero() {
            return Err("io_timeout must be non-zero".into());
        }
        if self.egress_batch == 0 {
            return Err("egress_batch must be non-zero".into());
        }
        if self.ingest_buffer_size == 0 {
            return Err("ingest_buffer_size must be non-zero".into());
        }
        if self.body_chunk_size == 0 {
            return Err("body_chunk_size must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = SessionConfig::default();
        config.io_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut config = SessionConfig::default();
        config.egress_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_buffer_sizes_rejected() {
        let mut config = SessionConfig::default();
        config.ingest_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.body_chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
