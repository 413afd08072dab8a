//! Replication configuration

use crate::error::{Result, SyncError};
use gsync_action::ClientId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest packet size that still fits a fragment header
pub const MIN_PACKET_SIZE: usize = 256;

/// Dispatcher and transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Id the server stamps into rejects
    pub server_id: ClientId,
    /// Encoded messages longer than this are fragmented (bytes)
    pub max_packet_size: usize,
    /// Period of gap-request retries while commits are missing
    pub gap_retry_interval_ms: u64,
    /// Period of the server's head announcement
    pub head_interval_ms: u64,
    /// Most sequence numbers named in one gap request
    pub max_gap_request: usize,
    /// Ledger op ids remembered for dedup
    pub ledger_dedup_window: usize,
    /// Decided action ids the server remembers for duplicate submissions
    pub decided_window: usize,
    /// Ship the ledger snapshot with join replay
    pub ledger_in_welcome: bool,
    /// Rejoin immediately after the replica is discarded
    pub auto_resync: bool,
}

impl SyncConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML; missing keys take defaults
    ///
    /// # Errors
    /// `SyncError::Config` on parse failure or invalid values
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `SyncError::Config` naming the offending key
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(SyncError::Config(format!(
                "max_packet_size must be at least {MIN_PACKET_SIZE}"
            )));
        }
        if self.max_gap_request == 0 {
            return Err(SyncError::Config("max_gap_request must be positive".into()));
        }
        if self.gap_retry_interval_ms == 0 {
            return Err(SyncError::Config(
                "gap_retry_interval_ms must be positive".into(),
            ));
        }
        if self.head_interval_ms == 0 {
            return Err(SyncError::Config("head_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Gap retry period
    #[inline]
    #[must_use]
    pub fn gap_retry_interval(&self) -> Duration {
        Duration::from_millis(self.gap_retry_interval_ms)
    }

    /// Head announcement period
    #[inline]
    #[must_use]
    pub fn head_interval(&self) -> Duration {
        Duration::from_millis(self.head_interval_ms)
    }

    /// With max packet size
    #[inline]
    #[must_use]
    pub fn with_max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }

    /// With gap retry interval
    #[inline]
    #[must_use]
    pub fn with_gap_retry_interval(mut self, interval: Duration) -> Self {
        self.gap_retry_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With head announcement interval
    #[inline]
    #[must_use]
    pub fn with_head_interval(mut self, interval: Duration) -> Self {
        self.head_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With ledger dedup window
    #[inline]
    #[must_use]
    pub fn with_ledger_dedup_window(mut self, window: usize) -> Self {
        self.ledger_dedup_window = window;
        self
    }

    /// With automatic rejoin after a discarded replica
    #[inline]
    #[must_use]
    pub fn with_auto_resync(mut self, enabled: bool) -> Self {
        self.auto_resync = enabled;
        self
    }

    /// With ledger snapshot in join replay
    #[inline]
    #[must_use]
    pub fn with_ledger_in_welcome(mut self, enabled: bool) -> Self {
        self.ledger_in_welcome = enabled;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_id: ClientId::SERVER,
            max_packet_size: 32_000,
            gap_retry_interval_ms: 500,
            head_interval_ms: 1_000,
            max_gap_request: 256,
            ledger_dedup_window: gsync_history::DEFAULT_DEDUP_WINDOW,
            decided_window: 65_536,
            ledger_in_welcome: true,
            auto_resync: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_packet_size, 32_000);
        assert_eq!(config.gap_retry_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str("max_packet_size = 4096\n").unwrap();
        assert_eq!(
            config,
            SyncConfig::default().with_max_packet_size(4096)
        );
    }

    #[test]
    fn tiny_packet_size_rejected() {
        let err = SyncConfig::from_toml_str("max_packet_size = 10\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn zero_intervals_rejected() {
        assert!(SyncConfig::from_toml_str("head_interval_ms = 0\n").is_err());
        assert!(SyncConfig::from_toml_str("gap_retry_interval_ms = 0\n").is_err());
    }

    #[test]
    fn garbage_toml_rejected() {
        assert!(SyncConfig::from_toml_str("max_packet_size = \"big\"").is_err());
    }
}
