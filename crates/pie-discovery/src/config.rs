//! Discovery configuration

use pie_core::{ALPHA, Error, Id, K, Protocol, Result};
use std::time::Duration;

/// Default wait for one `FindTrackerRes`
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a tracker connection and identity handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Role used when connecting to trackers
    pub protocol: Protocol,
    /// Trackers queried per lookup round
    pub fanout: usize,
    /// Deadline for each lookup request
    pub request_timeout: Duration,
    /// Deadline for connecting to a tracker
    pub connect_timeout: Duration,
    /// Candidates returned when answering a lookup
    pub response_candidates: usize,
    /// Identifier of the local node, never inserted into its own table
    pub local_id: Option<Id>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tracker,
            fanout: ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_candidates: K,
            local_id: None,
        }
    }
}

impl DiscoveryConfig {
    /// Configuration for a node identified by `local_id`
    #[must_use]
    pub fn with_local_id(mut self, local_id: Id) -> Self {
        self.local_id = Some(local_id);
        self
    }

    /// Check the configuration before use
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero fanout, a zero
    /// candidate count or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.fanout == 0 {
            return Err(Error::InvalidConfig("fanout must be at least 1".to_string()));
        }
        if self.response_candidates == 0 {
            return Err(Error::InvalidConfig(
                "response_candidates must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}
