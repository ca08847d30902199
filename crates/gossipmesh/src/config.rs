//! Membership configuration settings.

use crate::error::{MembershipError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a single cluster member.
///
/// The defaults are tuned for LAN deployments; integration tests shrink the
/// intervals to the millisecond range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Unique name of this node in the cluster
    pub name: String,

    /// Address to bind the UDP and TCP listeners to; port 0 picks an
    /// ephemeral port, which is also used as the advertised address
    pub bind_addr: SocketAddr,

    /// Cadence of the failure-detector tick; one peer is probed per tick,
    /// and this is also the outer deadline of a single probe
    pub probe_interval: Duration,

    /// How long to wait for a direct ack before falling through to
    /// indirect probing; must be shorter than `probe_interval`
    pub probe_timeout: Duration,

    /// Number of random peers asked to ping the target indirectly
    pub indirect_checks: usize,

    /// Cadence of the gossip tick; zero disables gossip
    pub gossip_interval: Duration,

    /// Number of random peers each gossip tick fans out to
    pub gossip_nodes: usize,

    /// Cadence of the full push/pull state exchange; zero disables it
    pub push_pull_interval: Duration,

    /// Multiplier applied to `log10(cluster size)` probe intervals to
    /// obtain the suspicion timeout
    pub suspicion_mult: u32,

    /// Multiplier applied to `log10(cluster size)` to obtain how many
    /// times a queued broadcast is retransmitted before retiring
    pub retransmit_mult: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            name: "gossipmesh".to_string(),
            bind_addr: "127.0.0.1:7946".parse().unwrap(),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            suspicion_mult: 5,
            retransmit_mult: 4,
        }
    }
}

impl MembershipConfig {
    /// Create a configuration for the given node name and bind address,
    /// keeping the default protocol timings.
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            ..Self::default()
        }
    }

    /// Validate the configuration before it is used to create a member.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MembershipError::InvalidConfiguration(
                "node name must not be empty".to_string(),
            ));
        }
        if self.probe_interval.is_zero() {
            return Err(MembershipError::InvalidConfiguration(
                "probe_interval must be positive".to_string(),
            ));
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(MembershipError::InvalidConfiguration(
                "probe_timeout must be shorter than probe_interval".to_string(),
            ));
        }
        if self.suspicion_mult == 0 || self.retransmit_mult == 0 {
            return Err(MembershipError::InvalidConfiguration(
                "suspicion_mult and retransmit_mult must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MembershipConfig::default().validate().is_ok());
    }

    #[test]
    fn test_probe_timeout_must_fit_in_interval() {
        let mut config = MembershipConfig::new("node-a", "127.0.0.1:0".parse().unwrap());
        config.probe_timeout = config.probe_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = MembershipConfig::new("", "127.0.0.1:0".parse().unwrap());
        assert!(config.validate().is_err());
    }
}
