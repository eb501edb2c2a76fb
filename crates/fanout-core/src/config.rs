//! Proxy configuration

use crate::error::{Error, Result};
use crate::key::GroupId;
use crate::lookup::Remote;
use crate::policy::SuccessCopies;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How much the proxy relies on the balancer when choosing write groups
///
/// Ordered: each level includes the previous one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BalancerUsage {
    /// Never consult the balancer
    #[default]
    None,
    /// Consult when the caller under-specifies groups; ignore failures
    Optional,
    /// Consult when the caller under-specifies groups; failures fail the write
    Normal,
    /// Always consult; failures fail the write
    Mandatory,
}

/// Balancer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Usage level
    pub usage: BalancerUsage,
    /// Seconds between weight refreshes
    pub refresh_period_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            usage: BalancerUsage::None,
            refresh_period_secs: 60,
        }
    }
}

impl BalancerConfig {
    /// Refresh period as a duration
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_secs)
    }
}

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Storage endpoints the transport connects to
    pub remotes: Vec<Remote>,

    /// Default groups; the first one is pinned as preferred
    pub groups: Vec<GroupId>,

    /// Base port used to derive download paths
    pub base_port: u16,

    /// Bits of the id used as directory in non-eblob paths
    pub directory_bit_num: u32,

    /// Default success-copies mode
    pub success_copies: Option<SuccessCopies>,

    /// Minimum live endpoints for writes, exec and ping
    pub die_limit: usize,

    /// Default replication target; 0 means "all default groups"
    pub replication_count: usize,

    /// Payloads above this size are uploaded in chunks; 0 disables chunking
    pub chunk_size: usize,

    /// Produce eblob style download paths
    pub eblob_style_path: bool,

    /// Transport wait timeout in seconds
    ///
    /// Not used by the proxy itself. Whoever builds the [`StorageNode`]
    /// reads it through [`ProxyConfig::wait_timeout`].
    ///
    /// [`StorageNode`]: crate::transport::StorageNode
    pub wait_timeout_secs: u64,

    /// Transport check timeout in seconds, handed to node construction
    /// like `wait_timeout_secs`
    pub check_timeout_secs: u64,

    /// Transport node flags, handed to node construction as is
    pub flags: u64,

    /// Balancer settings
    pub balancer: BalancerConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            remotes: Vec::new(),
            groups: Vec::new(),
            base_port: 1024,
            directory_bit_num: 32,
            success_copies: None,
            die_limit: 1,
            replication_count: 0,
            chunk_size: 0,
            eblob_style_path: true,
            wait_timeout_secs: 5,
            check_timeout_secs: 20,
            flags: 0,
            balancer: BalancerConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::configuration(format!("bad config: {}", e)))
    }

    /// Set remotes
    pub fn with_remotes(mut self, remotes: Vec<Remote>) -> Self {
        self.remotes = remotes;
        self
    }

    /// Set default groups
    pub fn with_groups(mut self, groups: Vec<GroupId>) -> Self {
        self.groups = groups;
        self
    }

    /// Set default success-copies mode
    pub fn with_success_copies(mut self, mode: SuccessCopies) -> Self {
        self.success_copies = Some(mode);
        self
    }

    /// Set default replication target
    pub fn with_replication_count(mut self, count: usize) -> Self {
        self.replication_count = count;
        self
    }

    /// Set chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set die limit
    pub fn with_die_limit(mut self, die_limit: usize) -> Self {
        self.die_limit = die_limit;
        self
    }

    /// Set balancer usage
    pub fn with_balancer_usage(mut self, usage: BalancerUsage) -> Self {
        self.balancer.usage = usage;
        self
    }

    /// Wait timeout as a duration, for transport construction
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Check timeout as a duration, for transport construction
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    /// Replication target with the zero default applied
    pub fn effective_replication_count(&self) -> usize {
        if self.replication_count == 0 {
            self.groups.len()
        } else {
            self.replication_count
        }
    }

    /// Success-copies mode with the default applied
    pub fn effective_success_copies(&self) -> SuccessCopies {
        self.success_copies.unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.remotes.is_empty() {
            return Err(Error::configuration("Remotes can't be empty"));
        }
        if self.directory_bit_num > 32 {
            return Err(Error::configuration(format!(
                "directory_bit_num must be at most 32, got {}",
                self.directory_bit_num
            )));
        }
        if let Some(SuccessCopies::Explicit(0)) = self.success_copies {
            return Err(Error::configuration("explicit success copies must be positive"));
        }
        if self.balancer.usage != BalancerUsage::None && self.balancer.refresh_period_secs == 0 {
            return Err(Error::configuration(
                "balancer refresh period must be at least one second",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ProxyConfig {
        ProxyConfig::default()
            .with_remotes(vec![Remote::new("localhost", 1025)])
            .with_groups(vec![1, 2, 3])
    }

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.balancer.usage, BalancerUsage::None);
        assert_eq!(config.effective_success_copies(), SuccessCopies::Quorum);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replication_count_defaults_to_groups() {
        let config = valid();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_replication_count(), 3);
        assert_eq!(config.with_replication_count(2).effective_replication_count(), 2);
    }

    #[test]
    fn test_empty_remotes_rejected() {
        let config = valid().with_remotes(vec![]);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_usage_order() {
        assert!(BalancerUsage::None < BalancerUsage::Optional);
        assert!(BalancerUsage::Optional < BalancerUsage::Normal);
        assert!(BalancerUsage::Normal < BalancerUsage::Mandatory);
    }

    #[test]
    fn test_from_json() {
        let config = ProxyConfig::from_json(
            r#"{
                "remotes": [{"host": "10.0.0.1", "port": 1025}],
                "groups": [1, 2],
                "success_copies": "all",
                "chunk_size": 1024,
                "balancer": {"usage": "optional"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.remotes[0].family, crate::lookup::AF_INET);
        assert_eq!(config.success_copies, Some(SuccessCopies::All));
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.balancer.usage, BalancerUsage::Optional);
        assert_eq!(config.balancer.refresh_period_secs, 60);
        assert!(config.validate().is_ok());

        assert!(ProxyConfig::from_json("{\"groups\": \"x\"}").is_err());
    }

    #[test]
    fn test_transport_settings() {
        let config = ProxyConfig::default();
        assert_eq!(config.wait_timeout(), Duration::from_secs(5));
        assert_eq!(config.check_timeout(), Duration::from_secs(20));

        let config =
            ProxyConfig::from_json(r#"{"wait_timeout_secs": 2, "check_timeout_secs": 9, "flags": 4}"#)
                .unwrap();
        assert_eq!(config.wait_timeout(), Duration::from_secs(2));
        assert_eq!(config.check_timeout(), Duration::from_secs(9));
        assert_eq!(config.flags, 4);
    }
}
