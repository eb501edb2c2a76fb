//! Balancer integration
//!
//! The balancer is an external service reporting how loaded every couple of
//! groups is. The proxy keeps the latest weights in a [`GroupWeightCache`],
//! refreshed by a [`WeightRefresher`] thread, and asks it for write groups
//! according to [`BalancerUsage`].

pub mod cache;

pub use cache::{GroupWeightCache, GroupWeightSnapshot, WeightRefresher};
pub use fanout_protocol::{GroupInfoResponse as GroupInfo, GroupStatus};

use crate::config::{BalancerConfig, BalancerUsage};
use crate::error::Result;
use crate::key::{GroupId, Key};
use fanout_protocol::{MastermindClient, RpcChannel};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Source of group weights and group metadata
pub trait GroupWeightService: Send + Sync {
    /// Current weights
    fn fetch_weights(&self) -> Result<GroupWeightSnapshot>;
    /// Status and couples of one group
    fn fetch_group_info(&self, group: GroupId) -> Result<GroupInfo>;
    /// Couples of groups that replicate each other
    fn symmetric_groups(&self) -> Result<Vec<Vec<GroupId>>>;
    /// Bad groups with their couples
    fn bad_groups(&self) -> Result<BTreeMap<GroupId, Vec<GroupId>>>;
}

impl<C: RpcChannel> GroupWeightService for MastermindClient<C> {
    fn fetch_weights(&self) -> Result<GroupWeightSnapshot> {
        Ok(self.group_weights()?.into())
    }

    fn fetch_group_info(&self, group: GroupId) -> Result<GroupInfo> {
        Ok(self.group_info(group)?)
    }

    fn symmetric_groups(&self) -> Result<Vec<Vec<GroupId>>> {
        Ok(MastermindClient::symmetric_groups(self)?)
    }

    fn bad_groups(&self) -> Result<BTreeMap<GroupId, Vec<GroupId>>> {
        Ok(MastermindClient::bad_groups(self)?)
    }
}

/// Weighted group choice for writes
pub struct Balancer {
    usage: BalancerUsage,
    service: Arc<dyn GroupWeightService>,
    cache: Arc<GroupWeightCache>,
    refresher: Option<WeightRefresher>,
}

impl Balancer {
    /// Create the cache and start the refresher
    pub fn start(config: &BalancerConfig, service: Arc<dyn GroupWeightService>) -> Result<Self> {
        let cache = Arc::new(GroupWeightCache::new(service.clone()));
        let refresher = WeightRefresher::spawn(cache.clone(), config.refresh_period())?;
        Ok(Self {
            usage: config.usage,
            service,
            cache,
            refresher: Some(refresher),
        })
    }

    /// Usage level
    pub fn usage(&self) -> BalancerUsage {
        self.usage
    }

    /// Weight cache
    pub fn cache(&self) -> &GroupWeightCache {
        &self.cache
    }

    /// Choose `count` groups; fetches weights first if none were ever fetched
    pub fn groups(&self, count: usize, size: u64, key: &Key) -> Result<Vec<GroupId>> {
        if !self.cache.is_ready() {
            self.cache.refresh().inspect_err(|e| {
                tracing::error!("can not fetch group weights for key {}: {}", key, e);
            })?;
        }
        let chosen = self.cache.choose(count)?;
        tracing::info!("Chosen group: {:?} for key {} ({} bytes)", chosen, key, size);
        Ok(chosen)
    }

    /// Status and couples of `group`
    pub fn group_info(&self, group: GroupId) -> Result<GroupInfo> {
        self.service
            .fetch_group_info(group)
            .inspect_err(|e| tracing::error!("can not get info for group {}: {}", group, e))
    }

    /// Couples of symmetric groups
    pub fn symmetric_groups(&self) -> Result<Vec<Vec<GroupId>>> {
        self.service.symmetric_groups()
    }

    /// Bad groups with their couples
    pub fn bad_groups(&self) -> Result<BTreeMap<GroupId, Vec<GroupId>>> {
        self.service.bad_groups()
    }

    /// Every group known to the balancer, sorted
    pub fn all_groups(&self) -> Result<Vec<GroupId>> {
        let mut groups: Vec<GroupId> = self.symmetric_groups()?.into_iter().flatten().collect();
        for (group, couple) in self.bad_groups()? {
            groups.push(group);
            groups.extend(couple);
        }
        groups.sort_unstable();
        groups.dedup();
        Ok(groups)
    }

    /// Stop the refresher thread
    pub fn shutdown(&mut self) {
        if let Some(mut refresher) = self.refresher.take() {
            refresher.shutdown();
        }
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
