//! State shared by the orchestrators

#[cfg(feature = "balancer")]
use crate::balancer::Balancer;
#[cfg(feature = "balancer")]
use crate::config::BalancerUsage;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::groups::GroupSelector;
use crate::key::{GroupId, Key};
use crate::lookup::AddressFormatter;
use crate::policy::SuccessCopies;
use crate::transport::{StorageNode, StorageSession};
use std::sync::Arc;

/// Read-only after construction.
pub(crate) struct Context {
    pub(crate) config: ProxyConfig,
    pub(crate) node: Arc<dyn StorageNode>,
    pub(crate) selector: GroupSelector,
    pub(crate) formatter: AddressFormatter,
    pub(crate) replication_count: usize,
    pub(crate) success_copies: SuccessCopies,
    #[cfg(feature = "balancer")]
    pub(crate) balancer: Option<Balancer>,
}

impl Context {
    pub(crate) fn new(config: ProxyConfig, node: Arc<dyn StorageNode>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            selector: GroupSelector::new(config.groups.clone()),
            formatter: AddressFormatter::new(
                config.base_port,
                config.directory_bit_num,
                config.eblob_style_path,
            ),
            replication_count: config.effective_replication_count(),
            success_copies: config.effective_success_copies(),
            config,
            node,
            #[cfg(feature = "balancer")]
            balancer: None,
        })
    }

    pub(crate) fn session(&self) -> Box<dyn StorageSession> {
        self.node.session()
    }

    pub(crate) fn check_liveness(
        &self,
        session: &dyn StorageSession,
        operation: &'static str,
    ) -> Result<()> {
        let live = session.state_num();
        if live < self.config.die_limit {
            return Err(Error::InsufficientEndpoints {
                operation,
                live,
                required: self.config.die_limit,
            });
        }
        Ok(())
    }

    /// Caller's group count, or the configured default when none were given.
    pub(crate) fn replication_target(&self, explicit: &[GroupId]) -> usize {
        if explicit.is_empty() {
            self.replication_count
        } else {
            explicit.len()
        }
    }

    pub(crate) fn success_copies(&self, requested: Option<SuccessCopies>) -> SuccessCopies {
        requested.unwrap_or(self.success_copies)
    }

    /// Candidate groups for a write: selector, then balancer, then
    /// truncation to the replication target.
    pub(crate) fn write_groups(
        &self,
        key: &Key,
        explicit: &[GroupId],
        target: usize,
        size: u64,
    ) -> Result<Vec<GroupId>> {
        #[allow(unused_mut)]
        let mut groups = self.selector.resolve(key, explicit, 0)?;

        #[cfg(feature = "balancer")]
        if let Some(balancer) = &self.balancer {
            let usage = balancer.usage();
            if usage >= BalancerUsage::Optional
                && (explicit.len() != target || usage == BalancerUsage::Mandatory)
            {
                match balancer.groups(target, size, key) {
                    Ok(chosen) => groups = chosen,
                    Err(e) => {
                        tracing::error!("balancer failed for key {}: {}", key, e);
                        if usage >= BalancerUsage::Normal {
                            return Err(Error::balancer(format!(
                                "Balancer does not respond for key {}: {}",
                                key, e
                            )));
                        }
                    }
                }
            }
        }
        #[cfg(not(feature = "balancer"))]
        let _ = size;

        if target != 0 && target < groups.len() {
            groups.truncate(target);
        }
        Ok(groups)
    }
}

/// Best-effort delete of `key` from the session's current groups. Failures
/// are logged and swallowed.
pub(crate) fn remove_quietly(session: &mut dyn StorageSession, key: &Key, operation: &str) {
    let groups = session.groups();
    match session.remove(key).wait() {
        Ok(acks) => {
            let failed: Vec<GroupId> = acks
                .iter()
                .filter(|a| a.status < 0)
                .map(|a| a.group)
                .collect();
            if failed.is_empty() {
                tracing::debug!("{}: removed {} from groups {:?}", operation, key, groups);
            } else {
                tracing::warn!(
                    "{}: cleanup of {} failed in groups {:?}",
                    operation,
                    key,
                    failed
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                "{}: cleanup of {} in groups {:?} failed: {}",
                operation,
                key,
                groups,
                e
            );
        }
    }
}
