//! Proxy facade
//!
//! [`Proxy`] is the single entry point. It owns the validated configuration,
//! the storage node and, with the `balancer` feature, the group balancer;
//! every call opens its own transport session.
//!
//! # Blocking
//!
//! Methods without an `_async` suffix block on [`Pending::wait`]. From
//! async code call them on a multi-threaded tokio runtime or from
//! `spawn_blocking`; on a current-thread runtime an unfinished transport
//! call fails with [`TransportError::WOULD_BLOCK`] instead of stalling the
//! runtime. The `_async` variants return handles that can be awaited.
//!
//! [`TransportError::WOULD_BLOCK`]: crate::transport::TransportError::WOULD_BLOCK
//!
//! # Example
//!
//! ```no_run
//! use fanout_core::testing::MemoryCluster;
//! use fanout_core::{DataContainer, Key, Proxy, ProxyConfig, Remote, WriteOptions};
//! use std::sync::Arc;
//!
//! let cluster = Arc::new(MemoryCluster::new(&[1, 2, 3]));
//! let config = ProxyConfig::default()
//!     .with_remotes(vec![Remote::new("localhost", 1025)])
//!     .with_groups(vec![1, 2, 3]);
//! let proxy = Proxy::new(config, cluster).unwrap();
//!
//! let key = Key::remote("photo.jpg");
//! let written = proxy
//!     .write(&key, &DataContainer::from("bytes"), &WriteOptions::default())
//!     .unwrap();
//! assert_eq!(written.len(), 3);
//! ```

#[cfg(feature = "balancer")]
use crate::balancer::{Balancer, GroupInfo, GroupWeightService};
use crate::bulk::BulkOrchestrator;
use crate::config::{BalancerUsage, ProxyConfig};
use crate::container::DataContainer;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::key::{GroupId, Key, RawId};
use crate::lookup::{LookupResult, Remote};
use crate::policy::SuccessCopies;
use crate::read::{
    AsyncReadResult, AsyncRemoveResult, RangeOptions, RangeOutcome, ReadOptions, ReadOrchestrator,
};
use crate::status::StatusResult;
use crate::transport::{FindIndexesEntry, IndexEntry, Pending, RemoveAck, StorageNode};
use crate::write::{AsyncWriteResult, WriteOptions, WriteOrchestrator};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Replication-aware proxy over a group-replicated store
pub struct Proxy {
    ctx: Context,
}

impl Proxy {
    /// Create a proxy without a balancer
    ///
    /// Fails with a configuration error when the config asks for a balancer.
    pub fn new(config: ProxyConfig, node: Arc<dyn StorageNode>) -> Result<Self> {
        if config.balancer.usage != BalancerUsage::None {
            return Err(Error::configuration(
                "balancer usage is set but no group weight service was given",
            ));
        }
        let ctx = Context::new(config, node)?;
        tracing::info!(
            "proxy started: groups {:?}, replication count {}, success copies {:?}",
            ctx.config.groups,
            ctx.replication_count,
            ctx.success_copies
        );
        Ok(Self { ctx })
    }

    /// Create a proxy consulting `service` for write groups
    ///
    /// Starts the weight refresher thread when usage is not `None`.
    #[cfg(feature = "balancer")]
    pub fn with_balancer(
        config: ProxyConfig,
        node: Arc<dyn StorageNode>,
        service: Arc<dyn GroupWeightService>,
    ) -> Result<Self> {
        let mut ctx = Context::new(config, node)?;
        if ctx.config.balancer.usage != BalancerUsage::None {
            ctx.balancer = Some(Balancer::start(&ctx.config.balancer, service)?);
        }
        tracing::info!(
            "proxy started: groups {:?}, balancer usage {:?}",
            ctx.config.groups,
            ctx.config.balancer.usage
        );
        Ok(Self { ctx })
    }

    /// Validated configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.ctx.config
    }

    /// Candidate groups for `key`
    pub fn get_groups(&self, key: &Key, groups: &[GroupId]) -> Result<Vec<GroupId>> {
        self.ctx.selector.resolve(key, groups, 0)
    }

    /// Download info from the first group holding `key`
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn lookup(&self, key: &Key, groups: &[GroupId]) -> Result<LookupResult> {
        ReadOrchestrator::new(&self.ctx).lookup(key, groups)
    }

    /// Read `key`
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn read(&self, key: &Key, opts: &ReadOptions) -> Result<DataContainer> {
        ReadOrchestrator::new(&self.ctx).read(key, opts)
    }

    /// Dispatch a read and return its handle
    pub fn read_async(&self, key: &Key, opts: &ReadOptions) -> Result<AsyncReadResult> {
        ReadOrchestrator::new(&self.ctx).read_async(key, opts)
    }

    /// Replicated write
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn write(
        &self,
        key: &Key,
        data: &DataContainer,
        opts: &WriteOptions,
    ) -> Result<Vec<LookupResult>> {
        WriteOrchestrator::new(&self.ctx).write(key, data, opts)
    }

    /// Dispatch a single-call write and return its handle
    pub fn write_async(
        &self,
        key: &Key,
        data: &DataContainer,
        opts: &WriteOptions,
    ) -> Result<AsyncWriteResult> {
        WriteOrchestrator::new(&self.ctx).write_async(key, data, opts)
    }

    /// Remove `key` from its candidate groups
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn remove(&self, key: &Key, groups: &[GroupId]) -> Result<Vec<RemoveAck>> {
        ReadOrchestrator::new(&self.ctx).remove(key, groups)
    }

    /// Dispatch a remove and return its handle
    pub fn remove_async(&self, key: &Key, groups: &[GroupId]) -> Result<AsyncRemoveResult> {
        ReadOrchestrator::new(&self.ctx).remove_async(key, groups)
    }

    /// Range scan between `from` and `to`; `key` selects groups
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn range_get(
        &self,
        from: &Key,
        to: &Key,
        opts: &RangeOptions,
        key: &Key,
    ) -> Result<RangeOutcome> {
        ReadOrchestrator::new(&self.ctx).range_get(from, to, opts, key)
    }

    /// Batched read
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn bulk_read(
        &self,
        keys: &[Key],
        cflags: u64,
        groups: &[GroupId],
    ) -> Result<BTreeMap<Key, DataContainer>> {
        BulkOrchestrator::new(&self.ctx).bulk_read(keys, cflags, groups)
    }

    /// All-or-nothing batched write
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn bulk_write(
        &self,
        keys: &[Key],
        data: &[DataContainer],
        cflags: u64,
        groups: &[GroupId],
        success_copies: Option<SuccessCopies>,
    ) -> Result<BTreeMap<Key, Vec<LookupResult>>> {
        BulkOrchestrator::new(&self.ctx).bulk_write(keys, data, cflags, groups, success_copies)
    }

    /// Node address of `key` per candidate group
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn lookup_addr(&self, key: &Key, groups: &[GroupId]) -> Result<Vec<Remote>> {
        ReadOrchestrator::new(&self.ctx).lookup_addr(key, groups)
    }

    /// Run `script` under the lock of `key`
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn exec_script(
        &self,
        key: &Key,
        data: Bytes,
        script: &str,
        groups: &[GroupId],
    ) -> Result<Bytes> {
        let mut session = self.ctx.session();
        self.ctx.check_liveness(session.as_ref(), "exec_script")?;

        let id = key.resolve_id(session.as_ref());
        let groups = self.ctx.selector.resolve(key, groups, 0)?;
        session.set_groups(&groups);
        session.exec_locked(&id, script, data).wait().map_err(|e| {
            tracing::error!("can not execute script {}: {}", script, e);
            Error::transport("exec_script", key, e)
        })
    }

    /// True if enough endpoints are reachable
    pub fn ping(&self) -> bool {
        self.ctx.session().state_num() >= self.ctx.config.die_limit
    }

    /// Per-node statistics
    ///
    /// Blocks on the transport, see [blocking](crate::proxy#blocking).
    pub fn stat_log(&self) -> Result<Vec<StatusResult>> {
        let mut session = self.ctx.session();
        let stats = session
            .stat_log()
            .wait()
            .map_err(|e| Error::transport("stat_log", "*", e))?;
        Ok(stats.iter().map(StatusResult::from).collect())
    }

    /// Hex form of the raw identifier of `key`
    pub fn id_str(&self, key: &Key) -> String {
        key.resolve_id(self.ctx.session().as_ref()).to_hex()
    }

    /// Put `key` into the named indexes with per-index data
    pub fn update_indexes_async(
        &self,
        key: &Key,
        indexes: &[String],
        data: Vec<Bytes>,
    ) -> Result<Pending<()>> {
        if indexes.len() != data.len() {
            return Err(Error::ArityMismatch {
                operation: "update_indexes",
                keys: indexes.len(),
                data: data.len(),
            });
        }
        let mut session = self.ctx.session();
        let entries = indexes
            .iter()
            .zip(data)
            .map(|(name, data)| IndexEntry {
                index: session.transform(name),
                data,
            })
            .collect();
        Ok(session.update_indexes(key, entries))
    }

    /// Objects present in every named index
    pub fn find_indexes_async(&self, indexes: &[String]) -> Pending<Vec<FindIndexesEntry>> {
        let mut session = self.ctx.session();
        let ids = indexes.iter().map(|name| session.transform(name)).collect();
        session.find_indexes(ids)
    }

    /// Objects present in every index, by raw id
    pub fn find_indexes_by_id_async(&self, indexes: Vec<RawId>) -> Pending<Vec<FindIndexesEntry>> {
        self.ctx.session().find_indexes(indexes)
    }

    /// Indexes `key` belongs to
    pub fn check_indexes_async(&self, key: &Key) -> Pending<Vec<IndexEntry>> {
        self.ctx.session().check_indexes(key)
    }

    #[cfg(feature = "balancer")]
    fn balancer(&self) -> Result<&Balancer> {
        self.ctx
            .balancer
            .as_ref()
            .ok_or_else(|| Error::balancer("balancer is not configured"))
    }

    /// Weighted choice of `count` groups
    #[cfg(feature = "balancer")]
    pub fn balancer_groups(&self, count: usize, size: u64, key: &Key) -> Result<Vec<GroupId>> {
        self.balancer()?.groups(count, size, key)
    }

    /// Status and couples of `group`
    #[cfg(feature = "balancer")]
    pub fn balancer_group_info(&self, group: GroupId) -> Result<GroupInfo> {
        self.balancer()?.group_info(group)
    }

    /// Couples of symmetric groups
    #[cfg(feature = "balancer")]
    pub fn symmetric_groups(&self) -> Result<Vec<Vec<GroupId>>> {
        self.balancer()?.symmetric_groups()
    }

    /// Bad groups with their couples
    #[cfg(feature = "balancer")]
    pub fn bad_groups(&self) -> Result<BTreeMap<GroupId, Vec<GroupId>>> {
        self.balancer()?.bad_groups()
    }

    /// Every group the balancer knows, sorted and deduplicated
    #[cfg(feature = "balancer")]
    pub fn all_groups(&self) -> Result<Vec<GroupId>> {
        self.balancer()?.all_groups()
    }

    /// Stop background work; the proxy stays usable without the balancer
    /// refreshing
    pub fn shutdown(&mut self) {
        #[cfg(feature = "balancer")]
        if let Some(balancer) = self.ctx.balancer.as_mut() {
            balancer.shutdown();
        }
        tracing::debug!("proxy background work stopped");
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}
