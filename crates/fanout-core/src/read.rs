//! Reads, lookups, range scans and removes
//!
//! None of these consult the balancer; groups come straight from the
//! selector.

use crate::container::DataContainer;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::key::{GroupId, Key, RawId};
use crate::lookup::{LookupResult, Remote};
use crate::transport::{IoAttr, IoFlags, Pending, ReadEntry, RemoveAck, TransportError};
use bytes::Bytes;

/// Per-call read knobs
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Offset inside the object
    pub offset: u64,
    /// Bytes to read; 0 reads to the end
    pub size: u64,
    /// Command flags
    pub cflags: u64,
    /// I/O flags
    pub ioflags: IoFlags,
    /// Explicit groups; empty means configured defaults
    pub groups: Vec<GroupId>,
    /// Ask for the newest version across groups
    pub latest: bool,
    /// Payload carries embedded metadata records
    pub embedded: bool,
}

impl ReadOptions {
    /// Target explicit groups
    pub fn with_groups(mut self, groups: Vec<GroupId>) -> Self {
        self.groups = groups;
        self
    }

    /// Read the newest version
    pub fn latest(mut self) -> Self {
        self.latest = true;
        self
    }

    /// Unpack embedded metadata
    pub fn embedded(mut self) -> Self {
        self.embedded = true;
        self
    }
}

/// Per-call range scan knobs
#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    /// Command flags
    pub cflags: u64,
    /// I/O flags; [`IoFlags::NODATA`] asks for a record count
    pub ioflags: IoFlags,
    /// Records to skip
    pub limit_start: u64,
    /// Records to return
    pub limit_num: u64,
    /// Explicit groups; empty means configured defaults
    pub groups: Vec<GroupId>,
}

/// What a range scan produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeOutcome {
    /// Record payloads from the first group that had any
    Records(Vec<Bytes>),
    /// Matching record count, for `NODATA` scans
    Count(u64),
}

/// Pending read
pub struct AsyncReadResult {
    pending: Pending<Vec<ReadEntry>>,
    embedded: bool,
    key: Key,
}

impl AsyncReadResult {
    /// Block for every group's payload
    pub fn get(self) -> Result<Vec<DataContainer>> {
        let Self {
            pending,
            embedded,
            key,
        } = self;
        unpack_all(pending.wait(), embedded, &key)
    }

    /// Block for the first payload
    pub fn get_one(self) -> Result<DataContainer> {
        let key = self.key.clone();
        first_or_not_found(self.get()?, &key)
    }

    /// Await the first payload
    pub async fn recv(self) -> Result<DataContainer> {
        let Self {
            pending,
            embedded,
            key,
        } = self;
        first_or_not_found(unpack_all(pending.await, embedded, &key)?, &key)
    }
}

/// Pending remove
pub struct AsyncRemoveResult {
    pending: Pending<Vec<RemoveAck>>,
    key: Key,
}

impl AsyncRemoveResult {
    /// Block until every group answered
    pub fn wait(self) -> Result<Vec<RemoveAck>> {
        let Self { pending, key } = self;
        finish_remove(pending.wait(), &key)
    }

    /// Await every group's answer
    pub async fn recv(self) -> Result<Vec<RemoveAck>> {
        let Self { pending, key } = self;
        finish_remove(pending.await, &key)
    }
}

fn finish_remove(
    outcome: std::result::Result<Vec<RemoveAck>, TransportError>,
    key: &Key,
) -> Result<Vec<RemoveAck>> {
    let acks = outcome.map_err(|e| {
        tracing::error!("can not remove key {}: {}", key, e);
        Error::transport("remove", key, e)
    })?;
    if !acks.is_empty() && acks.iter().all(|a| a.status == TransportError::NOT_FOUND) {
        return Err(Error::NotFound {
            operation: "remove",
            key: key.to_string(),
        });
    }
    Ok(acks)
}

fn read_error(key: &Key, err: TransportError) -> Error {
    tracing::error!("can not get data for key {}: {}", key, err);
    if err.is_not_found() {
        Error::NotFound {
            operation: "read",
            key: key.to_string(),
        }
    } else {
        Error::ReadFailed {
            key: key.to_string(),
            reason: err.to_string(),
        }
    }
}

fn unpack_all(
    outcome: std::result::Result<Vec<ReadEntry>, TransportError>,
    embedded: bool,
    key: &Key,
) -> Result<Vec<DataContainer>> {
    let entries = outcome.map_err(|e| read_error(key, e))?;

    let mut first_error = None;
    let mut containers = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_error() {
            first_error.get_or_insert(entry.status);
            continue;
        }
        containers.push(DataContainer::unpack(entry.data, embedded)?);
    }

    match (containers.is_empty(), first_error) {
        (true, Some(code)) if code != TransportError::NOT_FOUND => Err(read_error(
            key,
            TransportError::new(code, "every group failed"),
        )),
        _ => Ok(containers),
    }
}

fn first_or_not_found(containers: Vec<DataContainer>, key: &Key) -> Result<DataContainer> {
    containers.into_iter().next().ok_or_else(|| Error::NotFound {
        operation: "read",
        key: key.to_string(),
    })
}

/// Read-side operations
pub(crate) struct ReadOrchestrator<'a> {
    ctx: &'a Context,
}

impl<'a> ReadOrchestrator<'a> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    pub(crate) fn read(&self, key: &Key, opts: &ReadOptions) -> Result<DataContainer> {
        self.read_async(key, opts)?.get_one()
    }

    pub(crate) fn read_async(&self, key: &Key, opts: &ReadOptions) -> Result<AsyncReadResult> {
        let groups = self.ctx.selector.resolve(key, &opts.groups, 0)?;
        let mut session = self.ctx.session();
        session.set_cflags(opts.cflags);
        session.set_ioflags(opts.ioflags);
        session.set_groups(&groups);

        let pending = if opts.latest {
            session.read_latest(key, opts.offset, opts.size)
        } else {
            session.read_data(key, opts.offset, opts.size)
        };
        Ok(AsyncReadResult {
            pending,
            embedded: opts.embedded,
            key: key.clone(),
        })
    }

    /// Probe groups until one answers cleanly. Groups answering with an
    /// error are dropped before the next probe.
    pub(crate) fn lookup(&self, key: &Key, groups: &[GroupId]) -> Result<LookupResult> {
        let mut remaining = self.ctx.selector.resolve(key, groups, 0)?;
        let mut session = self.ctx.session();

        while !remaining.is_empty() {
            session.set_groups(&remaining);
            let entries = session.lookup(key).wait().map_err(|e| {
                tracing::error!("can not get download info for key {}: {}", key, e);
                if e.is_not_found() {
                    Error::NotFound {
                        operation: "lookup",
                        key: key.to_string(),
                    }
                } else {
                    Error::transport("lookup", key, e)
                }
            })?;

            let before = remaining.len();
            for entry in &entries {
                if !entry.is_error() {
                    if let Ok(result) = self.ctx.formatter.parse(entry) {
                        return Ok(result);
                    }
                }
                remaining.retain(|g| *g != entry.group);
            }
            if remaining.len() == before {
                break;
            }
        }

        tracing::error!("can not get download info for key {}", key);
        Err(Error::NotFound {
            operation: "lookup",
            key: key.to_string(),
        })
    }

    /// Scan `[from, to]` group by group until one yields something
    pub(crate) fn range_get(
        &self,
        from: &Key,
        to: &Key,
        opts: &RangeOptions,
        key: &Key,
    ) -> Result<RangeOutcome> {
        let groups = self.ctx.selector.resolve(key, &opts.groups, 0)?;
        let mut session = self.ctx.session();
        session.set_cflags(opts.cflags);
        session.set_ioflags(opts.ioflags);

        let io = IoAttr {
            id: from.id().copied().unwrap_or(RawId::MIN),
            parent: to.id().copied().unwrap_or(RawId::MAX),
            start: opts.limit_start,
            num: opts.limit_num,
            size: 0,
            flags: opts.ioflags,
            kind: from.kind(),
        };
        let count_only = opts.ioflags.contains(IoFlags::NODATA);

        for group in &groups {
            let entries = match session.read_data_range(&io, *group).wait() {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!("range read for key {} failed in group {}: {}", key, group, e);
                    continue;
                }
            };
            let entries: Vec<ReadEntry> = entries.into_iter().filter(|e| !e.is_error()).collect();
            if count_only {
                let count: u64 = entries.iter().map(|e| e.record_count).sum();
                if count > 0 {
                    return Ok(RangeOutcome::Count(count));
                }
            } else if !entries.is_empty() {
                return Ok(RangeOutcome::Records(
                    entries.into_iter().map(|e| e.data).collect(),
                ));
            }
        }

        tracing::error!(
            "READ_RANGE failed for key {} from: {} to: {} in {} groups",
            key,
            from,
            to,
            groups.len()
        );
        Err(Error::ReadFailed {
            key: key.to_string(),
            reason: format!("range read yielded nothing in {} groups", groups.len()),
        })
    }

    /// Node address per candidate group
    pub(crate) fn lookup_addr(&self, key: &Key, groups: &[GroupId]) -> Result<Vec<Remote>> {
        let groups = self.ctx.selector.resolve(key, groups, 0)?;
        let mut session = self.ctx.session();
        groups
            .iter()
            .map(|group| {
                let addr = session
                    .lookup_address(key, *group)
                    .map_err(|e| Error::transport("lookup_addr", key, e))?;
                addr.parse()
            })
            .collect()
    }

    pub(crate) fn remove(&self, key: &Key, groups: &[GroupId]) -> Result<Vec<RemoveAck>> {
        self.remove_async(key, groups)?.wait()
    }

    pub(crate) fn remove_async(&self, key: &Key, groups: &[GroupId]) -> Result<AsyncRemoveResult> {
        let groups = self.ctx.selector.resolve(key, groups, 0)?;
        let mut session = self.ctx.session();
        session.set_groups(&groups);
        Ok(AsyncRemoveResult {
            pending: session.remove(key),
            key: key.clone(),
        })
    }
}
