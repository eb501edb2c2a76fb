//! In-memory storage cluster
//!
//! [`MemoryCluster`] implements [`StorageNode`] over plain maps so the
//! orchestrators can be driven without a real cluster. Failures are scripted
//! with [`FailRule`]s (per operation, group and object) or whole-call
//! transport errors, and every transport call is recorded in an operation
//! log for assertions.

use crate::container::Timestamp;
use crate::key::{GroupId, Key, RawId};
use crate::transport::{
    FindIndexesEntry, IndexEntry, IoAttr, IoFlags, LookupEntry, NodeStat, Pending, ReadEntry,
    RemoveAck, StorageNode, StorageSession, TransportError, TransportResult,
};
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Transport call kinds, as recorded in the operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Per-group lookup probe
    Lookup,
    /// Single-shot write
    Write,
    /// First chunk of a staged upload
    Prepare,
    /// Middle chunk of a staged upload
    Plain,
    /// Last chunk of a staged upload
    Commit,
    /// Metadata record written after the data
    Metadata,
    /// Plain read
    Read,
    /// Read of the newest version across groups
    ReadLatest,
    /// Range scan
    ReadRange,
    /// Removal, including rollbacks
    Remove,
    /// Batched read
    BulkRead,
    /// Batched write
    BulkWrite,
    /// Address lookup for one group
    LookupAddress,
    /// Locked script execution
    Exec,
    /// Node statistics request
    StatLog,
    /// Index update for one object
    UpdateIndexes,
    /// Search of objects by index
    FindIndexes,
    /// Listing of one object's indexes
    CheckIndexes,
}

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    /// Call kind
    pub kind: OpKind,
    /// Groups targeted by the session at call time
    pub groups: Vec<GroupId>,
    /// Object id, when the call addressed a single object
    pub id: Option<RawId>,
}

/// Scripted per-group failure
///
/// Matches calls by operation, group and object id (unset fields match
/// anything). The first `after` matches pass; every later match fails with
/// `code`.
#[derive(Debug, Clone)]
pub struct FailRule {
    op: Option<OpKind>,
    group: Option<GroupId>,
    id: Option<RawId>,
    after: usize,
    code: i32,
}

impl FailRule {
    /// Fail every call of `op`
    pub fn on(op: OpKind) -> Self {
        Self {
            op: Some(op),
            group: None,
            id: None,
            after: 0,
            code: TransportError::IO,
        }
    }

    /// Fail every call in `group`
    pub fn in_group(group: GroupId) -> Self {
        Self {
            op: None,
            group: Some(group),
            id: None,
            after: 0,
            code: TransportError::IO,
        }
    }

    /// Restrict to `group`
    pub fn group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }

    /// Restrict to one object
    pub fn id(mut self, id: RawId) -> Self {
        self.id = Some(id);
        self
    }

    /// Let the first `n` matches through
    pub fn after(mut self, n: usize) -> Self {
        self.after = n;
        self
    }

    /// Error code reported on failure
    pub fn code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    fn matches(&self, op: OpKind, group: GroupId, id: Option<&RawId>) -> bool {
        self.op.is_none_or(|o| o == op)
            && self.group.is_none_or(|g| g == group)
            && self.id.is_none_or(|i| id == Some(&i))
    }
}

/// Metadata record written after a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Remote name of the object
    pub remote: String,
    /// Groups holding a copy
    pub groups: Vec<GroupId>,
    /// Write time
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    version: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    objects: BTreeMap<RawId, StoredObject>,
    staged: HashMap<RawId, Vec<u8>>,
    metadata: HashMap<RawId, MetadataRecord>,
}

#[derive(Default)]
struct Inner {
    groups: BTreeMap<GroupId, GroupState>,
    rules: Vec<FailRule>,
    call_errors: Vec<(OpKind, TransportError)>,
    ops: Vec<OpRecord>,
    state_num: usize,
    version: u64,
    indexes: BTreeMap<RawId, BTreeMap<RawId, Bytes>>,
}

impl Inner {
    fn record(&mut self, kind: OpKind, groups: &[GroupId], id: Option<RawId>) {
        self.ops.push(OpRecord {
            kind,
            groups: groups.to_vec(),
            id,
        });
    }

    fn take_call_error(&mut self, kind: OpKind) -> Option<TransportError> {
        let pos = self.call_errors.iter().position(|(k, _)| *k == kind)?;
        Some(self.call_errors.remove(pos).1)
    }

    // Status a scripted rule forces for this call, if any.
    fn injected(&mut self, op: OpKind, group: GroupId, id: Option<&RawId>) -> Option<i32> {
        for rule in self.rules.iter_mut() {
            if rule.matches(op, group, id) {
                if rule.after > 0 {
                    rule.after -= 1;
                    continue;
                }
                return Some(rule.code);
            }
        }
        None
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

fn address(group: GroupId) -> String {
    format!("10.0.0.{}:{}", group, 1024 + group)
}

fn lookup_entry(id: RawId, group: GroupId, status: i32, size: u64) -> LookupEntry {
    LookupEntry {
        id,
        group,
        status,
        address: address(group),
        path: format!("/srv/elliptics/{}/data-0.0", group),
        offset: 0,
        size,
    }
}

fn read_entry(id: RawId, group: GroupId, data: Bytes) -> ReadEntry {
    ReadEntry {
        id,
        group,
        status: 0,
        data,
        record_count: 1,
    }
}

fn put_at(buf: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let offset = offset as usize;
    if buf.len() < offset + data.len() {
        buf.resize(offset + data.len(), 0);
    }
    buf[offset..offset + data.len()].copy_from_slice(data);
}

fn slice_of(data: &[u8], offset: u64, size: u64) -> Bytes {
    let start = (offset as usize).min(data.len());
    let end = if size == 0 {
        data.len()
    } else {
        start.saturating_add(size as usize).min(data.len())
    };
    Bytes::copy_from_slice(&data[start..end])
}

/// Name to id transform shared by the cluster and its sessions
pub fn transform(name: &str) -> RawId {
    let digest = Sha512::digest(name.as_bytes());
    RawId::from_slice(digest.as_slice()).unwrap_or(RawId::MIN)
}

/// In-memory [`StorageNode`]
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCluster {
    /// Cluster made of `groups`, with one live endpoint per group
    pub fn new(groups: &[GroupId]) -> Self {
        let inner = Inner {
            groups: groups.iter().map(|g| (*g, GroupState::default())).collect(),
            state_num: groups.len(),
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Override the live endpoint count
    pub fn set_state_num(&self, state_num: usize) {
        self.inner.lock().state_num = state_num;
    }

    /// Install a scripted failure
    pub fn fail(&self, rule: FailRule) {
        self.inner.lock().rules.push(rule);
    }

    /// Fail the next call of `op` as a whole
    pub fn fail_next_call(&self, op: OpKind, err: TransportError) {
        self.inner.lock().call_errors.push((op, err));
    }

    /// Drop scripted failures
    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.rules.clear();
        inner.call_errors.clear();
    }

    /// Every recorded call
    pub fn ops(&self) -> Vec<OpRecord> {
        self.inner.lock().ops.clone()
    }

    /// Recorded calls of one kind
    pub fn ops_of(&self, kind: OpKind) -> Vec<OpRecord> {
        self.inner
            .lock()
            .ops
            .iter()
            .filter(|op| op.kind == kind)
            .cloned()
            .collect()
    }

    /// Forget recorded calls
    pub fn clear_ops(&self) {
        self.inner.lock().ops.clear();
    }

    /// Id the cluster uses for `key`
    pub fn id_of(&self, key: &Key) -> RawId {
        match key.id() {
            Some(id) => *id,
            None => transform(key.remote_name().unwrap_or_default()),
        }
    }

    /// Store an object directly, bypassing the proxy
    pub fn put(&self, group: GroupId, key: &Key, data: impl Into<Bytes>) {
        let id = self.id_of(key);
        let data: Bytes = data.into();
        let mut inner = self.inner.lock();
        let version = inner.next_version();
        if let Some(state) = inner.groups.get_mut(&group) {
            state.objects.insert(
                id,
                StoredObject {
                    data: data.to_vec(),
                    version,
                },
            );
        }
    }

    /// Committed copy of `key` in `group`
    pub fn object(&self, group: GroupId, key: &Key) -> Option<Bytes> {
        let id = self.id_of(key);
        self.inner
            .lock()
            .groups
            .get(&group)
            .and_then(|g| g.objects.get(&id))
            .map(|o| Bytes::copy_from_slice(&o.data))
    }

    /// Groups holding a committed copy of `key`
    pub fn groups_holding(&self, key: &Key) -> Vec<GroupId> {
        let id = self.id_of(key);
        self.inner
            .lock()
            .groups
            .iter()
            .filter(|(_, state)| state.objects.contains_key(&id))
            .map(|(group, _)| *group)
            .collect()
    }

    /// True if `group` holds an uncommitted staged upload of `key`
    pub fn has_staged(&self, group: GroupId, key: &Key) -> bool {
        let id = self.id_of(key);
        self.inner
            .lock()
            .groups
            .get(&group)
            .is_some_and(|g| g.staged.contains_key(&id))
    }

    /// Metadata record of `key` in `group`
    pub fn metadata(&self, group: GroupId, key: &Key) -> Option<MetadataRecord> {
        let id = self.id_of(key);
        self.inner
            .lock()
            .groups
            .get(&group)
            .and_then(|g| g.metadata.get(&id).cloned())
    }
}

impl StorageNode for MemoryCluster {
    fn session(&self) -> Box<dyn StorageSession> {
        Box::new(MemorySession {
            inner: self.inner.clone(),
            groups: Vec::new(),
            cflags: 0,
            ioflags: IoFlags::NONE,
        })
    }
}

#[derive(Clone, Copy)]
enum Stage {
    Full,
    Prepare(u64),
    Plain,
    Commit(u64),
}

struct MemorySession {
    inner: Arc<Mutex<Inner>>,
    groups: Vec<GroupId>,
    cflags: u64,
    ioflags: IoFlags,
}

impl MemorySession {
    fn id(&self, key: &Key) -> RawId {
        key.resolve_id(self)
    }

    fn store(
        &mut self,
        kind: OpKind,
        key: &Key,
        data: Bytes,
        offset: u64,
        stage: Stage,
    ) -> Pending<Vec<LookupEntry>> {
        let id = self.id(key);
        let mut inner = self.inner.lock();
        inner.record(kind, &self.groups, Some(id));
        if let Some(err) = inner.take_call_error(kind) {
            return Pending::ready(Err(err));
        }

        let version = inner.next_version();
        let mut entries = Vec::with_capacity(self.groups.len());
        for &group in &self.groups {
            if let Some(code) = inner.injected(kind, group, Some(&id)) {
                entries.push(lookup_entry(id, group, code, 0));
                continue;
            }
            let Some(state) = inner.groups.get_mut(&group) else {
                entries.push(lookup_entry(id, group, TransportError::NO_DEVICE, 0));
                continue;
            };
            let size = match stage {
                Stage::Full => {
                    let object = state.objects.entry(id).or_insert(StoredObject {
                        data: Vec::new(),
                        version,
                    });
                    if offset == 0 {
                        object.data.clear();
                    }
                    put_at(&mut object.data, offset, &data);
                    object.version = version;
                    object.data.len() as u64
                }
                Stage::Prepare(total) => {
                    let mut buf = vec![0; total as usize];
                    put_at(&mut buf, offset, &data);
                    let len = buf.len() as u64;
                    state.staged.insert(id, buf);
                    len
                }
                Stage::Plain => match state.staged.get_mut(&id) {
                    Some(buf) => {
                        put_at(buf, offset, &data);
                        buf.len() as u64
                    }
                    None => {
                        entries.push(lookup_entry(id, group, TransportError::NOT_FOUND, 0));
                        continue;
                    }
                },
                Stage::Commit(total) => {
                    let mut buf = state.staged.remove(&id).unwrap_or_default();
                    put_at(&mut buf, offset, &data);
                    buf.truncate((total as usize).max(offset as usize + data.len()));
                    let len = buf.len() as u64;
                    state.objects.insert(id, StoredObject { data: buf, version });
                    len
                }
            };
            entries.push(lookup_entry(id, group, 0, size));
        }
        Pending::ready(Ok(entries))
    }

    fn read(&mut self, kind: OpKind, key: &Key, offset: u64, size: u64) -> Pending<Vec<ReadEntry>> {
        let id = self.id(key);
        let mut inner = self.inner.lock();
        inner.record(kind, &self.groups, Some(id));
        if let Some(err) = inner.take_call_error(kind) {
            return Pending::ready(Err(err));
        }

        let mut failed = false;
        let mut best: Option<(GroupId, u64, Bytes)> = None;
        for &group in &self.groups {
            if inner.injected(kind, group, Some(&id)).is_some() {
                failed = true;
                continue;
            }
            let Some(object) = inner.groups.get(&group).and_then(|g| g.objects.get(&id)) else {
                continue;
            };
            let newer = best.as_ref().is_none_or(|(_, v, _)| object.version > *v);
            if newer {
                best = Some((group, object.version, slice_of(&object.data, offset, size)));
            }
            if kind == OpKind::Read {
                break;
            }
        }

        Pending::ready(match best {
            Some((group, _, data)) => Ok(vec![read_entry(id, group, data)]),
            None if failed => Err(TransportError::io(format!("read of {} failed", id))),
            None => Err(TransportError::not_found(format!("{} not found", id))),
        })
    }
}

impl StorageSession for MemorySession {
    fn set_groups(&mut self, groups: &[GroupId]) {
        self.groups = groups.to_vec();
    }

    fn groups(&self) -> Vec<GroupId> {
        self.groups.clone()
    }

    fn set_cflags(&mut self, cflags: u64) {
        self.cflags = cflags;
    }

    fn cflags(&self) -> u64 {
        self.cflags
    }

    fn set_ioflags(&mut self, ioflags: IoFlags) {
        self.ioflags = ioflags;
    }

    fn ioflags(&self) -> IoFlags {
        self.ioflags
    }

    fn state_num(&self) -> usize {
        self.inner.lock().state_num
    }

    fn transform(&self, name: &str) -> RawId {
        transform(name)
    }

    fn lookup(&mut self, key: &Key) -> Pending<Vec<LookupEntry>> {
        let id = self.id(key);
        let mut inner = self.inner.lock();
        inner.record(OpKind::Lookup, &self.groups, Some(id));
        if let Some(err) = inner.take_call_error(OpKind::Lookup) {
            return Pending::ready(Err(err));
        }

        let entries = self
            .groups
            .iter()
            .map(|&group| {
                if let Some(code) = inner.injected(OpKind::Lookup, group, Some(&id)) {
                    return lookup_entry(id, group, code, 0);
                }
                match inner.groups.get(&group).and_then(|g| g.objects.get(&id)) {
                    Some(object) => lookup_entry(id, group, 0, object.data.len() as u64),
                    None => lookup_entry(id, group, TransportError::NOT_FOUND, 0),
                }
            })
            .collect();
        Pending::ready(Ok(entries))
    }

    fn write_data(&mut self, key: &Key, data: Bytes, offset: u64) -> Pending<Vec<LookupEntry>> {
        self.store(OpKind::Write, key, data, offset, Stage::Full)
    }

    fn write_prepare(
        &mut self,
        key: &Key,
        data: Bytes,
        offset: u64,
        total_size: u64,
    ) -> Pending<Vec<LookupEntry>> {
        self.store(OpKind::Prepare, key, data, offset, Stage::Prepare(total_size))
    }

    fn write_plain(&mut self, key: &Key, data: Bytes, offset: u64) -> Pending<Vec<LookupEntry>> {
        self.store(OpKind::Plain, key, data, offset, Stage::Plain)
    }

    fn write_commit(
        &mut self,
        key: &Key,
        data: Bytes,
        offset: u64,
        total_size: u64,
    ) -> Pending<Vec<LookupEntry>> {
        self.store(OpKind::Commit, key, data, offset, Stage::Commit(total_size))
    }

    fn write_metadata(
        &mut self,
        key: &Key,
        remote: &str,
        groups: &[GroupId],
        timestamp: Timestamp,
    ) -> Pending<()> {
        let id = self.id(key);
        let mut inner = self.inner.lock();
        inner.record(OpKind::Metadata, &self.groups, Some(id));
        if let Some(err) = inner.take_call_error(OpKind::Metadata) {
            return Pending::ready(Err(err));
        }
        for group in groups {
            if let Some(state) = inner.groups.get_mut(group) {
                state.metadata.insert(
                    id,
                    MetadataRecord {
                        remote: remote.to_string(),
                        groups: groups.to_vec(),
                        timestamp,
                    },
                );
            }
        }
        Pending::ready(Ok(()))
    }

    fn read_data(&mut self, key: &Key, offset: u64, size: u64) -> Pending<Vec<ReadEntry>> {
        self.read(OpKind::Read, key, offset, size)
    }

    fn read_latest(&mut self, key: &Key, offset: u64, size: u64) -> Pending<Vec<ReadEntry>> {
        self.read(OpKind::ReadLatest, key, offset, size)
    }

    fn read_data_range(&mut self, io: &IoAttr, group: GroupId) -> Pending<Vec<ReadEntry>> {
        let mut inner = self.inner.lock();
        inner.record(OpKind::ReadRange, &[group], Some(io.id));
        if let Some(err) = inner.take_call_error(OpKind::ReadRange) {
            return Pending::ready(Err(err));
        }
        if let Some(code) = inner.injected(OpKind::ReadRange, group, None) {
            return Pending::ready(Err(TransportError::new(code, "range read failed")));
        }
        let Some(state) = inner.groups.get(&group) else {
            return Pending::ready(Err(TransportError::new(
                TransportError::NO_DEVICE,
                format!("no group {}", group),
            )));
        };

        let take = if io.num == 0 { usize::MAX } else { io.num as usize };
        let matched: Vec<(&RawId, &StoredObject)> = if io.id > io.parent {
            Vec::new()
        } else {
            state
                .objects
                .range(io.id..=io.parent)
                .skip(io.start as usize)
                .take(take)
                .collect()
        };

        let entries = if io.flags.contains(IoFlags::NODATA) {
            vec![ReadEntry {
                id: io.id,
                group,
                status: 0,
                data: Bytes::new(),
                record_count: matched.len() as u64,
            }]
        } else {
            matched
                .into_iter()
                .map(|(id, object)| read_entry(*id, group, Bytes::copy_from_slice(&object.data)))
                .collect()
        };
        Pending::ready(Ok(entries))
    }

    fn remove(&mut self, key: &Key) -> Pending<Vec<RemoveAck>> {
        let id = self.id(key);
        let mut inner = self.inner.lock();
        inner.record(OpKind::Remove, &self.groups, Some(id));
        if let Some(err) = inner.take_call_error(OpKind::Remove) {
            return Pending::ready(Err(err));
        }

        let acks = self
            .groups
            .iter()
            .map(|&group| {
                if let Some(code) = inner.injected(OpKind::Remove, group, Some(&id)) {
                    return RemoveAck {
                        group,
                        status: code,
                    };
                }
                let status = match inner.groups.get_mut(&group) {
                    Some(state) => {
                        let staged = state.staged.remove(&id).is_some();
                        state.metadata.remove(&id);
                        if state.objects.remove(&id).is_some() || staged {
                            0
                        } else {
                            TransportError::NOT_FOUND
                        }
                    }
                    None => TransportError::NO_DEVICE,
                };
                RemoveAck { group, status }
            })
            .collect();
        Pending::ready(Ok(acks))
    }

    fn bulk_read(&mut self, ios: Vec<IoAttr>) -> Pending<Vec<ReadEntry>> {
        let mut inner = self.inner.lock();
        inner.record(OpKind::BulkRead, &self.groups, None);
        if let Some(err) = inner.take_call_error(OpKind::BulkRead) {
            return Pending::ready(Err(err));
        }

        let mut entries = Vec::new();
        for io in &ios {
            for &group in &self.groups {
                if inner.injected(OpKind::BulkRead, group, Some(&io.id)).is_some() {
                    continue;
                }
                if let Some(object) = inner.groups.get(&group).and_then(|g| g.objects.get(&io.id)) {
                    entries.push(read_entry(io.id, group, Bytes::copy_from_slice(&object.data)));
                    break;
                }
            }
        }
        Pending::ready(Ok(entries))
    }

    fn bulk_write(&mut self, ios: Vec<IoAttr>, data: Vec<Bytes>) -> Pending<Vec<LookupEntry>> {
        let mut inner = self.inner.lock();
        inner.record(OpKind::BulkWrite, &self.groups, None);
        if let Some(err) = inner.take_call_error(OpKind::BulkWrite) {
            return Pending::ready(Err(err));
        }
        if ios.len() != data.len() {
            return Pending::ready(Err(TransportError::new(-22, "ios and data differ in length")));
        }

        let mut entries = Vec::new();
        for (io, payload) in ios.iter().zip(data) {
            let version = inner.next_version();
            for &group in &self.groups {
                if let Some(code) = inner.injected(OpKind::BulkWrite, group, Some(&io.id)) {
                    entries.push(lookup_entry(io.id, group, code, 0));
                    continue;
                }
                match inner.groups.get_mut(&group) {
                    Some(state) => {
                        state.objects.insert(
                            io.id,
                            StoredObject {
                                data: payload.to_vec(),
                                version,
                            },
                        );
                        entries.push(lookup_entry(io.id, group, 0, payload.len() as u64));
                    }
                    None => {
                        entries.push(lookup_entry(io.id, group, TransportError::NO_DEVICE, 0))
                    }
                }
            }
        }
        Pending::ready(Ok(entries))
    }

    fn lookup_address(&mut self, key: &Key, group: GroupId) -> TransportResult<String> {
        let id = self.id(key);
        let mut inner = self.inner.lock();
        inner.record(OpKind::LookupAddress, &[group], Some(id));
        if let Some(err) = inner.take_call_error(OpKind::LookupAddress) {
            return Err(err);
        }
        if inner.groups.contains_key(&group) {
            Ok(address(group))
        } else {
            Err(TransportError::new(
                TransportError::NO_DEVICE,
                format!("no group {}", group),
            ))
        }
    }

    fn exec_locked(&mut self, id: &RawId, script: &str, data: Bytes) -> Pending<Bytes> {
        let mut inner = self.inner.lock();
        inner.record(OpKind::Exec, &self.groups, Some(*id));
        if let Some(err) = inner.take_call_error(OpKind::Exec) {
            return Pending::ready(Err(err));
        }
        let mut out = format!("{}@{}:", script, id).into_bytes();
        out.extend_from_slice(&data);
        Pending::ready(Ok(Bytes::from(out)))
    }

    fn stat_log(&mut self) -> Pending<Vec<NodeStat>> {
        let mut inner = self.inner.lock();
        inner.record(OpKind::StatLog, &self.groups, None);
        if let Some(err) = inner.take_call_error(OpKind::StatLog) {
            return Pending::ready(Err(err));
        }
        let stats = inner
            .groups
            .iter()
            .map(|(group, state)| NodeStat {
                address: address(*group),
                id: None,
                la: [25, 50, 75],
                vm_total: 1 << 30,
                vm_free: 1 << 29,
                vm_cached: 1 << 28,
                frsize: 4096,
                blocks: 1 << 20,
                bavail: 1 << 19,
                bsize: 4096,
                files: state.objects.len() as u64,
                fsid: u64::from(*group),
            })
            .collect();
        Pending::ready(Ok(stats))
    }

    fn update_indexes(&mut self, key: &Key, indexes: Vec<IndexEntry>) -> Pending<()> {
        let id = self.id(key);
        let mut inner = self.inner.lock();
        inner.record(OpKind::UpdateIndexes, &self.groups, Some(id));
        if let Some(err) = inner.take_call_error(OpKind::UpdateIndexes) {
            return Pending::ready(Err(err));
        }
        for entry in indexes {
            inner
                .indexes
                .entry(entry.index)
                .or_default()
                .insert(id, entry.data);
        }
        Pending::ready(Ok(()))
    }

    fn find_indexes(&mut self, indexes: Vec<RawId>) -> Pending<Vec<FindIndexesEntry>> {
        let mut inner = self.inner.lock();
        inner.record(OpKind::FindIndexes, &self.groups, None);
        if let Some(err) = inner.take_call_error(OpKind::FindIndexes) {
            return Pending::ready(Err(err));
        }
        let Some((first, rest)) = indexes.split_first() else {
            return Pending::ready(Ok(Vec::new()));
        };

        let empty = BTreeMap::new();
        let objects = inner.indexes.get(first).unwrap_or(&empty);
        let found = objects
            .keys()
            .filter(|id| {
                rest.iter()
                    .all(|index| inner.indexes.get(index).is_some_and(|o| o.contains_key(id)))
            })
            .map(|id| FindIndexesEntry {
                id: *id,
                indexes: indexes
                    .iter()
                    .filter_map(|index| {
                        let data = inner.indexes.get(index)?.get(id)?;
                        Some(IndexEntry {
                            index: *index,
                            data: data.clone(),
                        })
                    })
                    .collect(),
            })
            .collect();
        Pending::ready(Ok(found))
    }

    fn check_indexes(&mut self, key: &Key) -> Pending<Vec<IndexEntry>> {
        let id = self.id(key);
        let mut inner = self.inner.lock();
        inner.record(OpKind::CheckIndexes, &self.groups, Some(id));
        if let Some(err) = inner.take_call_error(OpKind::CheckIndexes) {
            return Pending::ready(Err(err));
        }
        let entries = inner
            .indexes
            .iter()
            .filter_map(|(index, objects)| {
                objects.get(&id).map(|data| IndexEntry {
                    index: *index,
                    data: data.clone(),
                })
            })
            .collect();
        Pending::ready(Ok(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_upload() {
        let cluster = MemoryCluster::new(&[1, 2]);
        let key = Key::remote("big");
        let mut session = cluster.session();
        session.set_groups(&[1, 2]);

        session
            .write_prepare(&key, Bytes::from_static(b"ab"), 0, 6)
            .wait()
            .unwrap();
        assert!(cluster.has_staged(1, &key));
        assert!(cluster.object(1, &key).is_none());

        session
            .write_plain(&key, Bytes::from_static(b"cd"), 2)
            .wait()
            .unwrap();
        session
            .write_commit(&key, Bytes::from_static(b"ef"), 4, 6)
            .wait()
            .unwrap();
        assert_eq!(cluster.object(2, &key), Some(Bytes::from_static(b"abcdef")));
        assert!(!cluster.has_staged(2, &key));
    }

    #[test]
    fn test_fail_rule_after() {
        let cluster = MemoryCluster::new(&[1, 2]);
        cluster.fail(FailRule::on(OpKind::Write).group(2).after(1));
        let key = Key::remote("k");
        let mut session = cluster.session();
        session.set_groups(&[1, 2]);

        let first = session.write_data(&key, Bytes::from_static(b"x"), 0).wait().unwrap();
        assert!(first.iter().all(|e| e.status == 0));
        let second = session.write_data(&key, Bytes::from_static(b"x"), 0).wait().unwrap();
        assert_eq!(second[1].status, TransportError::IO);
        assert_eq!(cluster.ops_of(OpKind::Write).len(), 2);
    }

    #[test]
    fn test_read_latest_picks_newest() {
        let cluster = MemoryCluster::new(&[1, 2]);
        let key = Key::remote("k");
        cluster.put(2, &key, "new");
        cluster.put(1, &key, "newer");
        let mut session = cluster.session();
        session.set_groups(&[2, 1]);

        let latest = session.read_latest(&key, 0, 0).wait().unwrap();
        assert_eq!(latest[0].data, Bytes::from_static(b"newer"));
        let first = session.read_data(&key, 0, 0).wait().unwrap();
        assert_eq!(first[0].data, Bytes::from_static(b"new"));
    }
}
