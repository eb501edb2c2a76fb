//! Storage transport abstraction
//!
//! The proxy never talks to the wire itself. A [`StorageNode`] hands out
//! short-lived [`StorageSession`]s; a session carries the group list and
//! flags the orchestrator sets for one operation. Transport calls are
//! asynchronous and return a [`Pending`] completion handle.

use crate::container::Timestamp;
use crate::key::{GroupId, Key, RawId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::BitOr;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;

/// Failure reported by the storage layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct TransportError {
    /// Negative errno-style code
    pub code: i32,
    /// Human readable description
    pub message: String,
}

impl TransportError {
    /// Object does not exist
    pub const NOT_FOUND: i32 = -2;
    /// I/O failure
    pub const IO: i32 = -5;
    /// No such device/group
    pub const NO_DEVICE: i32 = -6;
    /// Waiting would stall the calling runtime
    pub const WOULD_BLOCK: i32 = -11;
    /// Request was dropped before completion
    pub const CANCELLED: i32 = -125;

    /// Create a transport error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(Self::IO, message)
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, message)
    }

    /// Completion side dropped without answering
    pub fn cancelled() -> Self {
        Self::new(Self::CANCELLED, "request was dropped before completion")
    }

    /// True for a missing object
    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND
    }
}

/// Result of a transport call
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// I/O flags passed through to the storage nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoFlags(u64);

impl IoFlags {
    /// No flags
    pub const NONE: IoFlags = IoFlags(0);
    /// Append to the existing object
    pub const APPEND: IoFlags = IoFlags(1 << 0);
    /// Reserve the full object size, first step of a staged upload
    pub const PREPARE: IoFlags = IoFlags(1 << 4);
    /// Finalise a staged upload
    pub const COMMIT: IoFlags = IoFlags(1 << 5);
    /// Write into a prepared object without committing
    pub const PLAIN_WRITE: IoFlags = IoFlags(1 << 8);
    /// Return metadata or counts instead of data
    pub const NODATA: IoFlags = IoFlags(1 << 9);
    /// Serve from the node cache
    pub const CACHE: IoFlags = IoFlags(1 << 10);

    /// Flags that select a staged upload step
    pub const STAGED: IoFlags = IoFlags(Self::PREPARE.0 | Self::COMMIT.0 | Self::PLAIN_WRITE.0);

    /// Build from raw bits
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// True if every flag in `other` is set
    pub fn contains(&self, other: IoFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag in `other` is set
    pub fn intersects(&self, other: IoFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for IoFlags {
    type Output = IoFlags;

    fn bitor(self, rhs: IoFlags) -> IoFlags {
        IoFlags(self.0 | rhs.0)
    }
}

/// One group's answer to a write or lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupEntry {
    /// Resolved object id
    pub id: RawId,
    /// Group that answered
    pub group: GroupId,
    /// Zero or positive on success, negative errno on failure
    pub status: i32,
    /// Node address as `host:port`
    pub address: String,
    /// Backing file path on the node
    pub path: String,
    /// Offset of the object inside the backing file
    pub offset: u64,
    /// Stored object size
    pub size: u64,
}

impl LookupEntry {
    /// True if the group reported an error
    pub fn is_error(&self) -> bool {
        self.status < 0
    }
}

/// One group's answer to a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEntry {
    /// Object id
    pub id: RawId,
    /// Group that answered
    pub group: GroupId,
    /// Zero on success, negative errno on failure
    pub status: i32,
    /// Packed payload
    pub data: Bytes,
    /// Records matched, for range reads
    pub record_count: u64,
}

impl ReadEntry {
    /// True if the group reported an error
    pub fn is_error(&self) -> bool {
        self.status < 0
    }
}

/// One group's answer to a remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveAck {
    /// Group that answered
    pub group: GroupId,
    /// Zero on success, negative errno on failure
    pub status: i32,
}

/// Raw I/O descriptor for range and bulk requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoAttr {
    /// Object id, or range start
    pub id: RawId,
    /// Range end
    pub parent: RawId,
    /// Range: records to skip
    pub start: u64,
    /// Range: records to return
    pub num: u64,
    /// Payload size for bulk writes
    pub size: u64,
    /// I/O flags
    pub flags: IoFlags,
    /// Key type tag
    pub kind: i32,
}

impl IoAttr {
    /// Descriptor addressing a single object
    pub fn for_id(id: RawId, kind: i32) -> Self {
        Self {
            id,
            parent: id,
            start: 0,
            num: 0,
            size: 0,
            flags: IoFlags::NONE,
            kind,
        }
    }
}

/// Raw per-node statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStat {
    /// Node address as `host:port`
    pub address: String,
    /// Node id
    pub id: Option<RawId>,
    /// Load averages multiplied by 100
    pub la: [u32; 3],
    /// Total memory
    pub vm_total: u64,
    /// Free memory
    pub vm_free: u64,
    /// Cached memory
    pub vm_cached: u64,
    /// Fragment size
    pub frsize: u64,
    /// Blocks on the filesystem
    pub blocks: u64,
    /// Available blocks
    pub bavail: u64,
    /// Block size
    pub bsize: u64,
    /// Inode count
    pub files: u64,
    /// Filesystem id
    pub fsid: u64,
}

/// Secondary index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Index id
    pub index: RawId,
    /// Data attached to the object in this index
    pub data: Bytes,
}

/// Objects found in a set of indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindIndexesEntry {
    /// Object id
    pub id: RawId,
    /// Index entries for the object
    pub indexes: Vec<IndexEntry>,
}

/// Completion side of a [`Pending`]
pub struct Completion<T> {
    tx: oneshot::Sender<TransportResult<T>>,
}

impl<T> Completion<T> {
    /// Deliver the result; ignored if the caller already dropped the handle
    pub fn complete(self, result: TransportResult<T>) {
        let _ = self.tx.send(result);
    }
}

/// Handle to an in-flight transport call
///
/// Block on it with [`Pending::wait`] from synchronous code, or `.await` it.
/// Inside a multi-threaded tokio runtime `wait` moves the worker into a
/// blocking section first. On a current-thread runtime it cannot block, so
/// an unfinished call fails with [`TransportError::WOULD_BLOCK`].
pub struct Pending<T> {
    rx: oneshot::Receiver<TransportResult<T>>,
}

impl<T> Pending<T> {
    /// Create a linked completion/handle pair
    pub fn channel() -> (Completion<T>, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx }, Pending { rx })
    }

    /// Already completed handle
    pub fn ready(result: TransportResult<T>) -> Self {
        let (completion, pending) = Self::channel();
        completion.complete(result);
        pending
    }

    /// Block until the call completes
    pub fn wait(mut self) -> TransportResult<T> {
        if let Some(result) = self.try_take() {
            return result;
        }
        match Handle::try_current() {
            Err(_) => self.block(),
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                Err(TransportError::new(
                    TransportError::WOULD_BLOCK,
                    "can not block a current-thread runtime, await the handle instead",
                ))
            }
            Ok(_) => tokio::task::block_in_place(|| self.block()),
        }
    }

    fn block(self) -> TransportResult<T> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(TransportError::cancelled()))
    }

    /// Take the result if it is already available
    pub fn try_take(&mut self) -> Option<TransportResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TransportError::cancelled())),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = TransportResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(TransportError::cancelled())))
    }
}

/// Connection to the storage cluster
pub trait StorageNode: Send + Sync {
    /// Open a session for one operation
    fn session(&self) -> Box<dyn StorageSession>;
}

/// Per-operation view of the cluster
///
/// Every data call targets the groups last passed to [`set_groups`].
///
/// [`set_groups`]: StorageSession::set_groups
pub trait StorageSession: Send {
    /// Target groups for subsequent calls
    fn set_groups(&mut self, groups: &[GroupId]);
    /// Currently targeted groups
    fn groups(&self) -> Vec<GroupId>;
    /// Command flags
    fn set_cflags(&mut self, cflags: u64);
    /// Current command flags
    fn cflags(&self) -> u64;
    /// I/O flags
    fn set_ioflags(&mut self, ioflags: IoFlags);
    /// Current I/O flags
    fn ioflags(&self) -> IoFlags;

    /// Number of reachable endpoints
    fn state_num(&self) -> usize;
    /// Resolve a remote name into a raw id
    fn transform(&self, name: &str) -> RawId;

    /// Locate the object in every target group
    fn lookup(&mut self, key: &Key) -> Pending<Vec<LookupEntry>>;
    /// Single-shot write
    fn write_data(&mut self, key: &Key, data: Bytes, offset: u64) -> Pending<Vec<LookupEntry>>;
    /// Staged upload: reserve `total_size` and write the first piece
    fn write_prepare(
        &mut self,
        key: &Key,
        data: Bytes,
        offset: u64,
        total_size: u64,
    ) -> Pending<Vec<LookupEntry>>;
    /// Staged upload: write a middle piece
    fn write_plain(&mut self, key: &Key, data: Bytes, offset: u64) -> Pending<Vec<LookupEntry>>;
    /// Staged upload: write the last piece and finalise
    fn write_commit(
        &mut self,
        key: &Key,
        data: Bytes,
        offset: u64,
        total_size: u64,
    ) -> Pending<Vec<LookupEntry>>;
    /// Metadata-only record for `remote` in `groups`
    fn write_metadata(
        &mut self,
        key: &Key,
        remote: &str,
        groups: &[GroupId],
        timestamp: Timestamp,
    ) -> Pending<()>;

    /// Read from the first group holding the object
    fn read_data(&mut self, key: &Key, offset: u64, size: u64) -> Pending<Vec<ReadEntry>>;
    /// Read the newest version across target groups
    fn read_latest(&mut self, key: &Key, offset: u64, size: u64) -> Pending<Vec<ReadEntry>>;
    /// Range read in one group
    fn read_data_range(&mut self, io: &IoAttr, group: GroupId) -> Pending<Vec<ReadEntry>>;

    /// Remove from every target group
    fn remove(&mut self, key: &Key) -> Pending<Vec<RemoveAck>>;

    /// Batched read
    fn bulk_read(&mut self, ios: Vec<IoAttr>) -> Pending<Vec<ReadEntry>>;
    /// Batched write, `data[i]` belongs to `ios[i]`
    fn bulk_write(&mut self, ios: Vec<IoAttr>, data: Vec<Bytes>) -> Pending<Vec<LookupEntry>>;

    /// `host:port` of the node responsible for `key` in `group`
    fn lookup_address(&mut self, key: &Key, group: GroupId) -> TransportResult<String>;
    /// Run `script` under the object lock
    fn exec_locked(&mut self, id: &RawId, script: &str, data: Bytes) -> Pending<Bytes>;
    /// Per-node statistics
    fn stat_log(&mut self) -> Pending<Vec<NodeStat>>;

    /// Put the object into indexes
    fn update_indexes(&mut self, key: &Key, indexes: Vec<IndexEntry>) -> Pending<()>;
    /// Objects present in all of `indexes`
    fn find_indexes(&mut self, indexes: Vec<RawId>) -> Pending<Vec<FindIndexesEntry>>;
    /// Indexes the object belongs to
    fn check_indexes(&mut self, key: &Key) -> Pending<Vec<IndexEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = IoFlags::PREPARE | IoFlags::CACHE;
        assert!(flags.contains(IoFlags::PREPARE));
        assert!(flags.intersects(IoFlags::STAGED));
        assert!(!flags.contains(IoFlags::STAGED));
        assert!(!IoFlags::NONE.intersects(IoFlags::STAGED));
        assert_eq!(IoFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_pending_wait() {
        let pending = Pending::ready(Ok(7u32));
        assert_eq!(pending.wait(), Ok(7));

        let (completion, pending) = Pending::<u32>::channel();
        drop(completion);
        assert_eq!(pending.wait().unwrap_err().code, TransportError::CANCELLED);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_wait_inside_multi_thread_runtime() {
        let (completion, pending) = Pending::<u32>::channel();
        let answer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            completion.complete(Ok(3));
        });
        assert_eq!(pending.wait(), Ok(3));
        answer.join().unwrap();
    }

    #[tokio::test]
    async fn test_pending_wait_inside_current_thread_runtime() {
        assert_eq!(Pending::ready(Ok(1u32)).wait(), Ok(1));

        let (_completion, pending) = Pending::<u32>::channel();
        assert_eq!(pending.wait().unwrap_err().code, TransportError::WOULD_BLOCK);
    }

    #[test]
    fn test_pending_try_take() {
        let (completion, mut pending) = Pending::<u32>::channel();
        assert!(pending.try_take().is_none());
        completion.complete(Err(TransportError::not_found("gone")));
        assert!(pending.try_take().unwrap().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_pending_await() {
        let (completion, pending) = Pending::channel();
        let task = tokio::spawn(pending);
        completion.complete(Ok("done"));
        assert_eq!(task.await.unwrap(), Ok("done"));
    }
}
