//! Replicated writes
//!
//! A write resolves its candidate groups, uploads either in one call or as a
//! staged chunked upload, evaluates the success-copies policy and then
//! either records metadata on the surviving groups or rolls the copies back.
//!
//! ```text
//! resolve groups ─┬─ single shot ──────────────────────────┬─ evaluate ─┬─ metadata
//!                 └─ prepare ─► plain* ─► commit ───────────┘            └─ rollback
//! ```
//!
//! During a chunked upload every chunk targets only the groups that
//! acknowledged the previous one, so the upload set shrinks and never grows.

use crate::container::{DataContainer, Timestamp};
use crate::context::{Context, remove_quietly};
use crate::error::{Error, Result};
use crate::key::{GroupId, Key};
use crate::lookup::{AddressFormatter, LookupResult};
use crate::policy::{ReplicationPolicy, SuccessCopies};
use crate::transport::{IoFlags, LookupEntry, Pending, StorageSession, TransportError};
use bytes::Bytes;

/// Per-call write knobs
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Remote offset; chunked uploads slice the payload from here
    pub offset: u64,
    /// Declared total size for explicit prepare/commit calls
    pub size: u64,
    /// Command flags
    pub cflags: u64,
    /// I/O flags; any staged flag disables automatic chunking
    pub ioflags: IoFlags,
    /// Explicit groups; empty means configured defaults
    pub groups: Vec<GroupId>,
    /// Success-copies mode; `None` means the configured default
    pub success_copies: Option<SuccessCopies>,
}

impl WriteOptions {
    /// Target explicit groups
    pub fn with_groups(mut self, groups: Vec<GroupId>) -> Self {
        self.groups = groups;
        self
    }

    /// Override the success-copies mode
    pub fn with_success_copies(mut self, mode: SuccessCopies) -> Self {
        self.success_copies = Some(mode);
        self
    }

    /// Set I/O flags
    pub fn with_ioflags(mut self, ioflags: IoFlags) -> Self {
        self.ioflags = ioflags;
        self
    }

    /// Set the remote offset
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// Tracks which groups hold a complete copy so far
#[derive(Debug)]
pub struct UploadTracker {
    policy: ReplicationPolicy,
    desired: Vec<GroupId>,
    uploaded: Vec<GroupId>,
    results: Vec<LookupResult>,
}

impl UploadTracker {
    /// Start tracking an upload to `desired`
    pub fn new(policy: ReplicationPolicy, desired: Vec<GroupId>) -> Self {
        Self {
            policy,
            desired,
            uploaded: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Replace the upload set with the groups in `results`; keep the results
    /// themselves only when `keep_results` is set (final step)
    pub fn update(&mut self, results: Vec<LookupResult>, keep_results: bool) {
        self.uploaded = results.iter().map(|r| r.group).collect();
        if keep_results {
            self.results = results;
        }
    }

    /// Groups that acknowledged the last step
    pub fn upload_groups(&self) -> &[GroupId] {
        &self.uploaded
    }

    /// Groups the upload was meant for
    pub fn desired_groups(&self) -> &[GroupId] {
        &self.desired
    }

    /// Policy check on the current upload set
    pub fn is_good(&self) -> bool {
        self.policy.is_met(self.uploaded.len())
    }

    /// Desired groups that never completed, sorted
    pub fn incomplete_groups(&self) -> Vec<GroupId> {
        let mut missing: Vec<GroupId> = self
            .desired
            .iter()
            .copied()
            .filter(|g| !self.uploaded.contains(g))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    /// True if some desired group did not complete
    pub fn has_incomplete_groups(&self) -> bool {
        !self.incomplete_groups().is_empty()
    }

    /// Policy this upload is judged by
    pub fn policy(&self) -> &ReplicationPolicy {
        &self.policy
    }

    /// Results of the final step
    pub fn into_results(self) -> Vec<LookupResult> {
        self.results
    }
}

/// Pending single-call write
pub struct AsyncWriteResult {
    pending: Pending<Vec<LookupEntry>>,
    formatter: AddressFormatter,
    key: Key,
}

impl AsyncWriteResult {
    /// Block for every group's result
    pub fn get(self) -> Result<Vec<LookupResult>> {
        let Self {
            pending,
            formatter,
            key,
        } = self;
        finish_write(pending.wait(), &formatter, &key)
    }

    /// Block for the first group's result
    pub fn get_one(self) -> Result<LookupResult> {
        let key = self.key.clone();
        self.get()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::WriteFailed {
                key: key.to_string(),
                reason: "no group acknowledged the write".into(),
            })
    }

    /// Await every group's result
    pub async fn recv(self) -> Result<Vec<LookupResult>> {
        let Self {
            pending,
            formatter,
            key,
        } = self;
        finish_write(pending.await, &formatter, &key)
    }
}

fn finish_write(
    outcome: std::result::Result<Vec<LookupEntry>, TransportError>,
    formatter: &AddressFormatter,
    key: &Key,
) -> Result<Vec<LookupResult>> {
    let entries = outcome.map_err(|e| {
        tracing::error!("Can't write data for key {}: {}", key, e);
        Error::transport("write", key, e)
    })?;
    formatter.parse_all(&entries)
}

// Slice `len` bytes at `offset`, clamped to the payload.
fn slice(content: &Bytes, offset: u64, len: u64) -> Bytes {
    let total = content.len() as u64;
    let start = offset.min(total);
    let end = start.saturating_add(len).min(total);
    content.slice(start as usize..end as usize)
}

/// Drives one logical write across groups
pub(crate) struct WriteOrchestrator<'a> {
    ctx: &'a Context,
}

impl<'a> WriteOrchestrator<'a> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    pub(crate) fn write(
        &self,
        key: &Key,
        data: &DataContainer,
        opts: &WriteOptions,
    ) -> Result<Vec<LookupResult>> {
        self.write_inner(key, data, opts).inspect_err(|e| {
            tracing::error!("Can't write data for key {}: {}", key, e);
        })
    }

    fn write_inner(
        &self,
        key: &Key,
        data: &DataContainer,
        opts: &WriteOptions,
    ) -> Result<Vec<LookupResult>> {
        let mut session = self.ctx.session();
        session.set_cflags(opts.cflags);
        session.set_ioflags(opts.ioflags);
        self.ctx.check_liveness(session.as_ref(), "write")?;

        let target = self.ctx.replication_target(&opts.groups);
        let mode = self.ctx.success_copies(opts.success_copies);
        let groups = self.ctx.write_groups(key, &opts.groups, target, opts.size)?;
        let mut tracker = UploadTracker::new(ReplicationPolicy::new(mode, target), groups.clone());

        session.set_groups(&groups);
        let content = data.pack();

        let chunk_size = self.ctx.config.chunk_size;
        let chunked = chunk_size > 0
            && content.len() > chunk_size
            && !key.by_id()
            && !opts.ioflags.intersects(IoFlags::STAGED);

        if chunked {
            self.upload_chunked(session.as_mut(), key, &content, opts.offset, &mut tracker)?;
        } else {
            self.upload_single(session.as_mut(), key, content, opts, &mut tracker)?;
        }

        if !tracker.is_good() {
            session.set_groups(&groups);
            remove_quietly(session.as_mut(), key, "write rollback");
            return Err(Error::InsufficientReplicas {
                operation: "write",
                key: key.to_string(),
                achieved: tracker.upload_groups().len(),
                required: tracker.policy().required(),
            });
        }

        if chunked && tracker.has_incomplete_groups() {
            let incomplete = tracker.incomplete_groups();
            tracing::warn!(
                "chunked upload of {} did not complete in groups {:?}",
                key,
                incomplete
            );
            session.set_groups(&incomplete);
            remove_quietly(session.as_mut(), key, "write cleanup");
        }

        // Plain metadata record; staged flags must not leak into it.
        session.set_cflags(0);
        session.set_ioflags(IoFlags::NONE);
        let timestamp = data.timestamp().unwrap_or_else(Timestamp::now);
        let remote = key.remote_name().unwrap_or_default().to_string();
        session
            .write_metadata(key, &remote, tracker.upload_groups(), timestamp)
            .wait()
            .map_err(|e| Error::transport("write metadata", key, e))?;
        session.set_cflags(opts.cflags);
        session.set_ioflags(opts.ioflags);

        Ok(tracker.into_results())
    }

    fn upload_single(
        &self,
        session: &mut dyn StorageSession,
        key: &Key,
        content: Bytes,
        opts: &WriteOptions,
        tracker: &mut UploadTracker,
    ) -> Result<()> {
        let pending = issue_single(session, key, content, opts);
        let entries = pending.wait().map_err(|e| write_failed(key, e))?;
        tracker.update(self.ctx.formatter.parse_all(&entries)?, true);
        Ok(())
    }

    fn upload_chunked(
        &self,
        session: &mut dyn StorageSession,
        key: &Key,
        content: &Bytes,
        start: u64,
        tracker: &mut UploadTracker,
    ) -> Result<()> {
        let chunk = self.ctx.config.chunk_size as u64;
        let total = content.len() as u64;
        if start >= total {
            return Err(Error::WriteFailed {
                key: key.to_string(),
                reason: format!("offset {} is beyond payload of {} bytes", start, total),
            });
        }

        let mut offset = start;
        let entries = session
            .write_prepare(key, slice(content, offset, chunk), offset, total)
            .wait()
            .map_err(|e| write_failed(key, e))?;
        tracker.update(self.ctx.formatter.parse_all(&entries)?, false);
        tracing::debug!(
            "prepared {} ({} bytes) in groups {:?}",
            key,
            total,
            tracker.upload_groups()
        );

        if !tracker.is_good() {
            return Ok(());
        }

        loop {
            session.set_groups(tracker.upload_groups());
            // Never step past the end: when prepare already covered the
            // tail, the commit is empty and lands at `total`.
            offset = offset.saturating_add(chunk).min(total);
            let last = offset.saturating_add(chunk) >= total;

            let pending = if last {
                session.write_commit(key, slice(content, offset, total - offset), offset, total)
            } else {
                session.write_plain(key, slice(content, offset, chunk), offset)
            };
            let entries = pending
                .wait()
                .map_err(|e| Error::transport("chunked write", key, e))?;
            tracker.update(self.ctx.formatter.parse_all(&entries)?, last);

            if last || !tracker.is_good() {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn write_async(
        &self,
        key: &Key,
        data: &DataContainer,
        opts: &WriteOptions,
    ) -> Result<AsyncWriteResult> {
        let prepare = || -> Result<Pending<Vec<LookupEntry>>> {
            let mut session = self.ctx.session();
            session.set_cflags(opts.cflags);
            session.set_ioflags(opts.ioflags);
            self.ctx.check_liveness(session.as_ref(), "write_async")?;

            let target = self.ctx.replication_target(&opts.groups);
            let groups = self.ctx.write_groups(key, &opts.groups, target, opts.size)?;
            session.set_groups(&groups);
            Ok(issue_single(session.as_mut(), key, data.pack(), opts))
        };

        let pending = prepare().inspect_err(|e| {
            tracing::error!("Can't write data for key {}: {}", key, e);
        })?;
        Ok(AsyncWriteResult {
            pending,
            formatter: self.ctx.formatter.clone(),
            key: key.clone(),
        })
    }
}

fn issue_single(
    session: &mut dyn StorageSession,
    key: &Key,
    content: Bytes,
    opts: &WriteOptions,
) -> Pending<Vec<LookupEntry>> {
    if opts.ioflags.contains(IoFlags::PREPARE) {
        session.write_prepare(key, content, opts.offset, opts.size)
    } else if opts.ioflags.contains(IoFlags::COMMIT) {
        session.write_commit(key, content, opts.offset, opts.size)
    } else if opts.ioflags.contains(IoFlags::PLAIN_WRITE) {
        session.write_plain(key, content, opts.offset)
    } else {
        session.write_data(key, content, opts.offset)
    }
}

fn write_failed(key: &Key, err: TransportError) -> Error {
    Error::WriteFailed {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(group: GroupId) -> LookupResult {
        LookupResult {
            group,
            host: "h".into(),
            port: 1025,
            path: "/1/f".into(),
            status: 0,
        }
    }

    #[test]
    fn test_tracker_incomplete_groups() {
        let policy = ReplicationPolicy::new(SuccessCopies::Quorum, 3);
        let mut tracker = UploadTracker::new(policy, vec![3, 1, 2]);
        tracker.update(vec![result(1), result(3)], true);

        assert!(tracker.is_good());
        assert_eq!(tracker.incomplete_groups(), vec![2]);
        assert!(tracker.has_incomplete_groups());
        assert_eq!(tracker.into_results().len(), 2);
    }

    #[test]
    fn test_tracker_keeps_results_only_on_final_step() {
        let policy = ReplicationPolicy::new(SuccessCopies::Any, 2);
        let mut tracker = UploadTracker::new(policy, vec![1, 2]);
        tracker.update(vec![result(1), result(2)], false);
        assert_eq!(tracker.upload_groups(), &[1, 2]);
        assert!(!tracker.has_incomplete_groups());
        assert!(tracker.into_results().is_empty());
    }

    #[test]
    fn test_tracker_policy() {
        let policy = ReplicationPolicy::new(SuccessCopies::All, 2);
        let mut tracker = UploadTracker::new(policy, vec![1, 2]);
        tracker.update(vec![result(1)], true);
        assert!(!tracker.is_good());
    }

    #[test]
    fn test_slice_clamps() {
        let content = Bytes::from_static(b"0123456789");
        assert_eq!(slice(&content, 2, 3), Bytes::from_static(b"234"));
        assert_eq!(slice(&content, 8, 5), Bytes::from_static(b"89"));
        assert!(slice(&content, 12, 5).is_empty());
    }
}
