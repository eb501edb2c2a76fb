//! Batched reads and all-or-nothing batched writes
//!
//! Every key of a batch shares the groups resolved for the first key. Raw
//! identifiers are mapped back to the caller's keys through a call-local
//! correlation table.

use crate::container::DataContainer;
use crate::context::{Context, remove_quietly};
use crate::error::{Error, Result};
use crate::key::{GroupId, Key, RawId};
use crate::lookup::LookupResult;
use crate::policy::{ReplicationPolicy, SuccessCopies};
use crate::transport::{IoAttr, StorageSession};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

// Caller keys grouped by the raw id they resolve to. A name key and the id
// key it resolves to, or a repeated key, share one slot.
struct Correlation<'k> {
    keys: &'k [Key],
    by_id: HashMap<RawId, usize>,
    // caller key index -> slot
    slot_of: Vec<usize>,
    // slot -> caller key indices, the first one owns the slot
    members: Vec<Vec<usize>>,
    ios: Vec<IoAttr>,
}

impl<'k> Correlation<'k> {
    fn build(session: &dyn StorageSession, keys: &'k [Key]) -> Self {
        let mut by_id = HashMap::with_capacity(keys.len());
        let mut slot_of = Vec::with_capacity(keys.len());
        let mut members: Vec<Vec<usize>> = Vec::new();
        let mut ios = Vec::with_capacity(keys.len());
        for (index, key) in keys.iter().enumerate() {
            let id = key.resolve_id(session);
            let slot = *by_id.entry(id).or_insert_with(|| {
                members.push(Vec::new());
                members.len() - 1
            });
            members[slot].push(index);
            slot_of.push(slot);
            ios.push(IoAttr::for_id(id, key.kind()));
        }
        Self {
            keys,
            by_id,
            slot_of,
            members,
            ios,
        }
    }

    fn slots(&self) -> usize {
        self.members.len()
    }

    fn slot_for(&self, id: &RawId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    fn owner(&self, slot: usize) -> &'k Key {
        &self.keys[self.members[slot][0]]
    }

    fn keys_in(&self, slot: usize) -> impl Iterator<Item = &'k Key> + '_ {
        let keys = self.keys;
        self.members[slot].iter().map(move |&index| &keys[index])
    }
}

pub(crate) struct BulkOrchestrator<'a> {
    ctx: &'a Context,
}

impl<'a> BulkOrchestrator<'a> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Keys without an answer are absent from the result.
    pub(crate) fn bulk_read(
        &self,
        keys: &[Key],
        cflags: u64,
        groups: &[GroupId],
    ) -> Result<BTreeMap<Key, DataContainer>> {
        let mut out = BTreeMap::new();
        let Some(first) = keys.first() else {
            return Ok(out);
        };

        let groups = self.ctx.selector.resolve(first, groups, 0)?;
        let mut session = self.ctx.session();
        session.set_cflags(cflags);
        session.set_groups(&groups);

        let correlation = Correlation::build(session.as_ref(), keys);
        let entries = session
            .bulk_read(correlation.ios.clone())
            .wait()
            .map_err(|e| {
                tracing::error!("can not bulk get data: {}", e);
                Error::transport("bulk_read", first, e)
            })?;

        for entry in entries {
            if entry.is_error() {
                continue;
            }
            let Some(slot) = correlation.slot_for(&entry.id) else {
                tracing::warn!("bulk read answered for unknown id {}", entry.id);
                continue;
            };
            if out.contains_key(correlation.owner(slot)) {
                continue;
            }
            let container = DataContainer::unpack(entry.data, false)?;
            for key in correlation.keys_in(slot) {
                out.insert(key.clone(), container.clone());
            }
        }
        Ok(out)
    }

    pub(crate) fn bulk_write(
        &self,
        keys: &[Key],
        data: &[DataContainer],
        cflags: u64,
        groups: &[GroupId],
        success_copies: Option<SuccessCopies>,
    ) -> Result<BTreeMap<Key, Vec<LookupResult>>> {
        self.bulk_write_inner(keys, data, cflags, groups, success_copies)
            .inspect_err(|e| tracing::error!("can not bulk write data: {}", e))
    }

    fn bulk_write_inner(
        &self,
        keys: &[Key],
        data: &[DataContainer],
        cflags: u64,
        groups: &[GroupId],
        success_copies: Option<SuccessCopies>,
    ) -> Result<BTreeMap<Key, Vec<LookupResult>>> {
        if keys.len() != data.len() {
            return Err(Error::ArityMismatch {
                operation: "bulk_write",
                keys: keys.len(),
                data: data.len(),
            });
        }
        let Some(first) = keys.first() else {
            return Ok(BTreeMap::new());
        };

        let mut session = self.ctx.session();
        session.set_cflags(cflags);
        self.ctx.check_liveness(session.as_ref(), "bulk_write")?;

        let target = self.ctx.replication_target(groups);
        let policy = ReplicationPolicy::new(self.ctx.success_copies(success_copies), target);
        let groups = self.ctx.selector.resolve(first, groups, 0)?;
        session.set_groups(&groups);

        let mut correlation = Correlation::build(session.as_ref(), keys);
        let payloads: Vec<_> = data.iter().map(DataContainer::pack).collect();
        for (io, payload) in correlation.ios.iter_mut().zip(&payloads) {
            io.size = payload.len() as u64;
        }

        let entries = session
            .bulk_write(correlation.ios.clone(), payloads)
            .wait()
            .map_err(|e| Error::transport("bulk_write", first, e))?;

        // Per object, the groups that accepted it. Repeated answers from one
        // group count once.
        let mut accepted: Vec<BTreeMap<GroupId, LookupResult>> =
            (0..correlation.slots()).map(|_| BTreeMap::new()).collect();
        for entry in entries.iter().filter(|e| !e.is_error()) {
            let Some(slot) = correlation.slot_for(&entry.id) else {
                tracing::warn!("bulk write answered for unknown id {}", entry.id);
                continue;
            };
            if let Entry::Vacant(vacant) = accepted[slot].entry(entry.group) {
                vacant.insert(self.ctx.formatter.parse(entry)?);
            }
        }

        // Keys with no answer at all count as zero copies.
        let short = keys.iter().zip(&correlation.slot_of).find_map(|(key, &slot)| {
            let achieved = accepted[slot].len();
            (!policy.is_met(achieved)).then_some((key, achieved))
        });

        if let Some((key, achieved)) = short {
            for (slot, groups) in accepted.iter().enumerate() {
                if groups.is_empty() {
                    continue;
                }
                let achieved_groups: Vec<GroupId> = groups.keys().copied().collect();
                session.set_groups(&achieved_groups);
                remove_quietly(session.as_mut(), correlation.owner(slot), "bulk write rollback");
            }
            return Err(Error::InsufficientReplicas {
                operation: "bulk_write",
                key: key.to_string(),
                achieved,
                required: policy.required(),
            });
        }

        let mut results = BTreeMap::new();
        for (slot, groups) in accepted.into_iter().enumerate() {
            if groups.is_empty() {
                continue;
            }
            let acks: Vec<LookupResult> = groups.into_values().collect();
            for key in correlation.keys_in(slot) {
                results.insert(key.clone(), acks.clone());
            }
        }
        Ok(results)
    }
}
