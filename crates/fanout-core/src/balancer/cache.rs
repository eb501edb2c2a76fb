//! Group weight snapshot, cache and background refresher

use super::GroupWeightService;
use crate::error::{Error, Result};
use crate::key::GroupId;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use fanout_protocol::GroupWeightsResponse;
use parking_lot::RwLock;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Point-in-time weights: couple size -> weighted couples of that size
///
/// Immutable once built; refreshes replace it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupWeightSnapshot {
    by_size: BTreeMap<usize, Vec<(Vec<GroupId>, u64)>>,
}

impl GroupWeightSnapshot {
    /// Empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a weighted couple; its size is the number of groups in it
    pub fn with_couple(mut self, groups: Vec<GroupId>, weight: u64) -> Self {
        self.by_size
            .entry(groups.len())
            .or_default()
            .push((groups, weight));
        self
    }

    /// Couple sizes present
    pub fn sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_size.keys().copied()
    }

    /// True if the snapshot holds no couples
    pub fn is_empty(&self) -> bool {
        self.by_size.values().all(Vec::is_empty)
    }

    /// Pick one couple of `count` groups, proportionally to weight
    pub fn choose<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Result<Vec<GroupId>> {
        let couples = self
            .by_size
            .get(&count)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::balancer(format!("no couples of {} groups known", count)))?;

        let index = WeightedIndex::new(couples.iter().map(|(_, weight)| *weight))
            .map_err(|e| Error::balancer(format!("bad weights for {} groups: {}", count, e)))?;
        Ok(couples[index.sample(rng)].0.clone())
    }
}

impl From<GroupWeightsResponse> for GroupWeightSnapshot {
    fn from(response: GroupWeightsResponse) -> Self {
        response
            .info
            .into_iter()
            .flat_map(|sized| sized.weighted_groups)
            .fold(Self::new(), |snapshot, couple| {
                snapshot.with_couple(couple.groups, couple.weight)
            })
    }
}

/// Latest successfully fetched weights
///
/// Starts uninitialised; the first successful refresh makes it ready for
/// good. Failed refreshes keep the previous snapshot.
pub struct GroupWeightCache {
    service: Arc<dyn GroupWeightService>,
    snapshot: RwLock<Option<Arc<GroupWeightSnapshot>>>,
}

impl GroupWeightCache {
    /// Create an uninitialised cache
    pub fn new(service: Arc<dyn GroupWeightService>) -> Self {
        Self {
            service,
            snapshot: RwLock::new(None),
        }
    }

    /// True after the first successful refresh
    pub fn is_ready(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// Current snapshot, if any
    pub fn snapshot(&self) -> Option<Arc<GroupWeightSnapshot>> {
        self.snapshot.read().clone()
    }

    /// Fetch and swap in a new snapshot
    pub fn refresh(&self) -> Result<()> {
        let fresh = Arc::new(self.service.fetch_weights()?);
        *self.snapshot.write() = Some(fresh);
        Ok(())
    }

    /// Weighted choice of `count` groups from the latest snapshot
    pub fn choose(&self, count: usize) -> Result<Vec<GroupId>> {
        self.choose_with(count, &mut rand::thread_rng())
    }

    /// [`choose`](Self::choose) with a caller-supplied random source
    pub fn choose_with<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Result<Vec<GroupId>> {
        // Lock released before sampling.
        let snapshot = self
            .snapshot()
            .ok_or_else(|| Error::balancer("group weights were never fetched"))?;
        snapshot.choose(count, rng)
    }
}

/// Background thread refreshing a [`GroupWeightCache`] every period
///
/// Refreshes once immediately. Dropping it (or calling [`shutdown`]) wakes
/// the thread and joins it.
///
/// [`shutdown`]: WeightRefresher::shutdown
pub struct WeightRefresher {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl WeightRefresher {
    /// Start refreshing `cache`
    pub fn spawn(cache: Arc<GroupWeightCache>, period: Duration) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("fanout-weights".into())
            .spawn(move || {
                loop {
                    match cache.refresh() {
                        Ok(()) => tracing::info!("Updated group weights"),
                        Err(e) => tracing::error!("Error while updating cache: {}", e),
                    }
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| Error::balancer(format!("can not start weight refresher: {}", e)))?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("weight refresher thread panicked");
            }
        }
    }
}

impl Drop for WeightRefresher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
