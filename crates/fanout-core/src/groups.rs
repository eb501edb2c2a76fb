//! Candidate group selection

use crate::error::{Error, Result};
use crate::key::{GroupId, Key};
use rand::Rng;
use rand::seq::SliceRandom;

/// Resolves the candidate groups of an operation
///
/// Explicit groups win verbatim. Otherwise the configured defaults are used
/// with everything but the first (pinned, preferred) group shuffled.
#[derive(Debug, Clone, Default)]
pub struct GroupSelector {
    defaults: Vec<GroupId>,
}

impl GroupSelector {
    /// Create a selector over the configured default groups
    pub fn new(defaults: Vec<GroupId>) -> Self {
        Self { defaults }
    }

    /// Configured default groups
    pub fn defaults(&self) -> &[GroupId] {
        &self.defaults
    }

    /// Resolve candidates; `limit == 0` means no truncation
    pub fn resolve(&self, key: &Key, explicit: &[GroupId], limit: usize) -> Result<Vec<GroupId>> {
        self.resolve_with(key, explicit, limit, &mut rand::thread_rng())
    }

    /// Same as [`resolve`](Self::resolve) with a caller-supplied random source
    pub fn resolve_with<R: Rng + ?Sized>(
        &self,
        key: &Key,
        explicit: &[GroupId],
        limit: usize,
        rng: &mut R,
    ) -> Result<Vec<GroupId>> {
        let mut groups = if explicit.is_empty() {
            let mut groups = self.defaults.clone();
            if groups.len() > 1 {
                groups[1..].shuffle(rng);
            }
            groups
        } else {
            explicit.to_vec()
        };

        if limit != 0 && limit < groups.len() {
            groups.truncate(limit);
        }

        if groups.is_empty() {
            return Err(Error::configuration(format!(
                "There is no groups for key {}",
                key
            )));
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn key() -> Key {
        Key::remote("k")
    }

    #[test]
    fn test_explicit_groups_verbatim() {
        let selector = GroupSelector::new(vec![1, 2, 3]);
        let groups = selector.resolve(&key(), &[9, 4, 7], 0).unwrap();
        assert_eq!(groups, vec![9, 4, 7]);
    }

    #[test]
    fn test_explicit_groups_truncated() {
        let selector = GroupSelector::new(vec![]);
        let groups = selector.resolve(&key(), &[9, 4, 7], 2).unwrap();
        assert_eq!(groups, vec![9, 4]);
    }

    #[test]
    fn test_empty_is_configuration_error() {
        let selector = GroupSelector::new(vec![]);
        let err = selector.resolve(&key(), &[], 0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_defaults_keep_first_and_members() {
        let selector = GroupSelector::new(vec![10, 20, 30, 40, 50]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let groups = selector.resolve_with(&key(), &[], 0, &mut rng).unwrap();
            assert_eq!(groups[0], 10);
            let mut sorted = groups.clone();
            sorted.sort();
            assert_eq!(sorted, vec![10, 20, 30, 40, 50]);
        }
    }

    #[test]
    fn test_single_default() {
        let selector = GroupSelector::new(vec![5]);
        assert_eq!(selector.resolve(&key(), &[], 3).unwrap(), vec![5]);
    }

    proptest! {
        #[test]
        fn prop_truncation_and_pinned_head(
            m in 2usize..16,
            n_seed in 1usize..16,
            seed in any::<u64>(),
        ) {
            let n = 1 + n_seed % (m - 1);
            let defaults: Vec<GroupId> = (1..=m as GroupId).collect();
            let selector = GroupSelector::new(defaults.clone());
            let mut rng = StdRng::seed_from_u64(seed);

            let groups = selector.resolve_with(&key(), &[], n, &mut rng).unwrap();
            prop_assert_eq!(groups.len(), n);
            prop_assert_eq!(groups[0], defaults[0]);
            for g in &groups {
                prop_assert!(defaults.contains(g));
            }
        }
    }
}
