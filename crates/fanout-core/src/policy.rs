//! Success-copies policy
//!
//! | mode        | required copies          | satisfied when            |
//! |-------------|--------------------------|---------------------------|
//! | `Any`       | 1                        | achieved >= 1             |
//! | `Quorum`    | target / 2 + 1           | achieved >= required      |
//! | `All`       | target                   | achieved == target        |
//! | `Explicit`  | n                        | achieved >= n             |
//!
//! A target of zero degenerates: `All` is trivially satisfied. Callers must
//! not pass a zero target when they mean "all copies".

use serde::{Deserialize, Serialize};

/// How many successful copies make a write acceptable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SuccessCopies {
    /// At least one copy
    Any,
    /// A strict majority of the replication target
    #[default]
    Quorum,
    /// Exactly the replication target
    All,
    /// A literal number of copies
    Explicit(usize),
}

impl SuccessCopies {
    /// Legacy numeric code for `Any`
    pub const ANY_CODE: i32 = -1;
    /// Legacy numeric code for `Quorum`
    pub const QUORUM_CODE: i32 = -2;
    /// Legacy numeric code for `All`
    pub const ALL_CODE: i32 = -3;

    /// Decode the legacy integer form; `0` and unknown negatives mean
    /// "use the process default"
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            Self::ANY_CODE => Some(Self::Any),
            Self::QUORUM_CODE => Some(Self::Quorum),
            Self::ALL_CODE => Some(Self::All),
            n if n > 0 => Some(Self::Explicit(n as usize)),
            _ => None,
        }
    }

    /// Minimum number of copies for `target` replicas
    pub fn required_count(self, target: usize) -> usize {
        match self {
            Self::Any => 1,
            Self::Quorum => target / 2 + 1,
            Self::All => target,
            Self::Explicit(n) => n,
        }
    }

    /// Whether `achieved` copies are acceptable for `target` replicas
    pub fn is_satisfied(self, target: usize, achieved: usize) -> bool {
        match self {
            Self::All => target == 0 || achieved == target,
            _ => achieved >= self.required_count(target),
        }
    }
}

/// Minimum copies required by `mode` for `target` replicas
pub fn required_count(mode: SuccessCopies, target: usize) -> usize {
    mode.required_count(target)
}

/// Whether `achieved` copies satisfy `mode` for `target` replicas
pub fn is_satisfied(mode: SuccessCopies, target: usize, achieved: usize) -> bool {
    mode.is_satisfied(target, achieved)
}

/// A mode bound to a replication target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationPolicy {
    mode: SuccessCopies,
    target: usize,
}

impl ReplicationPolicy {
    /// Bind `mode` to `target`
    pub fn new(mode: SuccessCopies, target: usize) -> Self {
        Self { mode, target }
    }

    /// Success-copies mode
    pub fn mode(&self) -> SuccessCopies {
        self.mode
    }

    /// Replication target
    pub fn target(&self) -> usize {
        self.target
    }

    /// Minimum acceptable copies
    pub fn required(&self) -> usize {
        self.mode.required_count(self.target)
    }

    /// Whether `achieved` copies are acceptable
    pub fn is_met(&self, achieved: usize) -> bool {
        self.mode.is_satisfied(self.target, achieved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_boundaries() {
        assert_eq!(required_count(SuccessCopies::Quorum, 1), 1);
        assert_eq!(required_count(SuccessCopies::Quorum, 2), 2);
        assert_eq!(required_count(SuccessCopies::Quorum, 3), 2);
        assert_eq!(required_count(SuccessCopies::Quorum, 0), 1);
        assert_eq!(required_count(SuccessCopies::Any, 0), 1);
        assert_eq!(required_count(SuccessCopies::All, 0), 0);
        assert!(is_satisfied(SuccessCopies::All, 0, 0));
        assert!(!is_satisfied(SuccessCopies::All, 2, 1));
        assert!(is_satisfied(SuccessCopies::All, 2, 2));
        assert!(!is_satisfied(SuccessCopies::Any, 3, 0));
        assert!(is_satisfied(SuccessCopies::Explicit(2), 5, 2));
        assert!(!is_satisfied(SuccessCopies::Explicit(2), 5, 1));
    }

    #[test]
    fn test_from_code() {
        assert_eq!(SuccessCopies::from_code(0), None);
        assert_eq!(SuccessCopies::from_code(-1), Some(SuccessCopies::Any));
        assert_eq!(SuccessCopies::from_code(-2), Some(SuccessCopies::Quorum));
        assert_eq!(SuccessCopies::from_code(-3), Some(SuccessCopies::All));
        assert_eq!(SuccessCopies::from_code(4), Some(SuccessCopies::Explicit(4)));
        assert_eq!(SuccessCopies::from_code(-9), None);
    }

    #[test]
    fn test_serde_names() {
        let mode: SuccessCopies = serde_json::from_str("\"quorum\"").unwrap();
        assert_eq!(mode, SuccessCopies::Quorum);
        let mode: SuccessCopies = serde_json::from_str("{\"explicit\":3}").unwrap();
        assert_eq!(mode, SuccessCopies::Explicit(3));
    }

    fn mode_strategy() -> impl Strategy<Value = SuccessCopies> {
        prop_oneof![
            Just(SuccessCopies::Any),
            Just(SuccessCopies::Quorum),
            Just(SuccessCopies::All),
            (0usize..8).prop_map(SuccessCopies::Explicit),
        ]
    }

    proptest! {
        #[test]
        fn prop_closed_form(mode in mode_strategy(), target in 0usize..16, achieved in 0usize..16) {
            let expected = match mode {
                SuccessCopies::Any => achieved >= 1,
                SuccessCopies::Quorum => achieved >= target / 2 + 1,
                SuccessCopies::All => target == 0 || achieved == target,
                SuccessCopies::Explicit(n) => achieved >= n,
            };
            prop_assert_eq!(is_satisfied(mode, target, achieved), expected);
            prop_assert_eq!(ReplicationPolicy::new(mode, target).is_met(achieved), expected);
        }
    }
}
