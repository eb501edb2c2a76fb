//! Object keys and raw identifiers

use crate::transport::StorageSession;
use std::fmt;

/// Replica group identifier
pub type GroupId = u32;

/// Size of a raw routing identifier in bytes
pub const ID_SIZE: usize = 64;

/// Fixed-size routing identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawId([u8; ID_SIZE]);

impl RawId {
    /// Identifier with every byte zero
    pub const MIN: RawId = RawId([0; ID_SIZE]);
    /// Identifier with every byte `0xff`
    pub const MAX: RawId = RawId([0xff; ID_SIZE]);

    /// Wrap raw bytes
    pub fn new(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, `None` unless it is exactly [`ID_SIZE`] long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; ID_SIZE]>::try_from(bytes).ok().map(Self)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Full lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawId({})", self)
    }
}

impl fmt::Display for RawId {
    // Short form, first six bytes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Target {
    Remote(String),
    Id(RawId),
}

/// Object key
///
/// Addresses an object either by remote name or by raw identifier, plus a
/// small integer type tag. Name-to-id resolution belongs to the transport
/// and is idempotent.
///
/// Two keys name the same object when their resolved identifiers and type
/// tags match. Resolution needs a session, so `Eq` and `Ord` here compare
/// the addressing form instead. Batched operations correlate answers on the
/// resolved identifier, and every caller key naming the same object gets
/// its own entry in the result map with the same answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    target: Target,
    kind: i32,
}

impl Key {
    /// Key addressed by remote name
    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            target: Target::Remote(name.into()),
            kind: 0,
        }
    }

    /// Key addressed by raw identifier
    pub fn from_id(id: RawId) -> Self {
        Self {
            target: Target::Id(id),
            kind: 0,
        }
    }

    /// Set the type tag
    pub fn with_kind(mut self, kind: i32) -> Self {
        self.kind = kind;
        self
    }

    /// True when addressed by raw identifier
    pub fn by_id(&self) -> bool {
        matches!(self.target, Target::Id(_))
    }

    /// Remote name, if addressed by name
    pub fn remote_name(&self) -> Option<&str> {
        match &self.target {
            Target::Remote(name) => Some(name),
            Target::Id(_) => None,
        }
    }

    /// Raw identifier, if addressed by id
    pub fn id(&self) -> Option<&RawId> {
        match &self.target {
            Target::Id(id) => Some(id),
            Target::Remote(_) => None,
        }
    }

    /// Type tag
    pub fn kind(&self) -> i32 {
        self.kind
    }

    /// Raw identifier, transforming the name through the session if needed
    pub fn resolve_id(&self, session: &dyn StorageSession) -> RawId {
        match &self.target {
            Target::Id(id) => *id,
            Target::Remote(name) => session.transform(name),
        }
    }

    /// True when both keys name the same object once resolved through
    /// `session`
    pub fn same_object(&self, other: &Key, session: &dyn StorageSession) -> bool {
        self.kind == other.kind && self.resolve_id(session) == other.resolve_id(session)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Remote(name) => f.write_str(name),
            Target::Id(id) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::remote(name)
    }
}

impl From<RawId> for Key {
    fn from(id: RawId) -> Self {
        Key::from_id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addressing_modes() {
        let by_name = Key::remote("photo.jpg").with_kind(3);
        assert!(!by_name.by_id());
        assert_eq!(by_name.remote_name(), Some("photo.jpg"));
        assert_eq!(by_name.kind(), 3);
        assert_eq!(by_name.to_string(), "photo.jpg");

        let by_id = Key::from_id(RawId::MAX);
        assert!(by_id.by_id());
        assert!(by_id.remote_name().is_none());
        assert_eq!(by_id.to_string(), "ffffffffffff");
    }

    #[test]
    fn test_type_tag_distinguishes_keys() {
        assert_ne!(Key::remote("a"), Key::remote("a").with_kind(1));
        assert_eq!(Key::remote("a"), Key::from("a"));
    }

    #[test]
    fn test_same_object_across_forms() {
        use crate::testing::{MemoryCluster, transform};
        use crate::transport::StorageNode;

        let session = MemoryCluster::new(&[1]).session();
        let by_name = Key::remote("obj");
        let by_id = Key::from_id(transform("obj"));

        assert_ne!(by_name, by_id);
        assert!(by_name.same_object(&by_id, session.as_ref()));
        assert!(!by_name.same_object(&by_id.clone().with_kind(2), session.as_ref()));
        assert!(!by_name.same_object(&Key::remote("other"), session.as_ref()));
    }

    #[test]
    fn test_raw_id_from_slice() {
        assert!(RawId::from_slice(&[0u8; 10]).is_none());
        let id = RawId::from_slice(&[7u8; ID_SIZE]).unwrap();
        assert_eq!(id.to_hex().len(), ID_SIZE * 2);
        assert!(RawId::MIN < id && id < RawId::MAX);
    }
}
