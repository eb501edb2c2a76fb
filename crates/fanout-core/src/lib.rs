//! Fanout Core - replication-aware proxy for group-replicated object storage
//!
//! The proxy sits in front of a cluster made of independent replica groups
//! and offers one logical API over it:
//! - Group selection (explicit, configured defaults, or balancer weighted)
//! - Replicated writes with a success-copies policy (any/quorum/all/N)
//! - Staged chunked uploads (prepare -> plain* -> commit) for large payloads
//! - Rollback of partially written copies
//! - Reads, latest reads, range scans, bulk reads and all-or-nothing bulk writes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                   Proxy                      │
//! │  (lookup, read, write, remove, bulk, exec)  │
//! └──────┬─────────────┬──────────────┬─────────┘
//!        │             │              │
//! ┌──────┴─────┐ ┌─────┴──────┐ ┌─────┴───────┐
//! │   Write    │ │    Read    │ │    Bulk     │
//! │orchestrator│ │orchestrator│ │orchestrator │
//! └──────┬─────┘ └─────┬──────┘ └─────┬───────┘
//!        │   GroupSelector / ReplicationPolicy / GroupWeightCache
//! ┌──────┴─────────────┴──────────────┴─────────┐
//! │        StorageNode / StorageSession          │
//! │            (transport, external)             │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "balancer")]
pub mod balancer;
pub mod bulk;
pub mod config;
pub mod container;
mod context;
pub mod error;
pub mod groups;
pub mod key;
pub mod lookup;
pub mod policy;
pub mod proxy;
pub mod read;
pub mod status;
pub mod testing;
pub mod transport;
pub mod write;

pub use config::{BalancerConfig, BalancerUsage, ProxyConfig};
pub use container::{DataContainer, Timestamp};
pub use error::{Error, Result};
pub use groups::GroupSelector;
pub use key::{GroupId, Key, RawId};
pub use lookup::{AddressFormatter, LookupResult, Remote};
pub use policy::{ReplicationPolicy, SuccessCopies};
pub use proxy::Proxy;
pub use read::{RangeOptions, RangeOutcome, ReadOptions};
pub use transport::{IoFlags, Pending, StorageNode, StorageSession, TransportError};
pub use write::WriteOptions;
