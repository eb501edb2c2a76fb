//! Fanout Protocol - integration with the group balancer
//!
//! The balancer ("mastermind") is an external service that knows how full
//! every replica group is. It is reached over a message-oriented RPC channel
//! and speaks msgpack:
//!
//! ```text
//! proxy ── get_group_weights [stamp] ───────► mastermind
//!       ◄─ {size: [[[groups..], weight]..]} ──
//! ```
//!
//! This crate owns the request/response types, their msgpack encoding and a
//! thin client over any [`RpcChannel`]. Caching and group choice live in
//! `fanout-core`.

#![warn(clippy::all)]

pub mod error;
pub mod mastermind;

pub use error::{ProtocolError, Result};
pub use mastermind::{
    GroupInfoResponse, GroupStatus, GroupWeightsRequest, GroupWeightsResponse, MastermindClient,
    RpcChannel, SizedGroups, WeightedCouple,
};

/// Service name the balancer registers under
pub const MASTERMIND_SERVICE: &str = "mastermind";
