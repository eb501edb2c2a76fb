//! Mastermind requests, responses and client
//!
//! Requests are msgpack arrays (struct fields in order), responses are
//! msgpack maps. Unknown keys in group info responses are ignored.

use crate::error::{ProtocolError, Result};
use crate::MASTERMIND_SERVICE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Message-oriented RPC channel to an external service
///
/// One call sends one request payload to `service/method` and blocks for
/// the single response chunk. Deadlines belong to the channel.
pub trait RpcChannel: Send + Sync {
    /// Send `payload` and wait for the response payload
    fn call(&self, service: &str, method: &str, payload: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

/// `get_group_weights` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupWeightsRequest {
    /// Monotonic request stamp
    pub stamp: u64,
}

/// A couple of groups together with its balancer weight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedCouple {
    /// Groups that form the couple
    pub groups: Vec<u32>,
    /// Relative weight, higher means more free space
    pub weight: u64,
}

/// All couples of one size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedGroups {
    /// Number of groups in every couple of this entry
    pub size: u64,
    /// Weighted couples
    pub weighted_groups: Vec<WeightedCouple>,
}

/// `get_group_weights` response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupWeightsResponse {
    /// One entry per couple size
    pub info: Vec<SizedGroups>,
}

type WireWeights = BTreeMap<u64, Vec<(Vec<u32>, u64)>>;

impl GroupWeightsResponse {
    /// Decode a msgpack `{size: [[groups, weight], ..]}` map
    pub fn decode(data: &[u8]) -> Result<Self> {
        let wire: WireWeights = rmp_serde::from_slice(data)?;
        let info = wire
            .into_iter()
            .map(|(size, couples)| SizedGroups {
                size,
                weighted_groups: couples
                    .into_iter()
                    .map(|(groups, weight)| WeightedCouple { groups, weight })
                    .collect(),
            })
            .collect();
        Ok(Self { info })
    }

    /// Encode into the wire map, as the balancer sends it
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire: WireWeights = self
            .info
            .iter()
            .map(|sized| {
                let couples = sized
                    .weighted_groups
                    .iter()
                    .map(|c| (c.groups.clone(), c.weight))
                    .collect();
                (sized.size, couples)
            })
            .collect();
        Ok(rmp_serde::to_vec(&wire)?)
    }
}

/// Group health as reported by the balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStatus {
    /// Status missing or not recognised
    #[default]
    Unknown,
    /// Group is broken and must not receive writes
    Bad,
    /// Group is healthy and belongs to a couple
    Coupled,
}

impl GroupStatus {
    fn from_wire(status: &str) -> Self {
        match status {
            "bad" => Self::Bad,
            "coupled" => Self::Coupled,
            _ => Self::Unknown,
        }
    }

    fn as_wire(&self) -> Option<&'static str> {
        match self {
            Self::Bad => Some("bad"),
            Self::Coupled => Some("coupled"),
            Self::Unknown => None,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct WireGroupInfo {
    #[serde(default)]
    couples: Vec<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

/// `get_group_info` response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfoResponse {
    /// Couples the group is part of
    pub couples: Vec<Vec<u32>>,
    /// Group health
    pub status: GroupStatus,
}

impl GroupInfoResponse {
    /// Decode a msgpack `{"couples": .., "status": ..}` map
    pub fn decode(data: &[u8]) -> Result<Self> {
        let wire: WireGroupInfo = rmp_serde::from_slice(data)?;
        Ok(Self {
            couples: wire.couples,
            status: wire
                .status
                .as_deref()
                .map(GroupStatus::from_wire)
                .unwrap_or_default(),
        })
    }

    /// Encode as a named msgpack map
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireGroupInfo {
            couples: self.couples.clone(),
            status: self.status.as_wire().map(str::to_owned),
        };
        Ok(rmp_serde::to_vec_named(&wire)?)
    }
}

/// Client for the mastermind balancer
pub struct MastermindClient<C> {
    channel: C,
    stamp: AtomicU64,
}

impl<C: RpcChannel> MastermindClient<C> {
    /// Create a client over `channel`
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            stamp: AtomicU64::new(0),
        }
    }

    /// Stamp of the last weights request sent
    pub fn current_stamp(&self) -> u64 {
        self.stamp.load(Ordering::SeqCst)
    }

    fn call(&self, method: &'static str, payload: Vec<u8>) -> Result<Vec<u8>> {
        tracing::debug!("mastermind {} request ({} bytes)", method, payload.len());
        self.channel
            .call(MASTERMIND_SERVICE, method, payload)
            .map_err(|e| ProtocolError::channel(method, e))
    }

    /// Fetch the full weights table
    pub fn group_weights(&self) -> Result<GroupWeightsResponse> {
        let request = GroupWeightsRequest {
            stamp: self.stamp.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let reply = self.call("get_group_weights", rmp_serde::to_vec(&request)?)?;
        GroupWeightsResponse::decode(&reply)
    }

    /// Fetch status and couples of one group
    pub fn group_info(&self, group: u32) -> Result<GroupInfoResponse> {
        let reply = self.call("get_group_info", rmp_serde::to_vec(&group)?)?;
        GroupInfoResponse::decode(&reply)
    }

    /// Fetch every couple the balancer considers symmetric
    pub fn symmetric_groups(&self) -> Result<Vec<Vec<u32>>> {
        let reply = self.call("get_symmetric_groups", rmp_serde::to_vec("")?)?;
        Ok(rmp_serde::from_slice(&reply)?)
    }

    /// Fetch bad groups keyed by group id
    pub fn bad_groups(&self) -> Result<BTreeMap<u32, Vec<u32>>> {
        let reply = self.call("get_bad_groups", rmp_serde::to_vec("")?)?;
        Ok(rmp_serde::from_slice(&reply)?)
    }
}
