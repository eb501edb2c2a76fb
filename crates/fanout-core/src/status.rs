//! Normalised node statistics

use crate::key::RawId;
use crate::transport::NodeStat;
use serde::Serialize;

const MIB: u64 = 1024 * 1024;

/// One node's status as reported by `stat_log`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResult {
    /// Node address as `host:port`
    pub addr: String,
    /// Node id in hex, empty if unknown
    pub id: String,
    /// Load averages (1, 5, 15 minutes)
    pub la: [f32; 3],
    /// Total memory
    pub vm_total: u64,
    /// Free memory
    pub vm_free: u64,
    /// Cached memory
    pub vm_cached: u64,
    /// Filesystem size in MiB
    pub storage_size: u64,
    /// Available space in MiB
    pub available_size: u64,
    /// Inode count
    pub files: u64,
    /// Filesystem id
    pub fsid: u64,
}

impl From<&NodeStat> for StatusResult {
    fn from(stat: &NodeStat) -> Self {
        Self {
            addr: stat.address.clone(),
            id: stat.id.as_ref().map(RawId::to_hex).unwrap_or_default(),
            la: stat.la.map(|v| v as f32 / 100.0),
            vm_total: stat.vm_total,
            vm_free: stat.vm_free,
            vm_cached: stat.vm_cached,
            storage_size: stat.frsize.saturating_mul(stat.blocks) / MIB,
            available_size: stat.bavail.saturating_mul(stat.bsize) / MIB,
            files: stat.files,
            fsid: stat.fsid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_node_stat() {
        let stat = NodeStat {
            address: "10.0.0.1:1025".into(),
            id: None,
            la: [150, 75, 5],
            frsize: 4096,
            blocks: 512,
            bavail: 256,
            bsize: 4096,
            ..Default::default()
        };
        let status = StatusResult::from(&stat);
        assert_eq!(status.la, [1.5, 0.75, 0.05]);
        assert_eq!(status.storage_size, 2);
        assert_eq!(status.available_size, 1);
        assert!(status.id.is_empty());
    }
}
