//! Normalised per-group results and address formatting

use crate::error::{Error, Result};
use crate::key::{GroupId, RawId};
use crate::transport::LookupEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default address family for remotes
pub const AF_INET: i32 = 2;

/// A storage endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Remote {
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Address family
    #[serde(default = "default_family")]
    pub family: i32,
}

fn default_family() -> i32 {
    AF_INET
}

impl Remote {
    /// Create an IPv4 remote
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            family: AF_INET,
        }
    }
}

impl FromStr for Remote {
    type Err = Error;

    /// Parse `host:port`; the last colon separates the port
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::codec(format!("address without port: {}", s)))?;
        let port = port
            .parse()
            .map_err(|_| Error::codec(format!("bad port in address: {}", s)))?;
        Ok(Remote::new(host, port))
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.family)
    }
}

/// One group's successful answer in normalised form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    /// Group that acknowledged
    pub group: GroupId,
    /// Node host
    pub host: String,
    /// Node port
    pub port: u16,
    /// Download path on the node
    pub path: String,
    /// Status reported by the node
    pub status: i32,
}

/// Turns raw lookup answers into [`LookupResult`]s
///
/// Paths are `/<port - base_port>/<file>:<offset>:<size>` in eblob style,
/// `/<port - base_port>/<dir>/<hex id>` otherwise.
#[derive(Debug, Clone)]
pub struct AddressFormatter {
    base_port: u16,
    directory_bit_num: u32,
    eblob_style_path: bool,
}

impl AddressFormatter {
    /// Create a formatter
    pub fn new(base_port: u16, directory_bit_num: u32, eblob_style_path: bool) -> Self {
        Self {
            base_port,
            directory_bit_num: directory_bit_num.min(32),
            eblob_style_path,
        }
    }

    /// Normalise one answer; fails on error entries and bad addresses
    pub fn parse(&self, entry: &LookupEntry) -> Result<LookupResult> {
        if entry.is_error() {
            return Err(Error::codec(format!(
                "group {} answered with status {}",
                entry.group, entry.status
            )));
        }
        let remote: Remote = entry.address.parse()?;
        let slot = remote.port.saturating_sub(self.base_port);

        let path = if self.eblob_style_path {
            let file = entry
                .path
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(entry.path.as_str());
            format!("/{}/{}:{}:{}", slot, file, entry.offset, entry.size)
        } else {
            format!("/{}/{}/{}", slot, self.directory(&entry.id), entry.id.to_hex())
        };

        Ok(LookupResult {
            group: entry.group,
            host: remote.host,
            port: remote.port,
            path,
            status: entry.status,
        })
    }

    /// Normalise every successful answer, dropping error entries
    pub fn parse_all(&self, entries: &[LookupEntry]) -> Result<Vec<LookupResult>> {
        entries
            .iter()
            .filter(|e| !e.is_error())
            .map(|e| self.parse(e))
            .collect()
    }

    // Leading `directory_bit_num` bits of the id, in hex.
    fn directory(&self, id: &RawId) -> String {
        if self.directory_bit_num == 0 {
            return "0".to_string();
        }
        let mut head = [0u8; 4];
        head.copy_from_slice(&id.as_bytes()[..4]);
        let bits = u32::from_be_bytes(head) >> (32 - self.directory_bit_num);
        format!("{:x}", bits)
    }
}
