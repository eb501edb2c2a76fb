//! Data containers and the packed wire format
//!
//! Without embedded records the packed buffer is the raw data. With
//! embedded records every record is a big-endian header followed by its
//! payload, and the data record comes last:
//!
//! ```text
//! [size:8][type:4][flags:4][payload:size] ... [size:8][type=1:4][flags:4][data]
//! ```

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// Embedded record type carrying the object data
pub const EMBED_DATA: u32 = 1;
/// Embedded record type carrying a timestamp
pub const EMBED_TIMESTAMP: u32 = 2;

const HEADER_SIZE: usize = 16;
const TIMESTAMP_SIZE: usize = 16;

/// Seconds and nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Seconds
    pub tsec: u64,
    /// Nanoseconds
    pub tnsec: u64,
}

impl Timestamp {
    /// Build from parts
    pub fn new(tsec: u64, tnsec: u64) -> Self {
        Self { tsec, tnsec }
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Utc::now().into()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(t: DateTime<Utc>) -> Self {
        Self {
            tsec: t.timestamp().max(0) as u64,
            tnsec: u64::from(t.timestamp_subsec_nanos()),
        }
    }
}

/// Payload plus optional embedded metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataContainer {
    data: Bytes,
    timestamp: Option<Timestamp>,
}

impl DataContainer {
    /// Container without embedded metadata
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            timestamp: None,
        }
    }

    /// Attach an embedded timestamp
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Payload bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume into the payload bytes
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Embedded timestamp, if any
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// True if packing produces embedded records
    pub fn is_embedded(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Serialize into one wire buffer
    pub fn pack(&self) -> Bytes {
        let Some(ts) = self.timestamp else {
            return self.data.clone();
        };

        let mut buf =
            BytesMut::with_capacity(2 * HEADER_SIZE + TIMESTAMP_SIZE + self.data.len());
        put_header(&mut buf, TIMESTAMP_SIZE, EMBED_TIMESTAMP);
        buf.put_u64(ts.tsec);
        buf.put_u64(ts.tnsec);
        put_header(&mut buf, self.data.len(), EMBED_DATA);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse a wire buffer; `embedded` says whether it carries records
    pub fn unpack(buf: Bytes, embedded: bool) -> Result<Self> {
        if !embedded {
            return Ok(Self::new(buf));
        }

        let mut rest = buf;
        let mut container = Self::default();
        while rest.has_remaining() {
            if rest.len() < HEADER_SIZE {
                return Err(Error::codec(format!(
                    "truncated embed header: {} bytes left",
                    rest.len()
                )));
            }
            let size = rest.get_u64() as usize;
            let kind = rest.get_u32();
            let _flags = rest.get_u32();
            if size > rest.len() {
                return Err(Error::codec(format!(
                    "embed of type {} claims {} bytes, {} available",
                    kind,
                    size,
                    rest.len()
                )));
            }
            let mut payload = rest.split_to(size);
            match kind {
                EMBED_DATA => {
                    container.data = payload;
                    break;
                }
                EMBED_TIMESTAMP => {
                    if payload.len() < TIMESTAMP_SIZE {
                        return Err(Error::codec("short timestamp embed"));
                    }
                    let tsec = payload.get_u64();
                    let tnsec = payload.get_u64();
                    container.timestamp = Some(Timestamp::new(tsec, tnsec));
                }
                other => {
                    tracing::debug!("skipping unknown embed type {}", other);
                }
            }
        }
        Ok(container)
    }
}

fn put_header(buf: &mut BytesMut, size: usize, kind: u32) {
    buf.put_u64(size as u64);
    buf.put_u32(kind);
    buf.put_u32(0);
}

impl From<&'static str> for DataContainer {
    fn from(s: &'static str) -> Self {
        Self::new(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for DataContainer {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}
