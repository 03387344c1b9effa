use bytes::Bytes;
use granary_proto::api::{StreamConfig, StreamState};
use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerState;

const MAGIC: &[u8; 8] = b"GRNSTRM1";

/// A restartable copy of a stream: its configuration, store content
/// and the full state of every consumer
///
/// Encoded as a JSON header followed by the raw store snapshot. The
/// same container serves API snapshot/restore and replication
/// catchup.
#[derive(Debug)]
pub struct StreamSnapshot {
    pub config: StreamConfig,
    pub state: StreamState,
    pub consumers: Vec<ConsumerState>,
    pub store: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    config: StreamConfig,
    state: StreamState,
    consumers: Vec<ConsumerState>,
}

/// An error encountered while decoding a [`StreamSnapshot`]
#[derive(Debug, thiserror::Error)]
#[error("stream snapshot is malformed")]
pub struct SnapshotDecodeError;

impl StreamSnapshot {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let header = serde_json::to_vec(&Header {
            config: self.config.clone(),
            state: self.state.clone(),
            consumers: self.consumers.clone(),
        })
        .expect("stream snapshot header serializes");

        let mut buf = Vec::with_capacity(8 + 4 + header.len() + self.store.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&u32::try_from(header.len()).unwrap_or(u32::MAX).to_le_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.store);
        Bytes::from(buf)
    }

    /// Decode a snapshot previously produced by [`StreamSnapshot::encode`]
    ///
    /// # Errors
    ///
    /// Fails on truncated or malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotDecodeError> {
        let rest = bytes.strip_prefix(MAGIC).ok_or(SnapshotDecodeError)?;
        if rest.len() < 4 {
            return Err(SnapshotDecodeError);
        }
        let header_len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
        if rest.len() < 4 + header_len {
            return Err(SnapshotDecodeError);
        }

        let header = serde_json::from_slice::<Header>(&rest[4..4 + header_len])
            .map_err(|_| SnapshotDecodeError)?;
        Ok(Self {
            config: header.config,
            state: header.state,
            consumers: header.consumers,
            store: Bytes::copy_from_slice(&rest[4 + header_len..]),
        })
    }
}
