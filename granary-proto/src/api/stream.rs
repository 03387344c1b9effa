use std::{collections::BTreeMap, num::NonZeroU32, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    headers::{HeaderMap, HeaderName, HeaderValue},
    Name, StoredMessage, Subject,
};

use super::{duration, nullable_datetime, nullable_number, option_duration};

/// The configuration of a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: Name,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default, with = "nullable_number")]
    pub max_consumers: Option<u32>,
    #[serde(default, with = "nullable_number", rename = "max_msgs")]
    pub max_messages: Option<u64>,
    #[serde(default, with = "nullable_number")]
    pub max_bytes: Option<u64>,
    #[serde(default, with = "duration")]
    pub max_age: Duration,
    #[serde(default, with = "nullable_number", rename = "max_msgs_per_subject")]
    pub max_messages_per_subject: Option<u64>,
    #[serde(default, with = "nullable_number", rename = "max_msg_size")]
    pub max_message_size: Option<u32>,
    #[serde(default, rename = "discard")]
    pub discard_policy: DiscardPolicy,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default = "default_replicas", rename = "num_replicas")]
    pub replicas: NonZeroU32,
    #[serde(default, with = "duration")]
    pub duplicate_window: Duration,
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<StreamSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<StreamSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
}

fn default_replicas() -> NonZeroU32 {
    NonZeroU32::MIN
}

/// An upstream a stream mirrors or sources from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    pub name: Name,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    #[serde(
        default,
        with = "nullable_datetime",
        skip_serializing_if = "Option::is_none"
    )]
    pub opt_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalStream>,
}

/// Addressing for an upstream living in another account or cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalStream {
    /// The control API prefix the upstream is reachable on
    #[serde(rename = "api")]
    pub api_prefix: Subject,
    /// The subject prefix deliveries are redirected through
    #[serde(rename = "deliver")]
    pub deliver_prefix: Subject,
}

/// A constraint on where replicas of a stream may be placed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A streams retention policy
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    #[serde(rename = "workqueue")]
    WorkQueue,
}

/// A streams discard policy
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

/// Whether the stream is stored on disk or in memory
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    #[default]
    File,
    Memory,
}

/// The state of a stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    #[serde(rename = "first_seq")]
    pub first_sequence: u64,
    #[serde(with = "nullable_datetime", rename = "first_ts", default)]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "last_seq")]
    pub last_sequence: u64,
    #[serde(with = "nullable_datetime", rename = "last_ts", default)]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub num_deleted: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<u64>,
    pub consumer_count: u32,
}

/// Information about a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    pub state: StreamState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<SourceInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceInfo>,
}

/// The placement and health of a replicated group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<PeerInfo>,
}

/// The health of a single peer of a replicated group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub current: bool,
    #[serde(default)]
    pub offline: bool,
    #[serde(with = "duration")]
    pub active: Duration,
    #[serde(default)]
    pub lag: u64,
}

/// The progress of a mirror or source driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: Name,
    pub lag: u64,
    #[serde(with = "duration")]
    pub active: Duration,
}

/// The acknowledgment returned for a committed publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAck {
    pub stream: Name,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// A request to bulk-remove messages from a stream
///
/// `keep` and `sequence` are mutually exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeRequest {
    /// Only purge messages matching this subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Subject>,
    /// Purge messages with a sequence strictly below this one
    #[serde(default, rename = "seq", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Retain the `keep` most recent matching messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub success: bool,
    pub purged: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// A request to fetch a single message from a stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgGetRequest {
    #[serde(default, rename = "seq", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, rename = "last_by_subj", skip_serializing_if = "Option::is_none")]
    pub last_by_subject: Option<Subject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgGetResponse {
    pub message: RawStoredMessage,
}

/// The JSON encoding of a stored message
///
/// The payload travels base64 encoded, headers as a name to values map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStoredMessage {
    pub subject: Subject,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdrs: Option<BTreeMap<String, Vec<String>>>,
    pub data: String,
    pub time: DateTime<Utc>,
}

impl From<StoredMessage> for RawStoredMessage {
    fn from(message: StoredMessage) -> Self {
        let hdrs = if message.headers.is_empty() {
            None
        } else {
            Some(
                message
                    .headers
                    .iter()
                    .map(|(name, values)| {
                        (
                            name.as_str().to_owned(),
                            values.map(|value| value.as_str().to_owned()).collect(),
                        )
                    })
                    .collect(),
            )
        };

        Self {
            subject: message.subject,
            sequence: message.sequence,
            hdrs,
            data: BASE64.encode(&message.payload),
            time: message.timestamp,
        }
    }
}

impl TryFrom<RawStoredMessage> for StoredMessage {
    type Error = RawMessageError;

    fn try_from(raw: RawStoredMessage) -> Result<Self, Self::Error> {
        let mut headers = HeaderMap::new();
        for (name, values) in raw.hdrs.unwrap_or_default() {
            let name = HeaderName::try_from(name).map_err(|_| RawMessageError::Header)?;
            for value in values {
                let value = HeaderValue::try_from(value).map_err(|_| RawMessageError::Header)?;
                headers.append(name.clone(), value);
            }
        }

        Ok(Self {
            sequence: raw.sequence,
            timestamp: raw.time,
            subject: raw.subject,
            headers,
            payload: Bytes::from(BASE64.decode(raw.data).map_err(RawMessageError::Payload)?),
        })
    }
}

/// An error encountered while decoding a [`RawStoredMessage`]
#[derive(Debug, thiserror::Error)]
pub enum RawMessageError {
    #[error("invalid header")]
    Header,
    #[error("invalid base64 payload")]
    Payload(#[source] base64::DecodeError),
}

/// A request to delete a single message from a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgDeleteRequest {
    #[serde(rename = "seq")]
    pub sequence: u64,
}

/// A request for the paginated list of stream names
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamNamesRequest {
    #[serde(default)]
    pub offset: usize,
    /// Only list streams whose subjects overlap this subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamNamesResponse {
    pub streams: Vec<Name>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamListResponse {
    pub streams: Vec<StreamInfo>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// A request to stream a snapshot of a stream to `deliver_subject`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub deliver_subject: Subject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    /// Verify per-message checksums while reading the snapshot
    #[serde(default, rename = "check_msgs")]
    pub check_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub config: StreamConfig,
    pub state: StreamState,
}

/// A request to restore a stream from a previously taken snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub config: StreamConfig,
    pub state: StreamState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub deliver_subject: Subject,
}

/// A request for a group leader to step down
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepdownRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
}

/// A request to remove a peer from a replicated group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRemoveRequest {
    pub peer: String,
}

#[cfg(test)]
mod tests {
    use super::{StreamConfig, StreamState};

    #[test]
    fn minimal_config() {
        let config = serde_json::from_str::<StreamConfig>(
            r#"{"name": "ORDERS", "subjects": ["orders.>"]}"#,
        )
        .unwrap();
        assert_eq!("ORDERS", config.name.as_str());
        assert_eq!(None, config.max_messages);
        assert_eq!(1, config.replicas.get());

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded = serde_json::from_str::<StreamConfig>(&encoded).unwrap();
        assert_eq!(config.subjects, decoded.subjects);
    }

    #[test]
    fn unlimited_is_minus_one() {
        let config = serde_json::from_str::<StreamConfig>(
            r#"{"name": "ORDERS", "max_msgs": -1, "max_bytes": 1024}"#,
        )
        .unwrap();
        assert_eq!(None, config.max_messages);
        assert_eq!(Some(1024), config.max_bytes);
    }

    #[test]
    fn state_timestamp_sentinel() {
        let state = StreamState::default();
        let encoded = serde_json::to_string(&state).unwrap();
        assert!(encoded.contains(r#""first_ts":"0001-01-01T00:00:00Z""#));

        let decoded = serde_json::from_str::<StreamState>(&encoded).unwrap();
        assert_eq!(None, decoded.first_timestamp);
    }
}
