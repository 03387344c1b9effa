use std::{
    num::{NonZeroU32, NonZeroU64},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{Name, Subject};

use super::{duration, nullable_number, option_duration};

/// The configuration of a consumer
///
/// The wire encoding flattens the pull/push split and the durability
/// split into optional fields; [`RawConsumerConfig`] is the direct
/// mapping and the `Serialize`/`Deserialize` implementations convert
/// between the two.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durability: ConsumerDurability,
    pub name: Name,
    pub description: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    pub max_deliver: Option<u32>,
    pub filter_subject: Option<Subject>,
    pub replay_policy: ReplayPolicy,
    /// Push only, bits per second
    pub rate_limit: Option<NonZeroU64>,
    /// Push only
    pub flow_control: bool,
    /// Push only
    pub idle_heartbeat: Duration,

    pub specs: ConsumerSpecificConfig,

    pub inactive_threshold: Duration,
    pub replicas: Option<NonZeroU32>,
    pub storage: ConsumerStorage,
}

/// Pull or Push configuration parameters for a consumer
#[derive(Debug, Clone)]
pub enum ConsumerSpecificConfig {
    Pull {
        /// Bound on the number of concurrently waiting pull requests
        max_waiting: Option<u32>,
        max_request_batch: Option<u32>,
        max_request_expires: Duration,
    },
    Push {
        deliver_subject: Subject,
        deliver_group: Option<Name>,
    },
}

/// The durability of the consumer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConsumerDurability {
    Ephemeral,
    Durable,
}

/// The delivery policy of the consumer
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "deliver_policy")]
pub enum DeliverPolicy {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "last")]
    Last,
    #[serde(rename = "last_per_subject")]
    LastPerSubject,
    #[serde(rename = "new")]
    New,
    #[serde(rename = "by_start_sequence")]
    StartSequence {
        #[serde(rename = "opt_start_seq")]
        sequence: u64,
    },
    #[serde(rename = "by_start_time")]
    StartTime {
        #[serde(rename = "opt_start_time")]
        from: DateTime<Utc>,
    },
}

/// The acknowledgment policy of the consumer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack_policy", rename_all = "lowercase")]
pub enum AckPolicy {
    Explicit {
        #[serde(rename = "ack_wait", with = "duration")]
        wait: Duration,
        #[serde(
            rename = "max_ack_pending",
            default,
            with = "nullable_number",
            skip_serializing_if = "Option::is_none"
        )]
        max_pending: Option<u32>,
    },
    All {
        #[serde(rename = "ack_wait", with = "duration")]
        wait: Duration,
    },
    None,
}

impl AckPolicy {
    /// The ack wait before an unacknowledged delivery is redelivered
    #[must_use]
    pub fn wait(&self) -> Option<Duration> {
        match self {
            Self::Explicit { wait, .. } | Self::All { wait } => Some(*wait),
            Self::None => None,
        }
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::None
    }
}

/// The replay policy of the consumer
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Whether the consumer state is kept on disk or in memory
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ConsumerStorage {
    #[default]
    Disk,
    Memory,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<Name>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    durable_name: Option<Name>,
    #[serde(default)]
    description: String,

    #[serde(flatten)]
    deliver_policy: DeliverPolicy,

    #[serde(flatten)]
    ack_policy: AckPolicy,

    #[serde(default, with = "nullable_number", skip_serializing_if = "Option::is_none")]
    max_deliver: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter_subject: Option<Subject>,
    #[serde(default)]
    replay_policy: ReplayPolicy,

    #[serde(default, rename = "rate_limit_bps", skip_serializing_if = "Option::is_none")]
    rate_limit: Option<NonZeroU64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    flow_control: bool,
    #[serde(default, with = "duration", skip_serializing_if = "Duration::is_zero")]
    idle_heartbeat: Duration,

    // Pull based options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_waiting: Option<u32>,
    #[serde(default, rename = "max_batch", skip_serializing_if = "Option::is_none")]
    max_request_batch: Option<u32>,
    #[serde(
        default,
        rename = "max_expires",
        with = "duration",
        skip_serializing_if = "Duration::is_zero"
    )]
    max_request_expires: Duration,

    // Push based consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deliver_subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deliver_group: Option<Name>,

    #[serde(default, with = "duration", skip_serializing_if = "Duration::is_zero")]
    inactive_threshold: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "num_replicas")]
    replicas: Option<NonZeroU32>,
    #[serde(default, rename = "mem_storage", skip_serializing_if = "std::ops::Not::not")]
    mem_storage: bool,
}

impl Serialize for ConsumerConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (name, durable_name) = match self.durability {
            ConsumerDurability::Ephemeral => (Some(self.name.clone()), None),
            ConsumerDurability::Durable => (Some(self.name.clone()), Some(self.name.clone())),
        };

        let (
            max_waiting,
            max_request_batch,
            max_request_expires,
            deliver_subject,
            deliver_group,
        ) = match &self.specs {
            ConsumerSpecificConfig::Pull {
                max_waiting,
                max_request_batch,
                max_request_expires,
            } => (
                *max_waiting,
                *max_request_batch,
                *max_request_expires,
                None,
                None,
            ),
            ConsumerSpecificConfig::Push {
                deliver_subject,
                deliver_group,
            } => (
                None,
                None,
                Duration::ZERO,
                Some(deliver_subject.clone()),
                deliver_group.clone(),
            ),
        };

        RawConsumerConfig {
            name,
            durable_name,
            description: self.description.clone(),

            deliver_policy: self.deliver_policy,
            ack_policy: self.ack_policy,
            max_deliver: self.max_deliver,
            filter_subject: self.filter_subject.clone(),
            replay_policy: self.replay_policy,
            rate_limit: self.rate_limit,
            flow_control: self.flow_control,
            idle_heartbeat: self.idle_heartbeat,

            max_waiting,
            max_request_batch,
            max_request_expires,

            deliver_subject,
            deliver_group,

            inactive_threshold: self.inactive_threshold,
            replicas: self.replicas,
            mem_storage: matches!(self.storage, ConsumerStorage::Memory),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConsumerConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawConsumerConfig::deserialize(deserializer)?;

        let (durability, name) = match (raw.durable_name, raw.name) {
            (Some(durable_name), _) => (ConsumerDurability::Durable, durable_name),
            (None, Some(name)) => (ConsumerDurability::Ephemeral, name),
            (None, None) => {
                return Err(de::Error::custom(
                    "consumer neither has a name or a durable name",
                ))
            }
        };

        let specs = match raw.deliver_subject {
            Some(deliver_subject) => ConsumerSpecificConfig::Push {
                deliver_subject,
                deliver_group: raw.deliver_group,
            },
            None => ConsumerSpecificConfig::Pull {
                max_waiting: raw.max_waiting,
                max_request_batch: raw.max_request_batch,
                max_request_expires: raw.max_request_expires,
            },
        };

        Ok(Self {
            durability,
            name,
            description: raw.description,
            deliver_policy: raw.deliver_policy,
            ack_policy: raw.ack_policy,
            max_deliver: raw.max_deliver,
            filter_subject: raw.filter_subject,
            replay_policy: raw.replay_policy,
            rate_limit: raw.rate_limit,
            flow_control: raw.flow_control,
            idle_heartbeat: raw.idle_heartbeat,

            specs,

            inactive_threshold: raw.inactive_threshold,
            replicas: raw.replicas,
            storage: if raw.mem_storage {
                ConsumerStorage::Memory
            } else {
                ConsumerStorage::Disk
            },
        })
    }
}

/// A delivered/acknowledged position of a consumer over its stream
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

/// Information about a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: Name,
    pub name: Name,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    pub config: ConsumerConfig,
    pub delivered: SequenceInfo,
    pub ack_floor: SequenceInfo,
    pub num_ack_pending: u64,
    pub num_redelivered: u64,
    pub num_waiting: u64,
    pub num_pending: u64,
}

/// A request for the next batch of messages of a pull consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(default = "default_batch")]
    pub batch: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_wait: bool,
    #[serde(
        default,
        with = "option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

fn default_batch() -> u64 {
    1
}

impl Default for PullRequest {
    fn default() -> Self {
        Self {
            batch: 1,
            no_wait: false,
            expires: None,
            max_bytes: None,
        }
    }
}

/// A request to create a consumer under a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerCreateRequest {
    pub stream_name: Name,
    pub config: ConsumerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerNamesResponse {
    pub consumers: Vec<Name>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerListResponse {
    pub consumers: Vec<ConsumerInfo>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use claims::assert_matches;

    use super::{AckPolicy, ConsumerConfig, ConsumerDurability, ConsumerSpecificConfig};

    #[test]
    fn durable_pull() {
        let config = serde_json::from_str::<ConsumerConfig>(
            r#"{
                "durable_name": "dispatcher",
                "ack_policy": "explicit",
                "ack_wait": 30000000000,
                "max_ack_pending": 512,
                "deliver_policy": "all",
                "max_waiting": 128
            }"#,
        )
        .unwrap();

        assert_eq!(ConsumerDurability::Durable, config.durability);
        assert_eq!("dispatcher", config.name.as_str());
        assert_matches!(
            config.ack_policy,
            AckPolicy::Explicit { wait, max_pending: Some(512) }
                if wait == Duration::from_secs(30)
        );
        assert_matches!(
            config.specs,
            ConsumerSpecificConfig::Pull { max_waiting: Some(128), .. }
        );

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded = serde_json::from_str::<ConsumerConfig>(&encoded).unwrap();
        assert_eq!(config.name, decoded.name);
        assert_eq!(ConsumerDurability::Durable, decoded.durability);
    }

    #[test]
    fn ephemeral_push() {
        let config = serde_json::from_str::<ConsumerConfig>(
            r#"{
                "name": "watcher",
                "ack_policy": "none",
                "deliver_policy": "new",
                "deliver_subject": "updates.watcher",
                "idle_heartbeat": 5000000000
            }"#,
        )
        .unwrap();

        assert_eq!(ConsumerDurability::Ephemeral, config.durability);
        assert_matches!(config.ack_policy, AckPolicy::None);
        assert_matches!(
            &config.specs,
            ConsumerSpecificConfig::Push { deliver_subject, deliver_group: None }
                if deliver_subject.as_str() == "updates.watcher"
        );
        assert_eq!(Duration::from_secs(5), config.idle_heartbeat);
    }

    #[test]
    fn nameless_is_rejected() {
        serde_json::from_str::<ConsumerConfig>(r#"{"ack_policy": "none", "deliver_policy": "all"}"#)
            .unwrap_err();
    }
}
