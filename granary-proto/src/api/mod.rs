//! JSON bodies of the control API
//!
//! Every request and reply on the `$API` subject namespace is encoded
//! as JSON with these types. Numeric limits use `-1` for "unlimited",
//! durations travel as nanoseconds and optional timestamps use the
//! year-1 sentinel, matching the wire conventions of the rest of the
//! ecosystem.

pub use self::account::{AccountInfo, AccountLimits, ApiStats};
pub use self::consumer::{
    AckPolicy, ConsumerConfig, ConsumerCreateRequest, ConsumerDurability, ConsumerInfo,
    ConsumerListResponse, ConsumerNamesResponse, ConsumerSpecificConfig, ConsumerStorage,
    DeliverPolicy, PullRequest, ReplayPolicy, SequenceInfo,
};
pub use self::stream::{
    ClusterInfo, DiscardPolicy, ExternalStream, MsgDeleteRequest, MsgGetRequest, MsgGetResponse,
    PeerInfo, PeerRemoveRequest, Placement, PubAck, PurgeRequest, PurgeResponse, RawMessageError,
    RawStoredMessage, RestoreRequest, RestoreResponse, RetentionPolicy, SnapshotRequest,
    SnapshotResponse, SourceInfo, StepdownRequest, Storage, StreamConfig, StreamInfo,
    StreamListResponse, StreamNamesRequest, StreamNamesResponse, StreamSource, StreamState,
    SuccessResponse,
};

mod account;
mod consumer;
mod stream;

pub(crate) mod nullable_number {
    use std::{any::type_name, fmt::Display};

    use serde::{
        de::{self, DeserializeOwned},
        ser, Deserialize, Deserializer, Serialize, Serializer,
    };

    pub(crate) trait NullableNumber: Copy + Display {
        const NULL_VALUE: Self::SignedValue;
        type SignedValue: Copy
            + TryFrom<Self>
            + TryInto<Self>
            + Display
            + Eq
            + Serialize
            + DeserializeOwned;
    }

    impl NullableNumber for u32 {
        const NULL_VALUE: Self::SignedValue = -1;
        type SignedValue = i32;
    }

    impl NullableNumber for u64 {
        const NULL_VALUE: Self::SignedValue = -1;
        type SignedValue = i64;
    }

    #[expect(clippy::ref_option)]
    pub(crate) fn serialize<S, N>(num: &Option<N>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        N: NullableNumber,
    {
        match *num {
            Some(num) => num.try_into().map_err(|_| {
                ser::Error::custom(format!(
                    "{num} can't be converted to {}",
                    type_name::<N::SignedValue>()
                ))
            })?,
            None => N::NULL_VALUE,
        }
        .serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>, N: NullableNumber>(
        deserializer: D,
    ) -> Result<Option<N>, D::Error> {
        let num = N::SignedValue::deserialize(deserializer)?;
        Ok(if num == N::NULL_VALUE {
            None
        } else {
            Some(num.try_into().map_err(|_| {
                de::Error::custom(format!("{num} can't be converted to {}", type_name::<N>()))
            })?)
        })
    }
}

pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(crate) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_nanos().serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

pub(crate) mod option_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[expect(clippy::ref_option)]
    pub(crate) fn serialize<S>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|duration| duration.as_nanos()).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let nanos = <Option<u64>>::deserialize(deserializer)?;
        Ok(nanos.map(Duration::from_nanos))
    }
}

pub(crate) mod nullable_datetime {
    use chrono::{DateTime, Datelike, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[expect(clippy::ref_option)]
    pub(crate) fn serialize<S>(
        datetime: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match datetime {
            Some(datetime) => datetime.serialize(serializer),
            None => Utc
                .with_ymd_and_hms(1, 1, 1, 0, 0, 0)
                .unwrap()
                .serialize(serializer),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let datetime = <DateTime<Utc>>::deserialize(deserializer)?;
        Ok(if datetime.year() == 1 {
            None
        } else {
            Some(datetime)
        })
    }
}
