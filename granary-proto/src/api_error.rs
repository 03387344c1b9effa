use serde::{Deserialize, Serialize};

use crate::StatusCode;

/// An error returned by the control API
///
/// Every failed API request carries an `ApiError` with a `StatusCode`,
/// a stable numeric error code and a human readable description. A
/// response carries either a result object or an error, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{description}")]
pub struct ApiError {
    #[serde(rename = "code")]
    pub status: StatusCode,
    #[serde(rename = "err_code")]
    pub code: ErrorCode,
    pub description: String,
}

/// The stable numeric code identifying an [`ApiError`]
///
/// Codes are never renumbered. Descriptions may be reworded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(u16);

impl ErrorCode {
    pub const BAD_REQUEST: Self = Self(10003);
    pub const NOT_ENABLED_FOR_ACCOUNT: Self = Self(10039);

    // Validation
    pub const INVALID_NAME: Self = Self(10049);
    pub const INVALID_SUBJECT: Self = Self(10050);
    pub const SUBJECTS_OVERLAP: Self = Self(10065);
    pub const DESCRIPTION_TOO_LONG: Self = Self(10093);
    pub const NAME_MISMATCH: Self = Self(10056);
    pub const CONFIG_INVALID: Self = Self(10052);

    // Capacity
    pub const MAXIMUM_STREAMS: Self = Self(10027);
    pub const MAXIMUM_CONSUMERS: Self = Self(10026);
    pub const MAXIMUM_MESSAGES: Self = Self(10077);
    pub const MAXIMUM_BYTES: Self = Self(10078);
    pub const MESSAGE_SIZE: Self = Self(10054);
    pub const INSUFFICIENT_RESOURCES: Self = Self(10023);

    // State
    pub const STREAM_NOT_FOUND: Self = Self(10059);
    pub const STREAM_NAME_IN_USE: Self = Self(10058);
    pub const STREAM_MESSAGE_NOT_FOUND: Self = Self(10037);
    pub const WRONG_LAST_SEQUENCE: Self = Self(10071);
    pub const WRONG_LAST_MESSAGE_ID: Self = Self(10070);
    pub const EXPECTED_STREAM_MISMATCH: Self = Self(10060);
    pub const CONSUMER_NOT_FOUND: Self = Self(10014);
    pub const CONSUMER_NAME_IN_USE: Self = Self(10148);
    pub const COULD_NOT_CREATE_CONSUMER: Self = Self(10012);
    pub const SEALED: Self = Self(10109);

    // Availability
    pub const SYSTEM_UNAVAILABLE: Self = Self(10008);
    pub const NOT_LEADER: Self = Self(10038);
    pub const TIMEOUT: Self = Self(10075);
    pub const PEER_NOT_MEMBER: Self = Self(10005);
    pub const SERVER_NOT_MEMBER: Self = Self(10044);

    // Policy
    pub const WORK_QUEUE_OVERLAP: Self = Self(10138);
    pub const WORK_QUEUE_REQUIRES_EXPLICIT_ACK: Self = Self(10090);
    pub const INVALID_DELIVER_SUBJECT: Self = Self(10081);
    pub const EPHEMERAL_WITH_DURABLE_NAME: Self = Self(10091);
    pub const PUSH_CONSUMER_REQUIRES_INTEREST: Self = Self(10084);
    pub const MIRROR_WITH_SUBJECTS: Self = Self(10034);
    pub const MIRROR_WITH_DIRECT_PUBLISH: Self = Self(10036);
    pub const EXTERNAL_PREFIX_OVERLAPS: Self = Self(10022);
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.0
    }
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            status,
            code,
            description: description.into(),
        }
    }

    #[must_use]
    pub fn bad_request(description: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, ErrorCode::BAD_REQUEST, description)
    }

    #[must_use]
    pub fn stream_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::STREAM_NOT_FOUND,
            "stream not found",
        )
    }

    #[must_use]
    pub fn stream_name_in_use() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::STREAM_NAME_IN_USE,
            "stream name already in use",
        )
    }

    #[must_use]
    pub fn consumer_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::CONSUMER_NOT_FOUND,
            "consumer not found",
        )
    }

    #[must_use]
    pub fn message_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::STREAM_MESSAGE_NOT_FOUND,
            "no message found",
        )
    }

    #[must_use]
    pub fn maximum_messages_exceeded() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::MAXIMUM_MESSAGES,
            "maximum messages exceeded",
        )
    }

    #[must_use]
    pub fn maximum_bytes_exceeded() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::MAXIMUM_BYTES,
            "maximum bytes exceeded",
        )
    }

    #[must_use]
    pub fn maximum_messages_per_subject_exceeded() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::MAXIMUM_MESSAGES,
            "maximum messages per subject exceeded",
        )
    }

    #[must_use]
    pub fn message_size_exceeds_maximum() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::MESSAGE_SIZE,
            "message size exceeds maximum allowed",
        )
    }

    #[must_use]
    pub fn insufficient_resources() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::INSUFFICIENT_RESOURCES,
            "insufficient storage resources available",
        )
    }

    #[must_use]
    pub fn maximum_streams_reached() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::MAXIMUM_STREAMS,
            "maximum number of streams reached",
        )
    }

    #[must_use]
    pub fn maximum_consumers_reached() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::MAXIMUM_CONSUMERS,
            "maximum consumers limit reached",
        )
    }

    #[must_use]
    pub fn wrong_last_sequence(current: u64) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::WRONG_LAST_SEQUENCE,
            format!("wrong last sequence: {current}"),
        )
    }

    #[must_use]
    pub fn wrong_last_message_id(current: &str) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::WRONG_LAST_MESSAGE_ID,
            format!("wrong last msg ID: {current}"),
        )
    }

    #[must_use]
    pub fn expected_stream_mismatch() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::EXPECTED_STREAM_MISMATCH,
            "expected stream does not match",
        )
    }

    #[must_use]
    pub fn system_unavailable() -> Self {
        Self::new(
            StatusCode::NO_RESPONDERS,
            ErrorCode::SYSTEM_UNAVAILABLE,
            "system temporarily unavailable",
        )
    }

    #[must_use]
    pub fn not_leader() -> Self {
        Self::new(
            StatusCode::NO_RESPONDERS,
            ErrorCode::NOT_LEADER,
            "not the group leader",
        )
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self::new(StatusCode::NO_RESPONDERS, ErrorCode::TIMEOUT, "timed out")
    }
}

/// The body of a control API reply
///
/// The two variants are mutually exclusive: a reply is either the
/// operation's result object or an `error` object.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response<T> {
    Ok(T),
    Error { error: ApiError },
}

impl<T> From<Result<T, ApiError>> for Response<T> {
    fn from(value: Result<T, ApiError>) -> Self {
        match value {
            Ok(value) => Self::Ok(value),
            Err(error) => Self::Error { error },
        }
    }
}

impl<T> From<Response<T>> for Result<T, ApiError> {
    fn from(value: Response<T>) -> Self {
        match value {
            Response::Ok(value) => Ok(value),
            Response::Error { error } => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_matches;

    use super::{ApiError, ErrorCode, Response};

    #[test]
    fn roundtrip() {
        let error = ApiError::stream_not_found();
        let encoded = serde_json::to_string(&Response::<()>::Error {
            error: error.clone(),
        })
        .unwrap();
        assert_eq!(
            r#"{"error":{"code":404,"err_code":10059,"description":"stream not found"}}"#,
            encoded
        );

        let decoded = serde_json::from_str::<Response<()>>(&encoded).unwrap();
        assert_matches!(decoded, Response::Error { error: e } if e == error);
    }

    #[test]
    fn code_conversion() {
        assert_eq!(10059, u16::from(ErrorCode::STREAM_NOT_FOUND));
        assert_eq!(ErrorCode::STREAM_NOT_FOUND, ErrorCode::from(10059));
    }
}
