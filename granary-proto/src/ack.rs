use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::{api::PullRequest, util, Name, Subject};

/// The metadata encoded in the reply subject of every delivered message
///
/// The encoding lets a subscriber acknowledge without any extra
/// lookups: `$ACK.<stream>.<consumer>.<delivery-count>.<stream-seq>.<consumer-seq>.<timestamp-ns>.<pending>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReply {
    pub stream: Name,
    pub consumer: Name,
    pub delivery_count: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub pending: u64,
}

/// The prefix of every ack reply subject
pub const ACK_PREFIX: &str = "$ACK";

impl AckReply {
    /// Encode this metadata as a reply subject
    #[must_use]
    pub fn to_subject(&self) -> Subject {
        Subject::from_dangerous_value(
            format!(
                "{ACK_PREFIX}.{}.{}.{}.{}.{}.{}.{}",
                self.stream,
                self.consumer,
                self.delivery_count,
                self.stream_sequence,
                self.consumer_sequence,
                self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
                self.pending,
            )
            .into(),
        )
    }

    /// Decode ack metadata from a reply subject
    ///
    /// # Errors
    ///
    /// It returns an error if `subject` is not a valid ack reply subject.
    pub fn from_subject(subject: &Subject) -> Result<Self, AckReplyParseError> {
        let mut tokens = subject.tokens();
        if tokens.next() != Some(ACK_PREFIX) {
            return Err(AckReplyParseError::BadPrefix);
        }

        let mut next = || tokens.next().ok_or(AckReplyParseError::MissingToken);
        let stream = Name::try_from(next()?).map_err(|_| AckReplyParseError::BadName)?;
        let consumer = Name::try_from(next()?).map_err(|_| AckReplyParseError::BadName)?;
        let delivery_count = parse_token(next()?)?;
        let stream_sequence = parse_token(next()?)?;
        let consumer_sequence = parse_token(next()?)?;
        #[expect(clippy::cast_possible_wrap, reason = "nanos fit i64 until year 2262")]
        let timestamp_ns = parse_token(next()?)? as i64;
        let pending = parse_token(next()?)?;

        if tokens.next().is_some() {
            return Err(AckReplyParseError::TrailingToken);
        }

        Ok(Self {
            stream,
            consumer,
            delivery_count,
            stream_sequence,
            consumer_sequence,
            timestamp: Utc.timestamp_nanos(timestamp_ns),
            pending,
        })
    }
}

fn parse_token(token: &str) -> Result<u64, AckReplyParseError> {
    util::parse_u64(token.as_bytes()).map_err(|_| AckReplyParseError::BadNumber)
}

/// An error encountered while parsing an [`AckReply`] subject
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum AckReplyParseError {
    #[error("subject does not start with the ack prefix")]
    BadPrefix,
    #[error("subject has too few tokens")]
    MissingToken,
    #[error("subject has too many tokens")]
    TrailingToken,
    #[error("invalid stream or consumer name")]
    BadName,
    #[error("invalid numeric token")]
    BadNumber,
}

/// An acknowledgment sent by a subscriber on a delivered message's
/// reply subject
#[derive(Debug, Clone, PartialEq)]
pub enum AckKind {
    /// The message was processed, advance the ack floor
    Ack,
    /// Redeliver the message, immediately or after `delay`
    Nak { delay: Option<Duration> },
    /// Still working, reset the ack wait timer
    InProgress,
    /// Stop redelivering the message and record an advisory
    Term,
    /// Acknowledge and request the next batch
    Next { request: PullRequest },
}

#[derive(Debug, Deserialize)]
struct NakOptions {
    delay: Option<u64>,
}

impl AckKind {
    /// Decode an acknowledgment from an ack payload
    ///
    /// An empty payload is a positive acknowledgment.
    ///
    /// # Errors
    ///
    /// It returns an error if the payload is not a valid acknowledgment.
    pub fn from_payload(payload: &Bytes) -> Result<Self, AckParseError> {
        let body = payload.as_ref();
        if body.is_empty() || body == b"+ACK" {
            return Ok(Self::Ack);
        }

        if let Some(rest) = body.strip_prefix(b"-NAK") {
            if rest.is_empty() {
                return Ok(Self::Nak { delay: None });
            }
            let options = serde_json::from_slice::<NakOptions>(rest)
                .map_err(AckParseError::BadOptions)?;
            return Ok(Self::Nak {
                delay: options.delay.map(Duration::from_nanos),
            });
        }

        if body == b"+WPI" {
            return Ok(Self::InProgress);
        }

        if body == b"+TERM" {
            return Ok(Self::Term);
        }

        if let Some(rest) = body.strip_prefix(b"+NXT") {
            let rest = rest.trim_ascii();
            let request = if rest.is_empty() {
                PullRequest::default()
            } else if rest.iter().all(u8::is_ascii_digit) {
                PullRequest {
                    batch: util::parse_u64(rest).map_err(|_| AckParseError::Unrecognized)?,
                    ..PullRequest::default()
                }
            } else {
                serde_json::from_slice(rest).map_err(AckParseError::BadOptions)?
            };
            return Ok(Self::Next { request });
        }

        Err(AckParseError::Unrecognized)
    }

    /// Encode this acknowledgment as an ack payload
    #[must_use]
    pub fn to_payload(&self) -> Bytes {
        match self {
            Self::Ack => Bytes::from_static(b"+ACK"),
            Self::Nak { delay: None } => Bytes::from_static(b"-NAK"),
            Self::Nak { delay: Some(delay) } => {
                #[expect(clippy::cast_possible_truncation, reason = "delays fit u64 nanos")]
                let nanos = delay.as_nanos() as u64;
                Bytes::from(format!("-NAK {{\"delay\": {nanos}}}"))
            }
            Self::InProgress => Bytes::from_static(b"+WPI"),
            Self::Term => Bytes::from_static(b"+TERM"),
            Self::Next { request } => {
                let mut out = b"+NXT ".to_vec();
                out.extend_from_slice(
                    &serde_json::to_vec(request).expect("PullRequest serializes"),
                );
                Bytes::from(out)
            }
        }
    }
}

/// An error encountered while parsing an [`AckKind`]
#[derive(Debug, thiserror::Error)]
pub enum AckParseError {
    #[error("unrecognized ack payload")]
    Unrecognized,
    #[error("invalid ack options")]
    BadOptions(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use claims::{assert_err, assert_matches};

    use crate::Name;

    use super::{AckKind, AckReply};

    #[test]
    fn reply_subject_roundtrip() {
        let reply = AckReply {
            stream: Name::from_static("ORDERS"),
            consumer: Name::from_static("dispatcher"),
            delivery_count: 2,
            stream_sequence: 102,
            consumer_sequence: 41,
            timestamp: Utc.timestamp_nanos(1_700_000_000_123_456_789),
            pending: 7,
        };

        let subject = reply.to_subject();
        assert_eq!(
            "$ACK.ORDERS.dispatcher.2.102.41.1700000000123456789.7",
            subject.as_str()
        );
        assert_eq!(reply, AckReply::from_subject(&subject).unwrap());
    }

    #[test]
    fn ack_kinds() {
        assert_matches!(
            AckKind::from_payload(&Bytes::from_static(b"+ACK")),
            Ok(AckKind::Ack)
        );
        assert_matches!(
            AckKind::from_payload(&Bytes::new()),
            Ok(AckKind::Ack)
        );
        assert_matches!(
            AckKind::from_payload(&Bytes::from_static(b"-NAK")),
            Ok(AckKind::Nak { delay: None })
        );
        assert_matches!(
            AckKind::from_payload(&Bytes::from_static(b"-NAK {\"delay\": 5000000000}")),
            Ok(AckKind::Nak { delay: Some(d) }) if d == Duration::from_secs(5)
        );
        assert_matches!(
            AckKind::from_payload(&Bytes::from_static(b"+WPI")),
            Ok(AckKind::InProgress)
        );
        assert_matches!(
            AckKind::from_payload(&Bytes::from_static(b"+TERM")),
            Ok(AckKind::Term)
        );
        assert_matches!(
            AckKind::from_payload(&Bytes::from_static(b"+NXT 10")),
            Ok(AckKind::Next { request }) if request.batch == 10
        );
        assert_matches!(
            AckKind::from_payload(&Bytes::from_static(b"+NXT {\"batch\": 3, \"no_wait\": true}")),
            Ok(AckKind::Next { request }) if request.batch == 3 && request.no_wait
        );
        assert_err!(AckKind::from_payload(&Bytes::from_static(b"MAYBE")));
    }
}
