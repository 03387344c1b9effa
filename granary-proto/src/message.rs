use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{headers::HeaderMap, Subject};

/// A message as it travels through the subject router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBase {
    pub subject: Subject,
    pub reply_subject: Option<Subject>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

impl MessageBase {
    /// The number of payload and header bytes accounted against stream
    /// and consumer byte limits
    #[must_use]
    pub fn size(&self) -> usize {
        let headers = self
            .headers
            .iter()
            .flat_map(|(name, values)| values.map(move |value| name.len() + value.len() + 4))
            .sum::<usize>();
        self.subject.len() + headers + self.payload.len()
    }
}

/// A message as stored inside a stream
///
/// The sequence is assigned by the stream leader at commit time and is
/// never reused, even after the message is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub subject: Subject,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

impl StoredMessage {
    /// The number of bytes accounted against stream limits
    #[must_use]
    pub fn size(&self) -> usize {
        let headers = self
            .headers
            .iter()
            .flat_map(|(name, values)| values.map(move |value| name.len() + value.len() + 4))
            .sum::<usize>();
        self.subject.len() + headers + self.payload.len()
    }
}
