use bytes::Bytes;
use bytestring::ByteString;
use chrono::{TimeZone, Utc};
use granary_proto::{
    headers::{HeaderMap, HeaderName, HeaderValue},
    StoredMessage, Subject,
};

/// The binary record framing shared by block files and snapshots
///
/// A record is `[kind u8][body-len u32 LE][body][crc16 LE]` where the
/// checksum covers the body. Message bodies carry the sequence,
/// timestamp, subject, headers and payload; tombstone bodies only the
/// sequence.
#[derive(Debug)]
pub(crate) enum Record {
    Message(StoredMessage),
    Tombstone { sequence: u64 },
}

const KIND_MESSAGE: u8 = 1;
const KIND_TOMBSTONE: u8 = 2;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Crc16(u16);

impl Crc16 {
    pub(crate) fn compute(buf: &[u8]) -> Self {
        Self(crc::Crc::<u16>::new(&crc::CRC_16_XMODEM).checksum(buf))
    }

    pub(crate) fn from_raw_encoded(val: [u8; 2]) -> Self {
        Self(u16::from_le_bytes(val))
    }

    pub(crate) fn to_raw_encoded(&self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

pub(crate) fn encode(buf: &mut Vec<u8>, record: &Record) {
    let mut body = Vec::new();
    let kind = match record {
        Record::Message(message) => {
            body.extend_from_slice(&message.sequence.to_le_bytes());
            body.extend_from_slice(
                &message
                    .timestamp
                    .timestamp_nanos_opt()
                    .unwrap_or_default()
                    .to_le_bytes(),
            );

            let subject = message.subject.as_str().as_bytes();
            body.extend_from_slice(&u16::try_from(subject.len()).unwrap_or(u16::MAX).to_le_bytes());
            body.extend_from_slice(subject);

            body.extend_from_slice(
                &u16::try_from(message.headers.len())
                    .unwrap_or(u16::MAX)
                    .to_le_bytes(),
            );
            for (name, values) in message.headers.iter() {
                for value in values {
                    encode_str(&mut body, name.as_str());
                    encode_str(&mut body, value.as_str());
                }
            }

            body.extend_from_slice(
                &u32::try_from(message.payload.len())
                    .unwrap_or(u32::MAX)
                    .to_le_bytes(),
            );
            body.extend_from_slice(&message.payload);

            KIND_MESSAGE
        }
        Record::Tombstone { sequence } => {
            body.extend_from_slice(&sequence.to_le_bytes());
            KIND_TOMBSTONE
        }
    };

    buf.push(kind);
    buf.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&Crc16::compute(&body).to_raw_encoded());
}

fn encode_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&u16::try_from(value.len()).unwrap_or(u16::MAX).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// An error encountered while decoding a [`Record`]
#[derive(Debug, thiserror::Error)]
pub(crate) enum RecordError {
    #[error("record is truncated")]
    Truncated,
    #[error("record checksum mismatch")]
    Checksum,
    #[error("record kind {0} is unknown")]
    UnknownKind(u8),
    #[error("record body is malformed")]
    Malformed,
}

/// Decode a single record from the front of `buf`
///
/// Returns the record and the number of bytes it occupied, or `None`
/// when `buf` is empty.
pub(crate) fn decode(buf: &[u8]) -> Result<Option<(Record, usize)>, RecordError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < 5 {
        return Err(RecordError::Truncated);
    }

    let kind = buf[0];
    let body_len = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
    let total = 5 + body_len + 2;
    if buf.len() < total {
        return Err(RecordError::Truncated);
    }

    let body = &buf[5..5 + body_len];
    let crc = Crc16::from_raw_encoded(buf[5 + body_len..total].try_into().unwrap());
    if Crc16::compute(body) != crc {
        return Err(RecordError::Checksum);
    }

    let record = match kind {
        KIND_MESSAGE => Record::Message(decode_message(body)?),
        KIND_TOMBSTONE => {
            let sequence =
                u64::from_le_bytes(body.try_into().map_err(|_| RecordError::Malformed)?);
            Record::Tombstone { sequence }
        }
        other => return Err(RecordError::UnknownKind(other)),
    };

    Ok(Some((record, total)))
}

fn decode_message(body: &[u8]) -> Result<StoredMessage, RecordError> {
    let mut cursor = Cursor { body, at: 0 };

    let sequence = u64::from_le_bytes(cursor.take(8)?.try_into().unwrap());
    #[expect(clippy::cast_possible_wrap, reason = "written as i64 nanos")]
    let timestamp_ns = u64::from_le_bytes(cursor.take(8)?.try_into().unwrap()) as i64;

    let subject_len = u16::from_le_bytes(cursor.take(2)?.try_into().unwrap()) as usize;
    let subject = cursor.take_str(subject_len)?;
    let subject =
        Subject::try_from(ByteString::from(subject)).map_err(|_| RecordError::Malformed)?;

    let header_count = u16::from_le_bytes(cursor.take(2)?.try_into().unwrap());
    let mut headers = HeaderMap::new();
    for _ in 0..header_count {
        let name_len = u16::from_le_bytes(cursor.take(2)?.try_into().unwrap()) as usize;
        let name = HeaderName::try_from(ByteString::from(cursor.take_str(name_len)?))
            .map_err(|_| RecordError::Malformed)?;
        let value_len = u16::from_le_bytes(cursor.take(2)?.try_into().unwrap()) as usize;
        let value = HeaderValue::try_from(ByteString::from(cursor.take_str(value_len)?))
            .map_err(|_| RecordError::Malformed)?;
        headers.append(name, value);
    }

    let payload_len = u32::from_le_bytes(cursor.take(4)?.try_into().unwrap()) as usize;
    let payload = Bytes::copy_from_slice(cursor.take(payload_len)?);

    Ok(StoredMessage {
        sequence,
        timestamp: Utc.timestamp_nanos(timestamp_ns),
        subject,
        headers,
        payload,
    })
}

struct Cursor<'a> {
    body: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RecordError> {
        let end = self.at.checked_add(n).ok_or(RecordError::Malformed)?;
        if end > self.body.len() {
            return Err(RecordError::Malformed);
        }
        let out = &self.body[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn take_str(&mut self, n: usize) -> Result<&'a str, RecordError> {
        std::str::from_utf8(self.take(n)?).map_err(|_| RecordError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use claims::assert_matches;
    use granary_proto::{
        headers::{HeaderMap, HeaderName, HeaderValue},
        StoredMessage, Subject,
    };

    use super::{decode, encode, Record, RecordError};

    fn message() -> StoredMessage {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::MESSAGE_ID, HeaderValue::from_static("abcd"));
        StoredMessage {
            sequence: 42,
            timestamp: Utc.timestamp_opt(1_700_000_000, 123).unwrap(),
            subject: Subject::from_static("orders.eu.new"),
            headers,
            payload: Bytes::from_static(b"hello world"),
        }
    }

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        encode(&mut buf, &Record::Message(message()));
        encode(&mut buf, &Record::Tombstone { sequence: 17 });

        let (first, used) = decode(&buf).unwrap().unwrap();
        assert_matches!(first, Record::Message(decoded) if decoded == message());

        let (second, used2) = decode(&buf[used..]).unwrap().unwrap();
        assert_matches!(second, Record::Tombstone { sequence: 17 });
        assert_eq!(buf.len(), used + used2);

        assert_matches!(decode(&buf[used + used2..]), Ok(None));
    }

    #[test]
    fn corruption_is_detected() {
        let mut buf = Vec::new();
        encode(&mut buf, &Record::Message(message()));
        let flip = buf.len() / 2;
        buf[flip] ^= 0xff;

        assert_matches!(decode(&buf), Err(RecordError::Checksum));
    }

    #[test]
    fn truncation_is_detected() {
        let mut buf = Vec::new();
        encode(&mut buf, &Record::Message(message()));
        buf.truncate(buf.len() - 3);

        assert_matches!(decode(&buf), Err(RecordError::Truncated));
    }
}
