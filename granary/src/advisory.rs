use bytes::Bytes;
use chrono::{DateTime, Utc};
use granary_proto::{headers::HeaderMap, MessageBase, Name, Subject};
use serde::Serialize;
use tracing::debug;

use crate::router::Router;

/// Publisher of advisory events
///
/// Advisories are best-effort JSON messages on well-known `$EVT`
/// subjects. Nobody listening is fine; delivery failures are logged
/// and forgotten.
#[derive(Debug, Clone)]
pub struct Advisories {
    router: Router,
}

/// The shared envelope of every advisory
#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    time: DateTime<Utc>,
    #[serde(flatten)]
    event: T,
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamAction<'a> {
    pub stream: &'a Name,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConsumerAction<'a> {
    pub stream: &'a Name,
    pub consumer: &'a Name,
}

#[derive(Debug, Serialize)]
pub(crate) struct LeaderElected<'a> {
    pub name: &'a str,
    pub leader: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct MaxDeliveries<'a> {
    pub stream: &'a Name,
    pub consumer: &'a Name,
    pub stream_seq: u64,
    pub deliveries: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct TerminatedDelivery<'a> {
    pub stream: &'a Name,
    pub consumer: &'a Name,
    pub stream_seq: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServerRemoved<'a> {
    pub server: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiAudit<'a> {
    pub subject: &'a str,
    pub errored: bool,
}

impl Advisories {
    #[must_use]
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    pub fn stream_created(&self, stream: &Name) {
        self.emit(
            format!("$EVT.STREAM.CREATED.{stream}"),
            "stream_created",
            StreamAction { stream },
        );
    }

    pub fn stream_updated(&self, stream: &Name) {
        self.emit(
            format!("$EVT.STREAM.UPDATED.{stream}"),
            "stream_updated",
            StreamAction { stream },
        );
    }

    pub fn stream_deleted(&self, stream: &Name) {
        self.emit(
            format!("$EVT.STREAM.DELETED.{stream}"),
            "stream_deleted",
            StreamAction { stream },
        );
    }

    pub fn consumer_created(&self, stream: &Name, consumer: &Name) {
        self.emit(
            format!("$EVT.CONSUMER.CREATED.{stream}.{consumer}"),
            "consumer_created",
            ConsumerAction { stream, consumer },
        );
    }

    pub fn consumer_deleted(&self, stream: &Name, consumer: &Name) {
        self.emit(
            format!("$EVT.CONSUMER.DELETED.{stream}.{consumer}"),
            "consumer_deleted",
            ConsumerAction { stream, consumer },
        );
    }

    pub fn leader_elected(&self, scope: &str, name: &str, leader: &str) {
        self.emit(
            format!("$EVT.{scope}.LEADER_ELECTED.{name}"),
            "leader_elected",
            LeaderElected { name, leader },
        );
    }

    pub fn max_deliveries(&self, stream: &Name, consumer: &Name, stream_seq: u64, deliveries: u64) {
        self.emit(
            format!("$EVT.CONSUMER.MAX_DELIVERIES.{stream}.{consumer}"),
            "max_deliveries",
            MaxDeliveries {
                stream,
                consumer,
                stream_seq,
                deliveries,
            },
        );
    }

    pub fn terminated_delivery(&self, stream: &Name, consumer: &Name, stream_seq: u64) {
        self.emit(
            format!("$EVT.CONSUMER.TERMINATED.{stream}.{consumer}"),
            "terminated_delivery",
            TerminatedDelivery {
                stream,
                consumer,
                stream_seq,
            },
        );
    }

    pub fn server_removed(&self, server: &str) {
        self.emit(
            "$EVT.SERVER.REMOVED".to_owned(),
            "server_removed",
            ServerRemoved { server },
        );
    }

    /// Every admin API call is audited with the subject it invoked
    pub fn api_audit(&self, subject: &Subject, errored: bool) {
        self.emit(
            "$EVT.API.AUDIT".to_owned(),
            "api_audit",
            ApiAudit {
                subject: subject.as_str(),
                errored,
            },
        );
    }

    fn emit<T: Serialize>(&self, subject: String, kind: &str, event: T) {
        let envelope = Envelope {
            kind,
            time: Utc::now(),
            event,
        };
        let Ok(payload) = serde_json::to_vec(&envelope) else {
            debug!(kind, "advisory serialization failed");
            return;
        };
        let Ok(subject) = Subject::try_from(subject) else {
            debug!(kind, "advisory subject was invalid");
            return;
        };

        self.router.publish(MessageBase {
            subject,
            reply_subject: None,
            headers: HeaderMap::new(),
            payload: Bytes::from(payload),
        });
    }
}
