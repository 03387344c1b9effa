use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use granary_proto::{
    api::{
        AckPolicy, ConsumerConfig, ConsumerDurability, ConsumerInfo, ConsumerSpecificConfig,
        DeliverPolicy, ReplayPolicy, SourceInfo, StreamSource,
    },
    error::Response,
    headers::{HeaderName, HeaderValue},
    AckReply, MessageBase, Name, Subject,
};
use rand::Rng as _;
use tokio::{
    sync::oneshot,
    time::{self, Instant},
};
use tracing::{debug, warn};

use crate::{router::Router, stream::StreamHandle};

const CREATE_TIMEOUT: Duration = Duration::from_secs(2);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(15);

/// A running mirror or source replication driver
///
/// One driver per upstream: it plants an ephemeral push consumer on
/// the origin stream and appends everything it receives locally,
/// preserving the origin coordinates in a header.
#[derive(Debug)]
pub(crate) struct SourceDriver {
    name: Name,
    stop: Option<oneshot::Sender<()>>,
    progress: Arc<Mutex<Progress>>,
}

#[derive(Debug)]
struct Progress {
    lag: u64,
    last_active: Instant,
}

impl SourceDriver {
    pub(crate) fn progress(&self) -> SourceInfo {
        let progress = self.progress.lock().expect("progress lock");
        SourceInfo {
            name: self.name.clone(),
            lag: progress.lag,
            active: progress.last_active.elapsed(),
        }
    }

    pub(crate) async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub(crate) fn spawn(
    upstream: StreamSource,
    local: StreamHandle,
    router: Router,
    domain: Option<String>,
) -> SourceDriver {
    let (stop, stopped) = oneshot::channel();
    let progress = Arc::new(Mutex::new(Progress {
        lag: 0,
        last_active: Instant::now(),
    }));

    let driver = DriverTask {
        upstream: upstream.clone(),
        local,
        router,
        domain,
        progress: Arc::clone(&progress),
        last_origin_seq: 0,
    };
    tokio::spawn(driver.run(stopped));

    SourceDriver {
        name: upstream.name,
        stop: Some(stop),
        progress,
    }
}

struct DriverTask {
    upstream: StreamSource,
    local: StreamHandle,
    router: Router,
    domain: Option<String>,
    progress: Arc<Mutex<Progress>>,
    last_origin_seq: u64,
}

impl DriverTask {
    async fn run(mut self, mut stopped: oneshot::Receiver<()>) {
        let mut backoff = RETRY_BACKOFF;

        loop {
            tokio::select! {
                _ = &mut stopped => return,
                connected = self.connect_and_copy() => {
                    match connected {
                        Ok(()) => return,
                        Err(err) => {
                            debug!(upstream = %self.upstream.name, error = err,
                                "source driver disconnected, retrying");
                            tokio::select! {
                                _ = &mut stopped => return,
                                () = time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                        }
                    }
                }
            }
        }
    }

    fn api_prefix(&self) -> String {
        match &self.upstream.external {
            Some(external) => external.api_prefix.as_str().to_owned(),
            None => match &self.domain {
                Some(domain) => format!("$API.{domain}"),
                None => "$API".to_owned(),
            },
        }
    }

    fn deliver_subject(&self) -> Subject {
        let mut rng = rand::thread_rng();
        let token: String = (0..12)
            .map(|_| {
                let n = rng.gen_range(0..36);
                char::from_digit(n, 36).unwrap_or('0').to_ascii_uppercase()
            })
            .collect();
        let subject = match &self.upstream.external {
            Some(external) => format!("{}.SYNC.{token}", external.deliver_prefix),
            None => format!("_SYNC.{}.{token}", self.upstream.name),
        };
        Subject::from_dangerous_value(subject.into())
    }

    /// Plant the upstream consumer and copy until the link dies
    async fn connect_and_copy(&mut self) -> Result<(), &'static str> {
        let deliver_subject = self.deliver_subject();
        let mut delivery = self.router.subscribe(deliver_subject.clone(), None);

        let deliver_policy = if self.last_origin_seq > 0 {
            DeliverPolicy::StartSequence {
                sequence: self.last_origin_seq + 1,
            }
        } else if let Some(sequence) = self.upstream.opt_start_seq {
            DeliverPolicy::StartSequence { sequence }
        } else if let Some(from) = self.upstream.opt_start_time {
            DeliverPolicy::StartTime { from }
        } else {
            DeliverPolicy::All
        };

        let consumer_name = Name::try_from(format!(
            "sync-{}",
            rand::thread_rng().gen_range(0..u32::MAX)
        ))
        .expect("generated name is valid");
        let config = ConsumerConfig {
            durability: ConsumerDurability::Ephemeral,
            name: consumer_name,
            description: format!("replication into {}", self.local.name()),
            deliver_policy,
            ack_policy: AckPolicy::None,
            max_deliver: None,
            filter_subject: self.upstream.filter_subject.clone(),
            replay_policy: ReplayPolicy::Instant,
            rate_limit: None,
            flow_control: false,
            idle_heartbeat: Duration::ZERO,
            specs: ConsumerSpecificConfig::Push {
                deliver_subject,
                deliver_group: None,
            },
            inactive_threshold: Duration::from_secs(30),
            replicas: None,
            storage: granary_proto::api::ConsumerStorage::Memory,
        };

        let create_subject = Subject::try_from(format!(
            "{}.CONSUMER.CREATE.{}",
            self.api_prefix(),
            self.upstream.name
        ))
        .map_err(|_| "invalid upstream api subject")?;
        let body = serde_json::to_vec(&config).map_err(|_| "consumer config serialization")?;

        let reply = self
            .router
            .request(
                create_subject,
                granary_proto::headers::HeaderMap::new(),
                Bytes::from(body),
                CREATE_TIMEOUT,
            )
            .await
            .map_err(|_| "upstream unreachable")?;
        match serde_json::from_slice::<Response<ConsumerInfo>>(&reply.payload) {
            Ok(Response::Ok(_)) => {}
            Ok(Response::Error { error }) => {
                warn!(upstream = %self.upstream.name, error = %error,
                    "upstream consumer create rejected");
                return Err("upstream rejected the sync consumer");
            }
            Err(_) => return Err("undecodable upstream reply"),
        }

        while let Some(message) = delivery.recv().await {
            if message.headers.get(&HeaderName::STATUS).is_some() {
                // Control message, nothing to copy
                continue;
            }
            self.copy_message(message).await?;
        }

        Err("delivery subscription closed")
    }

    async fn copy_message(&mut self, message: MessageBase) -> Result<(), &'static str> {
        let Some(reply_subject) = &message.reply_subject else {
            return Ok(());
        };
        let Ok(reply) = AckReply::from_subject(reply_subject) else {
            return Ok(());
        };

        // Redeliveries and reconnect overlap are filtered by sequence
        if reply.stream_sequence <= self.last_origin_seq {
            return Ok(());
        }

        let origin_subject = message
            .headers
            .get(&HeaderName::SUBJECT)
            .map(|value| value.as_str().to_owned())
            .ok_or("sourced message lacks its origin subject")?;
        let subject =
            Subject::try_from(origin_subject.clone()).map_err(|_| "invalid origin subject")?;

        let mut headers = message.headers.clone();
        headers.remove(&HeaderName::SUBJECT);
        headers.remove(&HeaderName::STREAM);
        headers.insert(
            HeaderName::STREAM_SOURCE,
            HeaderValue::from_dangerous_value(
                format!(
                    "{} {} {origin_subject}",
                    reply.stream, reply.stream_sequence
                )
                .into(),
            ),
        );

        self.local
            .source_append(MessageBase {
                subject,
                reply_subject: None,
                headers,
                payload: message.payload,
            })
            .await
            .map_err(|_| "local append failed")?;

        self.last_origin_seq = reply.stream_sequence;
        let mut progress = self.progress.lock().expect("progress lock");
        progress.lag = reply.pending;
        progress.last_active = Instant::now();
        Ok(())
    }
}
