use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use bytestring::ByteString;
use chrono::{DateTime, Utc};
use granary_proto::{
    api::{
        ClusterInfo, ConsumerConfig, ConsumerDurability, ConsumerInfo, PeerInfo, PubAck,
        PullRequest, PurgeRequest, RetentionPolicy, StreamConfig, StreamInfo, StreamState,
    },
    error::ApiError,
    headers::{HeaderMap, HeaderName, HeaderValue},
    MessageBase, Name, StatusCode, StoredMessage, Subject,
};
use granary_store::{PurgeOptions, Store, StoreConfig, StoreError};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, RwLock},
    time::{self, Instant},
};
use tracing::{debug, warn};

use crate::{
    account::Account,
    advisory::Advisories,
    consumer::{self, ConsumerContext, ConsumerHandle, ConsumerState},
    raft::{Applied, GroupError, Replica},
    router::Router,
    source::{self, SourceDriver},
    timer::TimerHeap,
};

pub use self::snapshot::{SnapshotDecodeError, StreamSnapshot};

mod dedup;
mod snapshot;

use self::dedup::DedupCache;

const COMMAND_BUFFER: usize = 256;
const PROPOSAL_DEADLINE: Duration = Duration::from_secs(5);
/// Offered to the replication group once the log grows past this
const SNAPSHOT_EVERY: u64 = 1024;

/// A cloneable handle to a stream actor
///
/// All mutations funnel through the actor's mailbox; reads of the
/// message store take a short read lease directly.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    name: Name,
    commands: mpsc::Sender<StreamCommand>,
    store: Arc<RwLock<Store>>,
}

#[derive(Debug)]
enum StreamCommand {
    Publish {
        message: MessageBase,
        reply: oneshot::Sender<Result<PubAck, ApiError>>,
    },
    /// A message that arrived through the subject router
    Ingest {
        message: MessageBase,
    },
    /// An append performed by a mirror or source driver, exempt from
    /// the mirror direct-publish rejection
    SourceAppend {
        message: MessageBase,
        reply: oneshot::Sender<Result<PubAck, ApiError>>,
    },
    DeleteMessage {
        sequence: u64,
        reply: oneshot::Sender<Result<bool, ApiError>>,
    },
    Purge {
        request: PurgeRequest,
        reply: oneshot::Sender<Result<u64, ApiError>>,
    },
    UpdateConfig {
        config: Box<StreamConfig>,
        reply: oneshot::Sender<Result<StreamInfo, ApiError>>,
    },
    Info {
        reply: oneshot::Sender<StreamInfo>,
    },
    AddConsumer {
        config: Box<ConsumerConfig>,
        reply: oneshot::Sender<Result<ConsumerInfo, ApiError>>,
    },
    DeleteConsumer {
        name: Name,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    ConsumerInfo {
        name: Name,
        reply: oneshot::Sender<Result<ConsumerInfo, ApiError>>,
    },
    ListConsumers {
        reply: oneshot::Sender<Vec<ConsumerInfo>>,
    },
    PullNext {
        consumer: Name,
        request: PullRequest,
        reply_subject: Subject,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    ConsumerAck {
        consumer: Name,
        sequence: u64,
    },
    ConsumerFloor {
        consumer: Name,
        floor: u64,
    },
    Snapshot {
        reply: oneshot::Sender<Result<StreamSnapshot, ApiError>>,
    },
    Restore {
        snapshot: Box<StreamSnapshot>,
        reply: oneshot::Sender<Result<StreamInfo, ApiError>>,
    },
    Stepdown {
        reply: oneshot::Sender<Result<bool, ApiError>>,
    },
    ProposalFailed {
        op_id: u64,
        error: GroupError,
    },
    RestoreConsumer {
        state: Box<ConsumerState>,
        reply: oneshot::Sender<Result<ConsumerInfo, ApiError>>,
    },
    Stop {
        delete: bool,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum StreamTimer {
    AgeExpiry,
    DedupEvict,
}

/// An operation in the stream's replicated log
///
/// Sequence assignment and all publish validation happen when the
/// entry commits; followers derive identical state by applying the
/// same entries in order.
#[derive(Debug, Serialize, Deserialize)]
enum StreamOp {
    Publish {
        op_id: u64,
        origin: String,
        message: WireMessage,
        /// Appended by a mirror or source driver; skips the own-subject
        /// ownership check
        #[serde(default)]
        sourced: bool,
    },
    DeleteMessage {
        op_id: u64,
        origin: String,
        sequence: u64,
    },
    Purge {
        op_id: u64,
        origin: String,
        request: PurgeRequest,
    },
    UpdateConfig {
        op_id: u64,
        origin: String,
        config: Box<StreamConfig>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    subject: Subject,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    hdrs: BTreeMap<String, Vec<String>>,
    data: String,
}

/// The `meta` file of a durable consumer's `obs/` directory
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ConsumerMeta {
    pub(crate) config: ConsumerConfig,
    #[serde(rename = "created")]
    pub(crate) created_at: DateTime<Utc>,
}

#[derive(Debug)]
enum OpResult {
    PubAck(PubAck),
    Deleted(bool),
    Purged(u64),
    Updated(Box<StreamInfo>),
}

impl WireMessage {
    fn from_parts(subject: Subject, headers: &HeaderMap, payload: &Bytes) -> Self {
        Self {
            subject,
            hdrs: headers
                .iter()
                .map(|(name, values)| {
                    (
                        name.as_str().to_owned(),
                        values.map(|value| value.as_str().to_owned()).collect(),
                    )
                })
                .collect(),
            data: BASE64.encode(payload),
        }
    }

    fn into_parts(self) -> Result<(Subject, HeaderMap, Bytes), ApiError> {
        let mut headers = HeaderMap::new();
        for (name, values) in self.hdrs {
            let name = HeaderName::try_from(name)
                .map_err(|_| ApiError::bad_request("invalid header in replicated entry"))?;
            for value in values {
                let value = HeaderValue::try_from(value)
                    .map_err(|_| ApiError::bad_request("invalid header in replicated entry"))?;
                headers.append(name.clone(), value);
            }
        }
        let payload = BASE64
            .decode(self.data)
            .map_err(|_| ApiError::bad_request("invalid payload in replicated entry"))?;
        Ok((self.subject, headers, Bytes::from(payload)))
    }
}

/// Everything a stream actor needs at spawn time
#[derive(Debug)]
pub(crate) struct StreamContext {
    pub(crate) account: Account,
    pub(crate) config: StreamConfig,
    pub(crate) store: Store,
    pub(crate) router: Router,
    pub(crate) advisories: Advisories,
    pub(crate) replica: Replica,
    pub(crate) applied: mpsc::Receiver<Applied>,
    pub(crate) node: String,
    pub(crate) domain: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    /// Directory of the file backing, for snapshot installs
    pub(crate) store_dir: Option<std::path::PathBuf>,
}

pub(crate) fn spawn(context: StreamContext) -> StreamHandle {
    let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let store = Arc::new(RwLock::new(context.store));

    let handle = StreamHandle {
        name: context.config.name.clone(),
        commands: commands.clone(),
        store: Arc::clone(&store),
    };

    let dedup = DedupCache::new(context.config.duplicate_window);
    let actor = StreamActor {
        account: context.account,
        config: context.config,
        created_at: context.created_at,
        store,
        dedup,
        router: context.router,
        advisories: context.advisories,
        replica: context.replica,
        applied: context.applied,
        node: context.node,
        domain: context.domain,
        store_dir: context.store_dir,
        handle: handle.clone(),
        commands: commands_rx,
        consumers: BTreeMap::new(),
        floors: HashMap::new(),
        timers: TimerHeap::new(),
        age_timer_armed: false,
        dedup_timer_armed: false,
        last_msg_id: None,
        next_op_id: 0,
        pending: HashMap::new(),
        sources: Vec::new(),
        ingest_tasks: Vec::new(),
        applied_entries: 0,
        reported_bytes: 0,
        stopping: false,
        deleting: false,
        stop_reply: None,
    };
    tokio::spawn(actor.run());

    handle
}

impl StreamHandle {
    #[must_use]
    pub fn name(&self) -> &Name {
        &self.name
    }

    pub(crate) fn store(&self) -> &Arc<RwLock<Store>> {
        &self.store
    }

    /// Publish a message into the stream
    ///
    /// # Errors
    ///
    /// Propagates limit, expectation and availability errors from the
    /// publish pipeline.
    pub async fn publish(&self, message: MessageBase) -> Result<PubAck, ApiError> {
        self.round_trip(|reply| StreamCommand::Publish { message, reply })
            .await?
    }

    pub(crate) async fn source_append(&self, message: MessageBase) -> Result<PubAck, ApiError> {
        self.round_trip(|reply| StreamCommand::SourceAppend { message, reply })
            .await?
    }

    /// Fetch a message by sequence or as the last on a subject
    ///
    /// Reads take a short lease on the store without entering the
    /// actor mailbox.
    ///
    /// # Errors
    ///
    /// Returns `no message found` for unknown sequences.
    pub async fn get_message(
        &self,
        sequence: Option<u64>,
        last_by_subject: Option<Subject>,
    ) -> Result<StoredMessage, ApiError> {
        let store = self.store.read().await;
        let result = match (sequence, last_by_subject) {
            (Some(sequence), None) => store.load(sequence),
            (None, Some(subject)) => store.load_last_by_subject(&subject),
            _ => return Err(ApiError::bad_request("exactly one selector must be given")),
        };
        result.map_err(store_error)
    }

    /// Tombstone a single message
    ///
    /// # Errors
    ///
    /// Returns `no message found` if the sequence is unknown.
    pub async fn delete_message(&self, sequence: u64) -> Result<bool, ApiError> {
        self.round_trip(|reply| StreamCommand::DeleteMessage { sequence, reply })
            .await?
    }

    /// Bulk-remove messages
    ///
    /// # Errors
    ///
    /// Rejects requests carrying both `keep` and `seq`.
    pub async fn purge(&self, request: PurgeRequest) -> Result<u64, ApiError> {
        self.round_trip(|reply| StreamCommand::Purge { request, reply })
            .await?
    }

    /// Apply a configuration update
    ///
    /// # Errors
    ///
    /// Rejects changes to immutable fields.
    pub async fn update_config(&self, config: StreamConfig) -> Result<StreamInfo, ApiError> {
        self.round_trip(|reply| StreamCommand::UpdateConfig {
            config: Box::new(config),
            reply,
        })
        .await?
    }

    pub async fn info(&self) -> Result<StreamInfo, ApiError> {
        self.round_trip(|reply| StreamCommand::Info { reply }).await
    }

    /// Create a consumer under this stream
    ///
    /// # Errors
    ///
    /// Propagates validation and capacity errors.
    pub async fn add_consumer(&self, config: ConsumerConfig) -> Result<ConsumerInfo, ApiError> {
        self.round_trip(|reply| StreamCommand::AddConsumer {
            config: Box::new(config),
            reply,
        })
        .await?
    }

    /// Delete a consumer
    ///
    /// # Errors
    ///
    /// Returns `consumer not found` for unknown names.
    pub async fn delete_consumer(&self, name: Name) -> Result<(), ApiError> {
        self.round_trip(|reply| StreamCommand::DeleteConsumer { name, reply })
            .await?
    }

    /// Fetch a consumer's info
    ///
    /// # Errors
    ///
    /// Returns `consumer not found` for unknown names.
    pub async fn consumer_info(&self, name: Name) -> Result<ConsumerInfo, ApiError> {
        self.round_trip(|reply| StreamCommand::ConsumerInfo { name, reply })
            .await?
    }

    pub async fn list_consumers(&self) -> Result<Vec<ConsumerInfo>, ApiError> {
        self.round_trip(|reply| StreamCommand::ListConsumers { reply })
            .await
    }

    /// Forward a pull request to a consumer
    ///
    /// # Errors
    ///
    /// Returns `consumer not found` for unknown names.
    pub async fn pull_next(
        &self,
        consumer: Name,
        request: PullRequest,
        reply_subject: Subject,
    ) -> Result<(), ApiError> {
        self.round_trip(|reply| StreamCommand::PullNext {
            consumer,
            request,
            reply_subject,
            reply,
        })
        .await?
    }

    pub(crate) fn consumer_acked(&self, consumer: Name, sequence: u64) {
        let _ = self
            .commands
            .try_send(StreamCommand::ConsumerAck { consumer, sequence });
    }

    pub(crate) fn consumer_floor(&self, consumer: Name, floor: u64) {
        let _ = self
            .commands
            .try_send(StreamCommand::ConsumerFloor { consumer, floor });
    }

    /// Take a snapshot of the stream, its store and its consumers
    ///
    /// # Errors
    ///
    /// Surfaces store failures.
    pub async fn snapshot(&self) -> Result<StreamSnapshot, ApiError> {
        self.round_trip(|reply| StreamCommand::Snapshot { reply })
            .await?
    }

    /// Replace the stream's content from a snapshot
    ///
    /// # Errors
    ///
    /// Fails on malformed snapshots.
    pub async fn restore(&self, snapshot: StreamSnapshot) -> Result<StreamInfo, ApiError> {
        self.round_trip(|reply| StreamCommand::Restore {
            snapshot: Box::new(snapshot),
            reply,
        })
        .await?
    }

    /// Ask the stream's group leader to step down
    ///
    /// # Errors
    ///
    /// Fails when the stream is not replicated.
    pub async fn stepdown(&self) -> Result<bool, ApiError> {
        self.round_trip(|reply| StreamCommand::Stepdown { reply })
            .await?
    }

    pub(crate) async fn restore_consumer(
        &self,
        state: ConsumerState,
    ) -> Result<ConsumerInfo, ApiError> {
        self.round_trip(|reply| StreamCommand::RestoreConsumer {
            state: Box::new(state),
            reply,
        })
        .await?
    }

    /// Stop the actor, cascading to all consumers
    ///
    /// With `delete` the backing directory is removed and deletion
    /// advisories fire; without it consumer state is persisted for
    /// the next start.
    pub async fn stop(&self, delete: bool) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(StreamCommand::Stop { delete, reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    async fn round_trip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StreamCommand,
    ) -> Result<T, ApiError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ApiError::stream_not_found())?;
        response.await.map_err(|_| ApiError::stream_not_found())
    }
}

struct ConsumerEntry {
    handle: ConsumerHandle,
    config: ConsumerConfig,
}

struct StreamActor {
    account: Account,
    config: StreamConfig,
    created_at: DateTime<Utc>,
    store: Arc<RwLock<Store>>,
    dedup: DedupCache,
    router: Router,
    advisories: Advisories,
    replica: Replica,
    applied: mpsc::Receiver<Applied>,
    node: String,
    domain: Option<String>,
    store_dir: Option<std::path::PathBuf>,
    handle: StreamHandle,

    commands: mpsc::Receiver<StreamCommand>,
    consumers: BTreeMap<Name, ConsumerEntry>,
    /// Last reported ack floor per consumer, for interest retention
    floors: HashMap<Name, u64>,
    timers: TimerHeap<StreamTimer>,
    age_timer_armed: bool,
    dedup_timer_armed: bool,
    /// The message id of the last appended message, if it carried one
    last_msg_id: Option<ByteString>,

    next_op_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<OpResult, ApiError>>>,
    sources: Vec<SourceDriver>,
    ingest_tasks: Vec<tokio::task::JoinHandle<()>>,
    applied_entries: u64,
    /// The byte usage last reported to the account
    reported_bytes: u64,
    stopping: bool,
    deleting: bool,
    stop_reply: Option<oneshot::Sender<()>>,
}

impl StreamActor {
    async fn run(mut self) {
        self.start_source_drivers();
        self.start_ingest();

        while !self.stopping {
            let deadline = self.timers.next_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                applied = self.applied.recv() => {
                    match applied {
                        Some(applied) => self.handle_applied(applied).await,
                        None => break,
                    }
                }
                () = time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => {
                    self.handle_timers().await;
                }
            }

            // Keep the apply channel drained so proposals never back up
            // behind the mailbox
            while let Ok(applied) = self.applied.try_recv() {
                self.handle_applied(applied).await;
            }
        }

        self.shutdown().await;
        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.send(());
        }
    }

    async fn shutdown(&mut self) {
        for task in self.ingest_tasks.drain(..) {
            task.abort();
        }
        for driver in self.sources.drain(..) {
            driver.stop().await;
        }
        for (name, entry) in std::mem::take(&mut self.consumers) {
            if !self.deleting {
                if let Ok(state) = entry.handle.state().await {
                    self.persist_consumer_state(&name, &state);
                }
            }
            entry.handle.stop().await;
            if self.deleting {
                self.account.release_consumer();
                self.advisories.consumer_deleted(&self.config.name, &name);
            }
        }

        if self.deleting {
            self.account
                .usage()
                .update_stored(self.config.storage, self.reported_bytes, 0);
            self.reported_bytes = 0;
            self.account.release_stream();
            self.advisories.stream_deleted(&self.config.name);
            if let Some(dir) = &self.store_dir {
                if let Err(err) = std::fs::remove_dir_all(dir) {
                    warn!(stream = %self.config.name, error = %err, "stream directory removal failed");
                }
            }
        }
    }

    fn consumer_dir(&self, name: &Name) -> Option<std::path::PathBuf> {
        self.store_dir.as_ref().map(|dir| dir.join("obs").join(name.as_str()))
    }

    fn persist_consumer_state(&self, name: &Name, state: &ConsumerState) {
        let Some(dir) = self.consumer_dir(name) else {
            return;
        };
        let write = std::fs::create_dir_all(&dir).and_then(|()| {
            let encoded = serde_json::to_vec(state)?;
            std::fs::write(dir.join("state"), encoded)
        });
        if let Err(err) = write {
            warn!(stream = %self.config.name, consumer = %name, error = %err,
                "consumer state persistence failed");
        }
    }

    /// Subscribe to the stream's own subjects on the router
    ///
    /// Each subscription gets a forwarder task feeding the mailbox, so
    /// router publishes and direct API publishes share one pipeline.
    fn start_ingest(&mut self) {
        for task in self.ingest_tasks.drain(..) {
            task.abort();
        }
        for pattern in self.config.subjects.clone() {
            let mut subscription = self.router.subscribe(pattern, None);
            let commands = self.handle.commands.clone();
            self.ingest_tasks.push(tokio::spawn(async move {
                while let Some(message) = subscription.recv().await {
                    if commands
                        .send(StreamCommand::Ingest { message })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }));
        }
    }

    fn start_source_drivers(&mut self) {
        let upstreams = if let Some(mirror) = &self.config.mirror {
            vec![mirror.clone()]
        } else {
            self.config.sources.clone()
        };

        for upstream in upstreams {
            self.sources.push(source::spawn(
                upstream,
                self.handle.clone(),
                self.router.clone(),
                self.domain.clone(),
            ));
        }
    }

    async fn handle_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::Publish { message, reply } => {
                if self.config.mirror.is_some() {
                    let _ = reply.send(Err(ApiError::new(
                        StatusCode::CONFLICT,
                        granary_proto::error::ErrorCode::MIRROR_WITH_DIRECT_PUBLISH,
                        "stream mirrors another stream and does not accept direct publishes",
                    )));
                    return;
                }
                self.submit_publish(message, false, reply).await;
            }
            StreamCommand::SourceAppend { message, reply } => {
                self.submit_publish(message, true, reply).await;
            }
            StreamCommand::Ingest { message } => {
                let reply_subject = message.reply_subject.clone();
                let (reply, response) = oneshot::channel();
                self.submit_publish(message, false, reply).await;

                if self.config.no_ack {
                    return;
                }
                let Some(reply_subject) = reply_subject else {
                    return;
                };
                let router = self.router.clone();
                tokio::spawn(async move {
                    let payload = match response.await {
                        Ok(Ok(ack)) => serde_json::to_vec(&ack).unwrap_or_default(),
                        Ok(Err(error)) => {
                            serde_json::to_vec(&granary_proto::error::Response::<PubAck>::Error {
                                error,
                            })
                            .unwrap_or_default()
                        }
                        Err(_) => return,
                    };
                    router.publish(MessageBase {
                        subject: reply_subject,
                        reply_subject: None,
                        headers: HeaderMap::new(),
                        payload: Bytes::from(payload),
                    });
                });
            }
            StreamCommand::DeleteMessage { sequence, reply } => {
                let op_id = self.next_op_id();
                let op = StreamOp::DeleteMessage {
                    op_id,
                    origin: self.node.clone(),
                    sequence,
                };
                self.submit(op_id, &op, reply, |result| match result {
                    OpResult::Deleted(deleted) => Ok(deleted),
                    _ => Err(ApiError::bad_request("mismatched op result")),
                })
                .await;
            }
            StreamCommand::Purge { request, reply } => {
                let op_id = self.next_op_id();
                let op = StreamOp::Purge {
                    op_id,
                    origin: self.node.clone(),
                    request,
                };
                self.submit(op_id, &op, reply, |result| match result {
                    OpResult::Purged(purged) => Ok(purged),
                    _ => Err(ApiError::bad_request("mismatched op result")),
                })
                .await;
            }
            StreamCommand::UpdateConfig { config, reply } => {
                let op_id = self.next_op_id();
                let op = StreamOp::UpdateConfig {
                    op_id,
                    origin: self.node.clone(),
                    config,
                };
                self.submit(op_id, &op, reply, |result| match result {
                    OpResult::Updated(info) => Ok(*info),
                    _ => Err(ApiError::bad_request("mismatched op result")),
                })
                .await;
            }
            StreamCommand::Info { reply } => {
                let _ = reply.send(self.build_info().await);
            }
            StreamCommand::AddConsumer { config, reply } => {
                let _ = reply.send(self.add_consumer(*config, None).await);
            }
            StreamCommand::DeleteConsumer { name, reply } => {
                let _ = reply.send(self.delete_consumer(&name).await);
            }
            StreamCommand::ConsumerInfo { name, reply } => {
                let result = match self.consumers.get(&name) {
                    Some(entry) => entry.handle.info().await,
                    None => Err(ApiError::consumer_not_found()),
                };
                let _ = reply.send(result);
            }
            StreamCommand::ListConsumers { reply } => {
                let mut infos = Vec::with_capacity(self.consumers.len());
                for entry in self.consumers.values() {
                    if let Ok(info) = entry.handle.info().await {
                        infos.push(info);
                    }
                }
                let _ = reply.send(infos);
            }
            StreamCommand::PullNext {
                consumer,
                request,
                reply_subject,
                reply,
            } => {
                let result = match self.consumers.get(&consumer) {
                    Some(entry) => {
                        entry.handle.pull(request, reply_subject).await;
                        Ok(())
                    }
                    None => Err(ApiError::consumer_not_found()),
                };
                let _ = reply.send(result);
            }
            StreamCommand::ConsumerAck { consumer, sequence } => {
                self.handle_consumer_ack(&consumer, sequence).await;
            }
            StreamCommand::ConsumerFloor { consumer, floor } => {
                self.floors.insert(consumer, floor);
                if matches!(self.config.retention, RetentionPolicy::Interest) {
                    self.apply_interest_retention().await;
                }
            }
            StreamCommand::Snapshot { reply } => {
                let _ = reply.send(self.take_snapshot().await);
            }
            StreamCommand::Restore { snapshot, reply } => {
                let _ = reply.send(self.install_snapshot(*snapshot).await);
            }
            StreamCommand::Stepdown { reply } => {
                let result = match &self.replica {
                    Replica::Solo(_) => Err(ApiError::bad_request("stream is not replicated")),
                    Replica::Group(handle) => Ok(handle.stepdown().await),
                };
                let _ = reply.send(result);
            }
            StreamCommand::ProposalFailed { op_id, error } => {
                if let Some(reply) = self.pending.remove(&op_id) {
                    let _ = reply.send(Err(group_error(&error)));
                }
            }
            StreamCommand::RestoreConsumer { state, reply } => {
                let config = state.config.clone();
                let _ = reply.send(self.add_consumer(config, Some(*state)).await);
            }
            StreamCommand::Stop { delete, reply } => {
                self.stopping = true;
                self.deleting = delete;
                self.stop_reply = Some(reply);
            }
        }
    }

    fn next_op_id(&mut self) -> u64 {
        self.next_op_id += 1;
        self.next_op_id
    }

    async fn submit_publish(
        &mut self,
        message: MessageBase,
        sourced: bool,
        reply: oneshot::Sender<Result<PubAck, ApiError>>,
    ) {
        let op_id = self.next_op_id();
        let op = StreamOp::Publish {
            op_id,
            origin: self.node.clone(),
            message: WireMessage::from_parts(message.subject, &message.headers, &message.payload),
            sourced,
        };
        self.submit(op_id, &op, reply, |result| match result {
            OpResult::PubAck(ack) => Ok(ack),
            _ => Err(ApiError::bad_request("mismatched op result")),
        })
        .await;
    }

    /// Propose `op` and wire the commit-time result back to `reply`
    async fn submit<T: Send + 'static>(
        &mut self,
        op_id: u64,
        op: &StreamOp,
        reply: oneshot::Sender<Result<T, ApiError>>,
        convert: impl FnOnce(OpResult) -> Result<T, ApiError> + Send + 'static,
    ) {
        if !self.replica.is_leader() {
            let _ = reply.send(Err(ApiError::not_leader()));
            return;
        }

        let Ok(data) = serde_json::to_vec(op) else {
            let _ = reply.send(Err(ApiError::bad_request("operation serialization failed")));
            return;
        };

        let (raw_reply, raw_response) = oneshot::channel::<Result<OpResult, ApiError>>();
        self.pending.insert(op_id, raw_reply);
        tokio::spawn(async move {
            let _ = reply.send(match raw_response.await {
                Ok(result) => result.and_then(convert),
                Err(_) => Err(ApiError::timeout()),
            });
        });

        if let Replica::Group(handle) = &self.replica {
            // The actor must keep applying while the proposal is in
            // flight; only failures are routed back to the mailbox
            let handle = handle.clone();
            let commands = self.handle.commands.clone();
            tokio::spawn(async move {
                if let Err(error) = handle.propose(Bytes::from(data), PROPOSAL_DEADLINE).await {
                    let _ = commands
                        .send(StreamCommand::ProposalFailed { op_id, error })
                        .await;
                }
            });
        } else if let Err(error) = self
            .replica
            .propose(Bytes::from(data), PROPOSAL_DEADLINE)
            .await
        {
            if let Some(raw_reply) = self.pending.remove(&op_id) {
                let _ = raw_reply.send(Err(group_error(&error)));
            }
        }
    }

    async fn handle_applied(&mut self, applied: Applied) {
        match applied {
            Applied::Entry { index, data } => {
                self.applied_entries += 1;
                let op = match serde_json::from_slice::<StreamOp>(&data) {
                    Ok(op) => op,
                    Err(err) => {
                        warn!(stream = %self.config.name, error = %err, "undecodable log entry");
                        return;
                    }
                };
                self.apply_op(op).await;
                self.maybe_offer_snapshot(index).await;
            }
            Applied::Snapshot { index: _, data } => {
                match StreamSnapshot::decode(&data) {
                    Ok(snapshot) => {
                        if let Err(err) = self.install_snapshot(snapshot).await {
                            warn!(stream = %self.config.name, error = %err, "snapshot install failed");
                        }
                    }
                    Err(err) => {
                        warn!(stream = %self.config.name, error = %err, "undecodable snapshot");
                    }
                }
            }
        }
    }

    async fn maybe_offer_snapshot(&mut self, index: u64) {
        if self.applied_entries % SNAPSHOT_EVERY != 0 {
            return;
        }
        if let Replica::Group(handle) = &self.replica {
            let handle = handle.clone();
            if let Ok(snapshot) = self.take_snapshot().await {
                handle.offer_snapshot(index, snapshot.encode());
            }
        }
    }

    async fn apply_op(&mut self, op: StreamOp) {
        match op {
            StreamOp::Publish {
                op_id,
                origin,
                message,
                sourced,
            } => {
                let result = self.apply_publish(message, sourced).await;
                self.reply_to(op_id, &origin, result.map(OpResult::PubAck));
            }
            StreamOp::DeleteMessage {
                op_id,
                origin,
                sequence,
            } => {
                let result = {
                    let mut store = self.store.write().await;
                    store.remove(sequence).map_err(store_error)
                };
                let result = match result {
                    Ok(true) => Ok(OpResult::Deleted(true)),
                    Ok(false) => Err(ApiError::message_not_found()),
                    Err(err) => Err(err),
                };
                self.update_usage().await;
                self.reply_to(op_id, &origin, result);
            }
            StreamOp::Purge {
                op_id,
                origin,
                request,
            } => {
                let options = PurgeOptions {
                    filter: request.filter,
                    sequence: request.sequence,
                    keep: request.keep,
                };
                let result = {
                    let mut store = self.store.write().await;
                    store.purge(&options).map_err(store_error)
                };
                self.update_usage().await;
                self.reply_to(op_id, &origin, result.map(OpResult::Purged));
            }
            StreamOp::UpdateConfig {
                op_id,
                origin,
                config,
            } => {
                let result = self.apply_config_update(*config).await;
                self.reply_to(
                    op_id,
                    &origin,
                    result.map(|info| OpResult::Updated(Box::new(info))),
                );
            }
        }
    }

    fn reply_to(&mut self, op_id: u64, origin: &str, result: Result<OpResult, ApiError>) {
        if origin == self.node {
            if let Some(reply) = self.pending.remove(&op_id) {
                let _ = reply.send(result);
            }
        }
    }

    /// The full publish pipeline, executed at commit time
    async fn apply_publish(
        &mut self,
        message: WireMessage,
        sourced: bool,
    ) -> Result<PubAck, ApiError> {
        let (subject, headers, payload) = message.into_parts()?;

        if !subject.is_literal() {
            return Err(ApiError::bad_request("subject must be literal"));
        }
        if !sourced
            && !self
                .config
                .subjects
                .iter()
                .any(|pattern| pattern.matches(&subject))
        {
            return Err(ApiError::bad_request("subject does not match the stream"));
        }

        if let Some(expected) = headers.get(&HeaderName::EXPECTED_STREAM) {
            if expected.as_str() != self.config.name.as_str() {
                return Err(ApiError::expected_stream_mismatch());
            }
        }

        let last_sequence = self.store.read().await.last_sequence();
        if let Some(expected) = header_u64(&headers, &HeaderName::EXPECTED_LAST_SEQUENCE)? {
            if expected != last_sequence {
                return Err(ApiError::wrong_last_sequence(last_sequence));
            }
        }

        if let Some(expected) = headers.get(&HeaderName::EXPECTED_LAST_MESSAGE_ID) {
            let matches = self
                .last_msg_id
                .as_ref()
                .map_or(false, |last| last.as_bytes() == expected.as_str().as_bytes());
            if !matches {
                return Err(ApiError::wrong_last_message_id(
                    self.last_msg_id.as_deref().unwrap_or(""),
                ));
            }
        }

        if let Some(expected) =
            header_u64(&headers, &HeaderName::EXPECTED_LAST_SUBJECT_SEQUENCE)?
        {
            let last_for_subject = {
                let store = self.store.read().await;
                store.last_per_subject(&subject).last().copied().unwrap_or(0)
            };
            if expected != last_for_subject {
                return Err(ApiError::wrong_last_sequence(last_for_subject));
            }
        }

        let msg_id = headers
            .get(&HeaderName::MESSAGE_ID)
            .map(|value| ByteString::from(value.as_str().to_owned()));
        if let Some(msg_id) = &msg_id {
            if let Some(original) = self.dedup.check(msg_id) {
                return Ok(PubAck {
                    stream: self.config.name.clone(),
                    sequence: original,
                    duplicate: true,
                    domain: self.domain.clone(),
                });
            }
        }

        // Rollup replaces prior messages before the append
        if let Some(rollup) = headers.get(&HeaderName::ROLLUP) {
            let options = match rollup.as_str() {
                "all" => PurgeOptions::default(),
                "sub" => PurgeOptions {
                    filter: Some(subject.clone()),
                    ..PurgeOptions::default()
                },
                _ => return Err(ApiError::bad_request("invalid rollup header")),
            };
            let mut store = self.store.write().await;
            store.purge(&options).map_err(store_error)?;
        }

        self.account.check_capacity(
            self.config.storage,
            (subject.len() + payload.len()) as u64,
        )?;

        let (sequence, timestamp) = {
            let mut store = self.store.write().await;
            store
                .append(subject.clone(), headers, payload)
                .map_err(store_error)?
        };
        self.update_usage().await;

        self.last_msg_id = msg_id.clone();
        if let Some(msg_id) = msg_id {
            self.dedup.insert(msg_id, sequence, Instant::now());
            if !self.dedup_timer_armed && !self.dedup.window().is_zero() {
                self.timers
                    .schedule(Instant::now() + self.dedup.window(), StreamTimer::DedupEvict);
                self.dedup_timer_armed = true;
            }
        }

        if !self.config.max_age.is_zero() && !self.age_timer_armed {
            self.timers
                .schedule(Instant::now() + self.config.max_age, StreamTimer::AgeExpiry);
            self.age_timer_armed = true;
        }

        // Interest retention with nobody interested drops immediately
        if matches!(self.config.retention, RetentionPolicy::Interest)
            && !self
                .consumers
                .values()
                .any(|entry| filter_matches(&entry.config, &subject))
        {
            let mut store = self.store.write().await;
            store.remove(sequence).map_err(store_error)?;
        } else {
            for entry in self.consumers.values() {
                entry.handle.notify();
            }
        }

        debug!(stream = %self.config.name, sequence, "message committed");
        Ok(PubAck {
            stream: self.config.name.clone(),
            sequence,
            duplicate: false,
            domain: self.domain.clone(),
        })
    }

    async fn apply_config_update(&mut self, new: StreamConfig) -> Result<StreamInfo, ApiError> {
        let old = &self.config;
        if new.name != old.name {
            return Err(ApiError::bad_request("stream name cannot be changed"));
        }
        if new.storage != old.storage {
            return Err(ApiError::bad_request("storage kind cannot be changed"));
        }
        if new.retention != old.retention {
            return Err(ApiError::bad_request("retention policy cannot be changed"));
        }
        if new.replicas != old.replicas && (new.replicas.get() > 1 || old.replicas.get() > 1) {
            return Err(ApiError::bad_request("replica count cannot be changed"));
        }
        if old.max_consumers.is_some() && new.max_consumers != old.max_consumers {
            return Err(ApiError::bad_request("max consumers cannot be changed"));
        }
        if new.template_owner != old.template_owner {
            return Err(ApiError::bad_request("template owner cannot be changed"));
        }
        if new.mirror != old.mirror || new.sources != old.sources {
            return Err(ApiError::bad_request("mirror and sources cannot be changed"));
        }

        let subjects_changed = new.subjects != self.config.subjects;
        self.config = new;
        if subjects_changed {
            self.start_ingest();
        }
        self.dedup.set_window(self.config.duplicate_window);
        {
            let mut store = self.store.write().await;
            store
                .update_config(store_config(&self.config))
                .map_err(store_error)?;
        }
        self.update_usage().await;
        self.advisories.stream_updated(&self.config.name);
        Ok(self.build_info().await)
    }

    async fn handle_consumer_ack(&mut self, consumer: &Name, sequence: u64) {
        match self.config.retention {
            RetentionPolicy::WorkQueue => {
                let mut store = self.store.write().await;
                if let Err(err) = store.remove(sequence) {
                    debug!(stream = %self.config.name, %consumer, sequence, error = %err,
                        "work queue removal skipped");
                }
                drop(store);
                self.update_usage().await;
            }
            RetentionPolicy::Interest | RetentionPolicy::Limits => {}
        }
    }

    /// Remove messages every interested consumer has acknowledged
    async fn apply_interest_retention(&mut self) {
        let candidates = {
            let store = self.store.read().await;
            let mut sequence = store.first_sequence();
            let mut out = Vec::new();
            while let Some(found) = store.next_matching(sequence, None) {
                let Ok(message) = store.load(found) else {
                    break;
                };
                let acked_by_all = self
                    .consumers
                    .values()
                    .filter(|entry| filter_matches(&entry.config, &message.subject))
                    .all(|entry| {
                        self.floors
                            .get(&entry.config.name)
                            .map_or(false, |&floor| floor >= found)
                    });
                if !acked_by_all {
                    break;
                }
                out.push(found);
                sequence = found + 1;
            }
            out
        };

        if candidates.is_empty() {
            return;
        }
        let mut store = self.store.write().await;
        for sequence in candidates {
            let _ = store.remove(sequence);
        }
        drop(store);
        self.update_usage().await;
    }

    async fn add_consumer(
        &mut self,
        config: ConsumerConfig,
        restored: Option<ConsumerState>,
    ) -> Result<ConsumerInfo, ApiError> {
        // Re-creating an existing consumer updates its mutable subset
        if let Some(entry) = self.consumers.get_mut(&config.name) {
            if !consumer::update_compatible(&entry.config, &config) {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    granary_proto::error::ErrorCode::CONSUMER_NAME_IN_USE,
                    "consumer name already in use",
                ));
            }
            let info = entry.handle.update(config.clone()).await?;
            entry.config = config;
            return Ok(info);
        }
        if let Some(max) = self.config.max_consumers {
            if self.consumers.len() >= max as usize {
                return Err(ApiError::maximum_consumers_reached());
            }
        }
        consumer::validate(&config, &self.config, &self.consumers_configs(), &self.router)?;
        self.account.reserve_consumer()?;

        let handle = consumer::spawn(ConsumerContext {
            stream: self.handle.clone(),
            stream_config: self.config.clone(),
            config: config.clone(),
            router: self.router.clone(),
            advisories: self.advisories.clone(),
            restored,
            created_at: Utc::now(),
        });
        let info = handle.info().await?;
        self.consumers.insert(
            config.name.clone(),
            ConsumerEntry {
                handle,
                config: config.clone(),
            },
        );

        if matches!(config.durability, ConsumerDurability::Durable) {
            if let Some(dir) = self.consumer_dir(&config.name) {
                let write = std::fs::create_dir_all(&dir).and_then(|()| {
                    let encoded = serde_json::to_vec(&ConsumerMeta {
                        config: config.clone(),
                        created_at: info.created_at,
                    })?;
                    std::fs::write(dir.join("meta"), encoded)
                });
                if let Err(err) = write {
                    warn!(stream = %self.config.name, consumer = %config.name, error = %err,
                        "consumer meta persistence failed");
                }
            }
        }

        self.advisories
            .consumer_created(&self.config.name, &config.name);
        Ok(info)
    }

    fn consumers_configs(&self) -> Vec<ConsumerConfig> {
        self.consumers
            .values()
            .map(|entry| entry.config.clone())
            .collect()
    }

    async fn delete_consumer(&mut self, name: &Name) -> Result<(), ApiError> {
        let entry = self
            .consumers
            .remove(name)
            .ok_or_else(ApiError::consumer_not_found)?;
        entry.handle.stop().await;
        self.floors.remove(name);
        if let Some(dir) = self.consumer_dir(name) {
            let _ = std::fs::remove_dir_all(dir);
        }
        self.account.release_consumer();
        self.advisories.consumer_deleted(&self.config.name, name);
        Ok(())
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();
        while let Some(timer) = self.timers.pop_due(now) {
            match timer {
                StreamTimer::AgeExpiry => {
                    self.age_timer_armed = false;
                    let result = {
                        let mut store = self.store.write().await;
                        store.expire(Utc::now())
                    };
                    match result {
                        Ok((removed, next)) => {
                            if removed > 0 {
                                self.update_usage().await;
                            }
                            if let Some(next) = next {
                                let delay = (next - Utc::now())
                                    .to_std()
                                    .unwrap_or(Duration::from_millis(1));
                                self.timers
                                    .schedule(Instant::now() + delay, StreamTimer::AgeExpiry);
                                self.age_timer_armed = true;
                            }
                        }
                        Err(err) => {
                            // Background eviction failures are retried
                            warn!(stream = %self.config.name, error = %err, "age eviction failed");
                            self.timers.schedule(
                                Instant::now() + Duration::from_secs(1),
                                StreamTimer::AgeExpiry,
                            );
                            self.age_timer_armed = true;
                        }
                    }
                }
                StreamTimer::DedupEvict => {
                    self.dedup_timer_armed = false;
                    if let Some(next) = self.dedup.evict(now) {
                        self.timers.schedule(next, StreamTimer::DedupEvict);
                        self.dedup_timer_armed = true;
                    }
                }
            }
        }
    }

    async fn update_usage(&mut self) {
        let bytes = self.store.read().await.state().bytes;
        self.account
            .usage()
            .update_stored(self.config.storage, self.reported_bytes, bytes);
        self.reported_bytes = bytes;
    }

    async fn take_snapshot(&mut self) -> Result<StreamSnapshot, ApiError> {
        let store_snapshot = {
            let store = self.store.read().await;
            store.snapshot().map_err(store_error)?
        };

        let mut consumers = Vec::with_capacity(self.consumers.len());
        for entry in self.consumers.values() {
            if let Ok(state) = entry.handle.state().await {
                consumers.push(state);
            }
        }

        Ok(StreamSnapshot {
            config: self.config.clone(),
            state: stream_state(store_snapshot.state(), self.consumers.len()),
            consumers,
            store: store_snapshot.into_bytes(),
        })
    }

    async fn install_snapshot(&mut self, snapshot: StreamSnapshot) -> Result<StreamInfo, ApiError> {
        for (_, entry) in std::mem::take(&mut self.consumers) {
            entry.handle.stop().await;
            self.account.release_consumer();
        }
        self.floors.clear();

        {
            let mut store = self.store.write().await;
            let restored = match &self.store_dir {
                Some(dir) => {
                    // Drop the old backing before re-opening its directory
                    *store = Store::memory(StoreConfig::default());
                    let _ = std::fs::remove_dir_all(dir.join("msgs"));
                    Store::restore_file(dir, store_config(&self.config), &snapshot.store)
                        .map_err(store_error)?
                }
                None => Store::restore_memory(store_config(&self.config), &snapshot.store)
                    .map_err(store_error)?,
            };
            *store = restored;
        }
        self.update_usage().await;

        for state in snapshot.consumers {
            let config = state.config.clone();
            if let Err(err) = self.add_consumer(config, Some(state)).await {
                warn!(stream = %self.config.name, error = %err, "consumer restore failed");
            }
        }

        Ok(self.build_info().await)
    }

    async fn build_info(&self) -> StreamInfo {
        let state = {
            let store = self.store.read().await;
            stream_state(&store.state(), self.consumers.len())
        };

        let cluster = match &self.replica {
            Replica::Solo(_) => None,
            Replica::Group(handle) => {
                let status = handle.status();
                Some(ClusterInfo {
                    name: None,
                    leader: status.leader.clone(),
                    replicas: status
                        .peers
                        .iter()
                        .map(|peer| PeerInfo {
                            name: peer.clone(),
                            current: status.leader.as_deref() == Some(peer),
                            offline: false,
                            active: Duration::ZERO,
                            lag: 0,
                        })
                        .collect(),
                })
            }
        };

        let mut mirror = None;
        let mut sources = Vec::new();
        for driver in &self.sources {
            let info = driver.progress();
            if self.config.mirror.is_some() {
                mirror = Some(info);
            } else {
                sources.push(info);
            }
        }

        StreamInfo {
            config: self.config.clone(),
            created_at: self.created_at,
            state,
            cluster,
            mirror,
            sources,
        }
    }
}

fn filter_matches(config: &ConsumerConfig, subject: &Subject) -> bool {
    config
        .filter_subject
        .as_ref()
        .map_or(true, |filter| filter.matches(subject))
}

fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("invalid numeric header {name}"))),
    }
}

/// Derive the store-level limits from a stream configuration
pub(crate) fn store_config(config: &StreamConfig) -> StoreConfig {
    StoreConfig {
        max_messages: config.max_messages,
        max_bytes: config.max_bytes,
        max_age: (!config.max_age.is_zero()).then_some(config.max_age),
        max_message_size: config.max_message_size,
        max_messages_per_subject: config.max_messages_per_subject,
        discard: config.discard_policy,
    }
}

pub(crate) fn stream_state(state: &granary_store::StoreState, consumers: usize) -> StreamState {
    StreamState {
        messages: state.messages,
        bytes: state.bytes,
        first_sequence: state.first_sequence,
        first_timestamp: state.first_timestamp,
        last_sequence: state.last_sequence,
        last_timestamp: state.last_timestamp,
        num_deleted: state.num_deleted,
        deleted: state.deleted.clone(),
        consumer_count: u32::try_from(consumers).unwrap_or(u32::MAX),
    }
}

fn store_error(error: StoreError) -> ApiError {
    match error {
        StoreError::MaximumMessages => ApiError::maximum_messages_exceeded(),
        StoreError::MaximumBytes => ApiError::maximum_bytes_exceeded(),
        StoreError::MaximumMessagesPerSubject => ApiError::maximum_messages_per_subject_exceeded(),
        StoreError::MessageSize => ApiError::message_size_exceeds_maximum(),
        StoreError::NotFound => ApiError::message_not_found(),
        StoreError::BadPurge => ApiError::bad_request("keep and sequence are mutually exclusive"),
        StoreError::Io(_) | StoreError::Corrupt { .. } | StoreError::BadSnapshot => {
            ApiError::insufficient_resources()
        }
    }
}

fn group_error(error: &GroupError) -> ApiError {
    match error {
        GroupError::NotLeader { .. } => ApiError::not_leader(),
        GroupError::NoQuorum | GroupError::LostLeadership | GroupError::Closed => {
            ApiError::system_unavailable()
        }
        GroupError::Timeout => ApiError::timeout(),
    }
}
