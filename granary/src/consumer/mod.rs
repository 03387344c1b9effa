use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use granary_proto::{
    api::{
        AckPolicy, ConsumerConfig, ConsumerDurability, ConsumerInfo, ConsumerSpecificConfig,
        DeliverPolicy, PullRequest, ReplayPolicy, RetentionPolicy, SequenceInfo, StreamConfig,
    },
    error::{ApiError, ErrorCode},
    headers::{HeaderMap, HeaderName, HeaderValue},
    AckKind, AckReply, MessageBase, Name, StatusCode, StoredMessage, Subject,
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tracing::debug;

use crate::{
    advisory::Advisories,
    router::{Router, Subscription},
    stream::StreamHandle,
    timer::TimerHeap,
};

const COMMAND_BUFFER: usize = 256;
/// Messages dispatched per wakeup before yielding back to the mailbox
const DISPATCH_BUDGET: usize = 64;
const DEFAULT_MAX_WAITING: usize = 512;
const DEFAULT_MAX_ACK_PENDING: usize = 1024;
/// Ephemeral consumers without an explicit threshold are collected
/// after this long without interest
const DEFAULT_INACTIVE_THRESHOLD: Duration = Duration::from_secs(5);
/// Lower bound on configured idle heartbeat intervals
const MIN_IDLE_HEARTBEAT: Duration = Duration::from_millis(100);
/// Push flow control interleaves a request every this many bytes
const FLOW_CONTROL_WINDOW: u64 = 32 * 1024;
/// How often push consumers re-check subscriber interest
const INTEREST_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A cloneable handle to a consumer actor
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    name: Name,
    commands: mpsc::Sender<ConsumerCommand>,
}

#[derive(Debug)]
enum ConsumerCommand {
    /// The stream appended a message this consumer may care about
    Notify,
    Pull {
        request: PullRequest,
        reply_subject: Subject,
    },
    Info {
        reply: oneshot::Sender<ConsumerInfo>,
    },
    Update {
        config: Box<ConsumerConfig>,
        reply: oneshot::Sender<ConsumerInfo>,
    },
    State {
        reply: oneshot::Sender<ConsumerState>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// The replicable state of a consumer, captured in stream snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerState {
    pub config: ConsumerConfig,
    pub created_at: DateTime<Utc>,
    pub delivered: SequenceInfo,
    pub ack_floor: SequenceInfo,
    pub pending: Vec<PendingEntry>,
    pub num_redelivered: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PendingEntry {
    pub stream_seq: u64,
    pub consumer_seq: u64,
    pub delivery_count: u64,
}

impl ConsumerHandle {
    #[must_use]
    pub fn name(&self) -> &Name {
        &self.name
    }

    pub(crate) fn notify(&self) {
        // A full mailbox is fine, the actor re-checks the store anyway
        let _ = self.commands.try_send(ConsumerCommand::Notify);
    }

    pub(crate) async fn pull(&self, request: PullRequest, reply_subject: Subject) {
        let _ = self
            .commands
            .send(ConsumerCommand::Pull {
                request,
                reply_subject,
            })
            .await;
    }

    pub(crate) async fn info(&self) -> Result<ConsumerInfo, ApiError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ConsumerCommand::Info { reply })
            .await
            .map_err(|_| ApiError::consumer_not_found())?;
        response.await.map_err(|_| ApiError::consumer_not_found())
    }

    pub(crate) async fn update(&self, config: ConsumerConfig) -> Result<ConsumerInfo, ApiError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ConsumerCommand::Update {
                config: Box::new(config),
                reply,
            })
            .await
            .map_err(|_| ApiError::consumer_not_found())?;
        response.await.map_err(|_| ApiError::consumer_not_found())
    }

    pub(crate) async fn state(&self) -> Result<ConsumerState, ApiError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ConsumerCommand::State { reply })
            .await
            .map_err(|_| ApiError::consumer_not_found())?;
        response.await.map_err(|_| ApiError::consumer_not_found())
    }

    pub(crate) async fn stop(&self) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(ConsumerCommand::Stop { reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }
}

/// Validate a consumer configuration against its stream
///
/// # Errors
///
/// Returns the policy violation a careful caller can correct.
pub(crate) fn validate(
    config: &ConsumerConfig,
    stream: &StreamConfig,
    existing: &[ConsumerConfig],
    router: &Router,
) -> Result<(), ApiError> {
    if config.description.len() > 4 * 1024 {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            ErrorCode::DESCRIPTION_TOO_LONG,
            "consumer description is too long",
        ));
    }

    if let Some(filter) = &config.filter_subject {
        if !stream.subjects.is_empty()
            && !stream
                .subjects
                .iter()
                .any(|subject| filter.is_subset_of(subject))
        {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                ErrorCode::INVALID_SUBJECT,
                "filter subject is not a subset of the stream subjects",
            ));
        }
    }

    if matches!(config.deliver_policy, DeliverPolicy::LastPerSubject)
        && config.filter_subject.is_none()
    {
        return Err(ApiError::bad_request(
            "deliver policy last_per_subject requires a filter subject",
        ));
    }

    if matches!(stream.retention, RetentionPolicy::WorkQueue) {
        if !matches!(config.ack_policy, AckPolicy::Explicit { .. }) {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                ErrorCode::WORK_QUEUE_REQUIRES_EXPLICIT_ACK,
                "workqueue retention requires explicit ack",
            ));
        }
        for other in existing {
            let overlaps = match (&config.filter_subject, &other.filter_subject) {
                (Some(a), Some(b)) => a.overlaps(b),
                _ => true,
            };
            if overlaps {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    ErrorCode::WORK_QUEUE_OVERLAP,
                    "multiple consumers cannot observe the same workqueue message",
                ));
            }
        }
    }

    match &config.specs {
        ConsumerSpecificConfig::Pull { .. } => {
            if matches!(config.durability, ConsumerDurability::Ephemeral) {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    ErrorCode::EPHEMERAL_WITH_DURABLE_NAME,
                    "pull consumers must be durable",
                ));
            }
            if config.rate_limit.is_some()
                || config.flow_control
                || !config.idle_heartbeat.is_zero()
            {
                return Err(ApiError::bad_request(
                    "rate limit, flow control and idle heartbeats are push only",
                ));
            }
        }
        ConsumerSpecificConfig::Push { deliver_subject, .. } => {
            if !deliver_subject.is_literal() {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    ErrorCode::INVALID_DELIVER_SUBJECT,
                    "deliver subject must be literal",
                ));
            }
            if stream
                .subjects
                .iter()
                .any(|subject| subject.matches(deliver_subject))
            {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    ErrorCode::INVALID_DELIVER_SUBJECT,
                    "deliver subject forms a cycle with the stream subjects",
                ));
            }
            if matches!(config.durability, ConsumerDurability::Ephemeral)
                && !router.has_interest(deliver_subject)
            {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    ErrorCode::PUSH_CONSUMER_REQUIRES_INTEREST,
                    "ephemeral push consumer requires an active subscription",
                ));
            }
        }
    }

    Ok(())
}

/// Whether `new` differs from `old` only in fields a consumer update
/// may change
pub(crate) fn update_compatible(old: &ConsumerConfig, new: &ConsumerConfig) -> bool {
    let specs_compatible = match (&old.specs, &new.specs) {
        (ConsumerSpecificConfig::Pull { .. }, ConsumerSpecificConfig::Pull { .. }) => true,
        (
            ConsumerSpecificConfig::Push {
                deliver_subject: old_subject,
                deliver_group: old_group,
            },
            ConsumerSpecificConfig::Push {
                deliver_subject: new_subject,
                deliver_group: new_group,
            },
        ) => old_subject == new_subject && old_group == new_group,
        _ => false,
    };
    let ack_compatible = matches!(
        (&old.ack_policy, &new.ack_policy),
        (AckPolicy::Explicit { .. }, AckPolicy::Explicit { .. })
            | (AckPolicy::All { .. }, AckPolicy::All { .. })
            | (AckPolicy::None, AckPolicy::None)
    );

    specs_compatible
        && ack_compatible
        && old.durability == new.durability
        && old.deliver_policy == new.deliver_policy
        && old.filter_subject == new.filter_subject
        && old.replay_policy == new.replay_policy
}

#[derive(Debug)]
pub(crate) struct ConsumerContext {
    pub(crate) stream: StreamHandle,
    pub(crate) stream_config: StreamConfig,
    pub(crate) config: ConsumerConfig,
    pub(crate) router: Router,
    pub(crate) advisories: Advisories,
    pub(crate) restored: Option<ConsumerState>,
    pub(crate) created_at: DateTime<Utc>,
}

pub(crate) fn spawn(context: ConsumerContext) -> ConsumerHandle {
    let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let handle = ConsumerHandle {
        name: context.config.name.clone(),
        commands: commands.clone(),
    };

    tokio::spawn(run(context, commands, commands_rx));
    handle
}

#[derive(Debug)]
enum ConsumerTimer {
    /// Ack wait elapsed for a delivered message
    AckWait { stream_seq: u64 },
    /// A negative ack asked for a delayed redelivery
    NakDelay { stream_seq: u64 },
    /// A waiting pull request expired
    PullExpiry { waiter: u64 },
    /// Push idle heartbeat tick
    Heartbeat,
    /// Push subscriber interest re-check
    InterestCheck,
    /// The inactive threshold elapsed without interest
    InactiveGc,
    /// Token bucket refilled enough to resume rate limited delivery
    RateRefill,
    /// Original-speed replay gate opened
    ReplayGate,
}

#[derive(Debug)]
struct Pending {
    consumer_seq: u64,
    delivery_count: u64,
    wait_until: Instant,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    reply_subject: Subject,
    batch_left: u64,
    bytes_left: Option<u64>,
    no_wait: bool,
}

struct ConsumerActor {
    stream: StreamHandle,
    stream_name: Name,
    retention: RetentionPolicy,
    config: ConsumerConfig,
    created_at: DateTime<Utc>,
    router: Router,
    advisories: Advisories,

    commands: mpsc::Receiver<ConsumerCommand>,
    self_commands: mpsc::Sender<ConsumerCommand>,
    ack_subscription: Subscription,
    fc_subscription: Option<Subscription>,

    /// Next new stream sequence to consider for delivery
    cursor: u64,
    /// Seeded by the last-per-subject deliver policy
    backlog: VecDeque<u64>,
    delivered: SequenceInfo,
    pending: BTreeMap<u64, Pending>,
    redeliver: VecDeque<u64>,
    num_redelivered: u64,

    waiting: VecDeque<Waiter>,
    next_waiter_id: u64,
    max_waiting: usize,
    max_ack_pending: usize,

    timers: TimerHeap<ConsumerTimer>,
    heartbeat_interval: Option<Duration>,
    delivered_since_heartbeat: bool,
    inactive_threshold: Duration,
    had_interest: bool,

    rate_tokens: f64,
    rate_refilled_at: Instant,
    bytes_since_fc: u64,
    fc_outstanding: Option<Subject>,
    fc_serial: u64,
    paused: bool,
    replay_gate: Option<Instant>,
    last_replayed_ts: Option<DateTime<Utc>>,

    stopping: bool,
}

async fn run(
    context: ConsumerContext,
    self_commands: mpsc::Sender<ConsumerCommand>,
    commands: mpsc::Receiver<ConsumerCommand>,
) {
    let ConsumerContext {
        stream,
        stream_config,
        config,
        router,
        advisories,
        restored,
        created_at,
    } = context;

    // Recovered consumers keep their original creation time
    let created_at = restored
        .as_ref()
        .map_or(created_at, |state| state.created_at);

    let stream_name = stream_config.name.clone();
    let ack_subscription = router.subscribe(
        Subject::from_dangerous_value(
            format!("$ACK.{stream_name}.{}.>", config.name).into(),
        ),
        None,
    );
    let fc_subscription = match &config.specs {
        ConsumerSpecificConfig::Push { .. } => Some(router.subscribe(
            Subject::from_dangerous_value(
                format!("$FC.{stream_name}.{}.*", config.name).into(),
            ),
            None,
        )),
        ConsumerSpecificConfig::Pull { .. } => None,
    };

    let max_waiting = match &config.specs {
        ConsumerSpecificConfig::Pull { max_waiting, .. } => {
            max_waiting.map_or(DEFAULT_MAX_WAITING, |n| n as usize)
        }
        ConsumerSpecificConfig::Push { .. } => 0,
    };
    let max_ack_pending = match config.ack_policy {
        AckPolicy::Explicit {
            max_pending: Some(n),
            ..
        } => n as usize,
        AckPolicy::Explicit { .. } => DEFAULT_MAX_ACK_PENDING,
        AckPolicy::All { .. } | AckPolicy::None => usize::MAX,
    };
    let heartbeat_interval = match &config.specs {
        ConsumerSpecificConfig::Push { .. } if !config.idle_heartbeat.is_zero() => {
            Some(config.idle_heartbeat.max(MIN_IDLE_HEARTBEAT))
        }
        _ => None,
    };
    let inactive_threshold = if config.inactive_threshold.is_zero() {
        DEFAULT_INACTIVE_THRESHOLD
    } else {
        config.inactive_threshold
    };

    let mut actor = ConsumerActor {
        stream,
        stream_name,
        retention: stream_config.retention,
        config,
        created_at,
        router,
        advisories,
        commands,
        self_commands,
        ack_subscription,
        fc_subscription,
        cursor: 1,
        backlog: VecDeque::new(),
        delivered: SequenceInfo::default(),
        pending: BTreeMap::new(),
        redeliver: VecDeque::new(),
        num_redelivered: 0,
        waiting: VecDeque::new(),
        next_waiter_id: 0,
        max_waiting,
        max_ack_pending,
        timers: TimerHeap::new(),
        heartbeat_interval,
        delivered_since_heartbeat: false,
        inactive_threshold,
        had_interest: true,
        rate_tokens: 0.0,
        rate_refilled_at: Instant::now(),
        bytes_since_fc: 0,
        fc_outstanding: None,
        fc_serial: 0,
        paused: false,
        replay_gate: None,
        last_replayed_ts: None,
        stopping: false,
    };

    actor.initialize(restored).await;
    actor.run().await;
}

impl ConsumerActor {
    async fn initialize(&mut self, restored: Option<ConsumerState>) {
        if let Some(state) = restored {
            self.delivered = state.delivered;
            self.cursor = state.delivered.stream_seq + 1;
            self.num_redelivered = state.num_redelivered;
            let now = Instant::now();
            for entry in state.pending {
                // In-flight deliveries are considered due immediately
                self.pending.insert(
                    entry.stream_seq,
                    Pending {
                        consumer_seq: entry.consumer_seq,
                        delivery_count: entry.delivery_count,
                        wait_until: now,
                    },
                );
                self.timers.schedule(
                    now,
                    ConsumerTimer::AckWait {
                        stream_seq: entry.stream_seq,
                    },
                );
            }
            return;
        }

        let store = self.stream.store().read().await;
        let first = store.first_sequence();
        let last = store.last_sequence();
        self.cursor = match self.config.deliver_policy {
            DeliverPolicy::All => first,
            DeliverPolicy::Last => {
                let filter = self
                    .config
                    .filter_subject
                    .clone()
                    .unwrap_or_else(|| Subject::from_static(">"));
                store
                    .last_per_subject(&filter)
                    .into_iter()
                    .max()
                    .unwrap_or(last + 1)
            }
            DeliverPolicy::New => last + 1,
            DeliverPolicy::StartSequence { sequence } => sequence.max(first),
            DeliverPolicy::StartTime { from } => store.first_for_time(from).unwrap_or(last + 1),
            DeliverPolicy::LastPerSubject => {
                if let Some(filter) = &self.config.filter_subject {
                    self.backlog = store.last_per_subject(filter).into();
                }
                last + 1
            }
        };
        drop(store);

        if self.heartbeat_interval.is_some() {
            self.arm_heartbeat();
        }
        if self.is_push() {
            self.timers
                .schedule(Instant::now() + INTEREST_CHECK_INTERVAL, ConsumerTimer::InterestCheck);
        }
    }

    /// Apply the mutable subset of a configuration update
    ///
    /// Callers have already checked the immutable fields.
    fn apply_update(&mut self, config: ConsumerConfig) {
        self.max_ack_pending = match config.ack_policy {
            AckPolicy::Explicit {
                max_pending: Some(n),
                ..
            } => n as usize,
            AckPolicy::Explicit { .. } => DEFAULT_MAX_ACK_PENDING,
            AckPolicy::All { .. } | AckPolicy::None => usize::MAX,
        };
        if let ConsumerSpecificConfig::Pull { max_waiting, .. } = &config.specs {
            self.max_waiting = max_waiting.map_or(DEFAULT_MAX_WAITING, |n| n as usize);
        }
        if !config.inactive_threshold.is_zero() {
            self.inactive_threshold = config.inactive_threshold;
        }
        self.config = config;
    }

    fn is_push(&self) -> bool {
        matches!(self.config.specs, ConsumerSpecificConfig::Push { .. })
    }

    fn arm_heartbeat(&mut self) {
        if let Some(interval) = self.heartbeat_interval {
            self.timers
                .schedule(Instant::now() + interval, ConsumerTimer::Heartbeat);
        }
    }

    async fn run(mut self) {
        // Deliver whatever the deliver policy already selected
        self.dispatch().await;

        while !self.stopping {
            let deadline = self.timers.next_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                ack = self.ack_subscription.recv() => {
                    match ack {
                        Some(ack) => self.handle_ack(ack).await,
                        None => break,
                    }
                }
                fc = recv_fc(&mut self.fc_subscription) => {
                    if fc.is_some() {
                        self.fc_outstanding = None;
                        self.paused = false;
                        self.dispatch().await;
                    }
                }
                () = time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => {
                    self.handle_timers().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: ConsumerCommand) {
        match command {
            ConsumerCommand::Notify => self.dispatch().await,
            ConsumerCommand::Pull {
                request,
                reply_subject,
            } => {
                self.handle_pull(request, reply_subject).await;
            }
            ConsumerCommand::Info { reply } => {
                let _ = reply.send(self.build_info().await);
            }
            ConsumerCommand::Update { config, reply } => {
                self.apply_update(*config);
                let _ = reply.send(self.build_info().await);
            }
            ConsumerCommand::State { reply } => {
                let _ = reply.send(self.build_state());
            }
            ConsumerCommand::Stop { reply } => {
                self.stopping = true;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_pull(&mut self, request: PullRequest, reply_subject: Subject) {
        if self.is_push() {
            self.send_status(&reply_subject, StatusCode::CONFLICT, "Push Consumer");
            return;
        }

        // Requests that cannot fit under max-ack-pending are rejected
        if self.pending.len() + usize::try_from(request.batch).unwrap_or(usize::MAX)
            > self.max_ack_pending
        {
            self.send_status(
                &reply_subject,
                StatusCode::CONFLICT,
                "Exceeded MaxAckPending",
            );
            return;
        }

        if request.no_wait && !self.has_deliverable().await {
            self.send_status(&reply_subject, StatusCode::NOT_FOUND, "No Messages");
            return;
        }

        // The oldest waiter goes stale when the queue is at capacity
        if self.waiting.len() >= self.max_waiting {
            if let Some(stale) = self.waiting.pop_front() {
                self.send_status(
                    &stale.reply_subject,
                    StatusCode::REQUEST_TIMEOUT,
                    "Request Timeout",
                );
            }
        }

        self.next_waiter_id += 1;
        let id = self.next_waiter_id;
        if let Some(expires) = request.expires {
            self.timers
                .schedule(Instant::now() + expires, ConsumerTimer::PullExpiry { waiter: id });
        }
        self.waiting.push_back(Waiter {
            id,
            reply_subject,
            batch_left: request.batch.max(1),
            bytes_left: request.max_bytes,
            no_wait: request.no_wait,
        });

        self.dispatch().await;

        // A no-wait request never lingers once the backlog is drained
        if request.no_wait {
            self.waiting.retain(|waiter| waiter.id != id);
        }
    }

    async fn handle_ack(&mut self, message: MessageBase) {
        let Ok(reply) = AckReply::from_subject(&message.subject) else {
            debug!(consumer = %self.config.name, "malformed ack subject");
            return;
        };
        let Ok(kind) = AckKind::from_payload(&message.payload) else {
            debug!(consumer = %self.config.name, "malformed ack payload");
            return;
        };

        match kind {
            AckKind::Ack => self.apply_ack(reply.stream_sequence).await,
            AckKind::Nak { delay } => {
                if self.pending.contains_key(&reply.stream_sequence) {
                    match delay {
                        None => {
                            self.queue_redelivery(reply.stream_sequence);
                            self.dispatch().await;
                        }
                        Some(delay) => self.timers.schedule(
                            Instant::now() + delay,
                            ConsumerTimer::NakDelay {
                                stream_seq: reply.stream_sequence,
                            },
                        ),
                    }
                }
            }
            AckKind::InProgress => {
                if let Some(wait) = self.config.ack_policy.wait() {
                    if let Some(pending) = self.pending.get_mut(&reply.stream_sequence) {
                        pending.wait_until = Instant::now() + wait;
                        self.timers.schedule(
                            pending.wait_until,
                            ConsumerTimer::AckWait {
                                stream_seq: reply.stream_sequence,
                            },
                        );
                    }
                }
            }
            AckKind::Term => {
                if self.pending.remove(&reply.stream_sequence).is_some() {
                    self.advisories.terminated_delivery(
                        &self.stream_name,
                        &self.config.name,
                        reply.stream_sequence,
                    );
                    self.report_floor();
                }
            }
            AckKind::Next { request } => {
                self.apply_ack(reply.stream_sequence).await;
                if let Some(reply_subject) = message.reply_subject {
                    self.handle_pull(request, reply_subject).await;
                }
            }
        }
    }

    async fn apply_ack(&mut self, stream_seq: u64) {
        match self.config.ack_policy {
            AckPolicy::None => {}
            AckPolicy::Explicit { .. } => {
                if self.pending.remove(&stream_seq).is_some() {
                    self.acked_from_store(stream_seq).await;
                    self.report_floor();
                    self.dispatch().await;
                }
            }
            AckPolicy::All { .. } => {
                // Collapse everything at or below the acked sequence
                let acked = self
                    .pending
                    .range(..=stream_seq)
                    .map(|(&seq, _)| seq)
                    .collect::<Vec<_>>();
                if !acked.is_empty() {
                    for seq in acked {
                        self.pending.remove(&seq);
                        self.acked_from_store(seq).await;
                    }
                    self.report_floor();
                    self.dispatch().await;
                }
            }
        }
    }

    async fn acked_from_store(&self, stream_seq: u64) {
        if matches!(self.retention, RetentionPolicy::WorkQueue) {
            self.stream
                .consumer_acked(self.config.name.clone(), stream_seq);
        }
    }

    fn ack_floor(&self) -> SequenceInfo {
        match self.pending.first_key_value() {
            Some((&lowest, pending)) => SequenceInfo {
                stream_seq: lowest.saturating_sub(1),
                consumer_seq: pending.consumer_seq.saturating_sub(1),
            },
            None => self.delivered,
        }
    }

    fn report_floor(&mut self) {
        let floor = self.ack_floor();
        self.stream
            .consumer_floor(self.config.name.clone(), floor.stream_seq);
    }

    fn queue_redelivery(&mut self, stream_seq: u64) {
        if !self.redeliver.contains(&stream_seq) {
            self.redeliver.push_back(stream_seq);
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();
        let mut needs_dispatch = false;

        while let Some(timer) = self.timers.pop_due(now) {
            match timer {
                ConsumerTimer::AckWait { stream_seq } => {
                    let Some(pending) = self.pending.get(&stream_seq) else {
                        continue;
                    };
                    if pending.wait_until > now {
                        // The timer was reset by a working indication
                        self.timers
                            .schedule(pending.wait_until, ConsumerTimer::AckWait { stream_seq });
                        continue;
                    }
                    self.expire_delivery(stream_seq);
                    needs_dispatch = true;
                }
                ConsumerTimer::NakDelay { stream_seq } => {
                    if self.pending.contains_key(&stream_seq) {
                        self.queue_redelivery(stream_seq);
                        needs_dispatch = true;
                    }
                }
                ConsumerTimer::PullExpiry { waiter } => {
                    if let Some(position) =
                        self.waiting.iter().position(|entry| entry.id == waiter)
                    {
                        // A matched message beats a just-expired timer;
                        // only truly idle waiters get the timeout
                        let stale = self.waiting.remove(position).expect("position is valid");
                        self.send_status(
                            &stale.reply_subject,
                            StatusCode::REQUEST_TIMEOUT,
                            "Request Timeout",
                        );
                    }
                }
                ConsumerTimer::Heartbeat => {
                    if self.is_push() && !self.delivered_since_heartbeat {
                        self.send_control("Idle Heartbeat");
                    }
                    self.delivered_since_heartbeat = false;
                    self.arm_heartbeat();
                }
                ConsumerTimer::InterestCheck => {
                    self.check_interest();
                    self.timers
                        .schedule(now + INTEREST_CHECK_INTERVAL, ConsumerTimer::InterestCheck);
                }
                ConsumerTimer::InactiveGc => {
                    if matches!(self.config.durability, ConsumerDurability::Ephemeral)
                        && !self.has_interest()
                    {
                        // Self delete; the stream actor unregisters us
                        let stream = self.stream.clone();
                        let name = self.config.name.clone();
                        tokio::spawn(async move {
                            let _ = stream.delete_consumer(name).await;
                        });
                    }
                }
                ConsumerTimer::RateRefill | ConsumerTimer::ReplayGate => {
                    needs_dispatch = true;
                }
            }
        }

        if needs_dispatch {
            self.dispatch().await;
        }
    }

    fn expire_delivery(&mut self, stream_seq: u64) {
        let Some(pending) = self.pending.get(&stream_seq) else {
            return;
        };
        let max_deliver = self.config.max_deliver.map(u64::from);

        if max_deliver.map_or(false, |max| pending.delivery_count >= max) {
            let deliveries = pending.delivery_count;
            self.pending.remove(&stream_seq);
            self.advisories.max_deliveries(
                &self.stream_name,
                &self.config.name,
                stream_seq,
                deliveries,
            );
            self.report_floor();
            return;
        }

        self.queue_redelivery(stream_seq);
    }

    fn has_interest(&self) -> bool {
        match &self.config.specs {
            ConsumerSpecificConfig::Push { deliver_subject, .. } => {
                self.router.has_interest(deliver_subject)
            }
            // Pull consumers show interest by pulling
            ConsumerSpecificConfig::Pull { .. } => !self.waiting.is_empty(),
        }
    }

    fn check_interest(&mut self) {
        let interested = self.has_interest();
        if self.had_interest && !interested {
            self.timers.schedule(
                Instant::now() + self.inactive_threshold,
                ConsumerTimer::InactiveGc,
            );
        }
        self.had_interest = interested;
    }

    /// The heart of delivery: move due redeliveries and new messages
    /// to the subscriber or to waiting pulls
    async fn dispatch(&mut self) {
        let mut budget = DISPATCH_BUDGET;

        loop {
            if budget == 0 {
                // Yield to the mailbox, then continue
                let _ = self.self_commands.try_send(ConsumerCommand::Notify);
                return;
            }

            if self.is_push() {
                if self.paused || !self.push_gates_open() {
                    return;
                }
            } else if self.waiting.is_empty() {
                return;
            }

            if self.pending.len() >= self.max_ack_pending {
                return;
            }

            let Some(message) = self.next_deliverable().await else {
                return;
            };
            budget -= 1;
            self.deliver(message).await;
        }
    }

    fn push_gates_open(&mut self) -> bool {
        if let Some(gate) = self.replay_gate {
            let now = Instant::now();
            if gate > now {
                return false;
            }
            self.replay_gate = None;
        }
        true
    }

    async fn has_deliverable(&self) -> bool {
        if !self.redeliver.is_empty() || !self.backlog.is_empty() {
            return true;
        }
        let store = self.stream.store().read().await;
        store
            .next_matching(self.cursor, self.config.filter_subject.as_ref())
            .is_some()
    }

    /// The next message due for delivery: redeliveries first, then the
    /// last-per-subject backlog, then fresh messages from the cursor
    async fn next_deliverable(&mut self) -> Option<(StoredMessage, Origin)> {
        while let Some(seq) = self.redeliver.pop_front() {
            if !self.pending.contains_key(&seq) {
                continue;
            }
            let store = self.stream.store().read().await;
            match store.load(seq) {
                Ok(message) => return Some((message, Origin::Redelivery)),
                Err(_) => {
                    // Deleted under us; forget it
                    drop(store);
                    self.pending.remove(&seq);
                    self.report_floor();
                }
            }
        }

        while let Some(seq) = self.backlog.pop_front() {
            let store = self.stream.store().read().await;
            if let Ok(message) = store.load(seq) {
                return Some((message, Origin::Backlog));
            }
        }

        loop {
            let store = self.stream.store().read().await;
            let seq = store.next_matching(self.cursor, self.config.filter_subject.as_ref())?;
            match store.load(seq) {
                Ok(message) => {
                    drop(store);
                    self.cursor = seq + 1;
                    return Some((message, Origin::Fresh));
                }
                Err(_) => {
                    drop(store);
                    self.cursor = seq + 1;
                }
            }
        }
    }

    async fn deliver(&mut self, (message, origin): (StoredMessage, Origin)) {
        let is_redelivery = matches!(origin, Origin::Redelivery);

        // Rate limiting paces but never reorders
        if let Some(rate) = self.config.rate_limit {
            let bytes_per_sec = rate.get() as f64 / 8.0;
            let now = Instant::now();
            self.rate_tokens = (self.rate_tokens
                + now.duration_since(self.rate_refilled_at).as_secs_f64() * bytes_per_sec)
                .min(bytes_per_sec);
            self.rate_refilled_at = now;

            let cost = message.payload.len() as f64;
            if self.rate_tokens < cost {
                let wait = (cost - self.rate_tokens) / bytes_per_sec;
                self.timers
                    .schedule(now + Duration::from_secs_f64(wait), ConsumerTimer::RateRefill);
                // Put it back where it came from
                match origin {
                    Origin::Redelivery => self.redeliver.push_front(message.sequence),
                    Origin::Backlog => self.backlog.push_front(message.sequence),
                    Origin::Fresh => self.cursor = message.sequence,
                }
                return;
            }
            self.rate_tokens -= cost;
        }

        let (consumer_seq, delivery_count) = if is_redelivery {
            let pending = self
                .pending
                .get_mut(&message.sequence)
                .expect("redeliveries stay pending");
            pending.delivery_count += 1;
            self.num_redelivered += 1;
            (pending.consumer_seq, pending.delivery_count)
        } else {
            self.delivered.consumer_seq += 1;
            self.delivered.stream_seq = self.delivered.stream_seq.max(message.sequence);
            (self.delivered.consumer_seq, 1)
        };

        let num_pending = {
            let store = self.stream.store().read().await;
            store.count_from(self.cursor, self.config.filter_subject.as_ref())
                + self.backlog.len() as u64
        };

        let reply = AckReply {
            stream: self.stream_name.clone(),
            consumer: self.config.name.clone(),
            delivery_count,
            stream_sequence: message.sequence,
            consumer_sequence: consumer_seq,
            timestamp: message.timestamp,
            pending: num_pending,
        };

        let mut headers = message.headers.clone();
        headers.insert(
            HeaderName::SUBJECT,
            HeaderValue::from_dangerous_value(message.subject.as_str().to_owned().into()),
        );
        headers.insert(
            HeaderName::STREAM,
            HeaderValue::from_dangerous_value(self.stream_name.as_str().to_owned().into()),
        );

        let target = match &self.config.specs {
            ConsumerSpecificConfig::Push { deliver_subject, .. } => deliver_subject.clone(),
            ConsumerSpecificConfig::Pull { .. } => {
                let waiter = self.waiting.front_mut().expect("dispatch checked waiting");
                let target = waiter.reply_subject.clone();
                waiter.batch_left -= 1;
                if let Some(bytes_left) = &mut waiter.bytes_left {
                    *bytes_left = bytes_left.saturating_sub(message.payload.len() as u64);
                }
                let exhausted = waiter.batch_left == 0
                    || waiter.bytes_left.map_or(false, |left| left == 0);
                if exhausted {
                    self.waiting.pop_front();
                }
                target
            }
        };

        if matches!(self.config.ack_policy, AckPolicy::Explicit { .. } | AckPolicy::All { .. })
            && !is_redelivery
        {
            let wait = self
                .config
                .ack_policy
                .wait()
                .filter(|wait| !wait.is_zero());
            let wait_until = wait.map_or_else(
                || Instant::now() + Duration::from_secs(30),
                |wait| Instant::now() + wait,
            );
            self.pending.insert(
                message.sequence,
                Pending {
                    consumer_seq,
                    delivery_count: 1,
                    wait_until,
                },
            );
            self.timers.schedule(
                wait_until,
                ConsumerTimer::AckWait {
                    stream_seq: message.sequence,
                },
            );
        } else if is_redelivery {
            if let Some(pending) = self.pending.get_mut(&message.sequence) {
                let wait = self
                    .config
                    .ack_policy
                    .wait()
                    .filter(|wait| !wait.is_zero())
                    .unwrap_or(Duration::from_secs(30));
                pending.wait_until = Instant::now() + wait;
                self.timers.schedule(
                    pending.wait_until,
                    ConsumerTimer::AckWait {
                        stream_seq: message.sequence,
                    },
                );
            }
        }

        // Original-speed replay keeps the inter-message gaps
        if self.is_push() && matches!(self.config.replay_policy, ReplayPolicy::Original) {
            if let Some(previous) = self.last_replayed_ts {
                let gap = (message.timestamp - previous)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if !gap.is_zero() {
                    self.replay_gate = Some(Instant::now() + gap);
                    self.timers.schedule(
                        Instant::now() + gap,
                        ConsumerTimer::ReplayGate,
                    );
                }
            }
            self.last_replayed_ts = Some(message.timestamp);
        }

        let payload_len = message.payload.len() as u64;
        self.router.publish(MessageBase {
            subject: target,
            reply_subject: Some(reply.to_subject()),
            headers,
            payload: message.payload,
        });
        self.delivered_since_heartbeat = true;

        // Flow control interleaves a request every window of bytes
        if self.is_push() && self.config.flow_control {
            self.bytes_since_fc += payload_len;
            if self.bytes_since_fc >= FLOW_CONTROL_WINDOW {
                self.bytes_since_fc = 0;
                if self.fc_outstanding.is_some() {
                    // The subscriber is behind a full window; stall
                    self.paused = true;
                } else {
                    self.send_flow_control();
                }
            }
        }
    }

    fn send_flow_control(&mut self) {
        self.fc_serial += 1;
        let reply = Subject::from_dangerous_value(
            format!("$FC.{}.{}.{}", self.stream_name, self.config.name, self.fc_serial).into(),
        );
        self.fc_outstanding = Some(reply.clone());

        let ConsumerSpecificConfig::Push { deliver_subject, .. } = &self.config.specs else {
            return;
        };
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::STATUS, HeaderValue::from_static("100"));
        headers.insert(
            HeaderName::DESCRIPTION,
            HeaderValue::from_static("FlowControl Request"),
        );
        self.router.publish(MessageBase {
            subject: deliver_subject.clone(),
            reply_subject: Some(reply),
            headers,
            payload: Bytes::new(),
        });
    }

    fn send_control(&self, description: &'static str) {
        let ConsumerSpecificConfig::Push { deliver_subject, .. } = &self.config.specs else {
            return;
        };
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::STATUS, HeaderValue::from_static("100"));
        headers.insert(
            HeaderName::DESCRIPTION,
            HeaderValue::from_static(description),
        );
        self.router.publish(MessageBase {
            subject: deliver_subject.clone(),
            reply_subject: None,
            headers,
            payload: Bytes::new(),
        });
    }

    fn send_status(&self, subject: &Subject, status: StatusCode, description: &'static str) {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::STATUS,
            HeaderValue::from_dangerous_value(status.to_string().into()),
        );
        headers.insert(
            HeaderName::DESCRIPTION,
            HeaderValue::from_static(description),
        );
        self.router.publish(MessageBase {
            subject: subject.clone(),
            reply_subject: None,
            headers,
            payload: Bytes::new(),
        });
    }

    async fn build_info(&self) -> ConsumerInfo {
        let num_pending = {
            let store = self.stream.store().read().await;
            store.count_from(self.cursor, self.config.filter_subject.as_ref())
                + self.backlog.len() as u64
        };

        ConsumerInfo {
            stream_name: self.stream_name.clone(),
            name: self.config.name.clone(),
            created_at: self.created_at,
            config: self.config.clone(),
            delivered: self.delivered,
            ack_floor: self.ack_floor(),
            num_ack_pending: self.pending.len() as u64,
            num_redelivered: self.num_redelivered,
            num_waiting: self.waiting.len() as u64,
            num_pending,
        }
    }

    fn build_state(&self) -> ConsumerState {
        ConsumerState {
            config: self.config.clone(),
            created_at: self.created_at,
            delivered: self.delivered,
            ack_floor: self.ack_floor(),
            pending: self
                .pending
                .iter()
                .map(|(&stream_seq, pending)| PendingEntry {
                    stream_seq,
                    consumer_seq: pending.consumer_seq,
                    delivery_count: pending.delivery_count,
                })
                .collect(),
            num_redelivered: self.num_redelivered,
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum Origin {
    Redelivery,
    Backlog,
    Fresh,
}

async fn recv_fc(subscription: &mut Option<Subscription>) -> Option<MessageBase> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending::<Option<MessageBase>>().await,
    }
}
