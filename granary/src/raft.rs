use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use rand::Rng as _;
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tracing::{debug, info, warn};

/// The identity of a node participating in replicated groups
pub type NodeId = String;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(150);
const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(300);
/// A leader that cannot reach a majority within this window steps down
const LEADER_LEASE: Duration = Duration::from_millis(1000);
const COMMAND_BUFFER: usize = 64;
const APPLY_BUFFER: usize = 256;

/// The in-process consensus transport
///
/// Groups address their peers as `(group, node)`; each replica task
/// registers an inbox here. The network is the external collaborator
/// seam: the group logic never touches sockets.
#[derive(Debug, Clone, Default)]
pub struct GroupNetwork {
    inner: Arc<Mutex<HashMap<(String, NodeId), mpsc::Sender<PeerMessage>>>>,
}

impl GroupNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, group: &str, node: &str, sender: mpsc::Sender<PeerMessage>) {
        self.inner
            .lock()
            .expect("network lock")
            .insert((group.to_owned(), node.to_owned()), sender);
    }

    fn deregister(&self, group: &str, node: &str) {
        self.inner
            .lock()
            .expect("network lock")
            .remove(&(group.to_owned(), node.to_owned()));
    }

    fn send(&self, group: &str, node: &str, message: PeerMessage) {
        let sender = self
            .inner
            .lock()
            .expect("network lock")
            .get(&(group.to_owned(), node.to_owned()))
            .cloned();
        if let Some(sender) = sender {
            // A full peer inbox is indistinguishable from a slow link;
            // the protocol retries via heartbeats
            let _ = sender.try_send(message);
        }
    }
}

#[derive(Debug, Clone)]
enum PeerMessage {
    RequestVote {
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    Vote {
        term: u64,
        from: NodeId,
        granted: bool,
    },
    AppendEntries {
        term: u64,
        leader: NodeId,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    },
    AppendReply {
        term: u64,
        from: NodeId,
        success: bool,
        match_index: u64,
    },
    InstallSnapshot {
        term: u64,
        leader: NodeId,
        last_index: u64,
        last_term: u64,
        data: Bytes,
    },
}

#[derive(Debug, Clone)]
struct LogEntry {
    term: u64,
    data: Bytes,
}

/// An entry the owner must apply to its state machine
#[derive(Debug)]
pub enum Applied {
    /// A committed log entry
    Entry { index: u64, data: Bytes },
    /// A snapshot replacing everything up to `index`
    Snapshot { index: u64, data: Bytes },
}

/// An error encountered while proposing to a replicated group
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("not the group leader")]
    NotLeader { leader: Option<NodeId> },
    #[error("no quorum available")]
    NoQuorum,
    #[error("leadership lost before commit")]
    LostLeadership,
    #[error("proposal timed out")]
    Timeout,
    #[error("group is shut down")]
    Closed,
}

/// The observable status of a replica
#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub term: u64,
    pub leader: Option<NodeId>,
    pub is_leader: bool,
    pub peers: Vec<NodeId>,
}

#[derive(Debug)]
enum GroupCommand {
    Propose {
        data: Bytes,
        reply: oneshot::Sender<Result<u64, GroupError>>,
    },
    Stepdown {
        reply: oneshot::Sender<bool>,
    },
    AddPeer {
        node: NodeId,
    },
    RemovePeer {
        node: NodeId,
    },
    /// The owner offers a compacted state machine snapshot covering
    /// every entry up to `index`
    OfferSnapshot {
        index: u64,
        data: Bytes,
    },
    Shutdown,
}

/// A cloneable handle to a replica task
#[derive(Debug, Clone)]
pub struct GroupHandle {
    commands: mpsc::Sender<GroupCommand>,
    status: Arc<ArcSwap<GroupStatus>>,
}

impl GroupHandle {
    /// Propose `data` for replication, resolving once committed
    ///
    /// # Errors
    ///
    /// Fails with [`GroupError::NotLeader`] on followers, with
    /// [`GroupError::Timeout`] if the commit doesn't happen within
    /// `deadline` and with [`GroupError::LostLeadership`] if an
    /// election interrupts the proposal. Timed out proposals may still
    /// commit later; callers retry idempotently.
    pub async fn propose(&self, data: Bytes, deadline: Duration) -> Result<u64, GroupError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(GroupCommand::Propose { data, reply })
            .await
            .map_err(|_| GroupError::Closed)?;

        match time::timeout(deadline, response).await {
            Err(_) => Err(GroupError::Timeout),
            Ok(Err(_)) => Err(GroupError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    #[must_use]
    pub fn status(&self) -> Arc<GroupStatus> {
        self.status.load_full()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.status.load().is_leader
    }

    /// Ask the replica to abdicate leadership
    pub async fn stepdown(&self) -> bool {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(GroupCommand::Stepdown { reply })
            .await
            .is_err()
        {
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub async fn add_peer(&self, node: NodeId) {
        let _ = self.commands.send(GroupCommand::AddPeer { node }).await;
    }

    pub async fn remove_peer(&self, node: NodeId) {
        let _ = self.commands.send(GroupCommand::RemovePeer { node }).await;
    }

    /// Offer a compacted snapshot so the log prefix can be discarded
    pub fn offer_snapshot(&self, index: u64, data: Bytes) {
        let _ = self
            .commands
            .try_send(GroupCommand::OfferSnapshot { index, data });
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(GroupCommand::Shutdown).await;
    }
}

/// Spawn a replica of `group` on `node` with the given peer set
///
/// Returns the handle and the channel of committed entries the owner
/// applies to its state machine.
#[must_use]
pub fn spawn_replica(
    group: &str,
    node: &str,
    peers: Vec<NodeId>,
    network: GroupNetwork,
) -> (GroupHandle, mpsc::Receiver<Applied>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (inbox_tx, inbox_rx) = mpsc::channel(APPLY_BUFFER);
    let (apply_tx, apply_rx) = mpsc::channel(APPLY_BUFFER);

    network.register(group, node, inbox_tx);

    let status = Arc::new(ArcSwap::from_pointee(GroupStatus {
        term: 0,
        leader: None,
        is_leader: false,
        peers: peers.clone(),
    }));

    let replica = ReplicaTask {
        group: group.to_owned(),
        node: node.to_owned(),
        peers,
        network,
        term: 0,
        voted_for: None,
        log: Vec::new(),
        first_index: 1,
        snapshot: None,
        commit_index: 0,
        applied_index: 0,
        role: Role::Follower,
        leader: None,
        status: Arc::clone(&status),
        commands: command_rx,
        inbox: inbox_rx,
        apply: apply_tx,
        pending: BTreeMap::new(),
        election_deadline: Instant::now() + election_timeout(),
    };
    tokio::spawn(replica.run());

    (
        GroupHandle {
            commands: command_tx,
            status,
        },
        apply_rx,
    )
}

fn election_timeout() -> Duration {
    rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN..ELECTION_TIMEOUT_MAX)
}

#[derive(Debug)]
enum Role {
    Follower,
    Candidate {
        votes: Vec<NodeId>,
    },
    Leader {
        next_index: HashMap<NodeId, u64>,
        match_index: HashMap<NodeId, u64>,
        acked_at: HashMap<NodeId, Instant>,
        heartbeat_due: Instant,
    },
}

#[derive(Debug)]
struct ReplicaTask {
    group: String,
    node: NodeId,
    peers: Vec<NodeId>,
    network: GroupNetwork,

    term: u64,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    /// Index of `log[0]`; entries below it live in the snapshot
    first_index: u64,
    snapshot: Option<(u64, u64, Bytes)>,
    commit_index: u64,
    applied_index: u64,

    role: Role,
    leader: Option<NodeId>,
    status: Arc<ArcSwap<GroupStatus>>,

    commands: mpsc::Receiver<GroupCommand>,
    inbox: mpsc::Receiver<PeerMessage>,
    apply: mpsc::Sender<Applied>,
    pending: BTreeMap<u64, oneshot::Sender<Result<u64, GroupError>>>,

    election_deadline: Instant,
}

impl ReplicaTask {
    async fn run(mut self) {
        loop {
            let timer = match &self.role {
                Role::Leader { heartbeat_due, .. } => *heartbeat_due,
                Role::Follower | Role::Candidate { .. } => self.election_deadline,
            };

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(GroupCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                message = self.inbox.recv() => {
                    match message {
                        Some(message) => self.handle_peer_message(message).await,
                        None => break,
                    }
                }
                () = time::sleep_until(timer) => self.handle_timer().await,
            }

            self.advance_applied().await;
            self.publish_status();
        }

        self.network.deregister(&self.group, &self.node);
        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(GroupError::Closed));
        }
    }

    fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn last_log_index(&self) -> u64 {
        self.first_index + self.log.len() as u64 - 1
    }

    fn last_log_term(&self) -> u64 {
        match self.log.last() {
            Some(entry) => entry.term,
            None => self.snapshot.as_ref().map_or(0, |(_, term, _)| *term),
        }
    }

    fn entry_term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if let Some((snap_index, snap_term, _)) = &self.snapshot {
            if index == *snap_index {
                return Some(*snap_term);
            }
        }
        let offset = index.checked_sub(self.first_index)?;
        self.log.get(usize::try_from(offset).ok()?).map(|e| e.term)
    }

    fn publish_status(&self) {
        self.status.store(Arc::new(GroupStatus {
            term: self.term,
            leader: self.leader.clone(),
            is_leader: matches!(self.role, Role::Leader { .. }),
            peers: self.peers.clone(),
        }));
    }

    fn broadcast(&self, message: &PeerMessage) {
        for peer in &self.peers {
            if peer != &self.node {
                self.network.send(&self.group, peer, message.clone());
            }
        }
    }

    fn become_follower(&mut self, term: u64, leader: Option<NodeId>) {
        if matches!(self.role, Role::Leader { .. }) {
            info!(group = %self.group, node = %self.node, term, "stepping down");
            for (_, reply) in std::mem::take(&mut self.pending) {
                let _ = reply.send(Err(GroupError::LostLeadership));
            }
        }
        if term > self.term {
            self.voted_for = None;
        }
        self.term = term;
        self.role = Role::Follower;
        self.leader = leader;
        self.election_deadline = Instant::now() + election_timeout();
    }

    fn start_election(&mut self) {
        self.term += 1;
        self.voted_for = Some(self.node.clone());
        self.leader = None;
        self.role = Role::Candidate {
            votes: vec![self.node.clone()],
        };
        self.election_deadline = Instant::now() + election_timeout();
        debug!(group = %self.group, node = %self.node, term = self.term, "starting election");

        let message = PeerMessage::RequestVote {
            term: self.term,
            candidate: self.node.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        self.broadcast(&message);
        self.maybe_win_election();
    }

    fn maybe_win_election(&mut self) {
        let Role::Candidate { votes } = &self.role else {
            return;
        };
        if votes.len() < self.quorum() {
            return;
        }

        info!(group = %self.group, node = %self.node, term = self.term, "elected leader");
        let next = self.last_log_index() + 1;
        let now = Instant::now();
        self.role = Role::Leader {
            next_index: self.peers.iter().map(|p| (p.clone(), next)).collect(),
            match_index: self.peers.iter().map(|p| (p.clone(), 0)).collect(),
            acked_at: self.peers.iter().map(|p| (p.clone(), now)).collect(),
            heartbeat_due: now,
        };
        self.leader = Some(self.node.clone());
    }

    async fn handle_timer(&mut self) {
        match &self.role {
            Role::Follower | Role::Candidate { .. } => self.start_election(),
            Role::Leader { .. } => {
                self.check_lease();
                if matches!(self.role, Role::Leader { .. }) {
                    self.send_heartbeats();
                }
            }
        }
    }

    fn check_lease(&mut self) {
        let fresh = {
            let Role::Leader { acked_at, .. } = &self.role else {
                return;
            };
            let now = Instant::now();
            self.peers
                .iter()
                .filter(|peer| {
                    **peer == self.node
                        || acked_at
                            .get(*peer)
                            .map_or(false, |at| now.duration_since(*at) < LEADER_LEASE)
                })
                .count()
        };
        if fresh < self.quorum() {
            warn!(group = %self.group, node = %self.node, "lost quorum, stepping down");
            let term = self.term;
            self.become_follower(term, None);
        }
    }

    fn send_heartbeats(&mut self) {
        let Role::Leader {
            next_index,
            heartbeat_due,
            ..
        } = &mut self.role
        else {
            return;
        };
        *heartbeat_due = Instant::now() + HEARTBEAT_INTERVAL;

        let next_index = next_index.clone();
        for peer in self.peers.clone() {
            if peer == self.node {
                continue;
            }
            let next = next_index.get(&peer).copied().unwrap_or(self.first_index);
            self.send_entries_to(&peer, next);
        }
    }

    fn send_entries_to(&self, peer: &str, next: u64) {
        if next < self.first_index {
            if let Some((last_index, last_term, data)) = &self.snapshot {
                self.network.send(
                    &self.group,
                    peer,
                    PeerMessage::InstallSnapshot {
                        term: self.term,
                        leader: self.node.clone(),
                        last_index: *last_index,
                        last_term: *last_term,
                        data: data.clone(),
                    },
                );
                return;
            }
        }

        let next = next.max(self.first_index);
        let prev_index = next - 1;
        let prev_term = self.entry_term(prev_index).unwrap_or(0);
        let offset = usize::try_from(next - self.first_index).unwrap_or(usize::MAX);
        let entries = self.log.get(offset..).unwrap_or(&[]).to_vec();

        self.network.send(
            &self.group,
            peer,
            PeerMessage::AppendEntries {
                term: self.term,
                leader: self.node.clone(),
                prev_index,
                prev_term,
                entries,
                commit_index: self.commit_index,
            },
        );
    }

    fn handle_command(&mut self, command: GroupCommand) {
        match command {
            GroupCommand::Propose { data, reply } => {
                if !matches!(self.role, Role::Leader { .. }) {
                    let _ = reply.send(Err(GroupError::NotLeader {
                        leader: self.leader.clone(),
                    }));
                    return;
                }

                self.log.push(LogEntry {
                    term: self.term,
                    data,
                });
                let index = self.last_log_index();
                self.pending.insert(index, reply);

                if self.peers.len() == 1 {
                    self.commit_index = index;
                    self.resolve_pending();
                } else {
                    self.send_heartbeats();
                }
            }
            GroupCommand::Stepdown { reply } => {
                let was_leader = matches!(self.role, Role::Leader { .. });
                if was_leader {
                    let term = self.term;
                    self.become_follower(term, None);
                    // Give another peer a head start on the election
                    self.election_deadline = Instant::now() + ELECTION_TIMEOUT_MAX;
                }
                let _ = reply.send(was_leader);
            }
            GroupCommand::AddPeer { node } => {
                if !self.peers.contains(&node) {
                    self.peers.push(node.clone());
                    if let Role::Leader {
                        next_index,
                        match_index,
                        acked_at,
                        ..
                    } = &mut self.role
                    {
                        next_index.insert(node.clone(), self.first_index);
                        match_index.insert(node.clone(), 0);
                        acked_at.insert(node, Instant::now());
                    }
                }
            }
            GroupCommand::RemovePeer { node } => {
                self.peers.retain(|peer| peer != &node);
                if let Role::Leader {
                    next_index,
                    match_index,
                    acked_at,
                    ..
                } = &mut self.role
                {
                    next_index.remove(&node);
                    match_index.remove(&node);
                    acked_at.remove(&node);
                }
            }
            GroupCommand::OfferSnapshot { index, data } => {
                if index <= self.commit_index && index >= self.first_index {
                    let term = self.entry_term(index).unwrap_or(self.term);
                    let keep = usize::try_from(index + 1 - self.first_index).unwrap_or(0);
                    self.log.drain(..keep.min(self.log.len()));
                    self.first_index = index + 1;
                    self.snapshot = Some((index, term, data));
                }
            }
            GroupCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_peer_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::RequestVote {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => {
                if term > self.term {
                    self.become_follower(term, None);
                }

                let up_to_date = (last_log_term, last_log_index)
                    >= (self.last_log_term(), self.last_log_index());
                let granted = term == self.term
                    && up_to_date
                    && self
                        .voted_for
                        .as_ref()
                        .map_or(true, |voted| voted == &candidate);
                if granted {
                    self.voted_for = Some(candidate.clone());
                    self.election_deadline = Instant::now() + election_timeout();
                }

                self.network.send(
                    &self.group,
                    &candidate,
                    PeerMessage::Vote {
                        term: self.term,
                        from: self.node.clone(),
                        granted,
                    },
                );
            }
            PeerMessage::Vote { term, from, granted } => {
                if term > self.term {
                    self.become_follower(term, None);
                    return;
                }
                if term == self.term && granted {
                    let voted = if let Role::Candidate { votes } = &mut self.role {
                        if !votes.contains(&from) {
                            votes.push(from);
                        }
                        true
                    } else {
                        false
                    };
                    if voted {
                        self.maybe_win_election();
                    }
                }
            }
            PeerMessage::AppendEntries {
                term,
                leader,
                prev_index,
                prev_term,
                entries,
                commit_index,
            } => {
                if term < self.term {
                    self.network.send(
                        &self.group,
                        &leader,
                        PeerMessage::AppendReply {
                            term: self.term,
                            from: self.node.clone(),
                            success: false,
                            match_index: 0,
                        },
                    );
                    return;
                }

                self.become_follower(term, Some(leader.clone()));

                let success = self.entry_term(prev_index) == Some(prev_term)
                    || (prev_index == 0 && self.first_index == 1);
                if success {
                    // Drop conflicting suffix, then append
                    let mut index = prev_index + 1;
                    for entry in entries {
                        match self.entry_term(index) {
                            Some(existing) if existing == entry.term => {}
                            Some(_) => {
                                let keep =
                                    usize::try_from(index - self.first_index).unwrap_or(0);
                                self.log.truncate(keep);
                                self.log.push(entry);
                            }
                            None => self.log.push(entry),
                        }
                        index += 1;
                    }
                    self.commit_index = self
                        .commit_index
                        .max(commit_index.min(self.last_log_index()));
                }

                self.network.send(
                    &self.group,
                    &leader,
                    PeerMessage::AppendReply {
                        term: self.term,
                        from: self.node.clone(),
                        success,
                        match_index: self.last_log_index(),
                    },
                );
            }
            PeerMessage::AppendReply {
                term,
                from,
                success,
                match_index,
            } => {
                if term > self.term {
                    self.become_follower(term, None);
                    return;
                }

                let quorum = self.quorum();
                let current_term = self.term;
                let own_last = self.first_index + self.log.len() as u64 - 1;
                let own_node = self.node.clone();
                let peers = self.peers.clone();

                let acked = {
                    let Role::Leader {
                        next_index,
                        match_index: matches,
                        acked_at,
                        ..
                    } = &mut self.role
                    else {
                        return;
                    };

                    acked_at.insert(from.clone(), Instant::now());
                    if success {
                        matches.insert(from.clone(), match_index);
                        next_index.insert(from.clone(), match_index + 1);

                        let mut acked = peers
                            .iter()
                            .filter(|peer| **peer != own_node)
                            .map(|peer| matches.get(peer).copied().unwrap_or(0))
                            .collect::<Vec<_>>();
                        acked.push(own_last);
                        acked.sort_unstable();
                        Some(acked)
                    } else {
                        let next = next_index.entry(from).or_insert(1);
                        *next = next.saturating_sub(1).max(1);
                        None
                    }
                };

                // Advance the commit index over majority-replicated
                // entries from the current term
                if let Some(acked) = acked {
                    let candidate = acked[acked.len().saturating_sub(quorum)];
                    if candidate > self.commit_index
                        && self.entry_term(candidate) == Some(current_term)
                    {
                        self.commit_index = candidate;
                        self.resolve_pending();
                    }
                }
            }
            PeerMessage::InstallSnapshot {
                term,
                leader,
                last_index,
                last_term,
                data,
            } => {
                if term < self.term {
                    return;
                }
                self.become_follower(term, Some(leader.clone()));

                if last_index <= self.commit_index {
                    return;
                }

                self.log.clear();
                self.first_index = last_index + 1;
                self.snapshot = Some((last_index, last_term, data.clone()));
                self.commit_index = last_index;
                self.applied_index = last_index;
                let _ = self
                    .apply
                    .send(Applied::Snapshot {
                        index: last_index,
                        data,
                    })
                    .await;

                self.network.send(
                    &self.group,
                    &leader,
                    PeerMessage::AppendReply {
                        term: self.term,
                        from: self.node.clone(),
                        success: true,
                        match_index: last_index,
                    },
                );
            }
        }
    }

    fn resolve_pending(&mut self) {
        let committed = self
            .pending
            .range(..=self.commit_index)
            .map(|(&index, _)| index)
            .collect::<Vec<_>>();
        for index in committed {
            if let Some(reply) = self.pending.remove(&index) {
                let _ = reply.send(Ok(index));
            }
        }
    }

    async fn advance_applied(&mut self) {
        while self.applied_index < self.commit_index {
            let index = self.applied_index + 1;
            let Some(offset) = index.checked_sub(self.first_index) else {
                // Covered by an installed snapshot
                self.applied_index = self.first_index - 1;
                continue;
            };
            let Some(entry) = self.log.get(usize::try_from(offset).unwrap_or(usize::MAX))
            else {
                break;
            };
            if self
                .apply
                .send(Applied::Entry {
                    index,
                    data: entry.data.clone(),
                })
                .await
                .is_err()
            {
                break;
            }
            self.applied_index = index;
        }
    }
}

/// The replication seam of a stream or consumer
///
/// `R = 1` entities skip consensus entirely: proposals commit
/// immediately and flow to the same apply channel the grouped variant
/// uses, keeping the owner's apply loop identical in both modes.
#[derive(Debug)]
pub enum Replica {
    Solo(SoloReplica),
    Group(GroupHandle),
}

#[derive(Debug)]
pub struct SoloReplica {
    next_index: u64,
    apply: mpsc::Sender<Applied>,
}

impl Replica {
    /// A replication-free replica for `R = 1`
    #[must_use]
    pub fn solo() -> (Self, mpsc::Receiver<Applied>) {
        let (apply, apply_rx) = mpsc::channel(APPLY_BUFFER);
        (
            Self::Solo(SoloReplica {
                next_index: 0,
                apply,
            }),
            apply_rx,
        )
    }

    #[must_use]
    pub fn group(handle: GroupHandle) -> Self {
        Self::Group(handle)
    }

    /// Propose an operation, resolving once it is committed
    ///
    /// # Errors
    ///
    /// See [`GroupHandle::propose`]; solo replicas never fail.
    pub async fn propose(&mut self, data: Bytes, deadline: Duration) -> Result<u64, GroupError> {
        match self {
            Self::Solo(solo) => {
                solo.next_index += 1;
                let index = solo.next_index;
                solo.apply
                    .send(Applied::Entry { index, data })
                    .await
                    .map_err(|_| GroupError::Closed)?;
                Ok(index)
            }
            Self::Group(handle) => handle.propose(data, deadline).await,
        }
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        match self {
            Self::Solo(_) => true,
            Self::Group(handle) => handle.is_leader(),
        }
    }

    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        match self {
            Self::Solo(_) => None,
            Self::Group(handle) => handle.status().leader.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use claims::assert_matches;
    use tokio::time;

    use super::{spawn_replica, Applied, GroupNetwork, NodeId};

    fn peers() -> Vec<NodeId> {
        vec!["n1".to_owned(), "n2".to_owned(), "n3".to_owned()]
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn elects_a_single_leader() {
        let network = GroupNetwork::new();
        let replicas = peers()
            .iter()
            .map(|node| spawn_replica("meta", node, peers(), network.clone()))
            .collect::<Vec<_>>();

        time::sleep(Duration::from_secs(1)).await;

        let leaders = replicas
            .iter()
            .filter(|(handle, _)| handle.is_leader())
            .count();
        assert_eq!(1, leaders);

        let leader = replicas[0].0.status().leader.clone().unwrap();
        for (handle, _) in &replicas {
            assert_eq!(Some(&leader), handle.status().leader.as_ref());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commits_replicate_everywhere() {
        let network = GroupNetwork::new();
        let mut replicas = peers()
            .iter()
            .map(|node| spawn_replica("meta", node, peers(), network.clone()))
            .collect::<Vec<_>>();

        time::sleep(Duration::from_secs(1)).await;

        let leader = replicas
            .iter()
            .position(|(handle, _)| handle.is_leader())
            .expect("a leader was elected");

        for i in 0..5u8 {
            replicas[leader]
                .0
                .propose(Bytes::from(vec![i]), Duration::from_secs(2))
                .await
                .unwrap();
        }

        for (_, applied) in &mut replicas {
            for i in 0..5u8 {
                let entry = time::timeout(Duration::from_secs(2), applied.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_matches!(entry, Applied::Entry { index, data }
                    if index == u64::from(i) + 1 && data[0] == i);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn followers_reject_proposals() {
        let network = GroupNetwork::new();
        let replicas = peers()
            .iter()
            .map(|node| spawn_replica("meta", node, peers(), network.clone()))
            .collect::<Vec<_>>();

        time::sleep(Duration::from_secs(1)).await;

        let follower = replicas
            .iter()
            .find(|(handle, _)| !handle.is_leader())
            .expect("two followers exist");
        let err = follower
            .0
            .propose(Bytes::from_static(b"x"), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_matches!(err, super::GroupError::NotLeader { leader: Some(_) });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stepdown_triggers_reelection() {
        let network = GroupNetwork::new();
        let replicas = peers()
            .iter()
            .map(|node| spawn_replica("meta", node, peers(), network.clone()))
            .collect::<Vec<_>>();

        time::sleep(Duration::from_secs(1)).await;

        let leader = replicas
            .iter()
            .position(|(handle, _)| handle.is_leader())
            .expect("a leader was elected");
        assert!(replicas[leader].0.stepdown().await);

        time::sleep(Duration::from_secs(1)).await;
        let leaders = replicas
            .iter()
            .filter(|(handle, _)| handle.is_leader())
            .count();
        assert_eq!(1, leaders);
    }

    #[tokio::test]
    async fn solo_replica_commits_immediately() {
        let (mut replica, mut applied) = super::Replica::solo();
        let index = replica
            .propose(Bytes::from_static(b"op"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(1, index);
        assert_matches!(
            applied.recv().await,
            Some(Applied::Entry { index: 1, data }) if data == Bytes::from_static(b"op")
        );
    }
}
