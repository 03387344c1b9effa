use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use granary_proto::{
    api::{Placement, StreamConfig},
    error::{ApiError, ErrorCode},
    Name, StatusCode, Subject,
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{info, warn};

use crate::{
    advisory::Advisories,
    raft::{Applied, GroupError, NodeId, Replica},
};

const COMMAND_BUFFER: usize = 64;
const PROPOSAL_DEADLINE: Duration = Duration::from_secs(5);
/// Nodes silent for this long are flagged offline but keep their
/// assignments until explicitly removed
const OFFLINE_AFTER: Duration = Duration::from_secs(3);
/// Catalog snapshot cadence, in applied entries
const SNAPSHOT_EVERY: u64 = 256;

/// Subject space reserved for the control plane; stream subjects may
/// not overlap it
const RESERVED_PREFIXES: &[&str] = &[
    "$API.>",
    "$EVT.>",
    "$ACK.>",
    "$FC.>",
    "_INBOX.>",
    "_SYNC.>",
];

/// A cloneable handle to the meta controller
///
/// The controller is the replicated catalog of stream assignments and
/// peer liveness; every admin mutation of the catalog funnels through
/// it.
#[derive(Debug, Clone)]
pub struct MetaHandle {
    commands: mpsc::Sender<MetaCommand>,
}

/// A node's registration in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub cluster: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip)]
    pub offline: bool,
}

/// A stream's entry in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAssignment {
    pub account: String,
    pub config: StreamConfig,
    pub peers: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
enum MetaCommand {
    RegisterNode {
        node: NodeId,
        info: NodeInfo,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Heartbeat {
        node: NodeId,
    },
    AssignStream {
        account: String,
        config: Box<StreamConfig>,
        reply: oneshot::Sender<Result<StreamAssignment, ApiError>>,
    },
    UpdateStream {
        account: String,
        config: Box<StreamConfig>,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    UnassignStream {
        account: String,
        name: Name,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    StreamNames {
        account: String,
        subject: Option<Subject>,
        reply: oneshot::Sender<Vec<Name>>,
    },
    RemovePeer {
        account: String,
        stream: Name,
        peer: NodeId,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    RemoveServer {
        node: NodeId,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Stepdown {
        placement: Option<Placement>,
        reply: oneshot::Sender<Result<bool, ApiError>>,
    },
    ProposalFailed {
        op_id: u64,
        error: GroupError,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// An operation in the catalog's replicated log
#[derive(Debug, Serialize, Deserialize)]
enum MetaOp {
    RegisterNode {
        op_id: u64,
        origin: String,
        node: NodeId,
        info: NodeInfo,
    },
    AssignStream {
        op_id: u64,
        origin: String,
        assignment: StreamAssignment,
    },
    UpdateStream {
        op_id: u64,
        origin: String,
        account: String,
        config: Box<StreamConfig>,
    },
    UnassignStream {
        op_id: u64,
        origin: String,
        account: String,
        name: Name,
    },
    RemovePeer {
        op_id: u64,
        origin: String,
        account: String,
        stream: Name,
        peer: NodeId,
        replacement: Option<NodeId>,
    },
    RemoveServer {
        op_id: u64,
        origin: String,
        node: NodeId,
        reassignments: Vec<(String, Name, Vec<NodeId>)>,
    },
}

/// The replicated catalog content, also the meta snapshot format
#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    nodes: BTreeMap<NodeId, NodeInfo>,
    streams: BTreeMap<(String, Name), StreamAssignment>,
}

impl MetaHandle {
    /// Register a node for placement
    ///
    /// # Errors
    ///
    /// Propagates availability errors from the catalog group.
    pub async fn register_node(
        &self,
        node: impl Into<NodeId>,
        cluster: Option<String>,
        tags: Vec<String>,
    ) -> Result<(), ApiError> {
        self.round_trip(|reply| MetaCommand::RegisterNode {
            node: node.into(),
            info: NodeInfo {
                cluster,
                tags,
                offline: false,
            },
            reply,
        })
        .await?
    }

    pub fn heartbeat(&self, node: impl Into<NodeId>) {
        let _ = self
            .commands
            .try_send(MetaCommand::Heartbeat { node: node.into() });
    }

    /// Catalog a new stream and pick its peer set
    ///
    /// # Errors
    ///
    /// Fails on duplicate names, overlapping subjects and impossible
    /// placements.
    pub async fn assign_stream(
        &self,
        account: impl Into<String>,
        config: StreamConfig,
    ) -> Result<StreamAssignment, ApiError> {
        let account = account.into();
        self.round_trip(|reply| MetaCommand::AssignStream {
            account,
            config: Box::new(config),
            reply,
        })
        .await?
    }

    /// Record an updated stream configuration
    ///
    /// # Errors
    ///
    /// Fails if the stream is not cataloged.
    pub async fn update_stream(
        &self,
        account: impl Into<String>,
        config: StreamConfig,
    ) -> Result<(), ApiError> {
        let account = account.into();
        self.round_trip(|reply| MetaCommand::UpdateStream {
            account,
            config: Box::new(config),
            reply,
        })
        .await?
    }

    /// Drop a stream from the catalog
    ///
    /// # Errors
    ///
    /// Fails if the stream is not cataloged.
    pub async fn unassign_stream(
        &self,
        account: impl Into<String>,
        name: Name,
    ) -> Result<(), ApiError> {
        let account = account.into();
        self.round_trip(|reply| MetaCommand::UnassignStream {
            account,
            name,
            reply,
        })
        .await?
    }

    /// The cataloged stream names of `account`, sorted, optionally
    /// restricted to streams whose subjects overlap `subject`
    pub async fn stream_names(
        &self,
        account: impl Into<String>,
        subject: Option<Subject>,
    ) -> Vec<Name> {
        let account = account.into();
        self.round_trip(|reply| MetaCommand::StreamNames {
            account,
            subject,
            reply,
        })
        .await
        .unwrap_or_default()
    }

    /// Move one replica of a stream off `peer`
    ///
    /// # Errors
    ///
    /// Fails when the peer is not part of the stream's group or no
    /// replacement node exists.
    pub async fn remove_peer(
        &self,
        account: impl Into<String>,
        stream: Name,
        peer: impl Into<NodeId>,
    ) -> Result<(), ApiError> {
        let account = account.into();
        let peer = peer.into();
        self.round_trip(|reply| MetaCommand::RemovePeer {
            account,
            stream,
            peer,
            reply,
        })
        .await?
    }

    /// Remove a server from the catalog, reassigning its streams
    ///
    /// # Errors
    ///
    /// Fails when the server is unknown.
    pub async fn remove_server(&self, node: impl Into<NodeId>) -> Result<(), ApiError> {
        let node = node.into();
        self.round_trip(|reply| MetaCommand::RemoveServer { node, reply })
            .await?
    }

    /// Ask the catalog group leader to step down
    ///
    /// # Errors
    ///
    /// Fails when the catalog is not replicated.
    pub async fn stepdown(&self, placement: Option<Placement>) -> Result<bool, ApiError> {
        self.round_trip(|reply| MetaCommand::Stepdown { placement, reply })
            .await?
    }

    pub async fn stop(&self) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(MetaCommand::Stop { reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    async fn round_trip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MetaCommand,
    ) -> Result<T, ApiError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ApiError::system_unavailable())?;
        response.await.map_err(|_| ApiError::system_unavailable())
    }
}

pub(crate) fn spawn(
    node: String,
    replica: Replica,
    applied: mpsc::Receiver<Applied>,
    advisories: Advisories,
) -> MetaHandle {
    let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = MetaActor {
        node,
        replica,
        applied,
        advisories,
        commands: commands_rx,
        self_commands: commands.clone(),
        catalog: Catalog::default(),
        last_seen: HashMap::new(),
        next_op_id: 0,
        pending: HashMap::new(),
        applied_entries: 0,
        stopping: false,
    };
    tokio::spawn(actor.run());

    MetaHandle { commands }
}

#[derive(Debug)]
enum OpResult {
    Done,
    Assigned(Box<StreamAssignment>),
}

struct MetaActor {
    node: String,
    replica: Replica,
    applied: mpsc::Receiver<Applied>,
    advisories: Advisories,
    commands: mpsc::Receiver<MetaCommand>,
    self_commands: mpsc::Sender<MetaCommand>,
    catalog: Catalog,
    last_seen: HashMap<NodeId, Instant>,
    next_op_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<OpResult, ApiError>>>,
    applied_entries: u64,
    stopping: bool,
}

impl MetaActor {
    async fn run(mut self) {
        while !self.stopping {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                applied = self.applied.recv() => {
                    match applied {
                        Some(applied) => self.handle_applied(applied),
                        None => break,
                    }
                }
            }

            // Keep the apply channel drained so proposals never back up
            // behind the mailbox
            while let Ok(applied) = self.applied.try_recv() {
                self.handle_applied(applied);
            }
        }
    }

    fn next_op_id(&mut self) -> u64 {
        self.next_op_id += 1;
        self.next_op_id
    }

    fn refresh_liveness(&mut self) {
        let now = Instant::now();
        for (node, info) in &mut self.catalog.nodes {
            let seen = self.last_seen.get(node).copied();
            info.offline = node != &self.node
                && seen.map_or(true, |at| now.duration_since(at) > OFFLINE_AFTER);
        }
    }

    /// Pick `replicas` distinct nodes honoring the placement constraint
    fn place(
        &self,
        replicas: usize,
        placement: Option<&Placement>,
    ) -> Result<Vec<NodeId>, ApiError> {
        let mut candidates = self
            .catalog
            .nodes
            .iter()
            .filter(|(_, info)| !info.offline)
            .filter(|(_, info)| {
                placement.map_or(true, |placement| {
                    let cluster_ok = placement
                        .cluster
                        .as_ref()
                        .map_or(true, |cluster| info.cluster.as_ref() == Some(cluster));
                    let tags_ok = placement
                        .tags
                        .iter()
                        .all(|tag| info.tags.contains(tag));
                    cluster_ok && tags_ok
                })
            })
            .map(|(node, _)| node.clone())
            .collect::<Vec<_>>();

        if candidates.len() < replicas {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                ErrorCode::INSUFFICIENT_RESOURCES,
                "no suitable peers for placement",
            ));
        }
        candidates.truncate(replicas);
        Ok(candidates)
    }

    fn validate_new_stream(&self, account: &str, config: &StreamConfig) -> Result<(), ApiError> {
        if self
            .catalog
            .streams
            .contains_key(&(account.to_owned(), config.name.clone()))
        {
            return Err(ApiError::stream_name_in_use());
        }
        if config.description.len() > 4 * 1024 {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                ErrorCode::DESCRIPTION_TOO_LONG,
                "stream description is too long",
            ));
        }
        if config.mirror.is_some() && !config.subjects.is_empty() {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                ErrorCode::MIRROR_WITH_SUBJECTS,
                "stream mirrors may not also listen on subjects",
            ));
        }
        if config.mirror.is_some() && !config.sources.is_empty() {
            return Err(ApiError::bad_request(
                "stream cannot be both a mirror and a source",
            ));
        }

        for subject in &config.subjects {
            for reserved in RESERVED_PREFIXES {
                if subject.overlaps(&Subject::from_static(reserved)) {
                    return Err(ApiError::new(
                        StatusCode::CONFLICT,
                        ErrorCode::SUBJECTS_OVERLAP,
                        "subjects overlap the control API namespace",
                    ));
                }
            }
        }

        for ((other_account, _), assignment) in &self.catalog.streams {
            if other_account != account {
                continue;
            }
            for subject in &config.subjects {
                if assignment
                    .config
                    .subjects
                    .iter()
                    .any(|other| other.overlaps(subject))
                {
                    return Err(ApiError::new(
                        StatusCode::CONFLICT,
                        ErrorCode::SUBJECTS_OVERLAP,
                        format!(
                            "subjects overlap with an existing stream {}",
                            assignment.config.name
                        ),
                    ));
                }
            }
        }

        for upstream in config.mirror.iter().chain(&config.sources) {
            if let Some(external) = &upstream.external {
                if external.api_prefix.overlaps(&Subject::from_static("$API.>")) {
                    return Err(ApiError::new(
                        StatusCode::CONFLICT,
                        ErrorCode::EXTERNAL_PREFIX_OVERLAPS,
                        "external api prefix overlaps the control API namespace",
                    ));
                }
                if config
                    .subjects
                    .iter()
                    .any(|subject| external.deliver_prefix.overlaps(subject))
                {
                    return Err(ApiError::new(
                        StatusCode::CONFLICT,
                        ErrorCode::EXTERNAL_PREFIX_OVERLAPS,
                        "external deliver prefix overlaps the stream subjects",
                    ));
                }
            }
        }

        Ok(())
    }

    async fn handle_command(&mut self, command: MetaCommand) {
        match command {
            MetaCommand::RegisterNode { node, info, reply } => {
                let op_id = self.next_op_id();
                let op = MetaOp::RegisterNode {
                    op_id,
                    origin: self.node.clone(),
                    node,
                    info,
                };
                self.submit(op_id, &op, reply, |_| Ok(())).await;
            }
            MetaCommand::Heartbeat { node } => {
                self.last_seen.insert(node, Instant::now());
                self.refresh_liveness();
            }
            MetaCommand::AssignStream {
                account,
                config,
                reply,
            } => {
                self.refresh_liveness();
                if let Err(err) = self.validate_new_stream(&account, &config) {
                    let _ = reply.send(Err(err));
                    return;
                }
                let peers = match self.place(
                    config.replicas.get() as usize,
                    config.placement.as_ref(),
                ) {
                    Ok(peers) => peers,
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        return;
                    }
                };

                let op_id = self.next_op_id();
                let op = MetaOp::AssignStream {
                    op_id,
                    origin: self.node.clone(),
                    assignment: StreamAssignment {
                        account,
                        config: *config,
                        peers,
                        created_at: Utc::now(),
                    },
                };
                self.submit(op_id, &op, reply, |result| match result {
                    OpResult::Assigned(assignment) => Ok(*assignment),
                    OpResult::Done => Err(ApiError::bad_request("mismatched op result")),
                })
                .await;
            }
            MetaCommand::UpdateStream {
                account,
                config,
                reply,
            } => {
                let key = (account.clone(), config.name.clone());
                if !self.catalog.streams.contains_key(&key) {
                    let _ = reply.send(Err(ApiError::stream_not_found()));
                    return;
                }
                let op_id = self.next_op_id();
                let op = MetaOp::UpdateStream {
                    op_id,
                    origin: self.node.clone(),
                    account,
                    config,
                };
                self.submit(op_id, &op, reply, |_| Ok(())).await;
            }
            MetaCommand::UnassignStream {
                account,
                name,
                reply,
            } => {
                let key = (account.clone(), name.clone());
                if !self.catalog.streams.contains_key(&key) {
                    let _ = reply.send(Err(ApiError::stream_not_found()));
                    return;
                }
                let op_id = self.next_op_id();
                let op = MetaOp::UnassignStream {
                    op_id,
                    origin: self.node.clone(),
                    account,
                    name,
                };
                self.submit(op_id, &op, reply, |_| Ok(())).await;
            }
            MetaCommand::StreamNames {
                account,
                subject,
                reply,
            } => {
                let names = self
                    .catalog
                    .streams
                    .iter()
                    .filter(|((stream_account, _), _)| stream_account == &account)
                    .filter(|(_, assignment)| {
                        subject.as_ref().map_or(true, |subject| {
                            assignment
                                .config
                                .subjects
                                .iter()
                                .any(|pattern| pattern.overlaps(subject))
                        })
                    })
                    .map(|((_, name), _)| name.clone())
                    .collect();
                let _ = reply.send(names);
            }
            MetaCommand::RemovePeer {
                account,
                stream,
                peer,
                reply,
            } => {
                self.refresh_liveness();
                let key = (account.clone(), stream.clone());
                let Some(assignment) = self.catalog.streams.get(&key) else {
                    let _ = reply.send(Err(ApiError::stream_not_found()));
                    return;
                };
                if !assignment.peers.contains(&peer) {
                    let _ = reply.send(Err(ApiError::new(
                        StatusCode::NOT_FOUND,
                        ErrorCode::PEER_NOT_MEMBER,
                        "peer is not a member of the group",
                    )));
                    return;
                }

                let replacement = self
                    .place(assignment.peers.len(), assignment.config.placement.as_ref())
                    .ok()
                    .and_then(|candidates| {
                        candidates
                            .into_iter()
                            .find(|candidate| {
                                candidate != &peer && !assignment.peers.contains(candidate)
                            })
                    });

                let op_id = self.next_op_id();
                let op = MetaOp::RemovePeer {
                    op_id,
                    origin: self.node.clone(),
                    account,
                    stream,
                    peer,
                    replacement,
                };
                self.submit(op_id, &op, reply, |_| Ok(())).await;
            }
            MetaCommand::RemoveServer { node, reply } => {
                self.refresh_liveness();
                if !self.catalog.nodes.contains_key(&node) {
                    let _ = reply.send(Err(ApiError::new(
                        StatusCode::NOT_FOUND,
                        ErrorCode::SERVER_NOT_MEMBER,
                        "server is not known to the cluster",
                    )));
                    return;
                }

                // Precompute reassignments so followers apply them
                // deterministically
                let mut reassignments = Vec::new();
                for ((account, name), assignment) in &self.catalog.streams {
                    if !assignment.peers.contains(&node) {
                        continue;
                    }
                    let mut peers = assignment
                        .peers
                        .iter()
                        .filter(|peer| **peer != node)
                        .cloned()
                        .collect::<Vec<_>>();
                    if let Ok(candidates) =
                        self.place(assignment.peers.len(), assignment.config.placement.as_ref())
                    {
                        if let Some(replacement) = candidates
                            .into_iter()
                            .find(|candidate| candidate != &node && !peers.contains(candidate))
                        {
                            peers.push(replacement);
                        }
                    }
                    reassignments.push((account.clone(), name.clone(), peers));
                }

                let op_id = self.next_op_id();
                let op = MetaOp::RemoveServer {
                    op_id,
                    origin: self.node.clone(),
                    node,
                    reassignments,
                };
                self.submit(op_id, &op, reply, |_| Ok(())).await;
            }
            MetaCommand::Stepdown { placement: _, reply } => {
                let result = match &self.replica {
                    Replica::Solo(_) => {
                        Err(ApiError::bad_request("the meta group is not replicated"))
                    }
                    Replica::Group(handle) => Ok(handle.stepdown().await),
                };
                let _ = reply.send(result);
            }
            MetaCommand::ProposalFailed { op_id, error } => {
                if let Some(reply) = self.pending.remove(&op_id) {
                    let _ = reply.send(Err(match error {
                        GroupError::NotLeader { .. } => ApiError::not_leader(),
                        GroupError::Timeout => ApiError::timeout(),
                        _ => ApiError::system_unavailable(),
                    }));
                }
            }
            MetaCommand::Stop { reply } => {
                self.stopping = true;
                let _ = reply.send(());
            }
        }
    }

    async fn submit<T: Send + 'static>(
        &mut self,
        op_id: u64,
        op: &MetaOp,
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
            let handle = handle.clone();
            let commands = self.self_commands.clone();
            tokio::spawn(async move {
                if let Err(error) = handle.propose(Bytes::from(data), PROPOSAL_DEADLINE).await {
                    let _ = commands
                        .send(MetaCommand::ProposalFailed { op_id, error })
                        .await;
                }
            });
        } else if let Err(error) = self
            .replica
            .propose(Bytes::from(data), PROPOSAL_DEADLINE)
            .await
        {
            if let Some(raw_reply) = self.pending.remove(&op_id) {
                let _ = raw_reply.send(Err(match error {
                    GroupError::Timeout => ApiError::timeout(),
                    _ => ApiError::system_unavailable(),
                }));
            }
        }
    }

    fn handle_applied(&mut self, applied: Applied) {
        match applied {
            Applied::Entry { index, data } => {
                self.applied_entries += 1;
                match serde_json::from_slice::<MetaOp>(&data) {
                    Ok(op) => self.apply_op(op),
                    Err(err) => warn!(error = %err, "undecodable catalog entry"),
                }
                if self.applied_entries % SNAPSHOT_EVERY == 0 {
                    if let Replica::Group(handle) = &self.replica {
                        if let Ok(snapshot) = serde_json::to_vec(&self.catalog) {
                            handle.offer_snapshot(index, Bytes::from(snapshot));
                        }
                    }
                }
            }
            Applied::Snapshot { index: _, data } => {
                match serde_json::from_slice::<Catalog>(&data) {
                    Ok(catalog) => self.catalog = catalog,
                    Err(err) => warn!(error = %err, "undecodable catalog snapshot"),
                }
            }
        }
    }

    fn apply_op(&mut self, op: MetaOp) {
        match op {
            MetaOp::RegisterNode {
                op_id,
                origin,
                node,
                info,
            } => {
                info!(%node, "node registered");
                self.last_seen.insert(node.clone(), Instant::now());
                self.catalog.nodes.insert(node, info);
                self.reply_to(op_id, &origin, Ok(OpResult::Done));
            }
            MetaOp::AssignStream {
                op_id,
                origin,
                assignment,
            } => {
                let key = (assignment.account.clone(), assignment.config.name.clone());
                let result = Ok(OpResult::Assigned(Box::new(assignment.clone())));
                self.catalog.streams.insert(key, assignment);
                self.reply_to(op_id, &origin, result);
            }
            MetaOp::UpdateStream {
                op_id,
                origin,
                account,
                config,
            } => {
                let key = (account, config.name.clone());
                if let Some(assignment) = self.catalog.streams.get_mut(&key) {
                    assignment.config = *config;
                }
                self.reply_to(op_id, &origin, Ok(OpResult::Done));
            }
            MetaOp::UnassignStream {
                op_id,
                origin,
                account,
                name,
            } => {
                self.catalog.streams.remove(&(account, name));
                self.reply_to(op_id, &origin, Ok(OpResult::Done));
            }
            MetaOp::RemovePeer {
                op_id,
                origin,
                account,
                stream,
                peer,
                replacement,
            } => {
                if let Some(assignment) = self.catalog.streams.get_mut(&(account, stream)) {
                    assignment.peers.retain(|member| member != &peer);
                    if let Some(replacement) = replacement {
                        assignment.peers.push(replacement);
                    }
                }
                self.reply_to(op_id, &origin, Ok(OpResult::Done));
            }
            MetaOp::RemoveServer {
                op_id,
                origin,
                node,
                reassignments,
            } => {
                self.catalog.nodes.remove(&node);
                self.last_seen.remove(&node);
                for (account, name, peers) in reassignments {
                    if let Some(assignment) = self.catalog.streams.get_mut(&(account, name)) {
                        assignment.peers = peers;
                    }
                }
                self.advisories.server_removed(&node);
                self.reply_to(op_id, &origin, Ok(OpResult::Done));
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
}

#[cfg(test)]
mod tests {
    use granary_proto::{api::StreamConfig, Name, Subject};
    use claims::{assert_matches, assert_ok};

    use crate::{advisory::Advisories, raft::Replica, router::Router};

    use super::spawn;

    fn config(name: &str, subjects: &[&'static str]) -> StreamConfig {
        serde_json::from_str::<StreamConfig>(&format!(
            r#"{{"name": "{name}", "subjects": {subjects:?}}}"#,
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn assign_and_overlap() {
        let (replica, applied) = Replica::solo();
        let meta = spawn(
            "n1".to_owned(),
            replica,
            applied,
            Advisories::new(Router::new()),
        );
        assert_ok!(meta.register_node("n1", None, Vec::new()).await);

        let assignment = meta
            .assign_stream("TEAM", config("ORDERS", &["orders.>"]))
            .await
            .unwrap();
        assert_eq!(vec!["n1".to_owned()], assignment.peers);

        // Same name and overlapping subjects are both rejected
        let err = meta
            .assign_stream("TEAM", config("ORDERS", &["other.>"]))
            .await
            .unwrap_err();
        assert_matches!(err.code, granary_proto::error::ErrorCode::STREAM_NAME_IN_USE);

        let err = meta
            .assign_stream("TEAM", config("ORDERS2", &["orders.eu.*"]))
            .await
            .unwrap_err();
        assert_matches!(err.code, granary_proto::error::ErrorCode::SUBJECTS_OVERLAP);

        // A different account is isolated
        assert_ok!(
            meta.assign_stream("OTHER", config("ORDERS", &["orders.>"]))
                .await
        );

        let names = meta.stream_names("TEAM", None).await;
        assert_eq!(vec![Name::from_static("ORDERS")], names);
        let names = meta
            .stream_names("TEAM", Some(Subject::from_static("billing.eu")))
            .await;
        assert!(names.is_empty());
    }
}
