//! Raft node: a cloneable handle in front of a single-task event loop.
//!
//! All Raft state lives in [`RaftCore`], which is owned by one tokio task. The
//! loop multiplexes inbound RPCs, proposals, replies from outbound RPCs and a
//! single deadline (election timeout for followers and candidates, heartbeat
//! interval for the leader). Outbound RPCs run in spawned tasks bounded by the
//! RPC timeout and report back through a channel, so the loop never blocks on
//! the network.

use crate::config::RaftConfig;
use crate::consensus::hard_state::{HardState, HardStateStore};
use crate::consensus::log::RaftLog;
use crate::consensus::log_store::{LogStore, RaftStorage};
use crate::consensus::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::consensus::state_machine::{SnapshotData, StateMachine};
use crate::consensus::transport::RaftTransport;
use crate::error::{Error, RaftError, Result};
use crate::types::{Command, LogEntry, LogIndex, NodeId, Term};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Role of a node within its current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Observable state of a node, published after every loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,
    pub last_log_index: Option<LogIndex>,
    pub fenced: bool,
}

/// Notifications for the layer above consensus.
#[derive(Debug, Clone)]
pub enum RaftEvent {
    /// Role, term or known leader changed.
    StateChanged {
        role: Role,
        term: Term,
        leader: Option<NodeId>,
    },
    /// An entry was applied to the state machine.
    Committed(LogEntry),
}

enum Request {
    AppendEntries(AppendEntriesRequest, oneshot::Sender<AppendEntriesResponse>),
    RequestVote(VoteRequest, oneshot::Sender<VoteResponse>),
    InstallSnapshot(
        InstallSnapshotRequest,
        oneshot::Sender<Result<InstallSnapshotResponse>>,
    ),
    Propose {
        command: Command,
        wait: bool,
        reply: oneshot::Sender<Result<LogEntry>>,
    },
    ObserveTerm(Term),
    Shutdown(oneshot::Sender<()>),
}

enum Reply {
    Vote {
        peer: NodeId,
        term: Term,
        result: Result<VoteResponse>,
    },
    Append {
        peer: NodeId,
        term: Term,
        prev: Option<LogIndex>,
        sent: u64,
        result: Result<AppendEntriesResponse>,
    },
    Snapshot {
        peer: NodeId,
        term: Term,
        last_index: LogIndex,
        result: Result<InstallSnapshotResponse>,
    },
}

async fn bounded<T>(timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(Error::Timeout))
}

/// Handle to a running Raft node.
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<RaftStatus>,
    propose_timeout: Duration,
}

impl fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl RaftNode {
    /// Start the event loop.
    ///
    /// The log recovered from `storage` is trimmed to start after whatever
    /// the state machine has already applied; committed entries are then
    /// delivered to `state_machine` in index order and announced on the
    /// returned event channel.
    pub fn spawn(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        storage: RaftStorage,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<RaftEvent>, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::channel(1024);
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let applied = state_machine.last_applied();
        let last_applied = applied.map(|(index, _)| index);
        let RaftStorage {
            hard_state: store,
            state: persisted,
            mut log_store,
            mut log,
        } = storage;
        let mut fenced = false;
        if let Some((index, term)) = applied {
            if log.base().is_none_or(|(base, _)| index > base) {
                log.reset_to(index, term);
                if let Err(e) = log_store.rewrite(&log) {
                    error!(node_id = %id, error = %e, "Failed to rewrite raft log");
                    fenced = true;
                }
            }
        }
        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != id).collect();

        let status = RaftStatus {
            node_id: id.clone(),
            role: Role::Follower,
            term: persisted.current_term,
            leader: None,
            voted_for: persisted.voted_for.clone(),
            commit_index: last_applied,
            last_applied,
            last_log_index: log.last_index(),
            fenced,
        };
        let (status_tx, status_rx) = watch::channel(status);

        let mut core = RaftCore {
            id: id.clone(),
            peers,
            role: Role::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            leader: None,
            log,
            commit_index: last_applied,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            in_flight: HashSet::new(),
            votes: HashSet::new(),
            deadline: Instant::now(),
            fenced,
            hard_state: store,
            log_store,
            state_machine,
            transport,
            replies: replies_tx,
            status: status_tx,
            events: events_tx,
            waiters: BTreeMap::new(),
            propose_timeout: config.propose_timeout,
            config,
        };
        core.reset_election_timer();
        let propose_timeout = core.propose_timeout;
        let handle = tokio::spawn(core.run(requests_rx, replies_rx));

        (
            Self {
                id,
                requests: requests_tx,
                status: status_rx,
                propose_timeout,
            },
            events_rx,
            handle,
        )
    }

    /// This node's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest published status.
    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == Role::Leader
    }

    pub fn term(&self) -> Term {
        self.status.borrow().term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.status.borrow().leader.clone()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped.into())
    }

    /// Append a command to the leader's log and return the new entry.
    ///
    /// The entry is not yet committed when this returns.
    pub async fn append_command(&self, command: Command) -> Result<LogEntry> {
        self.call(|reply| Request::Propose {
            command,
            wait: false,
            reply,
        })
        .await?
    }

    /// Append a command and wait until it has been applied locally.
    pub async fn propose(&self, command: Command) -> Result<LogEntry> {
        let call = self.call(|reply| Request::Propose {
            command,
            wait: true,
            reply,
        });
        match tokio::time::timeout(self.propose_timeout, call).await {
            Ok(result) => result?,
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(|reply| Request::AppendEntries(request, reply)).await
    }

    pub async fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.call(|reply| Request::RequestVote(request, reply)).await
    }

    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(|reply| Request::InstallSnapshot(request, reply))
            .await?
    }

    /// Report a term seen on a non-Raft message; a higher term makes this node step down.
    pub fn observe_term(&self, term: Term) {
        if term > self.term() {
            let _ = self.requests.try_send(Request::ObserveTerm(term));
        }
    }

    /// Wait until `predicate` holds for the published status.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&RaftStatus) -> bool,
        timeout: Duration,
    ) -> Option<RaftStatus> {
        let mut rx = self.status.clone();
        let wait = async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if predicate(&status) {
                        return Some(status.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Stop the event loop.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct RaftCore {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    propose_timeout: Duration,

    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,

    log: RaftLog,
    commit_index: Option<LogIndex>,
    last_applied: Option<LogIndex>,

    // Leader-only replication state.
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, Option<LogIndex>>,
    in_flight: HashSet<NodeId>,

    // Candidate-only.
    votes: HashSet<NodeId>,

    deadline: Instant,
    fenced: bool,

    hard_state: HardStateStore,
    log_store: LogStore,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    replies: mpsc::UnboundedSender<Reply>,
    status: watch::Sender<RaftStatus>,
    events: mpsc::UnboundedSender<RaftEvent>,
    waiters: BTreeMap<LogIndex, (Term, oneshot::Sender<Result<LogEntry>>)>,
}

impl RaftCore {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut replies: mpsc::UnboundedReceiver<Reply>,
    ) {
        info!(node_id = %self.id, term = self.current_term, peers = ?self.peers, "Raft node started");
        loop {
            let deadline = self.deadline;
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown(done)) => {
                        let _ = done.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(reply) = replies.recv() => self.handle_reply(reply),
                _ = tokio::time::sleep_until(deadline) => self.on_deadline(),
            }
            self.publish_status();
        }
        for (_, (_, reply)) in std::mem::take(&mut self.waiters) {
            let _ = reply.send(Err(RaftError::Stopped.into()));
        }
        info!(node_id = %self.id, term = self.current_term, "Raft node stopped");
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn election_timeout(&self) -> Duration {
        let base = (self.config.election_timeout.as_millis() as u64).max(1);
        Duration::from_millis(rand::rng().random_range(base..base * 2))
    }

    fn reset_election_timer(&mut self) {
        self.deadline = Instant::now() + self.election_timeout();
    }

    fn publish_status(&self) {
        let status = RaftStatus {
            node_id: self.id.clone(),
            role: self.role,
            term: self.current_term,
            leader: self.leader.clone(),
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            fenced: self.fenced,
        };
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    fn emit_state_changed(&self) {
        let _ = self.events.send(RaftEvent::StateChanged {
            role: self.role,
            term: self.current_term,
            leader: self.leader.clone(),
        });
    }

    /// Persist term and vote. A failure fences the node.
    fn persist_hard_state(&mut self) -> bool {
        let state = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        match self.hard_state.save(&state) {
            Ok(()) => true,
            Err(e) => {
                error!(node_id = %self.id, error = %e, "Failed to persist hard state");
                self.fence();
                false
            }
        }
    }

    /// Persist entries from `start` to the end of the log. A failure fences the node.
    fn persist_from(&mut self, start: LogIndex) -> bool {
        let count = self.log.next_index().saturating_sub(start) as usize;
        if count == 0 {
            return true;
        }
        let entries = self.log.entries_from(start, count);
        match self.log_store.append(&entries) {
            Ok(()) => true,
            Err(e) => {
                error!(node_id = %self.id, start, error = %e, "Failed to persist log entries");
                self.fence();
                false
            }
        }
    }

    /// Rewrite the log file after compaction or a snapshot install.
    fn persist_rewrite(&mut self) -> bool {
        match self.log_store.rewrite(&self.log) {
            Ok(()) => true,
            Err(e) => {
                error!(node_id = %self.id, error = %e, "Failed to rewrite raft log");
                self.fence();
                false
            }
        }
    }

    fn fence(&mut self) {
        if self.fenced {
            return;
        }
        self.fenced = true;
        warn!(node_id = %self.id, term = self.current_term, "Node fenced: refusing writes and leadership");
        if self.role == Role::Leader {
            self.leader = None;
        }
        self.role = Role::Follower;
        for (_, (_, reply)) in std::mem::take(&mut self.waiters) {
            let _ = reply.send(Err(RaftError::WritesFenced.into()));
        }
        self.emit_state_changed();
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::AppendEntries(req, reply) => {
                let response = self.handle_append_entries(req);
                let _ = reply.send(response);
            }
            Request::RequestVote(req, reply) => {
                let response = self.handle_request_vote(req);
                let _ = reply.send(response);
            }
            Request::InstallSnapshot(req, reply) => {
                let response = self.handle_install_snapshot(req);
                let _ = reply.send(response);
            }
            Request::Propose {
                command,
                wait,
                reply,
            } => self.propose(command, wait, reply),
            Request::ObserveTerm(term) => {
                if term > self.current_term {
                    debug!(node_id = %self.id, term = self.current_term, observed = term, "Observed higher term");
                    self.become_follower(term, None);
                }
            }
            // Handled by the run loop.
            Request::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    fn handle_reply(&mut self, reply: Reply) {
        match reply {
            Reply::Vote { peer, term, result } => self.on_vote_reply(peer, term, result),
            Reply::Append {
                peer,
                term,
                prev,
                sent,
                result,
            } => self.on_append_reply(peer, term, prev, sent, result),
            Reply::Snapshot {
                peer,
                term,
                last_index,
                result,
            } => self.on_snapshot_reply(peer, term, last_index, result),
        }
    }

    fn on_deadline(&mut self) {
        match self.role {
            Role::Leader => {
                self.broadcast_append();
                self.deadline = Instant::now() + self.config.heartbeat_interval;
            }
            _ if self.fenced => self.reset_election_timer(),
            _ => self.start_election(),
        }
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_hard_state();
        }
        let changed = self.role != Role::Follower || self.leader != leader;
        if self.role == Role::Leader {
            info!(node_id = %self.id, term = self.current_term, "Stepping down");
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.in_flight.clear();
        self.reset_election_timer();
        if changed {
            self.emit_state_changed();
        }
    }

    fn start_election(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = None;
        self.leader = None;
        self.votes.clear();
        self.in_flight.clear();
        self.reset_election_timer();
        info!(node_id = %self.id, term = self.current_term, "Starting election");
        self.emit_state_changed();

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        // Our own vote goes through the same granting rule as everyone else's.
        let own = self.handle_request_vote(request.clone());
        if own.vote_granted {
            self.votes.insert(self.id.clone());
        }
        if self.role != Role::Candidate {
            return;
        }
        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        for peer in self.peers.clone() {
            let transport = self.transport.clone();
            let replies = self.replies.clone();
            let timeout = self.config.rpc_timeout;
            let request = request.clone();
            tokio::spawn(async move {
                let term = request.term;
                let result = bounded(timeout, transport.request_vote(&peer, request)).await;
                let _ = replies.send(Reply::Vote { peer, term, result });
            });
        }
    }

    fn handle_request_vote(&mut self, req: VoteRequest) -> VoteResponse {
        if req.term > self.current_term {
            self.become_follower(req.term, None);
        }
        let log_ok = self.log.is_up_to_date(req.last_log_index, req.last_log_term);
        let vote_free = self
            .voted_for
            .as_ref()
            .is_none_or(|v| *v == req.candidate_id);
        let mut granted = req.term == self.current_term && vote_free && log_ok;
        if granted && self.voted_for.is_none() {
            self.voted_for = Some(req.candidate_id.clone());
            granted = self.persist_hard_state();
        }

        if granted {
            self.reset_election_timer();
            debug!(node_id = %self.id, term = self.current_term, candidate = %req.candidate_id, "Granted vote");
        } else {
            debug!(
                node_id = %self.id,
                term = self.current_term,
                candidate = %req.candidate_id,
                request_term = req.term,
                log_ok,
                "Rejected vote"
            );
        }
        VoteResponse {
            term: self.current_term,
            vote_granted: granted,
        }
    }

    fn on_vote_reply(&mut self, peer: NodeId, term: Term, result: Result<VoteResponse>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!(node_id = %self.id, peer = %peer, error = %e, "Vote request failed");
                return;
            }
        };
        if response.term > self.current_term {
            self.become_follower(response.term, None);
            return;
        }
        if self.role != Role::Candidate || term != self.current_term || !response.vote_granted {
            return;
        }
        self.votes.insert(peer);
        if self.votes.len() >= self.quorum() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        let next = self.log.next_index();
        for peer in &self.peers {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer.clone(), None);
        }
        self.in_flight.clear();
        info!(node_id = %self.id, term = self.current_term, votes = self.votes.len(), "Became leader");
        self.emit_state_changed();

        // Entries from earlier terms only commit behind one from this term.
        if self.log.last_term() < self.current_term && self.log.last_index() > self.commit_index {
            self.log
                .append(LogEntry::new(self.current_term, next, Command::Heartbeat));
            if !self.persist_from(next) {
                return;
            }
        }
        self.advance_commit();
        self.broadcast_append();
        self.deadline = Instant::now() + self.config.heartbeat_interval;
    }

    fn propose(&mut self, command: Command, wait: bool, reply: oneshot::Sender<Result<LogEntry>>) {
        if self.fenced {
            let _ = reply.send(Err(RaftError::WritesFenced.into()));
            return;
        }
        if self.role != Role::Leader {
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: self.leader.clone(),
            }
            .into()));
            return;
        }

        let entry = LogEntry::new(self.current_term, self.log.next_index(), command);
        self.log.append(entry.clone());
        if !self.persist_from(entry.index) {
            self.log.truncate_from(entry.index);
            let _ = reply.send(Err(RaftError::WritesFenced.into()));
            return;
        }
        debug!(
            node_id = %self.id,
            index = entry.index,
            term = entry.term,
            command = entry.command.kind(),
            "Appended entry"
        );
        if wait {
            self.waiters.insert(entry.index, (entry.term, reply));
        } else {
            let _ = reply.send(Ok(entry));
        }
        self.advance_commit();
        self.broadcast_append();
    }

    fn broadcast_append(&mut self) {
        for peer in self.peers.clone() {
            self.send_append(&peer);
        }
    }

    fn send_append(&mut self, peer: &str) {
        if self.role != Role::Leader || self.in_flight.contains(peer) {
            return;
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or_else(|| self.log.next_index());
        if next < self.log.first_index() {
            self.send_snapshot(peer);
            return;
        }

        let prev = next.checked_sub(1);
        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index: prev,
            prev_log_term: prev.and_then(|i| self.log.term_at(i)).unwrap_or(0),
            entries: self.log.entries_from(next, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        };
        let sent = request.entries.len() as u64;
        self.in_flight.insert(peer.to_string());

        let transport = self.transport.clone();
        let replies = self.replies.clone();
        let timeout = self.config.rpc_timeout;
        let peer = peer.to_string();
        tokio::spawn(async move {
            let term = request.term;
            let result = bounded(timeout, transport.append_entries(&peer, request)).await;
            let _ = replies.send(Reply::Append {
                peer,
                term,
                prev,
                sent,
                result,
            });
        });
    }

    fn send_snapshot(&mut self, peer: &str) {
        let snapshot = match self.state_machine.snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(node_id = %self.id, peer, "Peer needs a snapshot but none is available");
                return;
            }
            Err(e) => {
                warn!(node_id = %self.id, peer, error = %e, "Failed to read snapshot");
                return;
            }
        };
        let request = InstallSnapshotRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            data: snapshot.data,
        };
        info!(
            node_id = %self.id,
            peer,
            last_included_index = request.last_included_index,
            bytes = request.data.len(),
            "Sending snapshot"
        );
        self.in_flight.insert(peer.to_string());

        let transport = self.transport.clone();
        let replies = self.replies.clone();
        // Snapshots get a longer budget than entry batches.
        let timeout = self.config.rpc_timeout * 10;
        let peer = peer.to_string();
        tokio::spawn(async move {
            let term = request.term;
            let last_index = request.last_included_index;
            let result = bounded(timeout, transport.install_snapshot(&peer, request)).await;
            let _ = replies.send(Reply::Snapshot {
                peer,
                term,
                last_index,
                result,
            });
        });
    }

    fn on_append_reply(
        &mut self,
        peer: NodeId,
        term: Term,
        prev: Option<LogIndex>,
        sent: u64,
        result: Result<AppendEntriesResponse>,
    ) {
        self.in_flight.remove(&peer);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                trace!(node_id = %self.id, peer = %peer, error = %e, "AppendEntries failed");
                return;
            }
        };
        if response.term > self.current_term {
            self.become_follower(response.term, None);
            return;
        }
        if self.role != Role::Leader || term != self.current_term {
            return;
        }

        if response.success {
            let matched = if sent > 0 {
                Some(prev.map_or(0, |p| p + 1) + sent - 1)
            } else {
                prev
            };
            let known = self.match_index.get(&peer).copied().flatten();
            if matched > known {
                self.match_index.insert(peer.clone(), matched);
            }
            let next = self.next_index.entry(peer.clone()).or_insert(0);
            *next = (*next).max(matched.map_or(0, |m| m + 1));
            self.advance_commit();
        } else {
            let current = self.next_index.get(&peer).copied().unwrap_or(0);
            let hint = response.last_log_index.map_or(0, |i| i + 1);
            let next = current.saturating_sub(1).min(hint);
            debug!(node_id = %self.id, peer = %peer, next_index = next, "Log mismatch, backing off");
            self.next_index.insert(peer.clone(), next);
        }

        if self.next_index.get(&peer).copied().unwrap_or(0) < self.log.next_index() {
            self.send_append(&peer);
        }
    }

    fn on_snapshot_reply(
        &mut self,
        peer: NodeId,
        term: Term,
        last_index: LogIndex,
        result: Result<InstallSnapshotResponse>,
    ) {
        self.in_flight.remove(&peer);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!(node_id = %self.id, peer = %peer, error = %e, "InstallSnapshot failed");
                return;
            }
        };
        if response.term > self.current_term {
            self.become_follower(response.term, None);
            return;
        }
        if self.role != Role::Leader || term != self.current_term {
            return;
        }
        let known = self.match_index.get(&peer).copied().flatten();
        if Some(last_index) > known {
            self.match_index.insert(peer.clone(), Some(last_index));
        }
        self.next_index.insert(peer.clone(), last_index + 1);
        self.advance_commit();
        if last_index + 1 < self.log.next_index() {
            self.send_append(&peer);
        }
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        if req.term < self.current_term {
            debug!(
                node_id = %self.id,
                term = self.current_term,
                stale_term = req.term,
                leader = %req.leader_id,
                "Rejecting stale AppendEntries"
            );
            return self.append_response(false);
        }
        if req.term > self.current_term
            || self.role != Role::Follower
            || self.leader.as_deref() != Some(req.leader_id.as_str())
        {
            self.become_follower(req.term, Some(req.leader_id.clone()));
        }
        self.reset_election_timer();

        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            debug!(
                node_id = %self.id,
                prev_log_index = ?req.prev_log_index,
                prev_log_term = req.prev_log_term,
                "Log mismatch"
            );
            return self.append_response(false);
        }

        let old_next = self.log.next_index();
        let (last_new, truncated) = self.log.append_entries(req.prev_log_index, req.entries);
        // Entries are acknowledged only once they are on disk.
        if !self.persist_from(truncated.unwrap_or(old_next)) {
            return self.append_response(false);
        }
        if let Some(from) = truncated {
            debug!(node_id = %self.id, from, "Truncated conflicting entries");
            let dropped = self.waiters.split_off(&from);
            for (_, (_, reply)) in dropped {
                let _ = reply.send(Err(RaftError::ProposalDropped.into()));
            }
        }
        if let (Some(leader_commit), Some(last_new)) = (req.leader_commit, last_new) {
            let target = Some(leader_commit.min(last_new));
            if target > self.commit_index {
                self.commit_index = target;
            }
        }
        self.apply_committed();
        self.append_response(true)
    }

    fn append_response(&self, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            last_log_index: self.log.last_index(),
        }
    }

    fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }
        if req.term > self.current_term
            || self.role != Role::Follower
            || self.leader.as_deref() != Some(req.leader_id.as_str())
        {
            self.become_follower(req.term, Some(req.leader_id.clone()));
        }
        self.reset_election_timer();

        let index = req.last_included_index;
        if Some(index) > self.last_applied {
            let snapshot = SnapshotData {
                last_included_index: index,
                last_included_term: req.last_included_term,
                data: req.data,
            };
            if let Err(e) = self.state_machine.restore(&snapshot) {
                error!(node_id = %self.id, index, error = %e, "Failed to install snapshot");
                self.fence();
                return Err(e);
            }
            self.log.reset_to(index, req.last_included_term);
            self.persist_rewrite();
            self.commit_index = self.commit_index.max(Some(index));
            self.last_applied = Some(index);
            let rest = self.waiters.split_off(&(index + 1));
            for (_, (_, reply)) in std::mem::replace(&mut self.waiters, rest) {
                let _ = reply.send(Err(RaftError::ProposalDropped.into()));
            }
            info!(node_id = %self.id, index, term = req.last_included_term, "Installed snapshot from leader");
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        if let Some(last) = self.log.last_index() {
            let start = self.commit_index.map_or(0, |c| c + 1);
            for n in (start..=last).rev() {
                match self.log.term_at(n) {
                    Some(term) if term == self.current_term => {}
                    // Terms only grow along the log; nothing lower can be ours.
                    _ => break,
                }
                let replicated = 1 + self
                    .match_index
                    .values()
                    .filter(|m| **m >= Some(n))
                    .count();
                if replicated >= self.quorum() {
                    debug!(node_id = %self.id, commit_index = n, "Advanced commit index");
                    self.commit_index = Some(n);
                    break;
                }
            }
        }
        self.apply_committed();
    }

    fn apply_committed(&mut self) {
        if self.fenced {
            return;
        }
        while self.last_applied < self.commit_index {
            let index = self.last_applied.map_or(0, |i| i + 1);
            let entry = match self.log.get(index) {
                Some(entry) => entry.clone(),
                None => {
                    warn!(node_id = %self.id, index, "Committed entry missing from log");
                    break;
                }
            };
            if let Err(e) = self.state_machine.apply(&entry) {
                error!(node_id = %self.id, index, error = %e, "Failed to apply entry");
                self.fence();
                return;
            }
            self.last_applied = Some(index);
            trace!(node_id = %self.id, index, term = entry.term, "Applied entry");

            if let Some((term, reply)) = self.waiters.remove(&index) {
                let result = if term == entry.term {
                    Ok(entry.clone())
                } else {
                    Err(RaftError::ProposalDropped.into())
                };
                let _ = reply.send(result);
            }
            let _ = self.events.send(RaftEvent::Committed(entry));
        }
        self.compact_log();
    }

    fn compact_log(&mut self) {
        if let Some((index, term)) = self.state_machine.snapshot_point() {
            let newer = self.log.base().is_none_or(|(base, _)| index > base);
            if newer && Some(index) <= self.last_applied {
                self.log.compact_to(index, term);
                self.persist_rewrite();
                debug!(node_id = %self.id, index, "Compacted log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStateMachine, NullTransport};

    fn single(config: RaftConfig) -> (RaftNode, Arc<MemoryStateMachine>) {
        let sm = Arc::new(MemoryStateMachine::default());
        let (node, _events, _handle) = RaftNode::spawn(
            "solo".into(),
            vec!["solo".into()],
            config,
            RaftStorage::in_memory(),
            sm.clone(),
            Arc::new(NullTransport),
        );
        (node, sm)
    }

    fn isolated_follower() -> RaftNode {
        let config = RaftConfig::default().with_election_timeout(Duration::from_secs(60));
        let (node, _events, _handle) = RaftNode::spawn(
            "n1".into(),
            vec!["n1".into(), "n2".into(), "n3".into()],
            config.with_heartbeat_interval(Duration::from_secs(1)),
            RaftStorage::in_memory(),
            Arc::new(MemoryStateMachine::default()),
            Arc::new(NullTransport),
        );
        node
    }

    fn vote(term: Term, candidate: &str, last_log_index: Option<LogIndex>, last_log_term: Term) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate.into(),
            last_log_index,
            last_log_term,
        }
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let (node, sm) = single(RaftConfig::default());
        let status = node
            .wait_for(|s| s.role == Role::Leader, Duration::from_secs(2))
            .await
            .expect("leader");
        assert_eq!(status.term, 1);
        assert_eq!(status.voted_for.as_deref(), Some("solo"));

        let entry = node.propose(Command::set("k", "v")).await.unwrap();
        assert_eq!(entry.index, 0);
        assert_eq!(sm.applied().len(), 1);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let node = isolated_follower();
        let err = node.append_command(Command::set("k", "v")).await.unwrap_err();
        assert!(err.is_not_leader());
    }

    #[tokio::test]
    async fn test_vote_granting_rules() {
        let node = isolated_follower();

        let granted = node.handle_request_vote(vote(1, "n2", None, 0)).await.unwrap();
        assert!(granted.vote_granted);
        // Already voted this term.
        let second = node.handle_request_vote(vote(1, "n3", None, 0)).await.unwrap();
        assert!(!second.vote_granted);
        // Same candidate may ask again.
        assert!(node.handle_request_vote(vote(1, "n2", None, 0)).await.unwrap().vote_granted);
        // Stale term.
        let stale = node.handle_request_vote(vote(0, "n3", None, 0)).await.unwrap();
        assert!(!stale.vote_granted);
        assert_eq!(stale.term, 1);
        // New term resets the vote.
        assert!(node.handle_request_vote(vote(2, "n3", None, 0)).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_vote_denied_to_stale_log() {
        let node = isolated_follower();
        let append = AppendEntriesRequest {
            term: 3,
            leader_id: "n2".into(),
            prev_log_index: None,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(2, 0, Command::Heartbeat),
                LogEntry::new(3, 1, Command::Heartbeat),
            ],
            leader_commit: None,
        };
        assert!(node.handle_append_entries(append).await.unwrap().success);

        // Lower last term loses even with a longer log.
        let denied = node.handle_request_vote(vote(4, "n3", Some(9), 2)).await.unwrap();
        assert!(!denied.vote_granted);
        assert_eq!(denied.term, 4);
        let granted = node.handle_request_vote(vote(5, "n3", Some(1), 3)).await.unwrap();
        assert!(granted.vote_granted);
    }

    #[tokio::test]
    async fn test_append_entries_consistency_check() {
        let node = isolated_follower();
        let entries = |terms: &[(Term, LogIndex)]| {
            terms
                .iter()
                .map(|(t, i)| LogEntry::new(*t, *i, Command::Heartbeat))
                .collect::<Vec<_>>()
        };

        let stale = AppendEntriesRequest {
            term: 0,
            leader_id: "n2".into(),
            prev_log_index: None,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: None,
        };
        let ok = AppendEntriesRequest {
            term: 1,
            entries: entries(&[(1, 0), (1, 1)]),
            leader_commit: Some(0),
            ..stale.clone()
        };
        let resp = node.handle_append_entries(ok).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.last_log_index, Some(1));
        assert_eq!(node.leader_id().as_deref(), Some("n2"));

        // Gap: prev index not present.
        let gap = AppendEntriesRequest {
            term: 1,
            prev_log_index: Some(5),
            prev_log_term: 1,
            ..stale.clone()
        };
        assert!(!node.handle_append_entries(gap).await.unwrap().success);

        // Stale leader.
        let resp = node
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                ..stale.clone()
            })
            .await
            .unwrap();
        assert!(resp.success);
        let resp = node.handle_append_entries(stale).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 2);

        let status = node
            .wait_for(|s| s.last_applied == Some(0), Duration::from_secs(1))
            .await
            .expect("applied");
        assert_eq!(status.commit_index, Some(0));
        assert_eq!(status.term, 2);
    }

    #[tokio::test]
    async fn test_observe_term_steps_down() {
        let (node, _sm) = single(RaftConfig::default());
        node.wait_for(|s| s.role == Role::Leader, Duration::from_secs(2))
            .await
            .expect("leader");
        node.observe_term(10);
        let status = node
            .wait_for(|s| s.term >= 10, Duration::from_secs(1))
            .await
            .expect("observed");
        assert!(status.term >= 10);
    }

    #[tokio::test]
    async fn test_apply_failure_fences_node() {
        let sm = Arc::new(MemoryStateMachine::default());
        sm.fail_applies(true);
        let (node, _events, _handle) = RaftNode::spawn(
            "solo".into(),
            vec![],
            RaftConfig::default(),
            RaftStorage::in_memory(),
            sm.clone(),
            Arc::new(NullTransport),
        );
        node.wait_for(|s| s.role == Role::Leader, Duration::from_secs(2))
            .await
            .expect("leader");

        let err = node.propose(Command::set("k", "v")).await.unwrap_err();
        assert!(matches!(err, Error::Raft(RaftError::WritesFenced)));
        let status = node
            .wait_for(|s| s.fenced, Duration::from_secs(1))
            .await
            .expect("fenced");
        assert_eq!(status.role, Role::Follower);

        // No new elections while fenced.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_ne!(node.status().role, Role::Leader);
        assert!(matches!(
            node.append_command(Command::Heartbeat).await,
            Err(Error::Raft(RaftError::WritesFenced))
        ));
    }
}
