use std::collections::HashSet;
use std::net::SocketAddr;

use crate::codec::{CommandOutcome, Frame};
use crate::config::{ConfigError, NodeConfig, TimingConfig};
use crate::error::Result;
use crate::raft::log::ReplicatedLog;
use crate::raft::storage::LogStore;
use crate::raft::timer::random_election_timeout;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Resolved address book: the other servers and the clients of the group.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub self_id: u64,
    pub servers: Vec<(u64, SocketAddr)>,
    pub clients: Vec<(u64, SocketAddr)>,
}

impl Cluster {
    pub fn new(
        self_id: u64,
        servers: Vec<(u64, SocketAddr)>,
        clients: Vec<(u64, SocketAddr)>,
    ) -> Self {
        Self {
            self_id,
            servers,
            clients,
        }
    }

    pub fn from_config(config: &NodeConfig) -> std::result::Result<Self, ConfigError> {
        let mut servers = Vec::new();
        let mut clients = Vec::new();
        for member in &config.group {
            let addr = member.resolve()?;
            if member.is_server() {
                servers.push((member.id, addr));
            } else {
                clients.push((member.id, addr));
            }
        }
        Ok(Self::new(config.identity.id, servers, clients))
    }

    /// Servers in the cluster, this node included.
    pub fn size(&self) -> usize {
        self.servers.len() + 1
    }

    /// Smallest number of servers that forms a majority.
    ///
    /// `size / 2 + 1` rather than `ceil(size / 2)`: the two agree for odd sizes,
    /// and for even sizes half the cluster is not enough.
    pub fn majority(&self) -> usize {
        self.size() / 2 + 1
    }

    pub fn server_id(&self, addr: SocketAddr) -> Option<u64> {
        self.servers
            .iter()
            .find(|(_, a)| *a == addr)
            .map(|(id, _)| *id)
    }
}

/// A frame addressed to one group member.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound<C> {
    pub target: SocketAddr,
    pub frame: Frame<C>,
}

/// Everything a node mutates, guarded as one unit by the runtime.
///
/// # Safety properties
///
/// ## Election safety
/// `voted_term` is a high-water mark of the terms this node has voted in. A vote
/// is only granted for a term strictly above it, so a node votes at most once per
/// term and a term can have at most one majority winner.
///
/// ## Commit monotonicity
/// `log.last_committed_index()` only moves forward outside explicit operator
/// recovery: commits advance it, truncation refuses to cut below it, and
/// overwrites from the leader keep it.
///
/// ## Failed nodes
/// While `failed` is set, inbound frames are dropped and nothing is sent, but the
/// clock keeps counting down.
#[derive(Debug)]
pub struct RaftState<C> {
    pub id: u64,
    pub role: RaftRole,
    pub current_term: u64,
    pub leader_id: Option<u64>,

    /// Highest term this node has voted in (its own candidacy included).
    pub voted_term: Option<u64>,
    /// Distinct voters for the current candidacy, self included.
    pub votes: HashSet<u64>,
    /// Distinct followers that acknowledged the pending proposal.
    pub acks: HashSet<u64>,
    pub pending_outcome: Option<CommandOutcome>,

    /// Ticks until election timeout (follower/candidate) or next heartbeat (leader).
    pub clock: i64,
    pub failed: bool,
    pub cluster_ready: bool,

    pub log: ReplicatedLog<C>,
    /// Highest index fed to the application. On a leader it may run ahead of the
    /// committed watermark, since proposals are applied when made.
    pub last_applied: u64,
    pub cluster: Cluster,
    pub timing: TimingConfig,
    pub store: Option<LogStore>,
    pub persistence_error: Option<String>,
}

impl<C> RaftState<C> {
    pub fn new(cluster: Cluster, timing: TimingConfig) -> Self {
        let clock = random_election_timeout(
            timing.election_timeout_min_ticks,
            timing.election_timeout_max_ticks,
        );
        Self {
            id: cluster.self_id,
            role: RaftRole::Follower,
            current_term: 0,
            leader_id: None,
            voted_term: None,
            votes: HashSet::new(),
            acks: HashSet::new(),
            pending_outcome: None,
            clock,
            failed: false,
            cluster_ready: true,
            log: ReplicatedLog::new(),
            last_applied: 0,
            cluster,
            timing,
            store: None,
            persistence_error: None,
        }
    }

    pub fn with_store(mut self, store: LogStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn majority(&self) -> usize {
        self.cluster.majority()
    }

    pub fn voted_this_term(&self) -> bool {
        self.voted_term == Some(self.current_term)
    }

    pub fn votes_received(&self) -> usize {
        self.votes.len()
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn reset_election_clock(&mut self) {
        self.clock = random_election_timeout(
            self.timing.election_timeout_min_ticks,
            self.timing.election_timeout_max_ticks,
        );
    }

    pub fn reset_heartbeat_clock(&mut self) {
        self.clock = self.timing.heartbeat_interval_ticks;
    }

    /// Transition to follower state, clearing all candidacy and leadership state.
    pub fn become_follower(&mut self, leader_id: Option<u64>) {
        self.role = RaftRole::Follower;
        self.leader_id = leader_id;
        self.votes.clear();
        self.acks.clear();
        self.pending_outcome = None;
        self.reset_election_clock();
    }

    /// Transition to candidate state, voting for self in a fresh term.
    ///
    /// The new term is above any term this node has already voted in.
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.current_term = self.current_term.max(self.voted_term.unwrap_or(0)) + 1;
        self.voted_term = Some(self.current_term);
        self.votes.clear();
        self.votes.insert(self.id);
        self.leader_id = None;
        self.reset_election_clock();
    }

    /// Transition to leader state; the first heartbeat goes out on the next tick.
    pub fn become_leader(&mut self) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.acks.clear();
        self.clock = 0;
    }

    /// Adopt a term seen on a frame if it is newer than ours.
    pub fn observe_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
        }
    }

    pub fn broadcast(&self, frame: Frame<C>) -> Vec<Outbound<C>>
    where
        C: Clone,
    {
        self.cluster
            .servers
            .iter()
            .map(|(_, addr)| Outbound {
                target: *addr,
                frame: frame.clone(),
            })
            .collect()
    }

    pub fn to_clients(&self, frame: Frame<C>) -> Vec<Outbound<C>>
    where
        C: Clone,
    {
        self.cluster
            .clients
            .iter()
            .map(|(_, addr)| Outbound {
                target: *addr,
                frame: frame.clone(),
            })
            .collect()
    }

    /// Write the log to durable storage, remembering the failure for the operator.
    pub fn persist(&mut self) -> Result<()>
    where
        C: serde::Serialize,
    {
        let Some(store) = &self.store else {
            return Ok(());
        };
        match store.save(&self.log) {
            Ok(()) => {
                self.persistence_error = None;
                Ok(())
            }
            Err(e) => {
                tracing::error!(node_id = self.id, error = %e, "Failed to persist log");
                self.persistence_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role,
            current_term: self.current_term,
            leader_id: self.leader_id,
            last_appended_index: self.log.last_appended_index(),
            last_committed_index: self.log.last_committed_index(),
            last_applied: self.last_applied,
            log_len: self.log.len(),
            clock: self.clock,
            failed: self.failed,
            cluster_ready: self.cluster_ready,
            persistence_error: self.persistence_error.clone(),
        }
    }
}

/// Point-in-time view of a node, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: u64,
    pub role: RaftRole,
    pub current_term: u64,
    pub leader_id: Option<u64>,
    pub last_appended_index: u64,
    pub last_committed_index: u64,
    pub last_applied: u64,
    pub log_len: u64,
    pub clock: i64,
    pub failed: bool,
    pub cluster_ready: bool,
    pub persistence_error: Option<String>,
}
