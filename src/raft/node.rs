use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, ClientRequest, CommandOutcome, Frame};
use crate::config::NodeConfig;
use crate::console::{FaultCommand, HELP};
use crate::error::{RaftError, Result};
use crate::machine::StateMachine;
use crate::raft::election::{
    abandon_candidacy, handle_vote_reply, handle_vote_request, handle_win_announcement,
    start_election,
};
use crate::raft::replication::{
    handle_ack, handle_commit, handle_heartbeat, handle_overwrite, handle_replication,
    propose_command, send_heartbeats,
};
use crate::raft::state::{Cluster, NodeStatus, Outbound, RaftRole, RaftState};
use crate::raft::storage::LogStore;
use crate::transport::Transport;

/// Route one decoded frame to its handler and collect the replies.
///
/// Client commands need the application and are handled by [`RaftNode`]; outcome
/// frames are meant for clients and ignored here.
pub fn dispatch<C>(state: &mut RaftState<C>, from: SocketAddr, frame: Frame<C>) -> Vec<Outbound<C>>
where
    C: Clone + PartialEq + Serialize,
{
    match frame {
        Frame::Heartbeat => {
            handle_heartbeat(state, from);
            Vec::new()
        }
        Frame::VoteRequest(req) => handle_vote_request(state, from, &req),
        Frame::VoteGranted(reply) => handle_vote_reply(state, reply, true),
        Frame::VoteDenied(reply) => handle_vote_reply(state, reply, false),
        Frame::Won { winner_id } => {
            handle_win_announcement(state, winner_id);
            Vec::new()
        }
        Frame::Replicate(proposal) => handle_replication(state, from, proposal),
        Frame::Ack(ack) => handle_ack(state, from, ack),
        Frame::Overwrite(full) => handle_overwrite(state, from, full),
        Frame::Commit => {
            handle_commit(state);
            Vec::new()
        }
        Frame::Start => {
            start_cluster(state);
            Vec::new()
        }
        Frame::ClientCommand(_) | Frame::Outcome(_) => {
            tracing::debug!(node_id = state.id, from = %from, "Frame not handled by consensus");
            Vec::new()
        }
    }
}

/// Act on an expired clock: heartbeat as leader, campaign as follower.
pub fn drive<C: Clone>(state: &mut RaftState<C>) -> Vec<Outbound<C>> {
    if state.failed || !state.cluster_ready || state.clock > 0 {
        return Vec::new();
    }
    match state.role {
        RaftRole::Leader => send_heartbeats(state),
        RaftRole::Follower => start_election(state),
        RaftRole::Candidate => {
            abandon_candidacy(state);
            Vec::new()
        }
    }
}

/// One clock tick. Time passes for failed nodes too.
pub fn tick<C>(state: &mut RaftState<C>) {
    if state.cluster_ready {
        state.clock -= 1;
    }
}

/// Feed the application every committed entry it has not seen yet.
///
/// A node that applied proposals ahead of commit and is no longer leader replays
/// its committed log from scratch, as those proposals may have been replaced.
pub fn apply_committed<SM: StateMachine>(state: &mut RaftState<SM::Command>, machine: &mut SM) {
    let committed = state.log.last_committed_index();
    if state.last_applied > committed && !state.is_leader() {
        tracing::info!(
            node_id = state.id,
            applied = state.last_applied,
            committed,
            "Replaying committed log into the application"
        );
        machine.reset();
        state.last_applied = 0;
    }
    apply_through(state, machine, committed);
}

fn apply_through<SM: StateMachine>(state: &mut RaftState<SM::Command>, machine: &mut SM, upto: u64) {
    while state.last_applied < upto {
        let index = state.last_applied + 1;
        let Some(entry) = state.log.entry(index) else {
            break;
        };
        machine.apply(&entry.command);
        state.last_applied = index;
    }
}

/// Rebuild the application from the committed part of the log.
pub fn replay_committed<SM: StateMachine>(state: &mut RaftState<SM::Command>, machine: &mut SM) {
    let committed = state.log.last_committed_index();
    machine.reset();
    state.last_applied = 0;
    apply_through(state, machine, committed);
}

fn start_cluster<C>(state: &mut RaftState<C>) {
    if state.cluster_ready {
        return;
    }
    tracing::info!(node_id = state.id, "Cluster started");
    state.cluster_ready = true;
    state.reset_election_clock();
}

/// A consensus node bound to a transport and an application state machine.
pub struct RaftNode<SM: StateMachine> {
    pub id: u64,
    pub state: Arc<RwLock<RaftState<SM::Command>>>,
    machine: Arc<Mutex<SM>>,
    transport: Arc<dyn Transport>,
    tick: Duration,
    commits: watch::Sender<u64>,
}

impl<SM: StateMachine> RaftNode<SM> {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>, machine: SM) -> Result<Self> {
        config.validate()?;
        let cluster = Cluster::from_config(&config)?;

        let mut state = RaftState::new(cluster, config.timing.clone())
            .with_store(LogStore::new(&config.log_path));
        state.cluster_ready = !config.wait_for_start;

        let (commits, _) = watch::channel(0);

        Ok(Self {
            id: config.identity.id,
            state: Arc::new(RwLock::new(state)),
            machine: Arc::new(Mutex::new(machine)),
            transport,
            tick: config.timing.tick,
            commits,
        })
    }

    /// Run the clock, driver and inbound loops until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            node_id = self.id,
            addr = %self.transport.local_addr(),
            "Node running"
        );

        tokio::join!(
            self.clone().clock_loop(shutdown.clone()),
            self.clone().driver_loop(shutdown.clone()),
            self.clone().inbound_loop(shutdown.clone()),
        );

        tracing::info!(node_id = self.id, "Node stopped");
    }

    async fn clock_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick(&mut *self.state.write().await),
            }
        }
    }

    async fn driver_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let poll = (self.tick / 4).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let out = drive(&mut *self.state.write().await);
                    self.deliver(out).await;
                }
            }
        }
    }

    async fn inbound_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.transport.recv() => received,
            };
            match received {
                Ok((from, bytes)) => self.handle_datagram(from, &bytes).await,
                Err(e) => {
                    tracing::warn!(node_id = self.id, error = %e, "Receive failed");
                    tokio::time::sleep(self.tick).await;
                }
            }
        }
    }

    /// Decode and handle one datagram; malformed frames are logged and dropped.
    pub async fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) {
        match codec::decode::<SM::Command>(bytes) {
            Ok(frame) => self.handle_frame(from, frame).await,
            Err(e) => {
                tracing::warn!(node_id = self.id, from = %from, error = %e, "Dropping malformed frame");
            }
        }
    }

    pub async fn handle_frame(&self, from: SocketAddr, frame: Frame<SM::Command>) {
        if self.state.read().await.failed {
            tracing::trace!(node_id = self.id, tag = %frame.tag(), "Failed, dropping frame");
            return;
        }

        if let Frame::ClientCommand(req) = frame {
            self.handle_client_command(from, req).await;
            return;
        }

        let out = {
            let mut state = self.state.write().await;
            if state.failed {
                return;
            }
            let out = dispatch(&mut state, from, frame);
            apply_committed::<SM>(&mut state, &mut *self.machine.lock().await);
            out
        };
        self.deliver(out).await;
        self.publish_commit().await;
    }

    async fn handle_client_command(&self, from: SocketAddr, req: ClientRequest) {
        match self.submit(req.submitter, &req.action).await {
            Ok(index) => {
                tracing::info!(node_id = self.id, submitter = req.submitter, index, "Accepted client command");
            }
            Err(RaftError::NotLeader(leader)) => {
                tracing::debug!(node_id = self.id, from = %from, leader = ?leader, "Not leader, dropping client command");
            }
            Err(e) => {
                tracing::warn!(node_id = self.id, from = %from, error = %e, "Rejected client command");
            }
        }
    }

    /// Parse a client action and propose it. Returns the log index it took.
    pub async fn submit(&self, submitter: u64, action: &str) -> Result<u64> {
        let command = self
            .machine
            .lock()
            .await
            .parse_command(submitter, action)
            .ok_or_else(|| {
                RaftError::ProtocolViolation(format!("unrecognised action '{}'", action))
            })?;
        self.propose(command).await
    }

    /// Apply a command on the leader and replicate it.
    pub async fn propose(&self, command: SM::Command) -> Result<u64> {
        let (out, index) = {
            let mut state = self.state.write().await;
            if state.failed {
                return Err(RaftError::Internal("node is failed".to_string()));
            }
            if !state.is_leader() {
                return Err(RaftError::NotLeader(state.leader_id));
            }

            // Entries already in the log go in before the new command
            let outcome = {
                let mut machine = self.machine.lock().await;
                apply_committed::<SM>(&mut state, &mut *machine);
                let appended = state.log.last_appended_index();
                apply_through::<SM>(&mut state, &mut *machine, appended);
                let outcome = machine.apply(&command);
                CommandOutcome {
                    outcome,
                    rendering: machine.render(),
                }
            };
            let out = match propose_command(&mut state, command, outcome) {
                Ok(out) => out,
                Err(e) => {
                    replay_committed::<SM>(&mut state, &mut *self.machine.lock().await);
                    return Err(e);
                }
            };
            state.last_applied = state.log.last_appended_index();
            (out, state.last_applied)
        };
        self.deliver(out).await;
        self.publish_commit().await;
        Ok(index)
    }

    /// Encode and send frames. A failed node sends nothing.
    async fn deliver(&self, out: Vec<Outbound<SM::Command>>) {
        if out.is_empty() || self.state.read().await.failed {
            return;
        }
        for Outbound { target, frame } in out {
            let bytes = match codec::encode(&frame) {
                Ok(bytes) => bytes,
                Err(codec::CodecError::TooLarge(size)) => {
                    // A full-log overwrite past this size can no longer repair followers
                    tracing::error!(
                        node_id = self.id,
                        tag = %frame.tag(),
                        target = %target,
                        size,
                        limit = codec::MAX_DATAGRAM,
                        "Frame exceeds the datagram limit, dropping it"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(node_id = self.id, tag = %frame.tag(), error = %e, "Cannot encode frame");
                    continue;
                }
            };
            if let Err(e) = self.transport.send(target, bytes).await {
                tracing::warn!(node_id = self.id, target = %target, error = %e, "Send failed");
            }
        }
    }

    async fn publish_commit(&self) {
        let committed = self.state.read().await.log.last_committed_index();
        self.commits.send_if_modified(|current| {
            if *current != committed {
                *current = committed;
                true
            } else {
                false
            }
        });
    }

    /// Watch the committed watermark.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commits.subscribe()
    }

    pub async fn status(&self) -> NodeStatus {
        self.state.read().await.status()
    }

    /// Commands in committed order.
    pub async fn committed_commands(&self) -> Vec<SM::Command> {
        self.state
            .read()
            .await
            .log
            .committed_entries()
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.is_leader()
    }

    pub async fn leader_id(&self) -> Option<u64> {
        self.state.read().await.leader_id
    }

    /// Rendering of the application state as seen by this node.
    pub async fn render(&self) -> String {
        self.machine.lock().await.render()
    }

    /// Apply an operator fault-injection command, returning a message for the operator.
    pub async fn apply_fault(&self, command: FaultCommand) -> Result<String> {
        let message = match command {
            FaultCommand::ForceTimeout => {
                let out = {
                    let mut state = self.state.write().await;
                    if state.role != RaftRole::Follower {
                        return Ok(format!(
                            "node {} is {}, not forcing a timeout",
                            self.id, state.role
                        ));
                    }
                    state.clock = 0;
                    tracing::info!(node_id = self.id, "Election timeout forced");
                    drive(&mut state)
                };
                self.deliver(out).await;
                "election timeout forced".to_string()
            }
            FaultCommand::Fail => {
                self.state.write().await.failed = true;
                tracing::warn!(node_id = self.id, "Node marked failed");
                format!("node {} failed", self.id)
            }
            FaultCommand::Restore => {
                self.state.write().await.failed = false;
                tracing::info!(node_id = self.id, "Node restored");
                format!("node {} restored", self.id)
            }
            FaultCommand::Recover => {
                let len = self.load_log().await?;
                self.state.write().await.failed = false;
                tracing::info!(node_id = self.id, entries = len, "Node recovered from storage");
                format!("node {} recovered {} entries and restored", self.id, len)
            }
            FaultCommand::LoadLog => {
                let len = self.load_log().await?;
                format!("loaded {} entries", len)
            }
            FaultCommand::PrintLog => self.print_log().await,
            FaultCommand::StartCluster => {
                let out = {
                    let mut state = self.state.write().await;
                    start_cluster(&mut state);
                    state.broadcast(Frame::Start)
                };
                self.deliver(out).await;
                "start signal sent".to_string()
            }
            FaultCommand::Help => HELP.to_string(),
        };
        self.publish_commit().await;
        Ok(message)
    }

    /// Replace the in-memory log with the persisted one. A bad file leaves the
    /// current log untouched.
    async fn load_log(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        let store = state
            .store
            .clone()
            .ok_or_else(|| RaftError::Internal("no log store configured".to_string()))?;

        match store.load() {
            Ok(log) => {
                state.log = log;
                state.persistence_error = None;
                replay_committed::<SM>(&mut state, &mut *self.machine.lock().await);
                Ok(state.log.len())
            }
            Err(e) => {
                tracing::error!(node_id = self.id, path = %store.path().display(), error = %e, "Log recovery failed");
                state.persistence_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn print_log(&self) -> String {
        let state = self.state.read().await;
        let mut lines = vec![format!(
            "node {} {} term {} appended {} committed {}",
            self.id,
            state.role,
            state.current_term,
            state.log.last_appended_index(),
            state.log.last_committed_index()
        )];
        for (i, entry) in state.log.entries().iter().enumerate() {
            let index = i as u64 + 1;
            let mark = if index <= state.log.last_committed_index() { '*' } else { ' ' };
            lines.push(format!("{}{:>4} t{} {:?}", mark, index, entry.term, entry.command));
        }
        if let Some(err) = &state.persistence_error {
            lines.push(format!("last persistence error: {}", err));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeIdentity, TimingConfig};
    use crate::machine::{ActionTally, ClientAction};
    use crate::transport::create_transport_mesh;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_tick_and_drive() {
        let mut state: RaftState<String> =
            RaftState::new(Cluster::new(0, vec![(1, addr(7001))], vec![]), TimingConfig::default());
        state.clock = 1;
        assert!(drive(&mut state).is_empty());

        tick(&mut state);
        let out = drive(&mut state);
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_idle_until_started() {
        let mut state: RaftState<String> =
            RaftState::new(Cluster::new(0, vec![(1, addr(7001))], vec![]), TimingConfig::default());
        state.cluster_ready = false;
        state.clock = 0;
        tick(&mut state);
        assert_eq!(state.clock, 0);
        assert!(drive(&mut state).is_empty());

        dispatch(&mut state, addr(7001), Frame::Start);
        assert!(state.cluster_ready);
        assert!(state.clock > 0);
    }

    #[test]
    fn test_failed_node_keeps_time_but_does_nothing() {
        let mut state: RaftState<String> =
            RaftState::new(Cluster::new(0, vec![(1, addr(7001))], vec![]), TimingConfig::default());
        state.failed = true;
        state.clock = 1;
        tick(&mut state);
        assert_eq!(state.clock, 0);
        assert!(drive(&mut state).is_empty());
        assert_eq!(state.role, RaftRole::Follower);
    }

    fn tally_state(actions: &[&str], committed: u64) -> RaftState<ClientAction> {
        let mut state =
            RaftState::new(Cluster::new(0, vec![(1, addr(7001))], vec![]), TimingConfig::default());
        for action in actions {
            let command = ClientAction {
                submitter: 3,
                action: action.to_string(),
            };
            state.log.append_tentative(command, 1);
        }
        for _ in 0..committed {
            state.log.commit().unwrap();
        }
        state
    }

    #[test]
    fn test_follower_applies_only_committed_entries() {
        let mut state = tally_state(&["Q", "W"], 1);
        let mut machine = ActionTally::new();

        apply_committed(&mut state, &mut machine);
        assert_eq!(state.last_applied, 1);
        assert_eq!(machine.count(3, "Q"), 1);
        assert_eq!(machine.count(3, "W"), 0);

        // Nothing new committed, nothing re-applied
        apply_committed(&mut state, &mut machine);
        assert_eq!(machine.applied(), 1);

        state.log.commit().unwrap();
        apply_committed(&mut state, &mut machine);
        assert_eq!(state.last_applied, 2);
        assert_eq!(machine.count(3, "W"), 1);
    }

    #[test]
    fn test_deposed_leader_rolls_back_uncommitted_commands() {
        let mut state = tally_state(&["Q", "W"], 1);
        let mut machine = ActionTally::new();
        machine.apply(&state.log.entries()[0].command);
        machine.apply(&state.log.entries()[1].command);
        state.last_applied = 2;

        apply_committed(&mut state, &mut machine);
        assert_eq!(state.last_applied, 1);
        assert_eq!(machine.count(3, "Q"), 1);
        assert_eq!(machine.count(3, "W"), 0);
    }

    #[test]
    fn test_replay_rebuilds_machine_from_committed_log() {
        let mut state = tally_state(&["Q", "Q", "E"], 2);
        let mut machine = ActionTally::new();
        machine.apply(&ClientAction {
            submitter: 8,
            action: "X".to_string(),
        });

        replay_committed(&mut state, &mut machine);
        assert_eq!(state.last_applied, 2);
        assert_eq!(machine.render(), "client 3: Q=2");
    }

    #[tokio::test]
    async fn test_single_node_commits_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = create_transport_mesh(&[addr(7100)]).await;
        let config = NodeConfig::new(NodeIdentity::server(0, "127.0.0.1", 7100))
            .with_log_path(dir.path().join("node-0.json"));
        let node = RaftNode::new(config, mesh[&addr(7100)].clone(), ActionTally::new()).unwrap();

        assert!(matches!(node.submit(0, "Q").await, Err(RaftError::NotLeader(None))));

        {
            let mut state = node.state.write().await;
            state.clock = 0;
            drive(&mut state);
            assert!(state.is_leader());
        }

        let mut commits = node.subscribe_commits();
        assert_eq!(node.submit(0, "Q").await.unwrap(), 1);
        assert_eq!(*commits.borrow_and_update(), 1);
        assert_eq!(node.committed_commands().await.len(), 1);
        assert!(dir.path().join("node-0.json").exists());

        // Applied once at proposal time, not again on commit
        assert_eq!(node.status().await.last_applied, 1);
        assert_eq!(node.render().await, "client 0: Q=1");

        assert!(matches!(
            node.submit(0, "not valid").await,
            Err(RaftError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = create_transport_mesh(&[addr(7110)]).await;
        let config = NodeConfig::new(NodeIdentity::server(0, "127.0.0.1", 7110))
            .with_log_path(dir.path().join("node-0.json"));
        let node = RaftNode::new(config, mesh[&addr(7110)].clone(), ActionTally::new()).unwrap();

        node.apply_fault(FaultCommand::Fail).await.unwrap();
        assert!(node.status().await.failed);
        assert!(node.submit(0, "Q").await.is_err());

        node.apply_fault(FaultCommand::Restore).await.unwrap();
        assert!(!node.status().await.failed);

        // Alone in its cluster, a forced timeout wins straight away
        node.apply_fault(FaultCommand::ForceTimeout).await.unwrap();
        assert!(node.is_leader().await);

        // Nothing persisted yet
        assert!(node.apply_fault(FaultCommand::Recover).await.is_err());
        assert!(node.status().await.persistence_error.is_some());

        let printed = node.apply_fault(FaultCommand::PrintLog).await.unwrap();
        assert!(printed.starts_with("node 0 leader"));
    }
}
