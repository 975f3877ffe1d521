use std::net::SocketAddr;

use crate::codec::{CommandOutcome, FollowerAck, Frame, FullLog, ReplicationProposal};
use crate::error::{RaftError, Result};
use crate::raft::state::{Outbound, RaftRole, RaftState};

/// Outcome of checking a proposal against the follower's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consistency {
    Append,
    AlreadyHave,
    Reject,
}

pub fn send_heartbeats<C: Clone>(state: &mut RaftState<C>) -> Vec<Outbound<C>> {
    if state.role != RaftRole::Leader {
        return Vec::new();
    }
    tracing::trace!(node_id = state.id, term = state.current_term, "Sending heartbeats");
    state.reset_heartbeat_clock();
    state.broadcast(Frame::Heartbeat)
}

pub fn handle_heartbeat<C>(state: &mut RaftState<C>, from: SocketAddr) {
    let sender = state.cluster.server_id(from);
    match state.role {
        RaftRole::Leader => {
            tracing::debug!(node_id = state.id, from = %from, "Leader ignoring heartbeat");
        }
        RaftRole::Candidate => {
            tracing::info!(node_id = state.id, leader = ?sender, "Heard heartbeat, abandoning candidacy");
            state.become_follower(sender);
        }
        RaftRole::Follower => {
            state.reset_election_clock();
            if state.leader_id.is_none() {
                state.leader_id = sender;
            }
        }
    }
}

/// Append a command on the leader and multicast it to the other servers.
///
/// `outcome` is what the application reported when the leader applied the
/// command; it is announced to clients once the entry commits.
pub fn propose_command<C: Clone>(
    state: &mut RaftState<C>,
    command: C,
    outcome: CommandOutcome,
) -> Result<Vec<Outbound<C>>>
where
    C: serde::Serialize,
{
    if state.role != RaftRole::Leader {
        return Err(RaftError::NotLeader(state.leader_id));
    }

    let index = state.log.append_tentative(command.clone(), state.current_term);
    state.acks.clear();
    state.pending_outcome = Some(outcome);

    tracing::debug!(
        node_id = state.id,
        term = state.current_term,
        index,
        "Proposing command"
    );

    let proposal = ReplicationProposal {
        term: state.current_term,
        entry: command,
        last_committed_index: state.log.last_committed_index(),
        last_appended_index: state.log.last_appended_index(),
        prev_log_term: state.log.prev_log_term(),
        prev_log_index: state.log.prev_log_index(),
        next_index: state.log.next_index(),
    };
    let mut out = state.broadcast(Frame::Replicate(proposal));
    out.extend(try_commit(state));
    Ok(out)
}

/// How a receiver treats a frame that only a leader sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaderFrame {
    Accept,
    Ignore,
    /// The sender's term is behind ours; refuse it so the sender steps down.
    Stale,
}

/// Role and term bookkeeping shared by frames that only a leader sends.
///
/// A follower keeps accepting frames from the leader it already follows even if
/// its own term has run ahead: win announcements raise a follower's term without
/// telling it the winner's.
fn accept_leader_frame<C>(state: &mut RaftState<C>, from: SocketAddr, term: u64) -> LeaderFrame {
    let sender = state.cluster.server_id(from);
    let own_leader = state.role == RaftRole::Follower && sender.is_some() && state.leader_id == sender;
    if term < state.current_term && !own_leader {
        tracing::warn!(
            node_id = state.id,
            term = state.current_term,
            frame_term = term,
            from = %from,
            "Refusing leader frame from an older term"
        );
        return LeaderFrame::Stale;
    }

    match state.role {
        RaftRole::Leader if term == state.current_term => {
            tracing::warn!(
                node_id = state.id,
                term = state.current_term,
                from = %from,
                "Ignoring leader frame from the same term"
            );
            return LeaderFrame::Ignore;
        }
        RaftRole::Leader | RaftRole::Candidate => {
            tracing::info!(
                node_id = state.id,
                frame_term = term,
                leader = ?sender,
                "Deferring to active leader"
            );
            state.become_follower(sender);
        }
        RaftRole::Follower => {
            state.reset_election_clock();
            if sender.is_some() {
                state.leader_id = sender;
            }
        }
    }
    state.observe_term(term);
    LeaderFrame::Accept
}

fn check_consistency<C: PartialEq>(
    state: &RaftState<C>,
    p: &ReplicationProposal<C>,
) -> Consistency {
    let expected = p.last_appended_index;
    let next_index = state.log.next_index();

    if next_index < expected {
        return Consistency::Reject;
    }
    if p.prev_log_index > 0 && state.log.term_at(p.prev_log_index) != p.prev_log_term {
        return Consistency::Reject;
    }
    if next_index == expected {
        return Consistency::Append;
    }

    match state.log.entry(expected) {
        Some(e) if e.term == p.term && e.command == p.entry => Consistency::AlreadyHave,
        _ if expected <= state.log.last_committed_index() => Consistency::Reject,
        _ => Consistency::Append,
    }
}

pub fn handle_replication<C: Clone + PartialEq>(
    state: &mut RaftState<C>,
    from: SocketAddr,
    p: ReplicationProposal<C>,
) -> Vec<Outbound<C>> {
    match accept_leader_frame(state, from, p.term) {
        LeaderFrame::Accept => {}
        LeaderFrame::Ignore => return Vec::new(),
        LeaderFrame::Stale => return vec![refuse_stale(state, from)],
    }

    let success = match check_consistency(state, &p) {
        Consistency::Reject => {
            tracing::debug!(
                node_id = state.id,
                next_index = state.log.next_index(),
                expected = p.last_appended_index,
                "Log inconsistent with proposal"
            );
            false
        }
        Consistency::AlreadyHave => true,
        Consistency::Append => {
            if state.log.next_index() > p.last_appended_index {
                if let Err(e) = state.log.truncate_from(p.last_appended_index) {
                    tracing::warn!(node_id = state.id, error = %e, "Cannot truncate for proposal");
                    return vec![ack(state, from, false)];
                }
            }
            let index = state.log.append_tentative(p.entry, p.term);
            tracing::debug!(node_id = state.id, index, term = p.term, "Appended entry");
            true
        }
    };

    vec![ack(state, from, success)]
}

fn ack<C>(state: &RaftState<C>, target: SocketAddr, success: bool) -> Outbound<C> {
    Outbound {
        target,
        frame: Frame::Ack(FollowerAck {
            term: state.current_term,
            success,
            last_committed_index: state.log.last_committed_index(),
            next_index: state.log.next_index(),
            stale_term: false,
        }),
    }
}

fn refuse_stale<C>(state: &RaftState<C>, target: SocketAddr) -> Outbound<C> {
    let mut out = ack(state, target, false);
    if let Frame::Ack(a) = &mut out.frame {
        a.stale_term = true;
    }
    out
}

/// Tally a follower's answer; a refusal triggers a full-log repair.
pub fn handle_ack<C: Clone + serde::Serialize>(
    state: &mut RaftState<C>,
    from: SocketAddr,
    ack: FollowerAck,
) -> Vec<Outbound<C>> {
    if state.role != RaftRole::Leader {
        tracing::debug!(node_id = state.id, from = %from, "Ignoring ack, not leader");
        return Vec::new();
    }
    let Some(peer) = state.cluster.server_id(from) else {
        tracing::warn!(node_id = state.id, from = %from, "Ack from unknown sender, dropping");
        return Vec::new();
    };

    if ack.stale_term {
        if ack.term > state.current_term {
            tracing::warn!(
                node_id = state.id,
                term = state.current_term,
                peer,
                peer_term = ack.term,
                "Follower is on a newer term, stepping down"
            );
            state.observe_term(ack.term);
            state.become_follower(None);
        }
        return Vec::new();
    }

    if ack.success {
        // Only an ack covering the latest entry counts toward its commit
        if ack.next_index <= state.log.last_appended_index() {
            tracing::debug!(node_id = state.id, peer, next_index = ack.next_index, "Stale ack");
            return Vec::new();
        }
        state.acks.insert(peer);
        return try_commit(state);
    }

    tracing::info!(
        node_id = state.id,
        peer,
        peer_next_index = ack.next_index,
        peer_committed = ack.last_committed_index,
        "Follower diverged, sending full log"
    );
    vec![Outbound {
        target: from,
        frame: Frame::Overwrite(FullLog {
            term: state.current_term,
            log: state.log.clone(),
        }),
    }]
}

/// Commit every appended entry once a majority holds the latest proposal.
pub fn try_commit<C: Clone + serde::Serialize>(state: &mut RaftState<C>) -> Vec<Outbound<C>> {
    if state.role != RaftRole::Leader || state.acks.len() + 1 < state.majority() {
        return Vec::new();
    }
    state.acks.clear();

    let newly = state.log.commit_all();
    if newly == 0 {
        return Vec::new();
    }
    tracing::info!(
        node_id = state.id,
        term = state.current_term,
        committed = state.log.last_committed_index(),
        newly,
        "Committed entries"
    );
    // Already logged and recorded on the state
    let _ = state.persist();

    let mut out = Vec::new();
    for _ in 0..newly {
        out.extend(state.broadcast(Frame::Commit));
    }
    if let Some(outcome) = state.pending_outcome.take() {
        out.extend(state.to_clients(Frame::Outcome(outcome)));
    }
    out
}

/// Replace the local log with the leader's copy and acknowledge it.
pub fn handle_overwrite<C: Clone + PartialEq + serde::Serialize>(
    state: &mut RaftState<C>,
    from: SocketAddr,
    full: FullLog<C>,
) -> Vec<Outbound<C>> {
    match accept_leader_frame(state, from, full.term) {
        LeaderFrame::Accept => {}
        LeaderFrame::Ignore => return Vec::new(),
        LeaderFrame::Stale => return vec![refuse_stale(state, from)],
    }

    let committed_before = state.log.last_committed_index();
    if full.log.last_appended_index() < committed_before {
        tracing::debug!(
            node_id = state.id,
            incoming = full.log.last_appended_index(),
            committed = committed_before,
            "Ignoring overwrite shorter than committed prefix"
        );
        return vec![ack(state, from, true)];
    }
    if !state.log.keeps_committed_prefix(&full.log) {
        tracing::warn!(
            node_id = state.id,
            committed = committed_before,
            from = %from,
            "Refusing overwrite that rewrites committed entries"
        );
        return Vec::new();
    }
    state.log.overwrite_with(full.log);
    tracing::info!(
        node_id = state.id,
        appended = state.log.last_appended_index(),
        committed = state.log.last_committed_index(),
        "Log replaced by leader"
    );
    if state.log.last_committed_index() > committed_before {
        let _ = state.persist();
    }

    vec![ack(state, from, true)]
}

pub fn handle_commit<C: serde::Serialize>(state: &mut RaftState<C>) {
    if state.role == RaftRole::Leader {
        tracing::debug!(node_id = state.id, "Leader ignoring commit notification");
        return;
    }
    match state.log.commit() {
        Ok(index) => {
            tracing::debug!(node_id = state.id, committed = index, "Commit notification applied");
            let _ = state.persist();
        }
        Err(e) => {
            tracing::warn!(node_id = state.id, error = %e, "Commit notification ahead of log");
        }
    }
}
