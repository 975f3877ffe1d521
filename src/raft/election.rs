use std::net::SocketAddr;

use crate::codec::{ElectionRequest, Frame, VoteReply};
use crate::raft::state::{Outbound, RaftRole, RaftState};

/// Start a new election after the follower's clock ran out.
///
/// A single-server cluster wins on the spot.
pub fn start_election<C: Clone>(state: &mut RaftState<C>) -> Vec<Outbound<C>> {
    if state.role != RaftRole::Follower || state.clock > 0 {
        return Vec::new();
    }

    state.become_candidate();
    tracing::info!(
        node_id = state.id,
        term = state.current_term,
        "Election timeout, starting election"
    );

    if state.votes_received() >= state.majority() {
        return win_election(state);
    }

    let request = ElectionRequest {
        candidate_id: state.id,
        term: state.current_term,
        last_committed_index: state.log.last_committed_index(),
        last_committed_term: state.log.last_committed_term(),
    };
    state.broadcast(Frame::VoteRequest(request))
}

/// Answer a vote solicitation, point to point.
pub fn handle_vote_request<C>(
    state: &mut RaftState<C>,
    from: SocketAddr,
    req: &ElectionRequest,
) -> Vec<Outbound<C>> {
    let already_voted = state.voted_term.is_some_and(|t| t >= req.term);
    let granted = req.term >= state.current_term
        && req.log_is_current(state.log.last_committed_index())
        && !already_voted;

    tracing::debug!(
        node_id = state.id,
        candidate = req.candidate_id,
        term = req.term,
        granted,
        "Vote request"
    );

    let reply = VoteReply {
        voter_id: state.id,
        term: req.term,
    };
    let frame = if granted {
        state.voted_term = Some(req.term);
        if state.role != RaftRole::Leader {
            state.reset_election_clock();
        }
        Frame::VoteGranted(reply)
    } else {
        Frame::VoteDenied(reply)
    };

    vec![Outbound {
        target: from,
        frame,
    }]
}

/// Count a vote reply; a candidate reaching a majority takes leadership.
pub fn handle_vote_reply<C: Clone>(
    state: &mut RaftState<C>,
    reply: VoteReply,
    granted: bool,
) -> Vec<Outbound<C>> {
    if state.role != RaftRole::Candidate || reply.term != state.current_term {
        tracing::debug!(
            node_id = state.id,
            voter = reply.voter_id,
            reply_term = reply.term,
            role = %state.role,
            "Ignoring stale vote reply"
        );
        return Vec::new();
    }

    if !granted {
        tracing::debug!(node_id = state.id, voter = reply.voter_id, "Vote denied");
        return Vec::new();
    }

    state.votes.insert(reply.voter_id);
    if state.votes_received() >= state.majority() {
        win_election(state)
    } else {
        Vec::new()
    }
}

fn win_election<C: Clone>(state: &mut RaftState<C>) -> Vec<Outbound<C>> {
    tracing::info!(
        node_id = state.id,
        term = state.current_term,
        votes = state.votes_received(),
        "Won election, becoming leader"
    );
    state.become_leader();
    state.broadcast(Frame::Won {
        winner_id: state.id,
    })
}

/// Concede to an announced winner and open a fresh term.
pub fn handle_win_announcement<C>(state: &mut RaftState<C>, winner_id: u64) {
    if winner_id == state.id {
        return;
    }
    if state.role == RaftRole::Follower && state.leader_id == Some(winner_id) {
        tracing::debug!(node_id = state.id, leader = winner_id, "Already following leader");
        return;
    }

    if state.role == RaftRole::Leader {
        tracing::warn!(
            node_id = state.id,
            term = state.current_term,
            winner = winner_id,
            "Another node won an election, stepping down"
        );
    }
    state.current_term += 1;
    state.become_follower(Some(winner_id));
    tracing::info!(
        node_id = state.id,
        term = state.current_term,
        leader = winner_id,
        "Following new leader"
    );
}

/// A candidate whose clock ran out without a majority goes back to waiting.
pub fn abandon_candidacy<C>(state: &mut RaftState<C>) {
    if state.role != RaftRole::Candidate || state.clock > 0 {
        return;
    }
    tracing::info!(
        node_id = state.id,
        term = state.current_term,
        votes = state.votes_received(),
        "Election timed out without a majority"
    );
    state.become_follower(None);
}

impl ElectionRequest {
    fn log_is_current(&self, own_committed: u64) -> bool {
        self.last_committed_index >= own_committed
    }
}
