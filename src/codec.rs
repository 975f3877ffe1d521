//! Wire format for protocol frames.
//!
//! Every frame is UTF-8 text: a leading tag character, optionally followed by
//! [`DELIMITER`] and a JSON payload. Client commands are the exception and travel
//! as `<submitter>_<action>` (e.g. `0_Q`), tagged by their leading digit.
//!
//! | Tag | Payload | Frame |
//! |-----|---------|-------|
//! | `H` | none | [`Frame::Heartbeat`] |
//! | `E` | [`ElectionRequest`] | [`Frame::VoteRequest`] |
//! | `Y` / `N` | [`VoteReply`] | [`Frame::VoteGranted`] / [`Frame::VoteDenied`] |
//! | `W` | winner id | [`Frame::Won`] |
//! | `R` | [`ReplicationProposal`] | [`Frame::Replicate`] |
//! | `A` | [`FollowerAck`] | [`Frame::Ack`] |
//! | `U` | [`FullLog`] | [`Frame::Overwrite`] |
//! | `C` | none | [`Frame::Commit`] |
//! | `S` | none | [`Frame::Start`] |
//! | `O` | [`CommandOutcome`] | [`Frame::Outcome`] |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::log::ReplicatedLog;

pub const DELIMITER: char = '$';

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM: usize = 16 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown frame tag '{0}'")]
    UnknownTag(char),

    #[error("frame '{0}' requires a payload")]
    MissingPayload(char),

    #[error("frame '{0}' carries an unexpected payload")]
    UnexpectedPayload(char),

    #[error("bad payload in frame '{tag}': {reason}")]
    Payload { tag: char, reason: String },

    #[error("bad client command '{0}'")]
    ClientCommand(String),

    #[error("frame of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRequest {
    pub candidate_id: u64,
    pub term: u64,
    pub last_committed_index: u64,
    pub last_committed_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub voter_id: u64,
    /// Term of the election being answered.
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationProposal<C> {
    pub term: u64,
    pub entry: C,
    pub last_committed_index: u64,
    pub last_appended_index: u64,
    pub prev_log_term: u64,
    pub prev_log_index: u64,
    pub next_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerAck {
    pub term: u64,
    pub success: bool,
    pub last_committed_index: u64,
    pub next_index: u64,
    /// Refused because the proposing leader's term is behind `term`.
    #[serde(default)]
    pub stale_term: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullLog<C> {
    pub term: u64,
    pub log: ReplicatedLog<C>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub submitter: u64,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub outcome: String,
    pub rendering: String,
}

/// A protocol frame, generic over the replicated command type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<C> {
    Heartbeat,
    VoteRequest(ElectionRequest),
    VoteGranted(VoteReply),
    VoteDenied(VoteReply),
    Won { winner_id: u64 },
    Replicate(ReplicationProposal<C>),
    Ack(FollowerAck),
    Overwrite(FullLog<C>),
    Commit,
    ClientCommand(ClientRequest),
    Start,
    Outcome(CommandOutcome),
}

impl<C> Frame<C> {
    pub fn tag(&self) -> char {
        match self {
            Frame::Heartbeat => 'H',
            Frame::VoteRequest(_) => 'E',
            Frame::VoteGranted(_) => 'Y',
            Frame::VoteDenied(_) => 'N',
            Frame::Won { .. } => 'W',
            Frame::Replicate(_) => 'R',
            Frame::Ack(_) => 'A',
            Frame::Overwrite(_) => 'U',
            Frame::Commit => 'C',
            Frame::ClientCommand(req) => req
                .submitter
                .to_string()
                .chars()
                .next()
                .unwrap_or('0'),
            Frame::Start => 'S',
            Frame::Outcome(_) => 'O',
        }
    }
}

pub fn encode<C: Serialize>(frame: &Frame<C>) -> Result<Vec<u8>, CodecError> {
    let tag = frame.tag();
    let payload = match frame {
        Frame::Heartbeat | Frame::Commit | Frame::Start => None,
        Frame::ClientCommand(req) => {
            if req.action.is_empty() {
                return Err(CodecError::ClientCommand(String::new()));
            }
            return check_size(format!("{}_{}", req.submitter, req.action).into_bytes());
        }
        Frame::VoteRequest(req) => Some(to_json(tag, req)?),
        Frame::VoteGranted(reply) | Frame::VoteDenied(reply) => Some(to_json(tag, reply)?),
        Frame::Won { winner_id } => Some(to_json(tag, winner_id)?),
        Frame::Replicate(proposal) => Some(to_json(tag, proposal)?),
        Frame::Ack(ack) => Some(to_json(tag, ack)?),
        Frame::Overwrite(full) => Some(to_json(tag, full)?),
        Frame::Outcome(outcome) => Some(to_json(tag, outcome)?),
    };

    let text = match payload {
        Some(json) => format!("{}{}{}", tag, DELIMITER, json),
        None => tag.to_string(),
    };
    check_size(text.into_bytes())
}

pub fn decode<C: DeserializeOwned>(bytes: &[u8]) -> Result<Frame<C>, CodecError> {
    if bytes.len() > MAX_DATAGRAM {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    let tag = text.chars().next().ok_or(CodecError::Empty)?;

    if tag.is_ascii_digit() {
        return decode_client_command(text).map(Frame::ClientCommand);
    }

    let rest = &text[tag.len_utf8()..];
    let payload = if rest.is_empty() {
        None
    } else if let Some(json) = rest.strip_prefix(DELIMITER) {
        Some(json)
    } else {
        return Err(CodecError::Payload {
            tag,
            reason: format!("expected '{}' after tag", DELIMITER),
        });
    };

    match tag {
        'H' => no_payload(tag, payload).map(|_| Frame::Heartbeat),
        'C' => no_payload(tag, payload).map(|_| Frame::Commit),
        'S' => no_payload(tag, payload).map(|_| Frame::Start),
        'E' => from_json(tag, payload).map(Frame::VoteRequest),
        'Y' => from_json(tag, payload).map(Frame::VoteGranted),
        'N' => from_json(tag, payload).map(Frame::VoteDenied),
        'W' => from_json(tag, payload).map(|winner_id| Frame::Won { winner_id }),
        'R' => from_json(tag, payload).map(Frame::Replicate),
        'A' => from_json(tag, payload).map(Frame::Ack),
        'U' => {
            let full: FullLog<C> = from_json(tag, payload)?;
            full.log.validate().map_err(|e| CodecError::Payload {
                tag,
                reason: e.to_string(),
            })?;
            Ok(Frame::Overwrite(full))
        }
        'O' => from_json(tag, payload).map(Frame::Outcome),
        other => Err(CodecError::UnknownTag(other)),
    }
}

fn decode_client_command(text: &str) -> Result<ClientRequest, CodecError> {
    let invalid = || CodecError::ClientCommand(text.to_string());
    let (submitter, action) = text.trim_end().split_once('_').ok_or_else(invalid)?;
    let submitter = submitter.parse().map_err(|_| invalid())?;
    if action.is_empty() {
        return Err(invalid());
    }
    Ok(ClientRequest {
        submitter,
        action: action.to_string(),
    })
}

fn to_json<T: Serialize>(tag: char, value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Payload {
        tag,
        reason: e.to_string(),
    })
}

fn from_json<T: DeserializeOwned>(tag: char, payload: Option<&str>) -> Result<T, CodecError> {
    let json = payload.ok_or(CodecError::MissingPayload(tag))?;
    serde_json::from_str(json).map_err(|e| CodecError::Payload {
        tag,
        reason: e.to_string(),
    })
}

fn no_payload(tag: char, payload: Option<&str>) -> Result<(), CodecError> {
    match payload {
        None => Ok(()),
        Some(_) => Err(CodecError::UnexpectedPayload(tag)),
    }
}

fn check_size(bytes: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    if bytes.len() > MAX_DATAGRAM {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}
