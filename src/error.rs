use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::raft::log::LogError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Malformed frame: {0}")]
    Codec(#[from] CodecError),

    #[error("Log inconsistency: {0}")]
    Log(#[from] LogError),

    #[error("Persistence failure at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt log snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
