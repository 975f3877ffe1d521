pub mod election;
pub mod log;
pub mod node;
pub mod replication;
pub mod state;
pub mod storage;
pub mod timer;

pub use log::{LogEntry, LogError, ReplicatedLog};
pub use node::RaftNode;
pub use state::{Cluster, NodeStatus, Outbound, RaftRole, RaftState};
pub use storage::LogStore;
