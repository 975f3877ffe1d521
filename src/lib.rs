pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod machine;
pub mod raft;
pub mod shutdown;
pub mod transport;
