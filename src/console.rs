//! Operator console for fault injection.
//!
//! Reads single-letter commands from stdin and applies them to the running node.

use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::machine::StateMachine;
use crate::raft::RaftNode;

pub const HELP: &str = "\
commands:
  t  force an election timeout (followers only)
  f  fail this node: drop all traffic, keep the clock running
  s  restore a failed node
  r  recover the log from storage and restore
  l  load the log from storage
  p  print the log
  S  start the cluster
  ?  show this help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCommand {
    ForceTimeout,
    Fail,
    Restore,
    Recover,
    LoadLog,
    PrintLog,
    StartCluster,
    Help,
}

impl FromStr for FaultCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "t" => Ok(FaultCommand::ForceTimeout),
            "f" => Ok(FaultCommand::Fail),
            "s" => Ok(FaultCommand::Restore),
            "r" => Ok(FaultCommand::Recover),
            "l" => Ok(FaultCommand::LoadLog),
            "p" => Ok(FaultCommand::PrintLog),
            "S" => Ok(FaultCommand::StartCluster),
            "?" | "h" | "help" => Ok(FaultCommand::Help),
            other => Err(format!("unknown command '{}', type ? for help", other)),
        }
    }
}

/// Run the console until stdin closes or shutdown is requested.
pub async fn run_console<SM: StateMachine>(node: Arc<RaftNode<SM>>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("Console input closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read console input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<FaultCommand>() {
            Ok(cmd) => match node.apply_fault(cmd).await {
                Ok(message) => println!("{}", message),
                Err(e) => println!("error: {}", e),
            },
            Err(message) => println!("{}", message),
        }
    }
}
