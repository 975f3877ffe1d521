use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The replicated application, opaque to the consensus core.
///
/// Every server applies committed commands in log order. The leader applies a
/// command when it proposes it, to obtain the outcome announced to clients after
/// commit. The command type must survive the wire and the persisted log unchanged.
pub trait StateMachine: Send + 'static {
    type Command: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Turn a client frame (`<submitter>_<action>`) into a command, or reject it.
    fn parse_command(&self, submitter: u64, action: &str) -> Option<Self::Command>;

    /// Apply a command, returning a short description of the outcome.
    fn apply(&mut self, command: &Self::Command) -> String;

    /// Human-readable rendering of the current state.
    fn render(&self) -> String;

    /// Forget everything applied so far, before a replay from the log.
    fn reset(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAction {
    pub submitter: u64,
    pub action: String,
}

/// Counts the actions each client has submitted.
#[derive(Debug, Clone, Default)]
pub struct ActionTally {
    counts: BTreeMap<u64, BTreeMap<String, u64>>,
    applied: u64,
}

impl ActionTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn count(&self, submitter: u64, action: &str) -> u64 {
        self.counts
            .get(&submitter)
            .and_then(|actions| actions.get(action))
            .copied()
            .unwrap_or(0)
    }
}

impl StateMachine for ActionTally {
    type Command = ClientAction;

    fn parse_command(&self, submitter: u64, action: &str) -> Option<ClientAction> {
        let action = action.trim();
        if action.is_empty() || !action.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(ClientAction {
            submitter,
            action: action.to_ascii_uppercase(),
        })
    }

    fn apply(&mut self, command: &ClientAction) -> String {
        let count = self
            .counts
            .entry(command.submitter)
            .or_default()
            .entry(command.action.clone())
            .or_insert(0);
        *count += 1;
        self.applied += 1;
        format!(
            "client {} did {} (x{})",
            command.submitter, command.action, count
        )
    }

    fn render(&self) -> String {
        if self.counts.is_empty() {
            return "no actions yet".to_string();
        }
        self.counts
            .iter()
            .map(|(submitter, actions)| {
                let actions: Vec<String> = actions
                    .iter()
                    .map(|(action, n)| format!("{}={}", action, n))
                    .collect();
                format!("client {}: {}", submitter, actions.join(" "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
