use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid member '{0}', expected id:kind:host:port")]
    InvalidMember(String),

    #[error("unknown member kind '{0}', expected 'server' or 'client'")]
    UnknownKind(String),

    #[error("cannot resolve address {0}")]
    Unresolvable(String),

    #[error("duplicate member id {0}")]
    DuplicateId(u64),

    #[error("node {0} must be a server")]
    NotAServer(u64),

    #[error("invalid timing: {0}")]
    InvalidTiming(String),
}

/// Whether a group member takes part in consensus or only submits commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Server,
    Client,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Server => write!(f, "server"),
            NodeKind::Client => write!(f, "client"),
        }
    }
}

impl FromStr for NodeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" | "s" => Ok(NodeKind::Server),
            "client" | "c" => Ok(NodeKind::Client),
            other => Err(ConfigError::UnknownKind(other.to_string())),
        }
    }
}

/// Static identity of one process in the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: u64,
    pub kind: NodeKind,
    pub host: String,
    pub port: u16,
}

impl NodeIdentity {
    pub fn server(id: u64, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            kind: NodeKind::Server,
            host: host.into(),
            port,
        }
    }

    pub fn client(id: u64, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            kind: NodeKind::Client,
            host: host.into(),
            port,
        }
    }

    pub fn is_server(&self) -> bool {
        self.kind == NodeKind::Server
    }

    /// Resolve `host:port` once; hostnames are allowed.
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        let target = format!("{}:{}", self.host, self.port);
        target
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(ConfigError::Unresolvable(target))
    }
}

impl FromStr for NodeIdentity {
    type Err = ConfigError;

    /// Parses `id:kind:host:port`, e.g. `2:server:127.0.0.1:7002`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 4 {
            return Err(ConfigError::InvalidMember(s.to_string()));
        }
        let id = parts[0]
            .parse()
            .map_err(|_| ConfigError::InvalidMember(s.to_string()))?;
        let kind = parts[1].parse()?;
        let port = parts[3]
            .parse()
            .map_err(|_| ConfigError::InvalidMember(s.to_string()))?;
        Ok(Self {
            id,
            kind,
            host: parts[2].to_string(),
            port,
        })
    }
}

/// Clock settings, all counted in ticks of `tick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    pub tick: Duration,
    pub election_timeout_min_ticks: i64,
    pub election_timeout_max_ticks: i64,
    pub heartbeat_interval_ticks: i64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            election_timeout_min_ticks: 5,
            election_timeout_max_ticks: 15,
            heartbeat_interval_ticks: 3,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::InvalidTiming("tick must be non-zero".into()));
        }
        if self.heartbeat_interval_ticks <= 0 {
            return Err(ConfigError::InvalidTiming(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.election_timeout_min_ticks > self.election_timeout_max_ticks {
            return Err(ConfigError::InvalidTiming(format!(
                "election timeout range {}..={} is empty",
                self.election_timeout_min_ticks, self.election_timeout_max_ticks
            )));
        }
        if self.heartbeat_interval_ticks >= self.election_timeout_min_ticks {
            return Err(ConfigError::InvalidTiming(format!(
                "heartbeat interval ({}) must be shorter than the minimum election timeout ({})",
                self.heartbeat_interval_ticks, self.election_timeout_min_ticks
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub identity: NodeIdentity,
    /// Every other process in the cluster, servers and clients.
    pub group: Vec<NodeIdentity>,
    pub timing: TimingConfig,
    /// Where the log is persisted on every local commit.
    pub log_path: PathBuf,
    /// Keep the clock idle until a start signal arrives.
    pub wait_for_start: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: NodeIdentity::server(0, "127.0.0.1", 7000),
            group: Vec::new(),
            timing: TimingConfig::default(),
            log_path: PathBuf::from("raft-node-0.log.json"),
            wait_for_start: false,
        }
    }
}

impl NodeConfig {
    pub fn new(identity: NodeIdentity) -> Self {
        let log_path = PathBuf::from(format!("raft-node-{}.log.json", identity.id));
        Self {
            identity,
            log_path,
            ..Default::default()
        }
    }

    pub fn with_member(mut self, member: NodeIdentity) -> Self {
        self.group.push(member);
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Number of servers in the cluster, this node included.
    pub fn cluster_size(&self) -> usize {
        1 + self.group.iter().filter(|m| m.is_server()).count()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.identity.is_server() {
            return Err(ConfigError::NotAServer(self.identity.id));
        }
        let mut seen = vec![self.identity.id];
        for member in &self.group {
            if seen.contains(&member.id) {
                return Err(ConfigError::DuplicateId(member.id));
            }
            seen.push(member.id);
        }
        self.timing.validate()
    }
}

/// Parse a comma-separated member list (`id:kind:host:port,...`).
pub fn parse_members(list: &str) -> Result<Vec<NodeIdentity>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_config_default() {
        let cfg = TimingConfig::default();
        assert_eq!(cfg.tick, Duration::from_secs(1));
        assert_eq!(cfg.election_timeout_min_ticks, 5);
        assert_eq!(cfg.election_timeout_max_ticks, 15);
        assert_eq!(cfg.heartbeat_interval_ticks, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn timing_rejects_heartbeat_not_shorter_than_election() {
        let cfg = TimingConfig {
            heartbeat_interval_ticks: 5,
            ..TimingConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidTiming(_))));
    }

    #[test]
    fn timing_rejects_empty_range() {
        let cfg = TimingConfig {
            election_timeout_min_ticks: 10,
            election_timeout_max_ticks: 8,
            ..TimingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn node_config_new_derives_log_path() {
        let cfg = NodeConfig::new(NodeIdentity::server(4, "127.0.0.1", 7004));
        assert_eq!(cfg.identity.id, 4);
        assert_eq!(cfg.log_path, PathBuf::from("raft-node-4.log.json"));
        assert!(cfg.group.is_empty());
        assert!(!cfg.wait_for_start);
    }

    #[test]
    fn cluster_size_counts_servers_only() {
        let cfg = NodeConfig::default()
            .with_member(NodeIdentity::server(1, "127.0.0.1", 7001))
            .with_member(NodeIdentity::server(2, "127.0.0.1", 7002))
            .with_member(NodeIdentity::client(5, "127.0.0.1", 7005));
        assert_eq!(cfg.cluster_size(), 3);
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let cfg = NodeConfig::default()
            .with_member(NodeIdentity::server(1, "127.0.0.1", 7001))
            .with_member(NodeIdentity::client(1, "127.0.0.1", 7005));
        assert_eq!(cfg.validate(), Err(ConfigError::DuplicateId(1)));
    }

    #[test]
    fn validate_rejects_client_identity() {
        let cfg = NodeConfig::new(NodeIdentity::client(3, "127.0.0.1", 7003));
        assert_eq!(cfg.validate(), Err(ConfigError::NotAServer(3)));
    }

    #[test]
    fn parse_member_list() {
        let members =
            parse_members("1:server:127.0.0.1:7001, 5:client:localhost:7005").unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], NodeIdentity::server(1, "127.0.0.1", 7001));
        assert_eq!(members[1].kind, NodeKind::Client);
        assert_eq!(members[1].host, "localhost");
        assert!(parse_members("").unwrap().is_empty());
    }

    #[test]
    fn parse_member_rejects_bad_input() {
        assert!(matches!(
            "1:server:127.0.0.1".parse::<NodeIdentity>(),
            Err(ConfigError::InvalidMember(_))
        ));
        assert!(matches!(
            "1:router:127.0.0.1:7001".parse::<NodeIdentity>(),
            Err(ConfigError::UnknownKind(_))
        ));
    }

    #[test]
    fn resolve_ip_literal() {
        let id = NodeIdentity::server(1, "127.0.0.1", 7001);
        assert_eq!(id.resolve().unwrap(), "127.0.0.1:7001".parse().unwrap());
    }
}
