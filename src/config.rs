//! Node and client configuration.
//!
//! Node identity and membership are handed to the core as values; nothing is
//! read from the process environment or command line here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::membership::{ClusterMember, MembershipError, PortScheme};
use crate::codec::PayloadKind;

/// Default keep-alive interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 1000;

/// Default number of committed entries between automatic snapshots.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("member {0} is not part of the cluster membership")]
    UnknownMember(u32),

    #[error("cluster membership is empty")]
    EmptyMembership,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{0}")]
    Invalid(String),

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Membership(#[from] MembershipError),
}

/// Backoff idle strategy parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub max_spins: u64,
    pub max_yields: u64,
    pub min_park_ns: u64,
    pub max_park_ns: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        IdleConfig {
            max_spins: 10,
            max_yields: 5,
            min_park_ns: 1_000,
            max_park_ns: 1_000_000,
        }
    }
}

impl IdleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_park_ns > self.max_park_ns {
            return Err(ConfigError::Invalid(format!(
                "min_park_ns {} exceeds max_park_ns {}",
                self.min_park_ns, self.max_park_ns
            )));
        }
        Ok(())
    }
}

/// Per-node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's member id.
    pub member_id: u32,
    /// Full membership, identical and identically ordered on every node.
    pub membership: Vec<ClusterMember>,
    /// Root directory for this node's recorded snapshots.
    pub data_dir: PathBuf,
    /// Committed entries between automatic snapshots. Zero disables them.
    pub snapshot_threshold: u64,
    /// Number of snapshot images the file recorder keeps.
    pub snapshots_retained: usize,
    /// Deadline for delivering one response to a session.
    pub response_send_timeout_ms: u64,
    /// Responses held per session while its egress is backpressured.
    pub max_buffered_responses: usize,
    /// Encoding this node's echo service accepts.
    pub payload_kind: PayloadKind,
    pub idle: IdleConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            member_id: 0,
            membership: Vec::new(),
            data_dir: PathBuf::from("node0"),
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            snapshots_retained: 2,
            response_send_timeout_ms: 100,
            max_buffered_responses: 1024,
            payload_kind: PayloadKind::Integer,
            idle: IdleConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Configuration for `member_id` in a cluster of `hostnames`, ports derived
    /// from `scheme`, data under `base_dir/node{member_id}`.
    pub fn for_member(
        member_id: u32,
        hostnames: &[&str],
        scheme: &PortScheme,
        base_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let membership = hostnames
            .iter()
            .enumerate()
            .map(|(id, host)| ClusterMember::derive(id as u32, host, scheme))
            .collect::<Result<Vec<_>, _>>()?;
        let config = NodeConfig {
            member_id,
            membership,
            data_dir: base_dir.join(format!("node{}", member_id)),
            ..NodeConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse from JSON and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.membership.is_empty() {
            return Err(ConfigError::EmptyMembership);
        }
        if !self.membership.iter().any(|m| m.member_id == self.member_id) {
            return Err(ConfigError::UnknownMember(self.member_id));
        }
        for (position, member) in self.membership.iter().enumerate() {
            if member.member_id as usize != position {
                return Err(ConfigError::Invalid(format!(
                    "membership must be ordered by member id: found {} at position {}",
                    member.member_id, position
                )));
            }
        }
        if self.response_send_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "response_send_timeout_ms",
            });
        }
        if self.snapshots_retained == 0 {
            return Err(ConfigError::Zero {
                field: "snapshots_retained",
            });
        }
        self.idle.validate()
    }

    /// This node's own membership entry.
    pub fn this_member(&self) -> Option<&ClusterMember> {
        self.membership.iter().find(|m| m.member_id == self.member_id)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn response_send_timeout(&self) -> Duration {
        Duration::from_millis(self.response_send_timeout_ms)
    }
}

/// Client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `memberId=host:port` list of client-facing endpoints.
    pub ingress_endpoints: String,
    /// Endpoint this client receives egress on.
    pub egress_endpoint: String,
    /// Capacity of the egress inbox, in messages.
    pub egress_capacity: usize,
    /// Inactivity after which a keep-alive is emitted.
    pub keep_alive_interval_ms: u64,
    /// Pause between application messages sent by the liveness monitor.
    pub message_interval_ms: u64,
    /// Deadline for a single gated ingress send.
    pub send_timeout_ms: u64,
    /// Deadline for a submitted message to be answered.
    pub response_timeout_ms: u64,
    /// Deadline for the connect handshake.
    pub connect_timeout_ms: u64,
    pub idle: IdleConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            ingress_endpoints: String::new(),
            egress_endpoint: "localhost:0".to_string(),
            egress_capacity: 1024,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            message_interval_ms: 10,
            send_timeout_ms: 5_000,
            response_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            idle: IdleConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingress_endpoints.trim().is_empty() {
            return Err(ConfigError::Invalid("ingress_endpoints is empty".to_string()));
        }
        if self.egress_endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("egress_endpoint is empty".to_string()));
        }
        let positive = [
            ("egress_capacity", self.egress_capacity as u64),
            ("keep_alive_interval_ms", self.keep_alive_interval_ms),
            ("message_interval_ms", self.message_interval_ms),
            ("send_timeout_ms", self.send_timeout_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }
        self.idle.validate()
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_millis(self.message_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_member_derives_three_node_cluster() {
        let config = NodeConfig::for_member(
            1,
            &["localhost", "localhost", "localhost"],
            &PortScheme::default(),
            Path::new("/tmp/cluster"),
        )
        .unwrap();

        assert_eq!(config.membership.len(), 3);
        assert_eq!(config.this_member().unwrap().client_endpoint(), "localhost:9102");
        assert_eq!(config.snapshot_dir(), PathBuf::from("/tmp/cluster/node1/snapshots"));
    }

    #[test]
    fn test_unknown_member_rejected() {
        let err = NodeConfig::for_member(3, &["a", "b"], &PortScheme::default(), Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMember(3)));
    }

    #[test]
    fn test_port_overflow_rejected() {
        let hosts = ["localhost"; 12];
        let scheme = PortScheme::new(65000, 100).unwrap();
        let err = NodeConfig::for_member(0, &hosts, &scheme, Path::new("/tmp")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Membership(MembershipError::PortOverflow { member_id: 6, .. })
        ));
    }

    #[test]
    fn test_node_config_from_json_uses_defaults() {
        let json = r#"{
            "member_id": 0,
            "membership": [{
                "member_id": 0,
                "host": "localhost",
                "client_port": 9002,
                "member_port": 9003,
                "log_port": 9004,
                "transfer_port": 9005,
                "archive_control_port": 9001
            }]
        }"#;
        let config = NodeConfig::from_json_str(json).unwrap();
        assert_eq!(config.snapshot_threshold, DEFAULT_SNAPSHOT_THRESHOLD);
        assert_eq!(config.payload_kind, PayloadKind::Integer);
        assert_eq!(config.idle, IdleConfig::default());
    }

    #[test]
    fn test_client_defaults_keep_alive_one_second() {
        let config = ClientConfig::from_json_str(r#"{"ingress_endpoints": "0=localhost:9002"}"#).unwrap();
        assert_eq!(config.keep_alive_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_client_zero_interval_rejected() {
        let config = ClientConfig {
            ingress_endpoints: "0=localhost:9002".to_string(),
            keep_alive_interval_ms: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero { field: "keep_alive_interval_ms" })
        ));
    }

    #[test]
    fn test_inverted_park_bounds_rejected() {
        let config = ClientConfig {
            ingress_endpoints: "0=localhost:9002".to_string(),
            idle: IdleConfig {
                min_park_ns: 10,
                max_park_ns: 1,
                ..IdleConfig::default()
            },
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
