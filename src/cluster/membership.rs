//! Cluster membership and port derivation.
//!
//! # Descriptor format
//!
//! One entry per member, in member id order, entries terminated by `|`
//! (the final terminator is optional):
//!
//! ```text
//! id,client_endpoint,member_endpoint,log_endpoint,transfer_endpoint,archive_control_endpoint|
//! ```
//!
//! Every endpoint is `host:port`. Every node must parse the identical string.
//!
//! # Ingress endpoints format
//!
//! Clients use `id=host:port` entries separated by `,` (trailing `,` allowed).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Membership parse / validation errors.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("entry {entry}: expected 6 comma-separated fields, found {found}")]
    FieldCount { entry: usize, found: usize },

    #[error("entry {entry}: invalid member id {value:?}")]
    InvalidMemberId { entry: usize, value: String },

    #[error("entry {entry}: invalid endpoint {value:?}")]
    InvalidEndpoint { entry: usize, value: String },

    #[error("entry {entry}: member id {found} out of order, expected {expected}")]
    OutOfOrder { entry: usize, expected: u32, found: u32 },

    #[error("entry {entry}: endpoints on host {host} use different hosts")]
    MixedHosts { entry: usize, host: String },

    #[error("port stride {stride} does not exceed the largest role offset {max_offset}")]
    StrideTooSmall { stride: u16, max_offset: u16 },

    #[error("member {member_id} role {role} overflows the port range")]
    PortOverflow { member_id: u32, role: PortRole },

    #[error("membership is empty")]
    Empty,
}

/// Traffic roles that each get a port per node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    ArchiveControl,
    Client,
    Member,
    Log,
    Transfer,
    LogControl,
}

impl PortRole {
    pub const ALL: [PortRole; 6] = [
        PortRole::ArchiveControl,
        PortRole::Client,
        PortRole::Member,
        PortRole::Log,
        PortRole::Transfer,
        PortRole::LogControl,
    ];

    /// Offset of this role within a node's port block.
    pub fn offset(self) -> u16 {
        match self {
            PortRole::ArchiveControl => 1,
            PortRole::Client => 2,
            PortRole::Member => 3,
            PortRole::Log => 4,
            PortRole::Transfer => 5,
            PortRole::LogControl => 6,
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortRole::ArchiveControl => "archive-control",
            PortRole::Client => "client",
            PortRole::Member => "member",
            PortRole::Log => "log",
            PortRole::Transfer => "transfer",
            PortRole::LogControl => "log-control",
        };
        f.write_str(name)
    }
}

/// `port(node, role) = base + node * stride + role.offset()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortScheme {
    pub base: u16,
    pub stride: u16,
}

impl Default for PortScheme {
    fn default() -> Self {
        PortScheme {
            base: 9000,
            stride: 100,
        }
    }
}

impl PortScheme {
    /// Reject strides that would let two (node, role) pairs collide.
    pub fn new(base: u16, stride: u16) -> Result<Self, MembershipError> {
        let max_offset = PortRole::ALL.iter().map(|r| r.offset()).max().unwrap_or(0);
        if stride <= max_offset {
            return Err(MembershipError::StrideTooSmall { stride, max_offset });
        }
        Ok(PortScheme { base, stride })
    }

    pub fn port(&self, member_id: u32, role: PortRole) -> Result<u16, MembershipError> {
        member_id
            .checked_mul(u32::from(self.stride))
            .and_then(|block| block.checked_add(u32::from(self.base) + u32::from(role.offset())))
            .and_then(|port| u16::try_from(port).ok())
            .ok_or(MembershipError::PortOverflow { member_id, role })
    }
}

/// One cluster member. Immutable once the cluster is formed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub member_id: u32,
    pub host: String,
    pub client_port: u16,
    pub member_port: u16,
    pub log_port: u16,
    pub transfer_port: u16,
    pub archive_control_port: u16,
}

impl ClusterMember {
    /// Derive all ports from `scheme`. Fails if any role's port leaves the
    /// `u16` range.
    pub fn derive(member_id: u32, host: &str, scheme: &PortScheme) -> Result<Self, MembershipError> {
        let port = |role| scheme.port(member_id, role);
        Ok(ClusterMember {
            member_id,
            host: host.to_string(),
            client_port: port(PortRole::Client)?,
            member_port: port(PortRole::Member)?,
            log_port: port(PortRole::Log)?,
            transfer_port: port(PortRole::Transfer)?,
            archive_control_port: port(PortRole::ArchiveControl)?,
        })
    }

    fn endpoint(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }

    pub fn client_endpoint(&self) -> String {
        self.endpoint(self.client_port)
    }

    pub fn member_endpoint(&self) -> String {
        self.endpoint(self.member_port)
    }

    pub fn log_endpoint(&self) -> String {
        self.endpoint(self.log_port)
    }

    pub fn transfer_endpoint(&self) -> String {
        self.endpoint(self.transfer_port)
    }

    pub fn archive_control_endpoint(&self) -> String {
        self.endpoint(self.archive_control_port)
    }
}

/// Render the membership descriptor.
pub fn format_descriptor(members: &[ClusterMember]) -> String {
    let mut out = String::new();
    for m in members {
        out.push_str(&format!(
            "{},{},{},{},{},{}|",
            m.member_id,
            m.client_endpoint(),
            m.member_endpoint(),
            m.log_endpoint(),
            m.transfer_endpoint(),
            m.archive_control_endpoint()
        ));
    }
    out
}

/// Parse a membership descriptor. Member ids must be 0, 1, 2, ... in order.
pub fn parse_descriptor(descriptor: &str) -> Result<Vec<ClusterMember>, MembershipError> {
    let mut members = Vec::new();
    for (entry, raw) in descriptor.split('|').filter(|s| !s.trim().is_empty()).enumerate() {
        let fields: Vec<&str> = raw.trim().split(',').collect();
        if fields.len() != 6 {
            return Err(MembershipError::FieldCount {
                entry,
                found: fields.len(),
            });
        }
        let member_id: u32 = fields[0].parse().map_err(|_| MembershipError::InvalidMemberId {
            entry,
            value: fields[0].to_string(),
        })?;
        if member_id as usize != entry {
            return Err(MembershipError::OutOfOrder {
                entry,
                expected: entry as u32,
                found: member_id,
            });
        }

        let mut host: Option<String> = None;
        let mut ports = [0u16; 5];
        for (slot, field) in fields[1..].iter().enumerate() {
            let (h, p) = parse_endpoint(field).ok_or_else(|| MembershipError::InvalidEndpoint {
                entry,
                value: field.to_string(),
            })?;
            match &host {
                None => host = Some(h.to_string()),
                Some(existing) if existing != h => {
                    return Err(MembershipError::MixedHosts {
                        entry,
                        host: existing.clone(),
                    })
                }
                Some(_) => {}
            }
            ports[slot] = p;
        }

        members.push(ClusterMember {
            member_id,
            host: host.unwrap_or_default(),
            client_port: ports[0],
            member_port: ports[1],
            log_port: ports[2],
            transfer_port: ports[3],
            archive_control_port: ports[4],
        });
    }
    if members.is_empty() {
        return Err(MembershipError::Empty);
    }
    Ok(members)
}

/// Parse `id=host:port,...` into member id -> endpoint.
pub fn parse_ingress_endpoints(endpoints: &str) -> Result<BTreeMap<u32, String>, MembershipError> {
    let mut map = BTreeMap::new();
    for (entry, raw) in endpoints.split(',').filter(|s| !s.trim().is_empty()).enumerate() {
        let (id, endpoint) = raw.trim().split_once('=').ok_or_else(|| MembershipError::InvalidEndpoint {
            entry,
            value: raw.to_string(),
        })?;
        let member_id: u32 = id.parse().map_err(|_| MembershipError::InvalidMemberId {
            entry,
            value: id.to_string(),
        })?;
        if parse_endpoint(endpoint).is_none() {
            return Err(MembershipError::InvalidEndpoint {
                entry,
                value: endpoint.to_string(),
            });
        }
        map.insert(member_id, endpoint.to_string());
    }
    if map.is_empty() {
        return Err(MembershipError::Empty);
    }
    Ok(map)
}

/// Render the client ingress endpoint list for `members`.
pub fn format_ingress_endpoints(members: &[ClusterMember]) -> String {
    members
        .iter()
        .map(|m| format!("{}={}", m.member_id, m.client_endpoint()))
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_endpoint(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host, port))
}
