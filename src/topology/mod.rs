/// Topology value types
///
/// Immutable identifiers and snapshots describing one monitored server and the
/// aggregate cluster view. Everything here is a plain value: monitors and the
/// cluster create new snapshots on every heartbeat result or membership change
/// and never mutate them afterwards.
pub mod cluster;
pub mod server;

pub use cluster::{ClusterDescription, ClusterState, ClusterType};
pub use server::{DescriptionChanges, ServerDescription};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AtalayaError;

/// Wire versions this driver core can speak, inclusive on both ends.
pub const SUPPORTED_WIRE_VERSION_RANGE: WireVersionRange = WireVersionRange { min: 6, max: 21 };

/// Default port used when an endpoint string carries no explicit port.
pub const DEFAULT_PORT: u16 = 27017;

/// Process-unique cluster identifier, assigned once per cluster at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster-{}", self.0)
    }
}

/// Monotonic source of [`ClusterId`]s.
///
/// Injected rather than accessed as ambient global state so tests can construct
/// independent counters.
#[derive(Debug, Default)]
pub struct ClusterIdGenerator {
    next: AtomicU64,
}

impl ClusterIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ClusterId {
        ClusterId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Host and port of one addressable server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndPoint {
    pub host: String,
    pub port: u16,
}

impl EndPoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for EndPoint {
    type Err = AtalayaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AtalayaError::invalid_argument("endpoint cannot be empty"));
        }
        let parse_port = |raw: &str| {
            raw.parse::<u16>().map_err(|_| {
                AtalayaError::invalid_argument(format!("invalid endpoint '{}': bad port '{}'", s, raw))
            })
        };
        // IPv6 hosts must be bracketed so the port separator stays unambiguous.
        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                AtalayaError::invalid_argument(format!("invalid endpoint '{}': unclosed '['", s))
            })?;
            if host.is_empty() {
                return Err(AtalayaError::invalid_argument(format!(
                    "invalid endpoint '{}': missing host",
                    s
                )));
            }
            return match after {
                "" => Ok(EndPoint::new(host, DEFAULT_PORT)),
                _ => match after.strip_prefix(':') {
                    Some(port) => Ok(EndPoint::new(host, parse_port(port)?)),
                    None => Err(AtalayaError::invalid_argument(format!(
                        "invalid endpoint '{}': expected ':' after ']'",
                        s
                    ))),
                },
            };
        }
        match s.split_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(AtalayaError::invalid_argument(format!(
                        "invalid endpoint '{}': missing host",
                        s
                    )));
                }
                if port.contains(':') {
                    return Err(AtalayaError::invalid_argument(format!(
                        "invalid endpoint '{}': bracket IPv6 hosts as '[{}]'",
                        s, s
                    )));
                }
                Ok(EndPoint::new(host, parse_port(port)?))
            }
            None => Ok(EndPoint::new(s, DEFAULT_PORT)),
        }
    }
}

/// Identifies one monitored server within one cluster.
///
/// Two ids are equal iff both the cluster id and the endpoint are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub cluster_id: ClusterId,
    pub endpoint: EndPoint,
}

impl ServerId {
    pub fn new(cluster_id: ClusterId, endpoint: EndPoint) -> Self {
        Self {
            cluster_id,
            endpoint,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_id, self.endpoint)
    }
}

/// Connectivity state of one server as seen by its monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Disconnected,
    Connected,
}

/// Role a server reported in its last successful heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerType {
    Unknown,
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ReplicaSetArbiter,
    ReplicaSetOther,
    ReplicaSetGhost,
    ShardRouter,
}

impl ServerType {
    /// Whether this type is any replica-set member role (ghosts included).
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            ServerType::ReplicaSetPrimary
                | ServerType::ReplicaSetSecondary
                | ServerType::ReplicaSetArbiter
                | ServerType::ReplicaSetOther
                | ServerType::ReplicaSetGhost
        )
    }

    /// Whether this type can serve reads or writes.
    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::ReplicaSetPrimary
                | ServerType::ReplicaSetSecondary
                | ServerType::ShardRouter
        )
    }

    /// The cluster type implied by a member of this type.
    pub fn to_cluster_type(&self) -> ClusterType {
        match self {
            ServerType::Unknown => ClusterType::Unknown,
            ServerType::Standalone => ClusterType::Standalone,
            ServerType::ShardRouter => ClusterType::Sharded,
            _ => ClusterType::ReplicaSet,
        }
    }
}

/// How the cluster was asked to connect to its seed list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    Automatic,
    Direct,
    ReplicaSet,
    Sharded,
    Standalone,
}

/// Opaque, totally ordered election token.
///
/// Used only to decide which of two conflicting primary reports is newer:
/// higher supersedes lower, equal tokens do not supersede.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElectionId([u8; 12]);

impl ElectionId {
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Ordered key/value tags a server advertises for selection.
pub type TagSet = BTreeMap<String, String>;

/// Inclusive range of wire protocol versions a server supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireVersionRange {
    pub min: i32,
    pub max: i32,
}

impl WireVersionRange {
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// Whether the two ranges share at least one version.
    pub fn overlaps(&self, other: &WireVersionRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

impl fmt::Display for WireVersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Replica-set membership as reported by one member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaSetConfig {
    /// Member endpoints, kept sorted for deterministic comparison.
    pub members: Vec<EndPoint>,
    pub name: Option<String>,
    pub primary: Option<EndPoint>,
    pub version: Option<u32>,
}

impl ReplicaSetConfig {
    pub fn new(
        mut members: Vec<EndPoint>,
        name: Option<String>,
        primary: Option<EndPoint>,
        version: Option<u32>,
    ) -> Self {
        members.sort();
        members.dedup();
        Self {
            members,
            name,
            primary,
            version,
        }
    }

    pub fn contains(&self, endpoint: &EndPoint) -> bool {
        self.members.binary_search(endpoint).is_ok()
    }
}
