/// Atalaya - Topology discovery and monitoring core for database cluster clients
///
/// Atalaya keeps a live, immutable view of a database deployment: one
/// background monitor per server feeds heartbeat results into a cluster
/// aggregate, which reconciles replica-set membership and answers
/// "select me a server" requests against the latest snapshot.
///
/// Atalaya supports two cluster shapes:
/// 1. Single-node: one fixed endpoint in Direct/Standalone mode, no discovery
/// 2. Multi-node: seed endpoints in Automatic/ReplicaSet/Sharded mode with
///    full membership discovery driven by member heartbeat reports
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod selection;
pub mod server;
pub mod topology;

pub use cluster::{Cluster, ClusterBuilder, MembershipPolicy, PolicyOutcome, ReporterDisposition};
pub use config::{ClusterSettings, ConfigError};
pub use error::{AtalayaError, Result};
pub use events::{Event, EventSubscriber, NoopSubscriber};
pub use monitor::{
    HelloReply, MonitorConnection, MonitorConnectionFactory, MonitorSettings,
    ServerDescriptionChanged, ServerMonitor,
};
pub use selection::{
    CompositeServerSelector, EndPointServerSelector, LatencyLimitingServerSelector,
    ReadPreference, ReadPreferenceMode, ReadPreferenceServerSelector, ServerSelector,
    WritableServerSelector,
};
pub use server::{ClusterableServer, ConnectionPool, ConnectionPoolFactory, ServerChannel};
pub use topology::{
    ClusterDescription, ClusterId, ClusterIdGenerator, ClusterState, ClusterType, ConnectionMode,
    ElectionId, EndPoint, ReplicaSetConfig, ServerDescription, ServerId, ServerState, ServerType,
    TagSet, WireVersionRange, SUPPORTED_WIRE_VERSION_RANGE,
};
