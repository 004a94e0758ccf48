/// Immutable snapshot of the whole cluster
use std::fmt;
use std::sync::Arc;

use crate::topology::{ClusterId, ConnectionMode, EndPoint, ServerDescription, ServerState};

/// Aggregate shape inferred from member reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterType {
    Unknown,
    Standalone,
    ReplicaSet,
    Sharded,
}

/// Aggregate connectivity; Connected iff at least one member is Connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    Disconnected,
    Connected,
}

/// One atomically-replaced view of every tracked server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescription {
    pub cluster_id: ClusterId,
    pub connection_mode: ConnectionMode,
    pub cluster_type: ClusterType,
    /// One entry per tracked endpoint, kept sorted by endpoint.
    pub servers: Vec<Arc<ServerDescription>>,
}

impl ClusterDescription {
    /// The initial empty view for a freshly constructed cluster.
    pub fn new(cluster_id: ClusterId, connection_mode: ConnectionMode) -> Self {
        Self {
            cluster_id,
            connection_mode,
            cluster_type: ClusterType::Unknown,
            servers: Vec::new(),
        }
    }

    /// Derived connectivity state.
    pub fn state(&self) -> ClusterState {
        if self
            .servers
            .iter()
            .any(|s| s.state == ServerState::Connected)
        {
            ClusterState::Connected
        } else {
            ClusterState::Disconnected
        }
    }

    pub fn server(&self, endpoint: &EndPoint) -> Option<&Arc<ServerDescription>> {
        self.servers.iter().find(|s| &s.endpoint == endpoint)
    }

    /// Replace or append one member and recompute the aggregate type.
    ///
    /// The type is inferred from the first member that reports a concrete
    /// type while the aggregate is still Unknown.
    pub fn with_server_description(&self, description: Arc<ServerDescription>) -> Self {
        let mut servers = self.servers.clone();
        match servers
            .iter()
            .position(|s| s.endpoint == description.endpoint)
        {
            Some(index) => servers[index] = description.clone(),
            None => {
                servers.push(description.clone());
                servers.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
            }
        }

        let mut cluster_type = self.cluster_type;
        if cluster_type == ClusterType::Unknown {
            let inferred = description.server_type.to_cluster_type();
            if inferred != ClusterType::Unknown {
                cluster_type = inferred;
            }
        }

        Self {
            cluster_id: self.cluster_id,
            connection_mode: self.connection_mode,
            cluster_type,
            servers,
        }
    }

    /// Drop one member from the view, if present.
    pub fn without_server(&self, endpoint: &EndPoint) -> Self {
        let servers = self
            .servers
            .iter()
            .filter(|s| &s.endpoint != endpoint)
            .cloned()
            .collect();
        Self {
            cluster_id: self.cluster_id,
            connection_mode: self.connection_mode,
            cluster_type: self.cluster_type,
            servers,
        }
    }

    pub fn with_type(&self, cluster_type: ClusterType) -> Self {
        Self {
            cluster_type,
            ..self.clone()
        }
    }

    /// Members currently usable for selection.
    pub fn connected_servers(&self) -> Vec<Arc<ServerDescription>> {
        self.servers
            .iter()
            .filter(|s| s.state == ServerState::Connected)
            .cloned()
            .collect()
    }
}

impl fmt::Display for ClusterDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ id: {}, type: {:?}, state: {:?}, servers: [",
            self.cluster_id,
            self.cluster_type,
            self.state()
        )?;
        for (i, server) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", server)?;
        }
        write!(f, "] }}")
    }
}
