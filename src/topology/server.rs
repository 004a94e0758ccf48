/// Immutable snapshot of one monitored server
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::topology::{
    ElectionId, EndPoint, ReplicaSetConfig, ServerId, ServerState, ServerType, TagSet,
    WireVersionRange,
};

/// Everything the monitor knows about one server at a point in time.
///
/// Snapshots are shared as `Arc<ServerDescription>` and never mutated; a new
/// snapshot is derived with [`ServerDescription::updated`] on every heartbeat
/// result. Equality and hashing cover every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerDescription {
    pub server_id: ServerId,
    pub endpoint: EndPoint,
    pub state: ServerState,
    pub server_type: ServerType,
    pub average_round_trip_time: Option<Duration>,
    /// The server's self-reported identity (`me`), which may differ from the
    /// address it was seeded under.
    pub canonical_endpoint: Option<EndPoint>,
    pub election_id: Option<ElectionId>,
    /// Present only for replica-set member types.
    pub replica_set_config: Option<ReplicaSetConfig>,
    pub tags: TagSet,
    pub version: Option<String>,
    pub wire_version_range: Option<WireVersionRange>,
    /// The failure that produced this snapshot, if the last heartbeat failed.
    pub heartbeat_error: Option<String>,
}

/// Field updates for deriving a new [`ServerDescription`].
///
/// `None` leaves the field untouched; nullable fields use a nested `Option`
/// so they can be explicitly cleared.
#[derive(Debug, Clone, Default)]
pub struct DescriptionChanges {
    pub state: Option<ServerState>,
    pub server_type: Option<ServerType>,
    pub average_round_trip_time: Option<Option<Duration>>,
    pub canonical_endpoint: Option<Option<EndPoint>>,
    pub election_id: Option<Option<ElectionId>>,
    pub replica_set_config: Option<Option<ReplicaSetConfig>>,
    pub tags: Option<TagSet>,
    pub version: Option<Option<String>>,
    pub wire_version_range: Option<Option<WireVersionRange>>,
    pub heartbeat_error: Option<Option<String>>,
}

impl ServerDescription {
    /// The default Disconnected/Unknown snapshot for a server nothing is known
    /// about yet.
    pub fn new(server_id: ServerId, endpoint: EndPoint) -> Self {
        Self {
            server_id,
            endpoint,
            state: ServerState::Disconnected,
            server_type: ServerType::Unknown,
            average_round_trip_time: None,
            canonical_endpoint: None,
            election_id: None,
            replica_set_config: None,
            tags: TagSet::new(),
            version: None,
            wire_version_range: None,
            heartbeat_error: None,
        }
    }

    /// Derive a new snapshot differing only in the supplied fields.
    ///
    /// When every supplied value equals the current one, the same `Arc` is
    /// returned; change detection relies on `Arc::ptr_eq` against the previous
    /// snapshot.
    pub fn updated(self: &Arc<Self>, changes: DescriptionChanges) -> Arc<Self> {
        let mut next = (**self).clone();
        if let Some(state) = changes.state {
            next.state = state;
        }
        if let Some(server_type) = changes.server_type {
            next.server_type = server_type;
        }
        if let Some(rtt) = changes.average_round_trip_time {
            next.average_round_trip_time = rtt;
        }
        if let Some(canonical) = changes.canonical_endpoint {
            next.canonical_endpoint = canonical;
        }
        if let Some(election_id) = changes.election_id {
            next.election_id = election_id;
        }
        if let Some(config) = changes.replica_set_config {
            next.replica_set_config = config;
        }
        if let Some(tags) = changes.tags {
            next.tags = tags;
        }
        if let Some(version) = changes.version {
            next.version = version;
        }
        if let Some(range) = changes.wire_version_range {
            next.wire_version_range = range;
        }
        if let Some(error) = changes.heartbeat_error {
            next.heartbeat_error = error;
        }

        if next == **self {
            Arc::clone(self)
        } else {
            Arc::new(next)
        }
    }

    /// Whether this server's wire versions overlap the supported range.
    pub fn is_compatible_with(&self, supported: &WireVersionRange) -> bool {
        match &self.wire_version_range {
            Some(range) => range.overlaps(supported),
            // Nothing reported yet; not grounds for failing selection.
            None => true,
        }
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ endpoint: {}, state: {:?}, type: {:?} }}",
            self.endpoint, self.state, self.server_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ClusterId;

    fn base() -> Arc<ServerDescription> {
        let endpoint = EndPoint::new("localhost", 27017);
        Arc::new(ServerDescription::new(
            ServerId::new(ClusterId(1), endpoint.clone()),
            endpoint,
        ))
    }

    #[test]
    fn test_new_is_disconnected_unknown() {
        let description = base();
        assert_eq!(description.state, ServerState::Disconnected);
        assert_eq!(description.server_type, ServerType::Unknown);
        assert!(description.heartbeat_error.is_none());
        assert!(description.replica_set_config.is_none());
    }

    #[test]
    fn test_updated_with_identical_values_returns_same_instance() {
        let description = base();
        let same = description.updated(DescriptionChanges {
            state: Some(ServerState::Disconnected),
            server_type: Some(ServerType::Unknown),
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&description, &same));
    }

    #[test]
    fn test_updated_with_one_changed_field() {
        let description = base();
        let updated = description.updated(DescriptionChanges {
            state: Some(ServerState::Connected),
            ..Default::default()
        });
        assert!(!Arc::ptr_eq(&description, &updated));
        assert_eq!(updated.state, ServerState::Connected);
        // Every other field is untouched.
        assert_eq!(updated.server_type, description.server_type);
        assert_eq!(updated.endpoint, description.endpoint);
        assert_eq!(updated.tags, description.tags);
    }

    #[test]
    fn test_updated_can_clear_nullable_fields() {
        let description = base().updated(DescriptionChanges {
            heartbeat_error: Some(Some("connection refused".to_string())),
            ..Default::default()
        });
        assert!(description.heartbeat_error.is_some());

        let cleared = description.updated(DescriptionChanges {
            heartbeat_error: Some(None),
            ..Default::default()
        });
        assert!(cleared.heartbeat_error.is_none());
    }

    #[test]
    fn test_compatibility_check() {
        let supported = WireVersionRange::new(6, 21);
        let description = base();
        // No reported range yet: compatible.
        assert!(description.is_compatible_with(&supported));

        let ancient = description.updated(DescriptionChanges {
            wire_version_range: Some(Some(WireVersionRange::new(0, 3))),
            ..Default::default()
        });
        assert!(!ancient.is_compatible_with(&supported));
    }
}
