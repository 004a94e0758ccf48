/// Server selection pipeline
///
/// Selectors are composable filters over the candidate set: each takes the
/// current cluster view plus a list of candidate server snapshots and returns
/// the subset it will accept. The cluster runs the configured pre-selector,
/// the caller-supplied selector, the configured post-selector, and finally the
/// latency window, in that order.
use std::sync::Arc;
use std::time::Duration;

use crate::topology::{ClusterDescription, EndPoint, ServerDescription, ServerType, TagSet};

/// One composable filter over candidate servers.
pub trait ServerSelector: Send + Sync {
    fn select(
        &self,
        cluster: &ClusterDescription,
        candidates: Vec<Arc<ServerDescription>>,
    ) -> Vec<Arc<ServerDescription>>;
}

/// Closures are selectors; used pervasively in tests.
impl<F> ServerSelector for F
where
    F: Fn(&ClusterDescription, Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>>
        + Send
        + Sync,
{
    fn select(
        &self,
        cluster: &ClusterDescription,
        candidates: Vec<Arc<ServerDescription>>,
    ) -> Vec<Arc<ServerDescription>> {
        self(cluster, candidates)
    }
}

/// Runs a list of selectors in order, each narrowing the previous result.
pub struct CompositeServerSelector {
    selectors: Vec<Arc<dyn ServerSelector>>,
}

impl CompositeServerSelector {
    pub fn new(selectors: Vec<Arc<dyn ServerSelector>>) -> Self {
        Self { selectors }
    }
}

impl ServerSelector for CompositeServerSelector {
    fn select(
        &self,
        cluster: &ClusterDescription,
        candidates: Vec<Arc<ServerDescription>>,
    ) -> Vec<Arc<ServerDescription>> {
        self.selectors
            .iter()
            .fold(candidates, |remaining, selector| {
                selector.select(cluster, remaining)
            })
    }
}

/// Keeps only candidates within a latency window of the fastest one.
///
/// Avoids always hammering the single fastest node when several are close
/// enough. Candidates without a measured round-trip time pass only when no
/// candidate has one.
pub struct LatencyLimitingServerSelector {
    window: Duration,
}

impl LatencyLimitingServerSelector {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl ServerSelector for LatencyLimitingServerSelector {
    fn select(
        &self,
        _cluster: &ClusterDescription,
        candidates: Vec<Arc<ServerDescription>>,
    ) -> Vec<Arc<ServerDescription>> {
        let minimum = candidates
            .iter()
            .filter_map(|c| c.average_round_trip_time)
            .min();

        match minimum {
            Some(minimum) => {
                let limit = minimum + self.window;
                candidates
                    .into_iter()
                    .filter(|c| matches!(c.average_round_trip_time, Some(rtt) if rtt <= limit))
                    .collect()
            }
            None => candidates,
        }
    }
}

/// Keeps only servers that accept writes.
pub struct WritableServerSelector;

impl ServerSelector for WritableServerSelector {
    fn select(
        &self,
        _cluster: &ClusterDescription,
        candidates: Vec<Arc<ServerDescription>>,
    ) -> Vec<Arc<ServerDescription>> {
        candidates
            .into_iter()
            .filter(|c| {
                matches!(
                    c.server_type,
                    ServerType::Standalone
                        | ServerType::ReplicaSetPrimary
                        | ServerType::ShardRouter
                )
            })
            .collect()
    }
}

/// Keeps only the server at a specific endpoint.
pub struct EndPointServerSelector {
    endpoint: EndPoint,
}

impl EndPointServerSelector {
    pub fn new(endpoint: EndPoint) -> Self {
        Self { endpoint }
    }
}

impl ServerSelector for EndPointServerSelector {
    fn select(
        &self,
        _cluster: &ClusterDescription,
        candidates: Vec<Arc<ServerDescription>>,
    ) -> Vec<Arc<ServerDescription>> {
        candidates
            .into_iter()
            .filter(|c| c.endpoint == self.endpoint)
            .collect()
    }
}

/// Where reads are allowed to land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Read routing policy: a mode plus optional tag-set constraints.
///
/// Tag sets are tried in order; the first set matched by any candidate
/// constrains the result. A candidate matches a tag set when it carries every
/// key/value pair in the set.
#[derive(Debug, Clone)]
pub struct ReadPreference {
    pub mode: ReadPreferenceMode,
    pub tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
        }
    }

    pub fn with_tag_sets(mode: ReadPreferenceMode, tag_sets: Vec<TagSet>) -> Self {
        Self { mode, tag_sets }
    }
}

/// Selects servers satisfying a [`ReadPreference`].
pub struct ReadPreferenceServerSelector {
    read_preference: ReadPreference,
}

impl ReadPreferenceServerSelector {
    pub fn new(read_preference: ReadPreference) -> Self {
        Self { read_preference }
    }

    fn matches_tags(candidate: &ServerDescription, tag_set: &TagSet) -> bool {
        tag_set
            .iter()
            .all(|(key, value)| candidate.tags.get(key) == Some(value))
    }

    fn apply_tag_sets(&self, candidates: Vec<Arc<ServerDescription>>) -> Vec<Arc<ServerDescription>> {
        if self.read_preference.tag_sets.is_empty() {
            return candidates;
        }
        for tag_set in &self.read_preference.tag_sets {
            let matched: Vec<_> = candidates
                .iter()
                .filter(|c| Self::matches_tags(c, tag_set))
                .cloned()
                .collect();
            if !matched.is_empty() {
                return matched;
            }
        }
        Vec::new()
    }

    fn primaries(candidates: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        candidates
            .iter()
            .filter(|c| c.server_type == ServerType::ReplicaSetPrimary)
            .cloned()
            .collect()
    }

    fn secondaries(&self, candidates: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
        let secondaries: Vec<_> = candidates
            .iter()
            .filter(|c| c.server_type == ServerType::ReplicaSetSecondary)
            .cloned()
            .collect();
        self.apply_tag_sets(secondaries)
    }
}

impl ServerSelector for ReadPreferenceServerSelector {
    fn select(
        &self,
        _cluster: &ClusterDescription,
        candidates: Vec<Arc<ServerDescription>>,
    ) -> Vec<Arc<ServerDescription>> {
        // Non-replica-set topologies route reads anywhere data-bearing.
        if candidates
            .iter()
            .all(|c| !c.server_type.is_replica_set_member())
        {
            return candidates
                .into_iter()
                .filter(|c| c.server_type.is_data_bearing())
                .collect();
        }

        match self.read_preference.mode {
            ReadPreferenceMode::Primary => Self::primaries(&candidates),
            ReadPreferenceMode::PrimaryPreferred => {
                let primaries = Self::primaries(&candidates);
                if primaries.is_empty() {
                    self.secondaries(&candidates)
                } else {
                    primaries
                }
            }
            ReadPreferenceMode::Secondary => self.secondaries(&candidates),
            ReadPreferenceMode::SecondaryPreferred => {
                let secondaries = self.secondaries(&candidates);
                if secondaries.is_empty() {
                    Self::primaries(&candidates)
                } else {
                    secondaries
                }
            }
            ReadPreferenceMode::Nearest => {
                let eligible: Vec<_> = candidates
                    .into_iter()
                    .filter(|c| {
                        matches!(
                            c.server_type,
                            ServerType::ReplicaSetPrimary | ServerType::ReplicaSetSecondary
                        )
                    })
                    .collect();
                self.apply_tag_sets(eligible)
            }
        }
    }
}
