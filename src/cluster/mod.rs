/// Cluster aggregate
///
/// The `Cluster` owns one `ClusterableServer` per tracked endpoint, folds their
/// description changes into a single atomically-replaced `ClusterDescription`,
/// and answers server-selection requests against that view. Membership
/// decisions are delegated to a `MembershipPolicy`; everything else (lifecycle,
/// the change worker, selection, events) is shared between the single-node and
/// multi-node shapes.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClusterSettings;
use crate::error::{AtalayaError, Result};
use crate::events::{Event, EventSubscriber, NoopSubscriber};
use crate::monitor::{
    ChangeCallback, MonitorConnectionFactory, MonitorSettings, ServerDescriptionChanged,
};
use crate::selection::{LatencyLimitingServerSelector, ServerSelector};
use crate::server::{ClusterableServer, ConnectionPoolFactory};
use crate::topology::{
    ClusterDescription, ClusterId, ClusterIdGenerator, ClusterType, ConnectionMode, ElectionId,
    EndPoint, ServerDescription, ServerId, ServerType, SUPPORTED_WIRE_VERSION_RANGE,
};

/// How the reporter's own entry in the visible view is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReporterDisposition {
    /// Record the new description in the visible view.
    #[default]
    Record,
    /// Leave the view unchanged (stale or untrustworthy report).
    Ignore,
    /// Drop the reporter from the view while keeping it tracked.
    Hide,
}

/// What a membership policy decided about one incoming change.
#[derive(Debug, Default)]
pub struct PolicyOutcome {
    pub disposition: ReporterDisposition,
    /// Endpoints to start tracking.
    pub add: Vec<EndPoint>,
    /// Endpoints to stop tracking, with the reason used in events.
    pub remove: Vec<(EndPoint, String)>,
    /// Tracked servers to force back to Unknown/Disconnected; their monitors
    /// keep running so they can re-certify on their own.
    pub invalidate: Vec<EndPoint>,
}

impl PolicyOutcome {
    fn record() -> Self {
        Self::default()
    }

    fn ignore() -> Self {
        Self {
            disposition: ReporterDisposition::Ignore,
            ..Default::default()
        }
    }

    fn hide() -> Self {
        Self {
            disposition: ReporterDisposition::Hide,
            ..Default::default()
        }
    }
}

/// Membership-discovery step applied to every incoming description change.
///
/// Implementations may keep state across calls (the multi-node policy tracks
/// the maximum election token seen); the cluster worker is the only caller.
pub trait MembershipPolicy: Send {
    fn apply(
        &mut self,
        current: &ClusterDescription,
        tracked: &[EndPoint],
        change: &ServerDescriptionChanged,
    ) -> PolicyOutcome;
}

/// Policy for Direct/Standalone clusters: one fixed endpoint, no discovery.
///
/// A report whose type is incompatible with the configured mode hides the
/// member from the visible view; the monitor keeps running so the server
/// rejoins automatically if it reboots into the expected role.
struct SingleNodePolicy {
    mode: ConnectionMode,
}

impl MembershipPolicy for SingleNodePolicy {
    fn apply(
        &mut self,
        _current: &ClusterDescription,
        _tracked: &[EndPoint],
        change: &ServerDescriptionChanged,
    ) -> PolicyOutcome {
        let visible = match self.mode {
            ConnectionMode::Standalone => matches!(
                change.new.server_type,
                ServerType::Unknown | ServerType::Standalone
            ),
            _ => true,
        };
        if visible {
            PolicyOutcome::record()
        } else {
            debug!(
                endpoint = %change.new.endpoint,
                server_type = ?change.new.server_type,
                "hiding member incompatible with single-node mode"
            );
            PolicyOutcome::hide()
        }
    }
}

/// Discovery policy for Automatic/ReplicaSet/Sharded clusters.
struct MultiNodePolicy {
    mode: ConnectionMode,
    replica_set_name: Option<String>,
    max_election_id: Option<ElectionId>,
}

impl MultiNodePolicy {
    fn new(mode: ConnectionMode, replica_set_name: Option<String>) -> Self {
        Self {
            mode,
            replica_set_name,
            max_election_id: None,
        }
    }

    fn type_is_valid(&self, cluster_type: ClusterType, server_type: ServerType) -> bool {
        match (self.mode, cluster_type) {
            (ConnectionMode::ReplicaSet, _) => server_type.is_replica_set_member(),
            (ConnectionMode::Sharded, _) => server_type == ServerType::ShardRouter,
            (_, ClusterType::ReplicaSet) => server_type.is_replica_set_member(),
            (_, ClusterType::Sharded) => server_type == ServerType::ShardRouter,
            _ => true,
        }
    }

    fn apply_primary(
        &mut self,
        current: &ClusterDescription,
        tracked: &[EndPoint],
        new: &Arc<ServerDescription>,
    ) -> PolicyOutcome {
        if let Some(election_id) = &new.election_id {
            if let Some(max) = &self.max_election_id {
                if election_id < max {
                    // A stale primary from a previous election: ignore its
                    // report and force it to re-certify.
                    info!(
                        endpoint = %new.endpoint,
                        "ignoring primary report with superseded election token"
                    );
                    let mut outcome = PolicyOutcome::ignore();
                    outcome.invalidate.push(new.endpoint.clone());
                    return outcome;
                }
            }
            self.max_election_id = Some(*election_id);
        }

        let mut outcome = PolicyOutcome::record();

        // Any other recorded primary lost the election.
        for server in &current.servers {
            if server.server_type == ServerType::ReplicaSetPrimary
                && server.endpoint != new.endpoint
            {
                outcome.invalidate.push(server.endpoint.clone());
            }
        }

        // The primary's host list is authoritative in both directions.
        if let Some(config) = &new.replica_set_config {
            for member in &config.members {
                if !tracked.contains(member) {
                    outcome.add.push(member.clone());
                }
            }
            for endpoint in tracked {
                if !config.contains(endpoint) {
                    outcome.remove.push((
                        endpoint.clone(),
                        "not in the primary's host list".to_string(),
                    ));
                }
            }
        }
        outcome
    }

    fn apply_non_primary(
        &self,
        current: &ClusterDescription,
        tracked: &[EndPoint],
        new: &Arc<ServerDescription>,
    ) -> PolicyOutcome {
        let mut outcome = PolicyOutcome::record();
        let primary_known = current
            .servers
            .iter()
            .any(|s| s.server_type == ServerType::ReplicaSetPrimary);
        // A non-primary's view of membership can add hosts but is never
        // authoritative for removal, and is ignored outright while a primary
        // is known.
        if !primary_known {
            if let Some(config) = &new.replica_set_config {
                for member in &config.members {
                    if !tracked.contains(member) {
                        outcome.add.push(member.clone());
                    }
                }
            }
        }
        outcome
    }
}

impl MembershipPolicy for MultiNodePolicy {
    fn apply(
        &mut self,
        current: &ClusterDescription,
        tracked: &[EndPoint],
        change: &ServerDescriptionChanged,
    ) -> PolicyOutcome {
        let new = &change.new;

        if new.server_type == ServerType::Unknown {
            return PolicyOutcome::record();
        }

        // A ghost is a member still finding its feet; record it but trust
        // nothing it says about membership.
        if new.server_type == ServerType::ReplicaSetGhost {
            return PolicyOutcome::record();
        }

        if !self.type_is_valid(current.cluster_type, new.server_type) {
            let mut outcome = PolicyOutcome::ignore();
            outcome.remove.push((
                new.endpoint.clone(),
                format!(
                    "server type {:?} is not valid for this cluster",
                    new.server_type
                ),
            ));
            return outcome;
        }

        if new.server_type.is_replica_set_member() {
            let reported = new
                .replica_set_config
                .as_ref()
                .and_then(|c| c.name.as_deref());
            if let Some(expected) = &self.replica_set_name {
                if reported != Some(expected.as_str()) {
                    let mut outcome = PolicyOutcome::ignore();
                    outcome.remove.push((
                        new.endpoint.clone(),
                        format!(
                            "reported replica set name {:?} does not match {:?}",
                            reported, expected
                        ),
                    ));
                    return outcome;
                }
            } else if let Some(name) = reported {
                // Nothing configured: the first member to report a set name
                // fixes it for the cluster.
                info!(set_name = name, "adopting replica set name");
                self.replica_set_name = Some(name.to_string());
            }

            // A member answering under a different identity than it was added
            // by is removed; it gets re-added under its canonical address when
            // a host list names it.
            if let Some(me) = &new.canonical_endpoint {
                if me != &new.endpoint {
                    let mut outcome = PolicyOutcome::ignore();
                    outcome.remove.push((
                        new.endpoint.clone(),
                        format!("reports itself as {}", me),
                    ));
                    return outcome;
                }
            }

            if new.server_type == ServerType::ReplicaSetPrimary {
                return self.apply_primary(current, tracked, new);
            }
            return self.apply_non_primary(current, tracked, new);
        }

        PolicyOutcome::record()
    }
}

const STATE_CREATED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_DISPOSED: u8 = 2;

fn default_id_generator() -> &'static ClusterIdGenerator {
    static GENERATOR: OnceLock<ClusterIdGenerator> = OnceLock::new();
    GENERATOR.get_or_init(ClusterIdGenerator::new)
}

/// Builds a [`Cluster`] from settings and collaborator factories.
pub struct ClusterBuilder {
    settings: ClusterSettings,
    connection_factory: Option<Arc<dyn MonitorConnectionFactory>>,
    pool_factory: Option<Arc<dyn ConnectionPoolFactory>>,
    events: Arc<dyn EventSubscriber>,
    pre_selector: Option<Arc<dyn ServerSelector>>,
    post_selector: Option<Arc<dyn ServerSelector>>,
    id_generator: Option<Arc<ClusterIdGenerator>>,
}

impl ClusterBuilder {
    pub fn new(settings: ClusterSettings) -> Self {
        Self {
            settings,
            connection_factory: None,
            pool_factory: None,
            events: Arc::new(NoopSubscriber),
            pre_selector: None,
            post_selector: None,
            id_generator: None,
        }
    }

    pub fn connection_factory(mut self, factory: Arc<dyn MonitorConnectionFactory>) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    pub fn pool_factory(mut self, factory: Arc<dyn ConnectionPoolFactory>) -> Self {
        self.pool_factory = Some(factory);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSubscriber>) -> Self {
        self.events = events;
        self
    }

    pub fn pre_selector(mut self, selector: Arc<dyn ServerSelector>) -> Self {
        self.pre_selector = Some(selector);
        self
    }

    pub fn post_selector(mut self, selector: Arc<dyn ServerSelector>) -> Self {
        self.post_selector = Some(selector);
        self
    }

    pub fn id_generator(mut self, generator: Arc<ClusterIdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    pub fn build(self) -> Result<Cluster> {
        let mode = self.settings.connection_mode;
        let policy: Box<dyn MembershipPolicy> = match mode {
            ConnectionMode::Direct | ConnectionMode::Standalone => {
                if self.settings.endpoints.len() != 1 {
                    return Err(AtalayaError::invalid_argument(format!(
                        "{:?} mode requires exactly one endpoint, got {}",
                        mode,
                        self.settings.endpoints.len()
                    )));
                }
                Box::new(SingleNodePolicy { mode })
            }
            _ => Box::new(MultiNodePolicy::new(
                mode,
                self.settings.replica_set_name.clone(),
            )),
        };
        self.settings.validate()?;

        let connection_factory = self.connection_factory.ok_or_else(|| {
            AtalayaError::invalid_argument("a monitor connection factory is required")
        })?;
        let pool_factory = self
            .pool_factory
            .ok_or_else(|| AtalayaError::invalid_argument("a connection pool factory is required"))?;

        let cluster_id = match &self.id_generator {
            Some(generator) => generator.next_id(),
            None => default_id_generator().next_id(),
        };

        let (description, _) = watch::channel(ClusterDescription::new(cluster_id, mode));
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();

        Ok(Cluster {
            inner: Arc::new(ClusterInner {
                cluster_id,
                settings: self.settings,
                connection_factory,
                pool_factory,
                events: self.events,
                pre_selector: self.pre_selector,
                post_selector: self.post_selector,
                description,
                servers: Mutex::new(HashMap::new()),
                changes_tx,
                worker_input: Mutex::new(Some((policy, changes_rx))),
                state: AtomicU8::new(STATE_CREATED),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

/// Topology aggregate: tracked servers, their combined description, and
/// server selection against it.
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    cluster_id: ClusterId,
    settings: ClusterSettings,
    connection_factory: Arc<dyn MonitorConnectionFactory>,
    pool_factory: Arc<dyn ConnectionPoolFactory>,
    events: Arc<dyn EventSubscriber>,
    pre_selector: Option<Arc<dyn ServerSelector>>,
    post_selector: Option<Arc<dyn ServerSelector>>,
    description: watch::Sender<ClusterDescription>,
    servers: Mutex<HashMap<EndPoint, Arc<ClusterableServer>>>,
    changes_tx: mpsc::UnboundedSender<ServerDescriptionChanged>,
    worker_input: Mutex<
        Option<(
            Box<dyn MembershipPolicy>,
            mpsc::UnboundedReceiver<ServerDescriptionChanged>,
        )>,
    >,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Cluster {
    pub fn builder(settings: ClusterSettings) -> ClusterBuilder {
        ClusterBuilder::new(settings)
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.inner.cluster_id
    }

    /// Current aggregate view.
    pub fn description(&self) -> ClusterDescription {
        self.inner.description.borrow().clone()
    }

    /// Awaitable view of the aggregate description.
    pub fn subscribe(&self) -> watch::Receiver<ClusterDescription> {
        self.inner.description.subscribe()
    }

    /// Endpoints currently tracked, visible or not, in sorted order.
    pub fn tracked_endpoints(&self) -> Vec<EndPoint> {
        let mut endpoints: Vec<EndPoint> = self
            .inner
            .servers
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        endpoints.sort();
        endpoints
    }

    /// Start monitoring the seed endpoints and spawn the change worker.
    /// Idempotent once open; fails after `dispose`.
    pub fn initialize(&self) -> Result<()> {
        match self.inner.state.compare_exchange(
            STATE_CREATED,
            STATE_OPEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_OPEN) => return Ok(()),
            Err(_) => return Err(AtalayaError::disposed("cluster")),
        }

        info!(cluster = %self.inner.cluster_id, "opening cluster");
        self.inner.events.notify(Event::ClusterOpening {
            cluster_id: self.inner.cluster_id,
        });

        let mut view = self.inner.description.borrow().clone();
        for endpoint in self.inner.settings.parsed_endpoints() {
            self.inner.add_server(&mut view, endpoint);
        }
        self.inner.publish(view);

        let worker_input = self.inner.worker_input.lock().unwrap().take();
        if let Some((policy, changes_rx)) = worker_input {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_worker(policy, changes_rx).await });
        }

        self.inner.events.notify(Event::ClusterOpened {
            cluster_id: self.inner.cluster_id,
        });
        Ok(())
    }

    /// Ask every tracked server for an out-of-cadence heartbeat.
    pub fn request_heartbeat(&self) {
        let servers: Vec<Arc<ClusterableServer>> = self
            .inner
            .servers
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for server in servers {
            server.request_heartbeat();
        }
    }

    /// Select one live server satisfying `selector`.
    ///
    /// Runs the pipeline (pre-selector, caller selector, post-selector,
    /// latency window) over the Connected members of the current view,
    /// re-evaluating from scratch on every description change until a winner
    /// resolves, the selection deadline passes, or `cancellation` fires.
    pub async fn select_server(
        &self,
        selector: &dyn ServerSelector,
        cancellation: &CancellationToken,
    ) -> Result<Arc<ClusterableServer>> {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_OPEN => {}
            STATE_CREATED => {
                return Err(AtalayaError::invalid_state(
                    "cluster must be initialized before selecting a server",
                ))
            }
            _ => return Err(AtalayaError::disposed("cluster")),
        }

        self.inner.events.notify(Event::SelectingServer {
            cluster_id: self.inner.cluster_id,
        });

        match self.select_server_loop(selector, cancellation).await {
            Ok(server) => {
                debug!(cluster = %self.inner.cluster_id, server = %server.server_id(), "selected server");
                self.inner.events.notify(Event::SelectedServer {
                    cluster_id: self.inner.cluster_id,
                    server_id: server.server_id().clone(),
                });
                Ok(server)
            }
            Err(error) => {
                warn!(cluster = %self.inner.cluster_id, %error, "server selection failed");
                self.inner.events.notify(Event::SelectingServerFailed {
                    cluster_id: self.inner.cluster_id,
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn select_server_loop(
        &self,
        selector: &dyn ServerSelector,
        cancellation: &CancellationToken,
    ) -> Result<Arc<ClusterableServer>> {
        let started = Instant::now();
        let timeout = self.inner.settings.server_selection_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let latency_window =
            LatencyLimitingServerSelector::new(self.inner.settings.latency_window());
        let mut updates = self.inner.description.subscribe();

        loop {
            let current = updates.borrow_and_update().clone();

            if self.inner.state.load(Ordering::SeqCst) == STATE_DISPOSED {
                return Err(AtalayaError::disposed("cluster"));
            }

            // An out-of-range server fails the whole call; waiting will not
            // fix a deployment that needs upgrading.
            for server in &current.servers {
                if !server.is_compatible_with(&SUPPORTED_WIRE_VERSION_RANGE) {
                    let range = server
                        .wire_version_range
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(AtalayaError::Incompatible {
                        endpoint: server.endpoint.to_string(),
                        server_range: range,
                        supported_range: SUPPORTED_WIRE_VERSION_RANGE.to_string(),
                    });
                }
            }

            let mut candidates = current.connected_servers();
            if let Some(pre) = &self.inner.pre_selector {
                candidates = pre.select(&current, candidates);
            }
            candidates = selector.select(&current, candidates);
            if let Some(post) = &self.inner.post_selector {
                candidates = post.select(&current, candidates);
            }
            candidates = latency_window.select(&current, candidates);

            // Winners may have been removed concurrently; take the first that
            // still resolves to a live server.
            for candidate in &candidates {
                let resolved = self
                    .inner
                    .servers
                    .lock()
                    .unwrap()
                    .get(&candidate.endpoint)
                    .cloned();
                if let Some(server) = resolved {
                    return Ok(server);
                }
            }

            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        return Err(AtalayaError::disposed("cluster"));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(AtalayaError::SelectionTimeout {
                        elapsed: started.elapsed(),
                        cluster_view: current.to_string(),
                    });
                }
                _ = cancellation.cancelled() => {
                    return Err(AtalayaError::Cancelled);
                }
            }
        }
    }

    /// Stop tracking everything and fail in-flight selections. Idempotent.
    pub fn dispose(&self) {
        let previous = self.inner.state.swap(STATE_DISPOSED, Ordering::SeqCst);
        if previous == STATE_DISPOSED {
            return;
        }
        info!(cluster = %self.inner.cluster_id, "closing cluster");
        self.inner.events.notify(Event::ClusterClosing {
            cluster_id: self.inner.cluster_id,
        });
        self.inner.cancel.cancel();

        let drained: Vec<(EndPoint, Arc<ClusterableServer>)> =
            self.inner.servers.lock().unwrap().drain().collect();
        for (_, server) in &drained {
            self.inner.events.notify(Event::RemovingServer {
                server_id: server.server_id().clone(),
                reason: "cluster disposed".to_string(),
            });
            server.dispose();
            self.inner.events.notify(Event::RemovedServer {
                server_id: server.server_id().clone(),
                reason: "cluster disposed".to_string(),
            });
        }

        // Publishing the final empty view wakes in-flight selections so they
        // observe the disposed state instead of hanging.
        self.inner.publish(ClusterDescription::new(
            self.inner.cluster_id,
            self.inner.settings.connection_mode,
        ));

        self.inner.events.notify(Event::ClusterClosed {
            cluster_id: self.inner.cluster_id,
        });
    }
}

impl ClusterInner {
    fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            heartbeat_interval: self.settings.heartbeat_interval(),
            min_heartbeat_interval: self.settings.min_heartbeat_interval(),
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        mut policy: Box<dyn MembershipPolicy>,
        mut changes: mpsc::UnboundedReceiver<ServerDescriptionChanged>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                change = changes.recv() => {
                    let Some(change) = change else { break };
                    self.process_change(policy.as_mut(), change);
                }
            }
        }
    }

    fn process_change(&self, policy: &mut dyn MembershipPolicy, change: ServerDescriptionChanged) {
        if self.state.load(Ordering::SeqCst) == STATE_DISPOSED {
            return;
        }
        // A report from a server removed since it was queued is stale.
        let tracked: Vec<EndPoint> = {
            let servers = self.servers.lock().unwrap();
            if !servers.contains_key(&change.new.endpoint) {
                return;
            }
            servers.keys().cloned().collect()
        };

        let current = self.description.borrow().clone();
        let outcome = policy.apply(&current, &tracked, &change);

        let mut view = match outcome.disposition {
            ReporterDisposition::Record => current.with_server_description(change.new.clone()),
            ReporterDisposition::Ignore => current,
            ReporterDisposition::Hide => current.without_server(&change.new.endpoint),
        };
        for endpoint in outcome.add {
            self.add_server(&mut view, endpoint);
        }
        for (endpoint, reason) in outcome.remove {
            self.remove_server(&mut view, &endpoint, &reason);
        }
        self.publish(view);

        for endpoint in outcome.invalidate {
            let resolved = self.servers.lock().unwrap().get(&endpoint).cloned();
            if let Some(server) = resolved {
                server.invalidate();
            }
        }
    }

    fn add_server(&self, view: &mut ClusterDescription, endpoint: EndPoint) {
        debug!(cluster = %self.cluster_id, %endpoint, "adding server");
        self.events.notify(Event::AddingServer {
            cluster_id: self.cluster_id,
            endpoint: endpoint.clone(),
        });

        let server_id = ServerId::new(self.cluster_id, endpoint.clone());
        let changes_tx = self.changes_tx.clone();
        let on_change: ChangeCallback = Box::new(move |change| {
            let _ = changes_tx.send(change);
        });
        let server = Arc::new(ClusterableServer::new(
            server_id.clone(),
            endpoint.clone(),
            self.monitor_settings(),
            Arc::clone(&self.connection_factory),
            self.pool_factory.as_ref(),
            Arc::clone(&self.events),
            on_change,
        ));
        if let Err(error) = server.initialize() {
            warn!(cluster = %self.cluster_id, %endpoint, %error, "failed to start server");
            return;
        }

        *view = view.with_server_description(server.description());
        self.servers.lock().unwrap().insert(endpoint, server);
        self.events.notify(Event::AddedServer { server_id });
    }

    fn remove_server(&self, view: &mut ClusterDescription, endpoint: &EndPoint, reason: &str) {
        let removed = self.servers.lock().unwrap().remove(endpoint);
        let Some(server) = removed else { return };
        debug!(cluster = %self.cluster_id, %endpoint, reason, "removing server");
        self.events.notify(Event::RemovingServer {
            server_id: server.server_id().clone(),
            reason: reason.to_string(),
        });
        server.dispose();
        *view = view.without_server(endpoint);
        self.events.notify(Event::RemovedServer {
            server_id: server.server_id().clone(),
            reason: reason.to_string(),
        });
    }

    fn publish(&self, new: ClusterDescription) {
        if *self.description.borrow() == new {
            return;
        }
        let old = self.description.send_replace(new.clone());
        self.events
            .notify(Event::ClusterDescriptionChanged { old, new });
    }
}
