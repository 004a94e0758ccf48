/// Server monitoring
///
/// One `ServerMonitor` owns the background heartbeat loop for a single server:
/// it opens (or reuses) a dedicated monitoring connection, issues the
/// handshake/health-check command, and publishes the resulting
/// [`ServerDescription`] snapshots. A failed heartbeat is retried exactly once
/// immediately before the loop settles back to its normal cadence; that
/// failed → retried-and-failed → settle pattern is part of the observable
/// contract and must not be generalized.
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{Event, EventSubscriber};
use crate::topology::server::DescriptionChanges;
use crate::topology::{
    ElectionId, EndPoint, ReplicaSetConfig, ServerDescription, ServerId, ServerState, ServerType,
    TagSet, WireVersionRange,
};

/// Structured reply to the handshake/health-check command.
///
/// Wire-level encoding is out of scope; collaborators hand the monitor this
/// already-parsed form.
#[derive(Debug, Clone)]
pub struct HelloReply {
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    /// Set while a member is initializing and not yet certain of its set.
    pub is_replica_set_ghost: bool,
    /// Shard routers identify themselves through this field.
    pub message: Option<String>,
    pub set_name: Option<String>,
    pub hosts: Vec<EndPoint>,
    pub passives: Vec<EndPoint>,
    pub arbiters: Vec<EndPoint>,
    pub primary: Option<EndPoint>,
    /// The server's canonical identity for itself.
    pub me: Option<EndPoint>,
    pub election_id: Option<ElectionId>,
    pub set_version: Option<u32>,
    pub tags: TagSet,
    pub server_version: Option<String>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
}

impl Default for HelloReply {
    fn default() -> Self {
        Self {
            is_writable_primary: false,
            secondary: false,
            arbiter_only: false,
            hidden: false,
            is_replica_set_ghost: false,
            message: None,
            set_name: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            primary: None,
            me: None,
            election_id: None,
            set_version: None,
            tags: TagSet::new(),
            server_version: None,
            min_wire_version: 6,
            max_wire_version: 21,
        }
    }
}

impl HelloReply {
    /// Role implied by this reply.
    pub fn server_type(&self) -> ServerType {
        if self.message.as_deref() == Some("isdbgrid") {
            return ServerType::ShardRouter;
        }
        if self.is_replica_set_ghost {
            return ServerType::ReplicaSetGhost;
        }
        if self.set_name.is_some() {
            // Hidden members carry data but must never serve reads.
            if self.hidden {
                ServerType::ReplicaSetOther
            } else if self.is_writable_primary {
                ServerType::ReplicaSetPrimary
            } else if self.secondary {
                ServerType::ReplicaSetSecondary
            } else if self.arbiter_only {
                ServerType::ReplicaSetArbiter
            } else {
                ServerType::ReplicaSetOther
            }
        } else {
            ServerType::Standalone
        }
    }

    /// Membership view carried by this reply, when the member knows its set.
    pub fn replica_set_config(&self) -> Option<ReplicaSetConfig> {
        self.set_name.as_ref()?;
        let mut members = self.hosts.clone();
        members.extend(self.passives.iter().cloned());
        members.extend(self.arbiters.iter().cloned());
        Some(ReplicaSetConfig::new(
            members,
            self.set_name.clone(),
            self.primary.clone(),
            self.set_version,
        ))
    }

    pub fn wire_version_range(&self) -> WireVersionRange {
        WireVersionRange::new(self.min_wire_version, self.max_wire_version)
    }
}

/// One dedicated monitoring connection.
#[async_trait]
pub trait MonitorConnection: Send {
    /// Send the handshake command and wait for its structured reply.
    async fn hello(&mut self) -> Result<HelloReply>;
}

/// Creates monitoring connections; implementations own dialing and handshake
/// transport concerns.
#[async_trait]
pub trait MonitorConnectionFactory: Send + Sync {
    async fn create(
        &self,
        server_id: &ServerId,
        endpoint: &EndPoint,
    ) -> Result<Box<dyn MonitorConnection>>;
}

/// Timing knobs for one monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub heartbeat_interval: Duration,
    pub min_heartbeat_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            min_heartbeat_interval: Duration::from_millis(500),
        }
    }
}

/// An (old, new) description pair, delivered in production order.
#[derive(Debug, Clone)]
pub struct ServerDescriptionChanged {
    pub old: Arc<ServerDescription>,
    pub new: Arc<ServerDescription>,
}

/// Callback invoked synchronously for every published change.
pub type ChangeCallback = Box<dyn Fn(ServerDescriptionChanged) + Send + Sync>;

/// Exponentially weighted moving average of heartbeat round-trip times.
#[derive(Debug, Default)]
struct RoundTripTimeAverage {
    average: Option<Duration>,
}

impl RoundTripTimeAverage {
    const WEIGHT: f64 = 0.2;

    fn add_sample(&mut self, sample: Duration) {
        self.average = Some(match self.average {
            None => sample,
            Some(average) => {
                average.mul_f64(1.0 - Self::WEIGHT) + sample.mul_f64(Self::WEIGHT)
            }
        });
    }

    fn average(&self) -> Option<Duration> {
        self.average
    }

    fn reset(&mut self) {
        self.average = None;
    }
}

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Background heartbeat loop for one server.
pub struct ServerMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    server_id: ServerId,
    endpoint: EndPoint,
    settings: MonitorSettings,
    connection_factory: Arc<dyn MonitorConnectionFactory>,
    events: Arc<dyn EventSubscriber>,
    on_change: ChangeCallback,
    base: Arc<ServerDescription>,
    description: watch::Sender<Arc<ServerDescription>>,
    connection: Mutex<Option<Box<dyn MonitorConnection>>>,
    round_trip_time: std::sync::Mutex<RoundTripTimeAverage>,
    heartbeat_request: Notify,
    cancel: CancellationToken,
    state: AtomicU8,
}

impl ServerMonitor {
    pub fn new(
        server_id: ServerId,
        endpoint: EndPoint,
        connection_factory: Arc<dyn MonitorConnectionFactory>,
        settings: MonitorSettings,
        events: Arc<dyn EventSubscriber>,
        on_change: ChangeCallback,
    ) -> Self {
        let base = Arc::new(ServerDescription::new(server_id.clone(), endpoint.clone()));
        let (description, _) = watch::channel(base.clone());
        Self {
            inner: Arc::new(MonitorInner {
                server_id,
                endpoint,
                settings,
                connection_factory,
                events,
                on_change,
                base,
                description,
                connection: Mutex::new(None),
                round_trip_time: std::sync::Mutex::new(RoundTripTimeAverage::default()),
                heartbeat_request: Notify::new(),
                cancel: CancellationToken::new(),
                state: AtomicU8::new(STATE_CREATED),
            }),
        }
    }

    /// Start the heartbeat loop. Idempotent after the first call; a no-op once
    /// disposed. Must be called from within a tokio runtime.
    pub fn initialize(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            debug!(server = %self.inner.server_id, "starting server monitor");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run().await });
        }
    }

    /// Current snapshot: the default Disconnected/Unknown description before
    /// the first successful check and after `dispose`.
    pub fn description(&self) -> Arc<ServerDescription> {
        self.inner.description.borrow().clone()
    }

    /// Awaitable view of the published description, for tests and diagnostics.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ServerDescription>> {
        self.inner.description.subscribe()
    }

    /// Schedule an out-of-cadence heartbeat. Requests arriving sooner than the
    /// minimum heartbeat interval since the last check are coalesced. Ignored
    /// unless the monitor is running.
    pub fn request_heartbeat(&self) {
        if self.inner.state.load(Ordering::SeqCst) == STATE_RUNNING {
            self.inner.heartbeat_request.notify_one();
        }
    }

    /// Force the description back to Unknown/Disconnected immediately and
    /// schedule an out-of-cadence heartbeat to re-certify the server.
    pub fn invalidate(&self) {
        if self.inner.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return;
        }
        debug!(server = %self.inner.server_id, "invalidating server");
        self.inner.round_trip_time.lock().unwrap().reset();
        // Drop the cached connection if no check is in flight; an in-flight
        // check that fails will drop it itself.
        if let Ok(mut guard) = self.inner.connection.try_lock() {
            *guard = None;
        }
        self.inner.publish(self.inner.base.clone());
        self.inner.heartbeat_request.notify_one();
    }

    /// Stop the loop and reset the description. Idempotent; cancels any
    /// in-flight wait.
    pub fn dispose(&self) {
        let previous = self.inner.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if previous != STATE_CLOSED {
            debug!(server = %self.inner.server_id, "disposing server monitor");
            self.inner.cancel.cancel();
            if let Ok(mut guard) = self.inner.connection.try_lock() {
                *guard = None;
            }
            // Getter contract: base description after dispose. No change
            // notification is delivered for teardown.
            self.inner.description.send_replace(self.inner.base.clone());
        }
    }
}

impl MonitorInner {
    async fn run(self: Arc<Self>) {
        let mut last_attempt: Option<Instant> = None;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Coalesce requests below the minimum interval.
            if let Some(last) = last_attempt {
                let since = last.elapsed();
                if since < self.settings.min_heartbeat_interval {
                    let floor = self.settings.min_heartbeat_interval - since;
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(floor) => {}
                    }
                }
            }
            last_attempt = Some(Instant::now());

            let succeeded = self.check_once().await;
            if !succeeded && !self.cancel.is_cancelled() {
                // Exactly one immediate retry after a failure, then back to
                // the normal cadence.
                self.check_once().await;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.heartbeat_interval) => {}
                _ = self.heartbeat_request.notified() => {}
            }
        }
    }

    async fn check_once(&self) -> bool {
        self.events.notify(Event::HeartbeatStarted {
            server_id: self.server_id.clone(),
        });

        let started = Instant::now();
        match self.heartbeat().await {
            Ok(reply) => {
                let elapsed = started.elapsed();
                let average = {
                    let mut rtt = self.round_trip_time.lock().unwrap();
                    rtt.add_sample(elapsed);
                    rtt.average()
                };
                self.events.notify(Event::HeartbeatSucceeded {
                    server_id: self.server_id.clone(),
                    duration: elapsed,
                });

                let current = self.description.borrow().clone();
                let new = current.updated(DescriptionChanges {
                    state: Some(ServerState::Connected),
                    server_type: Some(reply.server_type()),
                    average_round_trip_time: Some(average),
                    canonical_endpoint: Some(reply.me.clone()),
                    election_id: Some(reply.election_id),
                    replica_set_config: Some(reply.replica_set_config()),
                    tags: Some(reply.tags.clone()),
                    version: Some(reply.server_version.clone()),
                    wire_version_range: Some(Some(reply.wire_version_range())),
                    heartbeat_error: Some(None),
                });
                self.publish(new);
                true
            }
            Err(error) => {
                warn!(server = %self.server_id, %error, "heartbeat failed");
                {
                    let mut guard = self.connection.lock().await;
                    *guard = None;
                }
                self.round_trip_time.lock().unwrap().reset();
                self.events.notify(Event::HeartbeatFailed {
                    server_id: self.server_id.clone(),
                    error: error.to_string(),
                });

                let new = self.base.updated(DescriptionChanges {
                    heartbeat_error: Some(Some(error.to_string())),
                    ..Default::default()
                });
                self.publish(new);
                false
            }
        }
    }

    async fn heartbeat(&self) -> Result<HelloReply> {
        let mut guard = self.connection.lock().await;
        let connection = match guard.as_mut() {
            Some(connection) => connection,
            None => {
                let connection = self
                    .connection_factory
                    .create(&self.server_id, &self.endpoint)
                    .await?;
                guard.insert(connection)
            }
        };
        connection.hello().await
    }

    fn publish(&self, new: Arc<ServerDescription>) {
        // A check in flight during dispose must not resurrect the description
        // after teardown already reset it to base.
        if self.state.load(Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        // Value-equality short-circuit: identical snapshots raise no change.
        if **self.description.borrow() == *new {
            return;
        }
        let old = self.description.send_replace(new.clone());
        self.events.notify(Event::ServerDescriptionChanged {
            old: old.clone(),
            new: new.clone(),
        });
        (self.on_change)(ServerDescriptionChanged { old, new });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventCollector;
    use crate::topology::ClusterId;
    use std::collections::VecDeque;

    /// Factory whose connections replay a scripted sequence of replies.
    struct ScriptedFactory {
        script: std::sync::Mutex<VecDeque<std::result::Result<HelloReply, String>>>,
        fallback: std::result::Result<HelloReply, String>,
    }

    impl ScriptedFactory {
        fn new(
            script: Vec<std::result::Result<HelloReply, String>>,
            fallback: std::result::Result<HelloReply, String>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                fallback,
            })
        }

        fn always(reply: HelloReply) -> Arc<Self> {
            Self::new(Vec::new(), Ok(reply))
        }

        fn always_failing() -> Arc<Self> {
            Self::new(Vec::new(), Err("connection refused".to_string()))
        }

        fn next(&self) -> Result<HelloReply> {
            let scripted = self.script.lock().unwrap().pop_front();
            let outcome = scripted.unwrap_or_else(|| self.fallback.clone());
            outcome.map_err(crate::error::AtalayaError::heartbeat)
        }
    }

    // All connections from one factory drain the same queue.
    struct SharedFactory(Arc<ScriptedFactory>);

    struct SharedConnection(Arc<ScriptedFactory>);

    #[async_trait]
    impl MonitorConnection for SharedConnection {
        async fn hello(&mut self) -> Result<HelloReply> {
            self.0.next()
        }
    }

    #[async_trait]
    impl MonitorConnectionFactory for SharedFactory {
        async fn create(
            &self,
            _server_id: &ServerId,
            _endpoint: &EndPoint,
        ) -> Result<Box<dyn MonitorConnection>> {
            Ok(Box::new(SharedConnection(Arc::clone(&self.0))))
        }
    }

    fn primary_reply(set_name: &str, hosts: Vec<EndPoint>) -> HelloReply {
        HelloReply {
            is_writable_primary: true,
            set_name: Some(set_name.to_string()),
            hosts,
            ..Default::default()
        }
    }

    fn monitor_with(
        factory: Arc<ScriptedFactory>,
        events: Arc<EventCollector>,
        settings: MonitorSettings,
    ) -> ServerMonitor {
        let endpoint = EndPoint::new("localhost", 27017);
        ServerMonitor::new(
            ServerId::new(ClusterId(1), endpoint.clone()),
            endpoint,
            Arc::new(SharedFactory(factory)),
            settings,
            events,
            Box::new(|_| {}),
        )
    }

    fn fast_settings() -> MonitorSettings {
        MonitorSettings {
            heartbeat_interval: Duration::from_secs(60),
            min_heartbeat_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_hello_reply_role_derivation() {
        assert_eq!(HelloReply::default().server_type(), ServerType::Standalone);

        let router = HelloReply {
            message: Some("isdbgrid".to_string()),
            ..Default::default()
        };
        assert_eq!(router.server_type(), ServerType::ShardRouter);

        let ghost = HelloReply {
            is_replica_set_ghost: true,
            ..Default::default()
        };
        assert_eq!(ghost.server_type(), ServerType::ReplicaSetGhost);
        assert!(ghost.replica_set_config().is_none());

        let primary = primary_reply("rs0", vec![EndPoint::new("a", 27017)]);
        assert_eq!(primary.server_type(), ServerType::ReplicaSetPrimary);
        let config = primary.replica_set_config().unwrap();
        assert_eq!(config.name.as_deref(), Some("rs0"));
        assert_eq!(config.members.len(), 1);

        let secondary = HelloReply {
            secondary: true,
            set_name: Some("rs0".to_string()),
            ..Default::default()
        };
        assert_eq!(secondary.server_type(), ServerType::ReplicaSetSecondary);

        let arbiter = HelloReply {
            arbiter_only: true,
            set_name: Some("rs0".to_string()),
            ..Default::default()
        };
        assert_eq!(arbiter.server_type(), ServerType::ReplicaSetArbiter);

        let hidden = HelloReply {
            secondary: true,
            hidden: true,
            set_name: Some("rs0".to_string()),
            ..Default::default()
        };
        assert_eq!(hidden.server_type(), ServerType::ReplicaSetOther);
    }

    #[test]
    fn test_round_trip_time_average() {
        let mut rtt = RoundTripTimeAverage::default();
        assert!(rtt.average().is_none());

        rtt.add_sample(Duration::from_millis(100));
        assert_eq!(rtt.average(), Some(Duration::from_millis(100)));

        // 100 * 0.8 + 200 * 0.2 = 120
        rtt.add_sample(Duration::from_millis(200));
        assert_eq!(rtt.average(), Some(Duration::from_millis(120)));

        rtt.reset();
        assert!(rtt.average().is_none());
    }

    #[tokio::test]
    async fn test_description_before_initialize_is_base() {
        let monitor = monitor_with(
            ScriptedFactory::always(HelloReply::default()),
            Arc::new(EventCollector::new()),
            fast_settings(),
        );
        let description = monitor.description();
        assert_eq!(description.state, ServerState::Disconnected);
        assert_eq!(description.server_type, ServerType::Unknown);
    }

    #[tokio::test]
    async fn test_successful_heartbeat_publishes_connected() {
        let monitor = monitor_with(
            ScriptedFactory::always(primary_reply(
                "rs0",
                vec![EndPoint::new("localhost", 27017)],
            )),
            Arc::new(EventCollector::new()),
            fast_settings(),
        );
        let mut updates = monitor.subscribe();
        monitor.initialize();

        updates.changed().await.unwrap();
        let description = updates.borrow().clone();
        assert_eq!(description.state, ServerState::Connected);
        assert_eq!(description.server_type, ServerType::ReplicaSetPrimary);
        assert!(description.average_round_trip_time.is_some());
        assert!(description.replica_set_config.is_some());

        monitor.dispose();
    }

    #[tokio::test]
    async fn test_failed_heartbeat_is_retried_exactly_once() {
        let events = Arc::new(EventCollector::new());
        let monitor = monitor_with(ScriptedFactory::always_failing(), events.clone(), fast_settings());
        monitor.initialize();

        tokio::time::sleep(Duration::from_millis(200)).await;

        // One scheduled attempt plus its single immediate retry, then the
        // loop waits out the (long) cadence.
        assert_eq!(events.count("HeartbeatFailed"), 2);
        assert_eq!(events.count("HeartbeatStarted"), 2);

        let description = monitor.description();
        assert_eq!(description.state, ServerState::Disconnected);
        assert!(description.heartbeat_error.is_some());

        monitor.dispose();
    }

    #[tokio::test]
    async fn test_request_heartbeat_forces_out_of_cadence_check() {
        let events = Arc::new(EventCollector::new());
        let monitor = monitor_with(
            ScriptedFactory::always(HelloReply::default()),
            events.clone(),
            fast_settings(),
        );
        monitor.initialize();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let initial = events.count("HeartbeatSucceeded");
        assert!(initial >= 1);

        monitor.request_heartbeat();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.count("HeartbeatSucceeded") > initial);

        monitor.dispose();
    }

    #[tokio::test]
    async fn test_invalidate_resets_description_and_forces_check() {
        let monitor = monitor_with(
            ScriptedFactory::always(primary_reply(
                "rs0",
                vec![EndPoint::new("localhost", 27017)],
            )),
            Arc::new(EventCollector::new()),
            fast_settings(),
        );
        let mut updates = monitor.subscribe();
        monitor.initialize();
        updates.changed().await.unwrap();
        assert_eq!(updates.borrow().state, ServerState::Connected);

        monitor.invalidate();
        let invalidated = monitor.description();
        assert_eq!(invalidated.server_type, ServerType::Unknown);
        assert_eq!(invalidated.state, ServerState::Disconnected);

        // Reachable server: the forced heartbeat settles back to Connected.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(monitor.description().state, ServerState::Connected);

        monitor.dispose();
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_resets_description() {
        let monitor = monitor_with(
            ScriptedFactory::always(HelloReply::default()),
            Arc::new(EventCollector::new()),
            fast_settings(),
        );
        let mut updates = monitor.subscribe();
        monitor.initialize();
        updates.changed().await.unwrap();

        monitor.dispose();
        monitor.dispose();

        let description = monitor.description();
        assert_eq!(description.state, ServerState::Disconnected);
        assert_eq!(description.server_type, ServerType::Unknown);
    }

    // Connection whose reply is held back until the test releases it.
    struct GatedFactory {
        gate: Arc<Notify>,
    }

    struct GatedConnection {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl MonitorConnection for GatedConnection {
        async fn hello(&mut self) -> Result<HelloReply> {
            self.gate.notified().await;
            Ok(primary_reply(
                "rs0",
                vec![EndPoint::new("localhost", 27017)],
            ))
        }
    }

    #[async_trait]
    impl MonitorConnectionFactory for GatedFactory {
        async fn create(
            &self,
            _server_id: &ServerId,
            _endpoint: &EndPoint,
        ) -> Result<Box<dyn MonitorConnection>> {
            Ok(Box::new(GatedConnection {
                gate: Arc::clone(&self.gate),
            }))
        }
    }

    #[tokio::test]
    async fn test_dispose_during_inflight_check_keeps_base_description() {
        let gate = Arc::new(Notify::new());
        let endpoint = EndPoint::new("localhost", 27017);
        let monitor = ServerMonitor::new(
            ServerId::new(ClusterId(1), endpoint.clone()),
            endpoint,
            Arc::new(GatedFactory { gate: gate.clone() }),
            fast_settings(),
            Arc::new(EventCollector::new()),
            Box::new(|_| {}),
        );
        monitor.initialize();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The check is blocked inside hello when the monitor goes away.
        monitor.dispose();
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let description = monitor.description();
        assert_eq!(description.state, ServerState::Disconnected);
        assert_eq!(description.server_type, ServerType::Unknown);
    }
}
