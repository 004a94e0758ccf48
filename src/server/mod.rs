/// Clusterable servers
///
/// A `ClusterableServer` pairs the background monitor for one endpoint with
/// that endpoint's connection pool and gates both behind a small lifecycle
/// state machine. The cluster owns one of these per tracked endpoint.
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{AtalayaError, Result};
use crate::events::{Event, EventSubscriber};
use crate::monitor::{ChangeCallback, MonitorConnectionFactory, MonitorSettings, ServerMonitor};
use crate::topology::{EndPoint, ServerDescription, ServerId};

/// Opaque handle to one pooled operational connection.
pub trait ServerChannel: Send {
    fn server_id(&self) -> &ServerId;
}

/// Pool of operational connections for one server.
///
/// `clear` is synchronous so it can run inline with description changes;
/// generation-style pools satisfy that by bumping a counter and letting
/// outstanding channels lazily notice they are stale.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn initialize(&self);
    fn clear(&self);
    fn dispose(&self);
    async fn acquire(&self) -> Result<Box<dyn ServerChannel>>;
}

/// Creates one pool per clusterable server.
pub trait ConnectionPoolFactory: Send + Sync {
    fn create(&self, server_id: &ServerId, endpoint: &EndPoint) -> Arc<dyn ConnectionPool>;
}

const STATE_CREATED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_DISPOSED: u8 = 2;

/// One monitored server with its connection pool.
pub struct ClusterableServer {
    server_id: ServerId,
    endpoint: EndPoint,
    monitor: ServerMonitor,
    pool: Arc<dyn ConnectionPool>,
    events: Arc<dyn EventSubscriber>,
    state: AtomicU8,
}

impl ClusterableServer {
    /// Wires the monitor's change stream through pool invalidation before
    /// forwarding each change to `on_change`.
    pub fn new(
        server_id: ServerId,
        endpoint: EndPoint,
        monitor_settings: MonitorSettings,
        connection_factory: Arc<dyn MonitorConnectionFactory>,
        pool_factory: &dyn ConnectionPoolFactory,
        events: Arc<dyn EventSubscriber>,
        on_change: ChangeCallback,
    ) -> Self {
        let pool = pool_factory.create(&server_id, &endpoint);

        // A change that carries a heartbeat error invalidates pooled
        // connections before anyone upstream reacts to it.
        let pool_for_monitor = Arc::clone(&pool);
        let monitor_on_change: ChangeCallback = Box::new(move |change| {
            if change.new.heartbeat_error.is_some() {
                pool_for_monitor.clear();
            }
            on_change(change);
        });

        let monitor = ServerMonitor::new(
            server_id.clone(),
            endpoint.clone(),
            connection_factory,
            monitor_settings,
            events.clone(),
            monitor_on_change,
        );

        Self {
            server_id,
            endpoint,
            monitor,
            pool,
            events,
            state: AtomicU8::new(STATE_CREATED),
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    /// Latest monitored snapshot for this server.
    pub fn description(&self) -> Arc<ServerDescription> {
        self.monitor.description()
    }

    /// Start the pool and the monitor. A second call is a no-op; a call after
    /// `dispose` fails.
    pub fn initialize(&self) -> Result<()> {
        match self.state.compare_exchange(
            STATE_CREATED,
            STATE_OPEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                debug!(server = %self.server_id, "opening server");
                self.events.notify(Event::ServerOpening {
                    server_id: self.server_id.clone(),
                });
                self.pool.initialize();
                self.monitor.initialize();
                self.events.notify(Event::ServerOpened {
                    server_id: self.server_id.clone(),
                });
                Ok(())
            }
            Err(STATE_OPEN) => Ok(()),
            Err(_) => Err(AtalayaError::disposed("server")),
        }
    }

    /// Acquire an operational channel from the pool.
    pub async fn channel(&self) -> Result<Box<dyn ServerChannel>> {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => self.pool.acquire().await,
            STATE_CREATED => Err(AtalayaError::invalid_state(
                "server must be initialized before acquiring a channel",
            )),
            _ => Err(AtalayaError::disposed("server")),
        }
    }

    /// Throw away pooled connections and force the monitor to re-certify the
    /// server from scratch.
    pub fn invalidate(&self) {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return;
        }
        self.pool.clear();
        self.monitor.invalidate();
    }

    /// Ask for an out-of-cadence heartbeat.
    pub fn request_heartbeat(&self) {
        self.monitor.request_heartbeat();
    }

    /// Stop the monitor and tear down the pool. Idempotent.
    pub fn dispose(&self) {
        let previous = self.state.swap(STATE_DISPOSED, Ordering::SeqCst);
        if previous != STATE_DISPOSED {
            debug!(server = %self.server_id, "closing server");
            self.events.notify(Event::ServerClosing {
                server_id: self.server_id.clone(),
            });
            self.monitor.dispose();
            self.pool.dispose();
            self.events.notify(Event::ServerClosed {
                server_id: self.server_id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventCollector;
    use crate::monitor::{HelloReply, MonitorConnection, ServerDescriptionChanged};
    use crate::topology::ClusterId;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingPool {
        initialized: AtomicUsize,
        cleared: AtomicUsize,
        disposed: AtomicUsize,
    }

    impl RecordingPool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                initialized: AtomicUsize::new(0),
                cleared: AtomicUsize::new(0),
                disposed: AtomicUsize::new(0),
            })
        }
    }

    struct RecordingChannel(ServerId);

    impl ServerChannel for RecordingChannel {
        fn server_id(&self) -> &ServerId {
            &self.0
        }
    }

    #[async_trait]
    impl ConnectionPool for RecordingPool {
        fn initialize(&self) {
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }

        fn clear(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }

        async fn acquire(&self) -> Result<Box<dyn ServerChannel>> {
            Ok(Box::new(RecordingChannel(ServerId::new(
                ClusterId(1),
                EndPoint::new("localhost", 27017),
            ))))
        }
    }

    struct PoolHandle(Arc<RecordingPool>);

    impl ConnectionPoolFactory for PoolHandle {
        fn create(&self, _server_id: &ServerId, _endpoint: &EndPoint) -> Arc<dyn ConnectionPool> {
            self.0.clone()
        }
    }

    struct StaticFactory {
        outcome: std::result::Result<HelloReply, String>,
    }

    struct StaticConnection {
        outcome: std::result::Result<HelloReply, String>,
    }

    #[async_trait]
    impl MonitorConnection for StaticConnection {
        async fn hello(&mut self) -> Result<HelloReply> {
            self.outcome.clone().map_err(AtalayaError::heartbeat)
        }
    }

    #[async_trait]
    impl MonitorConnectionFactory for StaticFactory {
        async fn create(
            &self,
            _server_id: &ServerId,
            _endpoint: &EndPoint,
        ) -> Result<Box<dyn MonitorConnection>> {
            Ok(Box::new(StaticConnection {
                outcome: self.outcome.clone(),
            }))
        }
    }

    fn server_with(
        outcome: std::result::Result<HelloReply, String>,
        pool: Arc<RecordingPool>,
        events: Arc<EventCollector>,
        changes: Arc<Mutex<Vec<ServerDescriptionChanged>>>,
    ) -> ClusterableServer {
        let endpoint = EndPoint::new("localhost", 27017);
        let settings = MonitorSettings {
            heartbeat_interval: Duration::from_secs(60),
            min_heartbeat_interval: Duration::from_millis(1),
        };
        ClusterableServer::new(
            ServerId::new(ClusterId(1), endpoint.clone()),
            endpoint,
            settings,
            Arc::new(StaticFactory { outcome }),
            &PoolHandle(pool),
            events,
            Box::new(move |change| changes.lock().unwrap().push(change)),
        )
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let pool = RecordingPool::new();
        let events = Arc::new(EventCollector::new());
        let server = server_with(
            Ok(HelloReply::default()),
            pool.clone(),
            events.clone(),
            Arc::new(Mutex::new(Vec::new())),
        );

        server.initialize().unwrap();
        server.initialize().unwrap();

        assert_eq!(pool.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(events.count("ServerOpening"), 1);
        assert_eq!(events.count("ServerOpened"), 1);

        server.dispose();
    }

    #[tokio::test]
    async fn test_initialize_after_dispose_fails() {
        let server = server_with(
            Ok(HelloReply::default()),
            RecordingPool::new(),
            Arc::new(EventCollector::new()),
            Arc::new(Mutex::new(Vec::new())),
        );
        server.dispose();
        assert!(matches!(
            server.initialize(),
            Err(AtalayaError::Disposed { .. })
        ));
    }

    #[tokio::test]
    async fn test_channel_requires_open_state() {
        let server = server_with(
            Ok(HelloReply::default()),
            RecordingPool::new(),
            Arc::new(EventCollector::new()),
            Arc::new(Mutex::new(Vec::new())),
        );

        assert!(matches!(
            server.channel().await,
            Err(AtalayaError::InvalidState { .. })
        ));

        server.initialize().unwrap();
        assert!(server.channel().await.is_ok());

        server.dispose();
        assert!(matches!(
            server.channel().await,
            Err(AtalayaError::Disposed { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_failure_clears_pool_and_forwards_change() {
        let pool = RecordingPool::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let server = server_with(
            Err("connection refused".to_string()),
            pool.clone(),
            Arc::new(EventCollector::new()),
            changes.clone(),
        );
        server.initialize().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(pool.cleared.load(Ordering::SeqCst) >= 1);
        let forwarded = changes.lock().unwrap();
        assert!(!forwarded.is_empty());
        assert!(forwarded[0].new.heartbeat_error.is_some());

        drop(forwarded);
        server.dispose();
    }

    #[tokio::test]
    async fn test_invalidate_clears_pool() {
        let pool = RecordingPool::new();
        let server = server_with(
            Ok(HelloReply::default()),
            pool.clone(),
            Arc::new(EventCollector::new()),
            Arc::new(Mutex::new(Vec::new())),
        );
        server.initialize().unwrap();

        let before = pool.cleared.load(Ordering::SeqCst);
        server.invalidate();
        assert_eq!(pool.cleared.load(Ordering::SeqCst), before + 1);

        server.dispose();
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let pool = RecordingPool::new();
        let events = Arc::new(EventCollector::new());
        let server = server_with(
            Ok(HelloReply::default()),
            pool.clone(),
            events.clone(),
            Arc::new(Mutex::new(Vec::new())),
        );
        server.initialize().unwrap();

        server.dispose();
        server.dispose();

        assert_eq!(pool.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(events.count("ServerClosing"), 1);
        assert_eq!(events.count("ServerClosed"), 1);
    }
}
