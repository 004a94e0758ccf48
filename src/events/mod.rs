/// Lifecycle and diagnostic events
///
/// The cluster, servers, and monitors report what they are doing through a
/// fixed event vocabulary delivered synchronously, in production order, to a
/// caller-supplied subscriber. Event ordering for a given operation is part of
/// the observable contract (selection always emits SelectingServer first and
/// exactly one of SelectedServer / SelectingServerFailed last).
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::topology::{ClusterDescription, ClusterId, EndPoint, ServerDescription, ServerId};

/// One lifecycle or diagnostic event.
#[derive(Debug, Clone)]
pub enum Event {
    ClusterOpening {
        cluster_id: ClusterId,
    },
    ClusterOpened {
        cluster_id: ClusterId,
    },
    ClusterClosing {
        cluster_id: ClusterId,
    },
    ClusterClosed {
        cluster_id: ClusterId,
    },
    AddingServer {
        cluster_id: ClusterId,
        endpoint: EndPoint,
    },
    AddedServer {
        server_id: ServerId,
    },
    RemovingServer {
        server_id: ServerId,
        reason: String,
    },
    RemovedServer {
        server_id: ServerId,
        reason: String,
    },
    ClusterDescriptionChanged {
        old: ClusterDescription,
        new: ClusterDescription,
    },
    ServerOpening {
        server_id: ServerId,
    },
    ServerOpened {
        server_id: ServerId,
    },
    ServerClosing {
        server_id: ServerId,
    },
    ServerClosed {
        server_id: ServerId,
    },
    ServerDescriptionChanged {
        old: Arc<ServerDescription>,
        new: Arc<ServerDescription>,
    },
    HeartbeatStarted {
        server_id: ServerId,
    },
    HeartbeatSucceeded {
        server_id: ServerId,
        duration: Duration,
    },
    HeartbeatFailed {
        server_id: ServerId,
        error: String,
    },
    SelectingServer {
        cluster_id: ClusterId,
    },
    SelectedServer {
        cluster_id: ClusterId,
        server_id: ServerId,
    },
    SelectingServerFailed {
        cluster_id: ClusterId,
        error: String,
    },
}

impl Event {
    /// Short name used for logging and test assertions.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ClusterOpening { .. } => "ClusterOpening",
            Event::ClusterOpened { .. } => "ClusterOpened",
            Event::ClusterClosing { .. } => "ClusterClosing",
            Event::ClusterClosed { .. } => "ClusterClosed",
            Event::AddingServer { .. } => "AddingServer",
            Event::AddedServer { .. } => "AddedServer",
            Event::RemovingServer { .. } => "RemovingServer",
            Event::RemovedServer { .. } => "RemovedServer",
            Event::ClusterDescriptionChanged { .. } => "ClusterDescriptionChanged",
            Event::ServerOpening { .. } => "ServerOpening",
            Event::ServerOpened { .. } => "ServerOpened",
            Event::ServerClosing { .. } => "ServerClosing",
            Event::ServerClosed { .. } => "ServerClosed",
            Event::ServerDescriptionChanged { .. } => "ServerDescriptionChanged",
            Event::HeartbeatStarted { .. } => "HeartbeatStarted",
            Event::HeartbeatSucceeded { .. } => "HeartbeatSucceeded",
            Event::HeartbeatFailed { .. } => "HeartbeatFailed",
            Event::SelectingServer { .. } => "SelectingServer",
            Event::SelectedServer { .. } => "SelectedServer",
            Event::SelectingServerFailed { .. } => "SelectingServerFailed",
        }
    }
}

/// Sink for the event vocabulary.
///
/// Called synchronously from monitor tasks and selection paths; implementations
/// must be cheap and must not block.
pub trait EventSubscriber: Send + Sync {
    fn notify(&self, event: Event);
}

/// Subscriber that drops every event.
#[derive(Debug, Default)]
pub struct NoopSubscriber;

impl EventSubscriber for NoopSubscriber {
    fn notify(&self, _event: Event) {}
}

/// Subscriber that records every event, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<Event>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Names of recorded events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(Event::name).collect()
    }

    /// Names of recorded events matching the predicate, in order.
    pub fn names_where<F: Fn(&Event) -> bool>(&self, predicate: F) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| predicate(e))
            .map(Event::name)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSubscriber for EventCollector {
    fn notify(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
