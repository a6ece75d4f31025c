//! Observable client events.
//!
//! Observers register per [`EventKind`] on an [`Emitter`] and are called
//! synchronously, in registration order, every time an event of that kind is
//! emitted. Observers must not block.

use crate::{Error, store::NodeAddr};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Everything a client reports about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    ClientCreated,
    Waiting,
    Connecting,
    Connected,
    Ready,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectionAttemptsExhausted { attempts: u32 },
    Closing,
    Closed,
    ScriptInstalled { node: NodeAddr, sha: String },
    NodeAdded { node: NodeAddr },
    NodeRemoved { node: NodeAddr },
    Error(Error),
}

/// The kind of an [`Event`], used to register observers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ClientCreated,
    Waiting,
    Connecting,
    Connected,
    Ready,
    Disconnected,
    Reconnecting,
    ReconnectionAttemptsExhausted,
    Closing,
    Closed,
    ScriptInstalled,
    NodeAdded,
    NodeRemoved,
    Error,
}

impl EventKind {
    /// Connection lifecycle kinds, in the order a healthy session sees them.
    pub const LIFECYCLE: [Self; 9] = [
        Self::Connecting,
        Self::Connected,
        Self::Ready,
        Self::Disconnected,
        Self::Waiting,
        Self::Reconnecting,
        Self::ReconnectionAttemptsExhausted,
        Self::Closing,
        Self::Closed,
    ];
}

impl Event {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ClientCreated => EventKind::ClientCreated,
            Self::Waiting => EventKind::Waiting,
            Self::Connecting => EventKind::Connecting,
            Self::Connected => EventKind::Connected,
            Self::Ready => EventKind::Ready,
            Self::Disconnected => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::ReconnectionAttemptsExhausted { .. } => EventKind::ReconnectionAttemptsExhausted,
            Self::Closing => EventKind::Closing,
            Self::Closed => EventKind::Closed,
            Self::ScriptInstalled { .. } => EventKind::ScriptInstalled,
            Self::NodeAdded { .. } => EventKind::NodeAdded,
            Self::NodeRemoved { .. } => EventKind::NodeRemoved,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Handle returned by [`Emitter::on`], used to detach the observer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: ObserverId,
    kind: EventKind,
    observer: Observer,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: Vec<Registration>,
}

/// A registry of observers keyed by [`EventKind`].
#[derive(Clone, Default)]
pub struct Emitter {
    registry: Arc<Mutex<Registry>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `observer` for every event of `kind`.
    pub fn on(
        &self,
        kind: EventKind,
        observer: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ObserverId {
        let mut registry = self.registry.lock();
        let id = ObserverId(registry.next_id);
        registry.next_id += 1;
        registry.observers.push(Registration {
            id,
            kind,
            observer: Arc::new(observer),
        });
        id
    }

    /// Registers one shared observer for several kinds.
    pub fn on_many(
        &self,
        kinds: &[EventKind],
        observer: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Vec<ObserverId> {
        let observer: Observer = Arc::new(observer);
        kinds
            .iter()
            .map(|&kind| {
                let observer = Arc::clone(&observer);
                self.on(kind, move |event| observer(event))
            })
            .collect()
    }

    /// Resolves with the next event of `kind`.
    pub fn once(&self, kind: EventKind) -> oneshot::Receiver<Event> {
        self.once_with_id(kind).1
    }

    /// Like [`once`](Self::once), also returning the observer so it can be
    /// detached with [`off`](Self::off) before it fires.
    pub fn once_with_id(&self, kind: EventKind) -> (ObserverId, oneshot::Receiver<Event>) {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let registry = Arc::downgrade(&self.registry);
        let id = Arc::new(Mutex::new(None::<ObserverId>));
        let own_id = Arc::clone(&id);
        let registered = self.on(kind, move |event| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.clone());
            }
            if let (Some(registry), Some(id)) = (registry.upgrade(), *own_id.lock()) {
                registry.lock().observers.retain(|r| r.id != id);
            }
        });
        *id.lock() = Some(registered);
        (registered, rx)
    }

    /// Detaches one observer. Returns `false` if it was not registered.
    pub fn off(&self, id: ObserverId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.observers.len();
        registry.observers.retain(|r| r.id != id);
        registry.observers.len() != before
    }

    /// Detaches every observer.
    pub fn clear(&self) {
        self.registry.lock().observers.clear();
    }

    /// Number of observers registered for `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .observers
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Delivers `event` to its observers.
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let observers: Vec<Observer> = self
            .registry
            .lock()
            .observers
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| Arc::clone(&r.observer))
            .collect();
        for observer in observers {
            observer(&event);
        }
    }
}
