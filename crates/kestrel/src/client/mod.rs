#[cfg(test)]
mod tests;

use crate::{
    Config, ConnectionManager, ConnectionState, DecodedId, Error, IntoKestrelId, KestrelId,
    Result,
    coordinator::ShardCoordinator,
    debounce::Debouncer,
    events::{Emitter, Event, EventKind, ObserverId},
    script::{Allocation, MAX_BATCH, allocation_args, allocation_script},
    store::{Connector, NodeAddr, TopologyKind},
};
use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// A handle for issuing IDs from a shared store.
///
/// Cloning is cheap; clones share one session.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> kestrel::Result<()> {
/// use kestrel::{Config, Kestrel, MemoryStore, NodeAddr};
///
/// let store = MemoryStore::single(NodeAddr::new("127.0.0.1", 6379));
/// let config = Config::builder().shard_id(42).build_with(|_| None)?;
/// let kestrel = Kestrel::connect_with(config, store.connector()).await?;
///
/// let ids = kestrel.issue(3).await?;
/// assert_eq!(ids.len(), 3);
/// assert!(ids.iter().all(|id| id.shard_id() == 42));
///
/// kestrel.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Kestrel {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    manager: ConnectionManager,
    coordinator: ShardCoordinator,
    events: Emitter,
    error_observer: Mutex<Option<ObserverId>>,
    debouncer: Mutex<Option<Arc<Debouncer<NodeAddr>>>>,
    attached: AtomicBool,
    closed: AtomicBool,
}

/// Dropping the last handle without [`Kestrel::close`] aborts the session.
impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(debouncer) = self.debouncer.lock().take() {
            debouncer.cancel();
        }
        if !self.closed.load(Ordering::SeqCst) {
            self.manager.abort();
        }
    }
}

impl Kestrel {
    /// Builds a handle that has not connected yet.
    pub fn new(config: Config, connector: impl Connector) -> Self {
        let manager = ConnectionManager::new(
            Arc::new(connector),
            config.reconnect.clone(),
            config.connect_timeout,
        );
        let events = Emitter::new();
        let coordinator = ShardCoordinator::new(manager.topology(), config.shard_id, events.clone());

        let hook = coordinator.clone();
        manager.set_prepare(move |conn| {
            let coordinator = hook.clone();
            Box::pin(async move { coordinator.prepare(conn).await })
        });

        Self {
            inner: Arc::new(Inner {
                config,
                manager,
                coordinator,
                events,
                error_observer: Mutex::new(None),
                debouncer: Mutex::new(None),
                attached: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connects to Redis as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns the classified error if the first connection fails.
    #[cfg(feature = "redis")]
    pub async fn connect(config: Config) -> Result<Self> {
        let connector = crate::store::RedisConnector::new(&config)?;
        Self::connect_with(config, connector).await
    }

    /// Builds a handle for `connector` and initializes it.
    ///
    /// # Errors
    ///
    /// Returns the classified error if the first connection fails.
    pub async fn connect_with(config: Config, connector: impl Connector) -> Result<Self> {
        let kestrel = Self::new(config, connector);
        kestrel.initialize().await?;
        Ok(kestrel)
    }

    /// Opens the session and waits for the first connection to be ready.
    ///
    /// Lifecycle observers are attached before the first connect. While a
    /// connection started here is pending, its errors are reported only
    /// through the returned result, not on [`events`](Self::events). If it
    /// fails the handle is closed.
    ///
    /// A handle whose session gave up reconnecting is back in
    /// [`ConnectionState::Disconnected`] and can be initialized again.
    ///
    /// # Errors
    ///
    /// - [`Error::Authentication`], [`Error::HostUnresolved`],
    ///   [`Error::ConnectionRefused`] or [`Error::ConnectTimeout`] when the
    ///   store cannot be reached.
    /// - [`Error::Closed`] if the handle was closed.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(shard_id = self.inner.config.shard_id)))]
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        match inner.manager.status() {
            ConnectionState::Closed => return Err(Error::Closed),
            ConnectionState::Disconnected => {}
            _ => return Ok(()),
        }

        if !inner.attached.swap(true, Ordering::SeqCst) {
            self.attach_observers();
            inner.events.emit(Event::ClientCreated);
        }
        inner.events.emit(Event::Waiting);

        self.detach_error_observer();
        let conn_events = inner.manager.events();
        let (ready_id, ready) = conn_events.once_with_id(EventKind::Ready);
        let (failed_id, failed) = conn_events.once_with_id(EventKind::Error);
        let mut state = inner.manager.subscribe();

        let outcome = match inner.manager.connect() {
            Ok(()) => tokio::select! {
                _ = ready => Ok(()),
                event = failed => match event {
                    Ok(Event::Error(err)) => Err(err),
                    _ => Err(Error::Closed),
                },
                _ = state.wait_for(|s| *s == ConnectionState::Closed) => Err(Error::Closed),
            },
            Err(err) => Err(err),
        };
        conn_events.off(ready_id);
        conn_events.off(failed_id);
        self.attach_error_observer();

        match outcome {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::info!(topology = ?inner.manager.topology(), "Kestrel ready");
                Ok(())
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %err, "Initial connection failed");
                self.close().await;
                Err(err)
            }
        }
    }

    /// Issues `count` IDs, clamped to `[1, 4096]`, in ascending order.
    ///
    /// A batch that crosses the sequence ceiling is cut short, so fewer IDs
    /// than requested may come back. Callers that need an exact count must
    /// check the length and issue again.
    ///
    /// # Errors
    ///
    /// Failures are emitted as [`Event::Error`] and returned. In particular
    /// [`Error::AllocatorLocked`] means a wraparound just happened and the
    /// call can be retried shortly; it is never retried internally.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn issue(&self, count: usize) -> Result<Vec<KestrelId>> {
        let batch = count.clamp(1, usize::from(MAX_BATCH)) as u16;
        let keys = self.inner.coordinator.keys().to_vec();
        let args = allocation_args(batch);

        let result = self
            .inner
            .manager
            .call(move |conn| async move { conn.eval(allocation_script(), &keys, &args).await })
            .await
            .and_then(|reply| Ok(Allocation::try_from(reply)?));

        match result {
            Ok(allocation) => Ok(allocation.ids().collect()),
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "Allocation failed");
                self.inner.events.emit(Event::Error(err.clone()));
                Err(err)
            }
        }
    }

    /// Issues a single ID.
    ///
    /// # Errors
    ///
    /// As [`issue`](Self::issue). An allocation that came back empty because
    /// the counter was mid-wraparound is reported as
    /// [`Error::AllocatorLocked`].
    pub async fn issue_one(&self) -> Result<KestrelId> {
        self.issue(1)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::AllocatorLocked)
    }

    /// Shuts the handle down. Safe to call more than once, and on a handle
    /// that never initialized.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(debouncer) = inner.debouncer.lock().take() {
            debouncer.cancel();
        }

        inner.events.emit(Event::Closing);
        inner.manager.disconnect().await;
        inner.events.emit(Event::Closed);
        inner.events.clear();
    }

    pub fn status(&self) -> ConnectionState {
        self.inner.manager.status()
    }

    /// Watches connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.manager.subscribe()
    }

    /// Public event stream. Register observers before
    /// [`initialize`](Self::initialize) to see every lifecycle event.
    pub fn events(&self) -> &Emitter {
        &self.inner.events
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Decodes one ID. Needs no connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if `id` is not a valid ID.
    pub fn decode(id: impl IntoKestrelId) -> Result<DecodedId> {
        crate::decode(id)
    }

    /// Decodes several IDs. Needs no connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if any input is not a valid ID.
    pub fn decode_many<I>(ids: I) -> Result<Vec<DecodedId>>
    where
        I: IntoIterator,
        I::Item: IntoKestrelId,
    {
        crate::decode_many(ids)
    }

    fn attach_observers(&self) {
        let inner = &self.inner;
        let conn_events = inner.manager.events();

        let public = inner.events.clone();
        conn_events.on_many(&EventKind::LIFECYCLE, move |event| public.emit(event.clone()));
        self.attach_error_observer();

        let public = inner.events.clone();
        conn_events.on(EventKind::NodeRemoved, move |event| public.emit(event.clone()));

        let public = inner.events.clone();
        let debouncer = (inner.manager.topology() == TopologyKind::Cluster)
            .then(|| self.spawn_debouncer());
        conn_events.on(EventKind::NodeAdded, move |event| {
            if let (Event::NodeAdded { node }, Some(debouncer)) = (event, &debouncer) {
                debouncer.push(node.clone());
            }
            public.emit(event.clone());
        });
    }

    fn attach_error_observer(&self) {
        let mut slot = self.inner.error_observer.lock();
        if slot.is_none() {
            let public = self.inner.events.clone();
            *slot = Some(
                self.inner
                    .manager
                    .events()
                    .on(EventKind::Error, move |event| public.emit(event.clone())),
            );
        }
    }

    fn detach_error_observer(&self) {
        if let Some(id) = self.inner.error_observer.lock().take() {
            self.inner.manager.events().off(id);
        }
    }

    /// Installs the script on joining nodes, once per burst of joins.
    fn spawn_debouncer(&self) -> Arc<Debouncer<NodeAddr>> {
        let manager = self.inner.manager.clone();
        let coordinator = self.inner.coordinator.clone();
        let events = self.inner.events.clone();
        let debouncer = Arc::new(Debouncer::new(
            Debouncer::<NodeAddr>::DEFAULT_WINDOW,
            move |nodes: Vec<NodeAddr>| {
                let manager = manager.clone();
                let coordinator = coordinator.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let installed = manager
                        .call(move |conn| async move {
                            coordinator.install_on(conn.as_ref(), &nodes).await
                        })
                        .await;
                    if let Err(err) = installed {
                        events.emit(Event::Error(err));
                    }
                });
            },
        ));
        *self.inner.debouncer.lock() = Some(Arc::clone(&debouncer));
        debouncer
    }
}
