//! Connection lifecycle.
//!
//! A [`ConnectionManager`] owns the one live session with the store. It walks
//! the state machine
//!
//! ```text
//! disconnected -> connecting -> connected -> ready
//!                     ^                        |
//!                     +------ reconnecting <---+
//! any state -> closed
//! ```
//!
//! and reports every transition on its [`Emitter`]. Other components read the
//! state through [`ConnectionManager::status`] or a [`watch::Receiver`] but
//! never change it.

use crate::{
    Error, Result,
    config::ReconnectPolicy,
    events::{Emitter, Event},
    store::{
        Connection, ConnectionErrorKind, Connector, StoreError, StoreResult, TopologyEvent,
        TopologyKind,
    },
};
use core::{
    fmt,
    future::Future,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio_util::sync::CancellationToken;

/// State of the store session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Runs once per session, after connecting and before the session is ready.
pub type PrepareHook =
    Arc<dyn Fn(Arc<dyn Connection>) -> BoxFuture<'static, StoreResult<()>> + Send + Sync>;

struct Session {
    generation: u64,
    conn: Arc<dyn Connection>,
    cancel: CancellationToken,
}

/// Terminates the connection when dropped, unless disarmed.
struct TerminateOnDrop(Option<Arc<dyn Connection>>);

impl TerminateOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        if let Some(conn) = self.0.take() {
            conn.terminate();
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    events: Emitter,
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Session>>,
    prepare: Mutex<Option<PrepareHook>>,
    cancel: CancellationToken,
    attempts: AtomicU32,
    generation: AtomicU64,
}

/// Owns the store session and its reconnection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                connect_timeout,
                events: Emitter::new(),
                state,
                session: RwLock::new(None),
                prepare: Mutex::new(None),
                cancel: CancellationToken::new(),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Installs the hook every new session must pass before it is ready.
    pub fn set_prepare(
        &self,
        hook: impl Fn(Arc<dyn Connection>) -> BoxFuture<'static, StoreResult<()>>
        + Send
        + Sync
        + 'static,
    ) {
        *self.inner.prepare.lock() = Some(Arc::new(hook));
    }

    /// Connection-level events. Cleared on [`disconnect`](Self::disconnect).
    pub fn events(&self) -> &Emitter {
        &self.inner.events
    }

    pub fn status(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn topology(&self) -> TopologyKind {
        self.inner.connector.kind()
    }

    /// Starts the session driver in the background.
    ///
    /// Progress is reported through [`events`](Self::events). Calling this
    /// while a session is being established or is ready does nothing. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the manager has been disconnected.
    pub fn connect(&self) -> Result<()> {
        let mut closed = false;
        let start = self.inner.state.send_if_modified(|state| match state {
            ConnectionState::Disconnected => {
                *state = ConnectionState::Connecting;
                true
            }
            ConnectionState::Closed => {
                closed = true;
                false
            }
            _ => false,
        });
        if closed {
            return Err(Error::Closed);
        }
        if start {
            self.inner.attempts.store(0, Ordering::SeqCst);
            tokio::spawn(Arc::clone(&self.inner).drive(None));
        }
        Ok(())
    }

    /// Runs `f` against the ready connection.
    ///
    /// A transport failure of a ready session starts reconnection exactly
    /// once, no matter how many calls observe it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] or [`Error::Closed`] when no session is
    /// ready, otherwise the classified error from `f`.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let (generation, conn) = {
            let session = self.inner.session.read();
            match session.as_ref() {
                Some(s) => (s.generation, Arc::clone(&s.conn)),
                None => {
                    return Err(match self.status() {
                        ConnectionState::Closed => Error::Closed,
                        state => Error::NotReady(state),
                    });
                }
            }
        };

        f(conn).await.map_err(|err| {
            if err.is_transport() {
                self.inner.connection_lost(generation, &err);
            }
            Error::from(err)
        })
    }

    /// Shuts the session down for good.
    ///
    /// Connection observers are detached first, then the session is closed
    /// gracefully and always force-terminated afterwards. Safe to call more
    /// than once, and on a manager that never connected.
    pub async fn disconnect(&self) {
        self.inner.events.clear();
        if self.inner.state.send_replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        self.inner.cancel.cancel();

        let session = self.inner.session.write().take();
        if let Some(session) = session {
            session.cancel.cancel();
            let _terminate = TerminateOnDrop(Some(Arc::clone(&session.conn)));
            let _quit = tokio::time::timeout(self.inner.connect_timeout, session.conn.quit()).await;
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Store connection closed");
    }

    /// Closes the session immediately, without the graceful quit.
    ///
    /// Background tasks are cancelled and the connection is terminated.
    /// Usable where awaiting is not possible, such as in `Drop`.
    pub fn abort(&self) {
        self.inner.events.clear();
        if self.inner.state.send_replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        self.inner.cancel.cancel();
        if let Some(session) = self.inner.session.write().take() {
            session.cancel.cancel();
            session.conn.terminate();
        }
    }
}

impl Inner {
    /// Moves to `to` unless closed. Returns `false` if the manager is closed.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut open = true;
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                open = false;
                return false;
            }
            let changed = *state != to;
            *state = to;
            changed
        });
        open
    }

    fn classify(&self, err: &StoreError) -> Error {
        match err.connection_kind() {
            Some(ConnectionErrorKind::Timeout) => Error::ConnectTimeout(self.connect_timeout),
            _ => Error::from(err.clone()),
        }
    }

    fn settle_disconnected(&self) {
        if self.transition(ConnectionState::Disconnected) {
            self.events.emit(Event::Disconnected);
        }
    }

    /// Consults the reconnect policy after `err`. Returns the delay before
    /// the next attempt, or `None` if the session gives up.
    fn schedule_reconnect(&self, err: &StoreError) -> Option<Duration> {
        if !self.policy.should_reconnect(err) {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %err, "Not reconnecting after a non-retryable error");
            self.settle_disconnected();
            return None;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.policy.delay_for(attempt) {
            Some(delay) => {
                if !self.transition(ConnectionState::Reconnecting) {
                    return None;
                }
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, ?delay, error = %err, "Scheduling reconnect");
                self.events.emit(Event::Reconnecting { attempt, delay });
                Some(delay)
            }
            None => {
                let attempts = attempt - 1;
                #[cfg(feature = "tracing")]
                tracing::error!(attempts, "Reconnection attempts exhausted");
                self.events
                    .emit(Event::ReconnectionAttemptsExhausted { attempts });
                self.settle_disconnected();
                None
            }
        }
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, err: &StoreError) {
        let session = {
            let mut slot = self.session.write();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };
        session.cancel.cancel();
        session.conn.terminate();

        #[cfg(feature = "tracing")]
        tracing::warn!(error = %err, "Store connection lost");

        if let Some(delay) = self.schedule_reconnect(err) {
            tokio::spawn(Arc::clone(self).drive(Some(delay)));
        }
    }

    /// Establishes a session, retrying per policy, until it is ready, the
    /// policy gives up, or the manager is closed.
    async fn drive(self: Arc<Self>, mut delay: Option<Duration>) {
        loop {
            if let Some(delay) = delay.take() {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if !self.transition(ConnectionState::Connecting) {
                return;
            }
            #[cfg(feature = "tracing")]
            tracing::info!(topology = ?self.connector.kind(), "Connecting to store");
            self.events.emit(Event::Connecting);

            let attempt = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.establish() => result,
            };
            match attempt {
                Ok(()) => return,
                Err(err) => {
                    self.events.emit(Event::Error(self.classify(&err)));
                    match self.schedule_reconnect(&err) {
                        Some(next) => delay = Some(next),
                        None => return,
                    }
                }
            }
        }
    }

    /// Connects and prepares a session. The connect timeout bounds both
    /// steps together.
    async fn establish(self: &Arc<Self>) -> StoreResult<()> {
        let opened = tokio::time::timeout(self.connect_timeout, self.open_prepared())
            .await
            .map_err(|_| {
                StoreError::connection(
                    ConnectionErrorKind::Timeout,
                    format!("connect timed out after {:?}", self.connect_timeout),
                )
            })??;
        let Some((conn, mut guard)) = opened else {
            return Ok(());
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.cancel.child_token();
        *self.session.write() = Some(Session {
            generation,
            conn: Arc::clone(&conn),
            cancel: cancel.clone(),
        });
        guard.disarm();

        if !self.transition(ConnectionState::Ready) {
            // Closed while preparing; whoever closed may have missed this session.
            let mut slot = self.session.write();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                slot.take();
                conn.terminate();
            }
            return Ok(());
        }
        self.attempts.store(0, Ordering::SeqCst);

        #[cfg(feature = "tracing")]
        tracing::info!(generation, "Store connection ready");
        self.events.emit(Event::Ready);

        self.forward_topology(&conn, cancel);
        Ok(())
    }

    /// Opens a connection and runs the prepare hook on it. Returns `None` if
    /// the manager closed in the meantime. The connection is terminated if
    /// the returned future is dropped before it completes.
    async fn open_prepared(&self) -> StoreResult<Option<(Arc<dyn Connection>, TerminateOnDrop)>> {
        let conn = self.connector.connect().await?;
        let guard = TerminateOnDrop(Some(Arc::clone(&conn)));

        if !self.transition(ConnectionState::Connected) {
            return Ok(None);
        }
        self.events.emit(Event::Connected);

        let prepare = self.prepare.lock().clone();
        if let Some(prepare) = prepare {
            prepare(Arc::clone(&conn)).await?;
        }
        Ok(Some((conn, guard)))
    }

    fn forward_topology(&self, conn: &Arc<dyn Connection>, cancel: CancellationToken) {
        let Some(mut rx) = conn.topology_events() else {
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(TopologyEvent::NodeAdded(node)) => events.emit(Event::NodeAdded { node }),
                    Ok(TopologyEvent::NodeRemoved(node)) => {
                        events.emit(Event::NodeRemoved { node })
                    }
                    Err(RecvError::Lagged(_skipped)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(skipped = _skipped, "Topology events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}
