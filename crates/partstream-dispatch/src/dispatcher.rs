//! Per-session actors.
//!
//! [`Dispatcher::open`] spawns one task per session. The connection's read
//! loop pushes raw chunks through a bounded channel, so a slow transport
//! slows the reader down instead of growing memory. The task reassembles
//! each chunk and awaits the transport for every envelope before taking the
//! next chunk. Dropping the sender (EOF) ends the session; if no closing
//! delimiter was seen, the remaining state is flushed with a final `Finish`.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use partstream_core::{
    Application, ApplicationError, Boundary, Condition, EnvelopeSink, Handled, OutputEnvelope,
    ReassemblyConfig, SessionId, SinkError, Store,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::{Transport, TransportError};

/// Default capacity of a session's chunk channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration for a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    channel_capacity: usize,
    reassembly: ReassemblyConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            reassembly: ReassemblyConfig::default(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of chunks that may queue per session.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Set the reassembly limits.
    #[must_use]
    pub fn reassembly(mut self, config: ReassemblyConfig) -> Self {
        self.reassembly = config;
        self
    }

    #[must_use]
    pub fn get_channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    #[must_use]
    pub fn get_reassembly(&self) -> &ReassemblyConfig {
        &self.reassembly
    }
}

/// Errors from the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A session with this id is already running.
    SessionExists(SessionId),
    /// The session task is gone; the chunk was not accepted.
    ChannelClosed(SessionId),
    /// Reassembly aborted the session.
    Reassembly(ApplicationError),
    /// The transport refused an envelope.
    Transport(TransportError),
    /// The session task panicked or was cancelled.
    Join(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionExists(session) => write!(f, "session {session} is already open"),
            Self::ChannelClosed(session) => write!(f, "session {session} is no longer running"),
            Self::Reassembly(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Join(detail) => write!(f, "session task failed: {detail}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reassembly(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ApplicationError> for DispatchError {
    fn from(err: ApplicationError) -> Self {
        Self::Reassembly(err)
    }
}

impl From<TransportError> for DispatchError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session: SessionId,
    /// Chunks received from the read loop.
    pub chunks: usize,
    /// Envelopes delivered to the transport.
    pub delivered: usize,
    /// Whether the closing delimiter was seen.
    pub terminated: bool,
    /// Whether the session was flushed because the connection closed first.
    pub flushed_on_close: bool,
    /// Conditions reported while reassembling.
    pub conditions: Vec<Condition>,
}

impl SessionReport {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            chunks: 0,
            delivered: 0,
            terminated: false,
            flushed_on_close: false,
            conditions: Vec::new(),
        }
    }
}

/// Envelopes produced by one `handle*` call, waiting to be delivered.
#[derive(Debug, Default)]
struct Outbox {
    queue: Mutex<Vec<OutputEnvelope>>,
}

impl Outbox {
    fn drain(&self) -> Vec<OutputEnvelope> {
        std::mem::take(&mut *self.queue.lock())
    }
}

impl EnvelopeSink for Outbox {
    fn forward(&self, envelope: OutputEnvelope) -> Result<(), SinkError> {
        self.queue.lock().push(envelope);
        Ok(())
    }
}

/// Removes the session from the registry when the task ends, however it
/// ends. Unless the task completed, the session's ledger state is aborted
/// too.
struct Registered {
    session: SessionId,
    registry: Arc<Mutex<HashSet<SessionId>>>,
    store: Arc<Store>,
    completed: bool,
}

impl Drop for Registered {
    fn drop(&mut self) {
        if !self.completed {
            self.store.abort(self.session);
        }
        self.registry.lock().remove(&self.session);
    }
}

/// Spawns and tracks session tasks.
pub struct Dispatcher<T> {
    store: Arc<Store>,
    transport: Arc<T>,
    config: DispatchConfig,
    registry: Arc<Mutex<HashSet<SessionId>>>,
}

impl<T: Transport> Dispatcher<T> {
    /// Create a dispatcher delivering to `transport`.
    pub fn new(transport: T, config: DispatchConfig) -> Self {
        Self {
            store: Arc::new(Store::new(config.reassembly.clone())),
            transport: Arc::new(transport),
            config,
            registry: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The shared ledger.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The transport envelopes are delivered to.
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Number of running session tasks.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.registry.lock().len()
    }

    /// Start a session task.
    ///
    /// An id whose earlier upload finished starts a new upload.
    /// Must be called from within a tokio runtime.
    pub fn open(&self, session: SessionId, boundary: Boundary) -> Result<SessionHandle, DispatchError> {
        if !self.registry.lock().insert(session) {
            return Err(DispatchError::SessionExists(session));
        }
        if self.store.release(session) {
            tracing::debug!(session = %session, "reusing a finished session id");
        }
        let mut guard = Registered {
            session,
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            completed: false,
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let actor = SessionActor {
            session,
            boundary,
            app: Application::new(Arc::clone(&self.store), Outbox::default()),
            transport: Arc::clone(&self.transport),
            report: SessionReport::new(session),
        };
        tracing::info!(session = %session, "session opened");
        let task = tokio::spawn(async move {
            let result = actor.run(rx).await;
            guard.completed = result.is_ok();
            result
        });

        Ok(SessionHandle { session, tx, task })
    }
}

impl<T> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("active_sessions", &self.registry.lock().len())
            .finish_non_exhaustive()
    }
}

/// The read loop's end of a session.
#[derive(Debug)]
pub struct SessionHandle {
    session: SessionId,
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<Result<SessionReport, DispatchError>>,
}

impl SessionHandle {
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queue one raw chunk, waiting while the channel is full.
    pub async fn send_chunk(&self, chunk: Vec<u8>) -> Result<(), DispatchError> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| DispatchError::ChannelClosed(self.session))
    }

    /// Signal EOF and wait for the session to drain.
    pub async fn finish(self) -> Result<SessionReport, DispatchError> {
        let Self { session, tx, task } = self;
        drop(tx);
        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(session = %session, error = %e, "session task failed");
                Err(DispatchError::Join(e.to_string()))
            }
        }
    }
}

struct SessionActor<T> {
    session: SessionId,
    boundary: Boundary,
    app: Application<Outbox>,
    transport: Arc<T>,
    report: SessionReport,
}

impl<T: Transport> SessionActor<T> {
    async fn run(mut self, mut rx: mpsc::Receiver<Vec<u8>>) -> Result<SessionReport, DispatchError> {
        while let Some(chunk) = rx.recv().await {
            self.report.chunks += 1;
            let handled = self.app.handle_chunk(self.session, &chunk, &self.boundary);
            self.report.terminated |= self.record(handled).await?;
        }

        if !self.report.terminated {
            tracing::info!(session = %self.session, "connection closed before the closing delimiter");
            let handled = self.app.close(self.session, &self.boundary);
            self.report.flushed_on_close = self.record(handled).await?;
        }
        tracing::info!(
            session = %self.session,
            chunks = self.report.chunks,
            delivered = self.report.delivered,
            "session closed"
        );
        Ok(self.report)
    }

    /// Deliver what the last call produced, then surface its error if any.
    /// Returns whether the session finished.
    async fn record(
        &mut self,
        handled: Result<Handled, ApplicationError>,
    ) -> Result<bool, DispatchError> {
        for envelope in self.app.sink().drain() {
            if let Err(e) = self.transport.deliver(envelope).await {
                tracing::warn!(session = %self.session, error = %e, "delivery failed");
                return Err(e.into());
            }
            self.report.delivered += 1;
        }

        let handled = handled?;
        self.report.conditions.extend(handled.conditions().cloned());
        Ok(handled.finished)
    }
}
