//! The orchestrator.
//!
//! [`Application`] ties the scanner, the [`Store`] and an [`EnvelopeSink`]
//! together. For every piece it counts the arrival, registers it, drains
//! whatever the piece unblocked from the session's buffer and forwards the
//! resulting envelopes in emission order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::boundary::Boundary;
use crate::envelope::OutputEnvelope;
use crate::error::{ApplicationError, Condition, SinkError};
use crate::ledger::{Outcome, Registration, Store};
use crate::piece::{DataPiece, PartId, PieceUnit, SessionId};
use crate::scanner::ChunkScanner;

/// Receives envelopes in the order they must be delivered.
pub trait EnvelopeSink: Send + Sync {
    /// Deliver one envelope.
    fn forward(&self, envelope: OutputEnvelope) -> Result<(), SinkError>;
}

impl<S: EnvelopeSink + ?Sized> EnvelopeSink for Arc<S> {
    fn forward(&self, envelope: OutputEnvelope) -> Result<(), SinkError> {
        (**self).forward(envelope)
    }
}

impl<S: EnvelopeSink + ?Sized> EnvelopeSink for Box<S> {
    fn forward(&self, envelope: OutputEnvelope) -> Result<(), SinkError> {
        (**self).forward(envelope)
    }
}

/// Summary of one `handle*` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handled {
    /// One entry per registered piece, including drained buffered pieces.
    pub registrations: Vec<Registration>,
    /// Number of envelopes passed to the sink.
    pub forwarded: usize,
    /// Whether the session finished during this call.
    pub finished: bool,
}

impl Handled {
    /// Every condition reported during the call.
    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.registrations.iter().flat_map(|r| r.conditions.iter())
    }

    /// Returns true if the session's state was purged during the call.
    #[must_use]
    pub fn purged(&self) -> bool {
        self.registrations.iter().any(|r| r.purged)
    }
}

/// Drives reassembly for any number of sessions.
pub struct Application<S> {
    store: Arc<Store>,
    sink: S,
    parts: Mutex<HashMap<SessionId, PartId>>,
}

impl<S: EnvelopeSink> Application<S> {
    /// Create an application over a shared store.
    pub fn new(store: Arc<Store>, sink: S) -> Self {
        Self {
            store,
            sink,
            parts: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The sink envelopes are forwarded to.
    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Register one piece that was produced elsewhere.
    pub fn handle(&self, piece: DataPiece, boundary: &Boundary) -> Result<Handled, ApplicationError> {
        let session = piece.session();
        let mut handled = Handled::default();

        self.store.inc(session, boundary, 1);
        self.register(piece, boundary, &mut handled)?;
        self.drain(session, &mut handled)?;
        self.settle(session);
        Ok(handled)
    }

    /// Scan a raw chunk of `session` and register its pieces.
    ///
    /// Chunks of one session must be passed in arrival order; part numbers
    /// continue from the previous chunk.
    pub fn handle_chunk(
        &self,
        session: SessionId,
        chunk: &[u8],
        boundary: &Boundary,
    ) -> Result<Handled, ApplicationError> {
        let (first_part, pieces) = self.reserve(session, |first| {
            let pieces = ChunkScanner::new(boundary).scan(session, first, chunk);
            (pieces.len() as u64, pieces)
        });
        tracing::trace!(
            session = %session,
            first_part,
            pieces = pieces.len(),
            len = chunk.len(),
            "chunk scanned"
        );

        let mut handled = Handled::default();
        self.store.inc(session, boundary, pieces.len() as u64);
        for piece in pieces {
            self.register(piece, boundary, &mut handled)?;
            self.drain(session, &mut handled)?;
        }
        self.settle(session);
        Ok(handled)
    }

    /// The connection of `session` closed.
    ///
    /// Flushes whatever the session still holds with a final `Finish`. Does
    /// nothing if the session already finished or never started.
    pub fn close(&self, session: SessionId, boundary: &Boundary) -> Result<Handled, ApplicationError> {
        if !self.store.contains(session) {
            self.forget(session);
            return Ok(Handled::default());
        }
        let (part, ()) = self.reserve(session, |_| (1, ()));
        tracing::debug!(session = %session, part, "connection closed before the closing delimiter");
        self.handle(PieceUnit::unblock(session, part).into(), boundary)
    }

    /// Number of sessions with a live part counter.
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        self.parts.lock().len()
    }

    fn reserve<T>(&self, session: SessionId, f: impl FnOnce(PartId) -> (u64, T)) -> (PartId, T) {
        let mut parts = self.parts.lock();
        let next = parts.entry(session).or_insert(0);
        let first = *next;
        let (used, value) = f(first);
        *next += used;
        (first, value)
    }

    fn register(
        &self,
        piece: DataPiece,
        boundary: &Boundary,
        handled: &mut Handled,
    ) -> Result<(), ApplicationError> {
        let session = piece.session();
        match self.store.register(piece, boundary) {
            Ok(reg) => self.absorb(reg, handled),
            Err(err) => {
                tracing::warn!(session = %session, error = %err, "session aborted");
                self.forget(session);
                Err(err.into())
            }
        }
    }

    fn drain(&self, session: SessionId, handled: &mut Handled) -> Result<(), ApplicationError> {
        for reg in self.store.register_buffer(session)? {
            self.absorb(reg, handled)?;
        }
        Ok(())
    }

    fn absorb(&self, mut reg: Registration, handled: &mut Handled) -> Result<(), ApplicationError> {
        for condition in &reg.conditions {
            tracing::warn!(
                session = %reg.session,
                part = reg.part,
                condition = %condition,
                "reassembly condition"
            );
        }
        if reg.outcome == Outcome::SessionFinished {
            tracing::info!(session = %reg.session, part = reg.part, "session finished");
            handled.finished = true;
        }

        for envelope in std::mem::take(&mut reg.envelopes) {
            tracing::trace!(
                stream = %envelope.stream_key,
                pre = ?envelope.pre_action,
                post = ?envelope.post_action,
                len = envelope.body.len(),
                "forwarding envelope"
            );
            self.sink.forward(envelope)?;
            handled.forwarded += 1;
        }
        handled.registrations.push(reg);
        Ok(())
    }

    /// Drop the part counter of a session the store no longer holds.
    fn settle(&self, session: SessionId) {
        if !self.store.contains(session) {
            self.forget(session);
        }
    }

    fn forget(&self, session: SessionId) {
        self.parts.lock().remove(&session);
    }
}

impl<S> std::fmt::Debug for Application<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("store", &self.store)
            .field("tracked_sessions", &self.parts.lock().len())
            .finish_non_exhaustive()
    }
}
